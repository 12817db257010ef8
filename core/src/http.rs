//! Request pipeline shared by every API binding.
//!
//! Outgoing requests get the bearer token attached; a `401` triggers one
//! token refresh followed by a single replay of the original request.
//! Concurrent `401`s share the same refresh.

use crate::auth::{AuthSession, TokenPair};
use crate::config::ClientConfig;
use crate::error::ApiError;
use crate::transport::{PreparedRequest, ReqwestTransport, Transport};
use bytes::{Bytes, BytesMut};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{BoxStream, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, debug_span, info, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub const REFRESH_TOKEN_PATH: &str = "/refresh_token";

pub type BodyStream = BoxStream<'static, Result<Bytes, ApiError>>;

#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Multipart(Vec<MultipartPart>),
}

#[derive(Debug, Clone)]
pub enum MultipartPart {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        file_name: String,
        content_type: Option<String>,
        bytes: Bytes,
    },
}

/// Describes one backend call. Cheap to clone so it can be replayed after a
/// token refresh.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
    pub headers: HeaderMap,
    signal: Option<AbortSignal>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
            headers: HeaderMap::new(),
            signal: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn multipart(mut self, parts: Vec<MultipartPart>) -> Self {
        self.body = RequestBody::Multipart(parts);
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn abort_signal(mut self, signal: Option<AbortSignal>) -> Self {
        self.signal = signal;
        self
    }
}

/// Cancels requests carrying one of its signals.
#[derive(Clone)]
pub struct AbortController {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn abort(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the controller aborts. Never resolves if the controller
    /// is dropped first.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|aborted| *aborted).await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

pub struct ApiResponse {
    status: StatusCode,
    body: BodyStream,
}

impl std::fmt::Debug for ApiResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: BodyStream) -> Self {
        Self { status, body }
    }

    pub fn from_bytes(status: StatusCode, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self::new(
            status,
            futures::stream::once(async move { Ok::<_, ApiError>(body) }).boxed(),
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub async fn bytes(mut self) -> Result<Bytes, ApiError> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }

    pub async fn text(self) -> Result<String, ApiError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn json<T: DeserializeOwned>(self) -> Result<T, ApiError> {
        let bytes = self.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn envelope<T: DeserializeOwned>(self) -> Result<Envelope<T>, ApiError> {
        self.json().await
    }

    /// Body as UTF-8 text chunks. Multi-byte characters split across network
    /// chunks are held back until complete.
    pub fn into_text_stream(self) -> impl Stream<Item = Result<String, ApiError>> + Send {
        let mut pending = Vec::new();
        self.body.map(move |chunk| {
            let chunk = chunk?;
            pending.extend_from_slice(&chunk);
            Ok(take_utf8_prefix(&mut pending))
        })
    }
}

fn take_utf8_prefix(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_owned();
            pending.clear();
            text
        }
        Err(err) if err.error_len().is_none() => {
            let valid = err.valid_up_to();
            let rest = pending.split_off(valid);
            let text = String::from_utf8_lossy(pending).into_owned();
            *pending = rest;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}

/// Response envelope used by the backend. Two conventions coexist:
/// `{code: 200, data}` and `{status: "Success", data, message}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, alias = "msg", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default = "none", skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

fn none<T>() -> Option<T> {
    None
}

impl<T> Envelope<T> {
    pub fn is_ok(&self) -> bool {
        self.code == Some(200) || self.status.as_deref() == Some("Success")
    }

    pub fn code_label(&self) -> String {
        self.code
            .map(|code| code.to_string())
            .or_else(|| self.status.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Turn an application-level failure into an error, keeping the payload
    /// of a successful envelope.
    pub fn ensure_ok(self) -> Result<Option<T>, ApiError> {
        if self.is_ok() {
            Ok(self.data)
        } else {
            Err(ApiError::Application {
                code: self.code_label(),
                message: self.message.unwrap_or_default(),
            })
        }
    }

    pub fn into_data(self) -> Result<T, ApiError>
    where
        T: Default,
    {
        Ok(self.ensure_ok()?.unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
struct RefreshFailure(String);

type RefreshFlight = Shared<BoxFuture<'static, Result<String, RefreshFailure>>>;

struct InFlightRefresh {
    id: Uuid,
    refresh_token: String,
    flight: RefreshFlight,
}

fn is_refresh_path(path: &str) -> bool {
    path.trim_start_matches('/') == REFRESH_TOKEN_PATH.trim_start_matches('/')
}

/// Request exchanging a refresh token for a new access token.
pub fn refresh_request(refresh_token: &str) -> ApiRequest {
    ApiRequest::post(REFRESH_TOKEN_PATH).json(json!({ "refresh_token": refresh_token }))
}

/// Configured request pipeline. Clones share default headers, the auth
/// session and the in-flight refresh.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    base_url: Url,
    default_headers: RwLock<HeaderMap>,
    session: AuthSession,
    transport: Arc<dyn Transport>,
    refresh: Mutex<Option<InFlightRefresh>>,
}

impl HttpClient {
    pub fn new(config: &ClientConfig, session: AuthSession) -> Result<Self, ApiError> {
        let transport = ReqwestTransport::new(config.timeout)?;
        Ok(Self::with_transport(
            config.base_url.clone(),
            session,
            Arc::new(transport),
        ))
    }

    pub fn with_transport(
        base_url: Url,
        session: AuthSession,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/plain, */*"),
        );
        Self {
            inner: Arc::new(ClientInner {
                base_url,
                default_headers: RwLock::new(default_headers),
                session,
                transport,
                refresh: Mutex::new(None),
            }),
        }
    }

    pub fn session(&self) -> &AuthSession {
        &self.inner.session
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    pub fn default_headers(&self) -> HeaderMap {
        self.inner.default_headers.read().clone()
    }

    /// Send a request through the pipeline, honouring its abort signal.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let signal = request.signal.clone();
        let exchange = self.exchange(request);
        match signal {
            Some(signal) => {
                if signal.is_aborted() {
                    return Err(ApiError::Aborted);
                }
                tokio::select! {
                    result = exchange => result,
                    _ = signal.aborted() => Err(ApiError::Aborted),
                }
            }
            None => exchange.await,
        }
    }

    async fn exchange(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let sent_token = self.inner.session.access_token();
        let response = self.dispatch(&request, &sent_token).await?;
        if response.status().is_success() {
            return Ok(response);
        }
        if response.status() != StatusCode::UNAUTHORIZED {
            return Err(status_error(response).await);
        }

        let original = status_error(response).await;
        if is_refresh_path(&request.path) {
            return Err(original);
        }
        let Some(token) = self.fresh_token(&sent_token).await else {
            return Err(original);
        };

        debug!(path = %request.path, "replaying request with refreshed token");
        let replay = self.dispatch(&request, &token).await?;
        if replay.status().is_success() {
            Ok(replay)
        } else {
            Err(status_error(replay).await)
        }
    }

    /// Token to replay with after a `401`, or `None` when the session could
    /// not be refreshed.
    async fn fresh_token(&self, sent_token: &str) -> Option<String> {
        let current = self.inner.session.access_token();
        if !current.is_empty() && current != sent_token {
            debug!("access token rotated while request was in flight");
            return Some(current);
        }
        self.refresh_access_token().await.ok()
    }

    /// Single-flight refresh: concurrent callers holding the same refresh
    /// token await one exchange. The exchange runs on its own task, so it
    /// completes and clears the slot even when every caller has gone away.
    async fn refresh_access_token(&self) -> Result<String, RefreshFailure> {
        let refresh_token = self.inner.session.refresh_token();
        let flight = {
            let mut slot = self.inner.refresh.lock();
            match slot.as_ref() {
                Some(current) if current.refresh_token == refresh_token => {
                    debug!("joining in-flight token refresh");
                    current.flight.clone()
                }
                _ => {
                    let id = Uuid::new_v4();
                    let client = self.clone();
                    let token = refresh_token.clone();
                    let task = tokio::spawn(async move {
                        let outcome = client.perform_refresh(&token).await;
                        let mut slot = client.inner.refresh.lock();
                        if slot.as_ref().is_some_and(|current| current.id == id) {
                            *slot = None;
                        }
                        outcome
                    });
                    let flight = async move {
                        task.await.unwrap_or_else(|err| {
                            Err(RefreshFailure(format!("refresh task failed: {err}")))
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some(InFlightRefresh {
                        id,
                        refresh_token,
                        flight: flight.clone(),
                    });
                    flight
                }
            }
        };
        flight.await
    }

    async fn perform_refresh(&self, refresh_token: &str) -> Result<String, RefreshFailure> {
        let session = &self.inner.session;
        let outcome = if refresh_token.is_empty() {
            Err(RefreshFailure("no refresh token held".to_string()))
        } else {
            info!("access token rejected, refreshing");
            self.request_refresh(refresh_token).await
        };

        // Credentials replaced while the exchange ran (a new login or a newer
        // refresh) win over this result.
        if session.refresh_token() != refresh_token {
            debug!("credentials changed during refresh, discarding its result");
            return outcome.map(|tokens| tokens.access_token);
        }

        match outcome {
            Ok(tokens) => {
                session.establish(&tokens);
                match bearer(&tokens.access_token) {
                    Ok(value) => {
                        self.inner.default_headers.write().insert(AUTHORIZATION, value);
                    }
                    Err(err) => warn!(%err, "refreshed token is not a valid header value"),
                }
                info!("access token refreshed");
                Ok(tokens.access_token)
            }
            Err(failure) => {
                warn!(reason = %failure.0, "token refresh failed, logging out");
                session.remove_access_token();
                self.inner.default_headers.write().remove(AUTHORIZATION);
                Err(failure)
            }
        }
    }

    /// The refresh call goes through the request interceptor but never back
    /// into the refresh logic, so a rejected refresh cannot loop.
    async fn request_refresh(&self, refresh_token: &str) -> Result<TokenPair, RefreshFailure> {
        let request = refresh_request(refresh_token);
        let response = self
            .dispatch(&request, &self.inner.session.access_token())
            .await
            .map_err(|err| RefreshFailure(err.to_string()))?;
        if !response.status().is_success() {
            return Err(RefreshFailure(format!(
                "refresh endpoint responded with {}",
                response.status()
            )));
        }
        let envelope: Envelope<TokenPair> = response
            .envelope()
            .await
            .map_err(|err| RefreshFailure(err.to_string()))?;
        let tokens = envelope
            .ensure_ok()
            .map_err(|err| RefreshFailure(err.to_string()))?
            .ok_or_else(|| RefreshFailure("refresh response carried no tokens".to_string()))?;
        if tokens.access_token.is_empty() {
            return Err(RefreshFailure("refresh response carried an empty token".to_string()));
        }
        bearer(&tokens.access_token).map_err(|err| RefreshFailure(err.to_string()))?;
        Ok(tokens)
    }

    async fn dispatch(&self, request: &ApiRequest, token: &str) -> Result<ApiResponse, ApiError> {
        let prepared = self.prepare(request, token)?;
        let span = debug_span!(
            "request",
            id = %prepared.request_id,
            method = %prepared.method,
            path = %prepared.path
        );
        async move {
            debug!("sending");
            let response = self.inner.transport.execute(prepared).await?;
            debug!(status = response.status().as_u16(), "received");
            Ok(response)
        }
        .instrument(span)
        .await
    }

    fn prepare(&self, request: &ApiRequest, token: &str) -> Result<PreparedRequest, ApiError> {
        let path = format!("/{}", request.path.trim_start_matches('/'));
        let mut url = self.inner.base_url.join(path.trim_start_matches('/'))?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter());
        }

        let mut headers = self.inner.default_headers.read().clone();
        for (name, value) in request.headers.iter() {
            headers.insert(name.clone(), value.clone());
        }
        attach_bearer(&mut headers, token)?;

        Ok(PreparedRequest {
            request_id: Uuid::new_v4(),
            method: request.method.clone(),
            path,
            url,
            headers,
            body: request.body.clone(),
        })
    }
}

/// Request interceptor: bearer credential when a token is held, no
/// authorization header otherwise.
fn attach_bearer(headers: &mut HeaderMap, token: &str) -> Result<(), ApiError> {
    if token.is_empty() {
        headers.remove(AUTHORIZATION);
    } else {
        headers.insert(AUTHORIZATION, bearer(token)?);
    }
    Ok(())
}

fn bearer(token: &str) -> Result<HeaderValue, ApiError> {
    let mut value = HeaderValue::from_str(&format!("Bearer {token}"))?;
    value.set_sensitive(true);
    Ok(value)
}

async fn status_error(response: ApiResponse) -> ApiError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED {
        ApiError::Unauthorized { body }
    } else {
        ApiError::Status { status, body }
    }
}
