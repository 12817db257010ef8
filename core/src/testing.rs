//! Scripted transport for exercising the client without a backend.

use crate::error::ApiError;
use crate::http::{ApiResponse, MultipartPart, RequestBody};
use crate::transport::{PreparedRequest, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
enum Outcome {
    Body(Vec<Bytes>),
    TransportError(String),
}

/// Canned reply for one request.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    status: StatusCode,
    outcome: Outcome,
    delay: Option<Duration>,
}

impl ScriptedResponse {
    pub fn status(status: u16) -> Self {
        Self::chunks(status, Vec::<Bytes>::new())
    }

    pub fn json(status: u16, body: Value) -> Self {
        Self::chunks(status, vec![Bytes::from(body.to_string())])
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self::chunks(status, vec![Bytes::copy_from_slice(body.as_bytes())])
    }

    /// Body delivered as separate network chunks.
    pub fn chunks<B: Into<Bytes>>(status: u16, chunks: Vec<B>) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            outcome: Outcome::Body(chunks.into_iter().map(Into::into).collect()),
            delay: None,
        }
    }

    pub fn transport_error(message: &str) -> Self {
        Self {
            status: StatusCode::OK,
            outcome: Outcome::TransportError(message.to_string()),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A request as the transport saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

impl RecordedRequest {
    pub fn authorization(&self) -> Option<String> {
        self.headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    }

    pub fn json_body(&self) -> Option<&Value> {
        match &self.body {
            RequestBody::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn query(&self, key: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.into_owned())
    }

    /// File names of multipart file parts sent under `field`, in order.
    pub fn multipart_files(&self, field: &str) -> Vec<String> {
        match &self.body {
            RequestBody::Multipart(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    MultipartPart::File {
                        name, file_name, ..
                    } if name == field => Some(file_name.clone()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn multipart_text(&self, field: &str) -> Option<String> {
        match &self.body {
            RequestBody::Multipart(parts) => parts.iter().find_map(|part| match part {
                MultipartPart::Text { name, value } if name == field => Some(value.clone()),
                _ => None,
            }),
            _ => None,
        }
    }
}

/// Routes requests by method and path to queued responses and records
/// everything it receives. Unscripted requests get a `404`.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<(Method, String), VecDeque<ScriptedResponse>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, method: Method, path: &str, response: ScriptedResponse) {
        self.routes
            .lock()
            .entry((method, normalize(path)))
            .or_default()
            .push_back(response);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn calls(&self, path: &str) -> usize {
        let path = normalize(path);
        self.requests
            .lock()
            .iter()
            .filter(|request| request.path == path)
            .count()
    }

    pub fn last_request(&self, path: &str) -> Option<RecordedRequest> {
        let path = normalize(path);
        self.requests
            .lock()
            .iter()
            .rev()
            .find(|request| request.path == path)
            .cloned()
    }
}

fn normalize(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: PreparedRequest) -> Result<ApiResponse, ApiError> {
        let key = (request.method.clone(), request.path.clone());
        self.requests.lock().push(RecordedRequest {
            method: request.method,
            path: request.path,
            url: request.url,
            headers: request.headers,
            body: request.body,
        });
        let scripted = self
            .routes
            .lock()
            .get_mut(&key)
            .and_then(|queue| queue.pop_front());

        let Some(scripted) = scripted else {
            return Ok(ApiResponse::from_bytes(
                StatusCode::NOT_FOUND,
                format!("no scripted response for {} {}", key.0, key.1),
            ));
        };
        if let Some(delay) = scripted.delay {
            tokio::time::sleep(delay).await;
        }
        match scripted.outcome {
            Outcome::TransportError(message) => Err(ApiError::Transport(message)),
            Outcome::Body(chunks) => {
                let stream = futures::stream::iter(chunks.into_iter().map(Ok)).boxed();
                Ok(ApiResponse::new(scripted.status, stream))
            }
        }
    }
}
