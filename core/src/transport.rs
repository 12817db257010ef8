use crate::error::ApiError;
use crate::http::{ApiResponse, MultipartPart, RequestBody};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// A request after the client pipeline has resolved the URL and applied
/// default headers and credentials.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub request_id: Uuid,
    pub method: Method,
    /// Endpoint path with a leading slash, relative to the base URL.
    pub path: String,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

/// Sends prepared requests over the wire.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: PreparedRequest) -> Result<ApiResponse, ApiError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: PreparedRequest) -> Result<ApiResponse, ApiError> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Multipart(parts) => builder.multipart(build_form(parts)?),
        };

        let response = builder.send().await?;
        let status = response.status();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ApiError::from));
        Ok(ApiResponse::new(status, Box::pin(body)))
    }
}

fn build_form(parts: Vec<MultipartPart>) -> Result<Form, ApiError> {
    let mut form = Form::new();
    for part in parts {
        form = match part {
            MultipartPart::Text { name, value } => form.text(name, value),
            MultipartPart::File {
                name,
                file_name,
                content_type,
                bytes,
            } => {
                let mut file_part = Part::bytes(bytes.to_vec()).file_name(file_name);
                if let Some(content_type) = content_type {
                    file_part = file_part.mime_str(&content_type)?;
                }
                form.part(name, file_part)
            }
        };
    }
    Ok(form)
}
