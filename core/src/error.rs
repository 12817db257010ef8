use reqwest::StatusCode;

/// Failures surfaced by the HTTP client and the API bindings.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("request aborted")]
    Aborted,
    #[error("unauthorized: {body}")]
    Unauthorized { body: String },
    #[error("server responded with {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("request rejected by server ({code}): {message}")]
    Application { code: String, message: String },
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Unauthorized { .. } => Some(StatusCode::UNAUTHORIZED),
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::Transport(_) => "Could not reach the server. Check the API URL.".to_string(),
            Self::Aborted => "Request cancelled.".to_string(),
            Self::Unauthorized { .. } => "Session expired. Log in again.".to_string(),
            Self::Application { message, .. } if !message.is_empty() => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
