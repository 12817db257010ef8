pub mod api;
pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod knowledge;
pub mod settings;
pub mod storage;
pub mod telemetry;
pub mod testing;
pub mod transport;

pub use api::Api;
pub use auth::{AuthSession, AuthState, TokenPair, TokenStore};
pub use config::{ChatEndpoint, ClientConfig, ConfigError};
pub use context::AppContext;
pub use error::ApiError;
pub use http::{AbortController, AbortSignal, ApiRequest, ApiResponse, Envelope, HttpClient};
pub use knowledge::{Fetched, KnowledgeStore};
pub use settings::{Settings, SettingsStore};
pub use storage::LocalStorage;
pub use transport::{ReqwestTransport, Transport};
