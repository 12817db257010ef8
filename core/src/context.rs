use crate::api::{
    Api, ChatOptions, ChatProcessParams, ChatStream, KnowledgeBaseFile, LoginParams, SessionInfo,
};
use crate::auth::{AuthSession, AuthState};
use crate::config::ClientConfig;
use crate::error::ApiError;
use crate::http::{AbortSignal, HttpClient};
use crate::knowledge::{Fetched, KnowledgeStore};
use crate::settings::SettingsStore;
use crate::storage::LocalStorage;
use crate::transport::Transport;
use anyhow::Result;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything the front end needs, created once at start-up and passed
/// explicitly to whoever handles a command.
#[derive(Clone)]
pub struct AppContext {
    config: ClientConfig,
    storage: LocalStorage,
    session: AuthSession,
    api: Api,
    settings: SettingsStore,
    knowledge: KnowledgeStore,
    backend: Arc<RwLock<Option<SessionInfo>>>,
}

impl AppContext {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let storage = LocalStorage::open(&config.data_dir)?;
        let session = AuthSession::load(storage.clone());
        let client = HttpClient::new(&config, session.clone())?;
        Ok(Self::assemble(config, storage, session, client))
    }

    pub fn with_transport(
        config: ClientConfig,
        storage: LocalStorage,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let session = AuthSession::load(storage.clone());
        let client = HttpClient::with_transport(config.base_url.clone(), session.clone(), transport);
        Self::assemble(config, storage, session, client)
    }

    fn assemble(
        config: ClientConfig,
        storage: LocalStorage,
        session: AuthSession,
        client: HttpClient,
    ) -> Self {
        let api = Api::new(client, config.chat_endpoint.clone());
        let settings = SettingsStore::load(storage.clone());
        let knowledge = KnowledgeStore::with_current(api.clone(), settings.settings().kb_name);
        Self {
            settings,
            knowledge,
            config,
            storage,
            session,
            api,
            backend: Arc::new(RwLock::new(None)),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn storage(&self) -> &LocalStorage {
        &self.storage
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    pub fn api(&self) -> &Api {
        &self.api
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn knowledge(&self) -> &KnowledgeStore {
        &self.knowledge
    }

    /// Validate any stored credentials. Returns whether the session is
    /// authenticated afterwards.
    pub async fn bootstrap(&self) -> bool {
        self.session.initialize_auth(&self.api).await
    }

    pub async fn login(&self, params: &LoginParams) -> Result<AuthState, ApiError> {
        let envelope = self.api.login(params).await?;
        let code = envelope.code_label();
        let tokens = envelope
            .ensure_ok()?
            .ok_or_else(|| ApiError::Application {
                code,
                message: "login response carried no tokens".to_string(),
            })?;
        self.session.establish(&tokens);
        info!(username = %params.username, "logged in");
        Ok(self.session.state())
    }

    pub fn logout(&self) {
        self.session.logout();
        info!("logged out");
    }

    /// Select the knowledge base used for chat and uploads, remember it in
    /// the settings, and list its files.
    pub async fn use_knowledge_base(&self, name: &str) -> Result<Fetched<Vec<KnowledgeBaseFile>>> {
        self.settings.set_kb_name(name)?;
        Ok(self.knowledge.set_current_knowledge_base(name).await)
    }

    /// Ask the backend which model it runs. The answer decides whether chat
    /// requests carry model parameters.
    pub async fn load_backend_session(&self) -> Result<SessionInfo, ApiError> {
        let info = self
            .api
            .fetch_session()
            .await?
            .ensure_ok()?
            .ok_or_else(|| ApiError::Application {
                code: "200".to_string(),
                message: "session response carried no data".to_string(),
            })?;
        *self.backend.write() = Some(info.clone());
        Ok(info)
    }

    /// Stream a knowledge-base chat reply using the current settings.
    pub async fn chat(
        &self,
        prompt: &str,
        options: ChatOptions,
        signal: Option<AbortSignal>,
    ) -> Result<ChatStream, ApiError> {
        let settings = self.settings.settings();
        let kb_name = self
            .knowledge
            .current_knowledge_base()
            .unwrap_or_else(|| settings.kb_name.clone());
        let send_model_params = match self.backend.read().as_ref() {
            Some(info) => info.is_chatgpt_api(),
            None => {
                warn!("backend session unknown, sending chat without model parameters");
                false
            }
        };
        let params = ChatProcessParams {
            prompt: prompt.to_owned(),
            options,
            kb_name,
            model_params: send_model_params.then(|| settings.model_params()),
            signal,
        };
        self.api.fetch_chat_process(params).await
    }
}
