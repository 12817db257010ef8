use crate::api::{
    Api, CreateKnowledgeBaseParams, DeleteDocsParams, KnowledgeBase, KnowledgeBaseFile,
    UploadParams,
};
use crate::error::ApiError;
use crate::http::Envelope;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info};

pub const DEFAULT_KNOWLEDGE_BASE: &str = "samples";

/// Outcome of a store action. Distinguishes an empty listing from a failed
/// request.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched<T> {
    Data(T),
    Empty,
    Failed(String),
}

impl<T> Fetched<T> {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }
}

impl<T> Fetched<Vec<T>> {
    fn from_items(items: Vec<T>) -> Self {
        if items.is_empty() {
            Self::Empty
        } else {
            Self::Data(items)
        }
    }
}

#[derive(Debug, Clone)]
pub struct KnowledgeState {
    pub current_knowledge_base: Option<String>,
    pub knowledge_bases: Vec<KnowledgeBase>,
    pub knowledge_base_files: Vec<KnowledgeBaseFile>,
    pub last_refreshed: Option<DateTime<Utc>>,
    pending: usize,
}

impl Default for KnowledgeState {
    fn default() -> Self {
        Self {
            current_knowledge_base: Some(DEFAULT_KNOWLEDGE_BASE.to_string()),
            knowledge_bases: Vec::new(),
            knowledge_base_files: Vec::new(),
            last_refreshed: None,
            pending: 0,
        }
    }
}

impl KnowledgeState {
    pub fn loading(&self) -> bool {
        self.pending > 0
    }
}

/// Cache of knowledge-base metadata. Listings are replaced wholesale on every
/// successful fetch and left untouched when a fetch fails.
#[derive(Clone)]
pub struct KnowledgeStore {
    api: Api,
    state: Arc<RwLock<KnowledgeState>>,
}

struct LoadingGuard {
    state: Arc<RwLock<KnowledgeState>>,
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        let mut state = self.state.write();
        state.pending = state.pending.saturating_sub(1);
    }
}

impl KnowledgeStore {
    pub fn new(api: Api) -> Self {
        Self {
            api,
            state: Arc::new(RwLock::new(KnowledgeState::default())),
        }
    }

    /// Start with `current` selected instead of the default base.
    pub fn with_current(api: Api, current: impl Into<String>) -> Self {
        let store = Self::new(api);
        store.state.write().current_knowledge_base = Some(current.into());
        store
    }

    pub fn state(&self) -> KnowledgeState {
        self.state.read().clone()
    }

    pub fn loading(&self) -> bool {
        self.state.read().loading()
    }

    pub fn current_knowledge_base(&self) -> Option<String> {
        self.state.read().current_knowledge_base.clone()
    }

    fn begin_loading(&self) -> LoadingGuard {
        self.state.write().pending += 1;
        LoadingGuard {
            state: self.state.clone(),
        }
    }

    pub async fn fetch_knowledge_bases(&self) -> Fetched<Vec<KnowledgeBase>> {
        let _loading = self.begin_loading();
        let result = self
            .api
            .fetch_list_knowledge_bases()
            .await
            .and_then(Envelope::into_data);
        match result {
            Ok(bases) => {
                let mut state = self.state.write();
                state.knowledge_bases = bases.clone();
                state.last_refreshed = Some(Utc::now());
                Fetched::from_items(bases)
            }
            Err(err) => {
                error!(%err, "failed to list knowledge bases");
                Fetched::Failed(err.to_string())
            }
        }
    }

    pub async fn fetch_knowledge_base_files(
        &self,
        knowledge_base_name: &str,
    ) -> Fetched<Vec<KnowledgeBaseFile>> {
        let _loading = self.begin_loading();
        let result = self
            .api
            .fetch_list_files(knowledge_base_name)
            .await
            .and_then(Envelope::into_data);
        match result {
            Ok(files) => {
                let mut state = self.state.write();
                state.knowledge_base_files = files.clone();
                state.last_refreshed = Some(Utc::now());
                Fetched::from_items(files)
            }
            Err(err) => {
                error!(%err, kb = knowledge_base_name, "failed to list knowledge base files");
                Fetched::Failed(err.to_string())
            }
        }
    }

    pub async fn set_current_knowledge_base(
        &self,
        knowledge_base_name: &str,
    ) -> Fetched<Vec<KnowledgeBaseFile>> {
        self.state.write().current_knowledge_base = Some(knowledge_base_name.to_owned());
        self.fetch_knowledge_base_files(knowledge_base_name).await
    }

    pub async fn refresh_current_knowledge_base_files(&self) -> Fetched<Vec<KnowledgeBaseFile>> {
        match self.current_knowledge_base() {
            Some(name) => self.fetch_knowledge_base_files(&name).await,
            None => Fetched::Empty,
        }
    }

    pub async fn refresh_knowledge_bases(&self) -> Fetched<Vec<KnowledgeBase>> {
        self.fetch_knowledge_bases().await
    }

    pub async fn create_knowledge_base(
        &self,
        params: &CreateKnowledgeBaseParams,
    ) -> Fetched<Vec<KnowledgeBase>> {
        if let Err(err) = accepted(self.api.create_knowledge_base(params).await) {
            error!(%err, kb = %params.knowledge_base_name, "failed to create knowledge base");
            return Fetched::Failed(err.to_string());
        }
        info!(kb = %params.knowledge_base_name, "knowledge base created");
        self.fetch_knowledge_bases().await
    }

    pub async fn delete_knowledge_base(
        &self,
        knowledge_base_name: &str,
    ) -> Fetched<Vec<KnowledgeBase>> {
        if let Err(err) = accepted(self.api.delete_knowledge_base(knowledge_base_name).await) {
            error!(%err, kb = knowledge_base_name, "failed to delete knowledge base");
            return Fetched::Failed(err.to_string());
        }
        {
            let mut state = self.state.write();
            if state.current_knowledge_base.as_deref() == Some(knowledge_base_name) {
                state.current_knowledge_base = None;
                state.knowledge_base_files.clear();
            }
        }
        info!(kb = knowledge_base_name, "knowledge base deleted");
        self.fetch_knowledge_bases().await
    }

    pub async fn upload_documents(&self, params: UploadParams) -> Fetched<Vec<KnowledgeBaseFile>> {
        let name = params.knowledge_base_name.clone();
        if let Err(err) = accepted(self.api.fetch_upload_file(params).await) {
            error!(%err, kb = %name, "failed to upload documents");
            return Fetched::Failed(err.to_string());
        }
        self.fetch_knowledge_base_files(&name).await
    }

    pub async fn delete_documents(
        &self,
        params: &DeleteDocsParams,
    ) -> Fetched<Vec<KnowledgeBaseFile>> {
        if let Err(err) = accepted(self.api.delete_docs(params).await) {
            error!(%err, kb = %params.knowledge_base_name, "failed to delete documents");
            return Fetched::Failed(err.to_string());
        }
        self.fetch_knowledge_base_files(&params.knowledge_base_name)
            .await
    }
}

fn accepted(result: Result<Envelope<Value>, ApiError>) -> Result<(), ApiError> {
    result?.ensure_ok().map(|_| ())
}
