//! One binding per backend endpoint. Bindings only build requests; every
//! failure is returned to the caller unchanged.

use crate::auth::TokenPair;
use crate::config::{ChatEndpoint, UploadDefaults};
use crate::error::ApiError;
use crate::http::{
    refresh_request, AbortSignal, ApiRequest, Envelope, HttpClient, MultipartPart,
};
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;

pub const USER_INFO_PATH: &str = "/user_info";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatOptions {
    #[serde(rename = "conversationId", default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(rename = "parentMessageId", default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelParams {
    pub system_message: String,
    pub temperature: f64,
    pub top_p: f64,
}

#[derive(Debug, Clone)]
pub struct ChatProcessParams {
    pub prompt: String,
    pub options: ChatOptions,
    pub kb_name: String,
    /// Only sent when the backend runs the `ChatGPTAPI` model.
    pub model_params: Option<ModelParams>,
    pub signal: Option<AbortSignal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub auth: bool,
    pub model: String,
}

impl SessionInfo {
    pub fn is_chatgpt_api(&self) -> bool {
        self.model == "ChatGPTAPI"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawKnowledgeBase")]
pub struct KnowledgeBase {
    pub id: i64,
    pub kb_name: String,
    pub kb_info: Option<String>,
    pub vector_store_type: Option<String>,
    pub embedding_model: Option<String>,
}

// Older backends list knowledge bases as bare names.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawKnowledgeBase {
    Name(String),
    Full {
        #[serde(default)]
        id: i64,
        kb_name: String,
        #[serde(default)]
        kb_info: Option<String>,
        #[serde(default)]
        vector_store_type: Option<String>,
        #[serde(default, alias = "embed_model")]
        embedding_model: Option<String>,
    },
}

impl From<RawKnowledgeBase> for KnowledgeBase {
    fn from(raw: RawKnowledgeBase) -> Self {
        match raw {
            RawKnowledgeBase::Name(kb_name) => Self {
                id: 0,
                kb_name,
                kb_info: None,
                vector_store_type: None,
                embedding_model: None,
            },
            RawKnowledgeBase::Full {
                id,
                kb_name,
                kb_info,
                vector_store_type,
                embedding_model,
            } => Self {
                id,
                kb_name,
                kb_info,
                vector_store_type,
                embedding_model,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBaseFile {
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kb_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_ext: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_loader: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_splitter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docs_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_folder: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_db: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A document to upload, held in memory so the request can be replayed.
#[derive(Debug, Clone, PartialEq)]
pub struct FileUpload {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

impl FileUpload {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        let file_name = file_name.into();
        let content_type = guess_content_type(&file_name).map(str::to_owned);
        Self {
            file_name,
            content_type,
            bytes: bytes.into(),
        }
    }

    pub async fn from_path(path: &Path) -> Result<Self, ApiError> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| ApiError::Validation(format!("{} has no file name", path.display())))?
            .to_owned();
        let bytes = tokio::fs::read(path).await?;
        Ok(Self::new(file_name, bytes))
    }
}

fn guess_content_type(file_name: &str) -> Option<&'static str> {
    let ext = Path::new(file_name)
        .extension()?
        .to_str()?
        .to_ascii_lowercase();
    let mime = match ext.as_str() {
        "txt" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => return None,
    };
    Some(mime)
}

/// Files for an upload: one file, a list, or a list with empty slots.
#[derive(Debug, Clone)]
pub enum UploadFiles {
    Single(FileUpload),
    List(Vec<FileUpload>),
    Sparse(Vec<Option<FileUpload>>),
}

impl UploadFiles {
    pub fn into_present(self) -> Vec<FileUpload> {
        match self {
            Self::Single(file) => vec![file],
            Self::List(files) => files,
            Self::Sparse(files) => files.into_iter().flatten().collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadParams {
    pub files: UploadFiles,
    pub knowledge_base_name: String,
    pub chunk_size: u32,
    pub chunk_overlap: u32,
    pub zh_title_enhance: bool,
}

impl UploadParams {
    pub fn new(
        knowledge_base_name: impl Into<String>,
        files: UploadFiles,
        defaults: &UploadDefaults,
    ) -> Self {
        Self {
            files,
            knowledge_base_name: knowledge_base_name.into(),
            chunk_size: defaults.chunk_size,
            chunk_overlap: defaults.chunk_overlap,
            zh_title_enhance: defaults.zh_title_enhance,
        }
    }

    fn into_parts(self) -> Vec<MultipartPart> {
        let mut parts: Vec<MultipartPart> = self
            .files
            .into_present()
            .into_iter()
            .map(|file| MultipartPart::File {
                name: "files".to_string(),
                file_name: file.file_name,
                content_type: file.content_type,
                bytes: file.bytes,
            })
            .collect();
        let text = |name: &str, value: String| MultipartPart::Text {
            name: name.to_string(),
            value,
        };
        parts.push(text("knowledge_base_name", self.knowledge_base_name));
        parts.push(text("chunk_size", self.chunk_size.to_string()));
        parts.push(text("chunk_overlap", self.chunk_overlap.to_string()));
        parts.push(text("zh_title_enhance", self.zh_title_enhance.to_string()));
        parts
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateKnowledgeBaseParams {
    pub knowledge_base_name: String,
    pub vector_store_type: String,
    pub kb_info: String,
    pub embed_model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteDocsParams {
    pub knowledge_base_name: String,
    pub file_names: Vec<String>,
    pub delete_content: bool,
    pub not_refresh_vs_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyCaptchaParams {
    pub captcha_id: String,
    pub captcha_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisterParams {
    pub username: String,
    pub email: String,
    pub password: String,
    pub verification_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginParams {
    pub username: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captcha_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captcha_code: Option<String>,
}

/// Streamed chat reply, one text chunk per network chunk.
pub type ChatStream = BoxStream<'static, Result<String, ApiError>>;

#[derive(Clone)]
pub struct Api {
    client: HttpClient,
    chat_endpoint: ChatEndpoint,
}

impl Api {
    pub fn new(client: HttpClient, chat_endpoint: ChatEndpoint) -> Self {
        Self {
            client,
            chat_endpoint,
        }
    }

    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    async fn envelope<T: serde::de::DeserializeOwned>(
        &self,
        request: ApiRequest,
    ) -> Result<Envelope<T>, ApiError> {
        self.client.send(request).await?.envelope().await
    }

    pub async fn fetch_chat(
        &self,
        prompt: &str,
        options: &ChatOptions,
        signal: Option<AbortSignal>,
    ) -> Result<Envelope<Value>, ApiError> {
        let request = ApiRequest::post("/chat")
            .json(json!({ "prompt": prompt, "options": options }))
            .abort_signal(signal);
        self.envelope(request).await
    }

    pub async fn fetch_chat_config(&self) -> Result<Envelope<Value>, ApiError> {
        self.envelope(ApiRequest::post("/config")).await
    }

    pub async fn fetch_chat_process(
        &self,
        params: ChatProcessParams,
    ) -> Result<ChatStream, ApiError> {
        let mut body = json!({
            "prompt": params.prompt,
            "options": params.options,
            "query": params.prompt,
            "kb_name": params.kb_name,
        });
        if let (Some(model), Some(fields)) = (params.model_params, body.as_object_mut()) {
            fields.insert("systemMessage".into(), json!(model.system_message));
            fields.insert("temperature".into(), json!(model.temperature));
            fields.insert("top_p".into(), json!(model.top_p));
        }
        let signal = params.signal;
        let request = ApiRequest::post(self.chat_endpoint.path())
            .json(body)
            .abort_signal(signal.clone());
        let stream = self.client.send(request).await?.into_text_stream();
        Ok(match signal {
            Some(signal) => until_aborted(stream.boxed(), signal),
            None => stream.boxed(),
        })
    }

    pub async fn fetch_session(&self) -> Result<Envelope<SessionInfo>, ApiError> {
        self.envelope(ApiRequest::post("/session")).await
    }

    pub async fn fetch_verify(&self, token: &str) -> Result<Envelope<Value>, ApiError> {
        if token.trim().is_empty() {
            return Err(ApiError::Validation("Secret key is empty".to_string()));
        }
        self.envelope(ApiRequest::post("/verify").json(json!({ "token": token })))
            .await
    }

    pub async fn fetch_upload_file(&self, params: UploadParams) -> Result<Envelope<Value>, ApiError> {
        self.envelope(ApiRequest::post("/upload_docs").multipart(params.into_parts()))
            .await
    }

    pub async fn fetch_list_knowledge_bases(
        &self,
    ) -> Result<Envelope<Vec<KnowledgeBase>>, ApiError> {
        self.envelope(ApiRequest::get("api/list_knowledge_bases")).await
    }

    pub async fn create_knowledge_base(
        &self,
        params: &CreateKnowledgeBaseParams,
    ) -> Result<Envelope<Value>, ApiError> {
        let body = serde_json::to_value(params)?;
        self.envelope(ApiRequest::post("api/create_knowledge_base").json(body))
            .await
    }

    pub async fn delete_knowledge_base(
        &self,
        knowledge_base_name: &str,
    ) -> Result<Envelope<Value>, ApiError> {
        let body = json!({ "knowledge_base_name": knowledge_base_name });
        self.envelope(ApiRequest::post("api/delete_knowledge_base").json(body))
            .await
    }

    pub async fn fetch_list_files(
        &self,
        knowledge_base_name: &str,
    ) -> Result<Envelope<Vec<KnowledgeBaseFile>>, ApiError> {
        let request =
            ApiRequest::get("api/list_files").query("knowledge_base_name", knowledge_base_name);
        self.envelope(request).await
    }

    pub async fn delete_docs(&self, params: &DeleteDocsParams) -> Result<Envelope<Value>, ApiError> {
        let body = serde_json::to_value(params)?;
        self.envelope(ApiRequest::post("api/delete_docs").json(body)).await
    }

    pub async fn fetch_captcha(&self) -> Result<Envelope<Value>, ApiError> {
        self.envelope(ApiRequest::get("get_captcha")).await
    }

    pub async fn verify_captcha(
        &self,
        params: &VerifyCaptchaParams,
    ) -> Result<Envelope<Value>, ApiError> {
        let body = serde_json::to_value(params)?;
        self.envelope(ApiRequest::post("verify_captcha").json(body)).await
    }

    pub async fn send_email_verification(&self, email: &str) -> Result<Envelope<Value>, ApiError> {
        self.envelope(ApiRequest::post("send_email_verification").json(json!({ "email": email })))
            .await
    }

    pub async fn register(&self, params: &RegisterParams) -> Result<Envelope<Value>, ApiError> {
        let body = serde_json::to_value(params)?;
        self.envelope(ApiRequest::post("register").json(body)).await
    }

    pub async fn login(&self, params: &LoginParams) -> Result<Envelope<TokenPair>, ApiError> {
        let body = serde_json::to_value(params)?;
        self.envelope(ApiRequest::post("login").json(body)).await
    }

    pub async fn fetch_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<Envelope<TokenPair>, ApiError> {
        self.envelope(refresh_request(refresh_token)).await
    }

    pub async fn fetch_user_info(&self) -> Result<Envelope<Value>, ApiError> {
        self.envelope(ApiRequest::get(USER_INFO_PATH)).await
    }
}

// Ends the stream with `Aborted` once the signal fires, even mid-body.
fn until_aborted(stream: ChatStream, signal: AbortSignal) -> ChatStream {
    stream::unfold(Some((stream, signal)), |state| async move {
        let (mut stream, signal) = state?;
        let next = tokio::select! {
            biased;
            _ = signal.aborted() => None,
            item = stream.next() => Some(item),
        };
        match next {
            None => Some((Err(ApiError::Aborted), None)),
            Some(item) => item.map(|item| (item, Some((stream, signal)))),
        }
    })
    .boxed()
}
