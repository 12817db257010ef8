use directories::{BaseDirs, ProjectDirs};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:7861/";
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Backend path serving knowledge-base chat. The backend has shipped both
/// `/kb_chat` and `/kb_chat2`, so the path is configurable.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ChatEndpoint {
    KbChat,
    #[default]
    KbChat2,
    Custom(String),
}

impl ChatEndpoint {
    pub fn parse(value: &str) -> Self {
        match value.trim().trim_start_matches('/') {
            "kb_chat" => Self::KbChat,
            "kb_chat2" => Self::KbChat2,
            other => Self::Custom(format!("/{other}")),
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Self::KbChat => "/kb_chat",
            Self::KbChat2 => "/kb_chat2",
            Self::Custom(path) => path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadDefaults {
    pub chunk_size: u32,
    pub chunk_overlap: u32,
    pub zh_title_enhance: bool,
}

impl Default for UploadDefaults {
    fn default() -> Self {
        Self {
            chunk_size: 250,
            chunk_overlap: 50,
            zh_title_enhance: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: Url,
    pub chat_endpoint: ChatEndpoint,
    pub data_dir: PathBuf,
    pub timeout: Duration,
    pub upload: UploadDefaults,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("configuration invalid: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Invalid(detail) => format!("kbchat not configured: {detail}. Update kbchat.yaml."),
        }
    }
}

impl ClientConfig {
    /// Configuration pointing at `base_url` with every other value defaulted,
    /// storage included.
    pub fn for_base_url(base_url: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: normalize_base_url(base_url)?,
            chat_endpoint: ChatEndpoint::default(),
            data_dir: default_data_dir(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            upload: UploadDefaults::default(),
        })
    }

    /// Load defaults, then `kbchat.yaml`, then environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let file = match locate_config_file() {
            Some(path) => read_config_file(&path)?,
            None => FileConfig::default(),
        };
        resolve(file, EnvOverrides::from_env())
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_base_url(mut self, raw: &str) -> Result<Self, ConfigError> {
        self.base_url = normalize_base_url(raw)?;
        Ok(self)
    }
}

#[derive(Debug, Default, Clone)]
struct EnvOverrides {
    api_url: Option<String>,
    chat_endpoint: Option<String>,
    data_dir: Option<String>,
    timeout_secs: Option<String>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            api_url: var("KBCHAT_API_URL"),
            chat_endpoint: var("KBCHAT_CHAT_ENDPOINT"),
            data_dir: var("KBCHAT_DATA_DIR"),
            timeout_secs: var("KBCHAT_TIMEOUT_SECS"),
        }
    }
}

fn resolve(file: FileConfig, env: EnvOverrides) -> Result<ClientConfig, ConfigError> {
    let api = file.api.unwrap_or_default();
    let base_url = env
        .api_url
        .or(api.base_url)
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());
    let chat_endpoint = env
        .chat_endpoint
        .or(api.chat_endpoint)
        .map(|value| ChatEndpoint::parse(&value))
        .unwrap_or_default();

    let timeout_secs = match env.timeout_secs {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| ConfigError::Invalid(format!("KBCHAT_TIMEOUT_SECS must be a number, got `{raw}`")))?,
        None => api.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
    };
    if timeout_secs == 0 {
        return Err(ConfigError::Invalid("timeout must be at least one second".to_string()));
    }

    let data_dir = env
        .data_dir
        .map(PathBuf::from)
        .or(file.data_dir)
        .unwrap_or_else(default_data_dir);

    let upload_section = file.upload.unwrap_or_default();
    let defaults = UploadDefaults::default();
    let upload = UploadDefaults {
        chunk_size: upload_section.chunk_size.unwrap_or(defaults.chunk_size),
        chunk_overlap: upload_section.chunk_overlap.unwrap_or(defaults.chunk_overlap),
        zh_title_enhance: upload_section
            .zh_title_enhance
            .unwrap_or(defaults.zh_title_enhance),
    };
    if upload.chunk_overlap >= upload.chunk_size {
        return Err(ConfigError::Invalid(format!(
            "chunk_overlap ({}) must be smaller than chunk_size ({})",
            upload.chunk_overlap, upload.chunk_size
        )));
    }

    Ok(ClientConfig {
        base_url: normalize_base_url(&base_url)?,
        chat_endpoint,
        data_dir,
        timeout: Duration::from_secs(timeout_secs),
        upload,
    })
}

fn normalize_base_url(raw: &str) -> Result<Url, ConfigError> {
    let trimmed = raw.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    let url = Url::parse(&with_slash)
        .map_err(|err| ConfigError::Invalid(format!("invalid API url `{trimmed}`: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid(format!(
            "API url must use http or https, got `{}`",
            url.scheme()
        )));
    }
    Ok(url)
}

fn read_config_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|err| {
        ConfigError::Invalid(format!("failed to read {}: {err}", path.display()))
    })?;
    serde_yaml::from_str(&contents)
        .map_err(|err| ConfigError::Invalid(format!("invalid kbchat.yaml: {err}")))
}

fn locate_config_file() -> Option<PathBuf> {
    config_candidates().into_iter().find(|path| path.exists())
}

fn config_candidates() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(base) = BaseDirs::new() {
        let config_dir = base.config_dir().join("kbchat");
        paths.push(config_dir.join("kbchat.yaml"));
        paths.push(config_dir.join("kbchat.yml"));
        let home_dir = base.home_dir();
        paths.push(home_dir.join(".kbchat").join("kbchat.yaml"));
        paths.push(home_dir.join(".kbchat").join("kbchat.yml"));
    } else {
        paths.push(PathBuf::from("kbchat.yaml"));
        paths.push(PathBuf::from("kbchat.yml"));
    }
    paths
}

fn default_data_dir() -> PathBuf {
    ProjectDirs::from("", "", "kbchat")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".kbchat"))
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    api: Option<ApiSection>,
    data_dir: Option<PathBuf>,
    upload: Option<UploadSection>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiSection {
    base_url: Option<String>,
    chat_endpoint: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct UploadSection {
    chunk_size: Option<u32>,
    chunk_overlap: Option<u32>,
    zh_title_enhance: Option<bool>,
}
