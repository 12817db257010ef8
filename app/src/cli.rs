use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "kbchat", version, about = "Chat with your knowledge bases")]
pub struct Cli {
    /// Backend base URL, overriding kbchat.yaml and KBCHAT_API_URL.
    #[arg(long, global = true)]
    pub api_url: Option<String>,
    /// Directory holding tokens and settings.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,
    #[arg(short, long, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Exchange credentials for tokens.
    Login(LoginArgs),
    /// Forget stored tokens.
    Logout,
    /// Show the identity behind the stored token.
    Whoami,
    /// Show the backend session and model.
    Session,
    /// Check an access secret with the backend.
    Verify { token: String },
    /// Fetch a captcha challenge.
    Captcha,
    VerifyCaptcha {
        captcha_id: String,
        captcha_code: String,
    },
    /// Send an email verification code.
    SendCode { email: String },
    Register(RegisterArgs),
    /// Manage knowledge bases.
    Kb {
        #[command(subcommand)]
        command: KbCommand,
    },
    /// Upload documents (files or directories) into a knowledge base.
    Upload(UploadArgs),
    /// Remove documents from a knowledge base.
    DeleteDocs(DeleteDocsArgs),
    /// Ask a question; the reply is streamed. Ctrl-C cancels.
    Chat(ChatArgs),
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
}

#[derive(Args, Debug)]
pub struct LoginArgs {
    #[arg(long)]
    pub username: String,
    #[arg(long)]
    pub password: String,
    #[arg(long)]
    pub captcha_id: Option<String>,
    #[arg(long)]
    pub captcha_code: Option<String>,
}

#[derive(Args, Debug)]
pub struct RegisterArgs {
    #[arg(long)]
    pub username: String,
    #[arg(long)]
    pub email: String,
    #[arg(long)]
    pub password: String,
    #[arg(long)]
    pub code: String,
}

#[derive(Subcommand, Debug)]
pub enum KbCommand {
    List,
    Create {
        name: String,
        #[arg(long, default_value = "faiss")]
        vector_store_type: String,
        #[arg(long, default_value = "")]
        info: String,
        #[arg(long, default_value = "bge-large-zh-v1.5")]
        embed_model: String,
    },
    Delete {
        name: String,
    },
    /// List files of a knowledge base (the selected one by default).
    Files {
        name: Option<String>,
    },
    /// Select the knowledge base used for chat and uploads.
    Use {
        name: String,
    },
}

#[derive(Args, Debug)]
pub struct UploadArgs {
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
    #[arg(long)]
    pub kb: Option<String>,
    #[arg(long)]
    pub chunk_size: Option<u32>,
    #[arg(long)]
    pub chunk_overlap: Option<u32>,
    #[arg(long)]
    pub zh_title_enhance: bool,
}

#[derive(Args, Debug)]
pub struct DeleteDocsArgs {
    #[arg(required = true)]
    pub files: Vec<String>,
    #[arg(long)]
    pub kb: Option<String>,
    /// Also delete the stored file content, not just its vectors.
    #[arg(long)]
    pub delete_content: bool,
    #[arg(long)]
    pub not_refresh_vs_cache: bool,
}

#[derive(Args, Debug)]
pub struct ChatArgs {
    #[arg(required = true)]
    pub prompt: Vec<String>,
    /// Select this knowledge base first; it stays selected afterwards.
    #[arg(long)]
    pub kb: Option<String>,
    #[arg(long)]
    pub conversation_id: Option<String>,
    #[arg(long)]
    pub parent_message_id: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum SettingsCommand {
    Show,
    /// Update settings with `key=value` pairs; values are parsed as JSON when
    /// possible, e.g. `top_k=5 return_direct=true kb_name=manuals`.
    Set {
        #[arg(required = true)]
        assignments: Vec<String>,
    },
    Reset,
}
