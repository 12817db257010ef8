use crate::cli::{
    ChatArgs, Command, DeleteDocsArgs, KbCommand, LoginArgs, RegisterArgs, SettingsCommand,
    UploadArgs,
};
use crate::output;
use anyhow::{anyhow, bail, Context, Result};
use futures::StreamExt;
use kbchat_core::api::{
    ChatOptions, CreateKnowledgeBaseParams, DeleteDocsParams, FileUpload, LoginParams,
    RegisterParams, UploadFiles, UploadParams, VerifyCaptchaParams,
};
use kbchat_core::knowledge::DEFAULT_KNOWLEDGE_BASE;
use kbchat_core::{AbortController, AbortSignal, AppContext, ApiError, Envelope, Fetched};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub async fn execute(ctx: &AppContext, command: Command) -> Result<()> {
    if needs_session(&command) {
        let authenticated = ctx.bootstrap().await;
        debug!(authenticated, "session restored");
    }

    match command {
        Command::Login(args) => login(ctx, args).await,
        Command::Logout => {
            ctx.logout();
            println!("Logged out.");
            Ok(())
        }
        Command::Whoami => {
            if !ctx.session().is_auth() {
                bail!("not logged in");
            }
            let data = checked(ctx.api().fetch_user_info().await)?;
            output::print_json(&data)
        }
        Command::Session => {
            let info = ctx.load_backend_session().await.map_err(user_error)?;
            println!("auth required: {}", info.auth);
            println!("model: {}", info.model);
            Ok(())
        }
        Command::Verify { token } => {
            let envelope = ctx.api().fetch_verify(&token).await.map_err(user_error)?;
            let message = envelope.message.clone();
            envelope.ensure_ok().map_err(user_error)?;
            println!("{}", message.unwrap_or_else(|| "Verify successfully".to_string()));
            Ok(())
        }
        Command::Captcha => {
            let data = checked(ctx.api().fetch_captcha().await)?;
            output::print_json(&data)
        }
        Command::VerifyCaptcha {
            captcha_id,
            captcha_code,
        } => {
            let params = VerifyCaptchaParams {
                captcha_id,
                captcha_code,
            };
            checked(ctx.api().verify_captcha(&params).await)?;
            println!("Captcha accepted.");
            Ok(())
        }
        Command::SendCode { email } => {
            checked(ctx.api().send_email_verification(&email).await)?;
            println!("Verification code sent to {email}.");
            Ok(())
        }
        Command::Register(args) => register(ctx, args).await,
        Command::Kb { command } => knowledge_base(ctx, command).await,
        Command::Upload(args) => upload(ctx, args).await,
        Command::DeleteDocs(args) => delete_docs(ctx, args).await,
        Command::Chat(args) => chat(ctx, args).await,
        Command::Settings { command } => settings(ctx, command),
    }
}

// Local-only commands must not touch the stored session; an offline
// bootstrap would clear the tokens.
fn needs_session(command: &Command) -> bool {
    !matches!(
        command,
        Command::Login(_) | Command::Logout | Command::Settings { .. }
    )
}

async fn login(ctx: &AppContext, args: LoginArgs) -> Result<()> {
    let params = LoginParams {
        username: args.username,
        password: args.password,
        captcha_id: args.captcha_id,
        captcha_code: args.captcha_code,
    };
    ctx.login(&params).await.map_err(user_error)?;
    println!("Logged in as {}.", params.username);
    Ok(())
}

async fn register(ctx: &AppContext, args: RegisterArgs) -> Result<()> {
    let params = RegisterParams {
        username: args.username,
        email: args.email,
        password: args.password,
        verification_code: args.code,
    };
    checked(ctx.api().register(&params).await)?;
    println!("Registered {}. You can log in now.", params.username);
    Ok(())
}

async fn knowledge_base(ctx: &AppContext, command: KbCommand) -> Result<()> {
    let knowledge = ctx.knowledge();
    match command {
        KbCommand::List => {
            let current = knowledge.current_knowledge_base();
            let bases = into_items(knowledge.fetch_knowledge_bases().await)?;
            output::print_knowledge_bases(&bases, current.as_deref());
        }
        KbCommand::Create {
            name,
            vector_store_type,
            info,
            embed_model,
        } => {
            let params = CreateKnowledgeBaseParams {
                knowledge_base_name: name,
                vector_store_type,
                kb_info: info,
                embed_model,
            };
            let bases = into_items(knowledge.create_knowledge_base(&params).await)?;
            output::print_knowledge_bases(&bases, knowledge.current_knowledge_base().as_deref());
        }
        KbCommand::Delete { name } => {
            let bases = into_items(knowledge.delete_knowledge_base(&name).await)?;
            if ctx.settings().settings().kb_name == name {
                warn!(kb = %name, "deleted the selected knowledge base");
                ctx.settings().set_kb_name(DEFAULT_KNOWLEDGE_BASE)?;
            }
            output::print_knowledge_bases(&bases, knowledge.current_knowledge_base().as_deref());
        }
        KbCommand::Files { name } => {
            let files = match name {
                Some(name) => knowledge.fetch_knowledge_base_files(&name).await,
                None => knowledge.refresh_current_knowledge_base_files().await,
            };
            output::print_files(&into_items(files)?);
        }
        KbCommand::Use { name } => {
            let files = into_items(ctx.use_knowledge_base(&name).await?)?;
            println!("Using knowledge base {name}.");
            output::print_files(&files);
        }
    }
    Ok(())
}

async fn upload(ctx: &AppContext, args: UploadArgs) -> Result<()> {
    let paths = collect_files(&args.paths)?;
    if paths.is_empty() {
        bail!("no files to upload");
    }
    let mut files = Vec::with_capacity(paths.len());
    for path in &paths {
        let file = FileUpload::from_path(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        files.push(file);
    }

    let kb = selected_base(ctx, args.kb);
    let mut params = UploadParams::new(&kb, UploadFiles::List(files), &ctx.config().upload);
    if let Some(chunk_size) = args.chunk_size {
        params.chunk_size = chunk_size;
    }
    if let Some(chunk_overlap) = args.chunk_overlap {
        params.chunk_overlap = chunk_overlap;
    }
    if params.chunk_overlap >= params.chunk_size {
        bail!("chunk overlap must be smaller than chunk size");
    }
    params.zh_title_enhance |= args.zh_title_enhance;

    info!(kb = %kb, files = paths.len(), "uploading documents");
    let listing = into_items(ctx.knowledge().upload_documents(params).await)?;
    println!("Uploaded {} file(s) to {kb}.", paths.len());
    output::print_files(&listing);
    Ok(())
}

async fn delete_docs(ctx: &AppContext, args: DeleteDocsArgs) -> Result<()> {
    let params = DeleteDocsParams {
        knowledge_base_name: selected_base(ctx, args.kb),
        file_names: args.files,
        delete_content: args.delete_content,
        not_refresh_vs_cache: args.not_refresh_vs_cache,
    };
    let listing = into_items(ctx.knowledge().delete_documents(&params).await)?;
    output::print_files(&listing);
    Ok(())
}

async fn chat(ctx: &AppContext, args: ChatArgs) -> Result<()> {
    if let Some(kb) = &args.kb {
        ctx.use_knowledge_base(kb).await?;
    }
    if let Err(err) = ctx.load_backend_session().await {
        warn!(%err, "could not read backend session");
    }

    let controller = AbortController::new();
    let signal = controller.signal();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            controller.abort();
        }
    });

    let options = ChatOptions {
        conversation_id: args.conversation_id,
        parent_message_id: args.parent_message_id,
    };
    let prompt = args.prompt.join(" ");
    let result = stream_reply(ctx, &prompt, options, signal).await;
    interrupt.abort();

    match result {
        Err(ApiError::Aborted) => {
            println!();
            eprintln!("Cancelled.");
            Ok(())
        }
        other => other.map_err(user_error),
    }
}

async fn stream_reply(
    ctx: &AppContext,
    prompt: &str,
    options: ChatOptions,
    signal: AbortSignal,
) -> Result<(), ApiError> {
    let mut stream = ctx.chat(prompt, options, Some(signal)).await?;
    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = stream.next().await {
        stdout.write_all(chunk?.as_bytes()).await?;
        stdout.flush().await?;
    }
    stdout.write_all(b"\n").await?;
    Ok(())
}

fn settings(ctx: &AppContext, command: SettingsCommand) -> Result<()> {
    let store = ctx.settings();
    match command {
        SettingsCommand::Show => output::print_json(&serde_json::to_value(store.settings())?),
        SettingsCommand::Set { assignments } => {
            let patch = parse_assignments(&assignments)?;
            let updated = store.update_setting(patch)?;
            output::print_json(&serde_json::to_value(updated)?)
        }
        SettingsCommand::Reset => {
            store.reset_setting()?;
            println!("Settings restored to defaults.");
            Ok(())
        }
    }
}

/// Parse `key=value` pairs. Values that are valid JSON keep their type,
/// anything else is taken as a string.
pub fn parse_assignments(assignments: &[String]) -> Result<Map<String, Value>> {
    let mut patch = Map::new();
    for assignment in assignments {
        let (key, raw) = assignment
            .split_once('=')
            .ok_or_else(|| anyhow!("expected key=value, got `{assignment}`"))?;
        let key = key.trim();
        if key.is_empty() {
            bail!("empty setting name in `{assignment}`");
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        patch.insert(key.to_string(), value);
    }
    Ok(patch)
}

/// Expand directories into the regular files beneath them, sorted for a
/// stable upload order.
pub fn collect_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found = Vec::new();
            for entry in WalkDir::new(path).follow_links(true) {
                let entry = entry.with_context(|| format!("failed to walk {}", path.display()))?;
                if entry.file_type().is_file() && !is_hidden(entry.path()) {
                    found.push(entry.into_path());
                }
            }
            found.sort();
            files.extend(found);
        } else if path.is_file() {
            files.push(path.clone());
        } else {
            bail!("{} does not exist", path.display());
        }
    }
    Ok(files)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

fn selected_base(ctx: &AppContext, explicit: Option<String>) -> String {
    explicit
        .or_else(|| ctx.knowledge().current_knowledge_base())
        .unwrap_or_else(|| ctx.settings().settings().kb_name)
}

fn into_items<T>(fetched: Fetched<Vec<T>>) -> Result<Vec<T>> {
    match fetched {
        Fetched::Data(items) => Ok(items),
        Fetched::Empty => Ok(Vec::new()),
        Fetched::Failed(message) => Err(anyhow!(message)),
    }
}

fn checked(result: Result<Envelope<Value>, ApiError>) -> Result<Value> {
    let data = result
        .and_then(Envelope::ensure_ok)
        .map_err(user_error)?;
    Ok(data.unwrap_or(Value::Null))
}

fn user_error(err: ApiError) -> anyhow::Error {
    anyhow!(err.user_message())
}
