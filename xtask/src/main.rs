use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use kbchat_core::api::{ChatOptions, LoginParams};
use kbchat_core::testing::{ScriptedResponse, ScriptedTransport};
use kbchat_core::{telemetry, AppContext, ClientConfig, Fetched, LocalStorage};
use reqwest::Method;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::Runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "xtask", version, about = "Automation helpers for kbchat")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the client data layer end to end against a scripted backend.
    Smoke,
}

fn main() -> Result<()> {
    telemetry::init_tracing(EnvFilter::new("info"))?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Smoke => smoke_test(),
    }
}

fn scripted_backend() -> Arc<ScriptedTransport> {
    let ok = |data: serde_json::Value| {
        ScriptedResponse::json(200, json!({"code": 200, "msg": "success", "data": data}))
    };
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(
        Method::POST,
        "/login",
        ok(json!({"access_token": "smoke-a1", "refresh_token": "smoke-r1"})),
    );
    transport.push(Method::GET, "/api/list_knowledge_bases", ScriptedResponse::status(401));
    transport.push(
        Method::POST,
        "/refresh_token",
        ok(json!({"access_token": "smoke-a2", "refresh_token": "smoke-r2"})),
    );
    transport.push(
        Method::GET,
        "/api/list_knowledge_bases",
        ok(json!([{"id": 1, "kb_name": "samples", "kb_info": "Smoke test base"}])),
    );
    transport.push(
        Method::POST,
        "/session",
        ScriptedResponse::json(
            200,
            json!({"status": "Success", "data": {"auth": true, "model": "ChatGPTAPI"}}),
        ),
    );
    transport.push(
        Method::POST,
        "/kb_chat2",
        ScriptedResponse::chunks(200, vec!["pong ", "from ", "kbchat"]),
    );
    transport
}

fn smoke_test() -> Result<()> {
    let runtime = Runtime::new()?;
    let temp_dir = TempDir::new()?;
    let config = ClientConfig::for_base_url("http://smoke.invalid")?.with_data_dir(temp_dir.path());
    let storage = LocalStorage::open(temp_dir.path())?;
    let transport = scripted_backend();
    let ctx = AppContext::with_transport(config, storage, transport.clone());

    runtime.block_on(async {
        ctx.login(&LoginParams {
            username: "smoke".into(),
            password: "smoke".into(),
            captcha_id: None,
            captcha_code: None,
        })
        .await
        .context("login")?;

        let bases = match ctx.knowledge().fetch_knowledge_bases().await {
            Fetched::Data(bases) => bases,
            Fetched::Empty => bail!("smoke backend listed no knowledge bases"),
            Fetched::Failed(message) => bail!("listing failed: {message}"),
        };
        info!(
            "knowledge_bases" = bases.len(),
            "refresh_calls" = transport.calls("/refresh_token"),
            "listing survived token expiry"
        );

        ctx.load_backend_session().await.context("session")?;
        let reply: Vec<String> = ctx
            .chat("ping from xtask", ChatOptions::default(), None)
            .await
            .context("chat")?
            .try_collect()
            .await?;
        info!("reply" = %reply.concat(), "smoke test chat streamed");
        Ok(())
    })?;

    if ctx.session().access_token() != "smoke-a2" {
        bail!("refreshed access token was not persisted");
    }
    Ok(())
}
