use super::{context_in, test_runtime};
use futures::TryStreamExt;
use kbchat_core::api::ChatOptions;
use kbchat_core::settings::SETTINGS_KEY;
use kbchat_core::testing::{ScriptedResponse, ScriptedTransport};
use kbchat_core::{AbortController, ApiError, Settings};
use reqwest::Method;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn patch(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(fields) => fields,
        _ => panic!("patch must be an object"),
    }
}

fn session(model: &str) -> ScriptedResponse {
    ScriptedResponse::json(
        200,
        json!({"status": "Success", "message": "", "data": {"auth": false, "model": model}}),
    )
}

#[test]
fn settings_persist_between_runs() {
    let dir = TempDir::new().expect("temp dir");
    let transport = Arc::new(ScriptedTransport::new());

    let first = context_in(dir.path(), &transport);
    first
        .settings()
        .update_setting(patch(json!({"top_k": 8, "temperature": 0.3, "theme": "dark"})))
        .expect("update");

    let second = context_in(dir.path(), &transport);
    let settings = second.settings().settings();
    assert_eq!(settings.top_k, 8);
    assert_eq!(settings.temperature, 0.3);
    assert_eq!(settings.extra["theme"], "dark");
    assert_eq!(settings.kb_name, "samples");

    second.settings().reset_setting().expect("reset");
    assert_eq!(second.storage().get(SETTINGS_KEY), None);
    assert_eq!(context_in(dir.path(), &transport).settings().settings(), Settings::default());
}

#[test]
fn chat_carries_model_settings_only_for_chatgpt_backends() {
    let runtime = test_runtime();
    let dir = TempDir::new().expect("temp dir");
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(Method::POST, "/session", session("ChatGPTAPI"));
    transport.push(
        Method::POST,
        "/kb_chat2",
        ScriptedResponse::chunks(200, vec!["Hel", "lo"]),
    );
    transport.push(Method::POST, "/session", session("ChatGPTUnofficialProxyAPI"));
    transport.push(Method::POST, "/kb_chat2", ScriptedResponse::text(200, "again"));

    let ctx = context_in(dir.path(), &transport);
    ctx.settings()
        .update_setting(patch(json!({"system_message": "Answer tersely.", "top_p": 0.9})))
        .expect("update");
    ctx.settings().set_kb_name("manuals").expect("kb");
    let ctx = context_in(dir.path(), &transport);

    let reply: Vec<String> = runtime.block_on(async {
        ctx.load_backend_session().await.expect("session");
        ctx.chat("hello", ChatOptions::default(), None)
            .await
            .expect("chat")
            .try_collect()
            .await
            .expect("chunks")
    });
    assert_eq!(reply.concat(), "Hello");
    let body = transport
        .last_request("/kb_chat2")
        .and_then(|request| request.json_body().cloned())
        .expect("chat body");
    assert_eq!(body["kb_name"], "manuals");
    assert_eq!(body["systemMessage"], "Answer tersely.");
    assert_eq!(body["top_p"], 0.9);

    runtime.block_on(async {
        ctx.load_backend_session().await.expect("session");
        let _ = ctx
            .chat("hello again", ChatOptions::default(), None)
            .await
            .expect("chat");
    });
    let body = transport
        .last_request("/kb_chat2")
        .and_then(|request| request.json_body().cloned())
        .expect("chat body");
    assert_eq!(body["prompt"], "hello again");
    assert!(body.get("systemMessage").is_none());
    assert!(body.get("temperature").is_none());
}

#[test]
fn chat_can_be_cancelled_before_the_reply_arrives() {
    let runtime = test_runtime();
    let dir = TempDir::new().expect("temp dir");
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(
        Method::POST,
        "/kb_chat2",
        ScriptedResponse::text(200, "too late").with_delay(Duration::from_secs(5)),
    );
    let ctx = context_in(dir.path(), &transport);
    let controller = AbortController::new();

    let result = runtime.block_on(async {
        let chat = ctx.chat("slow question", ChatOptions::default(), Some(controller.signal()));
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            controller.abort();
        };
        let (result, ()) = tokio::join!(chat, cancel);
        result.map(|_| ())
    });
    assert!(matches!(result, Err(ApiError::Aborted)));
}
