use super::{context_in, test_runtime};
use kbchat_core::api::LoginParams;
use kbchat_core::auth::{ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
use kbchat_core::testing::{ScriptedResponse, ScriptedTransport};
use kbchat_core::{ApiError, Fetched};
use reqwest::Method;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn login_params() -> LoginParams {
    LoginParams {
        username: "ada".into(),
        password: "secret".into(),
        captcha_id: None,
        captcha_code: None,
    }
}

fn ok(data: serde_json::Value) -> ScriptedResponse {
    ScriptedResponse::json(200, json!({"code": 200, "msg": "ok", "data": data}))
}

#[test]
fn login_survives_restart_and_is_validated() {
    let runtime = test_runtime();
    let dir = TempDir::new().expect("temp dir");
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(
        Method::POST,
        "/login",
        ok(json!({"access_token": "a1", "refresh_token": "r1", "token_type": "bearer"})),
    );
    transport.push(Method::GET, "/user_info", ok(json!({"username": "ada"})));

    let first = context_in(dir.path(), &transport);
    runtime.block_on(first.login(&login_params())).expect("login");
    drop(first);

    let restarted = context_in(dir.path(), &transport);
    assert!(!restarted.session().is_auth());
    assert!(runtime.block_on(restarted.bootstrap()));
    assert!(restarted.session().is_auth());
    assert_eq!(restarted.session().refresh_token(), "r1");

    let identity = transport.last_request("/user_info").expect("identity check");
    assert_eq!(identity.authorization().as_deref(), Some("Bearer a1"));
    let login = transport.last_request("/login").expect("login request");
    assert_eq!(login.authorization(), None);
}

#[test]
fn bootstrap_without_tokens_stays_offline() {
    let runtime = test_runtime();
    let dir = TempDir::new().expect("temp dir");
    let transport = Arc::new(ScriptedTransport::new());
    let ctx = context_in(dir.path(), &transport);

    assert!(!runtime.block_on(ctx.bootstrap()));
    assert!(transport.requests().is_empty());
}

#[test]
fn rejected_stored_credentials_are_cleared() {
    let runtime = test_runtime();
    let dir = TempDir::new().expect("temp dir");
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(Method::GET, "/user_info", ScriptedResponse::status(401));
    transport.push(
        Method::POST,
        "/refresh_token",
        ScriptedResponse::json(401, json!({"detail": "refresh token expired"})),
    );

    let ctx = context_in(dir.path(), &transport);
    ctx.storage().set(ACCESS_TOKEN_KEY, "stale").expect("seed access");
    ctx.storage().set(REFRESH_TOKEN_KEY, "expired").expect("seed refresh");
    let ctx = context_in(dir.path(), &transport);

    assert!(!runtime.block_on(ctx.bootstrap()));
    assert_eq!(transport.calls("/refresh_token"), 1);
    assert_eq!(transport.calls("/user_info"), 1);
    assert_eq!(ctx.storage().get(ACCESS_TOKEN_KEY), None);
    assert_eq!(ctx.storage().get(REFRESH_TOKEN_KEY), None);
    assert!(!ctx.session().is_auth());
}

#[test]
fn expired_token_is_refreshed_and_the_listing_replayed() {
    let runtime = test_runtime();
    let dir = TempDir::new().expect("temp dir");
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(
        Method::POST,
        "/login",
        ok(json!({"access_token": "a1", "refresh_token": "r1"})),
    );
    transport.push(Method::GET, "/api/list_knowledge_bases", ScriptedResponse::status(401));
    transport.push(
        Method::GET,
        "/api/list_knowledge_bases",
        ok(json!([{"id": 1, "kb_name": "samples"}])),
    );
    transport.push(
        Method::POST,
        "/refresh_token",
        ScriptedResponse::json(
            200,
            json!({"status": "Success", "data": {"access_token": "a2", "refresh_token": "r2"}}),
        ),
    );
    let ctx = context_in(dir.path(), &transport);
    runtime.block_on(ctx.login(&login_params())).expect("login");

    let listing = runtime.block_on(ctx.knowledge().fetch_knowledge_bases());
    assert_eq!(listing.data().map(Vec::len), Some(1));

    let refresh = transport.last_request("/refresh_token").expect("refresh call");
    assert_eq!(refresh.json_body(), Some(&json!({"refresh_token": "r1"})));
    let replay = transport
        .last_request("/api/list_knowledge_bases")
        .expect("replay");
    assert_eq!(replay.authorization().as_deref(), Some("Bearer a2"));
    assert_eq!(transport.calls("/api/list_knowledge_bases"), 2);

    let reopened = context_in(dir.path(), &transport);
    assert_eq!(reopened.storage().get(ACCESS_TOKEN_KEY).as_deref(), Some("a2"));
    assert_eq!(reopened.storage().get(REFRESH_TOKEN_KEY).as_deref(), Some("r2"));
}

#[test]
fn concurrent_expiry_across_endpoints_refreshes_once() {
    let runtime = test_runtime();
    let dir = TempDir::new().expect("temp dir");
    let transport = Arc::new(ScriptedTransport::new());
    for path in ["/api/list_knowledge_bases", "/api/list_files", "/user_info"] {
        transport.push(Method::GET, path, ScriptedResponse::status(401));
    }
    transport.push(
        Method::POST,
        "/refresh_token",
        ok(json!({"access_token": "fresh"})).with_delay(Duration::from_millis(30)),
    );
    transport.push(Method::GET, "/api/list_knowledge_bases", ok(json!(["samples"])));
    transport.push(Method::GET, "/api/list_files", ok(json!([{"file_name": "guide.pdf"}])));
    transport.push(Method::GET, "/user_info", ok(json!({"username": "ada"})));

    let ctx = context_in(dir.path(), &transport);
    ctx.storage().set(ACCESS_TOKEN_KEY, "old").expect("seed access");
    ctx.storage().set(REFRESH_TOKEN_KEY, "r1").expect("seed refresh");
    let ctx = context_in(dir.path(), &transport);

    let (bases, files, identity) = runtime.block_on(async {
        tokio::join!(
            ctx.knowledge().fetch_knowledge_bases(),
            ctx.knowledge().fetch_knowledge_base_files("samples"),
            ctx.api().fetch_user_info(),
        )
    });

    assert_eq!(bases.data().map(|b| b[0].kb_name.clone()).as_deref(), Some("samples"));
    assert!(matches!(files, Fetched::Data(ref f) if f[0].file_name == "guide.pdf"));
    assert!(identity.expect("identity").is_ok());
    assert_eq!(transport.calls("/refresh_token"), 1);
    for path in ["/api/list_knowledge_bases", "/api/list_files", "/user_info"] {
        assert_eq!(transport.calls(path), 2, "{path} should replay exactly once");
        let replay = transport.last_request(path).expect("replay");
        assert_eq!(replay.authorization().as_deref(), Some("Bearer fresh"));
    }
    // The refresh response kept the old refresh token.
    assert_eq!(ctx.session().refresh_token(), "r1");
}

#[test]
fn logout_clears_disk_and_drops_bearer() {
    let runtime = test_runtime();
    let dir = TempDir::new().expect("temp dir");
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(
        Method::POST,
        "/login",
        ok(json!({"access_token": "a1", "refresh_token": "r1"})),
    );
    transport.push(Method::GET, "/get_captcha", ok(json!({"captcha_id": "c1"})));
    let ctx = context_in(dir.path(), &transport);
    runtime.block_on(ctx.login(&login_params())).expect("login");
    ctx.logout();

    let captcha = runtime
        .block_on(ctx.api().fetch_captcha())
        .expect("captcha");
    assert!(captcha.is_ok());
    let captcha = transport.last_request("/get_captcha").expect("captcha request");
    assert_eq!(captcha.authorization(), None);

    let reopened = context_in(dir.path(), &transport);
    assert_eq!(reopened.session().access_token(), "");
    assert_eq!(reopened.session().refresh_token(), "");
}

#[test]
fn transport_failures_surface_unchanged() {
    let runtime = test_runtime();
    let dir = TempDir::new().expect("temp dir");
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(
        Method::POST,
        "/login",
        ScriptedResponse::transport_error("connection refused"),
    );
    let ctx = context_in(dir.path(), &transport);

    let err = runtime.block_on(ctx.login(&login_params())).unwrap_err();
    assert!(matches!(err, ApiError::Transport(ref message) if message.contains("connection refused")));
    assert!(!ctx.session().is_auth());
}
