use super::{context_in, test_runtime};
use kbchat_core::api::{
    CreateKnowledgeBaseParams, DeleteDocsParams, FileUpload, UploadFiles, UploadParams,
};
use kbchat_core::testing::{ScriptedResponse, ScriptedTransport};
use kbchat_core::Fetched;
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

fn ok(data: Value) -> ScriptedResponse {
    ScriptedResponse::json(200, json!({"code": 200, "msg": "success", "data": data}))
}

#[test]
fn create_select_upload_and_prune() {
    let runtime = test_runtime();
    let dir = TempDir::new().expect("temp dir");
    let docs = TempDir::new().expect("docs dir");
    std::fs::write(docs.path().join("guide.md"), "# Guide").unwrap();
    std::fs::write(docs.path().join("faq.txt"), "Q: A").unwrap();

    let transport = Arc::new(ScriptedTransport::new());
    transport.push(Method::POST, "/api/create_knowledge_base", ok(Value::Null));
    transport.push(
        Method::GET,
        "/api/list_knowledge_bases",
        ok(json!([
            {"id": 1, "kb_name": "samples"},
            {"id": 2, "kb_name": "manuals", "embed_model": "bge-large-zh-v1.5"}
        ])),
    );
    transport.push(Method::GET, "/api/list_files", ok(json!([])));
    transport.push(Method::POST, "/upload_docs", ok(json!({"failed_files": {}})));
    transport.push(
        Method::GET,
        "/api/list_files",
        ok(json!([
            {"file_name": "faq.txt", "docs_count": 1},
            {"file_name": "guide.md", "docs_count": 2}
        ])),
    );
    transport.push(Method::POST, "/api/delete_docs", ok(Value::Null));
    transport.push(
        Method::GET,
        "/api/list_files",
        ok(json!([{"file_name": "guide.md", "docs_count": 2}])),
    );

    let ctx = context_in(dir.path(), &transport);
    let knowledge = ctx.knowledge();

    let bases = runtime.block_on(knowledge.create_knowledge_base(&CreateKnowledgeBaseParams {
        knowledge_base_name: "manuals".into(),
        vector_store_type: "faiss".into(),
        kb_info: "Product manuals".into(),
        embed_model: "bge-large-zh-v1.5".into(),
    }));
    let bases = bases.data().cloned().expect("bases");
    assert_eq!(bases[1].embedding_model.as_deref(), Some("bge-large-zh-v1.5"));

    let files = runtime
        .block_on(ctx.use_knowledge_base("manuals"))
        .expect("select");
    assert_eq!(files, Fetched::Empty);

    let uploads = runtime.block_on(async {
        let mut uploads = Vec::new();
        for name in ["faq.txt", "guide.md"] {
            uploads.push(FileUpload::from_path(&docs.path().join(name)).await.expect("read"));
        }
        uploads
    });
    let params = UploadParams::new("manuals", UploadFiles::List(uploads), &ctx.config().upload);
    let listing = runtime.block_on(knowledge.upload_documents(params));
    assert_eq!(listing.data().map(Vec::len), Some(2));

    let upload = transport.last_request("/upload_docs").expect("upload request");
    assert_eq!(upload.multipart_files("files"), vec!["faq.txt", "guide.md"]);
    assert_eq!(upload.multipart_text("knowledge_base_name").as_deref(), Some("manuals"));
    assert_eq!(upload.multipart_text("chunk_size").as_deref(), Some("250"));
    assert_eq!(upload.multipart_text("chunk_overlap").as_deref(), Some("50"));
    assert_eq!(upload.multipart_text("zh_title_enhance").as_deref(), Some("false"));

    let listing = runtime.block_on(knowledge.delete_documents(&DeleteDocsParams {
        knowledge_base_name: "manuals".into(),
        file_names: vec!["faq.txt".into()],
        delete_content: true,
        not_refresh_vs_cache: false,
    }));
    assert_eq!(listing.data().map(|files| files[0].file_name.as_str()), Some("guide.md"));
    assert_eq!(knowledge.state().knowledge_base_files.len(), 1);
    assert!(transport
        .requests()
        .iter()
        .filter(|request| request.path == "/api/list_files")
        .all(|request| request.query("knowledge_base_name").as_deref() == Some("manuals")));
}

#[test]
fn outage_keeps_the_last_good_listing() {
    let runtime = test_runtime();
    let dir = TempDir::new().expect("temp dir");
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(Method::GET, "/api/list_knowledge_bases", ok(json!(["samples", "manuals"])));
    transport.push(
        Method::GET,
        "/api/list_knowledge_bases",
        ScriptedResponse::transport_error("connection reset"),
    );
    transport.push(Method::GET, "/api/list_knowledge_bases", ok(json!([])));
    let ctx = context_in(dir.path(), &transport);
    let knowledge = ctx.knowledge();

    assert!(matches!(
        runtime.block_on(knowledge.fetch_knowledge_bases()),
        Fetched::Data(ref bases) if bases.len() == 2
    ));
    let failed = runtime.block_on(knowledge.refresh_knowledge_bases());
    assert!(matches!(failed, Fetched::Failed(ref message) if message.contains("connection reset")));
    assert_eq!(knowledge.state().knowledge_bases.len(), 2);

    assert_eq!(runtime.block_on(knowledge.refresh_knowledge_bases()), Fetched::Empty);
    assert!(knowledge.state().knowledge_bases.is_empty());
    assert!(!knowledge.loading());
}

#[test]
fn deleting_the_selected_base_clears_selection() {
    let runtime = test_runtime();
    let dir = TempDir::new().expect("temp dir");
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(Method::GET, "/api/list_files", ok(json!([{"file_name": "a.pdf"}])));
    transport.push(Method::POST, "/api/delete_knowledge_base", ok(Value::Null));
    transport.push(Method::GET, "/api/list_knowledge_bases", ok(json!(["samples"])));
    let ctx = context_in(dir.path(), &transport);

    runtime
        .block_on(ctx.use_knowledge_base("manuals"))
        .expect("select");
    let remaining = runtime.block_on(ctx.knowledge().delete_knowledge_base("manuals"));
    assert_eq!(remaining.data().map(Vec::len), Some(1));

    let state = ctx.knowledge().state();
    assert_eq!(state.current_knowledge_base, None);
    assert!(state.knowledge_base_files.is_empty());
    let deleted = transport
        .last_request("/api/delete_knowledge_base")
        .expect("delete request");
    assert_eq!(
        deleted.json_body(),
        Some(&json!({"knowledge_base_name": "manuals"}))
    );
}
