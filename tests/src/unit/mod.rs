mod knowledge_tests;
mod session_tests;
mod settings_tests;

use kbchat_core::testing::ScriptedTransport;
use kbchat_core::{AppContext, ClientConfig, LocalStorage};
use std::path::Path;
use std::sync::Arc;

pub(crate) fn test_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

/// A context whose storage lives in `dir`, so a second call simulates a
/// restart of the client.
pub(crate) fn context_in(dir: &Path, transport: &Arc<ScriptedTransport>) -> AppContext {
    let config = ClientConfig::for_base_url("http://kb.test")
        .expect("config")
        .with_data_dir(dir);
    let storage = LocalStorage::open(dir).expect("storage");
    AppContext::with_transport(config, storage, transport.clone())
}
