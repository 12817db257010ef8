use crate::api::ModelParams;
use crate::storage::LocalStorage;
use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

pub const SETTINGS_KEY: &str = "settings";

/// User preferences. Keys the client does not know about are kept in
/// `extra` and survive round trips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "Settings::default_kb_name")]
    pub kb_name: String,
    #[serde(default = "Settings::default_top_k")]
    pub top_k: u32,
    #[serde(default = "Settings::default_score_threshold")]
    pub score_threshold: f64,
    #[serde(default)]
    pub return_direct: bool,
    #[serde(default = "Settings::default_system_message")]
    pub system_message: String,
    #[serde(default = "Settings::default_temperature")]
    pub temperature: f64,
    #[serde(default = "Settings::default_top_p")]
    pub top_p: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            kb_name: Settings::default_kb_name(),
            top_k: Settings::default_top_k(),
            score_threshold: Settings::default_score_threshold(),
            return_direct: false,
            system_message: Settings::default_system_message(),
            temperature: Settings::default_temperature(),
            top_p: Settings::default_top_p(),
            extra: Map::new(),
        }
    }
}

impl Settings {
    fn default_kb_name() -> String {
        "samples".to_string()
    }

    fn default_top_k() -> u32 {
        3
    }

    fn default_score_threshold() -> f64 {
        1.0
    }

    fn default_system_message() -> String {
        "You are a helpful assistant. Answer using the knowledge base when it is relevant. Respond using markdown."
            .to_string()
    }

    fn default_temperature() -> f64 {
        0.8
    }

    fn default_top_p() -> f64 {
        1.0
    }

    pub fn model_params(&self) -> ModelParams {
        ModelParams {
            system_message: self.system_message.clone(),
            temperature: self.temperature,
            top_p: self.top_p,
        }
    }
}

/// Settings cache persisted wholesale under [`SETTINGS_KEY`] on every
/// mutation.
#[derive(Clone)]
pub struct SettingsStore {
    storage: LocalStorage,
    state: Arc<RwLock<Settings>>,
}

impl SettingsStore {
    pub fn load(storage: LocalStorage) -> Self {
        let settings = storage
            .get_json::<Settings>(SETTINGS_KEY)
            .unwrap_or_default();
        Self {
            storage,
            state: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn settings(&self) -> Settings {
        self.state.read().clone()
    }

    /// Shallow-merge `patch` over the current settings. A value of the wrong
    /// type for a known key leaves the settings untouched.
    pub fn update_setting(&self, patch: Map<String, Value>) -> Result<Settings> {
        let mut state = self.state.write();
        let mut merged = match serde_json::to_value(&*state)? {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        for (key, value) in patch {
            merged.insert(key, value);
        }
        let next: Settings =
            serde_json::from_value(Value::Object(merged)).context("invalid setting value")?;
        self.storage.set_json(SETTINGS_KEY, &next)?;
        *state = next.clone();
        debug!("settings updated");
        Ok(next)
    }

    pub fn reset_setting(&self) -> Result<()> {
        let mut state = self.state.write();
        self.storage.remove(SETTINGS_KEY)?;
        *state = Settings::default();
        Ok(())
    }

    pub fn set_kb_name(&self, kb_name: &str) -> Result<()> {
        self.apply(|settings| settings.kb_name = kb_name.to_owned())
    }

    pub fn set_top_k(&self, top_k: u32) -> Result<()> {
        self.apply(|settings| settings.top_k = top_k)
    }

    pub fn set_score_threshold(&self, score_threshold: f64) -> Result<()> {
        self.apply(|settings| settings.score_threshold = score_threshold)
    }

    pub fn set_return_direct(&self, return_direct: bool) -> Result<()> {
        self.apply(|settings| settings.return_direct = return_direct)
    }

    // The in-memory copy only changes once the new value is stored.
    fn apply(&self, change: impl FnOnce(&mut Settings)) -> Result<()> {
        let mut state = self.state.write();
        let mut next = state.clone();
        change(&mut next);
        if next == *state {
            return Ok(());
        }
        self.storage.set_json(SETTINGS_KEY, &next)?;
        *state = next;
        Ok(())
    }

    pub fn record_state(&self) -> Result<()> {
        let snapshot = self.state.read().clone();
        self.storage.set_json(SETTINGS_KEY, &snapshot)
    }
}
