use crate::constants::{DEFAULT_LOCAL_LLM_URL, DEFAULT_PORT};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, warn};

/// Runtime configuration assembled from environment variables plus the
/// operator config file at `~/.config/antigravity-proxy/config.json`.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub debug: bool,
    pub fallback_enabled: bool,
    pub local_llm_url: String,
    pub local_llm_key: Option<String>,
    /// alias -> canonical model rewrite, applied before validation.
    pub model_mapping: HashMap<String, String>,
    /// model -> substitute dispatched when the whole pool is exhausted.
    pub fallback_models: HashMap<String, String>,
    /// Account store directory (`~/.antigravity-claude-proxy/`).
    pub data_dir: PathBuf,
}

fn parse_env_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| match p.trim().parse::<u16>() {
                Ok(v) if v > 0 => Some(v),
                _ => {
                    warn!("ignoring invalid PORT value: {}", p);
                    None
                }
            })
            .unwrap_or(DEFAULT_PORT);

        let debug = std::env::var("DEBUG")
            .ok()
            .and_then(|v| parse_env_bool(&v))
            .unwrap_or(false);

        let fallback_enabled = std::env::var("FALLBACK")
            .ok()
            .and_then(|v| parse_env_bool(&v))
            .unwrap_or(false);

        let local_llm_url = std::env::var("LOCAL_LLM_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOCAL_LLM_URL.to_string());

        let local_llm_key = std::env::var("LOCAL_LLM_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".antigravity-claude-proxy");

        let (model_mapping, fallback_models) = load_operator_config();

        Self {
            port,
            debug,
            fallback_enabled,
            local_llm_url,
            local_llm_key,
            model_mapping,
            fallback_models,
            data_dir,
        }
    }

    pub fn fallback_model_for(&self, model: &str) -> Option<&str> {
        self.fallback_models.get(model).map(|s| s.as_str())
    }
}

fn operator_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("antigravity-proxy")
        .join("config.json")
}

/// Parse the operator config file. The mapping table uses the nested
/// `{"modelMapping": {"alias": {"mapping": "canonical"}}}` shape; the optional
/// `fallbackModels` table is flat. Missing or malformed files are non-fatal.
fn load_operator_config() -> (HashMap<String, String>, HashMap<String, String>) {
    let path = operator_config_path();
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(_) => return (HashMap::new(), HashMap::new()),
    };

    let parsed: serde_json::Value = match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            warn!("failed to parse {:?}: {}", path, e);
            return (HashMap::new(), HashMap::new());
        }
    };

    let mut mapping = HashMap::new();
    if let Some(table) = parsed.get("modelMapping").and_then(|v| v.as_object()) {
        for (alias, entry) in table {
            if let Some(canonical) = entry.get("mapping").and_then(|v| v.as_str()) {
                mapping.insert(alias.clone(), canonical.to_string());
            }
        }
    }

    let mut fallbacks = HashMap::new();
    if let Some(table) = parsed.get("fallbackModels").and_then(|v| v.as_object()) {
        for (model, target) in table {
            if let Some(target) = target.as_str() {
                fallbacks.insert(model.clone(), target.to_string());
            }
        }
    }

    if !mapping.is_empty() {
        info!("loaded {} model mapping(s) from {:?}", mapping.len(), path);
    }

    (mapping, fallbacks)
}
