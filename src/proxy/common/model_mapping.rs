// Model name classification and alias rewriting.
use std::collections::HashMap;

/// Where a request goes once its model name is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRoute {
    /// OpenAI-compatible endpoint on this machine.
    LocalGateway,
    /// Cloud-Code pool behind the account rotation.
    CloudCode,
}

pub const LOCAL_PREFIXES: &[&str] = &["local-", "gemma-"];

pub const CLOUD_PREFIXES: &[&str] = &[
    "claude-",
    "gemini-",
    "gpt-os-",
    "gpt-4-",
    "lmstudio-",
    "deepseek-",
    "qwen-",
];

/// Canonical model ids advertised by `/v1/models`.
pub const KNOWN_MODELS: &[&str] = &[
    "claude-sonnet-4-5",
    "claude-sonnet-4-5-thinking",
    "claude-opus-4-5",
    "claude-opus-4-5-thinking",
    "claude-haiku-4-5",
    "gemini-3-flash",
    "gemini-3-pro",
    "gemini-3-pro-high",
];

/// Rewrite an alias to its canonical model id. Transparent to callers;
/// observable only via logs.
pub fn apply_model_mapping(model: &str, mapping: &HashMap<String, String>) -> String {
    match mapping.get(model) {
        Some(canonical) => {
            tracing::info!("model mapping: {} -> {}", model, canonical);
            canonical.clone()
        }
        None => model.to_string(),
    }
}

/// Classify a (post-mapping) model name by prefix, case-insensitively.
/// Returns `None` when no allowed prefix matches.
pub fn classify_model(model: &str) -> Option<ModelRoute> {
    let lower = model.to_ascii_lowercase();
    if LOCAL_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        return Some(ModelRoute::LocalGateway);
    }
    if CLOUD_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        return Some(ModelRoute::CloudCode);
    }
    None
}

pub fn is_claude_model(model: &str) -> bool {
    model.to_ascii_lowercase().starts_with("claude-")
}

/// Model ids for the catalog endpoint: canonical ids plus configured aliases.
pub fn catalog_models(mapping: &HashMap<String, String>) -> Vec<String> {
    let mut ids: Vec<String> = KNOWN_MODELS.iter().map(|m| (*m).to_string()).collect();
    for alias in mapping.keys() {
        if !ids.iter().any(|m| m == alias) {
            ids.push(alias.clone());
        }
    }
    ids.sort();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_prefixes_route_to_the_gateway() {
        assert_eq!(classify_model("local-gemma"), Some(ModelRoute::LocalGateway));
        assert_eq!(classify_model("gemma-2-9b"), Some(ModelRoute::LocalGateway));
        assert_eq!(classify_model("LOCAL-anything"), Some(ModelRoute::LocalGateway));
    }

    #[test]
    fn cloud_prefixes_route_to_the_pool() {
        for model in [
            "claude-3-5-sonnet",
            "gemini-3-pro",
            "gpt-os-120b",
            "gpt-4-turbo",
            "lmstudio-llama",
            "deepseek-r1",
            "qwen-coder",
        ] {
            assert_eq!(classify_model(model), Some(ModelRoute::CloudCode), "{}", model);
        }
    }

    #[test]
    fn unknown_prefixes_are_rejected() {
        assert_eq!(classify_model("gpt-5"), None);
        assert_eq!(classify_model("mistral-large"), None);
        assert_eq!(classify_model(""), None);
    }

    #[test]
    fn alias_rewrite_is_exact_match() {
        let mut mapping = HashMap::new();
        mapping.insert(
            "claude-3-haiku-20240307".to_string(),
            "gemini-pro".to_string(),
        );
        assert_eq!(
            apply_model_mapping("claude-3-haiku-20240307", &mapping),
            "gemini-pro"
        );
        assert_eq!(apply_model_mapping("claude-3-haiku", &mapping), "claude-3-haiku");
    }

    #[test]
    fn catalog_includes_aliases_once() {
        let mut mapping = HashMap::new();
        mapping.insert("my-alias".to_string(), "gemini-3-pro".to_string());
        mapping.insert("claude-sonnet-4-5".to_string(), "gemini-3-pro".to_string());
        let ids = catalog_models(&mapping);
        assert!(ids.contains(&"my-alias".to_string()));
        assert_eq!(
            ids.iter().filter(|m| m.as_str() == "claude-sonnet-4-5").count(),
            1
        );
    }
}
