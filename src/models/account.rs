use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountSource {
    Oauth,
    Legacy,
}

impl Default for AccountSource {
    fn default() -> Self {
        Self::Oauth
    }
}

/// Per-model cooldown record. Cleared when `now >= reset_epoch_ms`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelRateLimit {
    pub is_rate_limited: bool,
    pub reset_epoch_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelQuota {
    pub remaining_fraction: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_epoch_ms: Option<i64>,
}

impl Default for ModelQuota {
    fn default() -> Self {
        Self {
            remaining_fraction: 1.0,
            reset_epoch_ms: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuotaSnapshot {
    pub models: HashMap<String, ModelQuota>,
    pub last_checked: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Subscription {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

/// One upstream identity from the account store. Loaded at startup, mutated by
/// the pool on use / rate-limit mark / refresh, persisted asynchronously.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Account {
    pub email: String,
    pub source: AccountSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub enabled: bool,
    pub is_invalid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    pub last_used: i64,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub model_rate_limits: HashMap<String, ModelRateLimit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<Subscription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaSnapshot>,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            email: String::new(),
            source: AccountSource::Oauth,
            refresh_token: None,
            project_id: None,
            enabled: true,
            is_invalid: false,
            invalid_reason: None,
            last_used: 0,
            model_rate_limits: HashMap::new(),
            subscription: None,
            quota: None,
        }
    }
}

impl Account {
    pub fn new(email: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            refresh_token: Some(refresh_token.into()),
            ..Default::default()
        }
    }

    pub fn update_last_used(&mut self) {
        self.last_used = chrono::Utc::now().timestamp_millis();
    }

    /// Effective project id: top-level field first, subscription fallback.
    pub fn effective_project_id(&self) -> Option<&str> {
        self.project_id
            .as_deref()
            .or_else(|| self.subscription.as_ref()?.project_id.as_deref())
    }

    /// Masked identity for public surfaces: `ab***@example.com`.
    pub fn display_name(&self) -> String {
        mask_email(&self.email)
    }
}

/// Mask an email for anything that leaves the process.
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((user, domain)) => {
            let visible: String = user.chars().take(2).collect();
            format!("{}***@{}", visible, domain)
        }
        None => "***".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_masks_the_local_part() {
        let acc = Account::new("alice@example.com", "rt");
        assert_eq!(acc.display_name(), "al***@example.com");
    }

    #[test]
    fn display_name_tolerates_opaque_ids() {
        let acc = Account::new("not-an-email", "rt");
        assert_eq!(acc.display_name(), "***");
    }

    #[test]
    fn account_deserializes_with_missing_fields() {
        let acc: Account =
            serde_json::from_str(r#"{"email":"a@b.c","refreshToken":"rt"}"#).unwrap();
        assert!(acc.enabled);
        assert!(!acc.is_invalid);
        assert_eq!(acc.source, AccountSource::Oauth);
        assert_eq!(acc.refresh_token.as_deref(), Some("rt"));
    }

    #[test]
    fn effective_project_id_prefers_top_level() {
        let mut acc = Account::new("a@b.c", "rt");
        acc.subscription = Some(Subscription {
            tier: Some("pro".into()),
            project_id: Some("sub-project".into()),
        });
        assert_eq!(acc.effective_project_id(), Some("sub-project"));
        acc.project_id = Some("top-project".into());
        assert_eq!(acc.effective_project_id(), Some("top-project"));
    }
}
