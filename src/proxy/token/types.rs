use crate::models::{Account, AccountSource};

/// Immutable snapshot of one account handed out by the pool. The pool keeps
/// the authoritative `Account`; callers only ever see copies.
#[derive(Debug, Clone)]
pub struct PoolAccount {
    pub email: String,
    pub source: AccountSource,
    pub refresh_token: Option<String>,
    pub project_id: Option<String>,
    pub subscription_tier: Option<String>,
    pub last_used: i64,
}

impl From<&Account> for PoolAccount {
    fn from(account: &Account) -> Self {
        Self {
            email: account.email.clone(),
            source: account.source,
            refresh_token: account.refresh_token.clone(),
            project_id: account.effective_project_id().map(|s| s.to_string()),
            subscription_tier: account
                .subscription
                .as_ref()
                .and_then(|s| s.tier.clone()),
            last_used: account.last_used,
        }
    }
}
