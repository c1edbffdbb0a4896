// Account rotation and per-(account, model) cooldown accounting. All pool
// mutations go through one async Mutex; callers only ever hold snapshots.
use crate::constants::DEFAULT_COOLDOWN_SECS;
use crate::error::AppResult;
use crate::models::{Account, ModelRateLimit};
use crate::proxy::rate_limit::{RateLimitReason, RateLimitTracker};
use crate::proxy::token::loader;
use crate::proxy::token::types::PoolAccount;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Last successful (account, model) binding. Advisory only: it maximizes
/// upstream prompt-cache reuse and is dropped on any failure attributed to
/// the pair.
#[derive(Debug, Clone, PartialEq)]
pub struct StickyBinding {
    pub email: String,
    pub model: String,
}

/// What `pick_next` found for a model.
#[derive(Debug, Clone)]
pub enum PickOutcome {
    /// An eligible account, ready to use.
    Account(PoolAccount),
    /// Everyone is cooling down; the shortest wait in milliseconds.
    Wait(u64),
    /// No usable identity exists at all.
    Exhausted,
}

pub struct AccountPool {
    accounts: tokio::sync::Mutex<Vec<Account>>,
    rate_limits: Arc<RateLimitTracker>,
    sticky: std::sync::Mutex<Option<StickyBinding>>,
    data_dir: PathBuf,
}

impl AccountPool {
    pub async fn load(data_dir: PathBuf) -> AppResult<Self> {
        let accounts = loader::load_accounts(&data_dir).await?;
        info!("account pool loaded with {} account(s)", accounts.len());
        Ok(Self::new(accounts, data_dir))
    }

    pub fn new(accounts: Vec<Account>, data_dir: PathBuf) -> Self {
        Self {
            accounts: tokio::sync::Mutex::new(accounts),
            rate_limits: Arc::new(RateLimitTracker::new()),
            sticky: std::sync::Mutex::new(None),
            data_dir,
        }
    }

    pub fn rate_limits(&self) -> Arc<RateLimitTracker> {
        Arc::clone(&self.rate_limits)
    }

    pub async fn len(&self) -> usize {
        self.accounts.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.accounts.lock().await.is_empty()
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn eligible(account: &Account) -> bool {
        account.enabled && !account.is_invalid
    }

    fn record_blocked(account: &Account, model: &str, now_ms: i64) -> bool {
        account
            .model_rate_limits
            .get(model)
            .map(|r| r.is_rate_limited && now_ms < r.reset_epoch_ms)
            .unwrap_or(false)
    }

    /// Select an account for `model`.
    ///
    /// Invalid/disabled accounts are dropped, expired cooldown records are
    /// cleared on the fly, the sticky binding wins when still eligible, and
    /// the rest rotate by least-recent use with a stable email tiebreak.
    pub async fn pick_next(&self, model: &str) -> PickOutcome {
        let mut accounts = self.accounts.lock().await;
        let now_ms = Self::now_ms();

        // Clear expired per-model records while we hold the lock.
        for account in accounts.iter_mut() {
            account
                .model_rate_limits
                .retain(|_, r| r.is_rate_limited && now_ms < r.reset_epoch_ms);
        }

        let candidates: Vec<&Account> = accounts
            .iter()
            .filter(|a| Self::eligible(a))
            .filter(|a| !Self::record_blocked(a, model, now_ms))
            .filter(|a| !self.rate_limits.is_rate_limited(&a.email, Some(model)))
            .collect();

        if candidates.is_empty() {
            let waits: Vec<u64> = accounts
                .iter()
                .filter(|a| Self::eligible(a))
                .map(|a| {
                    let tracker_wait = self.rate_limits.remaining_wait(&a.email, Some(model));
                    let record_wait = a
                        .model_rate_limits
                        .get(model)
                        .map(|r| ((r.reset_epoch_ms - now_ms).max(0) as u64) / 1000)
                        .unwrap_or(0);
                    tracker_wait.max(record_wait)
                })
                .collect();
            return match waits.iter().min() {
                Some(min_wait) => PickOutcome::Wait(min_wait * 1000),
                None => PickOutcome::Exhausted,
            };
        }

        let sticky = self.sticky.lock().expect("sticky lock").clone();
        if let Some(binding) = sticky {
            if binding.model == model {
                if let Some(bound) = candidates.iter().find(|a| a.email == binding.email) {
                    debug!("sticky selection: reusing {} for {}", bound.email, model);
                    return PickOutcome::Account(PoolAccount::from(*bound));
                }
            }
        }

        let selected = candidates
            .iter()
            .min_by(|a, b| a.last_used.cmp(&b.last_used).then(a.email.cmp(&b.email)))
            .expect("non-empty candidates");
        debug!("rotation selection: {} for {}", selected.email, model);
        PickOutcome::Account(PoolAccount::from(*selected))
    }

    /// Register a cooldown for `(email, model)`. A missing reset falls back
    /// to the conservative default. Drops a matching sticky binding and
    /// mirrors the record into the persisted account state.
    pub async fn mark_rate_limited(&self, email: &str, model: &str, reset_ms: Option<u64>) {
        let reset_ms = reset_ms.unwrap_or(DEFAULT_COOLDOWN_SECS * 1000);
        self.rate_limits.set_lockout_until(
            email,
            SystemTime::now() + Duration::from_millis(reset_ms),
            RateLimitReason::QuotaExhausted,
            Some(model.to_string()),
        );
        self.invalidate_sticky(email, model);

        let mut accounts = self.accounts.lock().await;
        if let Some(account) = accounts.iter_mut().find(|a| a.email == email) {
            account.model_rate_limits.insert(
                model.to_string(),
                ModelRateLimit {
                    is_rate_limited: true,
                    reset_epoch_ms: Self::now_ms() + reset_ms as i64,
                },
            );
        }
        loader::persist_accounts(&self.data_dir, accounts.clone());
    }

    /// Optimistic retry: accumulated limit state is stale, allow one fresh
    /// probe across the whole pool.
    pub async fn reset_all_rate_limits(&self) {
        self.rate_limits.clear_all();
        let mut accounts = self.accounts.lock().await;
        for account in accounts.iter_mut() {
            account.model_rate_limits.clear();
        }
        loader::persist_accounts(&self.data_dir, accounts.clone());
    }

    /// Record a successful call: refresh `last_used`, reset the failure
    /// ladder, and remember the pair as the sticky binding.
    pub async fn mark_success(&self, email: &str, model: &str) {
        self.rate_limits.mark_success(email);
        {
            let mut sticky = self.sticky.lock().expect("sticky lock");
            *sticky = Some(StickyBinding {
                email: email.to_string(),
                model: model.to_string(),
            });
        }
        let mut accounts = self.accounts.lock().await;
        if let Some(account) = accounts.iter_mut().find(|a| a.email == email) {
            account.update_last_used();
        }
        loader::persist_accounts(&self.data_dir, accounts.clone());
    }

    pub fn invalidate_sticky(&self, email: &str, model: &str) {
        let mut sticky = self.sticky.lock().expect("sticky lock");
        if sticky
            .as_ref()
            .map(|b| b.email == email && b.model == model)
            .unwrap_or(false)
        {
            debug!("sticky binding dropped for {} / {}", email, model);
            *sticky = None;
        }
    }

    #[cfg(test)]
    pub fn sticky_binding(&self) -> Option<StickyBinding> {
        self.sticky.lock().expect("sticky lock").clone()
    }

    /// Take an account out of rotation permanently (revoked refresh token,
    /// upstream 403 on every endpoint).
    pub async fn mark_invalid(&self, email: &str, reason: &str) {
        let mut accounts = self.accounts.lock().await;
        if let Some(account) = accounts.iter_mut().find(|a| a.email == email) {
            account.is_invalid = true;
            account.invalid_reason = Some(reason.to_string());
            warn!("account {} marked invalid: {}", email, reason);
        }
        loader::persist_accounts(&self.data_dir, accounts.clone());
    }

    pub async fn project_id_for(&self, email: &str) -> Option<String> {
        let accounts = self.accounts.lock().await;
        accounts
            .iter()
            .find(|a| a.email == email)
            .and_then(|a| a.effective_project_id().map(|s| s.to_string()))
    }

    pub async fn set_project_id(&self, email: &str, project_id: &str) {
        let mut accounts = self.accounts.lock().await;
        if let Some(account) = accounts.iter_mut().find(|a| a.email == email) {
            account.project_id = Some(project_id.to_string());
        }
        loader::persist_accounts(&self.data_dir, accounts.clone());
    }

    /// Drop the cached project binding after an UNAUTHENTICATED response.
    pub async fn invalidate_project(&self, email: &str) {
        let mut accounts = self.accounts.lock().await;
        if let Some(account) = accounts.iter_mut().find(|a| a.email == email) {
            account.project_id = None;
        }
    }

    /// Snapshot for the token store and the health surface.
    pub async fn pool_accounts(&self) -> Vec<PoolAccount> {
        self.accounts.lock().await.iter().map(PoolAccount::from).collect()
    }

    /// Full account snapshot (masked by the caller before leaving the
    /// process).
    pub async fn snapshot(&self) -> Vec<Account> {
        self.accounts.lock().await.clone()
    }
}
