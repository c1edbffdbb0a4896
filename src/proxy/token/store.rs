// Access-token cache with single-flight refresh and a proactive background
// scheduler. The store is the only writer to token entries.
use crate::constants::{
    OAUTH_TOKEN_URL, PROACTIVE_REFRESH_TICK_SECS, PROACTIVE_REFRESH_WINDOW_SECS,
    TOKEN_EXPIRY_SKEW_SECS,
};
use crate::error::{AppError, AppResult};
use crate::models::AccountSource;
use crate::proxy::token::loader;
use crate::proxy::token::pool::AccountPool;
use crate::proxy::token::types::PoolAccount;
use dashmap::DashMap;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct TokenEntry {
    pub access_token: String,
    pub expires_at_epoch_ms: i64,
}

#[derive(Debug, Deserialize)]
struct OauthTokenResponse {
    access_token: String,
    expires_in: i64,
}

fn env_first(keys: &[&str]) -> Option<String> {
    for k in keys {
        if let Ok(v) = std::env::var(k) {
            let t = v.trim();
            if !t.is_empty() {
                return Some(t.to_string());
            }
        }
    }
    None
}

fn oauth_client_id() -> AppResult<String> {
    env_first(&[
        "ANTIGRAVITY_PROXY_OAUTH_CLIENT_ID",
        "GOOGLE_OAUTH_CLIENT_ID",
    ])
    .ok_or_else(|| {
        AppError::Config(
            "Missing Google OAuth client_id. Set ANTIGRAVITY_PROXY_OAUTH_CLIENT_ID (or GOOGLE_OAUTH_CLIENT_ID)."
                .to_string(),
        )
    })
}

fn oauth_client_secret() -> Option<String> {
    env_first(&[
        "ANTIGRAVITY_PROXY_OAUTH_CLIENT_SECRET",
        "GOOGLE_OAUTH_CLIENT_SECRET",
    ])
}

pub struct TokenStore {
    http: reqwest::Client,
    data_dir: PathBuf,
    tokens: DashMap<String, TokenEntry>,
    // One refresh in flight per account; concurrent misses queue on the lock
    // and find a fresh cache entry when they acquire it.
    refresh_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    token_url: String,
}

impl TokenStore {
    pub fn new(data_dir: PathBuf) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(20))
            .timeout(std::time::Duration::from_secs(60))
            .user_agent(crate::constants::USER_AGENT.as_str())
            .build()
            .expect("failed to build token refresh client");
        Self {
            http,
            data_dir,
            tokens: DashMap::new(),
            refresh_locks: DashMap::new(),
            token_url: OAUTH_TOKEN_URL.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_token_url(data_dir: PathBuf, token_url: String) -> Self {
        let mut store = Self::new(data_dir);
        store.token_url = token_url;
        store
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn cached(&self, email: &str) -> Option<String> {
        let entry = self.tokens.get(email)?;
        if Self::now_ms() + TOKEN_EXPIRY_SKEW_SECS * 1000 < entry.expires_at_epoch_ms {
            Some(entry.access_token.clone())
        } else {
            None
        }
    }

    /// Cached token if still fresh, otherwise a refresh. At most one refresh
    /// per account is in flight; callers observing a miss share its result.
    pub async fn token_for(&self, account: &PoolAccount) -> AppResult<String> {
        if let Some(token) = self.cached(&account.email) {
            return Ok(token);
        }
        let lock = self
            .refresh_locks
            .entry(account.email.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;
        // Another caller may have refreshed while we queued.
        if let Some(token) = self.cached(&account.email) {
            return Ok(token);
        }
        self.refresh(account).await
    }

    pub fn invalidate(&self, email: &str) {
        if self.tokens.remove(email).is_some() {
            debug!("token cache invalidated for {}", email);
        }
    }

    /// Clear and re-fetch every OAuth account; re-read the legacy extractor
    /// token once, best effort. Returns (refreshed, failed).
    pub async fn force_refresh_all(&self, accounts: &[PoolAccount]) -> (usize, usize) {
        let mut refreshed = 0;
        let mut failed = 0;
        for account in accounts {
            if account.source != AccountSource::Oauth {
                continue;
            }
            self.invalidate(&account.email);
            match self.token_for(account).await {
                Ok(_) => refreshed += 1,
                Err(e) => {
                    warn!("forced refresh failed for {}: {}", account.email, e);
                    failed += 1;
                }
            }
        }
        match loader::read_legacy_token(&self.data_dir).await {
            Ok(legacy) => {
                for account in accounts {
                    if account.source == AccountSource::Legacy {
                        self.tokens.insert(
                            account.email.clone(),
                            TokenEntry {
                                access_token: legacy.access_token.clone(),
                                expires_at_epoch_ms: legacy.expires_at_epoch_ms,
                            },
                        );
                        refreshed += 1;
                    }
                }
            }
            Err(e) => debug!("legacy token refresh skipped: {}", e),
        }
        info!("token refresh sweep: {} refreshed, {} failed", refreshed, failed);
        (refreshed, failed)
    }

    // A failed refresh caches nothing; the next caller retries.
    async fn refresh(&self, account: &PoolAccount) -> AppResult<String> {
        let entry = match account.source {
            AccountSource::Oauth => {
                let refresh_token = account.refresh_token.as_deref().ok_or_else(|| {
                    AppError::Auth(format!("account {} has no refresh token", account.email))
                })?;
                self.refresh_oauth(&account.email, refresh_token).await?
            }
            AccountSource::Legacy => {
                let legacy = loader::read_legacy_token(&self.data_dir)
                    .await
                    .map_err(|e| AppError::Auth(format!("legacy token unavailable: {}", e)))?;
                TokenEntry {
                    access_token: legacy.access_token,
                    expires_at_epoch_ms: legacy.expires_at_epoch_ms,
                }
            }
        };
        let token = entry.access_token.clone();
        self.tokens.insert(account.email.clone(), entry);
        Ok(token)
    }

    async fn refresh_oauth(&self, email: &str, refresh_token: &str) -> AppResult<TokenEntry> {
        debug!("refreshing access token for {}", email);
        let client_id = oauth_client_id()?;
        let client_secret = oauth_client_secret();
        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", client_id.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        if let Some(secret) = client_secret.as_deref() {
            form.push(("client_secret", secret));
        }
        let response = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Auth(format!(
                "token refresh for {} returned {}: {}",
                email,
                status,
                truncate(&body, 200)
            )));
        }

        let parsed: OauthTokenResponse = response.json().await?;
        Ok(TokenEntry {
            access_token: parsed.access_token,
            expires_at_epoch_ms: Self::now_ms() + parsed.expires_in * 1000,
        })
    }

    /// Proactive scheduler: wakes every minute and refreshes tokens expiring
    /// within five minutes. Stops when the cancellation token fires.
    pub fn spawn_refresh_scheduler(
        self: Arc<Self>,
        pool: Arc<AccountPool>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = self;
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(std::time::Duration::from_secs(PROACTIVE_REFRESH_TICK_SECS));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("proactive token scheduler stopped");
                        return;
                    }
                    _ = tick.tick() => {}
                }
                for account in pool.pool_accounts().await {
                    if account.source != AccountSource::Oauth {
                        continue;
                    }
                    let expiring = store
                        .tokens
                        .get(&account.email)
                        .map(|e| {
                            e.expires_at_epoch_ms - Self::now_ms()
                                < PROACTIVE_REFRESH_WINDOW_SECS * 1000
                        })
                        .unwrap_or(false);
                    if !expiring {
                        continue;
                    }
                    store.invalidate(&account.email);
                    if let Err(e) = store.token_for(&account).await {
                        warn!("proactive refresh failed for {}: {}", account.email, e);
                    } else {
                        debug!("proactively refreshed token for {}", account.email);
                    }
                }
            }
        })
    }

    #[cfg(test)]
    pub fn insert_for_test(&self, email: &str, entry: TokenEntry) {
        self.tokens.insert(email.to_string(), entry);
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
