use crate::constants::DEFAULT_COOLDOWN_SECS;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateLimitReason {
    QuotaExhausted,
    RateLimitExceeded,
    ServerError,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    pub reset_time: SystemTime,
    pub retry_after_sec: u64,
    pub detected_at: SystemTime,
    pub reason: RateLimitReason,
    pub model: Option<String>,
}

// Failure counts expire after an hour without a new failure.
const FAILURE_COUNT_EXPIRY_SECONDS: u64 = 3600;
// Backoff ladder used when the upstream gives no reset hint repeatedly.
const BACKOFF_STEPS: &[u64] = &[60, 300, 1800, 7200];

static DURATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:(\d+)h)?\s*(?:(\d+)m)?\s*(?:(\d+(?:\.\d+)?)s)?").expect("duration regex")
});

static QUOTA_RESET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)quota will reset (?:after|in)\s+([0-9hms\s\.]+)").expect("quota reset regex")
});

/// Per-(account, model) cooldown tracker. Keys are `email` for account-wide
/// locks and `email:model` for model-scoped locks.
pub struct RateLimitTracker {
    limits: DashMap<String, RateLimitInfo>,
    failure_counts: DashMap<String, (u32, SystemTime)>,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            limits: DashMap::new(),
            failure_counts: DashMap::new(),
        }
    }

    fn limit_key(account: &str, model: Option<&str>) -> String {
        match model {
            Some(m) if !m.is_empty() => format!("{}:{}", account, m),
            _ => account.to_string(),
        }
    }

    /// Remaining wait in seconds before `account` may serve `model` again.
    /// Checks the account-wide lock first, then the model-scoped one.
    pub fn remaining_wait(&self, account: &str, model: Option<&str>) -> u64 {
        let now = SystemTime::now();
        let mut wait = 0u64;
        if let Some(info) = self.limits.get(account) {
            if info.reset_time > now {
                wait = info
                    .reset_time
                    .duration_since(now)
                    .unwrap_or_default()
                    .as_secs();
            }
        }
        if let Some(m) = model {
            let key = Self::limit_key(account, Some(m));
            if let Some(info) = self.limits.get(&key) {
                if info.reset_time > now {
                    let model_wait = info
                        .reset_time
                        .duration_since(now)
                        .unwrap_or_default()
                        .as_secs();
                    wait = wait.max(model_wait);
                }
            }
        }
        wait
    }

    pub fn is_rate_limited(&self, account: &str, model: Option<&str>) -> bool {
        self.remaining_wait(account, model) > 0
    }

    /// Reset the failure ladder and drop the account-wide lock after a
    /// successful request. Model-scoped locks expire on their own.
    pub fn mark_success(&self, account: &str) {
        if self.failure_counts.remove(account).is_some() {
            tracing::debug!("account {} recovered, failure count reset", account);
        }
        self.limits.remove(account);
    }

    /// Lock `account` (optionally model-scoped) until `reset_time`.
    pub fn set_lockout_until(
        &self,
        account: &str,
        reset_time: SystemTime,
        reason: RateLimitReason,
        model: Option<String>,
    ) {
        let now = SystemTime::now();
        let retry_sec = reset_time
            .duration_since(now)
            .map(|d| d.as_secs())
            .unwrap_or(DEFAULT_COOLDOWN_SECS);
        let key = Self::limit_key(account, model.as_deref());
        self.limits.insert(
            key,
            RateLimitInfo {
                reset_time,
                retry_after_sec: retry_sec,
                detected_at: now,
                reason,
                model: model.clone(),
            },
        );
        match &model {
            Some(m) => tracing::info!(
                "account {} model {} locked for {}s ({:?})",
                account,
                m,
                retry_sec,
                reason
            ),
            None => tracing::info!("account {} locked for {}s ({:?})", account, retry_sec, reason),
        }
    }

    /// Classify a 429/5xx and register the cooldown. Returns the recorded
    /// info. Reset time is taken from, in order: the `Retry-After` header
    /// (seconds or HTTP date), the vendor `quota will reset after <Nh Nm Ns>`
    /// body text, then the backoff ladder keyed by consecutive failures.
    pub fn parse_from_error(
        &self,
        account: &str,
        status: u16,
        retry_after_header: Option<&str>,
        body: &str,
        model: Option<String>,
    ) -> Option<RateLimitInfo> {
        if status != 429 && status != 500 && status != 503 && status != 529 {
            return None;
        }

        let reason = if status == 429 {
            parse_rate_limit_reason(body)
        } else {
            RateLimitReason::ServerError
        };

        let mut retry_after_sec = retry_after_header.and_then(parse_retry_after);
        if retry_after_sec.is_none() {
            retry_after_sec = parse_reset_from_body(body);
        }

        let retry_sec = match retry_after_sec {
            // Floor of 2s guards against hot retry loops on tiny hints.
            Some(s) => s.max(2),
            None => match reason {
                RateLimitReason::ServerError => 8,
                RateLimitReason::RateLimitExceeded => 5,
                _ => {
                    let failure_count = self.bump_failure_count(account);
                    let index = (failure_count as usize).saturating_sub(1);
                    *BACKOFF_STEPS
                        .get(index)
                        .unwrap_or(&BACKOFF_STEPS[BACKOFF_STEPS.len() - 1])
                        .max(&DEFAULT_COOLDOWN_SECS)
                }
            },
        };

        let info = RateLimitInfo {
            reset_time: SystemTime::now() + Duration::from_secs(retry_sec),
            retry_after_sec: retry_sec,
            detected_at: SystemTime::now(),
            reason,
            model: model.clone(),
        };

        // Only quota exhaustion is isolated per model; TPM/RPM and 5xx affect
        // the whole account.
        let key = if matches!(reason, RateLimitReason::QuotaExhausted) && model.is_some() {
            Self::limit_key(account, model.as_deref())
        } else {
            account.to_string()
        };
        self.limits.insert(key, info.clone());

        tracing::warn!(
            "account {} [{}] limited: {:?}, reset in {}s",
            account,
            status,
            reason,
            retry_sec
        );
        Some(info)
    }

    fn bump_failure_count(&self, account: &str) -> u32 {
        let now = SystemTime::now();
        let mut entry = self
            .failure_counts
            .entry(account.to_string())
            .or_insert((0, now));
        let elapsed = now.duration_since(entry.1).unwrap_or_default().as_secs();
        if elapsed > FAILURE_COUNT_EXPIRY_SECONDS {
            *entry = (0, now);
        }
        entry.0 += 1;
        entry.1 = now;
        entry.0
    }

    pub fn get(&self, key: &str) -> Option<RateLimitInfo> {
        self.limits.get(key).map(|r| r.clone())
    }

    /// Drop expired records. Also runs from the background janitor.
    pub fn cleanup_expired(&self) -> usize {
        let now = SystemTime::now();
        let mut count = 0;
        self.limits.retain(|_k, v| {
            if v.reset_time <= now {
                count += 1;
                false
            } else {
                true
            }
        });
        if count > 0 {
            tracing::debug!("cleared {} expired rate limit record(s)", count);
        }
        count
    }

    pub fn clear(&self, account: &str) -> bool {
        let mut removed = self.limits.remove(account).is_some();
        let prefix = format!("{}:", account);
        let keys: Vec<String> = self
            .limits
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            removed |= self.limits.remove(&key).is_some();
        }
        removed
    }

    /// Optimistic reset: when every account looks limited the accumulated
    /// state is treated as stale and cleared for a fresh probe.
    pub fn clear_all(&self) {
        let count = self.limits.len();
        self.limits.clear();
        tracing::warn!("optimistic reset: cleared all {} rate limit record(s)", count);
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_rate_limit_reason(body: &str) -> RateLimitReason {
    let trimmed = body.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
            if let Some(reason_str) = json
                .get("error")
                .and_then(|e| e.get("details"))
                .and_then(|d| d.as_array())
                .and_then(|a| a.first())
                .and_then(|o| o.get("reason"))
                .and_then(|v| v.as_str())
            {
                return match reason_str {
                    "QUOTA_EXHAUSTED" => RateLimitReason::QuotaExhausted,
                    "RATE_LIMIT_EXCEEDED" => RateLimitReason::RateLimitExceeded,
                    _ => RateLimitReason::Unknown,
                };
            }
        }
    }
    let lower = body.to_lowercase();
    if lower.contains("per minute") || lower.contains("rate limit") {
        RateLimitReason::RateLimitExceeded
    } else if lower.contains("exhausted") || lower.contains("quota") {
        RateLimitReason::QuotaExhausted
    } else {
        RateLimitReason::Unknown
    }
}

/// `Retry-After` accepts either delta-seconds or an HTTP date.
pub(crate) fn parse_retry_after(value: &str) -> Option<u64> {
    let trimmed = value.trim();
    if let Ok(seconds) = trimmed.parse::<u64>() {
        return Some(seconds);
    }
    let when = chrono::DateTime::parse_from_rfc2822(trimmed).ok()?;
    let delta = when.timestamp() - chrono::Utc::now().timestamp();
    if delta > 0 {
        Some(delta as u64)
    } else {
        None
    }
}

/// `"quota will reset after 1h 2m 3s"` and similar vendor phrasing.
pub(crate) fn parse_reset_from_body(body: &str) -> Option<u64> {
    let caps = QUOTA_RESET_RE.captures(body)?;
    parse_duration_string(caps.get(1)?.as_str().trim())
}

fn parse_duration_string(s: &str) -> Option<u64> {
    let caps = DURATION_RE.captures(s)?;
    let hours = caps
        .get(1)
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .unwrap_or(0);
    let minutes = caps
        .get(2)
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .unwrap_or(0);
    let seconds = caps
        .get(3)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .unwrap_or(0.0);
    let total = hours * 3600 + minutes * 60 + seconds.ceil() as u64;
    if total == 0 {
        None
    } else {
        Some(total)
    }
}
