// Operational surface: /health, /account-limits, /refresh-token. Emails are
// masked before anything leaves the process.
use crate::proxy::state::AppState;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;

pub async fn health(State(state): State<AppState>) -> Response {
    let accounts = state.pool.snapshot().await;
    let now_ms = chrono::Utc::now().timestamp_millis();
    let rate_limits = state.pool.rate_limits();

    let mut ok = 0usize;
    let mut limited = 0usize;
    let mut invalid = 0usize;
    let mut disabled = 0usize;
    let summaries: Vec<_> = accounts
        .iter()
        .map(|account| {
            let state_label = if account.is_invalid {
                invalid += 1;
                "invalid"
            } else if !account.enabled {
                disabled += 1;
                "disabled"
            } else if account
                .model_rate_limits
                .values()
                .any(|r| r.is_rate_limited && now_ms < r.reset_epoch_ms)
                || rate_limits.is_rate_limited(&account.email, None)
            {
                limited += 1;
                "rate_limited"
            } else {
                ok += 1;
                "ok"
            };
            json!({
                "account": account.display_name(),
                "source": account.source,
                "state": state_label,
                "subscriptionTier": account.subscription.as_ref().and_then(|s| s.tier.clone()),
            })
        })
        .collect();

    Json(json!({
        "status": if ok > 0 { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "accounts": {
            "total": accounts.len(),
            "ok": ok,
            "rateLimited": limited,
            "invalid": invalid,
            "disabled": disabled,
        },
        "accountSummaries": summaries,
    }))
    .into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitsQuery {
    #[serde(default)]
    pub format: Option<String>,
}

pub async fn account_limits(
    State(state): State<AppState>,
    Query(query): Query<LimitsQuery>,
) -> Response {
    let accounts = state.pool.snapshot().await;
    let now_ms = chrono::Utc::now().timestamp_millis();

    if query.format.as_deref() == Some("table") {
        return (
            [("Content-Type", "text/plain; charset=utf-8")],
            render_table(&accounts, now_ms),
        )
            .into_response();
    }

    let rows: Vec<_> = accounts
        .iter()
        .map(|account| {
            let quotas: Vec<_> = account
                .quota
                .as_ref()
                .map(|q| {
                    q.models
                        .iter()
                        .map(|(model, quota)| {
                            json!({
                                "model": model,
                                "remainingFraction": quota.remaining_fraction,
                                "resetEpochMs": quota.reset_epoch_ms,
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            let limits: Vec<_> = account
                .model_rate_limits
                .iter()
                .filter(|(_, r)| r.is_rate_limited && now_ms < r.reset_epoch_ms)
                .map(|(model, r)| {
                    json!({
                        "model": model,
                        "resetEpochMs": r.reset_epoch_ms,
                        "resetInSeconds": (r.reset_epoch_ms - now_ms) / 1000,
                    })
                })
                .collect();
            json!({
                "account": account.display_name(),
                "quota": quotas,
                "rateLimits": limits,
                "lastChecked": account.quota.as_ref().map(|q| q.last_checked),
            })
        })
        .collect();

    Json(json!({ "accounts": rows })).into_response()
}

fn render_table(accounts: &[crate::models::Account], now_ms: i64) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{:<28} {:<34} {:>10} {:>12}\n",
        "ACCOUNT", "MODEL", "REMAINING", "RESET"
    ));
    out.push_str(&"-".repeat(88));
    out.push('\n');
    for account in accounts {
        let name = account.display_name();
        let mut wrote_row = false;
        if let Some(quota) = &account.quota {
            let mut models: Vec<_> = quota.models.iter().collect();
            models.sort_by(|a, b| a.0.cmp(b.0));
            for (model, entry) in models {
                let limited = account
                    .model_rate_limits
                    .get(model)
                    .filter(|r| r.is_rate_limited && now_ms < r.reset_epoch_ms);
                let reset = match limited {
                    Some(r) => format!("{}s", (r.reset_epoch_ms - now_ms) / 1000),
                    None => "-".to_string(),
                };
                out.push_str(&format!(
                    "{:<28} {:<34} {:>9.0}% {:>12}\n",
                    name,
                    model,
                    entry.remaining_fraction * 100.0,
                    reset
                ));
                wrote_row = true;
            }
        }
        if !wrote_row {
            out.push_str(&format!("{:<28} {:<34} {:>10} {:>12}\n", name, "-", "-", "-"));
        }
    }
    out
}

pub async fn refresh_token(State(state): State<AppState>) -> Response {
    let accounts = state.pool.pool_accounts().await;
    let (refreshed, failed) = state.token_store.force_refresh_all(&accounts).await;
    Json(json!({
        "refreshed": refreshed,
        "failed": failed,
    }))
    .into_response()
}
