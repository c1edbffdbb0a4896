// Account store I/O. The store lives under `~/.antigravity-claude-proxy/`:
// `accounts.json` for the pool, `legacy-token.json` for the extractor token.
use crate::error::{AppError, AppResult};
use crate::models::Account;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Default, Serialize, Deserialize)]
struct AccountStoreFile {
    #[serde(default)]
    accounts: Vec<Account>,
}

pub fn accounts_file(data_dir: &Path) -> PathBuf {
    data_dir.join("accounts.json")
}

pub fn legacy_token_file(data_dir: &Path) -> PathBuf {
    data_dir.join("legacy-token.json")
}

/// Read all accounts from disk. A missing store is an empty pool, not an
/// error; a malformed store is surfaced so the operator notices at startup.
pub async fn load_accounts(data_dir: &Path) -> AppResult<Vec<Account>> {
    let path = accounts_file(data_dir);
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("account store {:?} not found, starting with empty pool", path);
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    // The store is either `{"accounts": [...]}` or a bare array.
    let accounts = match serde_json::from_str::<AccountStoreFile>(&content) {
        Ok(file) if !file.accounts.is_empty() => file.accounts,
        _ => serde_json::from_str::<Vec<Account>>(&content)
            .map_err(|e| AppError::Account(format!("malformed account store {:?}: {}", path, e)))?,
    };

    debug!("loaded {} account(s) from {:?}", accounts.len(), path);
    Ok(accounts)
}

/// Asynchronous write-back. Errors are logged, never propagated: the pool
/// tolerates a crash at any point and rebuilds from the last good store.
pub fn persist_accounts(data_dir: &Path, accounts: Vec<Account>) {
    let path = accounts_file(data_dir);
    let dir = data_dir.to_path_buf();
    tokio::spawn(async move {
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!("failed to create {:?}: {}", dir, e);
            return;
        }
        let file = AccountStoreFile { accounts };
        let body = match serde_json::to_string_pretty(&file) {
            Ok(b) => b,
            Err(e) => {
                warn!("failed to serialize account store: {}", e);
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&path, body).await {
            warn!("failed to persist account store {:?}: {}", path, e);
        }
    });
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyToken {
    pub access_token: String,
    pub expires_at_epoch_ms: i64,
}

/// Best-effort read of the extractor-provided token for `source: legacy`
/// accounts.
pub async fn read_legacy_token(data_dir: &Path) -> AppResult<LegacyToken> {
    let path = legacy_token_file(data_dir);
    let content = tokio::fs::read_to_string(&path).await?;
    serde_json::from_str(&content)
        .map_err(|e| AppError::Account(format!("malformed legacy token {:?}: {}", path, e)))
}
