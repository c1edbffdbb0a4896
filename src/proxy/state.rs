use crate::models::AppConfig;
use crate::proxy::token::{AccountPool, TokenStore};
use crate::proxy::upstream::UpstreamClient;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Owned singletons, passed explicitly to routes. Each guards its own state;
/// no free function mutates a shared map.
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<AccountPool>,
    pub token_store: Arc<TokenStore>,
    pub upstream: Arc<UpstreamClient>,
    pub model_mapping: Arc<RwLock<HashMap<String, String>>>,
    pub config: Arc<AppConfig>,
    pub cancel: CancellationToken,
}

impl AppState {
    pub fn new(
        pool: Arc<AccountPool>,
        token_store: Arc<TokenStore>,
        upstream: Arc<UpstreamClient>,
        config: AppConfig,
        cancel: CancellationToken,
    ) -> Self {
        let model_mapping = Arc::new(RwLock::new(config.model_mapping.clone()));
        Self {
            pool,
            token_store,
            upstream,
            model_mapping,
            config: Arc::new(config),
            cancel,
        }
    }
}
