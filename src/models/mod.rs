pub mod account;
pub mod config;

pub use account::{Account, AccountSource, ModelQuota, ModelRateLimit, QuotaSnapshot, Subscription};
pub use config::AppConfig;
