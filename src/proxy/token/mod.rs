pub mod loader;
pub mod pool;
pub mod store;
pub mod types;

pub use pool::{AccountPool, PickOutcome};
pub use store::TokenStore;
pub use types::PoolAccount;
