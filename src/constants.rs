use once_cell::sync::Lazy;

// Cloud-Code endpoint fallback order: primary first, then geo alternates.
pub const CLOUDCODE_HOSTS: &[&str] = &[
    "cloudcode-pa.googleapis.com",
    "daily-cloudcode-pa.googleapis.com",
];

pub const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_LOCAL_LLM_URL: &str = "http://localhost:1234/v1/chat/completions";

// Dispatcher retry budget: max(MAX_RETRIES, account count + 1).
pub const MAX_RETRIES: usize = 3;
// Same-endpoint retries when a stream opens but carries no content blocks.
pub const MAX_EMPTY_RESPONSE_RETRIES: usize = 3;
pub const EMPTY_RESPONSE_FALLBACK_TEXT: &str = "[No response after retries - please try again]";

// Longest the dispatcher will sleep waiting for a rate-limit window to open.
pub const MAX_WAIT_BEFORE_ERROR_MS: u64 = 120_000;
// Cooldown applied when a 429 carries no parseable reset time.
pub const DEFAULT_COOLDOWN_SECS: u64 = 60;
// Pause between endpoint attempts after a 5xx, and between accounts after a
// network-level failure.
pub const SOFT_FAIL_PAUSE_MS: u64 = 1_000;

// Access tokens are considered stale this long before their real expiry.
pub const TOKEN_EXPIRY_SKEW_SECS: i64 = 60;
// The proactive scheduler refreshes anything expiring within this window.
pub const PROACTIVE_REFRESH_WINDOW_SECS: i64 = 300;
pub const PROACTIVE_REFRESH_TICK_SECS: u64 = 60;
// Expired rate-limit records are swept on this cadence.
pub const RATE_LIMIT_SWEEP_SECS: u64 = 15;

// Validator bounds.
pub const MAX_BODY_DEPTH: usize = 50;
pub const MAX_MESSAGES: usize = 500;
pub const MAX_TEXT_BLOCK_BYTES: usize = 2 * 1024 * 1024;
pub const MAX_IMAGE_BASE64_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_TOOLS: usize = 100;
pub const MAX_TOKENS_LIMIT: u32 = 200_000;
pub const MAX_TOKENS_DEFAULT_CAP: u32 = 8_192;
pub const THINKING_BUDGET_MIN: u32 = 1_000;
pub const THINKING_BUDGET_MAX: u32 = 100_000;

pub const SHUTDOWN_DRAIN_SECS: u64 = 10;

pub static USER_AGENT: Lazy<String> = Lazy::new(|| {
    format!(
        "antigravity-claude-proxy/{} {}/{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
});
