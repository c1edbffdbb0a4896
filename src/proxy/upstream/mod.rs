pub mod client;

pub use client::{AttemptError, UpstreamClient, UpstreamResponse};
