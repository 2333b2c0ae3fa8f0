//! Download Engine - one HTTP(S) retrieval from request to durable file
//!
//! - Iterative redirect following with a hop cap
//! - Forward-then-pace bandwidth limiting
//! - Collision-safe naming and rename-on-completion
//! - Retry, pause/resume and cancellation

mod download_engine;
mod filename;
mod hooks;
mod progress;
mod rate_limiter;

pub use download_engine::*;
pub use filename::*;
pub use hooks::*;
pub use progress::*;
pub use rate_limiter::*;

use crate::error::EngineError;
use brd_types::Settings;
use reqwest::Client;
use std::time::Duration;

/// Build the HTTP client engines share.
///
/// Redirects are disabled here; the engine follows them itself so every hop
/// is counted against `max_redirects`.
pub fn build_client(settings: &Settings) -> Result<Client, EngineError> {
    let client = Client::builder()
        .user_agent(settings.user_agent.as_str())
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
        .read_timeout(Duration::from_secs(settings.read_timeout_secs))
        .build()?;
    Ok(client)
}
