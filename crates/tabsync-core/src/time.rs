//! Timer abstraction.
//!
//! The election protocol needs to sleep through response windows and fallback
//! intervals. The browser host implements this with `setTimeout`; tests use a
//! tokio-backed timer with paused time.

use async_trait::async_trait;
use std::time::Duration;

#[async_trait(?Send)]
pub trait Timer {
    /// Current time in milliseconds. Only differences matter.
    fn now_ms(&self) -> u64 {
        wall_clock_ms()
    }

    /// Resolve after `duration` has elapsed.
    async fn sleep(&self, duration: Duration);
}

/// Milliseconds since the Unix epoch (works in WASM via `web-time`).
pub fn wall_clock_ms() -> u64 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
