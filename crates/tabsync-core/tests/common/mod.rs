//! Shared helpers for tabsync-core integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tabsync_core::{JsonObject, Timer};
use tokio::time::Instant;

/// Timer on tokio's clock, so `start_paused` tests run instantly.
pub struct TokioTimer {
    start: Instant,
}

impl TokioTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

#[async_trait(?Send)]
impl Timer for TokioTimer {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Route `tracing` output through the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tabsync_core=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn object(value: Value) -> JsonObject {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}
