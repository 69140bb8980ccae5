//! Fixtures shared by the integration tests: a temporary fallback store
//! location and relay configurations pointing at it.

use std::time::Duration;

use femtorelay::{RelayConfig, RelayConfigBuilder};
use rstest::fixture;
use tempfile::TempDir;

/// Temporary directory holding the fallback store for one test.
#[fixture]
pub fn store_dir() -> TempDir {
    tempfile::tempdir().expect("create temp dir")
}

/// Builder with short timings so outage tests finish quickly.
pub fn fast_builder(dir: &TempDir) -> RelayConfigBuilder {
    RelayConfig::builder()
        .with_queue("app-logs")
        .with_fallback_path(dir.path().join("fallback.log"))
        .with_max_reconnect_attempts(2)
        .with_reconnect_base_delay(Duration::from_millis(1))
}

/// Configuration whose reconciler ticks every `interval`.
pub fn relay_config(dir: &TempDir, interval: Duration) -> RelayConfig {
    fast_builder(dir)
        .with_reconcile_interval(interval)
        .build()
        .expect("valid relay config")
}
