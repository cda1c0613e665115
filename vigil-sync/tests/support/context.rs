#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use vigil_core::SyncConfig;
use vigil_sync::SyncContext;
use vigil_test_utils::{fixtures, MockBackend};

pub fn test_context(config: SyncConfig) -> (Arc<SyncContext>, Arc<MockBackend>) {
    let backend = Arc::new(MockBackend::new());
    let ctx = SyncContext::new(backend.clone(), config).expect("valid test config");
    (Arc::new(ctx), backend)
}

pub fn default_context() -> (Arc<SyncContext>, Arc<MockBackend>) {
    test_context(fixtures::test_config())
}

/// Let spawned tasks run. Under a paused clock this also advances time by 1ms.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
