#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use reliq::broker::headers::{HeaderValue, Headers};
use reliq::broker::manager::{ManagerOptions, QueueManager};
use reliq::store::disk::DiskStore;
use reliq::store::sql::SqlStore;
use tempfile::TempDir;

// ==========================================
// SETUP HELPERS
// ==========================================

/// Short reaper cadence so timeout tests finish quickly.
pub fn test_options() -> ManagerOptions {
    ManagerOptions {
        tx_timeout: Duration::from_secs(60),
        reaper_interval: Duration::from_millis(100),
    }
}

pub fn setup_manager() -> (Arc<QueueManager>, TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let store = Box::new(DiskStore::new(tmp.path(), true));
    let manager = QueueManager::start(store, test_options()).unwrap();
    (manager, tmp)
}

pub fn setup_sql_manager() -> (Arc<QueueManager>, TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let store = Box::new(SqlStore::new(tmp.path().join("broker.db"), ""));
    let manager = QueueManager::start(store, test_options()).unwrap();
    (manager, tmp)
}

/// Build a header map from literal pairs.
pub fn headers(pairs: &[(&str, HeaderValue)]) -> Headers {
    let mut map = Headers::new();
    for (name, value) in pairs {
        map.insert(*name, value.clone());
    }
    map
}
