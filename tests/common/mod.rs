//! Common test infrastructure
//!
//! This module provides all the infrastructure needed for end-to-end tests.
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{test_client, TestServer};
//!
//! #[tokio::test]
//! async fn test_stats() {
//!     let server = TestServer::spawn().await;
//!     server.state.seed_file("/data/report.csv", b"a,b\n", 100);
//!
//!     let config_dir = tempfile::tempdir().unwrap();
//!     let client = test_client(&server, config_dir.path());
//!     let stat = client.storage().stats("/data/report.csv").await.unwrap();
//!     assert_eq!(stat.size, 4);
//! }
//! ```

mod server;

// Public API - this is what tests import
#[allow(unused_imports)]
pub use server::{PlatformState, ServiceAccountRecord, StorageNode, StoredObject, TestServer};

use std::path::Path;

use skylift::{CliConfig, Client, ClientConfig, TransferEvent};
use tokio::sync::mpsc::UnboundedReceiver;

/// Resolved configuration pointing at the test server, with the vcluster
/// endpoint enabled and an "acme"/"demo" default scope.
#[allow(dead_code)]
pub fn test_config(server: &TestServer, config_dir: &Path) -> ClientConfig {
    let cli = CliConfig {
        api_url: Some(server.base_url.clone()),
        vcluster_url: Some(format!("{}/vcluster", server.base_url)),
        token: Some("test-token".to_string()),
        username: Some("alice".to_string()),
        cluster: Some("test".to_string()),
        org: Some("acme".to_string()),
        project: Some("demo".to_string()),
        config_dir: Some(config_dir.to_owned()),
        ..Default::default()
    };
    ClientConfig::resolve(&cli, None).expect("Failed to resolve test config")
}

#[allow(dead_code)]
pub fn test_client(server: &TestServer, config_dir: &Path) -> Client {
    Client::new(test_config(server, config_dir)).expect("Failed to build client")
}

/// Drain a progress channel into a vector. The sending sink must be dropped
/// before calling this, otherwise the channel never closes.
#[allow(dead_code)]
pub async fn collect_events(mut rx: UnboundedReceiver<TransferEvent>) -> Vec<TransferEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}
