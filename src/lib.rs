//! Skylift Client Library
//!
//! SDK for the Skylift compute platform: HTTP transport core with session
//! affinity, remote storage and blob transfers, vcluster service accounts
//! and the installed-apps catalog. The `skylift` binary is a thin CLI over
//! these modules.

pub mod apps;
pub mod blob;
pub mod config;
pub mod core;
pub mod kubeconfig;
pub mod progress;
pub mod storage;
pub mod vcluster;

mod client;
mod transfer;

// Re-export commonly used types for convenience
pub use client::Client;
pub use config::{CliConfig, ClientConfig, FileConfig};
pub use core::{Error, OsCode, OsError, Result};
pub use progress::{ChannelSink, NullSink, ProgressSink, TransferEvent};
