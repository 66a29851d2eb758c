//! Cluster Backup Library
//!
//! Backs up and restores application data living on persistent volumes of a
//! small container cluster: declarative state and volume contents are captured
//! into timestamped, checksummed run directories, and restored through a
//! scale-down / transfer-pod / scale-up sequence.

pub mod archive;
pub mod config;
pub mod daemon;
pub mod gateway;
pub mod registry;
pub mod restore;
pub mod run;
pub mod snapshot;
pub mod transfer;
pub mod utils;
pub mod verify;

// Re-export commonly used types
pub use config::Config;
pub use registry::{BackupTarget, TargetRegistry};
pub use utils::errors::{BackupError, Result};
