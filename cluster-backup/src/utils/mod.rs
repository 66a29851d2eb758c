//! Utility modules for the backup orchestrator.

pub mod errors;
pub mod fsutil;
pub mod logger;

pub use errors::{BackupError, Result};

/// Format a byte count for log output (e.g. `10.00 MB`).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}
