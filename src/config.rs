//! Process-wide knobs.
//!
//! The engine has exactly one: the size of the write-combining buffer a
//! block handle allocates.  It defaults to 256 KiB, can be overridden at
//! process start with the `BIGFILE_BUFFER_SIZE` environment variable
//! (plain bytes or a `K`/`M`/`G` suffix), and can be changed at runtime
//! with [`set_buffer_size`].  Handles capture the current value when they
//! are created and keep it for their lifetime.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::BigFileError;

/// Default write-buffer size: 256 KiB.
pub const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;

/// Environment variable consulted once, at first use.
pub const BUFFER_SIZE_ENV: &str = "BIGFILE_BUFFER_SIZE";

static BUFFER_SIZE: OnceLock<AtomicUsize> = OnceLock::new();

fn cell() -> &'static AtomicUsize {
    BUFFER_SIZE.get_or_init(|| {
        let initial = std::env::var(BUFFER_SIZE_ENV)
            .ok()
            .and_then(|s| parse_size(&s).ok())
            .map(|v| v.max(1) as usize)
            .unwrap_or(DEFAULT_BUFFER_SIZE);
        AtomicUsize::new(initial)
    })
}

/// Set the process-wide write-buffer size in bytes.  Affects handles
/// created after the call; existing handles keep their buffer.
pub fn set_buffer_size(bytes: usize) {
    cell().store(bytes.max(1), Ordering::Relaxed);
}

/// The write-buffer size new handles will capture.
pub fn buffer_size() -> usize {
    cell().load(Ordering::Relaxed)
}

/// Parse a human-readable size string into bytes.
///
/// Accepts formats like `"256K"`, `"1M"`, `"262144"`.
/// Uses binary units (1M = 1024² bytes).
pub fn parse_size(s: &str) -> Result<u64, BigFileError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(BigFileError::Format {
            path: BUFFER_SIZE_ENV.into(),
            message: "size cannot be empty".into(),
        });
    }

    // Split into numeric part and suffix
    let (num_str, suffix) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(i) => (&s[..i], s[i..].to_ascii_uppercase()),
        None => (s, String::new()),
    };

    let num: u64 = num_str.parse().map_err(|_| BigFileError::Format {
        path: BUFFER_SIZE_ENV.into(),
        message: format!("invalid size number: '{num_str}'"),
    })?;

    let multiplier: u64 = match suffix.as_str() {
        "" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        _ => {
            return Err(BigFileError::Format {
                path: BUFFER_SIZE_ENV.into(),
                message: format!("unknown size suffix: '{suffix}' (use K, M, or G)"),
            });
        }
    };

    num.checked_mul(multiplier).ok_or_else(|| BigFileError::Format {
        path: BUFFER_SIZE_ENV.into(),
        message: format!("size overflows: '{s}'"),
    })
}
