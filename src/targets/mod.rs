use async_trait::async_trait;
use reqwest::StatusCode;

use crate::error::AutoscanError;
use crate::scan::Scan;

pub mod autoscan;
pub mod emby;
pub mod jellyfin;
pub mod plex;

/// A media server that performs the actual directory rescan.
///
/// `available` is probed before the dispatch loop enters and again after any
/// unavailability; `scan` must be idempotent at the target since partial
/// fan-out failures re-send to targets that already succeeded.
#[async_trait]
pub trait Target: Send + Sync {
    async fn available(&self) -> Result<(), AutoscanError>;
    async fn scan(&self, scan: &Scan) -> Result<(), AutoscanError>;
}

/// Maps a target response status onto the processor's error kinds: 2xx is
/// success, 401 is a misconfigured credential, the usual gateway/server
/// errors are transient, anything else is fatal.
pub(crate) fn check_status(status: StatusCode, context: &str) -> Result<(), AutoscanError> {
    if status.is_success() {
        return Ok(());
    }

    match status.as_u16() {
        401 => Err(AutoscanError::Fatal(format!(
            "{context}: invalid credentials: {status}"
        ))),
        404 | 500 | 502 | 503 | 504 => {
            Err(AutoscanError::TargetUnavailable(format!("{context}: {status}")))
        }
        _ => Err(AutoscanError::Fatal(format!("{context}: {status}"))),
    }
}

/// A request that never reached the target counts as unavailable.
pub(crate) fn send_error(err: reqwest::Error, context: &str) -> AutoscanError {
    AutoscanError::TargetUnavailable(format!("{context}: {err}"))
}
