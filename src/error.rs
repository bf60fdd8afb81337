use thiserror::Error;

/// Errors crossing component boundaries.
///
/// The first three variants carry meaning for the processor's driving loop:
/// `NoScans` and `AnchorUnavailable` back off and retry, `TargetUnavailable`
/// forces a fresh availability probe. Everything else is treated as fatal,
/// which halts the processor while triggers keep accepting scans.
#[derive(Error, Debug)]
pub enum AutoscanError {
    #[error("no scans are currently available")]
    NoScans,

    #[error("anchor file unavailable: {0}")]
    AnchorUnavailable(String),

    #[error("target unavailable: {0}")]
    TargetUnavailable(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("config: {0}")]
    Config(String),

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Postgres(#[from] postgres::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AutoscanError {
    /// True when the error should stop the processor permanently.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            AutoscanError::NoScans
                | AutoscanError::AnchorUnavailable(_)
                | AutoscanError::TargetUnavailable(_)
        )
    }
}
