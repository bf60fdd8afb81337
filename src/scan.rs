use chrono::{DateTime, Utc};

/// A Scan is a pending request to refresh one directory in target libraries.
///
/// `folder` is the coalescing key: the datastore holds at most one row per
/// folder, keeping the highest priority and the most recent submission time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scan {
    pub folder: String,
    pub priority: i32,
    pub time: DateTime<Utc>,
}
