use axum::http::StatusCode;
use log::{error, info};
use std::collections::HashSet;
use std::sync::Arc;

use crate::processor::Processor;
use crate::scan::Scan;

pub mod a_train;
pub mod drive;
pub mod inotify;
pub mod lidarr;
pub mod manual;
pub mod radarr;
pub mod readarr;
pub mod sonarr;

/// Collects derived folder paths, deduplicating while preserving first-seen
/// order within a single request.
#[derive(Default)]
pub(crate) struct PathSet {
    seen: HashSet<String>,
    paths: Vec<String>,
}

impl PathSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, path: String) {
        if self.seen.insert(path.clone()) {
            self.paths.push(path);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn into_paths(self) -> Vec<String> {
        self.paths
    }
}

/// Moves scans to the processor and maps the outcome onto the webhook
/// response: triggers never surface error kinds to their callers.
pub(crate) fn submit_scans(processor: &Arc<Processor>, scans: Vec<Scan>) -> StatusCode {
    let folders: Vec<String> = scans.iter().map(|scan| scan.folder.clone()).collect();

    if let Err(err) = processor.submit(scans) {
        error!("Processor could not process scans: {err}");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    for folder in folders {
        info!("Scan moved to processor: {folder}");
    }

    StatusCode::OK
}
