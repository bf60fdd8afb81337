use axum::body::Bytes;
use axum::http::StatusCode;
use chrono::Utc;
use log::{error, info, trace};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::AutoscanError;
use crate::processor::Processor;
use crate::rewrite::{Rewrite, Rewriter};
use crate::scan::Scan;
use crate::triggers::{submit_scans, PathSet};
use crate::utils::dir_name;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadarrConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub rewrite: Vec<Rewrite>,
    #[serde(default)]
    pub verbosity: Option<String>,
}

fn default_name() -> String {
    "readarr".to_owned()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadarrEvent {
    #[serde(default)]
    event_type: String,

    #[serde(default)]
    book_files: Vec<ReadarrFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadarrFile {
    #[serde(default)]
    path: String,
}

/// HTTP trigger for Readarr webhooks.
pub struct ReadarrTrigger {
    name: String,
    priority: i32,
    rewriter: Rewriter,
    processor: Arc<Processor>,
}

impl ReadarrTrigger {
    pub fn new(
        config: ReadarrConfig,
        processor: Arc<Processor>,
    ) -> Result<Arc<Self>, AutoscanError> {
        Ok(Arc::new(Self {
            name: config.name,
            priority: config.priority,
            rewriter: Rewriter::new(&config.rewrite)?,
            processor,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn handle(&self, body: Bytes) -> StatusCode {
        let event: ReadarrEvent = match serde_json::from_slice(&body) {
            Ok(event) => event,
            Err(err) => {
                error!("Failed decoding readarr request: {err}");
                return StatusCode::BAD_REQUEST;
            }
        };

        trace!("Processing readarr event: {event:?}");

        if event.event_type.eq_ignore_ascii_case("Test") {
            info!("Received readarr test event");
            return StatusCode::OK;
        }

        if !event.event_type.eq_ignore_ascii_case("Download") || event.book_files.is_empty() {
            error!("Required readarr fields are missing");
            return StatusCode::BAD_REQUEST;
        }

        let mut paths = PathSet::new();
        for file in &event.book_files {
            if file.path.is_empty() {
                continue;
            }

            paths.push(dir_name(&self.rewriter.rewrite(&file.path)));
        }

        if paths.is_empty() {
            error!("Required readarr fields are missing");
            return StatusCode::BAD_REQUEST;
        }

        let now = Utc::now();
        let scans: Vec<Scan> = paths
            .into_paths()
            .into_iter()
            .map(|folder| Scan {
                folder,
                priority: self.priority,
                time: now,
            })
            .collect();

        submit_scans(&self.processor, scans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::processor::ProcessorConfig;
    use std::time::Duration;

    fn trigger() -> Arc<ReadarrTrigger> {
        let db = Arc::new(Database::open_sqlite_memory().unwrap());
        let processor = Arc::new(
            Processor::new(
                ProcessorConfig {
                    anchors: vec![],
                    minimum_age: Duration::from_secs(600),
                },
                db,
            )
            .unwrap(),
        );

        ReadarrTrigger::new(
            ReadarrConfig {
                name: "readarr".into(),
                priority: 1,
                rewrite: vec![],
                verbosity: None,
            },
            processor,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn download_event_submits_book_folder() {
        let trigger = trigger();

        let body = Bytes::from(
            r#"{"eventType":"Download","bookFiles":[{"path":"/Books/Author/Title/book.epub"}]}"#,
        );
        assert_eq!(trigger.handle(body).await, StatusCode::OK);

        let scans = trigger.processor.all_scans();
        assert_eq!(scans.len(), 1);
        assert_eq!(scans[0].folder, "/Books/Author/Title");
    }

    #[tokio::test]
    async fn unknown_event_returns_bad_request() {
        let trigger = trigger();
        let body = Bytes::from(r#"{"eventType":"Grab"}"#);
        assert_eq!(trigger.handle(body).await, StatusCode::BAD_REQUEST);
    }
}
