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
pub struct LidarrConfig {
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
    "lidarr".to_owned()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LidarrEvent {
    #[serde(default)]
    event_type: String,

    #[serde(default)]
    track_files: Vec<LidarrFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LidarrFile {
    #[serde(default)]
    path: String,
}

/// HTTP trigger for Lidarr webhooks. Download events carry full track file
/// paths; every distinct containing directory becomes one scan.
pub struct LidarrTrigger {
    name: String,
    priority: i32,
    rewriter: Rewriter,
    processor: Arc<Processor>,
}

impl LidarrTrigger {
    pub fn new(config: LidarrConfig, processor: Arc<Processor>) -> Result<Arc<Self>, AutoscanError> {
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
        let event: LidarrEvent = match serde_json::from_slice(&body) {
            Ok(event) => event,
            Err(err) => {
                error!("Failed decoding lidarr request: {err}");
                return StatusCode::BAD_REQUEST;
            }
        };

        trace!("Processing lidarr event: {event:?}");

        if event.event_type.eq_ignore_ascii_case("Test") {
            info!("Received lidarr test event");
            return StatusCode::OK;
        }

        if !event.event_type.eq_ignore_ascii_case("Download") || event.track_files.is_empty() {
            error!("Required lidarr fields are missing");
            return StatusCode::BAD_REQUEST;
        }

        let mut paths = PathSet::new();
        for file in &event.track_files {
            if file.path.is_empty() {
                continue;
            }

            paths.push(dir_name(&self.rewriter.rewrite(&file.path)));
        }

        if paths.is_empty() {
            error!("Required lidarr fields are missing");
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

    fn trigger() -> Arc<LidarrTrigger> {
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

        LidarrTrigger::new(
            LidarrConfig {
                name: "lidarr".into(),
                priority: 2,
                rewrite: vec![],
                verbosity: None,
            },
            processor,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn download_event_dedupes_album_folders() {
        let trigger = trigger();

        let body = Bytes::from(
            r#"{"eventType":"Download","trackFiles":[
                {"path":"/Music/Artist/Album/01.flac"},
                {"path":"/Music/Artist/Album/02.flac"}
            ]}"#,
        );
        assert_eq!(trigger.handle(body).await, StatusCode::OK);

        let scans = trigger.processor.all_scans();
        assert_eq!(scans.len(), 1);
        assert_eq!(scans[0].folder, "/Music/Artist/Album");
    }

    #[tokio::test]
    async fn empty_track_files_return_bad_request() {
        let trigger = trigger();
        let body = Bytes::from(r#"{"eventType":"Download","trackFiles":[]}"#);
        assert_eq!(trigger.handle(body).await, StatusCode::BAD_REQUEST);
    }
}
