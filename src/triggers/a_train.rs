use axum::body::Bytes;
use axum::http::StatusCode;
use chrono::Utc;
use log::{error, trace};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::AutoscanError;
use crate::processor::Processor;
use crate::rewrite::{Rewrite, Rewriter};
use crate::scan::Scan;
use crate::triggers::{submit_scans, PathSet};
use crate::utils::clean_path;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ATrainConfig {
    #[serde(default)]
    pub drives: Vec<ATrainDrive>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub rewrite: Vec<Rewrite>,
    #[serde(default)]
    pub verbosity: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ATrainDrive {
    pub id: String,
    #[serde(default)]
    pub rewrite: Vec<Rewrite>,
}

#[derive(Debug, Deserialize)]
struct ATrainEvent {
    #[serde(rename = "Created", default)]
    created: Vec<String>,

    #[serde(rename = "Deleted", default)]
    deleted: Vec<String>,
}

/// HTTP trigger for A-Train (and Bernard) change webhooks. Paths are
/// resolved against the rewrite rules of the drive named in the URL, falling
/// back to the trigger-wide rules for unknown drives.
pub struct ATrainTrigger {
    priority: i32,
    drive_rewriters: HashMap<String, Rewriter>,
    global_rewriter: Rewriter,
    processor: Arc<Processor>,
}

impl ATrainTrigger {
    pub fn new(config: ATrainConfig, processor: Arc<Processor>) -> Result<Arc<Self>, AutoscanError> {
        let mut drive_rewriters = HashMap::new();
        for drive in &config.drives {
            let mut rewrites = drive.rewrite.clone();
            rewrites.extend(config.rewrite.iter().cloned());
            drive_rewriters.insert(drive.id.clone(), Rewriter::new(&rewrites)?);
        }

        Ok(Arc::new(Self {
            priority: config.priority,
            drive_rewriters,
            global_rewriter: Rewriter::new(&config.rewrite)?,
            processor,
        }))
    }

    fn rewrite(&self, drive: &str, path: &str) -> String {
        match self.drive_rewriters.get(drive) {
            Some(rewriter) => rewriter.rewrite(path),
            None => self.global_rewriter.rewrite(path),
        }
    }

    pub async fn handle(&self, drive: String, body: Bytes) -> StatusCode {
        let event: ATrainEvent = match serde_json::from_slice(&body) {
            Ok(event) => event,
            Err(err) => {
                error!("Failed decoding a-train request: {err}");
                return StatusCode::BAD_REQUEST;
            }
        };

        trace!(
            "Processing a-train event for drive {drive}: {} created, {} deleted",
            event.created.len(),
            event.deleted.len()
        );

        let mut paths = PathSet::new();
        for path in event.created.iter().chain(event.deleted.iter()) {
            paths.push(clean_path(&self.rewrite(&drive, path)));
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

    fn trigger() -> Arc<ATrainTrigger> {
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

        ATrainTrigger::new(
            ATrainConfig {
                drives: vec![ATrainDrive {
                    id: "drive-1".into(),
                    rewrite: vec![Rewrite {
                        from: "^/TeamDrive/".into(),
                        to: "/mnt/unionfs/".into(),
                    }],
                }],
                priority: 4,
                rewrite: vec![],
                verbosity: None,
            },
            processor,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn created_and_deleted_paths_become_scans() {
        let trigger = trigger();

        let body = Bytes::from(
            r#"{"Created":["/TeamDrive/Movies/Film"],"Deleted":["/TeamDrive/TV/Show"]}"#,
        );
        assert_eq!(trigger.handle("drive-1".into(), body).await, StatusCode::OK);

        let scans = trigger.processor.all_scans();
        let folders: Vec<&str> = scans.iter().map(|s| s.folder.as_str()).collect();
        assert_eq!(folders, vec!["/mnt/unionfs/Movies/Film", "/mnt/unionfs/TV/Show"]);
        assert!(scans.iter().all(|s| s.priority == 4));
    }

    #[tokio::test]
    async fn unknown_drive_uses_global_rewriter() {
        let trigger = trigger();

        let body = Bytes::from(r#"{"Created":["/TeamDrive/Movies/Film"],"Deleted":[]}"#);
        assert_eq!(trigger.handle("other".into(), body).await, StatusCode::OK);

        let scans = trigger.processor.all_scans();
        assert_eq!(scans[0].folder, "/TeamDrive/Movies/Film");
    }

    #[tokio::test]
    async fn malformed_body_returns_bad_request() {
        let trigger = trigger();
        let body = Bytes::from("{");
        assert_eq!(
            trigger.handle("drive-1".into(), body).await,
            StatusCode::BAD_REQUEST
        );
    }
}
