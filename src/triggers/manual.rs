use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use chrono::Utc;
use log::{error, trace};
use serde::Deserialize;
use std::sync::Arc;
use url::form_urlencoded;

use crate::error::AutoscanError;
use crate::processor::Processor;
use crate::rewrite::{Rewrite, Rewriter};
use crate::scan::Scan;
use crate::triggers::{submit_scans, PathSet};
use crate::utils::clean_path;

/// The form served on GET requests, embedded at compile time.
const FORM_TEMPLATE: &str = include_str!("manual.html");

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ManualConfig {
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub rewrite: Vec<Rewrite>,
    #[serde(default)]
    pub verbosity: Option<String>,
}

/// Mixed-style trigger: GET serves an HTML form, POST queues scans from
/// repeated `?dir=` query parameters.
pub struct ManualTrigger {
    priority: i32,
    rewriter: Rewriter,
    processor: Arc<Processor>,
}

impl ManualTrigger {
    pub fn new(config: ManualConfig, processor: Arc<Processor>) -> Result<Arc<Self>, AutoscanError> {
        Ok(Arc::new(Self {
            priority: config.priority,
            rewriter: Rewriter::new(&config.rewrite)?,
            processor,
        }))
    }

    pub async fn form(&self) -> Response {
        Html(FORM_TEMPLATE).into_response()
    }

    pub async fn handle(&self, query: Option<String>) -> StatusCode {
        let query = query.unwrap_or_default();
        let directories: Vec<String> = form_urlencoded::parse(query.as_bytes())
            .filter(|(key, _)| key == "dir")
            .map(|(_, value)| value.into_owned())
            .collect();

        if directories.is_empty() {
            error!("Manual webhook should receive at least one directory");
            return StatusCode::BAD_REQUEST;
        }

        trace!("Received directories: {directories:?}");

        let mut paths = PathSet::new();
        for dir in &directories {
            paths.push(self.rewriter.rewrite(&clean_path(dir)));
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

    fn trigger() -> Arc<ManualTrigger> {
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

        ManualTrigger::new(
            ManualConfig {
                priority: 1,
                rewrite: vec![Rewrite {
                    from: "^/Movies/".into(),
                    to: "/mnt/Media/Movies/".into(),
                }],
                verbosity: None,
            },
            processor,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn multiple_dirs_share_one_timestamp() {
        let trigger = trigger();

        let status = trigger
            .handle(Some(
                "dir=/Movies/Interstellar%20(2014)&dir=/Movies/Parasite%20(2019)".into(),
            ))
            .await;
        assert_eq!(status, StatusCode::OK);

        let scans = trigger.processor.all_scans();
        assert_eq!(scans.len(), 2);
        let folders: Vec<&str> = scans.iter().map(|s| s.folder.as_str()).collect();
        assert_eq!(
            folders,
            vec![
                "/mnt/Media/Movies/Interstellar (2014)",
                "/mnt/Media/Movies/Parasite (2019)"
            ]
        );
        assert_eq!(scans[0].time, scans[1].time);
    }

    #[tokio::test]
    async fn no_directories_returns_bad_request() {
        let trigger = trigger();
        assert_eq!(trigger.handle(None).await, StatusCode::BAD_REQUEST);
        assert_eq!(
            trigger.handle(Some("other=x".into())).await,
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn form_is_served() {
        let trigger = trigger();
        let response = trigger.form().await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn duplicate_dirs_collapse() {
        let trigger = trigger();

        let status = trigger
            .handle(Some("dir=/Movies/Film&dir=/Movies/Film".into()))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(trigger.processor.all_scans().len(), 1);
    }
}
