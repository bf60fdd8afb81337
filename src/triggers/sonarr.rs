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
use crate::utils::{clean_path, dir_name};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SonarrConfig {
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
    "sonarr".to_owned()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SonarrEvent {
    #[serde(default)]
    event_type: String,

    #[serde(default)]
    episode_file: Option<SonarrFile>,

    #[serde(default)]
    series: Option<SonarrSeries>,

    #[serde(default)]
    renamed_episode_files: Vec<SonarrRenamedFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SonarrFile {
    #[serde(default)]
    relative_path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SonarrSeries {
    #[serde(default)]
    path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SonarrRenamedFile {
    #[serde(default)]
    previous_path: String,

    #[serde(default)]
    relative_path: String,
}

/// HTTP trigger for Sonarr webhooks.
pub struct SonarrTrigger {
    name: String,
    priority: i32,
    rewriter: Rewriter,
    processor: Arc<Processor>,
}

impl SonarrTrigger {
    pub fn new(config: SonarrConfig, processor: Arc<Processor>) -> Result<Arc<Self>, AutoscanError> {
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
        let event: SonarrEvent = match serde_json::from_slice(&body) {
            Ok(event) => event,
            Err(err) => {
                error!("Failed decoding sonarr request: {err}");
                return StatusCode::BAD_REQUEST;
            }
        };

        trace!("Processing sonarr event: {event:?}");

        if event.event_type.eq_ignore_ascii_case("Test") {
            info!("Received sonarr test event");
            return StatusCode::OK;
        }

        let mut paths = PathSet::new();

        match event.event_type.as_str() {
            "Download" | "EpisodeFileDelete" => {
                let series = event.series.as_ref().map(|s| s.path.as_str()).unwrap_or("");
                let file = event
                    .episode_file
                    .as_ref()
                    .map(|f| f.relative_path.as_str())
                    .unwrap_or("");

                if series.is_empty() || file.is_empty() {
                    error!("Required sonarr fields are missing");
                    return StatusCode::BAD_REQUEST;
                }

                let full = self.rewriter.rewrite(&format!("{series}/{file}"));
                paths.push(dir_name(&full));
            }
            "SeriesDelete" => {
                let Some(series) = event.series.as_ref().filter(|s| !s.path.is_empty()) else {
                    error!("Required sonarr fields are missing");
                    return StatusCode::BAD_REQUEST;
                };

                paths.push(clean_path(&self.rewriter.rewrite(&series.path)));
            }
            "Rename" => {
                let Some(series) = event.series.as_ref().filter(|s| !s.path.is_empty()) else {
                    error!("Required sonarr fields are missing");
                    return StatusCode::BAD_REQUEST;
                };

                // each renamed file leaves a stale folder behind and lands
                // in a fresh one
                for file in &event.renamed_episode_files {
                    if !file.previous_path.is_empty() {
                        paths.push(dir_name(&self.rewriter.rewrite(&file.previous_path)));
                    }

                    if !file.relative_path.is_empty() {
                        let full = self
                            .rewriter
                            .rewrite(&format!("{}/{}", series.path, file.relative_path));
                        paths.push(dir_name(&full));
                    }
                }

                if paths.is_empty() {
                    paths.push(clean_path(&self.rewriter.rewrite(&series.path)));
                }
            }
            _ => {
                error!("Unhandled sonarr event type: {}", event.event_type);
                return StatusCode::BAD_REQUEST;
            }
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
