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
pub struct RadarrConfig {
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
    "radarr".to_owned()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RadarrEvent {
    #[serde(default)]
    event_type: String,

    #[serde(default)]
    movie_file: Option<RadarrFile>,

    #[serde(default)]
    movie: Option<RadarrMovie>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RadarrFile {
    #[serde(default)]
    relative_path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RadarrMovie {
    #[serde(default)]
    folder_path: String,
}

/// HTTP trigger for Radarr webhooks.
pub struct RadarrTrigger {
    name: String,
    priority: i32,
    rewriter: Rewriter,
    processor: Arc<Processor>,
}

impl RadarrTrigger {
    pub fn new(config: RadarrConfig, processor: Arc<Processor>) -> Result<Arc<Self>, AutoscanError> {
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
        let event: RadarrEvent = match serde_json::from_slice(&body) {
            Ok(event) => event,
            Err(err) => {
                error!("Failed decoding radarr request: {err}");
                return StatusCode::BAD_REQUEST;
            }
        };

        trace!("Processing radarr event: {event:?}");

        if event.event_type.eq_ignore_ascii_case("Test") {
            info!("Received radarr test event");
            return StatusCode::OK;
        }

        let mut paths = PathSet::new();

        match event.event_type.as_str() {
            "Download" | "MovieFileDelete" => {
                let movie = event
                    .movie
                    .as_ref()
                    .map(|m| m.folder_path.as_str())
                    .unwrap_or("");
                let file = event
                    .movie_file
                    .as_ref()
                    .map(|f| f.relative_path.as_str())
                    .unwrap_or("");

                if movie.is_empty() || file.is_empty() {
                    error!("Required radarr fields are missing");
                    return StatusCode::BAD_REQUEST;
                }

                let full = self.rewriter.rewrite(&format!("{movie}/{file}"));
                paths.push(dir_name(&full));
            }
            "MovieDelete" | "Rename" => {
                let Some(movie) = event.movie.as_ref().filter(|m| !m.folder_path.is_empty())
                else {
                    error!("Required radarr fields are missing");
                    return StatusCode::BAD_REQUEST;
                };

                paths.push(clean_path(&self.rewriter.rewrite(&movie.folder_path)));
            }
            _ => {
                error!("Unhandled radarr event type: {}", event.event_type);
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
