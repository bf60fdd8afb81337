use async_trait::async_trait;
use log::{debug, info, trace, warn};
use serde::Deserialize;

use crate::error::AutoscanError;
use crate::rewrite::{Rewrite, Rewriter};
use crate::scan::Scan;
use crate::targets::{check_status, send_error, Target};
use crate::utils::join_url;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlexConfig {
    pub url: String,
    pub token: String,
    #[serde(default)]
    pub rewrite: Vec<Rewrite>,
    #[serde(default)]
    pub verbosity: Option<String>,
}

#[derive(Debug, Clone)]
struct Library {
    id: i64,
    name: String,
    path: String,
}

pub struct PlexTarget {
    url: String,
    token: String,
    libraries: Vec<Library>,
    rewriter: Rewriter,
    client: reqwest::Client,
}

impl PlexTarget {
    pub async fn new(config: PlexConfig) -> Result<Self, AutoscanError> {
        let rewriter = Rewriter::new(&config.rewrite)?;
        let client = reqwest::Client::new();

        let target = Self {
            url: config.url,
            token: config.token,
            libraries: Vec::new(),
            rewriter,
            client,
        };

        let version = target.version().await?;
        debug!("Plex version: {version}");
        if !supported_version(&version) {
            return Err(AutoscanError::Fatal(format!(
                "plex running unsupported version {version}"
            )));
        }

        let libraries = target.fetch_libraries().await?;
        debug!("Retrieved {} plex libraries", libraries.len());

        Ok(Self { libraries, ..target })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, AutoscanError> {
        let res = self
            .client
            .get(url)
            .header("X-Plex-Token", &self.token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|err| send_error(err, "plex"))?;

        check_status(res.status(), "plex")?;
        Ok(res)
    }

    async fn version(&self) -> Result<String, AutoscanError> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(rename = "MediaContainer")]
            container: Container,
        }

        #[derive(Deserialize)]
        struct Container {
            version: String,
        }

        let res = self.get(&join_url(&self.url, &[])).await?;
        let body: Response = res
            .json()
            .await
            .map_err(|err| AutoscanError::Fatal(format!("decoding plex version: {err}")))?;

        Ok(body.container.version)
    }

    async fn fetch_libraries(&self) -> Result<Vec<Library>, AutoscanError> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(rename = "MediaContainer")]
            container: Container,
        }

        #[derive(Deserialize)]
        struct Container {
            #[serde(rename = "Directory", default)]
            directories: Vec<Directory>,
        }

        #[derive(Deserialize)]
        struct Directory {
            key: String,
            title: String,
            #[serde(rename = "Location", default)]
            locations: Vec<Location>,
        }

        #[derive(Deserialize)]
        struct Location {
            path: String,
        }

        let res = self
            .get(&join_url(&self.url, &["library", "sections"]))
            .await?;
        let body: Response = res
            .json()
            .await
            .map_err(|err| AutoscanError::Fatal(format!("decoding plex libraries: {err}")))?;

        let mut libraries = Vec::new();
        for directory in body.container.directories {
            let id: i64 = directory.key.parse().map_err(|_| {
                AutoscanError::Fatal(format!("bad plex library key: {}", directory.key))
            })?;

            for location in directory.locations {
                let mut path = location.path;
                if !path.ends_with('/') {
                    path.push('/');
                }

                libraries.push(Library {
                    id,
                    name: directory.title.clone(),
                    path,
                });
            }
        }

        Ok(libraries)
    }
}

#[async_trait]
impl Target for PlexTarget {
    async fn available(&self) -> Result<(), AutoscanError> {
        self.get(&join_url(&self.url, &["myplex", "account"]))
            .await
            .map(|_| ())
    }

    async fn scan(&self, scan: &Scan) -> Result<(), AutoscanError> {
        let folder = self.rewriter.rewrite(&scan.folder);
        let libraries = matching_libraries(&self.libraries, &folder);

        if libraries.is_empty() {
            warn!("No plex libraries found for path: {folder}");
            return Ok(());
        }

        for library in libraries {
            trace!("Sending scan request to plex library: {}", library.name);

            let url = join_url(
                &self.url,
                &["library", "sections", &library.id.to_string(), "refresh"],
            );
            let res = self
                .client
                .put(url)
                .query(&[("path", folder.as_str())])
                .header("X-Plex-Token", &self.token)
                .header("Accept", "application/json")
                .send()
                .await
                .map_err(|err| send_error(err, "plex"))?;

            check_status(res.status(), "plex")?;
            info!("Scan moved to plex library: {}: {folder}", library.name);
        }

        Ok(())
    }
}

/// Plex must run at least 1.20 for partial scans to work.
fn supported_version(version: &str) -> bool {
    let mut parts = version.split('.');
    let major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);

    major >= 2 || (major == 1 && minor >= 20)
}

fn matching_libraries<'a>(libraries: &'a [Library], folder: &str) -> Vec<&'a Library> {
    libraries
        .iter()
        .filter(|library| folder.starts_with(&library.path) || folder == library.path.trim_end_matches('/'))
        .collect()
}
