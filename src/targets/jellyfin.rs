use async_trait::async_trait;
use log::{debug, info, trace, warn};
use serde::Deserialize;

use crate::error::AutoscanError;
use crate::rewrite::{Rewrite, Rewriter};
use crate::scan::Scan;
use crate::targets::emby::{Update, UpdatePayload};
use crate::targets::{check_status, send_error, Target};
use crate::utils::join_url;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JellyfinConfig {
    pub url: String,
    pub token: String,
    #[serde(default)]
    pub rewrite: Vec<Rewrite>,
    #[serde(default)]
    pub verbosity: Option<String>,
}

#[derive(Debug, Clone)]
struct Library {
    name: String,
    paths: Vec<String>,
}

pub struct JellyfinTarget {
    url: String,
    token: String,
    libraries: Vec<Library>,
    rewriter: Rewriter,
    client: reqwest::Client,
}

impl JellyfinTarget {
    pub async fn new(config: JellyfinConfig) -> Result<Self, AutoscanError> {
        let target = Self {
            url: config.url,
            token: config.token,
            libraries: Vec::new(),
            rewriter: Rewriter::new(&config.rewrite)?,
            client: reqwest::Client::new(),
        };

        let libraries = target.fetch_libraries().await?;
        debug!("Retrieved {} jellyfin libraries", libraries.len());

        Ok(Self { libraries, ..target })
    }

    async fn fetch_libraries(&self) -> Result<Vec<Library>, AutoscanError> {
        #[derive(Deserialize)]
        struct VirtualFolder {
            #[serde(rename = "Name")]
            name: String,
            #[serde(rename = "Locations", default)]
            locations: Vec<String>,
        }

        let res = self
            .client
            .get(join_url(&self.url, &["Library", "VirtualFolders"]))
            .header("X-Emby-Token", &self.token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|err| send_error(err, "jellyfin"))?;

        check_status(res.status(), "jellyfin")?;

        let folders: Vec<VirtualFolder> = res
            .json()
            .await
            .map_err(|err| AutoscanError::Fatal(format!("decoding jellyfin libraries: {err}")))?;

        Ok(folders
            .into_iter()
            .map(|folder| Library {
                name: folder.name,
                paths: folder
                    .locations
                    .into_iter()
                    .map(|mut path| {
                        if !path.ends_with('/') {
                            path.push('/');
                        }
                        path
                    })
                    .collect(),
            })
            .collect())
    }

    fn library_for(&self, folder: &str) -> Option<&Library> {
        self.libraries.iter().find(|library| {
            library
                .paths
                .iter()
                .any(|path| folder.starts_with(path.as_str()) || folder == path.trim_end_matches('/'))
        })
    }
}

#[async_trait]
impl Target for JellyfinTarget {
    async fn available(&self) -> Result<(), AutoscanError> {
        let res = self
            .client
            .get(join_url(&self.url, &["System", "Info"]))
            .header("X-Emby-Token", &self.token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|err| send_error(err, "jellyfin"))?;

        check_status(res.status(), "jellyfin")
    }

    async fn scan(&self, scan: &Scan) -> Result<(), AutoscanError> {
        let folder = self.rewriter.rewrite(&scan.folder);

        let Some(library) = self.library_for(&folder) else {
            warn!("No jellyfin library found for path: {folder}");
            return Ok(());
        };

        trace!("Sending scan request to jellyfin library: {}", library.name);

        let payload = UpdatePayload {
            updates: vec![Update {
                path: folder.clone(),
                update_type: "Modified",
            }],
        };

        let res = self
            .client
            .post(join_url(&self.url, &["Library", "Media", "Updated"]))
            .header("X-Emby-Token", &self.token)
            .json(&payload)
            .send()
            .await
            .map_err(|err| send_error(err, "jellyfin"))?;

        check_status(res.status(), "jellyfin")?;
        info!("Scan moved to jellyfin library: {}: {folder}", library.name);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target_with_libraries(libraries: Vec<Library>) -> JellyfinTarget {
        JellyfinTarget {
            url: "http://jellyfin:8096".into(),
            token: "token".into(),
            libraries,
            rewriter: Rewriter::default(),
            client: reqwest::Client::new(),
        }
    }

    #[test]
    fn library_lookup_matches_any_location() {
        let target = target_with_libraries(vec![Library {
            name: "Mixed".into(),
            paths: vec!["/Media/Movies/".into(), "/Media/TV/".into()],
        }]);

        assert_eq!(
            target.library_for("/Media/TV/Westworld").map(|l| l.name.as_str()),
            Some("Mixed")
        );
        assert!(target.library_for("/downloads/x").is_none());
    }
}
