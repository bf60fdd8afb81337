use async_trait::async_trait;
use log::{info, trace};
use serde::Deserialize;

use crate::error::AutoscanError;
use crate::rewrite::{Rewrite, Rewriter};
use crate::scan::Scan;
use crate::targets::{check_status, send_error, Target};
use crate::utils::join_url;

/// Forwards scans to a downstream autoscan instance through its manual
/// trigger, letting several instances share one pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutoscanPeerConfig {
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub rewrite: Vec<Rewrite>,
    #[serde(default)]
    pub verbosity: Option<String>,
}

pub struct AutoscanPeerTarget {
    url: String,
    username: String,
    password: String,
    rewriter: Rewriter,
    client: reqwest::Client,
}

impl AutoscanPeerTarget {
    pub fn new(config: AutoscanPeerConfig) -> Result<Self, AutoscanError> {
        Ok(Self {
            url: config.url,
            username: config.username,
            password: config.password,
            rewriter: Rewriter::new(&config.rewrite)?,
            client: reqwest::Client::new(),
        })
    }

    fn with_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.username.is_empty() || self.password.is_empty() {
            return req;
        }

        req.basic_auth(&self.username, Some(&self.password))
    }
}

#[async_trait]
impl Target for AutoscanPeerTarget {
    async fn available(&self) -> Result<(), AutoscanError> {
        let req = self.client.get(join_url(&self.url, &["health"]));
        let res = self
            .with_auth(req)
            .send()
            .await
            .map_err(|err| send_error(err, "autoscan"))?;

        check_status(res.status(), "autoscan")
    }

    async fn scan(&self, scan: &Scan) -> Result<(), AutoscanError> {
        let folder = self.rewriter.rewrite(&scan.folder);
        trace!("Sending scan request to autoscan peer: {folder}");

        let req = self
            .client
            .post(join_url(&self.url, &["triggers", "manual"]))
            .query(&[("dir", folder.as_str())]);

        let res = self
            .with_auth(req)
            .send()
            .await
            .map_err(|err| send_error(err, "autoscan"))?;

        check_status(res.status(), "autoscan")?;
        info!("Scan moved to autoscan peer: {folder}");

        Ok(())
    }
}
