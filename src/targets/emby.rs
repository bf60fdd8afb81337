use async_trait::async_trait;
use log::{info, trace};
use serde::{Deserialize, Serialize};

use crate::error::AutoscanError;
use crate::rewrite::{Rewrite, Rewriter};
use crate::scan::Scan;
use crate::targets::{check_status, send_error, Target};
use crate::utils::join_url;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmbyConfig {
    pub url: String,
    pub token: String,
    #[serde(default)]
    pub rewrite: Vec<Rewrite>,
    #[serde(default)]
    pub verbosity: Option<String>,
}

#[derive(Serialize)]
pub(crate) struct UpdatePayload {
    #[serde(rename = "Updates")]
    pub updates: Vec<Update>,
}

#[derive(Serialize)]
pub(crate) struct Update {
    pub path: String,
    #[serde(rename = "updateType")]
    pub update_type: &'static str,
}

pub struct EmbyTarget {
    url: String,
    token: String,
    rewriter: Rewriter,
    client: reqwest::Client,
}

impl EmbyTarget {
    pub fn new(config: EmbyConfig) -> Result<Self, AutoscanError> {
        Ok(Self {
            url: config.url,
            token: config.token,
            rewriter: Rewriter::new(&config.rewrite)?,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl Target for EmbyTarget {
    async fn available(&self) -> Result<(), AutoscanError> {
        let res = self
            .client
            .get(join_url(&self.url, &["emby", "System", "Info"]))
            .header("X-Emby-Token", &self.token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|err| send_error(err, "emby"))?;

        check_status(res.status(), "emby")
    }

    async fn scan(&self, scan: &Scan) -> Result<(), AutoscanError> {
        let folder = self.rewriter.rewrite(&scan.folder);
        trace!("Sending scan request to emby: {folder}");

        let payload = UpdatePayload {
            updates: vec![Update {
                path: folder.clone(),
                update_type: "Created",
            }],
        };

        let res = self
            .client
            .post(join_url(&self.url, &["Library", "Media", "Updated"]))
            .header("X-Emby-Token", &self.token)
            .json(&payload)
            .send()
            .await
            .map_err(|err| send_error(err, "emby"))?;

        check_status(res.status(), "emby")?;
        info!("Scan moved to emby: {folder}");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_uses_emby_field_names() {
        let payload = UpdatePayload {
            updates: vec![Update {
                path: "/Media/Movies/Film".into(),
                update_type: "Created",
            }],
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "Updates": [{"path": "/Media/Movies/Film", "updateType": "Created"}]
            })
        );
    }
}
