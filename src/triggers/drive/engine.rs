use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use log::{debug, trace};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::AutoscanError;
use crate::triggers::drive::diff::{Changed, DriveDiff, DriveFile, DriveFolder};
use crate::triggers::drive::limiter::AccountLimiter;
use crate::triggers::drive::store::{ChangeSet, MirrorStore};
use crate::triggers::drive::{Hook, SyncEngine, SyncError};

const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.readonly";
const API_BASE: &str = "https://www.googleapis.com/drive/v3";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

const CHANGE_FIELDS: &str = "nextPageToken,newStartPageToken,\
changes(changeType,removed,fileId,file(id,name,mimeType,parents,trashed,size,md5Checksum))";
const FILE_FIELDS: &str =
    "nextPageToken,files(id,name,mimeType,parents,trashed,size,md5Checksum)";

#[derive(Deserialize)]
struct ServiceAccount {
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_owned()
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

struct CachedToken {
    value: String,
    expires: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ApiFile {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    trashed: bool,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    md5_checksum: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Change {
    #[serde(default)]
    change_type: String,
    #[serde(default)]
    removed: bool,
    #[serde(default)]
    file_id: Option<String>,
    #[serde(default)]
    file: Option<ApiFile>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeList {
    #[serde(default)]
    changes: Vec<Change>,
    next_page_token: Option<String>,
    new_start_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<ApiFile>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartPageToken {
    start_page_token: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Change-feed engine for shared drives, authenticated through a service
/// account. Mirror writes and page-token advancement commit together, so a
/// crash mid-sync replays the same delta.
pub struct DriveEngine {
    account: ServiceAccount,
    key: EncodingKey,
    client: reqwest::Client,
    store: Arc<MirrorStore>,
    limiter: Arc<AccountLimiter>,
    token: tokio::sync::Mutex<Option<CachedToken>>,
}

impl DriveEngine {
    pub fn new(
        account_path: &Path,
        store: Arc<MirrorStore>,
        limiter: Arc<AccountLimiter>,
    ) -> Result<Arc<Self>, AutoscanError> {
        let raw = std::fs::read(account_path).map_err(|err| {
            AutoscanError::Config(format!(
                "failed reading account {}: {err}",
                account_path.display()
            ))
        })?;

        let account: ServiceAccount = serde_json::from_slice(&raw).map_err(|err| {
            AutoscanError::Config(format!(
                "failed decoding account {}: {err}",
                account_path.display()
            ))
        })?;

        let key = EncodingKey::from_rsa_pem(account.private_key.as_bytes()).map_err(|err| {
            AutoscanError::Config(format!(
                "invalid private key in {}: {err}",
                account_path.display()
            ))
        })?;

        Ok(Arc::new(Self {
            account,
            key,
            client: reqwest::Client::new(),
            store,
            limiter,
            token: tokio::sync::Mutex::new(None),
        }))
    }

    async fn access_token(&self) -> Result<String, SyncError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires > Utc::now() + Duration::seconds(60) {
                return Ok(token.value.clone());
            }
        }

        let now = Utc::now();
        let claims = Claims {
            iss: &self.account.client_email,
            scope: DRIVE_SCOPE,
            aud: &self.account.token_uri,
            iat: now.timestamp(),
            exp: (now + Duration::seconds(3600)).timestamp(),
        };

        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|err| SyncError::InvalidCredentials(format!("signing jwt: {err}")))?;

        let res = self
            .client
            .post(&self.account.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|err| SyncError::Network(format!("token exchange: {err}")))?;

        let status = res.status();
        if !status.is_success() {
            return Err(status_error(status, "token exchange"));
        }

        let token: TokenResponse = res
            .json()
            .await
            .map_err(|err| SyncError::DataAnomaly(format!("decoding token response: {err}")))?;

        let value = token.access_token.clone();
        *cached = Some(CachedToken {
            value: token.access_token,
            expires: now + Duration::seconds(token.expires_in),
        });

        debug!("Refreshed drive access token");
        Ok(value)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, SyncError> {
        self.limiter.wait().await;
        let token = self.access_token().await?;

        let res = self
            .client
            .get(url)
            .query(query)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| SyncError::Network(format!("{url}: {err}")))?;

        let status = res.status();
        if !status.is_success() {
            return Err(status_error(status, url));
        }

        res.json()
            .await
            .map_err(|err| SyncError::DataAnomaly(format!("decoding {url}: {err}")))
    }
}

#[async_trait]
impl SyncEngine for DriveEngine {
    async fn full_sync(&self, drive_id: &str) -> Result<(), SyncError> {
        // the token is taken first so changes landing during the
        // enumeration replay in the first delta
        let start: StartPageToken = self
            .get_json(
                &format!("{API_BASE}/changes/startPageToken"),
                &[("driveId", drive_id), ("supportsAllDrives", "true")],
            )
            .await?;

        let mut folders = Vec::new();
        let mut files = Vec::new();
        let mut page_token = String::new();

        loop {
            let mut query = vec![
                ("corpora", "drive"),
                ("driveId", drive_id),
                ("includeItemsFromAllDrives", "true"),
                ("supportsAllDrives", "true"),
                ("pageSize", "1000"),
                ("fields", FILE_FIELDS),
            ];
            if !page_token.is_empty() {
                query.push(("pageToken", page_token.as_str()));
            }

            let page: FileList = self.get_json(&format!("{API_BASE}/files"), &query).await?;

            for item in &page.files {
                if item.mime_type == FOLDER_MIME {
                    folders.push(to_drive_folder(item)?);
                } else {
                    files.push(to_drive_file(item)?);
                }
            }

            match page.next_page_token {
                Some(token) => page_token = token,
                None => break,
            }
        }

        trace!(
            "Full sync fetched {} folders and {} files: {drive_id}",
            folders.len(),
            files.len()
        );

        self.store
            .replace_drive(drive_id, &folders, &files, &start.start_page_token)
            .map_err(SyncError::Other)
    }

    async fn partial_sync(&self, drive_id: &str, hooks: &mut [Hook<'_>]) -> Result<(), SyncError> {
        let mut page_token = self
            .store
            .page_token(drive_id)
            .map_err(SyncError::Other)?
            .ok_or_else(|| {
                SyncError::DataAnomaly(format!("partial sync without page token: {drive_id}"))
            })?;

        let mut changes = Vec::new();
        let final_token;

        loop {
            let page: ChangeList = self
                .get_json(
                    &format!("{API_BASE}/changes"),
                    &[
                        ("pageToken", page_token.as_str()),
                        ("driveId", drive_id),
                        ("includeItemsFromAllDrives", "true"),
                        ("supportsAllDrives", "true"),
                        ("pageSize", "1000"),
                        ("fields", CHANGE_FIELDS),
                    ],
                )
                .await?;

            changes.extend(page.changes);

            if let Some(token) = page.next_page_token {
                page_token = token;
                continue;
            }

            final_token = page.new_start_page_token.ok_or_else(|| {
                SyncError::DataAnomaly(format!("change feed ended without a token: {drive_id}"))
            })?;
            break;
        }

        let changes = dedupe_changes(changes);
        let (mut diff, change_set) = build_diff(&self.store, drive_id, &changes)?;

        for hook in hooks {
            hook(&mut diff).map_err(SyncError::Other)?;
        }

        self.store
            .apply_changes(drive_id, &change_set, &final_token)
            .map_err(SyncError::Other)
    }
}

fn status_error(status: StatusCode, context: &str) -> SyncError {
    match status.as_u16() {
        401 => SyncError::InvalidCredentials(format!("{context}: {status}")),
        403 | 429 | 500..=599 => SyncError::Network(format!("{context}: {status}")),
        _ => SyncError::Fatal(format!("{context}: {status}")),
    }
}

/// The feed may mention one item several times within a delta; only the
/// latest state matters.
pub(crate) fn dedupe_changes(changes: Vec<Change>) -> Vec<Change> {
    let mut by_id: HashMap<String, usize> = HashMap::new();
    let mut deduped: Vec<Option<Change>> = Vec::with_capacity(changes.len());

    for change in changes {
        if change.change_type != "file" {
            continue;
        }

        let Some(id) = change_id(&change) else {
            continue;
        };

        match by_id.get(&id) {
            Some(&idx) => deduped[idx] = Some(change),
            None => {
                by_id.insert(id, deduped.len());
                deduped.push(Some(change));
            }
        }
    }

    deduped.into_iter().flatten().collect()
}

fn change_id(change: &Change) -> Option<String> {
    change
        .file_id
        .clone()
        .or_else(|| change.file.as_ref().map(|file| file.id.clone()))
}

/// Classifies the delta against the mirror's pre-sync state into the diff
/// consumed by hooks and the row changes applied afterwards.
pub(crate) fn build_diff(
    store: &MirrorStore,
    drive_id: &str,
    changes: &[Change],
) -> Result<(DriveDiff, ChangeSet), SyncError> {
    let mut diff = DriveDiff::default();
    let mut change_set = ChangeSet::default();

    for change in changes {
        let Some(id) = change_id(change) else {
            continue;
        };

        let old_file = store.get_file(drive_id, &id).map_err(SyncError::Other)?;
        let old_folder = store.get_folder(drive_id, &id).map_err(SyncError::Other)?;

        if change.removed {
            if let Some(old) = old_file {
                change_set.removed_file_ids.push(id);
                diff.removed_files.push(old);
            } else if let Some(old) = old_folder {
                change_set.removed_folder_ids.push(id);
                diff.removed_folders.push(old);
            }

            // removals of items the mirror never saw carry no paths
            continue;
        }

        let Some(item) = change.file.as_ref() else {
            continue;
        };

        if item.mime_type == FOLDER_MIME {
            let new = to_drive_folder(item)?;
            change_set.folders.push(new.clone());

            match old_folder {
                Some(old) => diff.changed_folders.push(Changed { old, new }),
                None => diff.added_folders.push(new),
            }
        } else {
            let new = to_drive_file(item)?;
            change_set.files.push(new.clone());

            match old_file {
                Some(old) => diff.changed_files.push(Changed { old, new }),
                None => diff.added_files.push(new),
            }
        }
    }

    Ok((diff, change_set))
}

fn to_drive_folder(item: &ApiFile) -> Result<DriveFolder, SyncError> {
    Ok(DriveFolder {
        id: item.id.clone(),
        name: item.name.clone(),
        parent: parent_of(item)?,
        trashed: item.trashed,
    })
}

fn to_drive_file(item: &ApiFile) -> Result<DriveFile, SyncError> {
    let size = match item.size.as_deref() {
        Some(raw) => raw
            .parse()
            .map_err(|_| SyncError::DataAnomaly(format!("bad file size {raw:?}: {}", item.id)))?,
        None => 0,
    };

    Ok(DriveFile {
        id: item.id.clone(),
        name: item.name.clone(),
        parent: parent_of(item)?,
        trashed: item.trashed,
        size,
        md5: item.md5_checksum.clone().unwrap_or_default(),
    })
}

fn parent_of(item: &ApiFile) -> Result<String, SyncError> {
    item.parents
        .first()
        .cloned()
        .ok_or_else(|| SyncError::DataAnomaly(format!("item without parent: {}", item.id)))
}
