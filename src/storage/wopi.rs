//! WOPI-style remote storage.
//!
//! The remote host exposes file metadata at the document URI
//! (CheckFileInfo) and the document bytes at `<uri>/contents`, both
//! authorized by an `access_token` query parameter.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::fs;
use url::Url;

use crate::error::{BrokerError, Result};
use crate::storage::{ExtendedFileInfo, FileInfo, SaveResult, Storage, WopiFileInfo};

pub struct WopiStorage {
    uri: Url,
    jail_dir: PathBuf,
    client: reqwest::Client,
    file_info: Option<FileInfo>,
    root_file_path: Option<PathBuf>,
    loaded: bool,
}

impl WopiStorage {
    pub fn new(uri: Url, jail_dir: PathBuf) -> Self {
        Self {
            uri,
            jail_dir,
            client: reqwest::Client::new(),
            file_info: None,
            root_file_path: None,
            loaded: false,
        }
    }

    /// Endpoint with the query replaced by the access token.
    fn endpoint(&self, access_token: &str, contents: bool) -> Url {
        let mut url = self.uri.clone();
        if contents {
            let path = format!("{}/contents", url.path().trim_end_matches('/'));
            url.set_path(&path);
        }
        url.query_pairs_mut()
            .clear()
            .append_pair("access_token", access_token);
        url
    }

    async fn check_file_info(&mut self, access_token: &str) -> Result<WopiFileInfo> {
        let url = self.endpoint(access_token, false);
        let started = Instant::now();

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(BrokerError::StorageConnection(format!(
                "WOPI::CheckFileInfo failed: HTTP {}",
                response.status()
            )));
        }
        let body: serde_json::Value = response.json().await?;
        let call_duration = started.elapsed();

        let str_field = |name: &str| {
            body.get(name)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let bool_field = |name: &str| body.get(name).and_then(|v| v.as_bool()).unwrap_or(false);

        let filename = str_field("BaseFileName");
        self.file_info = Some(FileInfo {
            filename: filename.clone(),
            owner_id: str_field("OwnerId"),
            modified_time: parse_modified_time(body.get("LastModifiedTime")),
        });

        let mut user_name = str_field("UserFriendlyName");
        if user_name.is_empty() {
            user_name = str_field("UserName");
        }
        let post_message_origin = body
            .get("PostMessageOrigin")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        Ok(WopiFileInfo {
            user_id: str_field("UserId"),
            user_name,
            user_can_write: bool_field("UserCanWrite"),
            post_message_origin,
            hide_print_option: bool_field("HidePrintOption"),
            hide_save_option: bool_field("HideSaveOption"),
            hide_export_option: bool_field("HideExportOption"),
            disable_print: bool_field("DisablePrint"),
            disable_export: bool_field("DisableExport"),
            disable_copy: bool_field("DisableCopy"),
            filename,
            call_duration,
        })
    }
}

#[async_trait]
impl Storage for WopiStorage {
    fn uri(&self) -> &Url {
        &self.uri
    }

    fn root_file_path(&self) -> PathBuf {
        self.root_file_path.clone().unwrap_or_default()
    }

    fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn file_info(&self) -> FileInfo {
        self.file_info.clone().unwrap_or(FileInfo {
            filename: String::new(),
            owner_id: String::new(),
            modified_time: None,
        })
    }

    async fn extended_info(&mut self, access_token: &str) -> Result<ExtendedFileInfo> {
        Ok(ExtendedFileInfo::Wopi(
            self.check_file_info(access_token).await?,
        ))
    }

    async fn load_to_local(&mut self, access_token: &str) -> Result<PathBuf> {
        let url = self.endpoint(access_token, true);
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(BrokerError::StorageConnection(format!(
                "WOPI::GetFile failed: HTTP {}",
                response.status()
            )));
        }
        let bytes = response.bytes().await?;

        let filename = match &self.file_info {
            Some(info) if !info.filename.is_empty() => info.filename.clone(),
            _ => self
                .uri
                .path_segments()
                .and_then(|mut s| s.next_back())
                .unwrap_or("document")
                .to_string(),
        };

        fs::create_dir_all(&self.jail_dir).await?;
        let local = self.jail_dir.join(filename);
        fs::write(&local, &bytes).await?;

        self.root_file_path = Some(local.clone());
        self.loaded = true;
        tracing::info!(
            "Downloaded [{}] ({} bytes) into jail at {:?}",
            self.uri,
            bytes.len(),
            local
        );
        Ok(local)
    }

    async fn save_local_to_storage(&self, access_token: &str) -> SaveResult {
        let Some(local) = &self.root_file_path else {
            return SaveResult::Failed;
        };
        let bytes = match fs::read(local).await {
            Ok(b) => b,
            Err(e) => {
                tracing::error!("Cannot read jailed copy {:?}: {}", local, e);
                return SaveResult::Failed;
            }
        };

        let url = self.endpoint(access_token, true);
        match self.client.post(url).body(bytes).send().await {
            Ok(response) => match response.status().as_u16() {
                200 => SaveResult::Ok,
                401 | 403 => SaveResult::Unauthorized,
                507 => SaveResult::DiskFull,
                status => {
                    tracing::error!("WOPI::PutFile failed for [{}]: HTTP {}", self.uri, status);
                    SaveResult::Failed
                }
            },
            Err(e) => {
                tracing::error!("WOPI::PutFile failed for [{}]: {}", self.uri, e);
                SaveResult::Failed
            }
        }
    }

    async fn refresh_file_info(&mut self, access_token: &str) -> Result<FileInfo> {
        self.check_file_info(access_token).await?;
        Ok(self.file_info())
    }
}

/// The host reports the modification instant as epoch seconds, either as
/// a JSON number or a digit string; anything else is the unknown sentinel.
fn parse_modified_time(value: Option<&serde_json::Value>) -> Option<SystemTime> {
    let secs = match value? {
        serde_json::Value::Number(n) => n.as_u64()?,
        serde_json::Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    Some(UNIX_EPOCH + Duration::from_secs(secs))
}
