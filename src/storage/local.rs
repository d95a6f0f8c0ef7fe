//! Local filesystem storage.
//!
//! Serves documents straight off the host filesystem: load copies the
//! file into the jail, save copies it back. User identity comes from the
//! URI query; there is no token ledger for local documents.

use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use tokio::fs;
use url::Url;

use crate::error::{BrokerError, Result};
use crate::storage::{ExtendedFileInfo, FileInfo, LocalFileInfo, SaveResult, Storage};

pub struct LocalStorage {
    uri: Url,
    original_path: PathBuf,
    jail_dir: PathBuf,
    root_file_path: PathBuf,
    loaded: bool,
}

impl LocalStorage {
    pub fn new(uri: Url, jail_dir: PathBuf) -> Result<Self> {
        let original_path = uri
            .to_file_path()
            .map_err(|_| BrokerError::InvalidUri(format!("not a file path: {}", uri)))?;
        let filename = original_path
            .file_name()
            .ok_or_else(|| BrokerError::InvalidUri(format!("no file name in {}", uri)))?
            .to_owned();
        let root_file_path = jail_dir.join(filename);
        Ok(Self {
            uri,
            original_path,
            jail_dir,
            root_file_path,
            loaded: false,
        })
    }

    fn stat_info(&self) -> FileInfo {
        let modified_time = std::fs::metadata(&self.original_path)
            .and_then(|m| m.modified())
            .ok();
        FileInfo {
            filename: self
                .original_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            owner_id: String::new(),
            modified_time,
        }
    }
}

#[async_trait]
impl Storage for LocalStorage {
    fn uri(&self) -> &Url {
        &self.uri
    }

    fn root_file_path(&self) -> PathBuf {
        self.root_file_path.clone()
    }

    fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn file_info(&self) -> FileInfo {
        self.stat_info()
    }

    async fn extended_info(&mut self, _access_token: &str) -> Result<ExtendedFileInfo> {
        let param = |name: &str, fallback: &str| {
            self.uri
                .query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
                .unwrap_or_else(|| fallback.to_string())
        };
        Ok(ExtendedFileInfo::Local(LocalFileInfo {
            user_id: param("userid", "local-user"),
            user_name: param("username", "Local User"),
        }))
    }

    async fn load_to_local(&mut self, _access_token: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.jail_dir).await?;
        fs::copy(&self.original_path, &self.root_file_path)
            .await
            .map_err(map_space_error)?;
        self.loaded = true;
        tracing::info!(
            "Copied [{}] to jail at {:?}",
            self.uri,
            self.root_file_path
        );
        Ok(self.root_file_path.clone())
    }

    async fn save_local_to_storage(&self, _access_token: &str) -> SaveResult {
        match fs::copy(&self.root_file_path, &self.original_path).await {
            Ok(_) => SaveResult::Ok,
            Err(e) if is_out_of_space(&e) => SaveResult::DiskFull,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => SaveResult::Unauthorized,
            Err(e) => {
                tracing::error!("Failed to copy back to [{}]: {}", self.uri, e);
                SaveResult::Failed
            }
        }
    }

    async fn refresh_file_info(&mut self, _access_token: &str) -> Result<FileInfo> {
        Ok(self.stat_info())
    }
}

fn is_out_of_space(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::StorageFull
}

fn map_space_error(e: io::Error) -> crate::error::BrokerError {
    if is_out_of_space(&e) {
        BrokerError::StorageSpaceLow
    } else {
        BrokerError::Io(e)
    }
}
