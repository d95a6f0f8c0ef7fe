//! Storage adapters.
//!
//! A broker persists its document through exactly one adapter, created
//! from the first session's public URI: `http(s)` schemes map to the
//! remote WOPI-style backend, `file` to the local filesystem backend.
//! The adapter copies the document into the jail for the kit to open and
//! uploads the jailed copy back on save.

pub mod local;
pub mod tokens;
pub mod wopi;

pub use local::LocalStorage;
pub use tokens::TokenLedger;
pub use wopi::WopiStorage;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use url::Url;

use crate::error::{BrokerError, Result};

/// Basic file metadata, as reported by the backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub filename: String,
    pub owner_id: String,
    /// None is the zero sentinel: the instant is unknown.
    pub modified_time: Option<SystemTime>,
}

impl FileInfo {
    pub fn is_valid(&self) -> bool {
        !self.filename.is_empty()
    }
}

/// Outcome of persisting the jailed copy back to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveResult {
    Ok,
    DiskFull,
    Unauthorized,
    Failed,
}

/// Extended metadata from a WOPI host's CheckFileInfo.
#[derive(Debug, Clone)]
pub struct WopiFileInfo {
    pub user_id: String,
    pub user_name: String,
    pub user_can_write: bool,
    pub post_message_origin: Option<String>,
    pub hide_print_option: bool,
    pub hide_save_option: bool,
    pub hide_export_option: bool,
    pub disable_print: bool,
    pub disable_export: bool,
    pub disable_copy: bool,
    pub filename: String,
    pub call_duration: Duration,
}

/// Extended metadata for a locally served document.
#[derive(Debug, Clone)]
pub struct LocalFileInfo {
    pub user_id: String,
    pub user_name: String,
}

/// Tagged extended metadata; which variant arrives is fixed by the
/// adapter, so callers match instead of down-casting.
#[derive(Debug, Clone)]
pub enum ExtendedFileInfo {
    Wopi(WopiFileInfo),
    Local(LocalFileInfo),
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// The storage-side URI of the document.
    fn uri(&self) -> &Url;

    /// Path of the jailed local copy (meaningful once loaded).
    fn root_file_path(&self) -> PathBuf;

    /// Whether the document has been materialized into the jail.
    fn is_loaded(&self) -> bool;

    /// Metadata recorded by the most recent backend round-trip.
    fn file_info(&self) -> FileInfo;

    /// Fetch user-facing metadata; the variant is fixed per adapter.
    async fn extended_info(&mut self, access_token: &str) -> Result<ExtendedFileInfo>;

    /// Copy the document into the jail; returns the local path.
    async fn load_to_local(&mut self, access_token: &str) -> Result<PathBuf>;

    /// Upload the jailed copy back to the backing store.
    async fn save_local_to_storage(&self, access_token: &str) -> SaveResult;

    /// Re-query the backend for fresh metadata after a save.
    async fn refresh_file_info(&mut self, access_token: &str) -> Result<FileInfo>;
}

/// Create the adapter matching a document URI.
pub fn create(public_uri: &Url, jail_root: &Path, jail_path: &Path) -> Result<Box<dyn Storage>> {
    let jail_dir = jail_root.join(jail_path);
    match public_uri.scheme() {
        "http" | "https" => Ok(Box::new(WopiStorage::new(public_uri.clone(), jail_dir))),
        "file" => Ok(Box::new(LocalStorage::new(public_uri.clone(), jail_dir)?)),
        other => Err(BrokerError::Config(format!(
            "unsupported storage scheme [{}]",
            other
        ))),
    }
}
