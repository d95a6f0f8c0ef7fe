//! Document load: storage creation, session admission, jail copy.

use serde_json::json;
use sha1::{Digest, Sha1};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};

use crate::broker::{DocumentBroker, JAILED_DOCUMENT_ROOT};
use crate::error::{BrokerError, Result};
use crate::perm;
use crate::session::ClientSession;
use crate::storage::{self, ExtendedFileInfo, WopiFileInfo};
use crate::tile::TileCache;
use crate::uri;

impl DocumentBroker {
    /// Load the document for one session.
    ///
    /// The first session constructs the storage adapter and materializes
    /// the jailed copy; later sessions reuse both and only re-validate
    /// metadata.
    pub(crate) async fn load(
        &mut self,
        session: &Arc<ClientSession>,
        jail_id: &str,
    ) -> Result<()> {
        let session_id = session.id().to_string();
        tracing::info!(
            "Loading [{}] for session [{}] in jail [{}]",
            self.doc_key,
            session_id,
            jail_id
        );

        if self.mark_to_destroy {
            // Tearing down.
            tracing::warn!(
                "Will not load document marked to destroy. DocKey: [{}]",
                self.doc_key
            );
            return Err(BrokerError::Load("document is marked to destroy".into()));
        }

        self.jail_id = jail_id.to_string();

        // The public URL is not visible inside the chroot jail; the
        // document is copied to a jailed path the kit can open.
        let jail_root = self.child_root.join(jail_id);
        let jail_path = Path::new(JAILED_DOCUMENT_ROOT).join(jail_id);

        let first_instance = self.storage.is_none();
        if first_instance {
            tracing::debug!(
                "Creating new storage instance for URI [{}]",
                session.public_uri()
            );
            self.storage = Some(storage::create(
                session.public_uri(),
                &jail_root,
                &jail_path,
            )?);
        }

        let remote = matches!(session.public_uri().scheme(), "http" | "https");
        let mut permission = session
            .query_param("permission")
            .unwrap_or_else(|| "edit".to_string());
        let mut wopi_call_duration = Duration::ZERO;

        if remote {
            // Access tokens are one-shot unless the host opted out.
            let bypass = session.query_param("docpass").as_deref() == Some("yes");
            if !bypass {
                if let Some(ledger) = &self.ledger {
                    if !ledger.try_consume(session.access_token())? {
                        return Err(BrokerError::StorageConnection(
                            "WOPI::CheckFileInfo failed".into(),
                        ));
                    }
                }
            }
        } else if let Some(rdid) = session.query_param("rdid") {
            // Conversion views: read-only rendering with a title frame.
            permission = "convview".to_string();
            tracing::trace!("Sending to client [{}]", rdid);
            session.send_text_frame(rdid);
        }

        let extended = match self.storage.as_mut() {
            Some(storage) => storage.extended_info(session.access_token()).await?,
            None => return Err(BrokerError::Load("no storage".into())),
        };

        match &extended {
            ExtendedFileInfo::Wopi(info) => {
                if !info.user_can_write {
                    tracing::debug!("Setting session [{}] as readonly", session_id);
                    session.set_read_only();
                }

                // PostMessageOrigin must reach the client immediately so
                // a failed load can still be reported to the host frame.
                let wopi_json = wopi_display_json(info, self.config.ssl_enabled);
                session.send_text_frame(format!("wopi: {}", wopi_json));

                let owner_id = self
                    .storage
                    .as_ref()
                    .map(|s| s.file_info().owner_id)
                    .unwrap_or_default();
                if !info.user_id.is_empty() && info.user_id == owner_id {
                    tracing::debug!("Session [{}] is the document owner", session_id);
                    session.set_document_owner(true);
                }

                session.set_user_id(&info.user_id);
                session.set_user_name(&info.user_name);
                wopi_call_duration = info.call_duration;
            }
            ExtendedFileInfo::Local(info) => {
                session.set_user_id(&info.user_id);
                session.set_user_name(&info.user_name);
            }
        }

        session.send_text_frame(format!(
            "perm: {}",
            perm::load_mask(self.config.perm_file.as_deref(), &permission)?
        ));

        let file_info = match self.storage.as_ref() {
            Some(storage) => storage.file_info(),
            None => return Err(BrokerError::Load("no storage".into())),
        };
        if !file_info.is_valid() {
            tracing::error!("Invalid fileinfo for URI [{}]", session.public_uri());
            return Err(BrokerError::Load("invalid file info".into()));
        }

        if first_instance {
            self.document_last_modified = file_info.modified_time;
        } else if let (Some(ours), Some(theirs)) =
            (self.document_last_modified, file_info.modified_time)
        {
            if ours != theirs {
                tracing::error!(
                    "Document has been modified behind our back, URI [{}]",
                    session.public_uri()
                );
            }
        }

        let already_loaded = self.storage.as_ref().is_some_and(|s| s.is_loaded());
        if !already_loaded {
            let download_start = Instant::now();
            let local_path = match self.storage.as_mut() {
                Some(storage) => storage.load_to_local(session.access_token()).await?,
                None => return Err(BrokerError::Load("no storage".into())),
            };
            self.storage_load_duration = download_start.elapsed();

            if let Ok(bytes) = std::fs::read(&local_path) {
                let mut hasher = Sha1::new();
                hasher.update(&bytes);
                tracing::info!(
                    "SHA1 for docKey [{}] of {:?}: {:x}",
                    self.doc_key,
                    local_path,
                    hasher.finalize()
                );
            }

            self.uri_jailed = Some(uri::jailed_uri(&local_path));
            self.filename = file_info.filename.clone();

            // The local temp file's timestamp is the save-skip baseline.
            let mtime = std::fs::metadata(&local_path).and_then(|m| m.modified()).ok();
            self.last_file_modified = mtime;

            let storage_uri = self
                .storage
                .as_ref()
                .map(|s| s.uri().to_string())
                .unwrap_or_default();
            self.tile_cache = Some(TileCache::new(
                &storage_uri,
                mtime.unwrap_or(UNIX_EPOCH),
                self.cache_root.clone(),
            )?);

            self.set_loaded();
        }

        if remote {
            // Download time plus the CheckFileInfo round-trip.
            let total = self.storage_load_duration + wopi_call_duration;
            let msg = format!("stats: wopiloadduration {}", total.as_secs_f64());
            tracing::trace!("Sending to client [{}]", msg);
            session.send_text_frame(msg);
        }

        Ok(())
    }
}

/// Host properties relevant to the client, as one JSON object.
fn wopi_display_json(info: &WopiFileInfo, ssl_enabled: bool) -> String {
    let mut obj = serde_json::Map::new();
    if let Some(origin) = &info.post_message_origin {
        let mut origin = origin.clone();
        if ssl_enabled && origin.starts_with("http://") {
            // Clients served over TLS may only post to secure origins.
            origin.replace_range(..4, "https");
            tracing::debug!("Updating PostMessageOrigin scheme to HTTPS: [{}]", origin);
        }
        obj.insert("PostMessageOrigin".into(), json!(origin));
    }
    obj.insert("HidePrintOption".into(), json!(info.hide_print_option));
    obj.insert("HideSaveOption".into(), json!(info.hide_save_option));
    obj.insert("HideExportOption".into(), json!(info.hide_export_option));
    obj.insert("DisablePrint".into(), json!(info.disable_print));
    obj.insert("DisableExport".into(), json!(info.disable_export));
    obj.insert("DisableCopy".into(), json!(info.disable_copy));
    obj.insert("title".into(), json!(info.filename));
    serde_json::Value::Object(obj).to_string()
}
