//! The save state machine.
//!
//! Idle -> Requested via [`DocumentBroker::send_uno_save`]; Requested ->
//! Acked when the kit's save acknowledgement reaches
//! [`DocumentBroker::save_to_storage`]. While a request is younger than
//! the command timeout the loop does nothing else; an ack that never
//! arrives is re-issued by the next autosave tick, not retried.

use serde_json::json;
use std::time::Instant;

use crate::broker::DocumentBroker;

impl DocumentBroker {
    /// Save the document if warranted; returns whether a save command
    /// was dispatched to the kit.
    ///
    /// Unforced saves require a modified document and fire on either
    /// sustained inactivity or enough time since the last save. Forced
    /// saves always fire (the kit skips the actual write when the
    /// document is unmodified).
    pub fn auto_save(&mut self, force: bool) -> bool {
        if self.sessions.is_empty()
            || self.storage.is_none()
            || !self.loaded
            || !self.child.as_ref().is_some_and(|c| c.is_alive())
            || (!self.modified && !force)
        {
            tracing::trace!("Nothing to autosave [{}]", self.doc_key);
            return false;
        }

        // Save with the owner session when present, else the first one.
        let mut saving_session_id = String::new();
        for (id, session) in &self.sessions {
            if saving_session_id.is_empty() {
                saving_session_id = id.clone();
            }
            if session.is_document_owner() {
                saving_session_id = id.clone();
                break;
            }
        }

        if force {
            tracing::trace!("Sending forced save command for [{}]", self.doc_key);
            return self.send_uno_save(&saving_session_id, true, true);
        }

        if self.modified {
            let now = Instant::now();
            let inactivity = now.duration_since(self.last_activity_time);
            let since_last_save = now.duration_since(self.last_save_time);
            tracing::trace!(
                "Time since last save of docKey [{}] is {}ms, most recent activity {}ms ago",
                self.doc_key,
                since_last_save.as_millis(),
                inactivity.as_millis()
            );

            // Either we've been idle long enough, or it's auto-save time.
            if inactivity.as_millis() as u64 >= self.config.idle_save_duration_ms
                || since_last_save.as_millis() as u64 >= self.config.auto_save_duration_ms
            {
                tracing::trace!("Sending timed save command for [{}]", self.doc_key);
                return self.send_uno_save(&saving_session_id, true, true);
            }
        }

        false
    }

    /// Idle -> Requested: forward `.uno:Save` to the kit for a session.
    pub fn send_uno_save(
        &mut self,
        session_id: &str,
        dont_terminate_edit: bool,
        dont_save_if_unmodified: bool,
    ) -> bool {
        tracing::info!("Saving doc [{}]", self.doc_key);

        if !self.sessions.contains_key(session_id) {
            tracing::error!("Failed to save doc [{}]: No valid sessions", self.doc_key);
            return false;
        }

        // Invalidate the timestamp to force persisting.
        self.last_file_modified = None;

        let mut args = serde_json::Map::new();
        if dont_terminate_edit {
            // A save must not kick the user out of edit mode.
            args.insert(
                "DontTerminateEdit".into(),
                json!({"type": "boolean", "value": true}),
            );
        }
        if dont_save_if_unmodified {
            args.insert(
                "DontSaveIfUnmodified".into(),
                json!({"type": "boolean", "value": true}),
            );
        }

        let command = format!("uno .uno:Save {}", serde_json::Value::Object(args));
        self.forward_to_child(session_id, &command);
        self.last_save_request_time = Instant::now();
        true
    }

    /// Requested -> Acked: the kit confirmed (or skipped) the save; decide
    /// whether to persist to storage, then settle deferred removals.
    pub async fn save_to_storage(
        &mut self,
        session_id: &str,
        success: bool,
        result: &str,
    ) -> bool {
        let res = self.save_to_storage_internal(session_id, success, result).await;

        // If marked to destroy, or the session is disconnecting, remove it.
        let close_frame = self
            .sessions
            .get(session_id)
            .is_some_and(|s| s.is_close_frame());
        if self.mark_to_destroy || close_frame {
            self.remove_session_internal(session_id);
        }

        // If marked to destroy, this was the last session.
        if self.mark_to_destroy || self.sessions.is_empty() {
            self.stop = true;
        }

        res
    }

    async fn save_to_storage_internal(
        &mut self,
        session_id: &str,
        success: bool,
        result: &str,
    ) -> bool {
        tracing::debug!(
            "Saving to storage docKey [{}] for session [{}]. Success: {}, result: {}",
            self.doc_key,
            session_id,
            success,
            result
        );

        // The kit skipped the write because nothing changed; the waiting
        // state still resolves.
        if !success && result == "unmodified" {
            tracing::debug!("Save skipped as document [{}] was not modified", self.doc_key);
            self.last_save_time = Instant::now();
            return true;
        }

        let Some(session) = self.sessions.get(session_id).cloned() else {
            tracing::error!(
                "Session [{}] not found while saving docKey [{}]",
                session_id,
                self.doc_key
            );
            return false;
        };
        let access_token = session.access_token().to_string();

        let root_path = self.storage.as_ref().map(|s| s.root_file_path());
        let new_file_modified = root_path
            .as_deref()
            .and_then(|p| std::fs::metadata(p).and_then(|m| m.modified()).ok());

        // Unless this is the departing last editor, an unchanged file
        // timestamp means there is nothing to upload.
        if !self.last_editable_session
            && new_file_modified.is_some()
            && new_file_modified == self.last_file_modified
        {
            tracing::debug!(
                "Skipping unnecessary saving to storage for docKey [{}]",
                self.doc_key
            );
            self.last_save_time = Instant::now();
            return true;
        }

        tracing::debug!("Persisting [{}] to storage", self.doc_key);

        let save_result = match self.storage.as_ref() {
            Some(storage) => storage.save_local_to_storage(&access_token).await,
            None => return false,
        };

        match save_result {
            crate::storage::SaveResult::Ok => {
                self.modified = false;
                if let Some(cache) = &mut self.tile_cache {
                    cache.set_unsaved_changes(false);
                }
                self.last_file_modified = new_file_modified;
                if let (Some(cache), Some(t)) = (&self.tile_cache, new_file_modified) {
                    cache.save_last_modified(t);
                }
                self.last_save_time = Instant::now();

                // Pick up the storage-side timestamp of what we just wrote.
                match self.storage.as_mut() {
                    Some(storage) => match storage.refresh_file_info(&access_token).await {
                        Ok(info) => self.document_last_modified = info.modified_time,
                        Err(e) => {
                            tracing::warn!(
                                "Failed to refresh file info for [{}]: {}",
                                self.doc_key,
                                e
                            );
                        }
                    },
                    None => {}
                }

                tracing::debug!("Saved docKey [{}] and updated tile cache", self.doc_key);
                true
            }
            crate::storage::SaveResult::DiskFull => {
                tracing::warn!(
                    "Disk full while saving docKey [{}]. Making all sessions read-only",
                    self.doc_key
                );
                for other in self.sessions.values() {
                    other.set_read_only();
                    other.send_text_frame("error: cmd=storage kind=savediskfull");
                }
                false
            }
            crate::storage::SaveResult::Unauthorized => {
                tracing::error!(
                    "Cannot save docKey [{}]: invalid or expired access token",
                    self.doc_key
                );
                session.send_text_frame("error: cmd=storage kind=saveunauthorized");
                false
            }
            crate::storage::SaveResult::Failed => {
                tracing::error!("Failed to save docKey [{}] to storage", self.doc_key);
                session.send_text_frame("error: cmd=storage kind=savefailed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::admin::NoopAdmin;
    use crate::broker::{BrokerRegistry, DocumentBroker};
    use crate::child::{ChildProcess, KitSpawner};
    use crate::config::BrokerConfig;
    use async_trait::async_trait;
    use std::sync::Arc;
    use url::Url;

    struct NeverSpawner;

    #[async_trait]
    impl KitSpawner for NeverSpawner {
        async fn spawn(&self) -> Option<ChildProcess> {
            None
        }
    }

    fn broker(dir: &std::path::Path) -> DocumentBroker {
        let config = Arc::new(BrokerConfig::with_roots(
            dir.join("cache"),
            dir.join("jails"),
        ));
        let uri = Url::parse("file:///tmp/save-unit.odt").unwrap();
        let doc_key = crate::uri::doc_key(&uri);
        DocumentBroker::new(
            uri,
            doc_key,
            config,
            Arc::new(NeverSpawner),
            Arc::new(NoopAdmin),
            Arc::new(BrokerRegistry::new()),
            None,
        )
        .0
    }

    #[tokio::test]
    async fn test_send_uno_save_requires_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = broker(dir.path());
        assert!(!b.send_uno_save("ghost", true, true));
    }

    #[tokio::test]
    async fn test_auto_save_noop_before_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = broker(dir.path());
        assert!(!b.auto_save(true));
        assert!(!b.auto_save(false));
    }

    #[tokio::test]
    async fn test_unmodified_ack_resolves_wait() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = broker(dir.path());
        let before = b.last_save_time;
        assert!(b.save_to_storage("any", false, "unmodified").await);
        assert!(b.last_save_time >= before);
    }
}
