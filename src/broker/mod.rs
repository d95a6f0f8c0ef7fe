//! The document broker: one control loop per open document.
//!
//! A broker binds its document to exactly one kit process, owns the
//! session registry, the storage adapter and the tile cache, and drives
//! autosave, idle termination and shutdown. All broker state is mutated
//! by the loop task alone; everything outside posts work through the
//! command channel of a [`BrokerHandle`].
//!
//! ## Module Organization
//!
//! - `registry.rs` - process-wide broker registry and shutdown flag
//! - `load.rs` - document load and per-session admission
//! - `save.rs` - the save state machine
//! - `tiles.rs` - tile request/response coordination with the cache

pub mod load;
pub mod registry;
pub mod save;
pub mod tiles;

pub use registry::BrokerRegistry;

use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::admin::AdminSink;
use crate::child::{ChildIngress, ChildProcess, KitSpawner};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::protocol;
use crate::session::{ClientSession, ENDPOINT_GOING_AWAY};
use crate::storage::{Storage, TokenLedger};
use crate::tile::{TileCache, TileCombined, TileDesc};
use crate::uri;

/// Jail-relative directory the document is copied into for the kit.
const JAILED_DOCUMENT_ROOT: &str = "user/docs";

/// Pause between child-acquisition attempts.
const CHILD_SPAWN_RETRY_MS: u64 = 200;

pub type BrokerCallback = Box<dyn FnOnce(&mut DocumentBroker) + Send>;

/// Work posted to a broker loop, drained at the top of each tick.
pub enum BrokerCommand {
    AddSession {
        session: Arc<ClientSession>,
        reply: Option<oneshot::Sender<Result<usize>>>,
    },
    RemoveSession {
        id: String,
        destroy_if_last: bool,
    },
    ForwardToChild {
        view_id: String,
        message: String,
    },
    TileRequest {
        session_id: String,
        tile: TileDesc,
    },
    TileCombinedRequest {
        session_id: String,
        tiles: TileCombined,
    },
    CancelTileRequests {
        session_id: String,
    },
    InvalidateTiles {
        selector: String,
    },
    CloseDocument {
        reason: String,
    },
    Callback(BrokerCallback),
    Stop,
}

/// Cloneable reference to a broker loop. This is the only way other
/// tasks interact with a broker; the loop owns all of its state.
#[derive(Clone)]
pub struct BrokerHandle {
    doc_key: String,
    tx: mpsc::UnboundedSender<BrokerCommand>,
}

impl BrokerHandle {
    pub fn doc_key(&self) -> &str {
        &self.doc_key
    }

    /// Whether the loop is still draining its queue.
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn send(&self, cmd: BrokerCommand) -> bool {
        self.tx.send(cmd).is_ok()
    }

    /// Enqueue a closure to run on the loop with exclusive broker access.
    pub fn add_callback(&self, f: impl FnOnce(&mut DocumentBroker) + Send + 'static) -> bool {
        self.send(BrokerCommand::Callback(Box::new(f)))
    }

    /// Attach a session and wait for the admission result.
    pub async fn add_session(&self, session: Arc<ClientSession>) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        if !self.send(BrokerCommand::AddSession {
            session,
            reply: Some(reply),
        }) {
            return Err(BrokerError::Load("broker loop is gone".into()));
        }
        rx.await
            .map_err(|_| BrokerError::Load("broker loop is gone".into()))?
    }

    pub fn remove_session(&self, id: impl Into<String>, destroy_if_last: bool) -> bool {
        self.send(BrokerCommand::RemoveSession {
            id: id.into(),
            destroy_if_last,
        })
    }

    pub fn forward_to_child(&self, view_id: impl Into<String>, message: impl Into<String>) -> bool {
        self.send(BrokerCommand::ForwardToChild {
            view_id: view_id.into(),
            message: message.into(),
        })
    }

    pub fn request_tile(&self, session_id: impl Into<String>, tile: TileDesc) -> bool {
        self.send(BrokerCommand::TileRequest {
            session_id: session_id.into(),
            tile,
        })
    }

    pub fn request_tiles(&self, session_id: impl Into<String>, tiles: TileCombined) -> bool {
        self.send(BrokerCommand::TileCombinedRequest {
            session_id: session_id.into(),
            tiles,
        })
    }

    pub fn cancel_tile_requests(&self, session_id: impl Into<String>) -> bool {
        self.send(BrokerCommand::CancelTileRequests {
            session_id: session_id.into(),
        })
    }

    pub fn invalidate_tiles(&self, selector: impl Into<String>) -> bool {
        self.send(BrokerCommand::InvalidateTiles {
            selector: selector.into(),
        })
    }

    pub fn close_document(&self, reason: impl Into<String>) -> bool {
        self.send(BrokerCommand::CloseDocument {
            reason: reason.into(),
        })
    }

    /// Ask the loop to stop and wake it.
    pub fn stop(&self) -> bool {
        self.send(BrokerCommand::Stop)
    }
}

pub struct DocumentBroker {
    doc_key: String,
    doc_id: String,
    uri_public: Url,
    uri_jailed: Option<String>,
    jail_id: String,
    filename: String,
    child_root: PathBuf,
    /// Per-document tile cache directory.
    cache_root: PathBuf,

    config: Arc<BrokerConfig>,
    spawner: Arc<dyn KitSpawner>,
    admin: Arc<dyn AdminSink>,
    registry: Arc<BrokerRegistry>,
    ledger: Option<Arc<TokenLedger>>,

    storage: Option<Box<dyn Storage>>,
    tile_cache: Option<TileCache>,
    child: Option<ChildProcess>,
    sessions: HashMap<String, Arc<ClientSession>>,

    rx: mpsc::UnboundedReceiver<BrokerCommand>,
    tx: mpsc::UnboundedSender<BrokerCommand>,

    thread_start: Instant,
    load_duration: Duration,
    /// Time spent downloading the document from storage.
    storage_load_duration: Duration,
    last_save_time: Instant,
    last_save_request_time: Instant,
    /// mtime of the jailed copy; None is the zero sentinel forcing the
    /// next save to persist.
    last_file_modified: Option<SystemTime>,
    /// Storage-side modification instant, for external-edit detection.
    document_last_modified: Option<SystemTime>,
    last_activity_time: Instant,

    mark_to_destroy: bool,
    last_editable_session: bool,
    loaded: bool,
    modified: bool,
    stop: bool,
    close_reason: String,

    cursor: (i32, i32, i32, i32),
    tile_version: i32,
}

impl DocumentBroker {
    /// Create a broker, claim its docKey in the registry and start its
    /// loop. The handle is the caller's only way in.
    pub fn create(
        uri_public: Url,
        config: Arc<BrokerConfig>,
        spawner: Arc<dyn KitSpawner>,
        admin: Arc<dyn AdminSink>,
        registry: Arc<BrokerRegistry>,
        ledger: Option<Arc<TokenLedger>>,
    ) -> Result<BrokerHandle> {
        let ledger = match (ledger, &config.token_db_path) {
            (Some(ledger), _) => Some(ledger),
            (None, Some(path)) => Some(Arc::new(TokenLedger::open(path)?)),
            (None, None) => None,
        };
        let doc_key = uri::doc_key(&uri_public);
        let (broker, handle) =
            Self::new(uri_public, doc_key.clone(), config, spawner, admin, registry.clone(), ledger);
        if !registry.register(handle.clone()) {
            return Err(BrokerError::Config(format!(
                "a live broker already exists for docKey [{}]",
                doc_key
            )));
        }
        tokio::spawn(broker.poll_loop());
        Ok(handle)
    }

    pub fn new(
        uri_public: Url,
        doc_key: String,
        config: Arc<BrokerConfig>,
        spawner: Arc<dyn KitSpawner>,
        admin: Arc<dyn AdminSink>,
        registry: Arc<BrokerRegistry>,
        ledger: Option<Arc<TokenLedger>>,
    ) -> (Self, BrokerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let cache_root = uri::cache_path(&config.cache_root, uri_public.as_str());
        let doc_id = registry.next_doc_id();

        tracing::info!(
            "DocumentBroker [{}] created with docKey [{}]",
            uri_public,
            doc_key
        );

        let handle = BrokerHandle {
            doc_key: doc_key.clone(),
            tx: tx.clone(),
        };
        let broker = Self {
            doc_key,
            doc_id,
            uri_public,
            uri_jailed: None,
            jail_id: String::new(),
            filename: String::new(),
            child_root: config.child_root.clone(),
            cache_root,
            config,
            spawner,
            admin,
            registry,
            ledger,
            storage: None,
            tile_cache: None,
            child: None,
            sessions: HashMap::new(),
            rx,
            tx,
            thread_start: now,
            load_duration: Duration::ZERO,
            storage_load_duration: Duration::ZERO,
            last_save_time: now,
            last_save_request_time: now,
            last_file_modified: None,
            document_last_modified: None,
            last_activity_time: now,
            mark_to_destroy: false,
            last_editable_session: false,
            loaded: false,
            modified: false,
            stop: false,
            close_reason: "stopped".to_string(),
            cursor: (0, 0, 0, 0),
            tile_version: 0,
        };
        (broker, handle)
    }

    pub fn doc_key(&self) -> &str {
        &self.doc_key
    }

    pub fn public_uri(&self) -> &Url {
        &self.uri_public
    }

    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle {
            doc_key: self.doc_key.clone(),
            tx: self.tx.clone(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn is_marked_to_destroy(&self) -> bool {
        self.mark_to_destroy
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_activity_time.elapsed()
    }

    pub fn set_modified(&mut self, value: bool) {
        self.modified = value;
        if let Some(cache) = &mut self.tile_cache {
            cache.set_unsaved_changes(value);
        }
    }

    pub fn set_cursor(&mut self, x: i32, y: i32, width: i32, height: i32) {
        self.cursor = (x, y, width, height);
    }

    fn set_loaded(&mut self) {
        if !self.loaded {
            self.loaded = true;
            self.load_duration = self.thread_start.elapsed();
            tracing::trace!(
                "Document [{}] loaded in {}ms",
                self.doc_key,
                self.load_duration.as_millis()
            );
        }
    }

    pub fn update_last_activity(&mut self) {
        self.last_activity_time = Instant::now();
        self.admin.update_last_activity(&self.doc_key);
    }

    // ========== The poll loop ==========

    /// The inner heart of the broker. Runs to completion, then the broker
    /// deregisters and drops.
    pub async fn poll_loop(mut self) {
        tracing::info!("Starting broker loop for docKey [{}]", self.doc_key);
        self.thread_start = Instant::now();

        if !self.acquire_child().await {
            tracing::error!("Failed to get new child for docKey [{}]", self.doc_key);
            self.stop = true;
            self.registry.deregister(&self.doc_key);
            tracing::info!("Finished broker loop for docKey [{}]", self.doc_key);
            return;
        }

        let mut ingress = match self.child.as_mut().and_then(ChildProcess::take_ingress) {
            Some(rx) => rx,
            None => {
                tracing::error!("Child for docKey [{}] has no transport", self.doc_key);
                self.registry.deregister(&self.doc_key);
                return;
            }
        };
        let mut child_open = true;

        let poll_timeout = Duration::from_millis(self.config.poll_timeout_ms);
        let command_timeout = Duration::from_millis(self.config.command_timeout_ms);
        let autosave_period = Duration::from_secs(self.config.autosave_period_secs);
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_secs);
        let mut last_autosave_check = Instant::now();

        while !self.stop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => self.stop = true,
                },
                frame = ingress.recv(), if child_open => match frame {
                    Some(frame) => {
                        self.handle_child_input(frame).await;
                    }
                    None => {
                        child_open = false;
                        self.child_socket_terminated();
                    }
                },
                _ = tokio::time::sleep(poll_timeout) => {}
            }

            let now = Instant::now();
            if self.last_save_time < self.last_save_request_time
                && now.duration_since(self.last_save_request_time) <= command_timeout
            {
                // We are saving, nothing more to do but wait.
                continue;
            }

            if registry::shutdown_requested() {
                self.close_reason = "recycling".to_string();
                self.stop = true;
            } else if self.config.autosave_enabled
                && !self.stop
                && now.duration_since(last_autosave_check) >= autosave_period
            {
                tracing::trace!("Triggering an autosave for [{}]", self.doc_key);
                self.auto_save(true);
                last_autosave_check = Instant::now();
            }

            let idle = self.idle_time() >= idle_timeout;

            // If all sessions have been removed, no reason to linger.
            if (self.loaded || self.mark_to_destroy) && (self.sessions.is_empty() || idle) {
                self.close_reason = if idle { "idle" } else { "dead" }.to_string();
                tracing::info!(
                    "Terminating {} broker for docKey [{}]",
                    self.close_reason,
                    self.doc_key
                );
                self.stop = true;
            }
        }

        tracing::info!(
            "Finished polling doc [{}]. stop: {}, closeReason: {}",
            self.doc_key,
            self.stop,
            self.close_reason
        );

        // Flush whatever the kit already queued before tearing down.
        self.flush(&mut ingress, 2 * poll_timeout).await;

        let close_reason = self.close_reason.clone();
        self.terminate_child(&close_reason, false);
        drop(ingress);

        self.registry.deregister(&self.doc_key);
        self.admin.rm_doc(&self.doc_key, None);

        // Remove the document's tiles unless the cache is persistent.
        if !self.config.tile_cache_persistent {
            if let Some(cache) = &self.tile_cache {
                cache.purge();
            }
        }

        tracing::info!("Finished broker loop for docKey [{}]", self.doc_key);
    }

    /// Acquire a kit, retrying until one arrives, a stop is requested,
    /// or five command-timeouts elapse.
    async fn acquire_child(&mut self) -> bool {
        let deadline =
            self.thread_start + Duration::from_millis(self.config.command_timeout_ms * 5);
        loop {
            if let Some(child) = self.spawner.spawn().await {
                tracing::info!(
                    "Doc [{}] attached to child [{}]",
                    self.doc_key,
                    child.pid()
                );
                self.child = Some(child);
                return true;
            }
            if self.stop || registry::shutdown_requested() || Instant::now() > deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(CHILD_SPAWN_RETRY_MS)).await;
        }
    }

    /// Drain frames the kit already delivered, bounded by the deadline.
    async fn flush(&mut self, ingress: &mut ChildIngress, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match ingress.try_recv() {
                Ok(frame) => {
                    self.handle_child_input(frame).await;
                }
                Err(_) => break,
            }
        }
    }

    async fn handle_command(&mut self, cmd: BrokerCommand) {
        match cmd {
            BrokerCommand::AddSession { session, reply } => {
                let result = self.add_session(session).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            BrokerCommand::RemoveSession {
                id,
                destroy_if_last,
            } => {
                self.remove_session(&id, destroy_if_last);
            }
            BrokerCommand::ForwardToChild { view_id, message } => {
                self.update_last_activity();
                self.forward_to_child(&view_id, &message);
            }
            BrokerCommand::TileRequest { session_id, tile } => {
                self.update_last_activity();
                match self.sessions.get(&session_id).cloned() {
                    Some(session) => self.handle_tile_request(tile, &session),
                    None => {
                        tracing::warn!("Session [{}] not found for tile request", session_id)
                    }
                }
            }
            BrokerCommand::TileCombinedRequest { session_id, tiles } => {
                self.update_last_activity();
                match self.sessions.get(&session_id).cloned() {
                    Some(session) => self.handle_tile_combined_request(tiles, &session),
                    None => {
                        tracing::warn!("Session [{}] not found for tile request", session_id)
                    }
                }
            }
            BrokerCommand::CancelTileRequests { session_id } => {
                self.cancel_tile_requests(&session_id);
            }
            BrokerCommand::InvalidateTiles { selector } => {
                self.invalidate_tiles(&selector);
            }
            BrokerCommand::CloseDocument { reason } => {
                self.close_document(&reason);
            }
            BrokerCommand::Callback(f) => f(self),
            BrokerCommand::Stop => self.stop = true,
        }
    }

    // ========== Session lifecycle ==========

    pub async fn add_session(&mut self, session: Arc<ClientSession>) -> Result<usize> {
        match self.add_session_internal(session.clone()).await {
            Ok(count) => Ok(count),
            Err(e) => {
                tracing::error!(
                    "Failed to add session to [{}] with URI [{}]: {}",
                    self.doc_key,
                    session.public_uri(),
                    e
                );
                if self.sessions.is_empty() {
                    tracing::info!(
                        "Doc [{}] has no more sessions. Marking to destroy.",
                        self.doc_key
                    );
                    self.mark_to_destroy = true;
                }
                Err(e)
            }
        }
    }

    async fn add_session_internal(&mut self, session: Arc<ClientSession>) -> Result<usize> {
        let jail_id = self
            .child
            .as_ref()
            .map(|c| c.jail_id().to_string())
            .unwrap_or_default();

        match self.load(&session, &jail_id).await {
            Ok(()) => {}
            Err(BrokerError::StorageSpaceLow) => {
                tracing::error!(
                    "Out of storage while loading document with URI [{}]",
                    session.public_uri()
                );
                // Not sent to all clients, just to all sessions of this
                // document.
                self.alert_all_users("error: cmd=internal kind=diskfull");
                return Err(BrokerError::StorageSpaceLow);
            }
            Err(e) => return Err(e),
        }

        // These are recalculated by destroy_if_last_editor before the
        // document is torn down; a new session resets them to defaults.
        self.last_editable_session = false;
        self.mark_to_destroy = false;
        self.stop = false;

        let id = session.id().to_string();

        // Request a new view from the kit.
        let child = self
            .child
            .as_ref()
            .ok_or_else(|| BrokerError::Load("no child process".into()))?;
        child.send_text_frame(format!("session {} {} {}", id, self.doc_key, self.doc_id));
        let pid = child.pid();

        self.admin
            .add_doc(&self.doc_key, pid, &self.filename, &id);

        self.sessions.insert(id.clone(), session.clone());
        session.set_attached();

        let count = self.sessions.len();
        tracing::debug!(
            "Added {} session [{}] to docKey [{}] to have {} sessions",
            if session.is_read_only() {
                "readonly"
            } else {
                "non-readonly"
            },
            id,
            self.doc_key,
            count
        );
        Ok(count)
    }

    pub fn remove_session(&mut self, id: &str, destroy_if_last: bool) -> usize {
        if destroy_if_last {
            self.destroy_if_last_editor(id);
        }

        tracing::info!(
            "Removing session [{}] on docKey [{}]. Have {} sessions. markToDestroy: {}, \
             lastEditableSession: {}",
            id,
            self.doc_key,
            self.sessions.len(),
            self.mark_to_destroy,
            self.last_editable_session
        );

        // The departing last editor must save first; removal happens when
        // the save is acknowledged.
        if !self.last_editable_session || !self.auto_save(true) {
            return self.remove_session_internal(id);
        }
        self.sessions.len()
    }

    fn remove_session_internal(&mut self, id: &str) -> usize {
        self.admin.rm_doc(&self.doc_key, Some(id));

        match self.sessions.remove(id) {
            Some(session) => {
                let count = self.sessions.len();
                tracing::debug!(
                    "Removed {} session [{}] from docKey [{}] to have {} sessions",
                    if session.is_read_only() {
                        "readonly"
                    } else {
                        "non-readonly"
                    },
                    id,
                    self.doc_key,
                    count
                );

                // Let the child know the client has disconnected.
                if let Some(child) = &self.child {
                    child.send_text_frame(format!("child-{} disconnect", id));
                }
                count
            }
            None => {
                tracing::debug!(
                    "Session [{}] not found to remove from docKey [{}]",
                    id,
                    self.doc_key
                );
                self.sessions.len()
            }
        }
    }

    /// Decide whether the departing session is the last editor, and
    /// whether the document can be destroyed with it.
    fn destroy_if_last_editor(&mut self, id: &str) {
        let Some(current) = self.sessions.get(id) else {
            // A socket can disconnect before its session ever loaded.
            return;
        };

        self.last_editable_session = !current.is_read_only();
        if self.last_editable_session {
            for (other_id, other) in &self.sessions {
                if other_id != id && other.is_view_loaded() && !other.is_read_only() {
                    // Found another editable view.
                    self.last_editable_session = false;
                    break;
                }
            }
        }

        // Last view going away, can destroy.
        self.mark_to_destroy = self.sessions.len() <= 1;
        tracing::debug!(
            "startDestroy on session [{}] on docKey [{}], sessions: {}, markToDestroy: {}, \
             lastEditableSession: {}",
            id,
            self.doc_key,
            self.sessions.len(),
            self.mark_to_destroy,
            self.last_editable_session
        );
    }

    // ========== Child ingress dispatch ==========

    /// Route one inbound frame from the kit. Returns false for traffic
    /// the broker does not understand.
    pub async fn handle_child_input(&mut self, frame: Bytes) -> bool {
        let first_line = protocol::first_line(&frame).to_string();
        let command = protocol::first_token(&first_line).to_string();
        tracing::trace!("Broker handling child message: [{}]", first_line);

        if matches!(protocol::parse_name_value(&command, '-'), Some(("client", _))) {
            return self.forward_to_client(&frame).await;
        }

        match command.as_str() {
            "tile:" => self.handle_tile_response(&frame),
            "tilecombine:" => self.handle_tile_combined_response(&frame),
            "errortoall:" => {
                let cmd = protocol::token_string(&first_line, "cmd").unwrap_or_default();
                let kind = protocol::token_string(&first_line, "kind").unwrap_or_default();
                if cmd.is_empty() || kind.is_empty() {
                    tracing::error!("Malformed errortoall: [{}]", first_line);
                    return false;
                }
                self.registry.alert_all_users(cmd, kind);
            }
            "procmemstats:" => {
                if let Some(dirty) = protocol::token_i64(&first_line, "dirty") {
                    self.admin.update_memory_dirty(&self.doc_key, dirty);
                }
            }
            _ => {
                tracing::error!("Unexpected message: [{}]", first_line);
                return false;
            }
        }
        true
    }

    /// Deliver a `client-<sid>`/`client-all` frame to its session(s),
    /// intercepting the few payloads the broker itself reacts to.
    async fn forward_to_client(&mut self, frame: &Bytes) -> bool {
        let first_line = protocol::first_line(frame).to_string();
        let prefix = protocol::first_token(&first_line).to_string();
        tracing::trace!("Forwarding payload to [{}]", prefix);

        let Some(("client", sid)) = protocol::parse_name_value(&prefix, '-') else {
            tracing::error!("Unexpected prefix of forward-to-client message: {}", prefix);
            return false;
        };
        let sid = sid.to_string();

        let body = frame.slice(usize::min(prefix.len() + 1, frame.len())..);
        self.inspect_client_payload(&sid, &body).await;

        if sid == "all" {
            // Broadcast. Events could cause the removal of sessions, so
            // iterate a snapshot.
            let sessions: Vec<Arc<ClientSession>> = self.sessions.values().cloned().collect();
            for session in sessions {
                session.send_binary_frame(body.clone());
            }
            true
        } else {
            // Keep a local reference: the save confirmation may be the
            // only thing keeping a stopping session alive.
            match self.sessions.get(&sid).cloned() {
                Some(session) => session.send_binary_frame(body),
                None => {
                    tracing::warn!("Client session [{}] not found to forward message", sid);
                    false
                }
            }
        }
    }

    /// React to kit-to-client payloads that carry broker-level state:
    /// save acknowledgements, the modified flag and cursor movement.
    async fn inspect_client_payload(&mut self, sid: &str, body: &Bytes) {
        let line = protocol::first_line(body);
        if let Some(json) = line.strip_prefix("unocommandresult:") {
            if let Ok(v) = serde_json::from_str::<serde_json::Value>(json.trim()) {
                if v.get("commandName").and_then(|c| c.as_str()) == Some(".uno:Save") {
                    let success = v.get("success").and_then(|s| s.as_bool()).unwrap_or(false);
                    let result = match v.get("result") {
                        Some(serde_json::Value::String(s)) => s.clone(),
                        Some(serde_json::Value::Object(o)) => o
                            .get("value")
                            .and_then(|x| x.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        _ => String::new(),
                    };
                    self.save_to_storage(sid, success, &result).await;
                }
            }
        } else if let Some(state) = line.strip_prefix("statechanged:") {
            if let Some(value) = state.trim().strip_prefix(".uno:ModifiedStatus=") {
                self.set_modified(value == "true");
            }
        } else if let Some(selector) = line.strip_prefix("invalidatetiles:") {
            // The rendered region went stale; drop it before clients
            // re-request.
            self.invalidate_tiles(selector.trim());
        } else if let Some(rect) = line.strip_prefix("invalidatecursor:") {
            let parts: Vec<i32> = rect
                .split(',')
                .filter_map(|p| p.trim().parse().ok())
                .collect();
            if let [x, y, w, h] = parts[..] {
                self.set_cursor(x, y, w, h);
            }
        }
    }

    // ========== Client egress ==========

    /// Forward a client message to the kit on behalf of a view, splicing
    /// the jailed document URI into `load`.
    pub fn forward_to_child(&mut self, view_id: &str, message: &str) -> bool {
        tracing::trace!("Forwarding payload to child [{}]: {}", view_id, message);

        let mut msg = format!("child-{} {}", view_id, message);

        if self.sessions.contains_key(view_id) {
            let tokens: Vec<&str> = msg.split_whitespace().collect();
            if tokens.len() > 2 && tokens[1] == "load" {
                if let Some(uri_jailed) = &self.uri_jailed {
                    // The json options must come last.
                    msg = format!(
                        "{} {} {} jail={} {}",
                        tokens[0],
                        tokens[1],
                        tokens[2],
                        uri_jailed,
                        tokens[3..].join(" ")
                    );
                }
            }
            match &self.child {
                Some(child) => return child.send_text_frame(msg),
                None => return false,
            }
        }

        tracing::warn!(
            "Child session [{}] not found to forward message: {}",
            view_id,
            message
        );
        false
    }

    /// Send a text frame to every session of this document.
    pub fn alert_all_users(&mut self, msg: &str) {
        tracing::debug!("Alerting all users of [{}]: {}", self.doc_key, msg);
        for session in self.sessions.values() {
            session.send_text_frame(msg);
        }
    }

    // ========== Termination ==========

    fn child_socket_terminated(&mut self) {
        if !self.child.as_ref().is_some_and(ChildProcess::is_alive) {
            tracing::error!("Child for doc [{}] terminated prematurely", self.doc_key);
        }
        // The kit is unrecoverable here; close the connections to clean up.
        self.shutdown_clients("terminated");
    }

    fn shutdown_clients(&mut self, close_reason: &str) {
        tracing::info!(
            "Terminating {} clients of doc [{}]",
            self.sessions.len(),
            self.doc_key
        );

        // removeSession erases from the registry; iterate a snapshot and
        // hold each session while shutting it down.
        let sessions: Vec<Arc<ClientSession>> = self.sessions.values().cloned().collect();
        for session in sessions {
            // Notify the client and disconnect.
            session.shutdown(ENDPOINT_GOING_AWAY, close_reason);
            session.set_close_frame();

            // Remove session, save if last editor, and mark to destroy.
            self.remove_session(session.id(), true);
        }
    }

    fn terminate_child(&mut self, close_reason: &str, rude: bool) {
        tracing::info!("Terminating doc [{}]", self.doc_key);

        if !rude {
            self.shutdown_clients(close_reason);
        }

        if let Some(child) = &mut self.child {
            tracing::info!(
                "Terminating child [{}] of doc [{}]",
                child.pid(),
                self.doc_key
            );
            child.close(rude);
        }

        self.stop = true;
    }

    /// Rude, immediate teardown of the document.
    pub fn close_document(&mut self, reason: &str) {
        tracing::debug!(
            "Closing DocumentBroker for docKey [{}] with reason: {}",
            self.doc_key,
            reason
        );
        self.close_reason = reason.to_string();
        self.terminate_child(reason, true);
    }

    /// One-line state summary for the admin console.
    pub fn dump_state(&self) -> String {
        format!(
            "broker: {} uri: {} docKey: {} sessions: {} loaded: {} modified: {} markToDestroy: {} \
             lastEditable: {} jail: {} cursor: {},{} {}x{}",
            self.filename,
            self.uri_public,
            self.doc_key,
            self.sessions.len(),
            self.loaded,
            self.modified,
            self.mark_to_destroy,
            self.last_editable_session,
            self.jail_id,
            self.cursor.0,
            self.cursor.1,
            self.cursor.2,
            self.cursor.3
        )
    }
}
