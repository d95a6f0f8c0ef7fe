//! Client sessions.
//!
//! One `ClientSession` per client connection attached to a broker. The
//! session value is shared between the broker's registry and the accepting
//! layer; the broker mutates its flags, the acceptor drains its egress
//! queue onto the websocket. The back-reference from session to broker is
//! deliberately absent: routing back into the broker goes through its
//! command channel.

use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use url::Url;

/// Websocket close status sent when a broker tears its sessions down.
pub const ENDPOINT_GOING_AWAY: u16 = 1001;

/// Outbound client frames, drained by the connection layer.
#[derive(Debug, Clone)]
pub enum SessionMessage {
    Text(String),
    Binary(Bytes),
    Close { code: u16, reason: String },
}

pub type SessionSender = mpsc::UnboundedSender<SessionMessage>;

pub struct ClientSession {
    id: String,
    public_uri: Url,
    access_token: String,
    user_id: RwLock<String>,
    user_name: RwLock<String>,
    read_only: AtomicBool,
    document_owner: AtomicBool,
    attached: AtomicBool,
    view_loaded: AtomicBool,
    close_frame: AtomicBool,
    egress: SessionSender,
}

impl ClientSession {
    pub fn new(id: impl Into<String>, public_uri: Url, egress: SessionSender) -> Self {
        let access_token = public_uri
            .query_pairs()
            .find(|(k, _)| k == "access_token")
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default();
        Self {
            id: id.into(),
            public_uri,
            access_token,
            user_id: RwLock::new(String::new()),
            user_name: RwLock::new(String::new()),
            read_only: AtomicBool::new(false),
            document_owner: AtomicBool::new(false),
            attached: AtomicBool::new(false),
            view_loaded: AtomicBool::new(false),
            close_frame: AtomicBool::new(false),
            egress,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn public_uri(&self) -> &Url {
        &self.public_uri
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        self.public_uri
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    pub fn user_id(&self) -> String {
        self.user_id.read().clone()
    }

    pub fn set_user_id(&self, id: impl Into<String>) {
        *self.user_id.write() = id.into();
    }

    pub fn user_name(&self) -> String {
        self.user_name.read().clone()
    }

    pub fn set_user_name(&self, name: impl Into<String>) {
        *self.user_name.write() = name.into();
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }

    pub fn set_read_only(&self) {
        self.read_only.store(true, Ordering::Relaxed);
    }

    pub fn is_document_owner(&self) -> bool {
        self.document_owner.load(Ordering::Relaxed)
    }

    pub fn set_document_owner(&self, value: bool) {
        self.document_owner.store(value, Ordering::Relaxed);
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Relaxed)
    }

    pub fn set_attached(&self) {
        self.attached.store(true, Ordering::Relaxed);
    }

    pub fn is_view_loaded(&self) -> bool {
        self.view_loaded.load(Ordering::Relaxed)
    }

    pub fn set_view_loaded(&self) {
        self.view_loaded.store(true, Ordering::Relaxed);
    }

    /// Whether the client has initiated a close handshake; a pending save
    /// keeps such a session in the registry until the save is acknowledged.
    pub fn is_close_frame(&self) -> bool {
        self.close_frame.load(Ordering::Relaxed)
    }

    pub fn set_close_frame(&self) {
        self.close_frame.store(true, Ordering::Relaxed);
    }

    pub fn egress(&self) -> SessionSender {
        self.egress.clone()
    }

    /// Queue a text frame; false if the connection is gone.
    pub fn send_text_frame(&self, text: impl Into<String>) -> bool {
        self.egress.send(SessionMessage::Text(text.into())).is_ok()
    }

    /// Queue a binary frame; false if the connection is gone.
    pub fn send_binary_frame(&self, data: Bytes) -> bool {
        self.egress.send(SessionMessage::Binary(data)).is_ok()
    }

    /// Queue a close handshake toward the client.
    pub fn shutdown(&self, code: u16, reason: &str) {
        let _ = self.egress.send(SessionMessage::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("read_only", &self.is_read_only())
            .field("owner", &self.is_document_owner())
            .field("attached", &self.is_attached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(uri: &str) -> (ClientSession, mpsc::UnboundedReceiver<SessionMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ClientSession::new("s1", Url::parse(uri).unwrap(), tx),
            rx,
        )
    }

    #[test]
    fn test_access_token_extracted() {
        let (s, _rx) = session("https://host/doc.odt?access_token=tok123&permission=edit");
        assert_eq!(s.access_token(), "tok123");
        assert_eq!(s.query_param("permission").as_deref(), Some("edit"));
        assert_eq!(s.query_param("missing"), None);
    }

    #[test]
    fn test_frames_reach_egress() {
        let (s, mut rx) = session("file:///tmp/doc.odt");
        assert!(s.send_text_frame("perm: {}"));
        s.shutdown(ENDPOINT_GOING_AWAY, "idle");
        match rx.try_recv().unwrap() {
            SessionMessage::Text(t) => assert_eq!(t, "perm: {}"),
            other => panic!("unexpected {:?}", other),
        }
        match rx.try_recv().unwrap() {
            SessionMessage::Close { code, reason } => {
                assert_eq!(code, ENDPOINT_GOING_AWAY);
                assert_eq!(reason, "idle");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_flags_default_off() {
        let (s, _rx) = session("file:///tmp/doc.odt");
        assert!(!s.is_read_only());
        assert!(!s.is_document_owner());
        assert!(!s.is_attached());
        s.set_read_only();
        s.set_attached();
        assert!(s.is_read_only() && s.is_attached());
    }
}
