//! Shared fixtures for broker integration tests: a channel-backed fake
//! kit, session builders, and a stub WOPI host.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

use docbroker::child::{ChildProcess, KitSpawner};
use docbroker::session::{ClientSession, SessionMessage};
use docbroker::{BrokerConfig, BrokerHandle, BrokerRegistry};

pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// The kit's side of a broker/child channel pair.
pub struct FakeKit {
    pub pid: u32,
    pub jail_id: String,
    pub from_broker: mpsc::UnboundedReceiver<String>,
    pub to_broker: mpsc::UnboundedSender<Bytes>,
}

impl FakeKit {
    /// Next frame from the broker, failing the test after two seconds.
    pub async fn recv(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(2), self.from_broker.recv())
            .await
            .expect("timed out waiting for a kit frame")
            .expect("broker closed the kit transport")
    }

    /// Skip frames until one satisfies the predicate.
    pub async fn expect(&mut self, pred: impl Fn(&str) -> bool) -> String {
        loop {
            let frame = self.recv().await;
            if pred(&frame) {
                return frame;
            }
        }
    }

    pub fn send(&self, frame: impl AsRef<[u8]>) {
        self.to_broker
            .send(Bytes::copy_from_slice(frame.as_ref()))
            .expect("broker ingress closed");
    }
}

pub struct FakeSpawner {
    kit_tx: mpsc::UnboundedSender<FakeKit>,
    next_pid: AtomicU32,
}

#[async_trait]
impl KitSpawner for FakeSpawner {
    async fn spawn(&self) -> Option<ChildProcess> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let jail_id = format!("jail-{}", pid);
        self.kit_tx
            .send(FakeKit {
                pid,
                jail_id: jail_id.clone(),
                from_broker: cmd_rx,
                to_broker: in_tx,
            })
            .ok()?;
        Some(ChildProcess::new(pid, jail_id, cmd_tx, in_rx))
    }
}

/// A spawner handing out channel-backed kits, plus the stream of kit
/// counterparts for the test to drive.
pub fn fake_spawner() -> (Arc<FakeSpawner>, mpsc::UnboundedReceiver<FakeKit>) {
    let (kit_tx, kit_rx) = mpsc::unbounded_channel();
    (
        Arc::new(FakeSpawner {
            kit_tx,
            next_pid: AtomicU32::new(1),
        }),
        kit_rx,
    )
}

pub fn new_session(
    id: &str,
    uri: &str,
) -> (Arc<ClientSession>, mpsc::UnboundedReceiver<SessionMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(ClientSession::new(id, Url::parse(uri).unwrap(), tx)),
        rx,
    )
}

/// Wait for a text frame matching the predicate.
pub async fn expect_text(
    rx: &mut mpsc::UnboundedReceiver<SessionMessage>,
    pred: impl Fn(&str) -> bool,
) -> String {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for a session frame")
            .expect("session egress closed");
        if let SessionMessage::Text(t) = msg {
            if pred(&t) {
                return t;
            }
        }
    }
}

/// Wait for a binary frame whose header line matches the predicate.
pub async fn expect_binary(
    rx: &mut mpsc::UnboundedReceiver<SessionMessage>,
    pred: impl Fn(&str) -> bool,
) -> Bytes {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for a session frame")
            .expect("session egress closed");
        if let SessionMessage::Binary(b) = msg {
            let line_end = b.iter().position(|&c| c == b'\n').unwrap_or(b.len());
            let line = std::str::from_utf8(&b[..line_end]).unwrap_or("");
            if pred(line) {
                return b;
            }
        }
    }
}

/// Wait for the close handshake.
pub async fn expect_close(
    rx: &mut mpsc::UnboundedReceiver<SessionMessage>,
    timeout: Duration,
) -> (u16, String) {
    loop {
        let msg = tokio::time::timeout(timeout, rx.recv())
            .await
            .expect("timed out waiting for a close frame")
            .expect("session egress closed");
        if let SessionMessage::Close { code, reason } = msg {
            return (code, reason);
        }
    }
}

/// Barrier: resolves once every previously queued command has run.
pub async fn drain(handle: &BrokerHandle) {
    let (tx, rx) = tokio::sync::oneshot::channel();
    handle.add_callback(move |_| {
        let _ = tx.send(());
    });
    let _ = tokio::time::timeout(Duration::from_secs(2), rx).await;
}

/// Wait for the broker loop to finish.
pub async fn wait_until_dead(handle: &BrokerHandle, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while handle.is_alive() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "broker loop did not exit in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

const TEST_POLICY: &str = r#"<perms>
  <text>
    <feature edit="true">Bold</feature>
    <feature edit="false">Macros</feature>
  </text>
  <spreadsheet>
    <feature edit="true">Recalculate</feature>
  </spreadsheet>
  <presentation>
  </presentation>
  <toolbar>
    <item edit="false">Insert</item>
  </toolbar>
</perms>"#;

/// A config rooted in the tempdir, tuned for fast test loops, with a
/// policy file in place.
pub fn test_config(dir: &std::path::Path) -> BrokerConfig {
    let perm_file = dir.join("perm.xml");
    std::fs::write(&perm_file, TEST_POLICY).unwrap();
    let mut config = BrokerConfig::with_roots(dir.join("cache"), dir.join("jails"));
    config.poll_timeout_ms = 50;
    config.command_timeout_ms = 2_000;
    config.perm_file = Some(perm_file);
    config
}

pub fn registry() -> Arc<BrokerRegistry> {
    Arc::new(BrokerRegistry::new())
}

// ---- Stub WOPI host ----

#[derive(Clone)]
pub struct WopiHost {
    pub base: String,
    /// Status code PutFile answers with.
    pub put_status: Arc<AtomicU16>,
}

impl WopiHost {
    pub fn file_uri(&self, id: &str, query: &str) -> String {
        format!("{}/wopi/files/{}?{}", self.base, id, query)
    }

    pub fn set_put_status(&self, status: u16) {
        self.put_status.store(status, Ordering::Relaxed);
    }
}

/// Serve a minimal WOPI host on an ephemeral port.
pub async fn spawn_wopi_host() -> WopiHost {
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;

    let put_status = Arc::new(AtomicU16::new(200));

    async fn check_file_info() -> impl IntoResponse {
        axum::Json(serde_json::json!({
            "BaseFileName": "remote.odt",
            "OwnerId": "owner-1",
            "UserId": "u-1",
            "UserFriendlyName": "Remote User",
            "UserCanWrite": true,
            "PostMessageOrigin": "http://host.example",
            "LastModifiedTime": 1000,
        }))
    }

    async fn get_file() -> impl IntoResponse {
        b"REMOTE DOCUMENT BYTES".to_vec()
    }

    async fn put_file(State(status): State<Arc<AtomicU16>>) -> impl IntoResponse {
        StatusCode::from_u16(status.load(Ordering::Relaxed)).unwrap_or(StatusCode::OK)
    }

    let app = Router::new()
        .route("/wopi/files/:id", get(check_file_info))
        .route("/wopi/files/:id/contents", get(get_file).post(put_file))
        .with_state(put_status.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    WopiHost {
        base: format!("http://{}", addr),
        put_status,
    }
}
