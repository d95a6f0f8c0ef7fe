//! End-to-end broker scenarios against local storage and a fake kit.

mod common;
use common::*;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use docbroker::admin::NoopAdmin;
use docbroker::session::ENDPOINT_GOING_AWAY;
use docbroker::{DocumentBroker, TileCombined, TileDesc};

fn tile(x: i32, y: i32) -> TileDesc {
    TileDesc {
        part: 0,
        width: 256,
        height: 256,
        tile_pos_x: x,
        tile_pos_y: y,
        tile_width: 3840,
        tile_height: 3840,
        ver: -1,
        img_size: 0,
        broadcast: false,
    }
}

fn tile_response(header: &str, payload: &[u8]) -> Vec<u8> {
    let mut frame = header.as_bytes().to_vec();
    frame.push(b'\n');
    frame.extend_from_slice(payload);
    frame
}

struct LocalDoc {
    _dir: tempfile::TempDir,
    uri: Url,
    handle: docbroker::BrokerHandle,
    kits: tokio::sync::mpsc::UnboundedReceiver<FakeKit>,
}

async fn local_broker(configure: impl FnOnce(&mut docbroker::BrokerConfig)) -> LocalDoc {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let doc = dir.path().join("minutes.odt");
    std::fs::write(&doc, b"original content").unwrap();

    let mut config = test_config(dir.path());
    configure(&mut config);

    let (spawner, kits) = fake_spawner();
    let uri = Url::from_file_path(&doc).unwrap();
    let handle = DocumentBroker::create(
        uri.clone(),
        Arc::new(config),
        spawner,
        Arc::new(NoopAdmin),
        registry(),
        None,
    )
    .unwrap();

    LocalDoc {
        _dir: dir,
        uri,
        handle,
        kits,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tile_cache_hit_and_miss_combined() {
    let mut fixture = local_broker(|_| {}).await;
    let mut kit = fixture.kits.recv().await.unwrap();

    let (session, mut rx) = new_session("s1", fixture.uri.as_str());
    fixture.handle.add_session(session).await.unwrap();
    kit.expect(|f| f.starts_with("session s1")).await;
    expect_text(&mut rx, |t| t.starts_with("perm: ")).await;

    // Render tile A once so the cache holds it.
    let a = tile(0, 0);
    let b = tile(3840, 0);
    fixture.handle.request_tile("s1", a.clone());
    let request = kit.expect(|f| f.starts_with("tile ")).await;
    let rendered_a = TileDesc::parse(&request).unwrap();
    kit.send(tile_response(&rendered_a.serialize("tile:"), b"AAAA"));
    let first = expect_binary(&mut rx, |l| l.contains("tileposx=0 ")).await;
    assert!(first.ends_with(b"AAAA"));

    // Combined request: A is a hit, B a miss.
    fixture
        .handle
        .request_tiles("s1", TileCombined::create(vec![a.clone(), b.clone()]));

    let hit = expect_binary(&mut rx, |l| l.contains("tileposx=0 ")).await;
    assert!(hit.ends_with(b"AAAA"));

    // The kit only sees the uncached tile.
    let residual = kit.expect(|f| f.starts_with("tilecombine ")).await;
    let residual = TileCombined::parse(&residual).unwrap();
    assert_eq!(residual.tiles.len(), 1);
    assert_eq!(residual.tiles[0].tile_pos_x, 3840);

    kit.send(tile_response(&residual.tiles[0].serialize("tile:"), b"BBBB"));
    let miss = expect_binary(&mut rx, |l| l.contains("tileposx=3840")).await;
    assert!(miss.ends_with(b"BBBB"));

    // Both now come straight from the cache: no further kit traffic.
    fixture
        .handle
        .request_tiles("s1", TileCombined::create(vec![a, b]));
    let again_a = expect_binary(&mut rx, |l| l.contains("tileposx=0 ")).await;
    let again_b = expect_binary(&mut rx, |l| l.contains("tileposx=3840")).await;
    assert!(again_a.ends_with(b"AAAA"));
    assert!(again_b.ends_with(b"BBBB"));
    drain(&fixture.handle).await;
    assert!(kit.from_broker.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tile_request_coalesces_across_sessions() {
    let mut fixture = local_broker(|_| {}).await;
    let mut kit = fixture.kits.recv().await.unwrap();

    let (s1, mut rx1) = new_session("s1", fixture.uri.as_str());
    let (s2, mut rx2) = new_session("s2", fixture.uri.as_str());
    fixture.handle.add_session(s1).await.unwrap();
    fixture.handle.add_session(s2).await.unwrap();
    kit.expect(|f| f.starts_with("session s2")).await;

    // Both sessions ask for the same tile before it renders.
    let t = tile(0, 7680);
    fixture.handle.request_tile("s1", t.clone());
    fixture.handle.request_tile("s2", t.clone());
    drain(&fixture.handle).await;

    // Exactly one render request reaches the kit.
    let request = kit.expect(|f| f.starts_with("tile ")).await;
    assert!(kit.from_broker.try_recv().is_err());

    let rendered = TileDesc::parse(&request).unwrap();
    kit.send(tile_response(&rendered.serialize("tile:"), b"SHARED"));

    for rx in [&mut rx1, &mut rx2] {
        let frame = expect_binary(rx, |l| l.contains("tileposy=7680")).await;
        assert!(frame.ends_with(b"SHARED"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_autosave_coalescing() {
    let mut fixture = local_broker(|config| {
        config.autosave_period_secs = 1;
    })
    .await;
    let mut kit = fixture.kits.recv().await.unwrap();

    let mut sessions = Vec::new();
    for id in ["s1", "s2", "s3"] {
        let (session, rx) = new_session(id, fixture.uri.as_str());
        fixture.handle.add_session(session.clone()).await.unwrap();
        sessions.push((session, rx));
    }

    // All three edit; the kit reports the modified state once.
    kit.send(&b"client-all statechanged: .uno:ModifiedStatus=true"[..]);

    // Kit driver: acknowledge every save command.
    let save_count = Arc::new(AtomicUsize::new(0));
    let counter = save_count.clone();
    let driver = tokio::spawn(async move {
        while let Some(frame) = kit.from_broker.recv().await {
            if frame.contains("uno .uno:Save") {
                counter.fetch_add(1, Ordering::Relaxed);
                let sid = frame
                    .split_whitespace()
                    .next()
                    .and_then(|t| t.strip_prefix("child-"))
                    .unwrap()
                    .to_string();
                kit.send(format!(
                    "client-{} unocommandresult: {{\"commandName\":\".uno:Save\",\"success\":true}}",
                    sid
                ));
            }
        }
    });

    // Two autosave periods fit in the window: exactly two saves.
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(save_count.load(Ordering::Relaxed), 2);
    driver.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_last_editor_destroy_saves_then_exits() {
    let mut fixture = local_broker(|_| {}).await;
    let mut kit = fixture.kits.recv().await.unwrap();

    let (editor, _editor_rx) = new_session("ed", fixture.uri.as_str());
    let (viewer, _viewer_rx) = new_session("vw", fixture.uri.as_str());
    viewer.set_read_only();

    fixture.handle.add_session(editor).await.unwrap();
    fixture.handle.add_session(viewer).await.unwrap();
    kit.expect(|f| f.starts_with("session vw")).await;

    fixture.handle.add_callback(|broker| broker.set_modified(true));

    // The viewer leaves: plain removal.
    fixture.handle.remove_session("vw", true);
    kit.expect(|f| f == "child-vw disconnect").await;

    // The last editor leaves while modified: a forced save goes out and
    // removal waits for the acknowledgement.
    fixture.handle.remove_session("ed", true);
    let save = kit.expect(|f| f.contains("uno .uno:Save")).await;
    assert!(save.starts_with("child-ed "));

    kit.send(
        &b"client-ed unocommandresult: {\"commandName\":\".uno:Save\",\"success\":true}"[..],
    );

    // Save success releases the deferred removal and the loop winds down.
    kit.expect(|f| f == "child-ed disconnect").await;
    wait_until_dead(&fixture.handle, Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_idle_termination() {
    let mut fixture = local_broker(|config| {
        config.idle_timeout_secs = 1;
    })
    .await;
    let _kit = fixture.kits.recv().await.unwrap();

    let (session, mut rx) = new_session("s1", fixture.uri.as_str());
    fixture.handle.add_session(session).await.unwrap();
    expect_text(&mut rx, |t| t.starts_with("perm: ")).await;

    // No activity: the broker tears down after the idle timeout.
    let (code, reason) = expect_close(&mut rx, Duration::from_secs(5)).await;
    assert_eq!(code, ENDPOINT_GOING_AWAY);
    assert_eq!(reason, "idle");
    wait_until_dead(&fixture.handle, Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_dockey_rejected_while_alive() {
    let fixture = local_broker(|_| {}).await;

    // A second broker for the same docKey must not come up; the registry
    // in the fixture is per-test, so reuse it through the handle's key.
    let registry = registry();
    let (spawner, _kits) = fake_spawner();
    let config = Arc::new(test_config(fixture._dir.path()));
    let first = DocumentBroker::create(
        fixture.uri.clone(),
        config.clone(),
        spawner.clone(),
        Arc::new(NoopAdmin),
        registry.clone(),
        None,
    )
    .unwrap();
    assert!(first.is_alive());

    let second = DocumentBroker::create(
        fixture.uri.clone(),
        config,
        spawner,
        Arc::new(NoopAdmin),
        registry,
        None,
    );
    assert!(second.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_errortoall_reaches_every_session() {
    let mut fixture = local_broker(|_| {}).await;
    let mut kit = fixture.kits.recv().await.unwrap();

    let (s1, mut rx1) = new_session("s1", fixture.uri.as_str());
    let (s2, mut rx2) = new_session("s2", fixture.uri.as_str());
    fixture.handle.add_session(s1).await.unwrap();
    fixture.handle.add_session(s2).await.unwrap();
    kit.expect(|f| f.starts_with("session s2")).await;

    kit.send(&b"errortoall: cmd=internal kind=diskfull"[..]);

    for rx in [&mut rx1, &mut rx2] {
        let msg = expect_text(rx, |t| t.starts_with("error: ")).await;
        assert_eq!(msg, "error: cmd=internal kind=diskfull");
    }
}
