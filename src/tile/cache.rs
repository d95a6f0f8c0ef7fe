//! Disk-backed cache of rendered tiles, with render subscriptions.
//!
//! One cache per open document, keyed by the document URI and its
//! last-modified instant: a document that changed on disk invalidates the
//! whole tree. Rendered tiles live as files under the document's cache
//! directory; sessions awaiting a render are tracked in memory and woken
//! when the bytes arrive.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::session::{SessionMessage, SessionSender};
use crate::tile::TileDesc;

const MODTIME_FILE: &str = "modtime.txt";
const UNSAVED_FILE: &str = "unsavedchanges";

/// A session awaiting a tile render.
pub struct TileSubscriber {
    pub session_id: String,
    pub sender: SessionSender,
}

struct PendingTile {
    ver: i32,
    subscribers: Vec<TileSubscriber>,
}

pub struct TileCache {
    cache_dir: PathBuf,
    unsaved_changes: bool,
    /// Cache-identity -> sessions awaiting that render. One kit request
    /// is outstanding per entry regardless of subscriber count.
    pending: HashMap<String, PendingTile>,
}

impl TileCache {
    /// Open (or reset) the cache for a document.
    ///
    /// A persisted last-modified mismatch means the document changed
    /// behind the cache; the whole tree is dropped before use.
    pub fn new(doc_uri: &str, last_modified: SystemTime, cache_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&cache_dir)?;

        let stamp = timestamp_nanos(last_modified);
        let stamp_path = cache_dir.join(MODTIME_FILE);
        let stale = match fs::read_to_string(&stamp_path) {
            Ok(prev) => prev.trim() != stamp,
            Err(_) => true,
        };
        if stale {
            tracing::debug!(
                "Tile cache for [{}] is stale or new, clearing {:?}",
                doc_uri,
                cache_dir
            );
            let _ = fs::remove_dir_all(&cache_dir);
            fs::create_dir_all(&cache_dir)?;
            fs::write(&stamp_path, &stamp)?;
        }

        let unsaved_changes = cache_dir.join(UNSAVED_FILE).exists();

        Ok(Self {
            cache_dir,
            unsaved_changes,
            pending: HashMap::new(),
        })
    }

    /// Rendered bytes for a descriptor, if cached.
    pub fn lookup(&self, desc: &TileDesc) -> Option<Bytes> {
        fs::read(self.cache_dir.join(desc.cache_name()))
            .ok()
            .map(Bytes::from)
    }

    /// Register a session for notification when the tile arrives.
    ///
    /// Returns true when this is the first subscriber for the descriptor,
    /// i.e. a render request must be forwarded to the kit. Later
    /// subscribers coalesce onto the outstanding request.
    pub fn subscribe(&mut self, desc: &TileDesc, subscriber: TileSubscriber) -> bool {
        let entry = self.pending.entry(desc.cache_name());
        match entry {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                let pending = e.get_mut();
                if !pending
                    .subscribers
                    .iter()
                    .any(|s| s.session_id == subscriber.session_id)
                {
                    pending.subscribers.push(subscriber);
                }
                false
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(PendingTile {
                    ver: desc.ver,
                    subscribers: vec![subscriber],
                });
                true
            }
        }
    }

    /// Store rendered bytes and wake every subscriber, each receiving its
    /// own `tile:`-framed copy.
    pub fn save_and_notify(&mut self, desc: &TileDesc, data: &[u8]) {
        if let Err(e) = fs::write(self.cache_dir.join(desc.cache_name()), data) {
            tracing::error!("Failed to persist tile [{}]: {}", desc.cache_name(), e);
        }

        if let Some(pending) = self.pending.remove(&desc.cache_name()) {
            let frame = frame_tile(desc, data);
            for sub in pending.subscribers {
                let _ = sub.sender.send(SessionMessage::Binary(frame.clone()));
            }
        }
    }

    /// Drop pending renders whose only subscriber is the given session.
    ///
    /// Returns the `canceltiles` token set to forward to the kit, or None
    /// when nothing became cancellable.
    pub fn cancel_tiles(&mut self, session_id: &str) -> Option<String> {
        let mut cancelled = Vec::new();
        self.pending.retain(|_, pending| {
            let only_this = pending
                .subscribers
                .iter()
                .all(|s| s.session_id == session_id);
            if only_this {
                cancelled.push(pending.ver);
                false
            } else {
                pending.subscribers.retain(|s| s.session_id != session_id);
                true
            }
        });

        if cancelled.is_empty() {
            return None;
        }
        cancelled.sort_unstable();
        let vers: Vec<String> = cancelled.iter().map(i32::to_string).collect();
        Some(format!("canceltiles {}", vers.join(",")))
    }

    /// Remove cached entries matching an invalidation selector.
    ///
    /// The selector is either `EMPTY` (drop everything) or
    /// `part=<p> x=<x> y=<y> width=<w> height=<h>`. In-flight
    /// subscriptions stay: the bytes that arrive for them are already
    /// stale and the next request bumps the render version anyway.
    pub fn invalidate(&mut self, selector: &str) {
        if selector.trim().starts_with("EMPTY") {
            self.remove_entries(|_| true);
            return;
        }

        let part = crate::protocol::token_i64(selector, "part");
        let x = crate::protocol::token_i64(selector, "x");
        let y = crate::protocol::token_i64(selector, "y");
        let w = crate::protocol::token_i64(selector, "width");
        let h = crate::protocol::token_i64(selector, "height");
        let (Some(part), Some(x), Some(y), Some(w), Some(h)) = (part, x, y, w, h) else {
            tracing::warn!("Malformed tile invalidation selector: [{}]", selector);
            return;
        };

        self.remove_entries(|name| {
            parse_cache_name(name).is_some_and(|t| {
                t.part == part as i32 && t.intersects(x as i32, y as i32, w as i32, h as i32)
            })
        });
    }

    pub fn unsaved_changes(&self) -> bool {
        self.unsaved_changes
    }

    /// Record whether the document has edits not yet persisted to
    /// storage. Survives broker restarts via a marker file.
    pub fn set_unsaved_changes(&mut self, value: bool) {
        self.unsaved_changes = value;
        let marker = self.cache_dir.join(UNSAVED_FILE);
        let result = if value {
            fs::write(&marker, b"1")
        } else {
            match fs::remove_file(&marker) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            }
        };
        if let Err(e) = result {
            tracing::warn!("Failed to update unsaved-changes marker: {}", e);
        }
    }

    /// Persist the document's last-modified instant alongside the tiles.
    pub fn save_last_modified(&self, last_modified: SystemTime) {
        let stamp = timestamp_nanos(last_modified);
        if let Err(e) = fs::write(self.cache_dir.join(MODTIME_FILE), stamp) {
            tracing::warn!("Failed to persist cache timestamp: {}", e);
        }
    }

    /// Remove every cached artifact of this document.
    pub fn purge(&self) {
        let _ = fs::remove_dir_all(&self.cache_dir);
    }

    fn remove_entries(&mut self, matches: impl Fn(&str) -> bool) {
        let Ok(entries) = fs::read_dir(&self.cache_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == MODTIME_FILE || name == UNSAVED_FILE {
                continue;
            }
            if matches(&name) {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

/// Frame a cached or rendered tile for delivery to one session.
pub fn frame_tile(desc: &TileDesc, data: &[u8]) -> Bytes {
    let header = desc.serialize("tile:");
    let mut out = BytesMut::with_capacity(header.len() + 1 + data.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(b"\n");
    out.extend_from_slice(data);
    out.freeze()
}

fn timestamp_nanos(t: SystemTime) -> String {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
        .to_string()
}

/// Recover the region identity from a cache file name.
fn parse_cache_name(name: &str) -> Option<TileDesc> {
    // <part>_<w>x<h>.<x>,<y>.<tw>x<th>.png
    let stem = name.strip_suffix(".png")?;
    let mut dots = stem.split('.');
    let head = dots.next()?;
    let pos = dots.next()?;
    let tile_dims = dots.next()?;

    let (part, dims) = head.split_once('_')?;
    let (w, h) = dims.split_once('x')?;
    let (x, y) = pos.split_once(',')?;
    let (tw, th) = tile_dims.split_once('x')?;

    Some(TileDesc {
        part: part.parse().ok()?,
        width: w.parse().ok()?,
        height: h.parse().ok()?,
        tile_pos_x: x.parse().ok()?,
        tile_pos_y: y.parse().ok()?,
        tile_width: tw.parse().ok()?,
        tile_height: th.parse().ok()?,
        ver: -1,
        img_size: 0,
        broadcast: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn desc(x: i32, y: i32) -> TileDesc {
        TileDesc {
            part: 0,
            width: 256,
            height: 256,
            tile_pos_x: x,
            tile_pos_y: y,
            tile_width: 3840,
            tile_height: 3840,
            ver: 1,
            img_size: 0,
            broadcast: false,
        }
    }

    fn new_cache(dir: &std::path::Path) -> TileCache {
        TileCache::new("file:///tmp/doc.odt", UNIX_EPOCH + Duration::from_secs(100), dir.into())
            .unwrap()
    }

    #[test]
    fn test_put_get_invalidate() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = new_cache(dir.path());
        let d = desc(0, 0);

        assert!(cache.lookup(&d).is_none());
        cache.save_and_notify(&d, b"PNGBYTES");
        assert_eq!(cache.lookup(&d).unwrap().as_ref(), b"PNGBYTES");

        cache.invalidate("part=0 x=0 y=0 width=3840 height=3840");
        assert!(cache.lookup(&d).is_none());
    }

    #[test]
    fn test_invalidate_is_regional() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = new_cache(dir.path());
        let near = desc(0, 0);
        let far = desc(0, 76800);
        cache.save_and_notify(&near, b"a");
        cache.save_and_notify(&far, b"b");

        cache.invalidate("part=0 x=0 y=0 width=3840 height=3840");
        assert!(cache.lookup(&near).is_none());
        assert!(cache.lookup(&far).is_some());

        cache.invalidate("EMPTY");
        assert!(cache.lookup(&far).is_none());
    }

    #[test]
    fn test_subscribe_coalesces() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = new_cache(dir.path());
        let d = desc(0, 0);

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        assert!(cache.subscribe(
            &d,
            TileSubscriber {
                session_id: "a".into(),
                sender: tx1
            }
        ));
        // Second subscriber rides the outstanding request.
        assert!(!cache.subscribe(
            &d,
            TileSubscriber {
                session_id: "b".into(),
                sender: tx2
            }
        ));

        cache.save_and_notify(&d, b"XYZ");
        for rx in [&mut rx1, &mut rx2] {
            match rx.try_recv().unwrap() {
                SessionMessage::Binary(frame) => {
                    let line = crate::protocol::first_line(&frame);
                    assert!(line.starts_with("tile: part=0"));
                    assert!(frame.ends_with(b"XYZ"));
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        // Subscription is consumed with the notification.
        let (tx3, _rx3) = mpsc::unbounded_channel();
        assert!(cache.subscribe(
            &d,
            TileSubscriber {
                session_id: "a".into(),
                sender: tx3
            }
        ));
    }

    #[test]
    fn test_cancel_only_sole_subscriptions() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = new_cache(dir.path());
        let (tx, _rx) = mpsc::unbounded_channel();

        let mut lone = desc(0, 0);
        lone.ver = 5;
        let mut shared = desc(3840, 0);
        shared.ver = 6;

        cache.subscribe(
            &lone,
            TileSubscriber {
                session_id: "a".into(),
                sender: tx.clone(),
            },
        );
        cache.subscribe(
            &shared,
            TileSubscriber {
                session_id: "a".into(),
                sender: tx.clone(),
            },
        );
        cache.subscribe(
            &shared,
            TileSubscriber {
                session_id: "b".into(),
                sender: tx.clone(),
            },
        );

        assert_eq!(cache.cancel_tiles("a").as_deref(), Some("canceltiles 5"));
        // The shared render stays pending for the other session.
        assert!(cache.cancel_tiles("b").is_some());
        assert!(cache.cancel_tiles("b").is_none());
    }

    #[test]
    fn test_stale_modtime_clears_cache() {
        let dir = tempfile::tempdir().unwrap();
        let d = desc(0, 0);
        {
            let mut cache = new_cache(dir.path());
            cache.save_and_notify(&d, b"old");
        }
        // Same timestamp: survives.
        {
            let cache = new_cache(dir.path());
            assert!(cache.lookup(&d).is_some());
        }
        // Document changed: cache resets.
        {
            let cache = TileCache::new(
                "file:///tmp/doc.odt",
                UNIX_EPOCH + Duration::from_secs(200),
                dir.path().into(),
            )
            .unwrap();
            assert!(cache.lookup(&d).is_none());
        }
    }

    #[test]
    fn test_unsaved_changes_marker_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut cache = new_cache(dir.path());
            assert!(!cache.unsaved_changes());
            cache.set_unsaved_changes(true);
        }
        {
            let mut cache = new_cache(dir.path());
            assert!(cache.unsaved_changes());
            cache.set_unsaved_changes(false);
            assert!(!cache.unsaved_changes());
        }
    }
}
