//! Tile request/response coordination between sessions, cache and kit.

use std::sync::Arc;

use crate::broker::DocumentBroker;
use crate::protocol;
use crate::session::ClientSession;
use crate::tile::cache::frame_tile;
use crate::tile::{TileCombined, TileDesc, TileSubscriber};

impl DocumentBroker {
    /// Serve one tile: from the cache when possible, otherwise subscribe
    /// the session and ask the kit to render.
    pub fn handle_tile_request(&mut self, mut tile: TileDesc, session: &Arc<ClientSession>) {
        self.tile_version += 1;
        tile.ver = self.tile_version;
        tracing::trace!("Tile request for {}", tile.serialize("tile"));

        let Some(cache) = self.tile_cache.as_mut() else {
            tracing::warn!("Tile request for [{}] before load", self.doc_key);
            return;
        };

        if let Some(bytes) = cache.lookup(&tile) {
            session.send_binary_frame(frame_tile(&tile, &bytes));
            return;
        }

        let needs_render = if tile.broadcast {
            let mut first = false;
            for other in self.sessions.values() {
                first |= cache.subscribe(
                    &tile,
                    TileSubscriber {
                        session_id: other.id().to_string(),
                        sender: other.egress(),
                    },
                );
            }
            first
        } else {
            cache.subscribe(
                &tile,
                TileSubscriber {
                    session_id: session.id().to_string(),
                    sender: session.egress(),
                },
            )
        };

        if needs_render {
            tracing::debug!(
                "Sending render request for tile ({},{},{})",
                tile.part,
                tile.tile_pos_x,
                tile.tile_pos_y
            );
            if let Some(child) = &self.child {
                child.send_text_frame(tile.serialize("tile"));
            }
        }
    }

    /// Serve a batch: cached tiles answer immediately, the rest go to the
    /// kit as one residual `tilecombine`.
    pub fn handle_tile_combined_request(
        &mut self,
        combined: TileCombined,
        session: &Arc<ClientSession>,
    ) {
        tracing::trace!("TileCombined request for {}", combined.serialize("tilecombine"));

        let Some(cache) = self.tile_cache.as_mut() else {
            tracing::warn!("Tile request for [{}] before load", self.doc_key);
            return;
        };

        let mut residual = Vec::new();
        for mut tile in combined.tiles {
            if let Some(bytes) = cache.lookup(&tile) {
                session.send_binary_frame(frame_tile(&tile, &bytes));
                continue;
            }

            // Not cached, needs rendering.
            self.tile_version += 1;
            tile.ver = self.tile_version;
            let first = cache.subscribe(
                &tile,
                TileSubscriber {
                    session_id: session.id().to_string(),
                    sender: session.egress(),
                },
            );
            if first {
                residual.push(tile);
            }
        }

        if !residual.is_empty() {
            let request = TileCombined::create(residual).serialize("tilecombine");
            tracing::debug!("Sending residual tilecombine: {}", request);
            if let Some(child) = &self.child {
                child.send_text_frame(request);
            }
        }
    }

    /// Cancel renders only this session is waiting for.
    pub fn cancel_tile_requests(&mut self, session_id: &str) {
        let Some(cache) = self.tile_cache.as_mut() else {
            return;
        };
        if let Some(cancel) = cache.cancel_tiles(session_id) {
            tracing::debug!("Forwarding canceltiles request: {}", cancel);
            if let Some(child) = &self.child {
                child.send_text_frame(cancel);
            }
        }
    }

    /// Drop cached entries the kit declared stale.
    pub fn invalidate_tiles(&mut self, selector: &str) {
        if let Some(cache) = self.tile_cache.as_mut() {
            cache.invalidate(selector);
        }
    }

    /// One rendered tile arrived: header line, newline, payload.
    pub(crate) fn handle_tile_response(&mut self, payload: &[u8]) {
        let first_line = protocol::first_line(payload);
        tracing::debug!("Handling tile: {}", first_line);

        if first_line.len() + 1 >= payload.len() {
            // They will get re-issued if we don't forget them.
            tracing::warn!("Dropping empty tile response: {}", first_line);
            return;
        }

        match TileDesc::parse(first_line) {
            Ok(tile) => {
                let offset = first_line.len() + 1;
                if let Some(cache) = self.tile_cache.as_mut() {
                    cache.save_and_notify(&tile, &payload[offset..]);
                }
            }
            Err(e) => {
                tracing::error!("Failed to process tile response [{}]: {}", first_line, e);
            }
        }
    }

    /// A combined render arrived: one header, payloads packed back to
    /// back, boundaries given by each descriptor's imgsize.
    pub(crate) fn handle_tile_combined_response(&mut self, payload: &[u8]) {
        let first_line = protocol::first_line(payload);
        tracing::debug!("Handling tile combined: {}", first_line);

        if first_line.len() + 1 >= payload.len() {
            tracing::warn!("Dropping empty tilecombine response: {}", first_line);
            return;
        }

        match TileCombined::parse(first_line) {
            Ok(combined) => {
                let mut offset = first_line.len() + 1;
                for tile in &combined.tiles {
                    let end = offset + tile.img_size;
                    if end > payload.len() {
                        tracing::error!(
                            "Truncated tilecombine response [{}] at tile {}",
                            first_line,
                            tile.cache_name()
                        );
                        break;
                    }
                    if let Some(cache) = self.tile_cache.as_mut() {
                        cache.save_and_notify(tile, &payload[offset..end]);
                    }
                    offset = end;
                }
            }
            Err(e) => {
                tracing::error!(
                    "Failed to process tilecombine response [{}]: {}",
                    first_line,
                    e
                );
            }
        }
    }
}
