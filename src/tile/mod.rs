//! Tile descriptors and their wire format.
//!
//! A tile is a rasterized region of a document. Its descriptor travels as
//! space-separated `name=value` pairs; a combined descriptor batches
//! several tiles that share part and dimensions, with per-tile fields
//! comma-joined.

pub mod cache;

pub use cache::{TileCache, TileSubscriber};

use crate::error::{BrokerError, Result};
use crate::protocol;

/// Descriptor of one rendered tile.
///
/// Cache identity covers every field except `ver`, `imgsize` and
/// `broadcast`: a re-render of the same region replaces the old bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileDesc {
    pub part: i32,
    /// Rendered image width in pixels.
    pub width: i32,
    /// Rendered image height in pixels.
    pub height: i32,
    pub tile_pos_x: i32,
    pub tile_pos_y: i32,
    /// Tile width in document twips.
    pub tile_width: i32,
    /// Tile height in document twips.
    pub tile_height: i32,
    /// Render version; negative when not yet assigned.
    pub ver: i32,
    /// Payload size within a combined response.
    pub img_size: usize,
    /// Deliver the rendered tile to every session, not just the requester.
    pub broadcast: bool,
}

impl TileDesc {
    /// Parse the `name=value` pairs of a descriptor line. A leading bare
    /// token (`tile`, `tile:`) is ignored.
    pub fn parse(line: &str) -> Result<Self> {
        let field = |name: &str| {
            protocol::token_i64(line, name)
                .map(|v| v as i32)
                .ok_or_else(|| BrokerError::Protocol(format!("missing {} in [{}]", name, line)))
        };

        Ok(Self {
            part: field("part")?,
            width: field("width")?,
            height: field("height")?,
            tile_pos_x: field("tileposx")?,
            tile_pos_y: field("tileposy")?,
            tile_width: field("tilewidth")?,
            tile_height: field("tileheight")?,
            ver: protocol::token_i64(line, "ver").unwrap_or(-1) as i32,
            img_size: protocol::token_i64(line, "imgsize").unwrap_or(0) as usize,
            broadcast: protocol::token_string(line, "broadcast") == Some("yes"),
        })
    }

    /// Serialize with the given prefix (`tile`, `tile:`, ...).
    pub fn serialize(&self, prefix: &str) -> String {
        let mut out = format!(
            "{} part={} width={} height={} tileposx={} tileposy={} tilewidth={} tileheight={}",
            prefix,
            self.part,
            self.width,
            self.height,
            self.tile_pos_x,
            self.tile_pos_y,
            self.tile_width,
            self.tile_height
        );
        if self.ver >= 0 {
            out.push_str(&format!(" ver={}", self.ver));
        }
        if self.img_size > 0 {
            out.push_str(&format!(" imgsize={}", self.img_size));
        }
        if self.broadcast {
            out.push_str(" broadcast=yes");
        }
        out
    }

    /// Cache file name; identical for all versions of the same region.
    pub fn cache_name(&self) -> String {
        format!(
            "{}_{}x{}.{},{}.{}x{}.png",
            self.part,
            self.width,
            self.height,
            self.tile_pos_x,
            self.tile_pos_y,
            self.tile_width,
            self.tile_height
        )
    }

    /// Whether this tile overlaps the given document rectangle.
    pub fn intersects(&self, x: i32, y: i32, w: i32, h: i32) -> bool {
        self.tile_pos_x < x + w
            && x < self.tile_pos_x + self.tile_width
            && self.tile_pos_y < y + h
            && y < self.tile_pos_y + self.tile_height
    }
}

/// A batch of tiles sharing part and dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileCombined {
    pub part: i32,
    pub width: i32,
    pub height: i32,
    pub tile_width: i32,
    pub tile_height: i32,
    pub tiles: Vec<TileDesc>,
}

impl TileCombined {
    pub fn parse(line: &str) -> Result<Self> {
        let field = |name: &str| {
            protocol::token_i64(line, name)
                .map(|v| v as i32)
                .ok_or_else(|| BrokerError::Protocol(format!("missing {} in [{}]", name, line)))
        };
        let part = field("part")?;
        let width = field("width")?;
        let height = field("height")?;
        let tile_width = field("tilewidth")?;
        let tile_height = field("tileheight")?;

        let list = |name: &str| -> Vec<String> {
            protocol::token_string(line, name)
                .map(|v| v.split(',').map(str::to_owned).collect())
                .unwrap_or_default()
        };
        let xs = list("tileposx");
        let ys = list("tileposy");
        let vers = list("ver");
        let sizes = list("imgsize");

        if xs.len() != ys.len() || xs.is_empty() {
            return Err(BrokerError::Protocol(format!(
                "mismatched tile positions in [{}]",
                line
            )));
        }

        let mut tiles = Vec::with_capacity(xs.len());
        for i in 0..xs.len() {
            let parse_i32 = |s: &str| {
                s.parse::<i32>()
                    .map_err(|_| BrokerError::Protocol(format!("bad tile position in [{}]", line)))
            };
            tiles.push(TileDesc {
                part,
                width,
                height,
                tile_pos_x: parse_i32(&xs[i])?,
                tile_pos_y: parse_i32(&ys[i])?,
                tile_width,
                tile_height,
                ver: vers.get(i).and_then(|v| v.parse().ok()).unwrap_or(-1),
                img_size: sizes.get(i).and_then(|v| v.parse().ok()).unwrap_or(0),
                broadcast: false,
            });
        }

        Ok(Self {
            part,
            width,
            height,
            tile_width,
            tile_height,
            tiles,
        })
    }

    /// Build a combined descriptor from rendered tiles. All tiles must
    /// share part and dimensions.
    pub fn create(tiles: Vec<TileDesc>) -> Self {
        debug_assert!(!tiles.is_empty());
        let first = &tiles[0];
        Self {
            part: first.part,
            width: first.width,
            height: first.height,
            tile_width: first.tile_width,
            tile_height: first.tile_height,
            tiles,
        }
    }

    pub fn serialize(&self, prefix: &str) -> String {
        let join = |f: &dyn Fn(&TileDesc) -> String| {
            self.tiles.iter().map(|t| f(t)).collect::<Vec<_>>().join(",")
        };
        let mut out = format!(
            "{} part={} width={} height={} tileposx={} tileposy={} tilewidth={} tileheight={}",
            prefix,
            self.part,
            self.width,
            self.height,
            join(&|t| t.tile_pos_x.to_string()),
            join(&|t| t.tile_pos_y.to_string()),
            self.tile_width,
            self.tile_height
        );
        if self.tiles.iter().any(|t| t.ver >= 0) {
            out.push_str(&format!(" ver={}", join(&|t| t.ver.to_string())));
        }
        if self.tiles.iter().any(|t| t.img_size > 0) {
            out.push_str(&format!(" imgsize={}", join(&|t| t.img_size.to_string())));
        }
        out
    }
}
