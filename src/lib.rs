//! docbroker: per-document coordination core of a collaborative
//! office-document server.
//!
//! Each open document gets one [`DocumentBroker`]: a control loop that
//! binds the document to a single rendering child process (the kit),
//! manages the attached client sessions, mediates tile rendering through
//! a shared [`TileCache`], enforces autosave and idle termination, and
//! arbitrates persistence through a [`storage::Storage`] adapter.
//!
//! ## Module Organization
//!
//! - `broker/` - the broker loop, registry, load, save and tile paths
//! - `tile/` - tile descriptors and the rendered-tile cache
//! - `storage/` - local and WOPI-style storage adapters, token ledger
//! - `session.rs` - client session handles
//! - `child.rs` - kit process handle and spawner interface
//! - `perm.rs` - permission policy projection
//! - `uri.rs` - URI sanitization, docKey and cache-path derivation
//! - `admin.rs` - admin/telemetry sink interface
//!
//! The HTTP/WebSocket entry layer, process spawning and the admin
//! console live outside this crate and plug in through
//! [`child::KitSpawner`], [`admin::AdminSink`] and session egress
//! channels.

pub mod admin;
pub mod broker;
pub mod child;
pub mod config;
pub mod error;
pub mod perm;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod tile;
pub mod uri;

pub use broker::{BrokerHandle, BrokerRegistry, DocumentBroker};
pub use child::{ChildProcess, KitSpawner};
pub use config::BrokerConfig;
pub use error::{BrokerError, Result};
pub use session::{ClientSession, SessionMessage};
pub use storage::{FileInfo, SaveResult, Storage, TokenLedger};
pub use tile::{TileCache, TileCombined, TileDesc};
