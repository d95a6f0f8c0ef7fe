//! Process-wide broker registry and shutdown flag.
//!
//! At most one live broker exists per docKey; the registry is the
//! authority for that invariant and the fan-out point for messages that
//! must reach every session of every document.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::broker::BrokerHandle;

/// Raised when the whole service is being recycled; every broker loop
/// picks it up on its next tick and exits with reason "recycling".
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Relaxed)
}

#[derive(Default)]
pub struct BrokerRegistry {
    brokers: Mutex<HashMap<String, BrokerHandle>>,
    next_doc_id: AtomicU32,
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self {
            brokers: Mutex::new(HashMap::new()),
            next_doc_id: AtomicU32::new(1),
        }
    }

    /// Short process-unique document id.
    pub fn next_doc_id(&self) -> String {
        format!("{:03x}", self.next_doc_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Claim the docKey for a new broker. Fails while a live broker
    /// already holds it; a dead handle left behind is displaced.
    pub fn register(&self, handle: BrokerHandle) -> bool {
        let mut brokers = self.brokers.lock();
        if let Some(existing) = brokers.get(handle.doc_key()) {
            if existing.is_alive() {
                return false;
            }
        }
        brokers.insert(handle.doc_key().to_string(), handle);
        true
    }

    pub fn deregister(&self, doc_key: &str) {
        self.brokers.lock().remove(doc_key);
    }

    pub fn get(&self, doc_key: &str) -> Option<BrokerHandle> {
        self.brokers
            .lock()
            .get(doc_key)
            .filter(|h| h.is_alive())
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.brokers.lock().len()
    }

    /// Broadcast an error to every session of every broker.
    pub fn alert_all_users(&self, cmd: &str, kind: &str) {
        let msg = format!("error: cmd={} kind={}", cmd, kind);
        let handles: Vec<BrokerHandle> = self.brokers.lock().values().cloned().collect();
        for handle in handles {
            let msg = msg.clone();
            handle.add_callback(move |broker| broker.alert_all_users(&msg));
        }
    }
}
