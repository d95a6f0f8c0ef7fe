//! Handle to one kit (rendering child) process.
//!
//! The broker owns the handle; the actual process and its transport are
//! managed by the spawning layer, which hands over a channel pair. Egress
//! carries the line-oriented command verbs, ingress delivers raw frames
//! (text, or a header line plus binary payload).

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub type ChildIngress = mpsc::UnboundedReceiver<Bytes>;

pub struct ChildProcess {
    pid: u32,
    jail_id: String,
    tx: mpsc::UnboundedSender<String>,
    ingress: Option<ChildIngress>,
    alive: Arc<AtomicBool>,
}

impl ChildProcess {
    pub fn new(
        pid: u32,
        jail_id: impl Into<String>,
        tx: mpsc::UnboundedSender<String>,
        ingress: ChildIngress,
    ) -> Self {
        Self {
            pid,
            jail_id: jail_id.into(),
            tx,
            ingress: Some(ingress),
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn jail_id(&self) -> &str {
        &self.jail_id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// The broker loop takes the ingress end once, at startup.
    pub fn take_ingress(&mut self) -> Option<ChildIngress> {
        self.ingress.take()
    }

    /// Send one command line to the kit. A failed send means the
    /// transport is gone; the handle is marked dead.
    pub fn send_text_frame(&self, msg: impl Into<String>) -> bool {
        let msg = msg.into();
        tracing::trace!("To kit [{}]: {}", self.pid, msg);
        if self.tx.send(msg).is_err() {
            self.alive.store(false, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Ask the kit to wind down; it may still flush pending frames.
    pub fn stop(&self) {
        let _ = self.tx.send("exit".to_string());
    }

    /// Drop the transport. A rude close skips the polite stop.
    pub fn close(&mut self, rude: bool) {
        if !rude && self.is_alive() {
            self.stop();
        }
        self.alive.store(false, Ordering::Relaxed);
        self.ingress = None;
    }
}

/// Supplied by the process-spawning layer: yields a connected kit, or
/// None when no kit is currently available (the broker retries).
#[async_trait]
pub trait KitSpawner: Send + Sync {
    async fn spawn(&self) -> Option<ChildProcess>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_marks_dead_on_closed_transport() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (_itx, irx) = mpsc::unbounded_channel();
        let child = ChildProcess::new(7, "jail-7", tx, irx);
        assert!(child.is_alive());
        assert!(child.send_text_frame("session 1 /doc 001"));
        drop(rx);
        assert!(!child.send_text_frame("tile part=0"));
        assert!(!child.is_alive());
    }

    #[test]
    fn test_close_consumes_ingress() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_itx, irx) = mpsc::unbounded_channel();
        let mut child = ChildProcess::new(7, "jail-7", tx, irx);
        assert!(child.take_ingress().is_some());
        assert!(child.take_ingress().is_none());
        child.close(true);
        assert!(!child.is_alive());
    }
}
