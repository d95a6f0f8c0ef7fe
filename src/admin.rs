//! Admin/telemetry sink interface.
//!
//! The console itself lives outside this crate; brokers report document
//! lifecycle and kit memory figures through this trait. The default sink
//! discards everything.

pub trait AdminSink: Send + Sync {
    fn add_doc(&self, doc_key: &str, pid: u32, filename: &str, session_id: &str);
    fn rm_doc(&self, doc_key: &str, session_id: Option<&str>);
    fn update_memory_dirty(&self, doc_key: &str, dirty_kb: i64);
    fn update_last_activity(&self, doc_key: &str);
}

pub struct NoopAdmin;

impl AdminSink for NoopAdmin {
    fn add_doc(&self, _doc_key: &str, _pid: u32, _filename: &str, _session_id: &str) {}
    fn rm_doc(&self, _doc_key: &str, _session_id: Option<&str>) {}
    fn update_memory_dirty(&self, _doc_key: &str, _dirty_kb: i64) {}
    fn update_last_activity(&self, _doc_key: &str) {}
}
