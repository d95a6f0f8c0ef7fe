//! One-shot access-token ledger.
//!
//! WOPI access tokens are single-use: the first session presenting a
//! token is admitted and the token is burned; any later presentation is
//! refused. The ledger is a small SQLite table so acceptance survives
//! restarts.

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;

use crate::error::Result;

pub struct TokenLedger {
    conn: Mutex<Connection>,
}

impl TokenLedger {
    pub fn open(path: &Path) -> Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Ephemeral ledger, for tests.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tokens (
                token TEXT,
                expires INTEGER
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Accept a token exactly once.
    ///
    /// Returns true on first observation, recording it with the current
    /// epoch second; false for any token seen before.
    pub fn try_consume(&self, token: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let seen: i64 = conn.query_row(
            "SELECT count(*) FROM tokens WHERE token = ?1",
            params![token],
            |row| row.get(0),
        )?;
        if seen > 0 {
            return Ok(false);
        }
        conn.execute(
            "INSERT INTO tokens (token, expires) VALUES (?1, strftime('%s', 'now'))",
            params![token],
        )?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_accepted_once() {
        let ledger = TokenLedger::in_memory().unwrap();
        assert!(ledger.try_consume("T1").unwrap());
        assert!(!ledger.try_consume("T1").unwrap());
        assert!(!ledger.try_consume("T1").unwrap());
    }

    #[test]
    fn test_distinct_tokens_independent() {
        let ledger = TokenLedger::in_memory().unwrap();
        assert!(ledger.try_consume("T1").unwrap());
        assert!(ledger.try_consume("T2").unwrap());
        assert!(!ledger.try_consume("T2").unwrap());
    }

    #[test]
    fn test_acceptance_persists_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("tokens.sqlite");
        {
            let ledger = TokenLedger::open(&db).unwrap();
            assert!(ledger.try_consume("T1").unwrap());
        }
        {
            let ledger = TokenLedger::open(&db).unwrap();
            assert!(!ledger.try_consume("T1").unwrap());
            assert!(ledger.try_consume("T2").unwrap());
        }
    }
}
