//! Lookup log storage.

use super::Database;
use crate::error::{AuditError, AuditResult};
use crate::retention::LoggedKeyUsage;
use crate::sources::KeyUsageStore;
use anyhow::Result;
use rusqlite::params;

impl Database {
    /// Lookup log of one identity, oldest entry first.
    pub fn usage_for(&self, identity: &str) -> Result<Vec<LoggedKeyUsage>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT identity, key, logged_at FROM key_usage
                 WHERE identity = ?1 ORDER BY position",
            )?;
            let rows = stmt.query_map(params![identity], |row| {
                Ok(LoggedKeyUsage {
                    identity: row.get(0)?,
                    key: row.get(1)?,
                    timestamp: row.get(2)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Replace the lookup log of one identity.
    pub fn replace_usage(&self, identity: &str, entries: &[LoggedKeyUsage]) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM key_usage WHERE identity = ?1", params![identity])?;
            {
                let mut insert = tx.prepare(
                    "INSERT OR REPLACE INTO key_usage (identity, key, logged_at, position)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for (position, entry) in entries.iter().enumerate() {
                    insert.execute(params![identity, &entry.key, &entry.timestamp, position as i64])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Identities with at least one logged lookup.
    pub fn usage_identities(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT identity FROM key_usage ORDER BY identity")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
        })
    }
}

impl KeyUsageStore for Database {
    fn get(&self, identity: &str) -> AuditResult<Vec<LoggedKeyUsage>> {
        self.usage_for(identity).map_err(AuditError::storage)
    }

    fn put(&self, identity: &str, entries: &[LoggedKeyUsage]) -> AuditResult<()> {
        self.replace_usage(identity, entries).map_err(AuditError::storage)
    }

    fn identities(&self) -> AuditResult<Vec<String>> {
        self.usage_identities().map_err(AuditError::storage)
    }
}
