//! Estate report storage.

use super::Database;
use crate::error::{AuditError, AuditResult};
use crate::service::EstateReport;
use crate::sources::ReconciliationResultStore;
use anyhow::Result;
use rusqlite::{OptionalExtension, params};

impl Database {
    /// The stored estate report, if a refresh has completed.
    pub fn latest_report(&self) -> Result<Option<EstateReport>> {
        let body: Option<String> = self.with_conn(|conn| {
            Ok(conn
                .query_row("SELECT body FROM estate_reports WHERE id = 1", [], |row| row.get(0))
                .optional()?)
        })?;
        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    /// Replace the stored report in a single statement.
    pub fn store_report(&self, report: &EstateReport) -> Result<()> {
        let body = serde_json::to_string(report)?;
        let generated_at = report.generated_at.to_rfc3339();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO estate_reports (id, generated_at, body) VALUES (1, ?1, ?2)",
                params![generated_at, body],
            )?;
            Ok(())
        })
    }
}

impl ReconciliationResultStore for Database {
    fn latest(&self) -> AuditResult<Option<EstateReport>> {
        self.latest_report().map_err(AuditError::storage)
    }

    fn replace(&self, report: EstateReport) -> AuditResult<()> {
        self.store_report(&report).map_err(AuditError::storage)
    }
}
