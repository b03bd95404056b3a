use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use log::info;
use postgres::Row;

use crate::error::MigrateError;
use crate::session::Session;

/// Lifecycle states of a migration record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MigrationStatus {
    Pending,
    Running,
    Applied,
    Failed,
    Reverted,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::Running => "running",
            MigrationStatus::Applied => "applied",
            MigrationStatus::Failed => "failed",
            MigrationStatus::Reverted => "reverted",
        }
    }

    pub fn from_str(value: &str) -> Result<Self, MigrateError> {
        match value {
            "pending" => Ok(MigrationStatus::Pending),
            "running" => Ok(MigrationStatus::Running),
            "applied" => Ok(MigrationStatus::Applied),
            "failed" => Ok(MigrationStatus::Failed),
            "reverted" => Ok(MigrationStatus::Reverted),
            other => Err(MigrateError::Error(format!(
                "unknown migration status '{other}' in schema_migrations"
            ))),
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of `schema_migrations`.
#[derive(Clone, Debug)]
pub struct MigrationRecord {
    pub id: String,
    pub checksum: String,
    pub status: MigrationStatus,
    pub applied_at: Option<DateTime<Utc>>,
    pub applied_by: Option<String>,
    pub execution_ms: Option<i64>,
    pub verify_ok: Option<bool>,
    pub log_ref: Option<String>,
}

impl MigrationRecord {
    fn from_row(row: &Row) -> Result<Self, MigrateError> {
        let status: String = row.get(2);
        Ok(MigrationRecord {
            id: row.get(0),
            checksum: row.get(1),
            status: MigrationStatus::from_str(&status)?,
            applied_at: row.get(3),
            applied_by: row.get(4),
            execution_ms: row.get(5),
            verify_ok: row.get(6),
            log_ref: row.get(7),
        })
    }
}

/// Full field set for an `upsert_status` write. Absent optional fields are
/// written as NULL, mirroring the insert shape.
pub struct RecordWrite<'a> {
    pub id: &'a str,
    pub checksum: &'a str,
    pub status: MigrationStatus,
    pub applied_at: Option<DateTime<Utc>>,
    pub applied_by: Option<&'a str>,
    pub execution_ms: Option<i64>,
    pub verify_ok: Option<bool>,
    pub log_ref: Option<&'a str>,
}

const RECORD_COLUMNS: &str =
    "id, checksum, status, applied_at, applied_by, execution_ms, verify_ok, log_ref";

/// Owner of the `schema_migrations` table in the configured schema.
///
/// Every write is a single-statement round trip committed on its own, so
/// the store never holds a transaction open across control returns and
/// state writes stay disjoint from user-script transactions.
pub struct StateStore {
    schema: String,
    table: String,
}

impl StateStore {
    pub fn new(schema: &str) -> Self {
        StateStore {
            schema: schema.to_string(),
            table: format!("{}.schema_migrations", quote_ident(schema)),
        }
    }

    /// Creates the schema and table if absent. Idempotent.
    pub fn ensure(&self, session: &mut Session) -> Result<(), MigrateError> {
        let client = session.client_mut();
        client.batch_execute(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_ident(&self.schema)
        ))?;
        client.batch_execute(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                checksum TEXT NOT NULL,
                status TEXT NOT NULL,
                applied_at TIMESTAMPTZ,
                applied_by TEXT,
                execution_ms BIGINT,
                verify_ok BOOLEAN,
                log_ref TEXT
            )",
            self.table
        ))?;
        client.batch_execute(&format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (status)",
            quote_ident(&format!("{}_schema_migrations_status", self.schema)),
            self.table
        ))?;
        info!("state table {} is ready", self.table);
        Ok(())
    }

    /// All records, keyed and ordered by id.
    pub fn list(
        &self,
        session: &mut Session,
    ) -> Result<BTreeMap<String, MigrationRecord>, MigrateError> {
        let rows = session.client_mut().query(
            &format!("SELECT {RECORD_COLUMNS} FROM {} ORDER BY id", self.table),
            &[],
        )?;
        let mut records = BTreeMap::new();
        for row in &rows {
            let record = MigrationRecord::from_row(row)?;
            records.insert(record.id.clone(), record);
        }
        Ok(records)
    }

    pub fn get(
        &self,
        session: &mut Session,
        id: &str,
    ) -> Result<Option<MigrationRecord>, MigrateError> {
        let row = session.client_mut().query_opt(
            &format!("SELECT {RECORD_COLUMNS} FROM {} WHERE id = $1", self.table),
            &[&id],
        )?;
        row.map(|r| MigrationRecord::from_row(&r)).transpose()
    }

    /// Atomic `INSERT ... ON CONFLICT (id) DO UPDATE` of the full record.
    pub fn upsert_status(
        &self,
        session: &mut Session,
        write: &RecordWrite<'_>,
    ) -> Result<(), MigrateError> {
        session.client_mut().execute(
            &format!(
                "INSERT INTO {} ({RECORD_COLUMNS})
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (id) DO UPDATE SET
                     checksum = EXCLUDED.checksum,
                     status = EXCLUDED.status,
                     applied_at = EXCLUDED.applied_at,
                     applied_by = EXCLUDED.applied_by,
                     execution_ms = EXCLUDED.execution_ms,
                     verify_ok = EXCLUDED.verify_ok,
                     log_ref = EXCLUDED.log_ref",
                self.table
            ),
            &[
                &write.id,
                &write.checksum,
                &write.status.as_str(),
                &write.applied_at,
                &write.applied_by,
                &write.execution_ms,
                &write.verify_ok,
                &write.log_ref,
            ],
        )?;
        Ok(())
    }

    /// Status-only transition; the row must already exist.
    pub fn set_status(
        &self,
        session: &mut Session,
        id: &str,
        status: MigrationStatus,
    ) -> Result<(), MigrateError> {
        let updated = session.client_mut().execute(
            &format!("UPDATE {} SET status = $1 WHERE id = $2", self.table),
            &[&status.as_str(), &id],
        )?;
        if updated == 0 {
            return Err(MigrateError::Error(format!(
                "migration {id} not found in schema_migrations"
            )));
        }
        Ok(())
    }

    /// Nulls out `applied_at`, `applied_by`, `execution_ms` and
    /// `verify_ok`, preserving `checksum` and `log_ref`.
    pub fn clear_execution_fields(
        &self,
        session: &mut Session,
        id: &str,
    ) -> Result<(), MigrateError> {
        let updated = session.client_mut().execute(
            &format!(
                "UPDATE {} SET applied_at = NULL, applied_by = NULL,
                     execution_ms = NULL, verify_ok = NULL
                 WHERE id = $1",
                self.table
            ),
            &[&id],
        )?;
        if updated == 0 {
            return Err(MigrateError::Error(format!(
                "migration {id} not found in schema_migrations"
            )));
        }
        Ok(())
    }

    pub fn set_verify(
        &self,
        session: &mut Session,
        id: &str,
        ok: bool,
    ) -> Result<(), MigrateError> {
        let updated = session.client_mut().execute(
            &format!("UPDATE {} SET verify_ok = $1 WHERE id = $2", self.table),
            &[&ok, &id],
        )?;
        if updated == 0 {
            return Err(MigrateError::Error(format!(
                "migration {id} not found in schema_migrations"
            )));
        }
        Ok(())
    }

    /// Rewrites the stored checksum only; used by `repair` and `retry`.
    pub fn repair_checksum(
        &self,
        session: &mut Session,
        id: &str,
        checksum: &str,
    ) -> Result<(), MigrateError> {
        let updated = session.client_mut().execute(
            &format!("UPDATE {} SET checksum = $1 WHERE id = $2", self.table),
            &[&checksum, &id],
        )?;
        if updated == 0 {
            return Err(MigrateError::Error(format!(
                "migration {id} not found for checksum repair"
            )));
        }
        Ok(())
    }

    pub fn delete(&self, session: &mut Session, id: &str) -> Result<(), MigrateError> {
        session.client_mut().execute(
            &format!("DELETE FROM {} WHERE id = $1", self.table),
            &[&id],
        )?;
        Ok(())
    }
}

/// Double-quotes an identifier, doubling embedded quotes.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
