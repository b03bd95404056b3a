use log::{info, warn};

use crate::bundles::Bundle;
use crate::error::MigrateError;
use crate::session::Session;
use crate::state::{MigrationRecord, MigrationStatus, StateStore};

/// What `retry` decided to do after its safety gates.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RetryGate {
    /// Record already applied: success, nothing to re-run.
    AlreadyApplied,
    /// Stored checksum drifted; repair it, then reset and re-run.
    RepairThenReset,
    /// Reset the record and re-run.
    Reset,
}

/// Pure safety gates for `retry`, separated from the state writes so the
/// blocking rules are testable on their own.
pub fn retry_gate(
    record: Option<&MigrationRecord>,
    disk_fingerprint: &str,
    id: &str,
    accept_checksum: bool,
    force: bool,
) -> Result<RetryGate, MigrateError> {
    let record = record.ok_or_else(|| {
        MigrateError::Error(format!(
            "migration {id} not found in schema_migrations; cannot retry"
        ))
    })?;

    if record.status == MigrationStatus::Applied {
        return Ok(RetryGate::AlreadyApplied);
    }
    if record.status == MigrationStatus::Running {
        if !force {
            return Err(MigrateError::StaleRunning(id.to_string()));
        }
        warn!("forcing retry for {id} while status is running; ensure no other process is active");
    }
    if record.checksum != disk_fingerprint {
        if !accept_checksum {
            return Err(MigrateError::DriftError(id.to_string()));
        }
        return Ok(RetryGate::RepairThenReset);
    }
    Ok(RetryGate::Reset)
}

/// `repair --accept-checksum <id>`: rewrite the stored checksum to the
/// current on-disk fingerprint. No SQL side effects; idempotent.
pub fn repair(
    session: &mut Session,
    store: &StateStore,
    bundles: &[Bundle],
    id: &str,
) -> Result<(), MigrateError> {
    let bundle = find_bundle(bundles, id)?;
    let record = store.get(session, id)?.ok_or_else(|| {
        MigrateError::Error(format!(
            "migration {id} not found in schema_migrations; cannot repair"
        ))
    })?;
    if record.status != MigrationStatus::Applied {
        return Err(MigrateError::Error(format!(
            "migration {id} has status '{}'; only applied migrations can be repaired",
            record.status
        )));
    }
    store.repair_checksum(session, id, bundle.fingerprint())?;
    info!("checksum repaired for {id}");
    Ok(())
}

/// `reset-failed --id <id> [--delete]`: state-table-only recovery. Never
/// transitions away from `applied`.
pub fn reset_failed(
    session: &mut Session,
    store: &StateStore,
    id: &str,
    delete: bool,
) -> Result<(), MigrateError> {
    let record = store.get(session, id)?.ok_or_else(|| {
        MigrateError::Error(format!(
            "migration {id} not found in schema_migrations; cannot reset"
        ))
    })?;
    if record.status == MigrationStatus::Applied {
        return Err(MigrateError::Error(format!(
            "migration {id} is applied; reset-failed only touches non-applied records"
        )));
    }
    if delete {
        store.delete(session, id)?;
        info!("removed migration {id} from schema_migrations");
    } else {
        reset_to_reverted(session, store, id)?;
        info!("reset migration {id} status to reverted");
    }
    Ok(())
}

/// Marks a record `reverted` and clears its execution fields, preserving
/// `checksum` and `log_ref`.
pub fn reset_to_reverted(
    session: &mut Session,
    store: &StateStore,
    id: &str,
) -> Result<(), MigrateError> {
    store.set_status(session, id, MigrationStatus::Reverted)?;
    store.clear_execution_fields(session, id)
}

/// Looks an id up among the discovered bundles.
pub fn find_bundle<'a>(bundles: &'a [Bundle], id: &str) -> Result<&'a Bundle, MigrateError> {
    bundles.iter().find(|b| b.id() == id).ok_or_else(|| {
        MigrateError::Error(format!("migration {id} not found in filesystem"))
    })
}
