use chrono::{DateTime, Utc};
use dialoguer::{Confirm, Input};
use log::{info, warn};

use crate::bundles::{load_bundles, Bundle};
use crate::config::Profile;
use crate::error::MigrateError;
use crate::executor::{run_verify, Direction, Executor};
use crate::lock::LockManager;
use crate::planner::{PlanOptions, Planner};
use crate::recovery::{self, RetryGate};
use crate::session::Session;
use crate::state::{MigrationStatus, StateStore};

/// One line of the `status` report.
pub struct StatusEntry {
    pub id: String,
    pub status: String,
    pub applied_at: Option<DateTime<Utc>>,
    pub applied_by: Option<String>,
    pub execution_ms: Option<i64>,
    pub verify_ok: Option<bool>,
    pub log_ref: Option<String>,
    pub note: String,
}

pub struct StatusReport {
    pub entries: Vec<StatusEntry>,
    pub total: usize,
    pub applied: usize,
}

/// One line of the `plan` preview.
pub struct PlanEntry {
    pub id: String,
    pub tags: Vec<String>,
    pub reversible: bool,
    pub online_safe: bool,
}

pub struct VerifyOutcome {
    pub id: String,
    pub ok: bool,
    pub details: Option<String>,
}

/// Top-level driver: the only component that touches all the others.
///
/// Every mutating verb follows the same shape: connect, ensure the state
/// table, take the advisory lock, load state, plan, confirm, then hand
/// each step to the executor. The lock spans planning and execution so a
/// concurrent run can never invalidate a plan mid-flight, and it is
/// released on every exit path.
pub struct Orchestrator {
    profile: Profile,
    bundles: Vec<Bundle>,
    confirm_prod_override: bool,
    non_interactive: bool,
}

impl Orchestrator {
    pub fn new(
        profile: Profile,
        confirm_prod_override: bool,
        non_interactive: bool,
    ) -> Result<Self, MigrateError> {
        let bundles = load_bundles(&profile.migrations_dir)?;
        info!(
            "loaded {} migration bundle(s) from {}",
            bundles.len(),
            profile.migrations_dir.display()
        );
        Ok(Orchestrator {
            profile,
            bundles,
            confirm_prod_override,
            non_interactive,
        })
    }

    fn connect(&self) -> Result<(Session, StateStore), MigrateError> {
        let mut session = Session::connect(&self.profile)?;
        let store = StateStore::new(&self.profile.schema);
        store.ensure(&mut session)?;
        Ok((session, store))
    }

    fn plan_options(&self, accept_checksum: bool) -> PlanOptions {
        PlanOptions {
            accept_checksum,
            ignore_tags: false,
            allow_tags: self.profile.allow_tags.clone(),
        }
    }

    /// Reconciled view of bundles and records. Read-only; no lock taken.
    pub fn status(&self) -> Result<StatusReport, MigrateError> {
        let (mut session, store) = self.connect()?;
        let records = store.list(&mut session)?;

        let mut entries: Vec<StatusEntry> = Vec::new();
        for bundle in &self.bundles {
            match records.get(bundle.id()) {
                Some(record) => {
                    let drifted = record.status == MigrationStatus::Applied
                        && record.checksum != bundle.fingerprint();
                    entries.push(StatusEntry {
                        id: record.id.clone(),
                        status: record.status.to_string(),
                        applied_at: record.applied_at,
                        applied_by: record.applied_by.clone(),
                        execution_ms: record.execution_ms,
                        verify_ok: record.verify_ok,
                        log_ref: record.log_ref.clone(),
                        note: if drifted { "drift".to_string() } else { String::new() },
                    });
                }
                None => entries.push(StatusEntry {
                    id: bundle.id().to_string(),
                    status: MigrationStatus::Pending.to_string(),
                    applied_at: None,
                    applied_by: None,
                    execution_ms: None,
                    verify_ok: None,
                    log_ref: None,
                    note: String::new(),
                }),
            }
        }
        for record in records.values() {
            if !self.bundles.iter().any(|b| b.id() == record.id) {
                entries.push(StatusEntry {
                    id: record.id.clone(),
                    status: record.status.to_string(),
                    applied_at: record.applied_at,
                    applied_by: record.applied_by.clone(),
                    execution_ms: record.execution_ms,
                    verify_ok: record.verify_ok,
                    log_ref: record.log_ref.clone(),
                    note: "missing on disk".to_string(),
                });
            }
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));

        let applied = records
            .values()
            .filter(|r| r.status == MigrationStatus::Applied)
            .count();
        Ok(StatusReport {
            total: self.bundles.len(),
            applied,
            entries,
        })
    }

    /// Pending-plan preview for `plan [--to T]`. Read-only; no lock taken.
    pub fn plan(&self, target: Option<&str>) -> Result<Vec<PlanEntry>, MigrateError> {
        let (mut session, store) = self.connect()?;
        let records = store.list(&mut session)?;
        let planner = Planner::new(&self.bundles, &records);
        let pending = planner.plan_up(target, &self.plan_options(false))?;
        Ok(pending
            .iter()
            .map(|b| PlanEntry {
                id: b.id().to_string(),
                tags: b.meta().tags.clone(),
                reversible: b.meta().reversible,
                online_safe: b.meta().online_safe,
            })
            .collect())
    }

    /// `up [--to T]`: apply all pending migrations in order.
    pub fn up(&self, target: Option<&str>) -> Result<(), MigrateError> {
        let (mut session, store) = self.connect()?;
        let applied_by = session.current_user()?;
        let lock = LockManager::new(self.profile.lock_key);

        lock.with_lock(&mut session, |session| {
            let records = store.list(session)?;
            let planner = Planner::new(&self.bundles, &records);
            let pending = planner.plan_up(target, &self.plan_options(false))?;
            if pending.is_empty() {
                println!("No pending migrations");
                return Ok(());
            }
            self.confirm_execution(pending.len(), "up")?;
            self.execute_steps(session, &store, &pending, Direction::Up, &applied_by)
        })
    }

    /// `down --to T`: revert applied migrations above the boundary.
    pub fn down(&self, target: &str) -> Result<(), MigrateError> {
        let (mut session, store) = self.connect()?;
        let applied_by = session.current_user()?;
        let lock = LockManager::new(self.profile.lock_key);

        lock.with_lock(&mut session, |session| {
            let records = store.list(session)?;
            let planner = Planner::new(&self.bundles, &records);
            let to_revert = planner.plan_down(target, &self.plan_options(false))?;
            if to_revert.is_empty() {
                println!("Nothing to rollback");
                return Ok(());
            }
            self.confirm_execution(to_revert.len(), "down")?;
            self.execute_steps(session, &store, &to_revert, Direction::Down, &applied_by)
        })
    }

    /// `verify [--latest | --id <id>]`: run verification scripts, each in
    /// its own transaction, recording outcomes. The caller decides how to
    /// surface failures.
    pub fn verify(
        &self,
        latest: bool,
        id: Option<&str>,
    ) -> Result<Vec<VerifyOutcome>, MigrateError> {
        let (mut session, store) = self.connect()?;
        let records = store.list(&mut session)?;

        let applied_ids: Vec<&str> = records
            .values()
            .filter(|r| r.status == MigrationStatus::Applied)
            .map(|r| r.id.as_str())
            .collect();

        let targets: Vec<&Bundle> = if let Some(id) = id {
            let bundle = recovery::find_bundle(&self.bundles, id)?;
            if bundle.verify_script().is_none() {
                return Err(MigrateError::Error(format!(
                    "migration {id} does not have verify.sql"
                )));
            }
            vec![bundle]
        } else if latest {
            let last_applied = applied_ids.last().copied().ok_or_else(|| {
                MigrateError::Error("no applied migrations to verify".to_string())
            })?;
            let bundle = recovery::find_bundle(&self.bundles, last_applied)?;
            if bundle.verify_script().is_some() {
                vec![bundle]
            } else {
                Vec::new()
            }
        } else {
            self.bundles
                .iter()
                .filter(|b| {
                    b.verify_script().is_some() && applied_ids.contains(&b.id())
                })
                .collect()
        };

        if targets.is_empty() {
            return Err(MigrateError::Error(
                "no migrations found for verification".to_string(),
            ));
        }

        let mut outcomes = Vec::with_capacity(targets.len());
        for bundle in targets {
            let timeout_sec = bundle
                .meta()
                .timeout_sec
                .unwrap_or(self.profile.timeout_sec);
            let script = bundle.verify_script().unwrap_or_default();
            let (ok, details) = match run_verify(&mut session, script, timeout_sec) {
                Ok(()) => (true, None),
                Err(e) => (false, Some(e.to_string())),
            };
            // Persist the outcome when the migration has a record; a
            // verify of a never-attempted migration has nowhere to land.
            if records.contains_key(bundle.id()) {
                store.set_verify(&mut session, bundle.id(), ok)?;
            }
            outcomes.push(VerifyOutcome {
                id: bundle.id().to_string(),
                ok,
                details,
            });
        }
        Ok(outcomes)
    }

    /// `repair --accept-checksum <id>`.
    pub fn repair(&self, id: &str) -> Result<(), MigrateError> {
        let (mut session, store) = self.connect()?;
        let lock = LockManager::new(self.profile.lock_key);
        lock.with_lock(&mut session, |session| {
            recovery::repair(session, &store, &self.bundles, id)
        })
    }

    /// `retry --id <id> [--accept-checksum] [--force]`.
    pub fn retry(
        &self,
        id: &str,
        accept_checksum: bool,
        force: bool,
    ) -> Result<(), MigrateError> {
        let (mut session, store) = self.connect()?;
        let applied_by = session.current_user()?;
        let lock = LockManager::new(self.profile.lock_key);

        lock.with_lock(&mut session, |session| {
            let bundle = recovery::find_bundle(&self.bundles, id)?;
            let record = store.get(session, id)?;
            let gate =
                recovery::retry_gate(record.as_ref(), bundle.fingerprint(), id, accept_checksum, force)?;
            if gate == RetryGate::AlreadyApplied {
                println!("Migration {id} is already applied; nothing to retry");
                return Ok(());
            }

            self.confirm_action(
                &format!(
                    "Reset migration {id} to retry? This will mark it as reverted and re-run pending migrations up to it."
                ),
                &format!("Reset status for {id} and retry"),
            )?;

            if gate == RetryGate::RepairThenReset {
                store.repair_checksum(session, id, bundle.fingerprint())?;
                info!("checksum repaired for {id}");
            }
            recovery::reset_to_reverted(session, &store, id)?;

            // Re-plan from the updated state and run forward through the
            // retried migration. Checksum acceptance was settled above.
            let records = store.list(session)?;
            let planner = Planner::new(&self.bundles, &records);
            let pending = planner.plan_up(Some(id), &self.plan_options(accept_checksum))?;
            if pending.is_empty() {
                println!("No pending migrations");
                return Ok(());
            }
            self.execute_steps(session, &store, &pending, Direction::Up, &applied_by)
        })
    }

    /// `reset-failed --id <id> [--delete]`.
    pub fn reset_failed(&self, id: &str, delete: bool) -> Result<(), MigrateError> {
        let (mut session, store) = self.connect()?;
        let lock = LockManager::new(self.profile.lock_key);
        lock.with_lock(&mut session, |session| {
            let action = if delete { "Delete record" } else { "Reset failed status" };
            self.confirm_action(
                &format!(
                    "About to {} failure record for {id}. This does not run any migrations. Proceed?",
                    if delete { "delete" } else { "reset" }
                ),
                action,
            )?;
            recovery::reset_failed(session, &store, id, delete)
        })
    }

    fn execute_steps(
        &self,
        session: &mut Session,
        store: &StateStore,
        plan: &[&Bundle],
        direction: Direction,
        applied_by: &str,
    ) -> Result<(), MigrateError> {
        let executor = Executor::new(
            store,
            &self.profile.log_dir,
            self.profile.timeout_sec,
            applied_by.to_string(),
        );
        for bundle in plan {
            let outcome = executor.run_step(session, bundle, direction)?;
            let verb = match direction {
                Direction::Up => "applied",
                Direction::Down => "reverted",
            };
            match outcome.verify_ok {
                Some(true) => println!(
                    "{verb} {} ({} ms, verify ok)",
                    bundle.id(),
                    outcome.execution_ms
                ),
                Some(false) => {
                    println!(
                        "{verb} {} ({} ms, verify FAILED)",
                        bundle.id(),
                        outcome.execution_ms
                    );
                    warn!("verify_ok recorded as false for {}", bundle.id());
                }
                None => println!("{verb} {} ({} ms)", bundle.id(), outcome.execution_ms),
            }
        }
        Ok(())
    }

    fn confirm_execution(&self, count: usize, direction: &str) -> Result<(), MigrateError> {
        let env = self
            .profile
            .app_env
            .as_deref()
            .unwrap_or(&self.profile.name);
        self.confirm_action(
            &format!("About to run {count} migration(s) {direction} in environment {env}."),
            &format!("Apply {count} migration(s) {direction}"),
        )
    }

    /// Production gate and interactive confirmation.
    ///
    /// A `confirm_prod` profile refuses to execute unless `--confirm-prod`
    /// was supplied or the operator types the schema name. Non-production
    /// interactive runs get a y/N prompt; non-interactive runs pass.
    fn confirm_action(&self, message: &str, description: &str) -> Result<(), MigrateError> {
        if self.profile.confirm_prod && self.confirm_prod_override {
            return Ok(());
        }
        if self.non_interactive || !self.profile.interactive {
            if self.profile.confirm_prod && !self.confirm_prod_override {
                return Err(MigrateError::Error(
                    "production execution requires --confirm-prod in non-interactive mode"
                        .to_string(),
                ));
            }
            return Ok(());
        }
        if self.profile.confirm_prod {
            let response: String = Input::new()
                .with_prompt(format!(
                    "{message} Type the database schema name to confirm"
                ))
                .interact_text()
                .map_err(|e| MigrateError::Error(format!("confirmation prompt failed: {e}")))?;
            if response.trim() != self.profile.schema {
                return Err(MigrateError::Error("confirmation failed; aborting".to_string()));
            }
        } else {
            let confirmed = Confirm::new()
                .with_prompt(format!("{description}?"))
                .default(false)
                .interact()
                .map_err(|e| MigrateError::Error(format!("confirmation prompt failed: {e}")))?;
            if !confirmed {
                return Err(MigrateError::Error("user aborted execution".to_string()));
            }
        }
        Ok(())
    }
}
