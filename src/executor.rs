use std::path::Path;
use std::process::Command;
use std::time::Instant;

use chrono::Utc;
use log::{info, warn};

use crate::bundles::Bundle;
use crate::error::MigrateError;
use crate::session::Session;
use crate::state::{MigrationStatus, RecordWrite, StateStore};
use crate::steplog::StepLog;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    fn verb(&self) -> &'static str {
        match self {
            Direction::Up => "Applying",
            Direction::Down => "Reverting",
        }
    }

    fn log_suffix(&self) -> Option<&'static str> {
        match self {
            Direction::Up => None,
            Direction::Down => Some("down"),
        }
    }
}

/// What a completed step reported back.
pub struct StepOutcome {
    pub execution_ms: i64,
    pub verify_ok: Option<bool>,
}

/// Executes one plan step at a time against the orchestrator's session.
///
/// Per step: pre-hooks, then four state-table round trips bracketing the
/// script transaction. The script runs in a single transaction of its own
/// (tx#2); every state write commits separately so a failing script can
/// never take the bookkeeping down with it.
pub struct Executor<'a> {
    store: &'a StateStore,
    log_dir: &'a Path,
    default_timeout_sec: u32,
    applied_by: String,
}

impl<'a> Executor<'a> {
    pub fn new(
        store: &'a StateStore,
        log_dir: &'a Path,
        default_timeout_sec: u32,
        applied_by: String,
    ) -> Self {
        Executor {
            store,
            log_dir,
            default_timeout_sec,
            applied_by,
        }
    }

    pub fn run_step(
        &self,
        session: &mut Session,
        bundle: &Bundle,
        direction: Direction,
    ) -> Result<StepOutcome, MigrateError> {
        let mut log = StepLog::create(self.log_dir, bundle.id(), direction.log_suffix())?;
        let notices = session.notices();
        notices.install(log.writer()?);
        let result = self.run_step_inner(session, bundle, direction, &mut log);
        notices.remove();
        result
    }

    fn run_step_inner(
        &self,
        session: &mut Session,
        bundle: &Bundle,
        direction: Direction,
        log: &mut StepLog,
    ) -> Result<StepOutcome, MigrateError> {
        let timeout_sec = bundle
            .meta()
            .timeout_sec
            .unwrap_or(self.default_timeout_sec);
        let start = Instant::now();
        log.log(&format!("-- {} {} --", direction.verb(), bundle.id()));

        // Hook failure before tx#1 leaves the record untouched.
        run_hooks(&bundle.meta().pre_hooks, log, "pre_hook")?;

        // tx#1: mark running before any script side effect is possible.
        self.store.upsert_status(
            session,
            &RecordWrite {
                id: bundle.id(),
                checksum: bundle.fingerprint(),
                status: MigrationStatus::Running,
                applied_at: None,
                applied_by: Some(&self.applied_by),
                execution_ms: None,
                verify_ok: None,
                log_ref: Some(log.file_name()),
            },
        )?;

        // tx#2: the script itself, one transaction, statement timeout set
        // locally so it dies with the transaction.
        let script = match direction {
            Direction::Up => bundle.up_script(),
            Direction::Down => bundle.down_script(),
        };
        log.log(&format!(
            "executing {} with timeout {timeout_sec}s",
            match direction {
                Direction::Up => "up.sql",
                Direction::Down => "down.sql",
            }
        ));
        if let Err(e) = execute_script(session, script, timeout_sec, log) {
            let execution_ms = start.elapsed().as_millis() as i64;
            log.log(&format!("migration failed: {e}"));
            // tx#E: best effort; the step error is what the caller sees.
            let failed = RecordWrite {
                id: bundle.id(),
                checksum: bundle.fingerprint(),
                status: MigrationStatus::Failed,
                applied_at: None,
                applied_by: Some(&self.applied_by),
                execution_ms: Some(execution_ms),
                verify_ok: None,
                log_ref: Some(log.file_name()),
            };
            if let Err(write_err) = self.store.upsert_status(session, &failed) {
                warn!(
                    "could not record failure for {}: {write_err}",
                    bundle.id()
                );
            }
            return Err(MigrateError::ExecutionError(format!(
                "migration {}: {e}",
                bundle.id()
            )));
        }

        let execution_ms = start.elapsed().as_millis() as i64;

        // tx#3: terminal status.
        let write = match direction {
            Direction::Up => RecordWrite {
                id: bundle.id(),
                checksum: bundle.fingerprint(),
                status: MigrationStatus::Applied,
                applied_at: Some(Utc::now()),
                applied_by: Some(&self.applied_by),
                execution_ms: Some(execution_ms),
                verify_ok: None,
                log_ref: Some(log.file_name()),
            },
            Direction::Down => RecordWrite {
                id: bundle.id(),
                checksum: bundle.fingerprint(),
                status: MigrationStatus::Reverted,
                applied_at: None,
                applied_by: Some(&self.applied_by),
                execution_ms: None,
                verify_ok: None,
                log_ref: Some(log.file_name()),
            },
        };
        self.store.upsert_status(session, &write)?;

        // Post-hook failures are logged but the migration stays applied.
        if let Err(e) = run_hooks(&bundle.meta().post_hooks, log, "post_hook") {
            warn!("post hook failed for {}: {e}", bundle.id());
            log.log(&format!("post hook failed (ignored): {e}"));
        }

        // tx#4: verification in its own transaction. A failed check is
        // recorded, never rolled back.
        let mut verify_ok = None;
        if direction == Direction::Up {
            if let Some(verify) = bundle.verify_script() {
                let ok = match run_verify(session, verify, timeout_sec) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("verify.sql failed for {}: {e}", bundle.id());
                        log.log(&format!("verify.sql failed: {e}"));
                        false
                    }
                };
                self.store.set_verify(session, bundle.id(), ok)?;
                verify_ok = Some(ok);
            }
        }

        log.log(&format!(
            "migration {} successfully in {execution_ms} ms",
            match direction {
                Direction::Up => "applied",
                Direction::Down => "reverted",
            }
        ));
        info!(
            "{} {} in {execution_ms} ms",
            match direction {
                Direction::Up => "applied",
                Direction::Down => "reverted",
            },
            bundle.id()
        );

        Ok(StepOutcome {
            execution_ms,
            verify_ok,
        })
    }
}

fn execute_script(
    session: &mut Session,
    script: &str,
    timeout_sec: u32,
    log: &mut StepLog,
) -> Result<(), postgres::Error> {
    if script.trim().is_empty() {
        log.log("no SQL to execute");
        return Ok(());
    }
    let mut tx = session.client_mut().transaction()?;
    tx.batch_execute(&format!(
        "SET LOCAL statement_timeout = {}",
        timeout_sec as i64 * 1000
    ))?;
    tx.batch_execute(script)?;
    tx.commit()
}

/// Runs a `verify.sql` script in its own transaction with the step's
/// statement timeout. Also used by the standalone `verify` verb.
pub fn run_verify(
    session: &mut Session,
    script: &str,
    timeout_sec: u32,
) -> Result<(), postgres::Error> {
    let mut tx = session.client_mut().transaction()?;
    tx.batch_execute(&format!(
        "SET LOCAL statement_timeout = {}",
        timeout_sec as i64 * 1000
    ))?;
    tx.batch_execute(script)?;
    tx.commit()
}

fn run_hooks(hooks: &[String], log: &mut StepLog, phase: &str) -> Result<(), MigrateError> {
    for hook in hooks {
        log.log(&format!("running {phase}: {hook}"));
        let output = Command::new("sh")
            .arg("-c")
            .arg(hook)
            .output()
            .map_err(|e| {
                MigrateError::ExecutionError(format!("{phase} could not start: {hook}: {e}"))
            })?;
        if !output.stdout.is_empty() {
            log.log(String::from_utf8_lossy(&output.stdout).trim_end());
        }
        if !output.stderr.is_empty() {
            log.log(String::from_utf8_lossy(&output.stderr).trim_end());
        }
        if !output.status.success() {
            return Err(MigrateError::ExecutionError(format!(
                "{phase} failed: {hook}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn step_log(dir: &TempDir) -> StepLog {
        StepLog::create(dir.path(), "m1", None).expect("Failed to create step log")
    }

    #[test]
    fn test_run_hooks_success_captures_output() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let mut log = step_log(&temp_dir);
        let hooks = vec!["echo hello-from-hook".to_string()];

        run_hooks(&hooks, &mut log, "pre_hook").expect("Hook should succeed");

        let content = fs::read_to_string(temp_dir.path().join(log.file_name())).unwrap();
        assert!(content.contains("running pre_hook: echo hello-from-hook"));
        assert!(content.contains("hello-from-hook"));
    }

    #[test]
    fn test_run_hooks_failure_is_execution_error() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let mut log = step_log(&temp_dir);
        let hooks = vec!["exit 3".to_string()];

        let err = run_hooks(&hooks, &mut log, "pre_hook").unwrap_err();
        match err {
            MigrateError::ExecutionError(msg) => assert!(msg.contains("pre_hook failed")),
            other => panic!("Expected ExecutionError, got {other:?}"),
        }
    }

    #[test]
    fn test_run_hooks_stop_at_first_failure() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let marker = temp_dir.path().join("marker");
        let mut log = step_log(&temp_dir);
        let hooks = vec![
            "false".to_string(),
            format!("touch {}", marker.display()),
        ];

        assert!(run_hooks(&hooks, &mut log, "pre_hook").is_err());
        assert!(!marker.exists(), "Second hook must not run after a failure");
    }

    #[test]
    fn test_run_hooks_empty_is_noop() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let mut log = step_log(&temp_dir);
        run_hooks(&[], &mut log, "post_hook").expect("Empty hook list should succeed");
    }

    #[test]
    fn test_direction_log_suffix() {
        assert_eq!(Direction::Up.log_suffix(), None);
        assert_eq!(Direction::Down.log_suffix(), Some("down"));
    }
}
