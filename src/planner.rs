use std::collections::{BTreeMap, HashSet};

use crate::bundles::Bundle;
use crate::error::MigrateError;
use crate::state::{MigrationRecord, MigrationStatus};

/// Call-time switches for plan computation.
///
/// `accept_checksum` is only ever set by the `repair`/`retry` flows;
/// normal `up` runs treat drift as fatal.
#[derive(Clone, Debug, Default)]
pub struct PlanOptions {
    pub accept_checksum: bool,
    pub ignore_tags: bool,
    pub allow_tags: Vec<String>,
}

/// Reconciles on-disk bundles with the state table.
///
/// The planner is a pure function of its two inputs: identical bundles and
/// records always produce the identical plan, so plans are stable across
/// runs and safe to preview.
pub struct Planner<'a> {
    bundles: &'a [Bundle],
    records: &'a BTreeMap<String, MigrationRecord>,
}

impl<'a> Planner<'a> {
    pub fn new(
        bundles: &'a [Bundle],
        records: &'a BTreeMap<String, MigrationRecord>,
    ) -> Self {
        Planner { bundles, records }
    }

    /// Ordered pending list for `up`, ascending, optionally bounded by an
    /// inclusive target id.
    pub fn plan_up(
        &self,
        target: Option<&str>,
        opts: &PlanOptions,
    ) -> Result<Vec<&'a Bundle>, MigrateError> {
        if let Some(t) = target {
            if !self.bundles.iter().any(|b| b.id() == t) {
                return Err(MigrateError::Error(format!(
                    "target migration {t} not found"
                )));
            }
        }

        self.check_missing_bundles()?;

        let mut pending: Vec<&Bundle> = Vec::new();
        for bundle in self.bundles {
            if let Some(t) = target {
                if bundle.id() > t {
                    break;
                }
            }
            match self.records.get(bundle.id()) {
                Some(record) => match record.status {
                    MigrationStatus::Applied => {
                        if record.checksum != bundle.fingerprint() && !opts.accept_checksum {
                            return Err(MigrateError::DriftError(bundle.id().to_string()));
                        }
                        continue;
                    }
                    MigrationStatus::Running => {
                        return Err(MigrateError::StaleRunning(bundle.id().to_string()));
                    }
                    MigrationStatus::Failed => {
                        return Err(MigrateError::Error(format!(
                            "migration {id} previously failed; use `retry --id {id}` or `reset-failed --id {id}`",
                            id = bundle.id()
                        )));
                    }
                    MigrationStatus::Pending | MigrationStatus::Reverted => {}
                },
                None => {}
            }
            self.check_tags(bundle, opts)?;
            pending.push(bundle);
        }

        self.check_dependencies(&pending)?;
        Ok(pending)
    }

    /// Reverse list for `down --to T`: applied records with id strictly
    /// greater than `target`, descending.
    pub fn plan_down(
        &self,
        target: &str,
        opts: &PlanOptions,
    ) -> Result<Vec<&'a Bundle>, MigrateError> {
        let mut to_revert: Vec<&Bundle> = Vec::new();
        for record in self.records.values().rev() {
            if record.status != MigrationStatus::Applied || record.id.as_str() <= target {
                continue;
            }
            let bundle = self
                .bundles
                .iter()
                .find(|b| b.id() == record.id)
                .ok_or_else(|| MigrateError::DriftError(record.id.clone()))?;
            if !bundle.meta().reversible {
                return Err(MigrateError::IrreversibleError(bundle.id().to_string()));
            }
            self.check_tags(bundle, opts)?;
            to_revert.push(bundle);
        }
        Ok(to_revert)
    }

    /// An applied record whose bundle vanished from disk blocks forward
    /// work until `reset-failed --delete` removes it.
    fn check_missing_bundles(&self) -> Result<(), MigrateError> {
        let on_disk: HashSet<&str> = self.bundles.iter().map(|b| b.id()).collect();
        for record in self.records.values() {
            if record.status == MigrationStatus::Applied && !on_disk.contains(record.id.as_str()) {
                return Err(MigrateError::DriftError(record.id.clone()));
            }
        }
        Ok(())
    }

    fn check_tags(&self, bundle: &Bundle, opts: &PlanOptions) -> Result<(), MigrateError> {
        if opts.allow_tags.is_empty() || opts.ignore_tags {
            return Ok(());
        }
        let allowed = bundle
            .meta()
            .tags
            .iter()
            .any(|tag| opts.allow_tags.contains(tag));
        if !allowed {
            return Err(MigrateError::TagBlocked(bundle.id().to_string()));
        }
        Ok(())
    }

    /// Every `requires` entry must already be applied or appear earlier in
    /// the same plan.
    fn check_dependencies(&self, pending: &[&Bundle]) -> Result<(), MigrateError> {
        let applied: HashSet<&str> = self
            .records
            .values()
            .filter(|r| r.status == MigrationStatus::Applied)
            .map(|r| r.id.as_str())
            .collect();

        let mut planned: HashSet<&str> = HashSet::new();
        for bundle in pending {
            for required in &bundle.meta().requires {
                if !applied.contains(required.as_str()) && !planned.contains(required.as_str()) {
                    return Err(MigrateError::DependencyError {
                        id: bundle.id().to_string(),
                        required: required.clone(),
                    });
                }
            }
            planned.insert(bundle.id());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundles::BundleMeta;

    fn bundle(id: &str) -> Bundle {
        Bundle::synthetic(id, "SELECT 1;", "SELECT 2;", BundleMeta::default())
    }

    fn bundle_with_meta(id: &str, meta: BundleMeta) -> Bundle {
        Bundle::synthetic(id, "SELECT 1;", "SELECT 2;", meta)
    }

    fn record(bundle: &Bundle, status: MigrationStatus) -> MigrationRecord {
        MigrationRecord {
            id: bundle.id().to_string(),
            checksum: bundle.fingerprint().to_string(),
            status,
            applied_at: None,
            applied_by: None,
            execution_ms: None,
            verify_ok: None,
            log_ref: None,
        }
    }

    fn records(entries: Vec<MigrationRecord>) -> BTreeMap<String, MigrationRecord> {
        entries.into_iter().map(|r| (r.id.clone(), r)).collect()
    }

    fn ids(plan: &[&Bundle]) -> Vec<String> {
        plan.iter().map(|b| b.id().to_string()).collect()
    }

    #[test]
    fn test_plan_up_all_pending_ascending() {
        let bundles = vec![bundle("2025-01-02__b"), bundle("2025-01-01__a")];
        // Loader hands bundles over sorted; mimic that.
        let bundles = {
            let mut b = bundles;
            b.sort_by(|x, y| x.id().cmp(y.id()));
            b
        };
        let recs = records(vec![]);
        let plan = Planner::new(&bundles, &recs)
            .plan_up(None, &PlanOptions::default())
            .expect("Plan should succeed");
        assert_eq!(ids(&plan), vec!["2025-01-01__a", "2025-01-02__b"]);
    }

    #[test]
    fn test_plan_up_skips_applied() {
        let bundles = vec![bundle("a"), bundle("b"), bundle("c")];
        let recs = records(vec![record(&bundles[0], MigrationStatus::Applied)]);
        let plan = Planner::new(&bundles, &recs)
            .plan_up(None, &PlanOptions::default())
            .expect("Plan should succeed");
        assert_eq!(ids(&plan), vec!["b", "c"]);
    }

    #[test]
    fn test_plan_up_includes_reverted_and_pending() {
        let bundles = vec![bundle("a"), bundle("b")];
        let recs = records(vec![
            record(&bundles[0], MigrationStatus::Reverted),
            record(&bundles[1], MigrationStatus::Pending),
        ]);
        let plan = Planner::new(&bundles, &recs)
            .plan_up(None, &PlanOptions::default())
            .expect("Plan should succeed");
        assert_eq!(ids(&plan), vec!["a", "b"]);
    }

    #[test]
    fn test_plan_up_respects_target() {
        let bundles = vec![bundle("a"), bundle("b"), bundle("c")];
        let recs = records(vec![]);
        let plan = Planner::new(&bundles, &recs)
            .plan_up(Some("b"), &PlanOptions::default())
            .expect("Plan should succeed");
        assert_eq!(ids(&plan), vec!["a", "b"]);
    }

    #[test]
    fn test_plan_up_unknown_target_is_error() {
        let bundles = vec![bundle("a")];
        let recs = records(vec![]);
        let err = Planner::new(&bundles, &recs)
            .plan_up(Some("z"), &PlanOptions::default())
            .unwrap_err();
        assert!(matches!(err, MigrateError::Error(_)));
    }

    #[test]
    fn test_plan_up_ignores_failure_beyond_target() {
        let bundles = vec![bundle("a"), bundle("b"), bundle("c")];
        let recs = records(vec![record(&bundles[2], MigrationStatus::Failed)]);
        let plan = Planner::new(&bundles, &recs)
            .plan_up(Some("b"), &PlanOptions::default())
            .expect("Plan should succeed");
        assert_eq!(ids(&plan), vec!["a", "b"]);
    }

    #[test]
    fn test_plan_up_drift_is_error() {
        let bundles = vec![bundle("a")];
        let mut drifted = record(&bundles[0], MigrationStatus::Applied);
        drifted.checksum = "0000".to_string();
        let recs = records(vec![drifted]);
        let err = Planner::new(&bundles, &recs)
            .plan_up(None, &PlanOptions::default())
            .unwrap_err();
        match err {
            MigrateError::DriftError(id) => assert_eq!(id, "a"),
            other => panic!("Expected DriftError, got {other:?}"),
        }
    }

    #[test]
    fn test_plan_up_drift_tolerated_with_accept_checksum() {
        let bundles = vec![bundle("a"), bundle("b")];
        let mut drifted = record(&bundles[0], MigrationStatus::Applied);
        drifted.checksum = "0000".to_string();
        let recs = records(vec![drifted]);
        let opts = PlanOptions {
            accept_checksum: true,
            ..PlanOptions::default()
        };
        let plan = Planner::new(&bundles, &recs)
            .plan_up(None, &opts)
            .expect("Plan should succeed");
        assert_eq!(ids(&plan), vec!["b"]);
    }

    #[test]
    fn test_plan_up_running_is_stale_running() {
        let bundles = vec![bundle("a")];
        let recs = records(vec![record(&bundles[0], MigrationStatus::Running)]);
        let err = Planner::new(&bundles, &recs)
            .plan_up(None, &PlanOptions::default())
            .unwrap_err();
        assert!(matches!(err, MigrateError::StaleRunning(_)));
    }

    #[test]
    fn test_plan_up_failed_blocks_and_names_recovery() {
        let bundles = vec![bundle("a")];
        let recs = records(vec![record(&bundles[0], MigrationStatus::Failed)]);
        let err = Planner::new(&bundles, &recs)
            .plan_up(None, &PlanOptions::default())
            .unwrap_err();
        match err {
            MigrateError::Error(msg) => {
                assert!(msg.contains("retry --id a"));
                assert!(msg.contains("reset-failed --id a"));
            }
            other => panic!("Expected Error, got {other:?}"),
        }
    }

    #[test]
    fn test_plan_up_missing_bundle_for_applied_record_is_drift() {
        let bundles = vec![bundle("b")];
        let gone = MigrationRecord {
            id: "a".to_string(),
            checksum: "feed".to_string(),
            status: MigrationStatus::Applied,
            applied_at: None,
            applied_by: None,
            execution_ms: None,
            verify_ok: None,
            log_ref: None,
        };
        let recs = records(vec![gone]);
        let err = Planner::new(&bundles, &recs)
            .plan_up(None, &PlanOptions::default())
            .unwrap_err();
        match err {
            MigrateError::DriftError(id) => assert_eq!(id, "a"),
            other => panic!("Expected DriftError, got {other:?}"),
        }
    }

    #[test]
    fn test_plan_up_missing_bundle_for_reverted_record_is_tolerated() {
        let bundles = vec![bundle("b")];
        let gone = MigrationRecord {
            id: "a".to_string(),
            checksum: "feed".to_string(),
            status: MigrationStatus::Reverted,
            applied_at: None,
            applied_by: None,
            execution_ms: None,
            verify_ok: None,
            log_ref: None,
        };
        let recs = records(vec![gone]);
        let plan = Planner::new(&bundles, &recs)
            .plan_up(None, &PlanOptions::default())
            .expect("Plan should succeed");
        assert_eq!(ids(&plan), vec!["b"]);
    }

    #[test]
    fn test_dependency_satisfied_by_earlier_plan_entry() {
        let dependent = bundle_with_meta(
            "b",
            BundleMeta {
                requires: vec!["a".to_string()],
                ..BundleMeta::default()
            },
        );
        let bundles = vec![bundle("a"), dependent];
        let recs = records(vec![]);
        let plan = Planner::new(&bundles, &recs)
            .plan_up(None, &PlanOptions::default())
            .expect("Plan should succeed");
        assert_eq!(ids(&plan), vec!["a", "b"]);
    }

    #[test]
    fn test_dependency_satisfied_by_applied_record() {
        let dependent = bundle_with_meta(
            "b",
            BundleMeta {
                requires: vec!["a".to_string()],
                ..BundleMeta::default()
            },
        );
        let base = bundle("a");
        let recs = records(vec![record(&base, MigrationStatus::Applied)]);
        let bundles = vec![base, dependent];
        let plan = Planner::new(&bundles, &recs)
            .plan_up(None, &PlanOptions::default())
            .expect("Plan should succeed");
        assert_eq!(ids(&plan), vec!["b"]);
    }

    #[test]
    fn test_unmet_dependency_is_dependency_error() {
        let dependent = bundle_with_meta(
            "b",
            BundleMeta {
                requires: vec!["zzz".to_string()],
                ..BundleMeta::default()
            },
        );
        let bundles = vec![bundle("a"), dependent];
        let recs = records(vec![]);
        let err = Planner::new(&bundles, &recs)
            .plan_up(None, &PlanOptions::default())
            .unwrap_err();
        match err {
            MigrateError::DependencyError { id, required } => {
                assert_eq!(id, "b");
                assert_eq!(required, "zzz");
            }
            other => panic!("Expected DependencyError, got {other:?}"),
        }
    }

    #[test]
    fn test_dependency_satisfied_by_replanned_reverted_entry() {
        let dependent = bundle_with_meta(
            "c",
            BundleMeta {
                requires: vec!["a".to_string()],
                ..BundleMeta::default()
            },
        );
        let base = bundle("a");
        let recs = records(vec![record(&base, MigrationStatus::Reverted)]);
        let bundles = vec![base, bundle("b"), dependent];
        // a is reverted but re-enters the plan ahead of c, satisfying the
        // dependency within the same plan.
        let plan = Planner::new(&bundles, &recs)
            .plan_up(Some("c"), &PlanOptions::default())
            .expect("Plan should succeed");
        assert_eq!(ids(&plan), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_tag_blocked_when_disjoint_from_allow_tags() {
        let tagged = bundle_with_meta(
            "a",
            BundleMeta {
                tags: vec!["experimental".to_string()],
                ..BundleMeta::default()
            },
        );
        let bundles = vec![tagged];
        let recs = records(vec![]);
        let opts = PlanOptions {
            allow_tags: vec!["core".to_string()],
            ..PlanOptions::default()
        };
        let err = Planner::new(&bundles, &recs).plan_up(None, &opts).unwrap_err();
        assert!(matches!(err, MigrateError::TagBlocked(_)));
    }

    #[test]
    fn test_tag_allowed_when_overlapping() {
        let tagged = bundle_with_meta(
            "a",
            BundleMeta {
                tags: vec!["core".to_string(), "billing".to_string()],
                ..BundleMeta::default()
            },
        );
        let bundles = vec![tagged];
        let recs = records(vec![]);
        let opts = PlanOptions {
            allow_tags: vec!["core".to_string()],
            ..PlanOptions::default()
        };
        let plan = Planner::new(&bundles, &recs)
            .plan_up(None, &opts)
            .expect("Plan should succeed");
        assert_eq!(ids(&plan), vec!["a"]);
    }

    #[test]
    fn test_tag_filter_ignorable_at_call_time() {
        let tagged = bundle_with_meta(
            "a",
            BundleMeta {
                tags: vec!["experimental".to_string()],
                ..BundleMeta::default()
            },
        );
        let bundles = vec![tagged];
        let recs = records(vec![]);
        let opts = PlanOptions {
            allow_tags: vec!["core".to_string()],
            ignore_tags: true,
            ..PlanOptions::default()
        };
        let plan = Planner::new(&bundles, &recs)
            .plan_up(None, &opts)
            .expect("Plan should succeed");
        assert_eq!(ids(&plan), vec!["a"]);
    }

    #[test]
    fn test_no_allow_tags_means_no_filtering() {
        let untagged = bundle("a");
        let bundles = vec![untagged];
        let recs = records(vec![]);
        let plan = Planner::new(&bundles, &recs)
            .plan_up(None, &PlanOptions::default())
            .expect("Plan should succeed");
        assert_eq!(ids(&plan), vec!["a"]);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let bundles = vec![bundle("a"), bundle("b"), bundle("c")];
        let recs = records(vec![record(&bundles[1], MigrationStatus::Applied)]);
        let planner = Planner::new(&bundles, &recs);
        let first = ids(&planner.plan_up(None, &PlanOptions::default()).unwrap());
        let second = ids(&planner.plan_up(None, &PlanOptions::default()).unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn test_plan_down_descending_above_target() {
        let bundles = vec![bundle("a"), bundle("b"), bundle("c")];
        let recs = records(vec![
            record(&bundles[0], MigrationStatus::Applied),
            record(&bundles[1], MigrationStatus::Applied),
            record(&bundles[2], MigrationStatus::Applied),
        ]);
        let plan = Planner::new(&bundles, &recs)
            .plan_down("a", &PlanOptions::default())
            .expect("Plan should succeed");
        assert_eq!(ids(&plan), vec!["c", "b"]);
    }

    #[test]
    fn test_plan_down_skips_non_applied() {
        let bundles = vec![bundle("a"), bundle("b"), bundle("c")];
        let recs = records(vec![
            record(&bundles[0], MigrationStatus::Applied),
            record(&bundles[1], MigrationStatus::Reverted),
            record(&bundles[2], MigrationStatus::Applied),
        ]);
        let plan = Planner::new(&bundles, &recs)
            .plan_down("a", &PlanOptions::default())
            .expect("Plan should succeed");
        assert_eq!(ids(&plan), vec!["c"]);
    }

    #[test]
    fn test_plan_down_irreversible_blocks() {
        let pinned = bundle_with_meta(
            "b",
            BundleMeta {
                reversible: false,
                ..BundleMeta::default()
            },
        );
        let bundles = vec![bundle("a"), pinned];
        let recs = records(vec![
            record(&bundles[0], MigrationStatus::Applied),
            record(&bundles[1], MigrationStatus::Applied),
        ]);
        let err = Planner::new(&bundles, &recs)
            .plan_down("a", &PlanOptions::default())
            .unwrap_err();
        match err {
            MigrateError::IrreversibleError(id) => assert_eq!(id, "b"),
            other => panic!("Expected IrreversibleError, got {other:?}"),
        }
    }

    #[test]
    fn test_plan_down_missing_bundle_is_drift() {
        let bundles = vec![bundle("a")];
        let gone = MigrationRecord {
            id: "b".to_string(),
            checksum: "feed".to_string(),
            status: MigrationStatus::Applied,
            applied_at: None,
            applied_by: None,
            execution_ms: None,
            verify_ok: None,
            log_ref: None,
        };
        let recs = records(vec![record(&bundles[0], MigrationStatus::Applied), gone]);
        let err = Planner::new(&bundles, &recs)
            .plan_down("a", &PlanOptions::default())
            .unwrap_err();
        match err {
            MigrateError::DriftError(id) => assert_eq!(id, "b"),
            other => panic!("Expected DriftError, got {other:?}"),
        }
    }

    #[test]
    fn test_plan_down_records_at_or_below_target_untouched() {
        let bundles = vec![bundle("a"), bundle("b")];
        let recs = records(vec![
            record(&bundles[0], MigrationStatus::Applied),
            record(&bundles[1], MigrationStatus::Applied),
        ]);
        let plan = Planner::new(&bundles, &recs)
            .plan_down("b", &PlanOptions::default())
            .expect("Plan should succeed");
        assert!(plan.is_empty());
    }
}
