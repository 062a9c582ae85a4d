//! Retention pass over the archives of one safe.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::records::has_successful_record;
use crate::core::rotation::{RotationBucket, RotationCandidate, RotationPlan, plan_rotation};
use crate::io::api::{C14Api, Transport};
use crate::lifecycle::find_safe;

/// What a pass decided and what it managed to delete.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RotationReport {
    pub plan: Option<RotationPlan>,
    pub deleted: Vec<String>,
    /// Archives that could not be deleted, with the error.
    pub failed: Vec<(String, String)>,
}

impl RotationReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Rotate the safe named (or identified by) `safe`; a missing safe has
/// nothing to rotate.
pub fn rotate_safe<T: Transport>(
    api: &C14Api<T>,
    safe: &str,
    enabled: &BTreeSet<RotationBucket>,
    now: DateTime<Utc>,
) -> Result<RotationReport> {
    if enabled.is_empty() {
        return Ok(RotationReport::default());
    }
    match find_safe(api, safe)? {
        Some(safe_id) => rotate(api, &safe_id, enabled, now),
        None => {
            info!(safe, "safe does not exist; nothing to rotate");
            Ok(RotationReport::default())
        }
    }
}

/// Delete archives not retained by the enabled buckets.
///
/// Returns immediately when no bucket is enabled. Deletion failures are
/// collected in the report; the remaining deletions still run.
#[instrument(skip(api, enabled, now), fields(buckets = enabled.len()))]
pub fn rotate<T: Transport>(
    api: &C14Api<T>,
    safe_id: &str,
    enabled: &BTreeSet<RotationBucket>,
    now: DateTime<Utc>,
) -> Result<RotationReport> {
    if enabled.is_empty() {
        debug!("rotation disabled; keeping every archive");
        return Ok(RotationReport::default());
    }

    let summaries = api.list_archives(safe_id).context("list archives")?;
    let mut candidates = Vec::with_capacity(summaries.len());
    for summary in summaries {
        let has_record = summary
            .description
            .as_deref()
            .is_some_and(has_successful_record);
        let created_at = if has_record {
            match api.archive_details(safe_id, &summary.uuid) {
                Ok(archive) => archive.creation_date.map(|at| at.with_timezone(&Utc)),
                Err(err) => {
                    warn!(archive_id = %summary.uuid, error = %err, "no details; keeping archive");
                    None
                }
            }
        } else {
            None
        };
        candidates.push(RotationCandidate {
            uuid: summary.uuid,
            has_record,
            created_at,
        });
    }

    let plan = plan_rotation(&candidates, enabled, now);
    for (uuid, reason) in &plan.keep {
        debug!(archive_id = %uuid, ?reason, "keeping archive");
    }

    let mut report = RotationReport::default();
    for uuid in &plan.delete {
        info!(archive_id = %uuid, "deleting archive");
        match api.delete_archive(safe_id, uuid) {
            Ok(()) => report.deleted.push(uuid.clone()),
            Err(err) => {
                warn!(archive_id = %uuid, error = %format!("{err:#}"), "archive deletion failed");
                report.failed.push((uuid.clone(), format!("{err:#}")));
            }
        }
    }
    info!(
        kept = plan.keep.len(),
        deleted = report.deleted.len(),
        failed = report.failed.len(),
        "rotation finished"
    );
    report.plan = Some(plan);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rotation::KeepReason;
    use crate::io::api::Method;
    use crate::test_support::{FakeTransport, archive_json};
    use chrono::Duration;

    const RECORD: &str = "2024-01-01 00:00:00";

    fn all() -> BTreeSet<RotationBucket> {
        RotationBucket::ALL.into_iter().collect()
    }

    fn api_with_ages(ages: &[i64], now: DateTime<Utc>) -> (C14Api<FakeTransport>, String) {
        let api = C14Api::new(FakeTransport::new());
        let safe = api.transport().add_safe("data");
        for age in ages {
            let created = now - Duration::days(*age);
            api.transport().add_archive(
                &safe,
                archive_json(&format!("d{age}"), "active", RECORD, Some(created), Some(created)),
            );
        }
        (api, safe)
    }

    #[test]
    fn disabled_rotation_touches_nothing() {
        let now = Utc::now();
        let (api, safe) = api_with_ages(&[10, 500, 900], now);

        let report = rotate(&api, &safe, &BTreeSet::new(), now).expect("rotate");

        assert_eq!(report, RotationReport::default());
        assert!(api.transport().requests().is_empty());
    }

    #[test]
    fn missing_safe_has_nothing_to_rotate() {
        let api = C14Api::new(FakeTransport::new());
        let report = rotate_safe(&api, "books", &all(), Utc::now()).expect("rotate");
        assert_eq!(report, RotationReport::default());
        assert_eq!(api.transport().safe_names(), Vec::<String>::new());
    }

    #[test]
    fn rotate_safe_resolves_by_name() {
        let now = Utc::now();
        let (api, _) = api_with_ages(&[50, 60], now);
        let report = rotate_safe(&api, "data", &all(), now).expect("rotate");
        assert_eq!(report.deleted, vec!["d50"]);
    }

    #[test]
    fn keeps_one_oldest_representative_per_bucket() {
        let now = Utc::now();
        let (api, safe) = api_with_ages(&[10, 50, 60, 120, 150, 300, 330], now);

        let report = rotate(&api, &safe, &all(), now).expect("rotate");

        assert_eq!(report.deleted, vec!["d50", "d120", "d300"]);
        assert_eq!(api.transport().archive_ids(&safe), vec!["d10", "d60", "d150", "d330"]);
        let plan = report.plan.expect("plan");
        assert!(plan.keep.contains(&("d10".to_string(), KeepReason::KeepWindow)));
    }

    #[test]
    fn second_pass_deletes_nothing() {
        let now = Utc::now();
        let (api, safe) = api_with_ages(&[10, 50, 60, 120, 150], now);

        rotate(&api, &safe, &all(), now).expect("first");
        let second = rotate(&api, &safe, &all(), now).expect("second");

        assert!(second.deleted.is_empty());
        assert!(second.is_clean());
    }

    #[test]
    fn archives_without_records_are_kept_without_details() {
        let now = Utc::now();
        let api = C14Api::new(FakeTransport::new());
        let safe = api.transport().add_safe("data");
        let old = now - Duration::days(60);
        api.transport().add_archive(&safe, archive_json("empty", "active", " ", Some(old), Some(old)));
        api.transport().add_archive(&safe, archive_json("undated", "active", RECORD, None, None));
        api.transport().add_archive(&safe, archive_json("a", "active", RECORD, Some(old), Some(old)));

        let report = rotate(&api, &safe, &all(), now).expect("rotate");

        assert!(report.deleted.is_empty());
        let details: Vec<String> = api
            .transport()
            .requests()
            .into_iter()
            .filter(|r| r.method == Method::Get && r.path.ends_with("/empty"))
            .map(|r| r.path)
            .collect();
        assert!(details.is_empty());
    }

    #[test]
    fn deletion_failures_do_not_stop_the_pass() {
        let now = Utc::now();
        let (api, safe) = api_with_ages(&[50, 60, 70], now);
        api.transport().fail_delete("d50");

        let report = rotate(&api, &safe, &all(), now).expect("rotate");

        assert_eq!(report.deleted, vec!["d60"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "d50");
        assert!(report.failed[0].1.contains("busy"));
        assert!(!report.is_clean());
    }
}
