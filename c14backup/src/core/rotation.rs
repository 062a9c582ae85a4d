//! Retention planning over a safe's archives.
//!
//! Archives are classified by age into buckets. Every archive younger than
//! the keep window survives; within each enabled wider bucket only the
//! oldest archive survives. Anything the plan cannot classify confidently
//! (no completed backup, no creation date, older than every enabled bucket)
//! is kept.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Days added to every bucket's nominal width.
pub const GRACE_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RotationBucket {
    /// Every archive in the first month and a bit.
    WithinGracePeriod,
    Quarterly,
    Semiannual,
    Annual,
}

impl RotationBucket {
    /// Ascending width; classification tests buckets in this order.
    pub const ALL: [RotationBucket; 4] = [
        RotationBucket::WithinGracePeriod,
        RotationBucket::Quarterly,
        RotationBucket::Semiannual,
        RotationBucket::Annual,
    ];

    fn nominal_days(self) -> i64 {
        match self {
            RotationBucket::WithinGracePeriod => 31,
            RotationBucket::Quarterly => 92,
            RotationBucket::Semiannual => 185,
            RotationBucket::Annual => 365,
        }
    }

    /// Exclusive upper bound on age in days, grace included.
    pub fn max_age_days(self) -> i64 {
        self.nominal_days() + GRACE_DAYS
    }

    /// Key used in the profile's `rotation` table.
    pub fn config_key(self) -> &'static str {
        match self {
            RotationBucket::WithinGracePeriod => "whole_month",
            RotationBucket::Quarterly => "one_per_3_months",
            RotationBucket::Semiannual => "one_per_6_months",
            RotationBucket::Annual => "one_per_year",
        }
    }

    pub fn from_config_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|bucket| bucket.config_key() == key)
    }
}

/// Where an archive falls for one rotation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Young enough to keep unconditionally.
    KeepWindow,
    /// Competes for the single slot of this bucket.
    Bucket(RotationBucket),
    /// Older than every enabled bucket; kept.
    BeyondBuckets,
}

/// Place an archive of `age_days` given the enabled buckets.
///
/// A disabled bucket passes its range on to the next enabled, wider bucket.
pub fn classify(age_days: i64, enabled: &BTreeSet<RotationBucket>) -> Placement {
    if age_days < RotationBucket::WithinGracePeriod.max_age_days() {
        return Placement::KeepWindow;
    }
    RotationBucket::ALL
        .into_iter()
        .filter(|bucket| *bucket != RotationBucket::WithinGracePeriod)
        .filter(|bucket| enabled.contains(bucket))
        .find(|bucket| age_days < bucket.max_age_days())
        .map_or(Placement::BeyondBuckets, Placement::Bucket)
}

/// Minimal view of an archive for planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationCandidate {
    pub uuid: String,
    /// At least one backup was committed into this archive.
    pub has_record: bool,
    pub created_at: Option<DateTime<Utc>>,
}

/// Why an archive survives a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepReason {
    RotationDisabled,
    NoCompletedBackup,
    UnknownCreationDate,
    KeepWindow,
    Representative(RotationBucket),
    BeyondBuckets,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationPlan {
    /// Survivors in input order, with the reason each one survives.
    pub keep: Vec<(String, KeepReason)>,
    /// Archives to delete, in input order.
    pub delete: Vec<String>,
}

impl RotationPlan {
    pub fn keeps(&self, uuid: &str) -> bool {
        self.keep.iter().any(|(kept, _)| kept == uuid)
    }
}

/// Build the rotation plan for `candidates` as of `now`.
///
/// With no bucket enabled everything is kept.
pub fn plan_rotation(
    candidates: &[RotationCandidate],
    enabled: &BTreeSet<RotationBucket>,
    now: DateTime<Utc>,
) -> RotationPlan {
    if enabled.is_empty() {
        return RotationPlan {
            keep: candidates
                .iter()
                .map(|c| (c.uuid.clone(), KeepReason::RotationDisabled))
                .collect(),
            delete: Vec::new(),
        };
    }

    let mut decided: BTreeMap<&str, KeepReason> = BTreeMap::new();
    let mut buckets: BTreeMap<RotationBucket, Vec<(DateTime<Utc>, &str)>> = BTreeMap::new();

    for candidate in candidates {
        if !candidate.has_record {
            decided.insert(&candidate.uuid, KeepReason::NoCompletedBackup);
            continue;
        }
        let Some(created_at) = candidate.created_at else {
            decided.insert(&candidate.uuid, KeepReason::UnknownCreationDate);
            continue;
        };
        let age_days = now.signed_duration_since(created_at).num_days();
        match classify(age_days, enabled) {
            Placement::KeepWindow => {
                decided.insert(&candidate.uuid, KeepReason::KeepWindow);
            }
            Placement::BeyondBuckets => {
                decided.insert(&candidate.uuid, KeepReason::BeyondBuckets);
            }
            Placement::Bucket(bucket) => {
                buckets
                    .entry(bucket)
                    .or_default()
                    .push((created_at, candidate.uuid.as_str()));
            }
        }
    }

    for (bucket, members) in &buckets {
        // Oldest member represents the bucket; uuid breaks ties.
        if let Some((_, uuid)) = members.iter().min() {
            decided.insert(uuid, KeepReason::Representative(*bucket));
        }
    }

    let mut plan = RotationPlan {
        keep: Vec::new(),
        delete: Vec::new(),
    };
    for candidate in candidates {
        match decided.get(candidate.uuid.as_str()) {
            Some(reason) => plan.keep.push((candidate.uuid.clone(), *reason)),
            None => plan.delete.push(candidate.uuid.clone()),
        }
    }
    plan
}
