//! Which existing archive may receive the next backup.

use chrono::{DateTime, Duration, Utc};

use crate::core::types::{Archive, ArchiveStatus};

/// Archives that entered their archival period less than this long ago are
/// not written to; the provider is still settling the bucket.
pub fn min_archival_age() -> Duration {
    Duration::days(1)
}

/// Name filter for archives managed by this tool.
pub fn is_managed_archive(name: &str, prefix: &str) -> bool {
    name.starts_with(prefix)
}

/// An archive is writable when it is active and its archival date is at
/// least one full day in the past.
pub fn is_writable(archive: &Archive, now: DateTime<Utc>) -> bool {
    if archive.status != ArchiveStatus::Active {
        return false;
    }
    match archive.archival_date() {
        Some(archived_at) => now.signed_duration_since(archived_at) >= min_archival_age(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Bucket;

    fn archive(status: ArchiveStatus, archived_hours_ago: Option<i64>, now: DateTime<Utc>) -> Archive {
        Archive {
            uuid: "a".to_string(),
            name: "C14ABT a".to_string(),
            description: None,
            status,
            creation_date: None,
            bucket: Some(Bucket {
                archival_date: archived_hours_ago
                    .map(|hours| (now - Duration::hours(hours)).fixed_offset()),
                credentials: Vec::new(),
            }),
        }
    }

    #[test]
    fn active_and_old_enough_is_writable() {
        let now = Utc::now();
        assert!(is_writable(&archive(ArchiveStatus::Active, Some(25), now), now));
        assert!(is_writable(&archive(ArchiveStatus::Active, Some(24), now), now));
    }

    #[test]
    fn fresh_archival_date_is_not_writable() {
        let now = Utc::now();
        assert!(!is_writable(&archive(ArchiveStatus::Active, Some(23), now), now));
        assert!(!is_writable(&archive(ArchiveStatus::Active, Some(0), now), now));
        assert!(!is_writable(&archive(ArchiveStatus::Active, Some(-48), now), now));
    }

    #[test]
    fn inactive_or_undated_is_not_writable() {
        let now = Utc::now();
        assert!(!is_writable(&archive(ArchiveStatus::Busy, Some(100), now), now));
        assert!(!is_writable(&archive(ArchiveStatus::Creating, Some(100), now), now));
        assert!(!is_writable(&archive(ArchiveStatus::Active, None, now), now));
    }

    #[test]
    fn prefix_filter_matches_start_of_name() {
        assert!(is_managed_archive("C14ABT 2024-01-01 00:00:00", "C14ABT"));
        assert!(!is_managed_archive("manual C14ABT", "C14ABT"));
    }
}
