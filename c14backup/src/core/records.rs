//! Backup records kept in an archive's free-text description.
//!
//! Each committed backup appends its timestamp as one line. The description
//! is only ever extended here; records disappear with their archive.

use chrono::NaiveDateTime;

use crate::core::timestamp::parse_backup_timestamp;

/// Descriptions shorter than this (after trimming) carry no records.
///
/// New archives are created with a single-space description.
pub const NEAR_EMPTY_LEN: usize = 5;

pub fn is_near_empty(description: &str) -> bool {
    description.trim().len() < NEAR_EMPTY_LEN
}

/// Return the description with `timestamp` recorded.
pub fn append_record(description: &str, timestamp: &str) -> String {
    if is_near_empty(description) {
        timestamp.to_string()
    } else {
        format!("{}\n{timestamp}", description.trim_end_matches('\n'))
    }
}

/// Timestamps of the successful backups recorded in `description`, in order.
pub fn recorded_backups(description: &str) -> Vec<NaiveDateTime> {
    description
        .lines()
        .filter_map(|line| parse_backup_timestamp(line.trim()))
        .collect()
}

/// True when at least one backup into this archive was committed.
pub fn has_successful_record(description: &str) -> bool {
    !recorded_backups(description).is_empty()
}
