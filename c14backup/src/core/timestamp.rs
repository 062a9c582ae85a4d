//! Dated backup names.
//!
//! A backup is a directory named with [`BACKUP_DIR_FORMAT`]; the same string is
//! appended to the archive description when the backup is committed.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Sortable `year-month-day hour:minute:second` format.
pub const BACKUP_DIR_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_backup_timestamp(at: NaiveDateTime) -> String {
    at.format(BACKUP_DIR_FORMAT).to_string()
}

/// Parse a directory name or description line as a backup timestamp.
pub fn parse_backup_timestamp(name: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(name, BACKUP_DIR_FORMAT).ok()
}

/// Pick the most recent dated name, ignoring anything that does not parse.
///
/// Only dates strictly after the Unix epoch count; the epoch itself is the
/// "no previous backup" sentinel. Returns the name as given so callers can
/// address the directory exactly.
pub fn latest_backup_name<'a, I>(names: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let epoch = DateTime::<Utc>::UNIX_EPOCH.naive_utc();
    names
        .into_iter()
        .filter_map(|name| parse_backup_timestamp(name).map(|at| (at, name)))
        .filter(|(at, _)| *at > epoch)
        .max_by(|(a, name_a), (b, name_b)| a.cmp(b).then_with(|| name_a.cmp(name_b)))
        .map(|(_, name)| name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_latest_valid_directory() {
        let names = ["2023-01-01 00:00:00", "2024-06-15 12:00:00", "not-a-date"];
        assert_eq!(latest_backup_name(names), Some("2024-06-15 12:00:00"));
    }

    #[test]
    fn epoch_sentinel_is_never_selected() {
        let names = ["1970-01-01 00:00:00", "backup_temp_123", ".", ".."];
        assert_eq!(latest_backup_name(names), None);
    }

    #[test]
    fn empty_listing_selects_nothing() {
        assert_eq!(latest_backup_name(Vec::<&str>::new()), None);
    }

    #[test]
    fn format_and_parse_agree() {
        let at = parse_backup_timestamp("2024-02-29 23:59:01").expect("parse");
        assert_eq!(format_backup_timestamp(at), "2024-02-29 23:59:01");
        assert!(parse_backup_timestamp("2024-02-30 00:00:00").is_none());
        assert!(parse_backup_timestamp("2024-02-01").is_none());
    }
}
