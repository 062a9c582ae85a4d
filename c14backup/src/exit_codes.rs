//! Stable exit codes for `c14backup` commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Backup, rotation or a provider call failed.
pub const FAILED: i32 = 1;
/// Configuration file missing or invalid, or a provider response was malformed.
pub const CONFIG: i32 = 2;
