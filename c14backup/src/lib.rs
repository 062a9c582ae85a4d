//! Backups to C14 cold storage through a mounted archive buffer.
//!
//! The crate keeps the same split throughout:
//!
//! - **[`core`]**: pure logic (timestamps, description records, archive
//!   selection, rotation planning). No I/O.
//! - **[`io`]**: side effects (subprocesses, provider API, config, mounts,
//!   encryption, transfer). Each external tool sits behind a trait so tests
//!   can script it.
//!
//! Orchestration modules ([`lifecycle`], [`backup`], [`rotate`]) combine the
//! two to implement the CLI commands.

pub mod backup;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod lifecycle;
pub mod logging;
pub mod rotate;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
