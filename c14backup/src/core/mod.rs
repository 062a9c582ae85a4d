//! Deterministic, pure logic shared by the backup orchestration.
//!
//! Core modules must be free of I/O side effects. They operate on provider
//! records, timestamps and names, and return deterministic outputs suitable
//! for tests. Anything that needs the wall clock takes `now` as an argument.

pub mod endpoint;
pub mod records;
pub mod rotation;
pub mod selection;
pub mod timestamp;
pub mod types;
