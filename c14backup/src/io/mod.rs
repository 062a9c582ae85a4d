//! Side-effecting adapters: processes, provider API, config and filesystem.

pub mod api;
pub mod config;
pub mod encryption;
pub mod keys;
pub mod mount;
pub mod paths;
pub mod process;
pub mod retry;
pub mod transfer;
