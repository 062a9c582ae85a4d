//! Backup configuration stored in a TOML file.
//!
//! One file holds the shared settings plus any number of named profiles.
//! Each profile backs up one set of paths into one safe. The whole file is
//! validated before anything touches the provider.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::rotation::RotationBucket;
use crate::error::ConfigError;
use crate::io::retry::RetryPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "c14backup.toml";
pub const DEFAULT_PROFILE: &str = "default";

const LOG_LEVELS: [&str; 4] = ["error", "warn", "info", "debug"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackupConfig {
    /// Default tracing level when `RUST_LOG` is unset.
    pub log_level: String,

    /// Directory holding one mount-point tree per safe.
    pub mount_root: PathBuf,

    pub retry: RetryConfig,

    pub profiles: BTreeMap<String, Profile>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            mount_root: PathBuf::from("/var/lib/c14backup/mountpoints"),
            retry: RetryConfig::default(),
            profiles: BTreeMap::new(),
        }
    }
}

/// Attempt budgets and delays around unreliable external processes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempt budget shared by mounting and transferring.
    pub attempts: u32,
    pub mount_delay_secs: u64,
    pub transfer_delay_secs: u64,
    /// Interval between status polls of a newly created archive.
    pub activation_poll_secs: u64,
    /// Give up on a new archive that is not active after this long.
    pub activation_max_wait_secs: u64,
    /// Pause after activation before the archive is used.
    pub activation_settle_secs: u64,
    /// Pause between the description update and re-reading it.
    pub record_settle_secs: u64,
    /// Wait before the single courtesy re-run of a failed backup.
    pub outer_retry_delay_secs: u64,
    /// Wall-clock limit for any single external command.
    pub command_timeout_secs: u64,
    /// Captured stdout/stderr per stream.
    pub output_limit_bytes: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 20,
            mount_delay_secs: 1,
            transfer_delay_secs: 5,
            activation_poll_secs: 5,
            activation_max_wait_secs: 600,
            activation_settle_secs: 10,
            record_settle_secs: 1,
            outer_retry_delay_secs: 60,
            command_timeout_secs: 24 * 60 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl RetryConfig {
    /// Zero delays and a small budget, for tests.
    pub fn immediate() -> Self {
        Self {
            attempts: 3,
            mount_delay_secs: 0,
            transfer_delay_secs: 0,
            activation_poll_secs: 0,
            activation_max_wait_secs: 3,
            activation_settle_secs: 0,
            record_settle_secs: 0,
            outer_retry_delay_secs: 0,
            command_timeout_secs: 60,
            output_limit_bytes: 100_000,
        }
    }

    pub fn mount_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.attempts, Duration::from_secs(self.mount_delay_secs))
    }

    pub fn transfer_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.attempts, Duration::from_secs(self.transfer_delay_secs))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.attempts == 0 {
            return Err(ConfigError::new("retry.attempts must be > 0"));
        }
        if self.activation_max_wait_secs == 0 {
            return Err(ConfigError::new("retry.activation_max_wait_secs must be > 0"));
        }
        if self.command_timeout_secs == 0 {
            return Err(ConfigError::new("retry.command_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(ConfigError::new("retry.output_limit_bytes must be > 0"));
        }
        Ok(())
    }
}

/// One backup job: what to copy, where, and how long to keep it.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    /// Provider API bearer token.
    pub api_key: String,
    pub private_key: PathBuf,
    pub public_key: PathBuf,
    /// Safe holding this profile's archives. Must differ between profiles.
    pub safe_name: String,

    #[serde(default)]
    pub encrypt: bool,
    /// Required when `encrypt` is on.
    #[serde(default)]
    pub password: Option<String>,

    /// Hard-link the previous backup before transferring.
    #[serde(default)]
    pub incremental: bool,

    pub include: Vec<String>,
    /// rsync patterns; taken literally once encryption is on.
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default = "default_rsync_options")]
    pub rsync_options: Vec<String>,

    /// Root of the plaintext tree exposed through the encrypted view.
    #[serde(default = "default_encryption_source_root")]
    pub encryption_source_root: PathBuf,

    /// Rotation buckets keyed by name; an empty table keeps every archive.
    #[serde(default)]
    pub rotation: BTreeMap<String, bool>,
}

// Secrets stay out of logs.
impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profile")
            .field("safe_name", &self.safe_name)
            .field("private_key", &self.private_key)
            .field("public_key", &self.public_key)
            .field("encrypt", &self.encrypt)
            .field("incremental", &self.incremental)
            .field("include", &self.include)
            .field("exclude", &self.exclude)
            .field("rsync_options", &self.rsync_options)
            .field("rotation", &self.rotation)
            .finish_non_exhaustive()
    }
}

pub fn default_rsync_options() -> Vec<String> {
    [
        "-rtDH",
        "--checksum",
        "--no-i-r",
        "--links",
        "-A",
        "-X",
        "-pEgo",
        "--delete",
        "--partial",
        "--ignore-errors",
        "--chmod=Du+wx",
        "--delete-excluded",
        "-i",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_encryption_source_root() -> PathBuf {
    PathBuf::from("/")
}

impl Profile {
    /// Password for the encrypted view, when encryption is on.
    pub fn encryption_password(&self) -> Option<&str> {
        if !self.encrypt {
            return None;
        }
        self.password.as_deref().filter(|p| !p.is_empty())
    }

    /// Buckets switched on in the `rotation` table.
    pub fn enabled_buckets(&self) -> Result<BTreeSet<RotationBucket>, ConfigError> {
        let mut enabled = BTreeSet::new();
        for (key, on) in &self.rotation {
            let bucket = RotationBucket::from_config_key(key)
                .ok_or_else(|| ConfigError::new(format!("unknown rotation bucket: {key}")))?;
            if *on {
                enabled.insert(bucket);
            }
        }
        Ok(enabled)
    }

    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::new(format!("profile '{name}': {msg}")));
        if self.api_key.trim().is_empty() {
            return fail("api_key is empty");
        }
        if !is_single_component(&self.safe_name) {
            return fail("safe_name must be a non-empty single path component");
        }
        if self.include.is_empty() {
            return fail("include must list at least one path");
        }
        if self.encrypt && self.encryption_password().is_none() {
            return fail("\"password\" is not set but encryption is enabled");
        }
        self.enabled_buckets()
            .map_err(|err| ConfigError::new(format!("profile '{name}': {}", err.message)))?;
        Ok(())
    }
}

fn is_single_component(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

impl BackupConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::new(format!(
                "log_level must be one of {}",
                LOG_LEVELS.join(", ")
            )));
        }
        if self.mount_root.as_os_str().is_empty() {
            return Err(ConfigError::new("mount_root is empty"));
        }
        self.retry.validate()?;

        let mut safes = BTreeSet::new();
        for (name, profile) in &self.profiles {
            profile.validate(name)?;
            if !safes.insert(profile.safe_name.as_str()) {
                return Err(ConfigError::new(format!(
                    "safe '{}' is used by more than one profile",
                    profile.safe_name
                )));
            }
        }
        Ok(())
    }

    pub fn profile(&self, name: &str) -> Result<&Profile, ConfigError> {
        self.profiles
            .get(name)
            .ok_or_else(|| ConfigError::new(format!("unknown profile: {name}")))
    }
}

/// Load and validate config from a TOML file.
pub fn load_config(path: &Path) -> Result<BackupConfig> {
    let contents = fs::read_to_string(path)
        .map_err(|e| ConfigError::new(format!("read {}: {e}", path.display())))?;
    let cfg = parse_config(&contents)
        .map_err(|e| ConfigError::new(format!("{}: {}", path.display(), e.message)))?;
    Ok(cfg)
}

pub fn parse_config(contents: &str) -> Result<BackupConfig, ConfigError> {
    let cfg: BackupConfig =
        toml::from_str(contents).map_err(|e| ConfigError::new(format!("parse: {e}")))?;
    cfg.validate()?;
    Ok(cfg)
}
