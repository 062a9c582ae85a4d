//! Safe and archive lifecycle at the provider.
//!
//! Picks an archive that is safe to write to, creating one and waiting for it
//! to become active when none qualifies, and records committed backups in the
//! archive description.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument};

use crate::core::records::append_record;
use crate::core::selection::{is_managed_archive, is_writable};
use crate::core::timestamp::format_backup_timestamp;
use crate::core::types::{Archive, ArchiveStatus};
use crate::error::RetryExhausted;
use crate::io::api::{ARCHIVE_DAYS, C14Api, Transport};
use crate::io::config::RetryConfig;
use crate::io::keys::public_key_fingerprint;
use crate::io::process::CommandRunner;

/// Name prefix of archives created and managed by this tool.
pub const ARCHIVE_PREFIX: &str = "C14ABT";
pub const SSH_KEY_DESCRIPTION: &str = "C14ABT ssh key";

/// Polling schedule for a freshly created archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationPolicy {
    pub poll: Duration,
    pub max_wait: Duration,
    /// Wait after the status flips; provider metadata lags behind it.
    pub settle: Duration,
}

impl ActivationPolicy {
    pub fn from_retry(retry: &RetryConfig) -> Self {
        Self {
            poll: Duration::from_secs(retry.activation_poll_secs),
            max_wait: Duration::from_secs(retry.activation_max_wait_secs),
            settle: Duration::from_secs(retry.activation_settle_secs),
        }
    }

    /// Number of status reads before giving up.
    pub fn max_polls(&self) -> u64 {
        (self.max_wait.as_secs() / self.poll.as_secs().max(1)).max(1)
    }
}

pub struct ArchiveLifecycleManager<'a, T: Transport, R: CommandRunner + ?Sized> {
    api: &'a C14Api<T>,
    runner: &'a R,
    activation: ActivationPolicy,
    public_key: PathBuf,
}

impl<'a, T: Transport, R: CommandRunner + ?Sized> ArchiveLifecycleManager<'a, T, R> {
    pub fn new(
        api: &'a C14Api<T>,
        runner: &'a R,
        activation: ActivationPolicy,
        public_key: &Path,
    ) -> Self {
        Self {
            api,
            runner,
            activation,
            public_key: public_key.to_path_buf(),
        }
    }

    /// Id of the safe called `name`, creating it if missing.
    #[instrument(skip(self))]
    pub fn get_or_create_safe(&self, name: &str) -> Result<String> {
        let safes = self.api.list_safes().context("list safes")?;
        if let Some(safe) = safes.into_iter().find(|s| s.name == name) {
            debug!(safe_id = %safe.uuid, "found safe");
            return Ok(safe.uuid);
        }
        let id = self
            .api
            .create_safe(name)
            .with_context(|| format!("create safe {name}"))?;
        info!(safe_id = %id, "created safe");
        Ok(id)
    }

    /// First managed archive that is active and archived over a day ago,
    /// or a newly created one once it is active.
    #[instrument(skip(self))]
    pub fn select_or_create_writable_archive(
        &self,
        safe_id: &str,
        name_prefix: &str,
    ) -> Result<Archive> {
        let summaries = self.api.list_archives(safe_id).context("list archives")?;
        let now = Utc::now();
        for summary in summaries
            .iter()
            .filter(|s| is_managed_archive(&s.name, name_prefix))
        {
            let archive = self
                .api
                .archive_details(safe_id, &summary.uuid)
                .with_context(|| format!("archive details {}", summary.uuid))?;
            if is_writable(&archive, now) {
                info!(archive_id = %archive.uuid, name = %archive.name, "reusing archive");
                return Ok(archive);
            }
            debug!(archive_id = %archive.uuid, status = ?archive.status, "archive not writable");
        }

        let key_id = self.register_or_lookup_ssh_key()?;
        let name = format!("{name_prefix} {}", backup_timestamp_now());
        let archive_id = self
            .api
            .create_archive(safe_id, &name, ARCHIVE_DAYS, &key_id)
            .with_context(|| format!("create archive {name}"))?;
        info!(archive_id = %archive_id, name = %name, "created archive");
        self.wait_until_active(safe_id, &archive_id)
    }

    /// Poll until `archive_id` is active, then let it settle.
    pub fn wait_until_active(&self, safe_id: &str, archive_id: &str) -> Result<Archive> {
        let max_polls = self.activation.max_polls();
        let mut last_status = ArchiveStatus::Creating;
        for poll in 1..=max_polls {
            thread::sleep(self.activation.poll);
            let archive = self
                .api
                .archive_details(safe_id, archive_id)
                .with_context(|| format!("archive details {archive_id}"))?;
            if archive.status == ArchiveStatus::Active {
                debug!(poll, "archive active");
                thread::sleep(self.activation.settle);
                return Ok(archive);
            }
            last_status = archive.status;
        }
        Err(RetryExhausted {
            label: format!("activation of archive {archive_id}"),
            attempts: u32::try_from(max_polls).unwrap_or(u32::MAX),
            last_output: format!(
                "still {last_status:?} after {}s",
                self.activation.max_wait.as_secs()
            ),
        }
        .into())
    }

    /// Append `timestamp` to the archive description; returns the new text.
    #[instrument(skip(self))]
    pub fn append_backup_record(
        &self,
        safe_id: &str,
        archive_id: &str,
        timestamp: &str,
    ) -> Result<String> {
        let current = self
            .api
            .archive_details(safe_id, archive_id)
            .with_context(|| format!("archive details {archive_id}"))?;
        let description = append_record(current.description(), timestamp);
        self.api
            .modify_archive(safe_id, archive_id, &description)
            .with_context(|| format!("record backup in archive {archive_id}"))?;
        Ok(description)
    }

    /// Provider id of the configured public key, registering it if needed.
    pub fn register_or_lookup_ssh_key(&self) -> Result<String> {
        let fingerprint = public_key_fingerprint(self.runner, &self.public_key)?;
        let keys = self.api.list_ssh_keys().context("list ssh keys")?;
        if let Some(key) = keys.into_iter().find(|k| k.fingerprint == fingerprint) {
            debug!(key_id = %key.uuid, "ssh key already registered");
            return Ok(key.uuid);
        }
        let content = std::fs::read_to_string(&self.public_key)
            .with_context(|| format!("read public key {}", self.public_key.display()))?;
        let id = self
            .api
            .register_ssh_key(SSH_KEY_DESCRIPTION, content.trim())
            .context("register ssh key")?;
        info!(key_id = %id, %fingerprint, "registered ssh key");
        Ok(id)
    }
}

/// Id of an existing safe matched by name or uuid.
pub fn find_safe<T: Transport>(api: &C14Api<T>, name_or_uuid: &str) -> Result<Option<String>> {
    let safes = api.list_safes().context("list safes")?;
    Ok(safes
        .into_iter()
        .find(|s| s.name == name_or_uuid || s.uuid == name_or_uuid)
        .map(|s| s.uuid))
}

/// Timestamp used for a backup committed now, in local time.
pub fn backup_timestamp_now() -> String {
    format_backup_timestamp(chrono::Local::now().naive_local())
}
