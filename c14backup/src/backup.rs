//! One orchestrated backup run and the outer courtesy retry.
//!
//! Order: select archive, mount, prepare folders, encryption, hard links,
//! transfer, mount again, commit, record. Mounts and the temp folder are
//! released on every exit path by a [`MountGuard`].

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::endpoint::SshEndpoint;
use crate::core::records::recorded_backups;
use crate::core::timestamp::format_backup_timestamp;
use crate::error::{ConfigError, is_commit_error, is_config_error};
use crate::io::api::{C14Api, Transport};
use crate::io::config::{Profile, RetryConfig};
use crate::io::encryption::EncryptionLayer;
use crate::io::mount::{MountGuard, StorageMounter};
use crate::io::paths::{SafePaths, create_dir, random_temp_name};
use crate::io::process::CommandRunner;
use crate::io::transfer::{PathSelection, TransferEngine, commit};
use crate::lifecycle::{
    ARCHIVE_PREFIX, ActivationPolicy, ArchiveLifecycleManager, backup_timestamp_now,
};

/// Result of a committed backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupOutcome {
    pub safe_id: String,
    pub archive_id: String,
    pub timestamp: String,
    pub committed_to: PathBuf,
    /// Previous backup the run hard-linked from.
    pub linked_from: Option<String>,
    /// Backups recorded in the archive after this run, oldest first.
    pub recorded: Vec<String>,
}

pub struct BackupOrchestrator<'a, T: Transport, R: CommandRunner + ?Sized> {
    api: &'a C14Api<T>,
    runner: &'a R,
    retry: &'a RetryConfig,
    profile: &'a Profile,
    paths: SafePaths,
}

impl<'a, T: Transport, R: CommandRunner + ?Sized> BackupOrchestrator<'a, T, R> {
    pub fn new(
        api: &'a C14Api<T>,
        runner: &'a R,
        retry: &'a RetryConfig,
        mount_root: &Path,
        profile: &'a Profile,
    ) -> Self {
        Self {
            api,
            runner,
            retry,
            profile,
            paths: SafePaths::new(mount_root, &profile.safe_name),
        }
    }

    pub fn paths(&self) -> &SafePaths {
        &self.paths
    }

    #[instrument(skip_all, fields(safe = %self.profile.safe_name))]
    pub fn run(&self) -> Result<BackupOutcome> {
        let profile = self.profile;
        info!("backup started");
        let password = match (profile.encrypt, profile.encryption_password()) {
            (true, None) => {
                return Err(ConfigError::new(
                    "\"password\" is not set but encryption is enabled",
                )
                .into());
            }
            (true, Some(password)) => Some(password),
            (false, _) => None,
        };
        self.paths.create_mount_points(profile.encrypt)?;

        let lifecycle = ArchiveLifecycleManager::new(
            self.api,
            self.runner,
            ActivationPolicy::from_retry(self.retry),
            &profile.public_key,
        );
        let safe_id = lifecycle.get_or_create_safe(&profile.safe_name)?;
        let archive = lifecycle.select_or_create_writable_archive(&safe_id, ARCHIVE_PREFIX)?;
        let uri = archive.ssh_uri().ok_or_else(|| {
            ConfigError::new(format!("archive {} has no ssh credentials", archive.uuid))
        })?;
        let endpoint = SshEndpoint::parse(uri)?;

        let mounter = StorageMounter::new(self.runner, self.retry, &profile.private_key);
        let mut guard = MountGuard::new(self.runner);
        guard.track(&self.paths.remote_mount);
        mounter.mount(&self.paths.remote_mount, &endpoint)?;

        let temp_name = random_temp_name();
        let temp_dir = self.paths.temp_dir(&temp_name);
        create_dir(&self.paths.backup_root)?;
        create_dir(&temp_dir)?;
        guard.remove_on_release(&temp_dir);

        let mut selection = PathSelection {
            include: profile.include.clone(),
            exclude: profile.exclude.clone(),
        };
        if let Some(password) = password {
            let layer = EncryptionLayer::new(
                self.runner,
                &self.paths,
                &profile.encryption_source_root,
                password,
            );
            selection = layer
                .enable(&mut guard, &selection)
                .context("enable encryption")?;
        }

        let engine = TransferEngine::new(
            self.runner,
            self.retry,
            &profile.private_key,
            &profile.rsync_options,
        );
        let linked_from = if profile.incremental {
            engine.link_from_previous_backup(&self.paths.backup_root, &temp_dir)?
        } else {
            None
        };
        engine.transfer(&endpoint, &temp_name, &selection)?;
        // The sshfs mount can drop during a long transfer.
        mounter.mount(&self.paths.remote_mount, &endpoint)?;

        let timestamp = backup_timestamp_now();
        let committed_to = commit(&temp_dir, &self.paths.backup_root, &timestamp)?;
        lifecycle.append_backup_record(&safe_id, &archive.uuid, &timestamp)?;

        thread::sleep(Duration::from_secs(self.retry.record_settle_secs));
        let recorded = self.recorded_backups(&safe_id, &archive.uuid);
        info!(
            archive_id = %archive.uuid,
            %timestamp,
            backups_in_archive = recorded.len(),
            "backup success"
        );
        drop(guard);

        Ok(BackupOutcome {
            safe_id,
            archive_id: archive.uuid,
            timestamp,
            committed_to,
            linked_from,
            recorded,
        })
    }

    /// Re-read the archive for the post-run summary; failures only warn.
    fn recorded_backups(&self, safe_id: &str, archive_id: &str) -> Vec<String> {
        match self.api.archive_details(safe_id, archive_id) {
            Ok(archive) => recorded_backups(archive.description())
                .into_iter()
                .map(format_backup_timestamp)
                .collect(),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "cannot re-read archive after backup");
                Vec::new()
            }
        }
    }
}

/// Run `attempt`; after a fatal failure wait `delay` and run it once more.
///
/// Configuration and commit errors are returned without a second run.
pub fn run_with_courtesy_retry<O, F>(delay: Duration, mut attempt: F) -> Result<O>
where
    F: FnMut() -> Result<O>,
{
    match attempt() {
        Ok(outcome) => Ok(outcome),
        Err(err) if is_config_error(&err) || is_commit_error(&err) => Err(err),
        Err(err) => {
            warn!(
                error = %format!("{err:#}"),
                delay_secs = delay.as_secs(),
                "backup failed; running once more"
            );
            thread::sleep(delay);
            attempt().context("backup failed twice")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CommitError;
    use anyhow::anyhow;

    #[test]
    fn courtesy_retry_runs_one_more_time() {
        let mut calls = 0;
        let result = run_with_courtesy_retry(Duration::ZERO, || {
            calls += 1;
            if calls == 1 { Err(anyhow!("flaky provider")) } else { Ok(calls) }
        });
        assert_eq!(result.expect("second run"), 2);
    }

    #[test]
    fn courtesy_retry_gives_up_after_second_failure() {
        let mut calls = 0;
        let result: Result<()> = run_with_courtesy_retry(Duration::ZERO, || {
            calls += 1;
            Err(anyhow!("down {calls}"))
        });
        let err = result.expect_err("fails");
        assert_eq!(calls, 2);
        assert!(format!("{err:#}").contains("down 2"));
    }

    #[test]
    fn courtesy_retry_skips_config_and_commit_errors() {
        let mut calls = 0;
        let _ = run_with_courtesy_retry::<(), _>(Duration::ZERO, || {
            calls += 1;
            Err(ConfigError::new("bad").into())
        });
        assert_eq!(calls, 1);

        let mut calls = 0;
        let _ = run_with_courtesy_retry::<(), _>(Duration::ZERO, || {
            calls += 1;
            Err(anyhow::Error::new(CommitError {
                from: "a".to_string(),
                to: "b".to_string(),
                reason: "exists".to_string(),
            })
            .context("commit"))
        });
        assert_eq!(calls, 1);
    }
}
