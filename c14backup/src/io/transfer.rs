//! Incremental transfer into the archive and the final commit rename.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::endpoint::SshEndpoint;
use crate::core::timestamp::latest_backup_name;
use crate::error::CommitError;
use crate::io::config::RetryConfig;
use crate::io::paths::remote_temp_path;
use crate::io::process::{CommandOutput, CommandRunner, CommandSpec};
use crate::io::retry::{RetryPolicy, Verdict};

pub const TRANSFER_TOOL: &str = "rsync";
pub const LINK_TOOL: &str = "cp";

/// rsync "partial transfer": some source files changed or vanished mid-run.
const PARTIAL_TRANSFER_EXIT: i32 = 23;

/// What to send: source paths and exclude filters, in order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PathSelection {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

pub struct TransferEngine<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    policy: RetryPolicy,
    private_key: PathBuf,
    options: Vec<String>,
}

impl<'a, R: CommandRunner + ?Sized> TransferEngine<'a, R> {
    pub fn new(runner: &'a R, retry: &RetryConfig, private_key: &Path, options: &[String]) -> Self {
        Self {
            runner,
            policy: retry.transfer_policy(),
            private_key: private_key.to_path_buf(),
            options: options.to_vec(),
        }
    }

    /// Hard-link the newest dated backup into `temp_dir`.
    ///
    /// Returns the name of the backup linked from, or `None` when there is
    /// nothing to link or linking failed (the transfer then sends everything).
    #[instrument(skip_all, fields(backup_root = %backup_root.display()))]
    pub fn link_from_previous_backup(
        &self,
        backup_root: &Path,
        temp_dir: &Path,
    ) -> Result<Option<String>> {
        let names = match list_dir_names(backup_root) {
            Ok(names) => names,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("list {}", backup_root.display()));
            }
        };
        let Some(latest) = latest_backup_name(names.iter().map(String::as_str)) else {
            debug!("no previous backup to link from");
            return Ok(None);
        };

        let spec = CommandSpec::new(LINK_TOOL)
            .arg("-al")
            .arg(format!("{}/.", backup_root.join(latest).display()))
            .arg(format!("{}/", temp_dir.display()));
        let output = self.runner.run(&spec)?;
        if !output.success() {
            warn!(
                from = latest,
                exit_code = ?output.exit_code,
                output = %output.lines().join(" | "),
                "hard-linking previous backup failed; sending everything"
            );
            return Ok(None);
        }
        info!(from = latest, "linked previous backup");
        Ok(Some(latest.to_string()))
    }

    /// Send `selection` into `/buffer/<temp_name>` on the archive.
    #[instrument(skip_all, fields(endpoint = %endpoint, temp_name = %temp_name))]
    pub fn transfer(
        &self,
        endpoint: &SshEndpoint,
        temp_name: &str,
        selection: &PathSelection,
    ) -> Result<()> {
        let spec = transfer_command(
            endpoint,
            &self.private_key,
            &self.options,
            selection,
            &remote_temp_path(temp_name),
        );
        info!(
            includes = selection.include.len(),
            excludes = selection.exclude.len(),
            "starting transfer"
        );
        let output = self
            .policy
            .run_command(self.runner, "transfer", &spec, classify_transfer)
            .context("transfer backup")?;
        if output.exit_code == Some(PARTIAL_TRANSFER_EXIT) {
            warn!("transfer finished with files changed during the run");
        }
        Ok(())
    }
}

/// Build the rsync invocation. Excludes come first so they win over includes.
pub fn transfer_command(
    endpoint: &SshEndpoint,
    private_key: &Path,
    options: &[String],
    selection: &PathSelection,
    remote_path: &str,
) -> CommandSpec {
    CommandSpec::new(TRANSFER_TOOL)
        .arg("-e")
        .arg(format!(
            "ssh -p {} -i {}",
            endpoint.port,
            remote_shell_word(&private_key.display().to_string())
        ))
        .args(options.iter().cloned())
        .args(selection.exclude.iter().map(|e| format!("--exclude={e}")))
        .args(selection.include.iter().cloned())
        .arg(format!("{}:{remote_path}", endpoint.destination()))
}

/// Quote `word` for rsync's `-e` value, which is split on unquoted whitespace.
fn remote_shell_word(word: &str) -> String {
    if !word.contains(|c: char| c.is_whitespace() || c == '\'' || c == '"') {
        word.to_string()
    } else if !word.contains('\'') {
        format!("'{word}'")
    } else {
        format!("\"{word}\"")
    }
}

pub fn classify_transfer(output: &CommandOutput) -> Verdict {
    if output.timed_out {
        return Verdict::Retry;
    }
    match output.exit_code {
        Some(0) => Verdict::Success,
        Some(PARTIAL_TRANSFER_EXIT) => Verdict::Tolerated("partial transfer".to_string()),
        _ => Verdict::Retry,
    }
}

/// Rename the finished temp directory to `backup_root/<timestamp>`.
///
/// Never retried: any failure is a [`CommitError`].
#[instrument(skip_all, fields(timestamp = %timestamp))]
pub fn commit(temp_dir: &Path, backup_root: &Path, timestamp: &str) -> Result<PathBuf> {
    let target = backup_root.join(timestamp);
    let fail = |reason: String| CommitError {
        from: temp_dir.display().to_string(),
        to: target.display().to_string(),
        reason,
    };
    if target.exists() {
        return Err(fail("target already exists".to_string()).into());
    }
    fs::rename(temp_dir, &target).map_err(|e| fail(e.to_string()))?;
    info!(target = %target.display(), "backup committed");
    Ok(target)
}

fn list_dir_names(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}
