//! Reversible encrypted view of the source tree (encfs `--reverse`).
//!
//! The password never appears in an argument vector: encfs reads it through
//! `--extpass` from an environment variable set only on the child process.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{debug, info, instrument, warn};

use crate::io::mount::MountGuard;
use crate::io::paths::{SafePaths, create_dir};
use crate::io::process::{CommandOutput, CommandRunner, CommandSpec};
use crate::io::transfer::PathSelection;

pub const ENCRYPTION_TOOL: &str = "encfs";
pub const ENCODE_TOOL: &str = "encfsctl";
pub const PASSWORD_ENV: &str = "C14BACKUP_ENCFS_PASSWORD";
const EXTPASS: &str = "--extpass=printenv C14BACKUP_ENCFS_PASSWORD";
const CONFIG_ENV: &str = "ENCFS6_CONFIG";
/// Key file encfs writes into the source root of a new reverse volume.
const GENERATED_KEY_FILE: &str = ".encfs6.xml";

/// Expert mode, AES, 256-bit key, 4096-byte blocks, block filename
/// encoding, accept the compatibility prompt.
const SETUP_ANSWERS: &str = "x\n1\n256\n4096\n1\ny\n";

const NOT_EMPTY: &str = "fuse: mountpoint is not empty";
/// encfs sometimes segfaults after a successful reverse mount.
const SEGFAULT_AFTER_MOUNT: i32 = 139;

/// Where this run's key file came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Local,
    Remote,
    Provisioned,
}

pub struct EncryptionLayer<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    paths: &'a SafePaths,
    source_root: PathBuf,
    password: String,
}

impl<'a, R: CommandRunner + ?Sized> EncryptionLayer<'a, R> {
    pub fn new(runner: &'a R, paths: &'a SafePaths, source_root: &Path, password: &str) -> Self {
        Self {
            runner,
            paths,
            source_root: source_root.to_path_buf(),
            password: password.to_string(),
        }
    }

    /// Mount the encrypted view and translate `selection` into it.
    ///
    /// The view is registered with `guard` before mounting. The result
    /// excludes the view itself so the transfer never recurses into it.
    #[instrument(skip_all, fields(view = %self.paths.encrypted_view.display()))]
    pub fn enable(
        &self,
        guard: &mut MountGuard<'_, R>,
        selection: &PathSelection,
    ) -> Result<PathSelection> {
        let source = self.ensure_key_file()?;
        debug!(?source, "key file ready");
        guard.track(&self.paths.encrypted_view);
        self.mount_view()?;
        self.push_key_file();

        let mut exclude = selection.exclude.clone();
        exclude.push(self.paths.encrypted_view.display().to_string());
        Ok(PathSelection {
            include: self.encode_all(&selection.include)?,
            exclude: self.encode_all(&exclude)?,
        })
    }

    /// Make sure the local key file exists, fetching or creating it.
    pub fn ensure_key_file(&self) -> Result<KeySource> {
        let local = &self.paths.key_file_local;
        if local.exists() {
            return Ok(KeySource::Local);
        }
        let remote = &self.paths.key_file_remote;
        if remote.exists() {
            info!("key file found in the archive; joining existing encrypted dataset");
            fs::copy(remote, local).with_context(|| {
                format!("copy key file {} to {}", remote.display(), local.display())
            })?;
            return Ok(KeySource::Remote);
        }
        info!("no key file locally or in the archive; creating a new one");
        self.provision()?;
        Ok(KeySource::Provisioned)
    }

    /// Create a fresh key file from a throwaway reverse volume.
    fn provision(&self) -> Result<()> {
        let scratch = self
            .paths
            .safe_dir
            .join(format!("provision_{}", rand::random::<u32>()));
        let scratch_source = scratch.join("source");
        let scratch_view = scratch.join("view");
        let mut guard = MountGuard::new(self.runner);
        guard.remove_on_release(&scratch);
        create_dir(&scratch_source)?;
        create_dir(&scratch_view)?;
        guard.track(&scratch_view);

        let spec = self
            .encfs_spec()
            .arg("--reverse")
            .arg(scratch_source.display().to_string())
            .arg(scratch_view.display().to_string())
            .arg(EXTPASS)
            .stdin(format!(
                "{SETUP_ANSWERS}{pw}\n{pw}\n",
                pw = self.password
            ));
        let output = self.runner.run(&spec)?;
        if !output.success() && !has_line(&output, NOT_EMPTY) {
            bail!(
                "cannot create a new encrypted volume\n{}",
                output.describe(&spec)
            );
        }

        let generated = scratch_source.join(GENERATED_KEY_FILE);
        fs::copy(&generated, &self.paths.key_file_local).with_context(|| {
            format!(
                "copy new key file {} to {}",
                generated.display(),
                self.paths.key_file_local.display()
            )
        })?;
        Ok(())
    }

    /// Mount the reverse view of the source root; an existing mount is fine.
    pub fn mount_view(&self) -> Result<()> {
        let spec = self
            .encfs_spec()
            .env(CONFIG_ENV, self.paths.key_file_local.display().to_string())
            .arg("--reverse")
            .arg(self.source_root.display().to_string())
            .arg(self.paths.encrypted_view.display().to_string())
            .arg(EXTPASS);
        let output = self.runner.run(&spec)?;
        if output.success() {
            info!("encrypted view mounted");
            return Ok(());
        }
        if output.exit_code == Some(SEGFAULT_AFTER_MOUNT) || has_line(&output, NOT_EMPTY) {
            debug!(exit_code = ?output.exit_code, "tolerated encrypted view result");
            return Ok(());
        }
        bail!(
            "cannot mount encrypted view of {}\n{}",
            self.source_root.display(),
            output.describe(&spec)
        )
    }

    /// Copy the key file into the archive; failures only warn.
    pub fn push_key_file(&self) {
        if let Err(err) = fs::copy(&self.paths.key_file_local, &self.paths.key_file_remote) {
            warn!(
                target_file = %self.paths.key_file_remote.display(),
                error = %err,
                "copying key file to the archive failed"
            );
        }
    }

    /// Encrypted counterpart of a plaintext path, inside the view.
    pub fn encode_path(&self, path: &str) -> Result<String> {
        let view = self.paths.encrypted_view.display().to_string();
        let spec = self
            .encfs_ctl_spec()
            .arg("encode")
            .arg(&view)
            .arg(path)
            .arg(EXTPASS);
        let output = self.runner.run(&spec)?;
        let encoded = output.stdout_text();
        match encoded.lines().next().map(str::trim) {
            Some(name) if output.success() && !name.is_empty() => Ok(format!("{view}/{name}")),
            _ => bail!("cannot encode path {path}\n{}", output.describe(&spec)),
        }
    }

    fn encode_all(&self, paths: &[String]) -> Result<Vec<String>> {
        paths.iter().map(|p| self.encode_path(p)).collect()
    }

    fn encfs_spec(&self) -> CommandSpec {
        CommandSpec::new(ENCRYPTION_TOOL).env(PASSWORD_ENV, self.password.as_str())
    }

    fn encfs_ctl_spec(&self) -> CommandSpec {
        CommandSpec::new(ENCODE_TOOL)
            .env(PASSWORD_ENV, self.password.as_str())
            .env(CONFIG_ENV, self.paths.key_file_local.display().to_string())
    }
}

fn has_line(output: &CommandOutput, wanted: &str) -> bool {
    output.lines().iter().any(|line| line == wanted)
}
