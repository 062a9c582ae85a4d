//! Mounting the archive's remote buffer and guaranteed release.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::endpoint::SshEndpoint;
use crate::io::config::RetryConfig;
use crate::io::paths::REMOTE_BUFFER;
use crate::io::process::{CommandOutput, CommandRunner, CommandSpec};
use crate::io::retry::{RetryPolicy, Verdict};

pub const MOUNT_TOOL: &str = "sshfs";
pub const UNMOUNT_TOOL: &str = "fusermount";

const NOT_EMPTY: &str = "fuse: mountpoint is not empty";
const FAILED_TO_ACCESS: &str = "fusermount3: failed to access mountpoint";

/// Mounts `/buffer` of an archive onto a local directory.
pub struct StorageMounter<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    policy: RetryPolicy,
    private_key: PathBuf,
}

impl<'a, R: CommandRunner + ?Sized> StorageMounter<'a, R> {
    pub fn new(runner: &'a R, retry: &RetryConfig, private_key: &Path) -> Self {
        Self {
            runner,
            policy: retry.mount_policy(),
            private_key: private_key.to_path_buf(),
        }
    }

    /// Mount, retrying until success or an already-mounted signature.
    ///
    /// Safe to call on a path that is already mounted.
    #[instrument(skip_all, fields(local = %local.display(), endpoint = %endpoint))]
    pub fn mount(&self, local: &Path, endpoint: &SshEndpoint) -> Result<()> {
        let spec = mount_command(endpoint, local, &self.private_key);
        self.policy
            .run_command(self.runner, "mount", &spec, classify_mount)
            .with_context(|| format!("mount {} on {}", endpoint, local.display()))?;
        info!("remote buffer mounted");
        thread::sleep(self.policy.delay);
        Ok(())
    }
}

pub fn mount_command(endpoint: &SshEndpoint, local: &Path, private_key: &Path) -> CommandSpec {
    CommandSpec::new(MOUNT_TOOL)
        .arg(format!("{}:{REMOTE_BUFFER}", endpoint.destination()))
        .arg(local.display().to_string())
        .arg("-p")
        .arg(endpoint.port.to_string())
        .args(["-o", "StrictHostKeyChecking=no", "-o"])
        .arg(format!("IdentityFile={}", private_key.display()))
}

/// A mount that already exists counts as mounted.
pub fn classify_mount(output: &CommandOutput) -> Verdict {
    if output.success() {
        return Verdict::Success;
    }
    match output
        .lines()
        .into_iter()
        .find(|line| line == NOT_EMPTY || line.starts_with(FAILED_TO_ACCESS))
    {
        Some(line) => Verdict::Tolerated(line),
        None => Verdict::Retry,
    }
}

enum Release {
    Unmount(PathBuf),
    RemoveDir(PathBuf),
}

/// Releases mounts and scratch directories when dropped.
///
/// Everything is undone newest first, so a folder registered after a mount
/// is removed while the mount is still up. Failures are logged and never
/// propagated.
pub struct MountGuard<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    stack: Vec<Release>,
}

impl<'a, R: CommandRunner + ?Sized> MountGuard<'a, R> {
    pub fn new(runner: &'a R) -> Self {
        Self {
            runner,
            stack: Vec::new(),
        }
    }

    /// Register a mount point before mounting it.
    pub fn track(&mut self, mount_point: &Path) {
        let known = self
            .stack
            .iter()
            .any(|r| matches!(r, Release::Unmount(p) if p == mount_point));
        if !known {
            self.stack.push(Release::Unmount(mount_point.to_path_buf()));
        }
    }

    /// Remove `dir` on release if it still exists.
    pub fn remove_on_release(&mut self, dir: &Path) {
        self.stack.push(Release::RemoveDir(dir.to_path_buf()));
    }

    pub fn mounted(&self) -> Vec<&Path> {
        self.stack
            .iter()
            .filter_map(|r| match r {
                Release::Unmount(p) => Some(p.as_path()),
                Release::RemoveDir(_) => None,
            })
            .collect()
    }

    pub fn release(&mut self) {
        while let Some(step) = self.stack.pop() {
            match step {
                Release::Unmount(mount_point) => unmount(self.runner, &mount_point),
                Release::RemoveDir(dir) => remove_leftover(&dir),
            }
        }
    }
}

impl<R: CommandRunner + ?Sized> Drop for MountGuard<'_, R> {
    fn drop(&mut self) {
        self.release();
    }
}

fn remove_leftover(dir: &Path) {
    if !dir.exists() {
        return;
    }
    debug!(dir = %dir.display(), "removing leftover folder");
    if let Err(err) = fs::remove_dir_all(dir) {
        warn!(dir = %dir.display(), error = %err, "failed to remove leftover folder");
    }
}

/// Unmount `mount_point`, logging failures.
pub fn unmount<R: CommandRunner + ?Sized>(runner: &R, mount_point: &Path) {
    let spec = CommandSpec::new(UNMOUNT_TOOL)
        .arg("-u")
        .arg(mount_point.display().to_string());
    match runner.run(&spec) {
        Ok(output) if output.success() => {
            debug!(mount_point = %mount_point.display(), "unmounted");
        }
        Ok(output) => warn!(
            mount_point = %mount_point.display(),
            exit_code = ?output.exit_code,
            output = %output.lines().join(" | "),
            "unmount failed"
        ),
        Err(err) => warn!(mount_point = %mount_point.display(), error = %err, "unmount failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RetryExhausted;
    use crate::test_support::{ScriptedRunner, output};

    fn endpoint() -> SshEndpoint {
        SshEndpoint {
            user: "c14ssh".to_string(),
            host: "buffer.c14.io".to_string(),
            port: 2222,
        }
    }

    #[test]
    fn mount_command_uses_structured_arguments() {
        let spec = mount_command(&endpoint(), Path::new("/mnt/data/c14"), Path::new("/k/id"));
        assert_eq!(spec.program, "sshfs");
        assert_eq!(
            spec.args,
            vec![
                "c14ssh@buffer.c14.io:/buffer",
                "/mnt/data/c14",
                "-p",
                "2222",
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "IdentityFile=/k/id",
            ]
        );
    }

    #[test]
    fn already_mounted_signatures_are_tolerated() {
        assert_eq!(
            classify_mount(&output(1, "", "fuse: mountpoint is not empty\n")),
            Verdict::Tolerated(NOT_EMPTY.to_string())
        );
        assert!(matches!(
            classify_mount(&output(
                1,
                "",
                "fusermount3: failed to access mountpoint /mnt/x: Transport endpoint is not connected"
            )),
            Verdict::Tolerated(_)
        ));
        assert_eq!(classify_mount(&output(1, "", "read: Connection reset by peer")), Verdict::Retry);
        assert_eq!(classify_mount(&output(0, "", "")), Verdict::Success);
    }

    #[test]
    fn mount_retries_then_succeeds() {
        let runner = ScriptedRunner::new();
        runner.push("sshfs", output(1, "", "read: Connection reset by peer"));
        runner.push("sshfs", output(0, "", ""));
        let mounter = StorageMounter::new(&runner, &RetryConfig::immediate(), Path::new("/k/id"));

        mounter.mount(Path::new("/mnt/c14"), &endpoint()).expect("mount");

        assert_eq!(runner.calls_to("sshfs").len(), 2);
    }

    #[test]
    fn mount_exhaustion_carries_last_output() {
        let runner = ScriptedRunner::new();
        for _ in 0..3 {
            runner.push("sshfs", output(1, "", "connection refused"));
        }
        let mounter = StorageMounter::new(&runner, &RetryConfig::immediate(), Path::new("/k/id"));

        let err = mounter
            .mount(Path::new("/mnt/c14"), &endpoint())
            .expect_err("must fail");

        let exhausted = err.downcast_ref::<RetryExhausted>().expect("retry exhausted");
        assert_eq!(exhausted.attempts, 3);
        assert!(exhausted.last_output.contains("connection refused"));
    }

    #[test]
    fn guard_unmounts_newest_first_on_drop() {
        let runner = ScriptedRunner::new();
        {
            let mut guard = MountGuard::new(&runner);
            guard.track(Path::new("/mnt/data/c14"));
            guard.track(Path::new("/mnt/data/encrypted"));
            guard.track(Path::new("/mnt/data/c14"));
        }
        let targets: Vec<String> = runner
            .calls_to("fusermount")
            .into_iter()
            .map(|spec| spec.args[1].clone())
            .collect();
        assert_eq!(targets, vec!["/mnt/data/encrypted", "/mnt/data/c14"]);
    }

    #[test]
    fn guard_swallows_unmount_failures() {
        let runner = ScriptedRunner::new();
        runner.push("fusermount", output(1, "", "fusermount: entry not found"));
        let mut guard = MountGuard::new(&runner);
        guard.track(Path::new("/mnt/a"));
        guard.track(Path::new("/mnt/b"));
        guard.release();
        assert!(guard.mounted().is_empty());
        drop(guard);
        assert_eq!(runner.calls_to("fusermount").len(), 2);
    }

    #[test]
    fn guard_removes_folders_before_earlier_mounts() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let leftover = tmp.path().join("backup_temp_1");
        fs::create_dir_all(&leftover).expect("mkdir");
        let runner = ScriptedRunner::new();
        let probe = leftover.clone();
        runner.push_fn("fusermount", move |_| {
            assert!(!probe.exists(), "folder must be gone before unmount");
            output(0, "", "")
        });
        {
            let mut guard = MountGuard::new(&runner);
            guard.track(tmp.path());
            guard.remove_on_release(&leftover);
        }
        assert_eq!(runner.calls_to("fusermount").len(), 1);
    }

    #[test]
    fn guard_removes_leftover_folders() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let leftover = tmp.path().join("backup_temp_1");
        fs::create_dir_all(leftover.join("etc")).expect("mkdir");
        let runner = ScriptedRunner::new();
        {
            let mut guard = MountGuard::new(&runner);
            guard.remove_on_release(&leftover);
            guard.remove_on_release(&tmp.path().join("missing"));
        }
        assert!(!leftover.exists());
    }
}
