use std::fs;
use std::time::Duration;

use c14backup::backup::{BackupOrchestrator, run_with_courtesy_retry};
use c14backup::error::{RetryExhausted, is_config_error};
use c14backup::io::api::C14Api;
use c14backup::lifecycle::find_safe;
use c14backup::test_support::{FakeTransport, Sandbox, ScriptedRunner, keygen_output, output};

fn entries(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .expect("read dir")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn incremental_backup_runs_every_step_in_order() {
    let sandbox = Sandbox::new().expect("sandbox");
    let mut profile = sandbox.profile("data");
    profile.incremental = true;
    let config = sandbox.config(profile.clone());
    let api = C14Api::new(FakeTransport::new());
    let runner = ScriptedRunner::new();
    runner.push("ssh-keygen", keygen_output("aa:bb"));
    let orchestrator =
        BackupOrchestrator::new(&api, &runner, &config.retry, &config.mount_root, &profile);
    let paths = orchestrator.paths().clone();
    fs::create_dir_all(paths.backup_root.join("2024-01-01 00:00:00")).expect("previous backup");

    let outcome = orchestrator.run().expect("backup");

    assert_eq!(
        runner.programs(),
        vec!["ssh-keygen", "sshfs", "cp", "rsync", "sshfs", "fusermount"]
    );
    assert_eq!(outcome.linked_from.as_deref(), Some("2024-01-01 00:00:00"));
    assert_eq!(outcome.committed_to, paths.backup_root.join(&outcome.timestamp));
    assert!(outcome.committed_to.is_dir());
    assert_eq!(outcome.recorded, vec![outcome.timestamp.clone()]);
    assert_eq!(api.transport().safe_names(), vec!["data"]);

    let archive = api
        .transport()
        .archive(&outcome.safe_id, &outcome.archive_id)
        .expect("archive");
    assert_eq!(archive["description"], outcome.timestamp.as_str());

    let rsync = &runner.calls_to("rsync")[0];
    let destination = rsync.args.last().expect("destination");
    assert!(destination.starts_with("c14ssh@fake.buffer.c14.io:/buffer/backup_temp_"));
    assert!(rsync.args.contains(&"--exclude=/proc/*".to_string()));
    assert_eq!(
        runner.calls_to("fusermount")[0].args[1],
        paths.remote_mount.display().to_string()
    );
    assert_eq!(
        entries(&paths.remote_mount),
        vec!["C14ABT".to_string()],
        "temp folder must be gone after commit"
    );
}

#[test]
fn failed_transfer_leaves_no_record_and_releases_everything() {
    let sandbox = Sandbox::new().expect("sandbox");
    let profile = sandbox.profile("data");
    let config = sandbox.config(profile.clone());
    let api = C14Api::new(FakeTransport::new());
    let runner = ScriptedRunner::new();
    runner.push("ssh-keygen", keygen_output("aa:bb"));
    for _ in 0..config.retry.attempts {
        runner.push("rsync", output(12, "", "rsync error: error in rsync protocol data stream"));
    }
    let orchestrator =
        BackupOrchestrator::new(&api, &runner, &config.retry, &config.mount_root, &profile);
    let paths = orchestrator.paths().clone();

    let err = orchestrator.run().expect_err("transfer must fail");

    let exhausted = err.downcast_ref::<RetryExhausted>().expect("exhausted");
    assert!(exhausted.last_output.contains("protocol data stream"));
    assert_eq!(runner.calls_to("rsync").len(), 3);
    assert_eq!(runner.calls_to("fusermount").len(), 1);
    assert!(entries(&paths.backup_root).is_empty());
    assert_eq!(entries(&paths.remote_mount), vec!["C14ABT".to_string()]);

    let safe_id = find_safe(&api, "data").expect("list").expect("safe");
    let archive_ids = api.transport().archive_ids(&safe_id);
    assert_eq!(archive_ids.len(), 1);
    let archive = api.transport().archive(&safe_id, &archive_ids[0]).expect("archive");
    assert_eq!(archive["description"], " ");
}

#[test]
fn encrypted_backup_sends_the_encrypted_view() {
    let sandbox = Sandbox::new().expect("sandbox");
    let mut profile = sandbox.profile("vault");
    profile.encrypt = true;
    profile.password = Some("s3cret-pass".to_string());
    profile.include = vec!["/etc".to_string()];
    profile.exclude = vec!["/proc".to_string()];
    let config = sandbox.config(profile.clone());
    let api = C14Api::new(FakeTransport::new());
    let runner = ScriptedRunner::new();
    runner.push("ssh-keygen", keygen_output("aa:bb"));
    for encoded in ["E_etc", "E_proc", "E_view"] {
        runner.push("encfsctl", output(0, &format!("{encoded}\n"), ""));
    }
    let orchestrator =
        BackupOrchestrator::new(&api, &runner, &config.retry, &config.mount_root, &profile);
    let paths = orchestrator.paths().clone();
    paths.create_mount_points(true).expect("mount points");
    fs::write(&paths.key_file_local, "<encfs/>").expect("key file");

    orchestrator.run().expect("backup");

    let view = paths.encrypted_view.display().to_string();
    let rsync = &runner.calls_to("rsync")[0];
    assert!(rsync.args.contains(&format!("--exclude={view}/E_proc")));
    assert!(rsync.args.contains(&format!("--exclude={view}/E_view")));
    assert!(rsync.args.contains(&format!("{view}/E_etc")));
    let unmounted: Vec<String> = runner
        .calls_to("fusermount")
        .into_iter()
        .map(|c| c.args[1].clone())
        .collect();
    assert_eq!(unmounted, vec![view, paths.remote_mount.display().to_string()]);
    for call in runner.calls() {
        assert!(call.args.iter().all(|a| !a.contains("s3cret-pass")));
    }
    assert!(paths.key_file_remote.exists());
}

#[test]
fn missing_password_fails_before_any_provider_call() {
    let sandbox = Sandbox::new().expect("sandbox");
    let mut profile = sandbox.profile("vault");
    profile.encrypt = true;
    profile.password = None;
    let config = sandbox.config(profile.clone());
    let api = C14Api::new(FakeTransport::new());
    let runner = ScriptedRunner::new();
    let orchestrator =
        BackupOrchestrator::new(&api, &runner, &config.retry, &config.mount_root, &profile);

    let err = orchestrator.run().expect_err("config error");

    assert!(is_config_error(&err));
    assert!(api.transport().requests().is_empty());
    assert!(runner.calls().is_empty());
}

#[test]
fn courtesy_retry_recovers_from_one_failed_run() {
    let sandbox = Sandbox::new().expect("sandbox");
    let profile = sandbox.profile("data");
    let config = sandbox.config(profile.clone());
    let api = C14Api::new(FakeTransport::new());
    let runner = ScriptedRunner::new();
    runner.push("ssh-keygen", keygen_output("aa:bb"));
    runner.push("ssh-keygen", keygen_output("aa:bb"));
    for _ in 0..config.retry.attempts {
        runner.push("sshfs", output(1, "", "ssh: connect to host: Connection refused"));
    }
    let orchestrator =
        BackupOrchestrator::new(&api, &runner, &config.retry, &config.mount_root, &profile);

    let outcome =
        run_with_courtesy_retry(Duration::ZERO, || orchestrator.run()).expect("second run");

    assert_eq!(runner.calls_to("rsync").len(), 1);
    assert_eq!(outcome.recorded.len(), 1);
    assert_eq!(runner.calls_to("fusermount").len(), 2);
}
