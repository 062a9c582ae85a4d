//! Test-only fakes: a scripted command runner and an in-memory provider.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::io::api::{ApiRequest, Method, Transport};
use crate::io::config::{BackupConfig, Profile, RetryConfig, default_rsync_options};
use crate::io::process::{CommandOutput, CommandRunner, CommandSpec};

/// Build a finished command output.
pub fn output(exit_code: i32, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(exit_code),
        stdout: stdout.as_bytes().to_vec(),
        stderr: stderr.as_bytes().to_vec(),
        ..CommandOutput::default()
    }
}

type Action = Box<dyn Fn(&CommandSpec) -> CommandOutput>;

enum Step {
    Output(CommandOutput),
    Action(Action),
}

/// Runner that replays queued outputs per program and records every call.
///
/// Programs with nothing queued succeed with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    queues: RefCell<BTreeMap<String, VecDeque<Step>>>,
    calls: RefCell<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, program: &str, out: CommandOutput) {
        self.queue(program, Step::Output(out));
    }

    /// Queue a closure that can inspect the call and touch the filesystem.
    pub fn push_fn<F>(&self, program: &str, f: F)
    where
        F: Fn(&CommandSpec) -> CommandOutput + 'static,
    {
        self.queue(program, Step::Action(Box::new(f)));
    }

    fn queue(&self, program: &str, step: Step) {
        self.queues
            .borrow_mut()
            .entry(program.to_string())
            .or_default()
            .push_back(step);
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.borrow().clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<CommandSpec> {
        self.calls
            .borrow()
            .iter()
            .filter(|spec| spec.program == program)
            .cloned()
            .collect()
    }

    /// Programs in call order.
    pub fn programs(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|s| s.program.clone()).collect()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.calls.borrow_mut().push(spec.clone());
        let step = self
            .queues
            .borrow_mut()
            .get_mut(&spec.program)
            .and_then(VecDeque::pop_front);
        Ok(match step {
            Some(Step::Output(out)) => out,
            Some(Step::Action(f)) => f(spec),
            None => output(0, "", ""),
        })
    }
}

/// Provider archive JSON as the details endpoint returns it.
pub fn archive_json(
    uuid: &str,
    status: &str,
    description: &str,
    created_at: Option<DateTime<Utc>>,
    archived_at: Option<DateTime<Utc>>,
) -> Value {
    let mut archive = json!({
        "uuid_ref": uuid,
        "name": format!("C14ABT {uuid}"),
        "description": description,
        "status": status,
        "bucket": {
            "credentials": [
                {"protocol": "ssh", "uri": "ssh://c14ssh@fake.buffer.c14.io:2222"}
            ]
        }
    });
    if let Some(at) = created_at {
        archive["creation_date"] = json!(at.to_rfc3339());
    }
    if let Some(at) = archived_at {
        archive["bucket"]["archival_date"] = json!(at.to_rfc3339());
    }
    archive
}

#[derive(Default)]
struct Provider {
    safes: Vec<(String, String)>,
    archives: BTreeMap<String, Vec<Value>>,
    ssh_keys: Vec<Value>,
    next_id: u32,
    activation_polls: u32,
    pending: BTreeMap<String, u32>,
    failing_deletes: BTreeSet<String>,
}

impl Provider {
    fn new_id(&mut self, kind: &str) -> String {
        self.next_id += 1;
        format!("{kind}-{}", self.next_id)
    }

    fn archives_mut(&mut self, safe_id: &str) -> Result<&mut Vec<Value>> {
        self.archives
            .get_mut(safe_id)
            .ok_or_else(|| anyhow!("404 safe {safe_id} not found"))
    }

    fn archive_mut(&mut self, safe_id: &str, archive_id: &str) -> Result<&mut Value> {
        self.archives_mut(safe_id)?
            .iter_mut()
            .find(|a| a["uuid_ref"] == archive_id)
            .ok_or_else(|| anyhow!("404 archive {archive_id} not found"))
    }
}

/// In-memory provider speaking the same paths as the real API.
#[derive(Default)]
pub struct FakeTransport {
    provider: RefCell<Provider>,
    requests: RefCell<Vec<ApiRequest>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_safe(&self, name: &str) -> String {
        let mut provider = self.provider.borrow_mut();
        let id = provider.new_id("safe");
        provider.safes.push((id.clone(), name.to_string()));
        provider.archives.insert(id.clone(), Vec::new());
        id
    }

    pub fn add_archive(&self, safe_id: &str, archive: Value) {
        self.provider
            .borrow_mut()
            .archives
            .entry(safe_id.to_string())
            .or_default()
            .push(archive);
    }

    pub fn add_ssh_key(&self, uuid: &str, fingerprint: &str) {
        self.provider
            .borrow_mut()
            .ssh_keys
            .push(json!({"uuid_ref": uuid, "fingerprint": fingerprint, "description": "test"}));
    }

    /// Number of detail reads a new archive stays `creating` for.
    pub fn set_activation_polls(&self, polls: u32) {
        self.provider.borrow_mut().activation_polls = polls;
    }

    pub fn fail_delete(&self, archive_id: &str) {
        self.provider
            .borrow_mut()
            .failing_deletes
            .insert(archive_id.to_string());
    }

    pub fn safe_names(&self) -> Vec<String> {
        self.provider
            .borrow()
            .safes
            .iter()
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn archive_ids(&self, safe_id: &str) -> Vec<String> {
        self.provider
            .borrow()
            .archives
            .get(safe_id)
            .map(|list| {
                list.iter()
                    .filter_map(|a| a["uuid_ref"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn archive(&self, safe_id: &str, archive_id: &str) -> Option<Value> {
        self.provider
            .borrow()
            .archives
            .get(safe_id)?
            .iter()
            .find(|a| a["uuid_ref"] == archive_id)
            .cloned()
    }

    pub fn ssh_key_count(&self) -> usize {
        self.provider.borrow().ssh_keys.len()
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.borrow().clone()
    }

    pub fn count(&self, method: Method) -> usize {
        self.requests
            .borrow()
            .iter()
            .filter(|r| r.method == method)
            .count()
    }
}

impl Transport for FakeTransport {
    fn send(&self, request: &ApiRequest) -> Result<Value> {
        self.requests.borrow_mut().push(request.clone());
        let mut provider = self.provider.borrow_mut();
        let segments: Vec<&str> = request.path.trim_start_matches('/').split('/').collect();

        match (request.method, segments.as_slice()) {
            (Method::Get, ["storage", "c14", "safe"]) => Ok(Value::Array(
                provider
                    .safes
                    .iter()
                    .map(|(id, name)| json!({"uuid_ref": id, "name": name}))
                    .collect(),
            )),
            (Method::Post, ["storage", "c14", "safe"]) => {
                let name = request.get_param("name").unwrap_or_default().to_string();
                let id = provider.new_id("safe");
                provider.safes.push((id.clone(), name));
                provider.archives.insert(id.clone(), Vec::new());
                Ok(json!(id))
            }
            (Method::Get, ["storage", "c14", "safe", safe, "archive"]) => Ok(Value::Array(
                provider
                    .archives_mut(safe)?
                    .iter()
                    .map(|a| {
                        json!({
                            "uuid_ref": a["uuid_ref"],
                            "name": a["name"],
                            "description": a["description"],
                        })
                    })
                    .collect(),
            )),
            (Method::Post, ["storage", "c14", "safe", safe, "archive"]) => {
                let id = provider.new_id("archive");
                let polls = provider.activation_polls;
                let now = Utc::now();
                let status = if polls == 0 { "active" } else { "creating" };
                let mut archive = archive_json(&id, status, " ", Some(now), Some(now));
                archive["name"] = json!(request.get_param("name").unwrap_or_default());
                provider.archives_mut(safe)?.push(archive);
                if polls > 0 {
                    provider.pending.insert(id.clone(), polls);
                }
                Ok(json!(id))
            }
            (Method::Get, ["storage", "c14", "safe", safe, "archive", archive]) => {
                let archive_id = archive.to_string();
                let remaining = provider.pending.get(&archive_id).copied();
                if let Some(remaining) = remaining {
                    if remaining <= 1 {
                        provider.pending.remove(&archive_id);
                        provider.archive_mut(safe, &archive_id)?["status"] = json!("active");
                    } else {
                        provider.pending.insert(archive_id.clone(), remaining - 1);
                    }
                    // The read that observes the flip still sees the old state.
                    let mut snapshot = provider.archive_mut(safe, &archive_id)?.clone();
                    snapshot["status"] = json!("creating");
                    return Ok(snapshot);
                }
                Ok(provider.archive_mut(safe, &archive_id)?.clone())
            }
            (Method::Patch, ["storage", "c14", "safe", safe, "archive", archive]) => {
                let description = request.get_param("description").unwrap_or_default();
                provider.archive_mut(safe, archive)?["description"] = json!(description);
                Ok(Value::Null)
            }
            (Method::Delete, ["storage", "c14", "safe", safe, "archive", archive]) => {
                if provider.failing_deletes.contains(*archive) {
                    return Err(anyhow!("500 archive {archive} is busy"));
                }
                let list = provider.archives_mut(safe)?;
                let before = list.len();
                list.retain(|a| a["uuid_ref"] != *archive);
                if list.len() == before {
                    return Err(anyhow!("404 archive {archive} not found"));
                }
                Ok(Value::Null)
            }
            (Method::Get, ["user", "key", "ssh"]) => Ok(Value::Array(provider.ssh_keys.clone())),
            (Method::Post, ["user", "key", "ssh"]) => {
                let id = provider.new_id("key");
                provider
                    .ssh_keys
                    .push(json!({"uuid_ref": id, "fingerprint": "registered", "description": request.get_param("description")}));
                Ok(json!(id))
            }
            _ => Err(anyhow!(
                "fake provider: unsupported {:?} {}",
                request.method,
                request.path
            )),
        }
    }
}

/// Unencrypted profile with every rotation bucket off.
pub fn plain_profile(safe_name: &str, key_dir: &Path) -> Profile {
    Profile {
        api_key: "token".to_string(),
        private_key: key_dir.join("id_rsa"),
        public_key: key_dir.join("id_rsa.pub"),
        safe_name: safe_name.to_string(),
        encrypt: false,
        password: None,
        incremental: false,
        include: vec!["/etc".to_string(), "/home".to_string()],
        exclude: vec!["/proc/*".to_string()],
        rsync_options: default_rsync_options(),
        encryption_source_root: "/".into(),
        rotation: BTreeMap::new(),
    }
}

/// `ssh-keygen -E md5 -lf` output for a fixed fingerprint.
pub fn keygen_output(fingerprint: &str) -> CommandOutput {
    output(
        0,
        &format!("2048 MD5:{fingerprint} me@host (RSA)\n"),
        "",
    )
}

/// Temporary tree holding a mount root and a key pair for one profile.
pub struct Sandbox {
    pub dir: TempDir,
}

impl Sandbox {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create sandbox")?;
        std::fs::create_dir_all(dir.path().join("keys"))?;
        std::fs::write(dir.path().join("keys/id_rsa"), "private")?;
        std::fs::write(
            dir.path().join("keys/id_rsa.pub"),
            "ssh-rsa AAAAB3Nza me@host\n",
        )?;
        Ok(Self { dir })
    }

    pub fn mount_root(&self) -> std::path::PathBuf {
        self.dir.path().join("mnt")
    }

    pub fn profile(&self, safe_name: &str) -> Profile {
        plain_profile(safe_name, &self.dir.path().join("keys"))
    }

    /// Config with a single `default` profile and no retry delays.
    pub fn config(&self, profile: Profile) -> BackupConfig {
        BackupConfig {
            log_level: "info".to_string(),
            mount_root: self.mount_root(),
            retry: RetryConfig::immediate(),
            profiles: BTreeMap::from([("default".to_string(), profile)]),
        }
    }
}
