//! Provider REST API: transport seam and typed client.
//!
//! [`Transport`] is the opaque request/response collaborator; [`HttpTransport`]
//! is the real one. [`C14Api`] turns provider JSON into typed records. No
//! retries happen at this layer: transient HTTP failures propagate.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::types::{Archive, ArchiveSummary, Safe, SshKey};
use crate::error::ConfigError;

pub const DEFAULT_BASE_URL: &str = "https://api.online.net/api/v1";
/// List endpoints return at most this many items; paging is not supported.
pub const LIST_LIMIT: usize = 100;
/// Retention period of newly created archives.
pub const ARCHIVE_DAYS: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Patch,
    Delete,
}

/// One provider call. Parameters are ordered form pairs; list values use
/// `key[i]` keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub params: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.push((key.to_string(), value.to_string()));
        self
    }

    pub fn list_param<I, S>(mut self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        for (i, value) in values.into_iter().enumerate() {
            self.params.push((format!("{key}[{i}]"), value.to_string()));
        }
        self
    }

    /// First value of `key`, for fakes and assertions.
    pub fn get_param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Abstraction over the provider's HTTP endpoint.
pub trait Transport {
    /// Send `request`; return the decoded JSON body (`Null` when empty).
    fn send(&self, request: &ApiRequest) -> Result<Value>;
}

/// Bearer-authenticated HTTPS transport.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    base_url: String,
    token: String,
}

impl HttpTransport {
    pub fn new(token: &str) -> Result<Self> {
        Self::with_base_url(token, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(token: &str, base_url: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: &ApiRequest) -> Result<Value> {
        let url = format!("{}{}", self.base_url, request.path);
        let builder = match request.method {
            Method::Get => self.client.get(&url).query(&request.params),
            Method::Post => self.client.post(&url).form(&request.params),
            Method::Patch => self.client.patch(&url).form(&request.params),
            Method::Delete => self.client.delete(&url),
        };
        let response = builder
            .bearer_auth(&self.token)
            .header("X-Pretty-JSON", "1")
            .send()
            .with_context(|| format!("{:?} {}", request.method, request.path))?;

        let status = response.status();
        let body = response
            .text()
            .with_context(|| format!("read response of {}", request.path))?;
        if !status.is_success() {
            return Err(anyhow!(
                "{:?} {} failed with status {}: {}",
                request.method,
                request.path,
                status,
                body.trim()
            ));
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| {
            ConfigError::new(format!("{} returned malformed JSON: {e}", request.path)).into()
        })
    }
}

/// Typed client for the storage and account endpoints.
pub struct C14Api<T: Transport> {
    transport: T,
}

impl<T: Transport> C14Api<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn list_safes(&self) -> Result<Vec<Safe>> {
        let value = self.storage(ApiRequest::new(Method::Get, "safe").param("count", LIST_LIMIT))?;
        decode(value, "safe list")
    }

    pub fn create_safe(&self, name: &str) -> Result<String> {
        let value = self.storage(
            ApiRequest::new(Method::Post, "safe")
                .param("name", name)
                .param("description", "For automated backups"),
        )?;
        created_id(value, "safe")
    }

    pub fn list_archives(&self, safe_id: &str) -> Result<Vec<ArchiveSummary>> {
        let value = self.storage(
            ApiRequest::new(Method::Get, format!("safe/{safe_id}/archive"))
                .param("count", LIST_LIMIT),
        )?;
        decode(value, "archive list")
    }

    /// Create an SSH-accessible archive retained for `days`.
    pub fn create_archive(
        &self,
        safe_id: &str,
        name: &str,
        days: u32,
        ssh_key_id: &str,
    ) -> Result<String> {
        let value = self.storage(
            ApiRequest::new(Method::Post, format!("safe/{safe_id}/archive"))
                .param("name", name)
                .param("description", " ")
                .param("parity", "standard")
                .list_param("protocols", ["ssh"])
                .list_param("ssh_keys", [ssh_key_id])
                .param("days", days)
                .list_param("platforms", ["1"]),
        )?;
        created_id(value, "archive")
    }

    pub fn archive_details(&self, safe_id: &str, archive_id: &str) -> Result<Archive> {
        let value = self.storage(ApiRequest::new(
            Method::Get,
            format!("safe/{safe_id}/archive/{archive_id}"),
        ))?;
        decode(value, "archive details")
    }

    pub fn modify_archive(&self, safe_id: &str, archive_id: &str, description: &str) -> Result<()> {
        self.storage(
            ApiRequest::new(Method::Patch, format!("safe/{safe_id}/archive/{archive_id}"))
                .param("description", description),
        )?;
        Ok(())
    }

    pub fn delete_archive(&self, safe_id: &str, archive_id: &str) -> Result<()> {
        self.storage(ApiRequest::new(
            Method::Delete,
            format!("safe/{safe_id}/archive/{archive_id}"),
        ))?;
        Ok(())
    }

    pub fn list_ssh_keys(&self) -> Result<Vec<SshKey>> {
        let value = self.user(ApiRequest::new(Method::Get, "key/ssh"))?;
        decode(value, "ssh key list")
    }

    pub fn register_ssh_key(&self, description: &str, content: &str) -> Result<String> {
        let value = self.user(
            ApiRequest::new(Method::Post, "key/ssh")
                .param("description", description)
                .param("content", content),
        )?;
        created_id(value, "ssh key")
    }

    fn storage(&self, mut request: ApiRequest) -> Result<Value> {
        request.path = format!("/storage/c14/{}", request.path);
        self.send(request)
    }

    fn user(&self, mut request: ApiRequest) -> Result<Value> {
        request.path = format!("/user/{}", request.path);
        self.send(request)
    }

    #[instrument(skip_all, fields(method = ?request.method, path = %request.path))]
    fn send(&self, request: ApiRequest) -> Result<Value> {
        debug!(params = ?request.params, "sending provider query");
        let value = self.transport.send(&request)?;
        debug!(result = %value, "provider query result");
        Ok(value)
    }
}

fn decode<D: DeserializeOwned>(value: Value, what: &str) -> Result<D> {
    serde_json::from_value(value)
        .map_err(|e| ConfigError::new(format!("unexpected {what} response: {e}")).into())
}

/// Creation endpoints answer with the new uuid, either bare or as `uuid_ref`.
fn created_id(value: Value, what: &str) -> Result<String> {
    match &value {
        Value::String(id) if !id.is_empty() => Ok(id.clone()),
        Value::Object(map) => match map.get("uuid_ref") {
            Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
            _ => Err(ConfigError::new(format!("{what} creation returned no uuid: {value}")).into()),
        },
        _ => Err(ConfigError::new(format!("{what} creation returned no uuid: {value}")).into()),
    }
}
