//! Provider records shared between the API client and core logic.
//!
//! Field names follow the provider's JSON (`uuid_ref`, `creation_date`, ...).
//! Anything we depend on is required at deserialization time, so a malformed
//! response fails loudly instead of being half-interpreted.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Logical container of archives, unique by name per account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Safe {
    #[serde(rename = "uuid_ref")]
    pub uuid: String,
    pub name: String,
}

/// Lifecycle state reported by the provider for an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveStatus {
    Creating,
    Active,
    Busy,
    Deleting,
    Error,
    /// Any state this tool does not act on (archived, locked, ...).
    #[serde(other)]
    Other,
}

/// Archive as returned by the list endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveSummary {
    #[serde(rename = "uuid_ref")]
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Full archive details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archive {
    #[serde(rename = "uuid_ref")]
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: ArchiveStatus,
    /// Missing for archives in some transitional states.
    #[serde(default)]
    pub creation_date: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub bucket: Option<Bucket>,
}

impl Archive {
    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or("")
    }

    /// Date the storage side moved the bucket into its current archival period.
    pub fn archival_date(&self) -> Option<DateTime<FixedOffset>> {
        self.bucket.as_ref().and_then(|bucket| bucket.archival_date)
    }

    /// Connection URI of the mountable endpoint, preferring SSH credentials.
    pub fn ssh_uri(&self) -> Option<&str> {
        let credentials = &self.bucket.as_ref()?.credentials;
        credentials
            .iter()
            .find(|cred| cred.protocol.as_deref() == Some("ssh"))
            .or_else(|| credentials.first())
            .map(|cred| cred.uri.as_str())
    }
}

/// Storage-side view of an archive: archival date and mount credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    #[serde(default)]
    pub archival_date: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub credentials: Vec<Credential>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub uri: String,
    #[serde(default)]
    pub protocol: Option<String>,
}

/// Public SSH key registered with the provider account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshKey {
    #[serde(rename = "uuid_ref")]
    pub uuid: String,
    pub fingerprint: String,
}
