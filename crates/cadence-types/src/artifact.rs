//! Artifacts: durable outputs of successful attempts, addressed by content digest.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// Lowercase hex SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Hex length of a SHA-256 digest.
    pub const HEX_LEN: usize = 64;

    /// Build a digest from raw hash output bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hex = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            hex.push_str(&format!("{b:02x}"));
        }
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-character shard prefix used for blob fan-out on disk.
    pub fn shard(&self) -> &str {
        &self.0[..2]
    }

    /// Abbreviated form for display.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl FromStr for Digest {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s.len() == Self::HEX_LEN
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(StoreError::InvalidDigest(s.to_string()))
        }
    }
}

impl TryFrom<String> for Digest {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata row for an artifact. The bytes live in the content-addressed store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: Uuid,
    /// Denormalized stage name of the owning step.
    pub stage_name: String,
    /// Producer-defined type (e.g. "markdown", "analysis_json").
    pub artifact_type: String,
    /// Logical path in the object store (`tenants/{tenant}/runs/{run}/{stage}/{type}`).
    pub ref_path: String,
    pub digest: Digest,
    pub size_bytes: u64,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn to_ref(&self) -> ArtifactRef {
        ArtifactRef {
            artifact_id: self.id,
            stage_name: self.stage_name.clone(),
            artifact_type: self.artifact_type.clone(),
            ref_path: self.ref_path.clone(),
            digest: self.digest.clone(),
            size_bytes: self.size_bytes,
        }
    }
}

/// Lightweight handle returned by step execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub artifact_id: Uuid,
    pub stage_name: String,
    pub artifact_type: String,
    pub ref_path: String,
    pub digest: Digest,
    pub size_bytes: u64,
}
