//! Logical artifact paths.
//!
//! A path is a pure function of `(tenant, run, stage, artifact_type)`:
//! `tenants/{tenant}/runs/{run}/{stage}/{artifact_type}`, where a branch step
//! (`stage/branch`) contributes two segments. Every caller-supplied segment is
//! validated; nothing from untrusted input is ever joined unchecked.

use std::fmt;

use cadence_types::error::StoreError;
use cadence_types::run::TenantId;
use cadence_types::step::BRANCH_SEPARATOR;
use uuid::Uuid;

/// Longest accepted segment.
const MAX_SEGMENT_LEN: usize = 128;

/// Rounds of percent-decoding applied when looking for hidden traversal.
const MAX_DECODE_ROUNDS: usize = 3;

/// Validated logical path of one artifact pointer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactPath {
    key: String,
    tenant: TenantId,
}

impl ArtifactPath {
    pub fn new(
        tenant: &TenantId,
        run_id: Uuid,
        stage_name: &str,
        artifact_type: &str,
    ) -> Result<Self, StoreError> {
        validate_segment(tenant.as_str())?;
        validate_segment(artifact_type)?;

        let stage_segments: Vec<&str> = stage_name.split(BRANCH_SEPARATOR).collect();
        if stage_segments.len() > 2 {
            return Err(invalid(stage_name, "too many stage segments"));
        }
        for segment in &stage_segments {
            validate_segment(segment)?;
        }

        Ok(Self {
            key: format!(
                "tenants/{}/runs/{}/{}/{}",
                tenant.as_str(),
                run_id,
                stage_segments.join("/"),
                artifact_type
            ),
            tenant: tenant.clone(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Tenant whose blob namespace this pointer resolves into.
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }
}

impl fmt::Display for ArtifactPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

fn invalid(segment: &str, reason: &str) -> StoreError {
    StoreError::InvalidPath {
        segment: segment.to_string(),
        reason: reason.to_string(),
    }
}

/// Reject anything that is not a plain, single path component.
pub(super) fn validate_segment(segment: &str) -> Result<(), StoreError> {
    if segment.is_empty() {
        return Err(invalid(segment, "empty segment"));
    }
    if segment.len() > MAX_SEGMENT_LEN {
        return Err(invalid(segment, "segment too long"));
    }
    check_plain(segment, segment)?;

    // Encoded variants: decode repeatedly and re-check each layer.
    if segment.contains('%') {
        let mut current = segment.to_string();
        for _ in 0..MAX_DECODE_ROUNDS {
            let decoded = percent_decode(&current);
            if decoded == current {
                break;
            }
            check_plain(segment, &decoded)
                .map_err(|_| invalid(segment, "encoded traversal sequence"))?;
            current = decoded;
        }
        return Err(invalid(segment, "percent-encoding is not allowed"));
    }

    if !segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid(segment, "invalid character"));
    }
    Ok(())
}

/// Structural checks shared by the raw and decoded forms of a segment.
fn check_plain(original: &str, candidate: &str) -> Result<(), StoreError> {
    if candidate.contains("..") {
        return Err(invalid(original, "traversal sequence"));
    }
    if candidate.contains('/') || candidate.contains('\\') {
        return Err(invalid(original, "path separator"));
    }
    if candidate.chars().any(|c| c == '\0' || c.is_control()) {
        return Err(invalid(original, "control character"));
    }
    if candidate.starts_with('.') {
        return Err(invalid(original, "leading dot"));
    }
    Ok(())
}

/// Lossy single-round percent decoding. Malformed escapes are kept verbatim.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
