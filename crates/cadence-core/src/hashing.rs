//! SHA-256 content and input digests.
//!
//! Content digests address artifact bytes. Input digests are computed over a
//! canonical JSON encoding of a stage's effective inputs: object keys sorted,
//! no insignificant whitespace, so logically equal inputs always hash equal.

use cadence_types::artifact::Digest;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest as _, Sha256};
use uuid::Uuid;

/// Digest of raw bytes.
pub fn content_digest(bytes: &[u8]) -> Digest {
    Digest::from_bytes(&Sha256::digest(bytes))
}

/// Serialize a JSON value with object keys in sorted order at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Effective inputs of one step execution.
#[derive(Debug, Clone, Serialize)]
pub struct StageInputs<'a> {
    pub run_id: Uuid,
    pub stage: &'a str,
    pub config: &'a Value,
    /// `(stage_name, digest)` of every prior artifact the stage consumes, in pipeline order.
    pub prior: Vec<(&'a str, &'a Digest)>,
    pub revision: u32,
    pub instruction: Option<&'a str>,
}

/// Deterministic digest of a stage's effective inputs.
pub fn input_digest(inputs: &StageInputs<'_>) -> Digest {
    let prior: Vec<Value> = inputs
        .prior
        .iter()
        .map(|(stage, digest)| serde_json::json!({ "stage": stage, "digest": digest.as_str() }))
        .collect();
    let value = serde_json::json!({
        "run_id": inputs.run_id.to_string(),
        "stage": inputs.stage,
        "config": inputs.config,
        "prior": prior,
        "revision": inputs.revision,
        "instruction": inputs.instruction,
    });
    content_digest(canonical_json(&value).as_bytes())
}
