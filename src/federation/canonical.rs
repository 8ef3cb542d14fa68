//! Canonical JSON encoding.
//!
//! Keys sorted lexicographically, minimal separators, no extraneous
//! whitespace. Values are routed through `serde_json::Value` (whose object
//! representation is an ordered map keyed by string) so nested objects come
//! out sorted regardless of struct field order. Encode → decode → encode is
//! byte-stable.

use anyhow::Result;
use serde::Serialize;

/// Canonical JSON string of any serializable value.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&v)?)
}

/// Canonical JSON bytes.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(canonical_json(value)?.into_bytes())
}
