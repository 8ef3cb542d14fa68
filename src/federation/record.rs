//! Federation memory records and the signature policy.
//!
//! A record is a self-describing event: globally unique id, timestamp, type,
//! component, version, payload hash, optional signature, opaque JSON payload,
//! and the Merkle root known at write time. Two records sharing an id with
//! different payload hashes are a conflict for the resolver.
//!
//! Signing is behind a narrow verifier trait so deployments can swap the
//! in-tree HMAC-SHA256 implementation for an external tool without touching
//! the sync path. The `require_signatures` switch is configuration-driven.

use crate::federation::canonical::canonical_json;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryRecord {
    pub id: String,
    /// RFC 3339 timestamp assigned by the writing node.
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub component: String,
    pub version: String,
    /// SHA-256 of the canonical payload.
    pub hash: String,
    #[serde(default)]
    pub sig: Option<String>,
    pub data: Value,
    /// Merkle root known by the writer at append time.
    #[serde(default)]
    pub merkle_root: Option<String>,
    /// Signer identity used by the deterministic merge sort.
    #[serde(default)]
    pub signer_id: Option<String>,
}

impl MemoryRecord {
    /// Build a new record with a fresh id and computed payload hash.
    pub fn new(kind: &str, component: &str, version: &str, data: Value) -> Self {
        let hash = payload_hash(&data);
        Self {
            id: format!("mem-{}", uuid::Uuid::new_v4()),
            timestamp: chrono::Utc::now().to_rfc3339(),
            kind: kind.to_string(),
            component: component.to_string(),
            version: version.to_string(),
            hash,
            sig: None,
            data,
            merkle_root: None,
            signer_id: None,
        }
    }

    /// Stable projection hashed for Merkle leaves and content comparison.
    /// Volatile fields (`merkle_root`, `signer_id`) stay out.
    pub fn projection(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "timestamp": self.timestamp,
            "type": self.kind,
            "component": self.component,
            "version": self.version,
            "hash": self.hash,
            "sig": self.sig,
            "data": self.data,
        })
    }

    /// SHA-256 over the canonical projection, hex-encoded.
    pub fn content_hash(&self) -> String {
        let canonical = canonical_json(&self.projection()).expect("projection is valid JSON");
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }

    /// Recompute the payload hash and compare with the recorded one.
    pub fn payload_hash_valid(&self) -> bool {
        payload_hash(&self.data) == self.hash
    }
}

pub fn payload_hash(data: &Value) -> String {
    let canonical = canonical_json(data).expect("payload is valid JSON");
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Narrow signing/verification interface.
pub trait RecordVerifier: Send + Sync {
    /// Signature over the record's signable bytes, if this verifier signs.
    fn sign(&self, record: &MemoryRecord) -> Option<String>;
    /// True when the record's signature is valid for this trust domain.
    fn verify(&self, record: &MemoryRecord) -> bool;
    fn name(&self) -> &'static str;
}

fn signable_bytes(record: &MemoryRecord) -> Vec<u8> {
    // Everything in the projection except the signature itself.
    let mut projection = record.projection();
    if let Some(obj) = projection.as_object_mut() {
        obj.remove("sig");
    }
    canonical_json(&projection)
        .expect("projection is valid JSON")
        .into_bytes()
}

/// Keyed HMAC-SHA256 signatures, base64-encoded.
pub struct HmacVerifier {
    key: Vec<u8>,
}

impl HmacVerifier {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.as_bytes().to_vec(),
        }
    }
}

impl RecordVerifier for HmacVerifier {
    fn sign(&self, record: &MemoryRecord) -> Option<String> {
        let mut mac = HmacSha256::new_from_slice(&self.key).ok()?;
        mac.update(&signable_bytes(record));
        use base64::Engine as _;
        Some(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    fn verify(&self, record: &MemoryRecord) -> bool {
        let Some(sig) = &record.sig else {
            return false;
        };
        use base64::Engine as _;
        let Ok(sig_bytes) = base64::engine::general_purpose::STANDARD.decode(sig) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.key) else {
            return false;
        };
        mac.update(&signable_bytes(record));
        mac.verify_slice(&sig_bytes).is_ok()
    }

    fn name(&self) -> &'static str {
        "hmac-sha256"
    }
}

/// Verifier for deployments without a signing key: signs nothing, trusts
/// everything. Only sound with `require_signatures` off.
pub struct NoopVerifier;

impl RecordVerifier for NoopVerifier {
    fn sign(&self, _record: &MemoryRecord) -> Option<String> {
        None
    }

    fn verify(&self, _record: &MemoryRecord) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// Pre-insert validation for synced records.
pub struct RecordValidator {
    verifier: Arc<dyn RecordVerifier>,
    require_signatures: bool,
}

impl RecordValidator {
    pub fn new(verifier: Arc<dyn RecordVerifier>, require_signatures: bool) -> Self {
        Self {
            verifier,
            require_signatures,
        }
    }

    /// Validate a record fetched from a peer. Returns the rejection reason on
    /// failure.
    pub fn validate(&self, record: &MemoryRecord) -> Result<(), String> {
        if record.id.is_empty() {
            return Err("record id is empty".to_string());
        }
        if record.timestamp.is_empty() {
            return Err("record timestamp is empty".to_string());
        }
        if !record.payload_hash_valid() {
            return Err(format!("payload hash mismatch for {}", record.id));
        }
        if self.require_signatures {
            if record.sig.is_none() {
                return Err(format!("unsigned record {} with signatures required", record.id));
            }
            if !self.verifier.verify(record) {
                return Err(format!(
                    "signature verification failed for {} ({})",
                    record.id,
                    self.verifier.name()
                ));
            }
        }
        Ok(())
    }
}
