//! Deterministic cache keys for inference requests.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Serialize)]
struct CanonicalRequest<'a> {
    prompt: &'a str,
    model: &'a str,
    temperature: f32,
    params: &'a BTreeMap<String, Value>,
}

/// Hashes `(prompt, model, temperature, extra_params)` into a hex SHA-256 key.
///
/// `extra_params` is a `BTreeMap`, so parameter insertion order never changes the key.
pub fn generate_key(
    prompt: &str,
    model: &str,
    temperature: f32,
    extra_params: &BTreeMap<String, Value>,
) -> String {
    let canonical = CanonicalRequest {
        prompt,
        model,
        temperature,
        params: extra_params,
    };
    // Serializing a struct of strings, a float and a BTreeMap<String, Value> cannot fail.
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}
