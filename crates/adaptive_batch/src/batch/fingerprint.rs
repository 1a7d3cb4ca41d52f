use std::fmt;

use serde::Serialize;
use xxhash_rust::xxh3::xxh3_128;

use super::job::RequestConfig;

/// Deterministic digest of a job's text and every parameter that changes
/// the remote answer.
///
/// The digest input is the canonical JSON of the text plus the whole
/// serialized [`RequestConfig`]; fields that do not affect the answer
/// (timeout, processing mode) are skipped by the config's serializer, so a
/// new answer-affecting field is covered as soon as it is added there.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RequestFingerprint(String);

#[derive(Serialize)]
struct FingerprintInput<'a> {
    text: &'a str,
    config: &'a RequestConfig,
}

impl RequestFingerprint {
    pub fn compute(text: &str, config: &RequestConfig) -> Self {
        let input = FingerprintInput { text, config };
        // Serializing plain structs, strings and ordered maps cannot fail.
        let canonical = serde_json::to_vec(&input).unwrap_or_default();
        RequestFingerprint(format!("{:032x}", xxh3_128(&canonical)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
