//! Signature version 2 request signing.
//!
//! Every queue call is a GET whose query parameters are signed with
//! HMAC-SHA256 over a canonical string:
//!
//! ```text
//! GET\n
//! sqs.us-east-1.amazonaws.com\n
//! /123456789012/work\n
//! AWSAccessKeyId=...&Action=...&...
//! ```
//!
//! The service rebuilds the same string on its side, so the parameter order
//! and the percent-encoding used here must match it exactly. The query string
//! that is actually transmitted is produced by [`canonical_query`] as well.
//!
//! ## References
//!
//! - [Signature Version 2](https://docs.aws.amazon.com/general/latest/gr/signature-version-2.html)

use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use url::Url;

#[cfg(test)]
#[path = "signer_tests.rs"]
mod tests;

type HmacSha256 = Hmac<Sha256>;

/// Value of the `SignatureVersion` parameter
pub const SIGNATURE_VERSION: &str = "2";

/// Value of the `SignatureMethod` parameter
pub const SIGNATURE_METHOD: &str = "HmacSHA256";

/// Symmetric-key request signer
///
/// Stateless apart from the secret; signing is a pure function of the method,
/// URL and parameter set, and does not depend on the iteration order of the
/// parameter map.
#[derive(Clone)]
pub struct RequestSigner {
    secret_key: String,
}

impl RequestSigner {
    /// Create a signer for the given secret access key
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
        }
    }

    /// Build the string that gets signed
    ///
    /// Method, host (with port when the URL names one), path, then the sorted
    /// and encoded parameters. Nothing follows the path's newline when the
    /// parameter set is empty.
    pub fn canonical_string(method: &str, url: &Url, params: &HashMap<String, String>) -> String {
        let mut raw = String::new();
        raw.push_str(method);
        raw.push('\n');
        raw.push_str(&host_with_port(url));
        raw.push('\n');
        raw.push_str(url.path());
        raw.push('\n');
        raw.push_str(&canonical_query(params));
        raw
    }

    /// Sign a request and return the base64 encoded digest
    pub fn sign(&self, method: &str, url: &Url, params: &HashMap<String, String>) -> String {
        let canonical = Self::canonical_string(method, url, params);
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(canonical.as_bytes());
        STANDARD.encode(mac.finalize().into_bytes())
    }
}

impl fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSigner")
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Sort and encode parameters as `key=value` pairs joined with `&`
pub fn canonical_query(params: &HashMap<String, String>) -> String {
    let mut pairs: Vec<(&String, &String)> = params.iter().collect();
    pairs.sort_by(|(left, _), (right, _)| compare_parameter_names(left, right));

    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Locale-aware ordering of parameter names
///
/// Names compare case-insensitively first, with punctuation before digits
/// before letters. Names equal at that level are ordered lowercase-first at
/// the first differing letter, and raw byte order settles the rest. Under
/// this ordering `Action` sorts before `AWSAccessKeyId`.
pub fn compare_parameter_names(left: &str, right: &str) -> Ordering {
    left.chars()
        .map(primary_weight)
        .cmp(right.chars().map(primary_weight))
        .then_with(|| {
            left.chars()
                .map(case_weight)
                .cmp(right.chars().map(case_weight))
        })
        .then_with(|| left.cmp(right))
}

fn primary_weight(c: char) -> (u8, char) {
    if c.is_alphabetic() {
        (2, c.to_lowercase().next().unwrap_or(c))
    } else if c.is_numeric() {
        (1, c)
    } else {
        (0, c)
    }
}

fn case_weight(c: char) -> u8 {
    if c.is_uppercase() {
        1
    } else {
        0
    }
}

fn host_with_port(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}
