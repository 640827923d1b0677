//! Handshake signature check for the platform's endpoint verification.
//!
//! The platform proves it knows the shared token by sending
//! `hex(sha1(timestamp + nonce + token))`; echoing `echostr` back proves we
//! own the endpoint.

use std::collections::HashMap;

use sha1::{Digest, Sha1};

use super::WebhookError;

/// Query parameters of a verification handshake. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRequest {
    /// Sender timestamp.
    pub timestamp: String,
    /// Random nonce.
    pub nonce: String,
    /// Hex SHA-1 digest to check.
    pub signature: String,
    /// Value to echo back on success.
    pub echostr: String,
}

impl VerificationRequest {
    /// Build from decoded query parameters.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::MalformedRequest`] naming the first missing
    /// parameter.
    pub fn from_query(params: &HashMap<String, String>) -> Result<Self, WebhookError> {
        let field = |name: &str| {
            params.get(name).cloned().ok_or_else(|| {
                WebhookError::MalformedRequest(format!("missing query parameter `{name}`"))
            })
        };
        Ok(Self {
            timestamp: field("timestamp")?,
            nonce: field("nonce")?,
            signature: field("signature")?,
            echostr: field("echostr")?,
        })
    }
}

/// The handshake signature did not match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("handshake signature rejected")]
pub struct Rejected;

/// Compute the expected signature: lowercase hex SHA-1 of
/// `timestamp`, `nonce` and `token` concatenated in that order.
pub fn signature(timestamp: &str, nonce: &str, token: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(timestamp.as_bytes());
    hasher.update(nonce.as_bytes());
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Check a handshake and return the echo string on success.
///
/// The comparison is case-sensitive.
///
/// # Errors
///
/// Returns [`Rejected`] when the signature does not match.
pub fn verify(req: &VerificationRequest, token: &str) -> Result<String, Rejected> {
    let expected = signature(&req.timestamp, &req.nonce, token);
    if constant_time_eq(expected.as_bytes(), req.signature.as_bytes()) {
        Ok(req.echostr.clone())
    } else {
        Err(Rejected)
    }
}

/// Constant-time byte comparison.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
