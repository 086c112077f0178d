//! Request authentication for the API surface.
//!
//! Clients sign the canonical string `METHOD|PATH|SHA256(body)|TIMESTAMP`
//! with the ed25519 key behind their address. Verification happens entirely
//! at this boundary; the executor only ever sees authenticated requests.

use common_types::Address;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("malformed address header")]
    MalformedAddress,
    #[error("malformed signature header")]
    MalformedSignature,
    #[error("malformed timestamp header")]
    MalformedTimestamp,
    #[error("timestamp outside the allowed window")]
    StaleTimestamp,
    #[error("signature verification failed")]
    BadSignature,
}

/// The exact bytes a client signs for one request.
pub fn canonical_message(method: &str, path: &str, body: &[u8], timestamp: u64) -> Vec<u8> {
    let body_hash = hex::encode(Sha256::digest(body));
    format!("{method}|{path}|{body_hash}|{timestamp}").into_bytes()
}

/// Verify one request envelope and return the authenticated address.
///
/// A timestamp is accepted when `|now - timestamp| <= skew_window`, so a
/// request exactly at the window edge still passes.
#[allow(clippy::too_many_arguments)]
pub fn verify_request(
    address_hex: &str,
    signature_hex: &str,
    timestamp_header: &str,
    now: u64,
    skew_window: u64,
    method: &str,
    path: &str,
    body: &[u8],
) -> Result<Address, AuthError> {
    let timestamp: u64 = timestamp_header
        .parse()
        .map_err(|_| AuthError::MalformedTimestamp)?;
    if now.abs_diff(timestamp) > skew_window {
        return Err(AuthError::StaleTimestamp);
    }

    let address = Address::from_hex(address_hex).map_err(|_| AuthError::MalformedAddress)?;
    let key = VerifyingKey::from_bytes(&address.0).map_err(|_| AuthError::MalformedAddress)?;
    let signature_bytes = hex::decode(signature_hex).map_err(|_| AuthError::MalformedSignature)?;
    let signature =
        Signature::from_slice(&signature_bytes).map_err(|_| AuthError::MalformedSignature)?;

    key.verify(&canonical_message(method, path, body, timestamp), &signature)
        .map_err(|_| AuthError::BadSignature)?;
    Ok(address)
}
