//! Authenticated lease tokens
//!
//! A token proves the right to publish under a repository subpath until
//! an expiry instant. The payload `"<path>|<expiry ms>"` is sealed with
//! AES-256-GCM under a per-token random secret; the AEAD tag doubles as
//! the MAC, so a token is valid iff it decrypts under the presented
//! secret and its expiry lies in the future. There is no revocation
//! store: expiry is the only lifetime mechanism.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Verdict on a presented token
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    /// The token verified but its lease has run out
    #[error("token has expired")]
    Expired,
    /// The token or secret failed to parse or authenticate
    #[error("token is invalid")]
    Invalid,
    /// Token construction itself failed
    #[error("token generation failed: {0}")]
    Generation(String),
}

/// A freshly issued session token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    /// Opaque base64 token handed to the publisher
    pub token: String,
    /// Public identifier, safe to log and index by
    pub id: String,
    /// Per-token secret the publisher must present at checks
    pub secret: String,
}

/// The wire form inside the base64 envelope
#[derive(Serialize, Deserialize)]
struct TokenEnvelope {
    id: String,
    nonce: [u8; 12],
    ciphertext: Vec<u8>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn hex(bytes: &[u8]) -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0xf) as usize] as char);
    }
    out
}

/// Issue a lease token for `path`, valid for `max_lease_time` milliseconds
pub fn generate_session_token(
    key_id: &str,
    path: &str,
    max_lease_time: u64,
) -> Result<SessionToken, TokenError> {
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);
    let mut id_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut id_bytes);
    let id = hex(&id_bytes);

    let expiry = now_ms() + max_lease_time;
    let plaintext = format!("{path}|{expiry}");

    let cipher = Aes256Gcm::new_from_slice(&secret)
        .map_err(|e| TokenError::Generation(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext.as_bytes())
        .map_err(|e| TokenError::Generation(e.to_string()))?;

    let envelope = TokenEnvelope {
        id: id.clone(),
        nonce,
        ciphertext,
    };
    let encoded =
        bincode::serialize(&envelope).map_err(|e| TokenError::Generation(e.to_string()))?;

    debug!(key_id, path, max_lease_time, id = %id, "session token issued");
    Ok(SessionToken {
        token: BASE64.encode(encoded),
        id,
        secret: BASE64.encode(secret),
    })
}

fn parse_envelope(token: &str) -> Result<TokenEnvelope, TokenError> {
    let raw = BASE64.decode(token).map_err(|_| TokenError::Invalid)?;
    bincode::deserialize(&raw).map_err(|_| TokenError::Invalid)
}

/// The public identifier of a token, without validating it
pub fn get_token_public_id(token: &str) -> Result<String, TokenError> {
    Ok(parse_envelope(token)?.id)
}

/// Validate a token against its secret. Returns the lease path on
/// success; [`TokenError::Expired`] once the lease ran out;
/// [`TokenError::Invalid`] on any authentication or parse failure.
pub fn check_token(token: &str, secret: &str) -> Result<String, TokenError> {
    let envelope = parse_envelope(token)?;
    let secret_bytes = BASE64.decode(secret).map_err(|_| TokenError::Invalid)?;

    let cipher = Aes256Gcm::new_from_slice(&secret_bytes).map_err(|_| TokenError::Invalid)?;
    let plaintext = cipher
        .decrypt(
            aes_gcm::Nonce::from_slice(&envelope.nonce),
            envelope.ciphertext.as_ref(),
        )
        .map_err(|_| TokenError::Invalid)?;
    let plaintext = String::from_utf8(plaintext).map_err(|_| TokenError::Invalid)?;

    // The path may contain '|'; the expiry is always the last field.
    let (path, expiry) = plaintext.rsplit_once('|').ok_or(TokenError::Invalid)?;
    let expiry: u64 = expiry.parse().map_err(|_| TokenError::Invalid)?;

    if now_ms() >= expiry {
        debug!(id = %envelope.id, "token expired");
        return Err(TokenError::Expired);
    }
    Ok(path.to_string())
}
