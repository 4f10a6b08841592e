//! Meek cookie codec
//!
//! A meek client announces a new session by sending an HTTP cookie whose
//! value is base64(seed-message ∥ obfuscated(ephemeral-pubkey ∥ box(JSON))).
//! The NaCl box is sealed against the server's configured X25519 key with an
//! all-zeros nonce; this is safe because every cookie uses a fresh ephemeral
//! client keypair.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use crypto_box::{aead::Aead, Nonce, PublicKey, SalsaBox, SecretKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::obfuscate::{ClientObfuscator, ObfuscateError, ServerObfuscator};

/// X25519 key length, for both the server key and the ephemeral client key
pub const COOKIE_KEY_LENGTH: usize = 32;

/// Session parameters carried inside the encrypted cookie payload.
///
/// Only the protocol version is consumed by the server; the remaining fields
/// are legacy client-reported values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientSessionData {
    #[serde(rename = "v")]
    pub protocol_version: i32,
    #[serde(rename = "s", default)]
    pub client_session_id: String,
    #[serde(rename = "p", default)]
    pub client_region_hint: String,
}

/// Cookie decode error
#[derive(Debug, Error)]
pub enum CookieError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("obfuscation handshake failed: {0}")]
    Obfuscation(#[from] ObfuscateError),
    #[error("invalid cookie encryption key")]
    InvalidKey,
    #[error("unexpected encrypted payload size")]
    PayloadSize,
    #[error("open box failed")]
    OpenBox,
    #[error("seal box failed")]
    SealBox,
    #[error("invalid session payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Generates a fresh server cookie-encryption key pair, returned as
/// base64-encoded (private, public) values suitable for configuration.
pub fn generate_key_pair() -> (String, String) {
    let secret = SecretKey::generate(&mut OsRng);
    (
        BASE64.encode(secret.to_bytes()),
        BASE64.encode(secret.public_key().as_bytes()),
    )
}

fn decode_key(value: &str) -> Result<[u8; COOKIE_KEY_LENGTH], CookieError> {
    let bytes = BASE64.decode(value).map_err(|_| CookieError::InvalidKey)?;
    bytes.try_into().map_err(|_| CookieError::InvalidKey)
}

/// Extracts the session parameters from a meek cookie value.
///
/// `obfuscated_key` is the shared obfuscation keyword and `private_key` the
/// server's base64-encoded X25519 private key.
pub fn open_cookie(
    obfuscated_key: &str,
    private_key: &str,
    cookie_value: &str,
) -> Result<ClientSessionData, CookieError> {
    let mut decoded = BASE64.decode(cookie_value)?;

    // The seed message is prepended to the obfuscated, encrypted payload;
    // the handshake consumes it and leaves the keystream positioned at the
    // first payload byte.
    let (mut obfuscator, offset) = ServerObfuscator::new(obfuscated_key, &mut decoded)?;
    let payload = &mut decoded[offset..];
    obfuscator.obfuscate_client_to_server(payload);

    if payload.len() < COOKIE_KEY_LENGTH {
        return Err(CookieError::PayloadSize);
    }

    let secret_key = SecretKey::from(decode_key(private_key)?);
    let mut ephemeral_public = [0u8; COOKIE_KEY_LENGTH];
    ephemeral_public.copy_from_slice(&payload[..COOKIE_KEY_LENGTH]);
    let ephemeral_public = PublicKey::from(ephemeral_public);

    let nonce = Nonce::default();
    let plaintext = SalsaBox::new(&ephemeral_public, &secret_key)
        .decrypt(&nonce, &payload[COOKIE_KEY_LENGTH..])
        .map_err(|_| CookieError::OpenBox)?;

    Ok(serde_json::from_slice(&plaintext)?)
}

/// Produces a meek cookie value for the given session parameters, sealed
/// against the server's base64-encoded X25519 public key with a fresh
/// ephemeral keypair. Padding in the seed message is limited to
/// `max_padding` so the cookie stays within header size limits.
pub fn seal_cookie(
    obfuscated_key: &str,
    server_public_key: &str,
    session_data: &ClientSessionData,
    max_padding: usize,
) -> Result<String, CookieError> {
    let plaintext = serde_json::to_vec(session_data)?;

    let server_public = PublicKey::from(decode_key(server_public_key)?);
    let ephemeral_secret = SecretKey::generate(&mut OsRng);

    let nonce = Nonce::default();
    let boxed = SalsaBox::new(&server_public, &ephemeral_secret)
        .encrypt(&nonce, plaintext.as_slice())
        .map_err(|_| CookieError::SealBox)?;

    let mut payload = Vec::with_capacity(COOKIE_KEY_LENGTH + boxed.len());
    payload.extend_from_slice(ephemeral_secret.public_key().as_bytes());
    payload.extend_from_slice(&boxed);

    let mut obfuscator = ClientObfuscator::new(obfuscated_key, max_padding);
    obfuscator.obfuscate_client_to_server(&mut payload);

    let mut cookie = obfuscator.seed_message().to_vec();
    cookie.extend_from_slice(&payload);

    Ok(BASE64.encode(&cookie))
}
