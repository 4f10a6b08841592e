//! Obfuscated handshake for the meek cookie payload
//!
//! The payload is preceded by a seed message: a random seed followed by an
//! RC4-encrypted magic value and a variable amount of padding. Both
//! directions' keystreams are derived from the seed, a shared keyword and a
//! direction IV by an iterated SHA-1 digest. The transform provides
//! obfuscation only; confidentiality comes from the NaCl box layered inside.

use rand::{rngs::OsRng, Rng, RngCore};
use rc4::{consts::U16, KeyInit, Rc4, StreamCipher};
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Length of the random seed prepended to the seed message
pub const OBFUSCATE_SEED_LENGTH: usize = 16;

/// RC4 key length derived from the digest
pub const OBFUSCATE_KEY_LENGTH: usize = 16;

/// Digest iteration count for key derivation
pub const OBFUSCATE_HASH_ITERATIONS: usize = 6000;

/// Maximum random padding carried by the seed message
pub const OBFUSCATE_MAX_PADDING: usize = 8192;

/// Magic value confirming the peer derived the same keystream
pub const OBFUSCATE_MAGIC_VALUE: u32 = 0x0BF5_CA7E;

const CLIENT_TO_SERVER_IV: &[u8] = b"client_to_server";
const SERVER_TO_CLIENT_IV: &[u8] = b"server_to_client";

/// Fixed-length fields following the seed: magic value and padding length
const SEED_FIXED_FIELDS_LENGTH: usize = 8;

/// Obfuscation handshake error
#[derive(Debug, Error)]
pub enum ObfuscateError {
    #[error("seed message truncated")]
    SeedMessageTruncated,
    #[error("invalid magic value {0:#x}")]
    InvalidMagicValue(u32),
    #[error("invalid padding length {0}")]
    InvalidPaddingLength(usize),
}

fn derive_key(seed: &[u8], keyword: &[u8], iv: &[u8]) -> [u8; OBFUSCATE_KEY_LENGTH] {
    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(keyword);
    hasher.update(iv);
    let mut digest = hasher.finalize();

    let mut hasher = Sha1::new();
    for _ in 0..OBFUSCATE_HASH_ITERATIONS {
        hasher.update(digest);
        digest = hasher.finalize_reset();
    }

    let mut key = [0u8; OBFUSCATE_KEY_LENGTH];
    key.copy_from_slice(&digest[..OBFUSCATE_KEY_LENGTH]);
    key
}

fn new_cipher(seed: &[u8], keyword: &[u8], iv: &[u8]) -> Rc4<U16> {
    let key = derive_key(seed, keyword, iv);
    Rc4::new((&key).into())
}

/// Server side of the obfuscation handshake.
///
/// Constructed from a buffer starting with a client seed message; consuming
/// the seed message advances both keystreams past it, so subsequent
/// [`obfuscate_client_to_server`](Self::obfuscate_client_to_server) calls
/// continue where the handshake left off.
pub struct ServerObfuscator {
    client_to_server: Rc4<U16>,
    server_to_client: Rc4<U16>,
}

impl ServerObfuscator {
    /// Reads the seed message at the start of `data`, validating the magic
    /// value and consuming the padding. Returns the obfuscator and the
    /// offset of the first payload byte.
    pub fn new(keyword: &str, data: &mut [u8]) -> Result<(ServerObfuscator, usize), ObfuscateError> {
        if data.len() < OBFUSCATE_SEED_LENGTH + SEED_FIXED_FIELDS_LENGTH {
            return Err(ObfuscateError::SeedMessageTruncated);
        }

        let (seed, rest) = data.split_at_mut(OBFUSCATE_SEED_LENGTH);
        let mut client_to_server = new_cipher(seed, keyword.as_bytes(), CLIENT_TO_SERVER_IV);
        let server_to_client = new_cipher(seed, keyword.as_bytes(), SERVER_TO_CLIENT_IV);

        let fixed = &mut rest[..SEED_FIXED_FIELDS_LENGTH];
        client_to_server.apply_keystream(fixed);

        let magic = u32::from_be_bytes([fixed[0], fixed[1], fixed[2], fixed[3]]);
        if magic != OBFUSCATE_MAGIC_VALUE {
            return Err(ObfuscateError::InvalidMagicValue(magic));
        }

        let padding_length = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]) as usize;
        if padding_length > OBFUSCATE_MAX_PADDING {
            return Err(ObfuscateError::InvalidPaddingLength(padding_length));
        }

        let offset = OBFUSCATE_SEED_LENGTH + SEED_FIXED_FIELDS_LENGTH + padding_length;
        if data.len() < offset {
            return Err(ObfuscateError::SeedMessageTruncated);
        }

        // Advance the keystream past the padding
        client_to_server
            .apply_keystream(&mut data[OBFUSCATE_SEED_LENGTH + SEED_FIXED_FIELDS_LENGTH..offset]);

        let obfuscator = ServerObfuscator {
            client_to_server,
            server_to_client,
        };
        Ok((obfuscator, offset))
    }

    /// Transforms bytes received from the client, in place
    pub fn obfuscate_client_to_server(&mut self, data: &mut [u8]) {
        self.client_to_server.apply_keystream(data);
    }

    /// Transforms bytes sent to the client, in place
    pub fn obfuscate_server_to_client(&mut self, data: &mut [u8]) {
        self.server_to_client.apply_keystream(data);
    }
}

/// Client side of the obfuscation handshake
pub struct ClientObfuscator {
    client_to_server: Rc4<U16>,
    seed_message: Vec<u8>,
}

impl ClientObfuscator {
    /// Generates a fresh seed and the corresponding seed message with up to
    /// `max_padding` bytes of random padding.
    pub fn new(keyword: &str, max_padding: usize) -> ClientObfuscator {
        let mut seed = [0u8; OBFUSCATE_SEED_LENGTH];
        OsRng.fill_bytes(&mut seed);

        let padding_length = OsRng.gen_range(0..=max_padding.min(OBFUSCATE_MAX_PADDING));
        let mut padding = vec![0u8; padding_length];
        OsRng.fill_bytes(&mut padding);

        let mut client_to_server = new_cipher(&seed, keyword.as_bytes(), CLIENT_TO_SERVER_IV);

        let mut seed_message =
            Vec::with_capacity(OBFUSCATE_SEED_LENGTH + SEED_FIXED_FIELDS_LENGTH + padding_length);
        seed_message.extend_from_slice(&seed);
        seed_message.extend_from_slice(&OBFUSCATE_MAGIC_VALUE.to_be_bytes());
        seed_message.extend_from_slice(&(padding_length as u32).to_be_bytes());
        seed_message.extend_from_slice(&padding);
        client_to_server.apply_keystream(&mut seed_message[OBFUSCATE_SEED_LENGTH..]);

        ClientObfuscator {
            client_to_server,
            seed_message,
        }
    }

    /// The seed message to send ahead of any obfuscated payload
    pub fn seed_message(&self) -> &[u8] {
        &self.seed_message
    }

    /// Transforms bytes sent to the server, in place
    pub fn obfuscate_client_to_server(&mut self, data: &mut [u8]) {
        self.client_to_server.apply_keystream(data);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_handshake_roundtrip() {
        let keyword = "test-obfuscation-key";

        let mut client = ClientObfuscator::new(keyword, 64);
        let payload = b"attack at dawn";

        let mut wire = client.seed_message().to_vec();
        let mut obfuscated = payload.to_vec();
        client.obfuscate_client_to_server(&mut obfuscated);
        wire.extend_from_slice(&obfuscated);

        let (mut server, offset) = ServerObfuscator::new(keyword, &mut wire).expect("handshake");
        server.obfuscate_client_to_server(&mut wire[offset..]);
        assert_eq!(&wire[offset..], payload);
    }

    #[test]
    fn test_handshake_empty_padding() {
        let keyword = "k";
        let mut client = ClientObfuscator::new(keyword, 0);
        let mut wire = client.seed_message().to_vec();
        assert_eq!(wire.len(), OBFUSCATE_SEED_LENGTH + SEED_FIXED_FIELDS_LENGTH);
        let (_, offset) = ServerObfuscator::new(keyword, &mut wire).expect("handshake");
        assert_eq!(offset, wire.len());
    }

    #[test]
    fn test_handshake_wrong_keyword() {
        let mut client = ClientObfuscator::new("right", 64);
        let mut wire = client.seed_message().to_vec();
        match ServerObfuscator::new("wrong", &mut wire) {
            Err(ObfuscateError::InvalidMagicValue(..)) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_handshake_truncated() {
        let mut short = vec![0u8; OBFUSCATE_SEED_LENGTH + SEED_FIXED_FIELDS_LENGTH - 1];
        match ServerObfuscator::new("k", &mut short) {
            Err(ObfuscateError::SeedMessageTruncated) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}
