//! Cache key derivation.
//!
//! Keys are the hex SHA-256 of a length-prefixed canonical encoding of
//! (model, messages, generation parameters). Length prefixes make field
//! boundaries unambiguous, so `["ab", "c"]` and `["a", "bc"]` never collide
//! by construction. The digest is stable across processes and builds, which
//! the durable tier depends on.
//!
//! An optional deployment salt is hashed ahead of everything else so that a
//! leaked key cannot be checked against guessed prompts without the salt.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::types::{GenerationParams, Message};

/// Characters of the digest shown in logs.
const DISPLAY_LEN: usize = 16;

/// Bumped whenever the canonical encoding changes.
const KEY_VERSION: &[u8] = b"chatrelay.v1";

/// A fixed-length cache key (64 lowercase hex characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Full hex digest. This is what every lookup uses.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Truncated form for logs only.
    pub fn short(&self) -> &str {
        &self.0[..DISPLAY_LEN]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}

/// Derives [`CacheKey`]s, optionally mixing in a deployment secret.
#[derive(Clone, Default)]
pub struct CacheKeyGenerator {
    salt: Option<Vec<u8>>,
}

impl fmt::Debug for CacheKeyGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheKeyGenerator")
            .field("salted", &self.salt.is_some())
            .finish()
    }
}

impl CacheKeyGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mix a deployment-wide secret into every key.
    pub fn with_salt(salt: impl AsRef<[u8]>) -> Self {
        Self {
            salt: Some(salt.as_ref().to_vec()),
        }
    }

    /// Compute the key for a request.
    pub fn key(&self, model: &str, messages: &[Message], params: &GenerationParams) -> CacheKey {
        let mut hasher = Sha256::new();
        hasher.update(KEY_VERSION);
        if let Some(salt) = &self.salt {
            write_field(&mut hasher, salt);
        }

        write_field(&mut hasher, model.as_bytes());

        hasher.update((messages.len() as u64).to_be_bytes());
        for message in messages {
            write_field(&mut hasher, message.role.as_str().as_bytes());
            write_field(&mut hasher, message.content.as_bytes());
        }

        write_opt(&mut hasher, params.temperature.map(f64::to_bits));
        write_opt(&mut hasher, params.top_p.map(f64::to_bits));
        write_opt(&mut hasher, params.max_tokens.map(u64::from));

        CacheKey(hex::encode(hasher.finalize()))
    }
}

fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

fn write_opt(hasher: &mut Sha256, value: Option<u64>) {
    match value {
        Some(v) => {
            hasher.update([1u8]);
            hasher.update(v.to_be_bytes());
        }
        None => hasher.update([0u8]),
    }
}
