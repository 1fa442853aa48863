//! Passphrase handling and Argon2id key derivation.
//!
//! This module provides [`KeyManager`], which holds the single process-wide
//! passphrase and turns it into 256-bit XChaCha20-Poly1305 keys.
//!
//! ## Key schedule
//!
//! - Every sealed stream carries a 16-byte salt in its header
//! - The key for a stream is `Argon2id(passphrase, salt)`
//! - Streams sealed by this process reuse one session salt, derived once
//! - Keys for foreign salts are derived on first use and cached
//!
//! Passphrase and keys are zeroized on drop.

use crate::config::{Config, KdfParams};
use crate::error::{Result, SealFsError};
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305};
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use std::collections::HashMap;
use std::env;
use tokio::fs;
use tracing::{debug, info};
use zeroize::Zeroizing;

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;

/// Environment variable holding the passphrase when no file is configured
pub const ENV_PASSPHRASE: &str = "SEALFS_PASSPHRASE";

/// Foreign-salt keys kept before the cache is reset
const MAX_CACHED_KEYS: usize = 256;

type DerivedKey = Zeroizing<[u8; KEY_LEN]>;

pub struct KeyManager {
    passphrase: Zeroizing<String>,
    params: KdfParams,
    session_salt: [u8; SALT_LEN],
    session_key: DerivedKey,
    cache: Mutex<HashMap<[u8; SALT_LEN], DerivedKey>>,
}

impl KeyManager {
    pub fn from_passphrase(passphrase: impl Into<String>, params: KdfParams) -> Result<Self> {
        let passphrase = Zeroizing::new(passphrase.into());
        if passphrase.is_empty() {
            return Err(SealFsError::key("passphrase cannot be empty"));
        }

        let mut session_salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut session_salt);
        let session_key = derive(&passphrase, &session_salt, &params)?;
        info!(
            memory_kib = params.memory_kib,
            iterations = params.iterations,
            "derived session key"
        );

        Ok(Self {
            passphrase,
            params,
            session_salt,
            session_key,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Salt written into streams sealed by this process
    pub fn session_salt(&self) -> [u8; SALT_LEN] {
        self.session_salt
    }

    pub fn session_cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(self.session_key.as_ref()))
    }

    /// Cipher for a stream sealed under `salt`, deriving the key if needed
    pub fn cipher_for_salt(&self, salt: &[u8; SALT_LEN]) -> Result<XChaCha20Poly1305> {
        if *salt == self.session_salt {
            return Ok(self.session_cipher());
        }

        if let Some(key) = self.cache.lock().get(salt) {
            return Ok(XChaCha20Poly1305::new(Key::from_slice(key.as_ref())));
        }

        debug!("deriving key for foreign salt");
        let key = derive(&self.passphrase, salt, &self.params)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_ref()));

        let mut cache = self.cache.lock();
        if cache.len() >= MAX_CACHED_KEYS {
            cache.clear();
        }
        cache.insert(*salt, key);
        Ok(cipher)
    }
}

/// Passphrase from `cfg.passphrase_file`, else `SEALFS_PASSPHRASE`.
/// `None` when neither is set, so callers may prompt.
pub async fn resolve_passphrase(cfg: &Config) -> anyhow::Result<Option<String>> {
    use anyhow::Context;

    if let Some(ref path) = cfg.passphrase_file {
        info!(path = %path, "loading passphrase from file");
        let raw = Zeroizing::new(
            fs::read_to_string(path)
                .await
                .with_context(|| format!("reading passphrase from {}", path))?,
        );
        let trimmed = raw.trim_end_matches(['\n', '\r']);
        return Ok(Some(trimmed.to_string()));
    }

    Ok(env::var(ENV_PASSPHRASE).ok())
}

fn derive(passphrase: &str, salt: &[u8; SALT_LEN], params: &KdfParams) -> Result<DerivedKey> {
    let params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| SealFsError::key(format!("invalid Argon2 parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, key.as_mut())
        .map_err(|e| SealFsError::key(format!("key derivation failed: {}", e)))?;
    Ok(key)
}
