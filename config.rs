//! Configuration management with environment variable support.
//!
//! This module provides [`Config`] for loading and validating mount settings
//! from JSON files and environment variables.
//!
//! ## Environment Variables
//!
//! - `SEALFS_BACKING_DIR`: Override the backing (ciphertext) directory
//! - `SEALFS_SCRATCH_DIR`: Override the scratch (staging) directory
//! - `SEALFS_PASSPHRASE_FILE`: Override the passphrase file path
//! - `SEALFS_CONFIG`: Override config file path

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Environment variable names for configuration overrides
pub const ENV_BACKING_DIR: &str = "SEALFS_BACKING_DIR";
pub const ENV_SCRATCH_DIR: &str = "SEALFS_SCRATCH_DIR";
pub const ENV_PASSPHRASE_FILE: &str = "SEALFS_PASSPHRASE_FILE";
pub const ENV_CONFIG_PATH: &str = "SEALFS_CONFIG";

/// Argon2id cost parameters for passphrase key derivation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Where per-file encryption flags live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagStoreKind {
    /// `user.encrypted` extended attribute on the backing file
    #[default]
    Xattr,
    /// Process-local map; every file not explicitly marked is encrypted
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backing_dir: String,
    pub scratch_dir: String,
    pub passphrase_file: Option<String>,
    pub encrypt_new_files: bool,
    pub flag_store: FlagStoreKind,
    pub lock_timeout_ms: Option<u64>,
    pub op_timeout_secs: u64,
    pub kdf: KdfParams,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backing_dir: "./backing".to_string(),
            scratch_dir: "/tmp/sealfs".to_string(),
            passphrase_file: None,
            encrypt_new_files: true,
            flag_store: FlagStoreKind::Xattr,
            lock_timeout_ms: None,
            op_timeout_secs: 300,
            kdf: KdfParams::default(),
        }
    }
}

impl Config {
    /// Load config with environment variable overrides
    /// Priority: ENV vars > config file > defaults
    pub fn load_with_env(path: Option<&str>) -> Result<Self> {
        let config_path = path
            .map(String::from)
            .or_else(|| env::var(ENV_CONFIG_PATH).ok());

        let mut config = match config_path {
            Some(ref p) if Path::new(p).exists() => {
                info!(path = p, "loading config from file");
                let s = fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p))?;
                serde_json::from_str(&s)?
            }
            _ => {
                debug!("using default configuration");
                Config::default()
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(backing_dir) = env::var(ENV_BACKING_DIR) {
            debug!(backing_dir = %backing_dir, "overriding backing_dir from environment");
            self.backing_dir = backing_dir;
        }

        if let Ok(scratch_dir) = env::var(ENV_SCRATCH_DIR) {
            debug!(scratch_dir = %scratch_dir, "overriding scratch_dir from environment");
            self.scratch_dir = scratch_dir;
        }

        if let Ok(passphrase_file) = env::var(ENV_PASSPHRASE_FILE) {
            debug!(passphrase_file = %passphrase_file, "overriding passphrase_file from environment");
            self.passphrase_file = Some(passphrase_file);
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.backing_dir.trim().is_empty() {
            anyhow::bail!("backing_dir cannot be empty");
        }

        if self.scratch_dir.trim().is_empty() {
            anyhow::bail!("scratch_dir cannot be empty");
        }

        // Plaintext working copies must never land inside the ciphertext tree
        let backing = absolutize(&self.backing_dir);
        let scratch = absolutize(&self.scratch_dir);
        if scratch.starts_with(&backing) {
            anyhow::bail!(
                "scratch_dir {} must not be inside backing_dir {}",
                scratch.display(),
                backing.display()
            );
        }
        if backing.starts_with(&scratch) {
            anyhow::bail!(
                "backing_dir {} must not be inside scratch_dir {}",
                backing.display(),
                scratch.display()
            );
        }

        if self.op_timeout_secs == 0 {
            anyhow::bail!("op_timeout_secs must be greater than zero");
        }

        argon2::Params::new(
            self.kdf.memory_kib,
            self.kdf.iterations,
            self.kdf.parallelism,
            None,
        )
        .map_err(|e| anyhow::anyhow!("invalid kdf parameters: {}", e))?;

        if scratch.starts_with("/tmp") {
            debug!(
                scratch_dir = %scratch.display(),
                "staging plaintext under /tmp; files are created with mode 0600"
            );
        }

        if let Some(ref passphrase_file) = self.passphrase_file {
            if passphrase_file.contains("..") {
                warn!("passphrase_file contains '..' - consider using absolute paths");
            }
        }

        Ok(())
    }

    /// Create a new config with explicit directories and defaults elsewhere
    pub fn new(backing_dir: impl Into<String>, scratch_dir: impl Into<String>) -> Self {
        Self {
            backing_dir: backing_dir.into(),
            scratch_dir: scratch_dir.into(),
            ..Self::default()
        }
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }
}

fn absolutize(path: &str) -> PathBuf {
    let path = Path::new(path);
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    // Lexical normalization only; the directories may not exist yet
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
