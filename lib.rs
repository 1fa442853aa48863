//! # sealfs - On-access Encrypting Filesystem
//!
//! sealfs presents a tree of plaintext files through FUSE while keeping their
//! contents sealed with XChaCha20-Poly1305 in a backing directory.
//!
//! ## Features
//!
//! - **Per-file flag**: `user.encrypted` xattr; only `"0"` marks plaintext
//! - **Staged I/O**: offset reads and writes run against a plaintext working
//!   copy in a private scratch area
//! - **Atomic reseal**: every write replaces the backing file by rename
//! - **Per-path locking**: sessions on one file are serialized
//! - **Argon2id keys**: one passphrase per mount, zeroized on drop
//!
//! ## Quick Start
//!
//! ```no_run
//! use sealfs::{config::KdfParams, EncryptedIo, KeyManager, MemoryFlagStore, PathResolver, StreamCipher};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let keys = KeyManager::from_passphrase("correct horse", KdfParams::default())?;
//!     let io = EncryptedIo::new(
//!         PathResolver::new("./backing", "/tmp/sealfs"),
//!         StreamCipher::new(keys),
//!         MemoryFlagStore::new(),
//!     );
//!     io.prepare().await?;
//!
//!     io.write(Path::new("/notes.txt"), b"sensitive data", 0).await?;
//!     let data = io.read_to_vec(Path::new("/notes.txt"), 64, 0).await?;
//!     assert_eq!(data, b"sensitive data");
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod encrypted_io;
pub mod error;
pub mod filesystem;
pub mod flags;
pub mod inode;
pub mod key_manager;
pub mod locks;
pub mod paths;
pub mod staging;
pub mod streaming;
pub mod xattr;

// Re-export common types for convenience
pub use encrypted_io::EncryptedIo;
pub use error::{Result, SealFsError};
pub use flags::{FlagStore, MemoryFlagStore, XattrFlagStore};
pub use key_manager::KeyManager;
pub use paths::PathResolver;
pub use streaming::{CipherTransform, Direction, StreamCipher};
