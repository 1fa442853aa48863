//! Whole-stream seal/unseal transform.
//!
//! This module defines the [`CipherTransform`] contract the encrypted I/O path
//! consumes and [`StreamCipher`], the chunked XChaCha20-Poly1305 implementation.
//!
//! ## Sealed Format
//!
//! ```text
//! [version:1][salt:16][chunk1][chunk2]...
//!
//! Each chunk:
//! [nonce:24][length:4][encrypted_data]
//! ```
//!
//! Every chunk except the last carries exactly [`CHUNK_SIZE`] bytes of
//! plaintext, so the plaintext length follows from the sealed length alone.
//! Chunk `i` is authenticated with `i` (u64 BE) as associated data.
//! An empty input unseals to an empty output.

use crate::error::{Result, SealFsError};
use crate::key_manager::{KeyManager, SALT_LEN};
use chacha20poly1305::aead::{Aead, AeadCore, OsRng, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use std::future::Future;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Plaintext bytes per chunk (64KB)
pub const CHUNK_SIZE: usize = 64 * 1024;

pub const VERSION_V1_SEALED: u8 = 1;

const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;
const HEADER_LEN: u64 = 1 + SALT_LEN as u64;
const CHUNK_OVERHEAD: u64 = (NONCE_LEN + 4 + TAG_LEN) as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Seal,
    Unseal,
}

/// A whole-stream cipher: consumes `reader` to EOF and writes the complete
/// transformed output to `writer`. No offset or partial API.
pub trait CipherTransform: Send + Sync + 'static {
    /// Returns the number of plaintext bytes processed
    fn transform<R, W>(
        &self,
        direction: Direction,
        reader: &mut R,
        writer: &mut W,
    ) -> impl Future<Output = Result<u64>> + Send
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send;

    /// Plaintext length of a sealed stream of `sealed_len` bytes, or `None`
    /// when no valid stream has that length
    fn plaintext_len(&self, sealed_len: u64) -> Option<u64>;
}

/// Chunked AEAD stream cipher keyed by the process passphrase
pub struct StreamCipher {
    keys: KeyManager,
}

impl StreamCipher {
    pub fn new(keys: KeyManager) -> Self {
        Self { keys }
    }

    async fn seal<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let cipher = self.keys.session_cipher();

        writer.write_u8(VERSION_V1_SEALED).await?;
        writer.write_all(&self.keys.session_salt()).await?;

        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut total_bytes = 0u64;
        let mut index = 0u64;

        loop {
            let n = read_full(reader, &mut buffer).await?;
            if n == 0 {
                break;
            }

            let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
            let aad = index.to_be_bytes();
            let ciphertext = cipher
                .encrypt(
                    &nonce,
                    Payload {
                        msg: &buffer[..n],
                        aad: &aad,
                    },
                )
                .map_err(|e| SealFsError::transform(format!("encryption failed: {}", e)))?;

            writer.write_all(&nonce).await?;
            writer.write_u32(ciphertext.len() as u32).await?;
            writer.write_all(&ciphertext).await?;

            total_bytes += n as u64;
            index += 1;

            if n < CHUNK_SIZE {
                break;
            }
        }

        writer.flush().await?;
        Ok(total_bytes)
    }

    async fn unseal<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let mut version = [0u8; 1];
        if read_full(reader, &mut version).await? == 0 {
            // Freshly created backing file: no content yet
            writer.flush().await?;
            return Ok(0);
        }
        if version[0] != VERSION_V1_SEALED {
            return Err(SealFsError::transform(format!(
                "unsupported sealed format version: {}",
                version[0]
            )));
        }

        let mut salt = [0u8; SALT_LEN];
        read_exact_or_corrupt(reader, &mut salt, "salt").await?;
        let cipher = self.keys.cipher_for_salt(&salt)?;

        let mut total_bytes = 0u64;
        let mut index = 0u64;
        let mut nonce_buf = [0u8; NONCE_LEN];
        let max_chunk = (CHUNK_SIZE + TAG_LEN) as u32;

        loop {
            let n = read_full(reader, &mut nonce_buf).await?;
            if n == 0 {
                break;
            }
            if n < NONCE_LEN {
                return Err(SealFsError::transform("truncated chunk nonce"));
            }

            #[allow(deprecated)]
            let nonce = XNonce::from_slice(&nonce_buf);

            let mut len_buf = [0u8; 4];
            read_exact_or_corrupt(reader, &mut len_buf, "chunk length").await?;
            let chunk_len = u32::from_be_bytes(len_buf);
            if chunk_len < TAG_LEN as u32 || chunk_len > max_chunk {
                return Err(SealFsError::transform(format!(
                    "corrupt chunk length {} at chunk {}",
                    chunk_len, index
                )));
            }

            let mut ciphertext = vec![0u8; chunk_len as usize];
            read_exact_or_corrupt(reader, &mut ciphertext, "chunk body").await?;

            let aad = index.to_be_bytes();
            let plaintext = cipher
                .decrypt(
                    nonce,
                    Payload {
                        msg: &ciphertext,
                        aad: &aad,
                    },
                )
                .map_err(|e| {
                    SealFsError::transform(format!("decryption failed at chunk {}: {}", index, e))
                })?;

            writer.write_all(&plaintext).await?;
            total_bytes += plaintext.len() as u64;
            index += 1;
        }

        writer.flush().await?;
        Ok(total_bytes)
    }
}

impl CipherTransform for StreamCipher {
    async fn transform<R, W>(
        &self,
        direction: Direction,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        match direction {
            Direction::Seal => self.seal(reader, writer).await,
            Direction::Unseal => self.unseal(reader, writer).await,
        }
    }

    fn plaintext_len(&self, sealed_len: u64) -> Option<u64> {
        sealed_plaintext_len(sealed_len)
    }
}

/// Plaintext length implied by the chunk layout
pub fn sealed_plaintext_len(sealed_len: u64) -> Option<u64> {
    if sealed_len == 0 {
        return Some(0);
    }
    let body = sealed_len.checked_sub(HEADER_LEN)?;
    let full_chunk = CHUNK_SIZE as u64 + CHUNK_OVERHEAD;
    let full = body / full_chunk;
    let rem = body % full_chunk;
    let tail = match rem {
        0 => 0,
        r if r > CHUNK_OVERHEAD => r - CHUNK_OVERHEAD,
        _ => return None,
    };
    Some(full * CHUNK_SIZE as u64 + tail)
}

/// Reads until `buf` is full or EOF; returns bytes read
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn read_exact_or_corrupt<R>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(SealFsError::transform(format!("truncated {}", what)))
        }
        Err(e) => Err(e.into()),
    }
}
