use anyhow::Result;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use sealfs::bridge::{self, BridgeStats};
use sealfs::config::KdfParams;
use sealfs::{
    CipherTransform, Direction, EncryptedIo, FlagStore, KeyManager, MemoryFlagStore, PathResolver,
    SealFsError, StreamCipher,
};

/// Cheap Argon2 parameters so tests stay fast
fn test_params() -> KdfParams {
    KdfParams {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    }
}

fn keys(passphrase: &str) -> KeyManager {
    KeyManager::from_passphrase(passphrase, test_params()).unwrap()
}

/// Delegates to a real cipher but fails every seal while `fail` is set
struct FailingSeal {
    inner: StreamCipher,
    fail: Arc<AtomicBool>,
}

impl CipherTransform for FailingSeal {
    async fn transform<R, W>(
        &self,
        direction: Direction,
        reader: &mut R,
        writer: &mut W,
    ) -> sealfs::Result<u64>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        if direction == Direction::Seal && self.fail.load(Ordering::SeqCst) {
            // Leave partial output behind, as a crash mid-seal would
            writer.write_all(b"partial").await?;
            writer.flush().await?;
            return Err(SealFsError::transform("injected seal failure"));
        }
        self.inner.transform(direction, reader, writer).await
    }

    fn plaintext_len(&self, sealed_len: u64) -> Option<u64> {
        self.inner.plaintext_len(sealed_len)
    }
}

/// Stalls every seal after writing a little output, so a deadline can cut it off
struct SlowSeal {
    inner: StreamCipher,
    stall: Duration,
}

impl CipherTransform for SlowSeal {
    async fn transform<R, W>(
        &self,
        direction: Direction,
        reader: &mut R,
        writer: &mut W,
    ) -> sealfs::Result<u64>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        if direction == Direction::Seal {
            writer.write_all(b"partial").await?;
            writer.flush().await?;
            tokio::time::sleep(self.stall).await;
        }
        self.inner.transform(direction, reader, writer).await
    }

    fn plaintext_len(&self, sealed_len: u64) -> Option<u64> {
        self.inner.plaintext_len(sealed_len)
    }
}

struct TestEnv {
    tmp: TempDir,
    io: Arc<EncryptedIo<StreamCipher, MemoryFlagStore>>,
}

impl TestEnv {
    fn backing_dir(&self) -> std::path::PathBuf {
        self.tmp.path().join("backing")
    }

    fn backing(&self, vpath: &str) -> std::path::PathBuf {
        self.io.resolver().resolve_backing(Path::new(vpath)).unwrap()
    }

    fn staging(&self, vpath: &str) -> std::path::PathBuf {
        self.io.resolver().resolve_staging(Path::new(vpath)).unwrap()
    }
}

/// Helper to create a test environment with a fresh backing and scratch area
async fn setup_test_env() -> Result<TestEnv> {
    let tmp = TempDir::new()?;
    let backing = tmp.path().join("backing");
    fs::create_dir_all(&backing)?;

    let io = EncryptedIo::new(
        PathResolver::new(&backing, tmp.path().join("scratch")),
        StreamCipher::new(keys("integration passphrase")),
        MemoryFlagStore::new(),
    );
    io.prepare().await?;
    Ok(TestEnv {
        tmp,
        io: Arc::new(io),
    })
}

fn sealing_temps(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".sealing"))
        .collect()
}

#[tokio::test]
async fn write_then_read_roundtrip() -> Result<()> {
    let env = setup_test_env().await?;
    let data = b"integration secret";

    let written = env.io.write(Path::new("/it.txt"), data, 0).await?;
    assert_eq!(written, data.len());

    let out = env.io.read_to_vec(Path::new("/it.txt"), 64, 0).await?;
    assert_eq!(out, data);
    Ok(())
}

#[tokio::test]
async fn scenario_a_new_encrypted_file() -> Result<()> {
    let env = setup_test_env().await?;
    let vpath = Path::new("/hello.txt");

    env.io.write(vpath, b"hello", 0).await?;

    let raw = fs::read(env.backing("/hello.txt"))?;
    assert_ne!(raw, b"hello");
    assert!(!raw.windows(5).any(|w| w == b"hello"));

    assert_eq!(env.io.read_to_vec(vpath, 5, 0).await?, b"hello");
    Ok(())
}

#[tokio::test]
async fn scenario_b_sequential_writes_compose() -> Result<()> {
    let env = setup_test_env().await?;
    let vpath = Path::new("/ab.txt");

    env.io.write(vpath, b"AB", 0).await?;
    env.io.write(vpath, b"CD", 2).await?;

    assert_eq!(env.io.read_to_vec(vpath, 4, 0).await?, b"ABCD");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_c_concurrent_disjoint_writers() -> Result<()> {
    let env = setup_test_env().await?;
    let vpath = Path::new("/shared.bin");

    let mut handles = Vec::new();
    for i in 0..8u8 {
        let io = Arc::clone(&env.io);
        handles.push(tokio::spawn(async move {
            let block = [b'a' + i; 4];
            io.write(Path::new("/shared.bin"), &block, u64::from(i) * 4).await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await??, 4);
    }

    let out = env.io.read_to_vec(vpath, 64, 0).await?;
    let expected: Vec<u8> = (0..8u8).flat_map(|i| [b'a' + i; 4]).collect();
    assert_eq!(out, expected);
    assert_eq!(env.io.locks().active(), 0);
    Ok(())
}

#[tokio::test]
async fn scenario_d_plaintext_flag_stores_raw_bytes() -> Result<()> {
    let env = setup_test_env().await?;
    let backing = env.backing("/plain.txt");
    fs::write(&backing, b"")?;
    env.io.stager().flags().set_encrypted(&backing, false)?;

    env.io.write(Path::new("/plain.txt"), b"visible text", 0).await?;

    assert_eq!(fs::read(&backing)?, b"visible text");
    assert_eq!(
        env.io.read_to_vec(Path::new("/plain.txt"), 64, 0).await?,
        b"visible text"
    );
    Ok(())
}

#[tokio::test]
async fn staging_is_idempotent() -> Result<()> {
    let env = setup_test_env().await?;
    let vpath = Path::new("/idem.txt");
    env.io.write(vpath, b"same content twice", 0).await?;

    env.io.stager().ensure_staged(vpath).await?;
    let first = fs::read(env.staging("/idem.txt"))?;
    env.io.stager().ensure_staged(vpath).await?;
    let second = fs::read(env.staging("/idem.txt"))?;

    assert_eq!(first, b"same content twice");
    assert_eq!(first, second);
    Ok(())
}

#[tokio::test]
async fn successful_write_leaves_no_staging() -> Result<()> {
    let env = setup_test_env().await?;
    env.io.write(Path::new("/docs/nested.txt"), b"payload", 0).await?;

    assert!(!env.staging("/docs/nested.txt").exists());
    assert!(sealing_temps(&env.backing_dir()).is_empty());
    Ok(())
}

#[tokio::test]
async fn failed_seal_keeps_backing_intact() -> Result<()> {
    let tmp = TempDir::new()?;
    let backing_dir = tmp.path().join("backing");
    fs::create_dir_all(&backing_dir)?;

    let fail = Arc::new(AtomicBool::new(false));
    let io = EncryptedIo::new(
        PathResolver::new(&backing_dir, tmp.path().join("scratch")),
        FailingSeal {
            inner: StreamCipher::new(keys("integration passphrase")),
            fail: Arc::clone(&fail),
        },
        MemoryFlagStore::new(),
    );
    let vpath = Path::new("/victim.txt");

    io.write(vpath, b"original", 0).await?;
    let before = fs::read(backing_dir.join("victim.txt"))?;

    fail.store(true, Ordering::SeqCst);
    let err = io.write(vpath, b"XX", 0).await.unwrap_err();
    assert!(matches!(err, SealFsError::Transform(_)));

    assert_eq!(fs::read(backing_dir.join("victim.txt"))?, before);
    assert!(!io.resolver().resolve_staging(vpath)?.exists());
    assert!(sealing_temps(&backing_dir).is_empty());

    fail.store(false, Ordering::SeqCst);
    assert_eq!(io.read_to_vec(vpath, 64, 0).await?, b"original");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timed_out_seal_leaves_no_temp() -> Result<()> {
    let tmp = TempDir::new()?;
    let backing_dir = tmp.path().join("backing");
    fs::create_dir_all(&backing_dir)?;

    let io = Arc::new(EncryptedIo::new(
        PathResolver::new(&backing_dir, tmp.path().join("scratch")),
        SlowSeal {
            inner: StreamCipher::new(keys("integration passphrase")),
            stall: Duration::from_secs(5),
        },
        MemoryFlagStore::new(),
    ));

    let handle = tokio::runtime::Handle::current();
    let stats = Arc::new(BridgeStats::default());
    let (bridged_io, bridged_stats) = (Arc::clone(&io), Arc::clone(&stats));
    let result = tokio::task::spawn_blocking(move || {
        bridge::execute(&handle, Duration::from_millis(500), &bridged_stats, async move {
            bridged_io.write(Path::new("/f"), b"hello", 0).await
        })
    })
    .await?;

    assert!(matches!(result, Err(SealFsError::TimedOut(_))));
    assert_eq!(stats.snapshot().2, 1);
    assert!(sealing_temps(&backing_dir).is_empty());
    assert!(!io.resolver().resolve_staging(Path::new("/f"))?.exists());
    assert_eq!(io.locks().active(), 0);
    Ok(())
}

#[tokio::test]
async fn prepare_sweeps_interrupted_reseals() -> Result<()> {
    let env = setup_test_env().await?;
    fs::create_dir_all(env.backing_dir().join("dir"))?;
    fs::write(env.backing_dir().join("dir/.gone.txt.0f0f.sealing"), b"partial")?;
    fs::write(env.backing_dir().join("dir/kept.txt"), b"")?;

    env.io.prepare().await?;
    assert!(sealing_temps(&env.backing_dir().join("dir")).is_empty());
    assert!(env.backing_dir().join("dir/kept.txt").exists());
    Ok(())
}

#[tokio::test]
async fn partial_read_boundary() -> Result<()> {
    let env = setup_test_env().await?;
    let vpath = Path::new("/ten.txt");
    env.io.write(vpath, b"0123456789", 0).await?;

    assert_eq!(env.io.read_to_vec(vpath, 6, 0).await?, b"012345");
    assert!(env.staging("/ten.txt").exists());

    // Request runs past the end: short read, session over
    assert_eq!(env.io.read_to_vec(vpath, 6, 6).await?, b"6789");
    assert!(!env.staging("/ten.txt").exists());
    Ok(())
}

#[tokio::test]
async fn lock_contention_is_reported() -> Result<()> {
    let tmp = TempDir::new()?;
    let backing_dir = tmp.path().join("backing");
    fs::create_dir_all(&backing_dir)?;

    let io = EncryptedIo::new(
        PathResolver::new(&backing_dir, tmp.path().join("scratch")),
        StreamCipher::new(keys("integration passphrase")),
        MemoryFlagStore::new(),
    )
    .with_lock_timeout(Some(Duration::from_millis(50)));

    let backing = io.resolver().resolve_backing(Path::new("/busy"))?;
    let held = io.locks().try_acquire(&backing)?;

    let err = io.write(Path::new("/busy"), b"x", 0).await.unwrap_err();
    assert!(matches!(err, SealFsError::LockContention(_)));
    assert!(err.is_retryable());
    assert_eq!(err.to_errno(), libc::EAGAIN);

    drop(held);
    io.write(Path::new("/busy"), b"x", 0).await?;
    Ok(())
}

#[tokio::test]
async fn overlong_paths_fail_cleanly() -> Result<()> {
    let env = setup_test_env().await?;
    let long = format!("/{}", "n".repeat(sealfs::paths::PATH_MAX));

    let err = env.io.write(Path::new(&long), b"x", 0).await.unwrap_err();
    assert!(matches!(err, SealFsError::PathTooLong { .. }));
    assert_eq!(err.to_errno(), libc::ENAMETOOLONG);
    Ok(())
}

#[tokio::test]
async fn missing_file_reads_as_empty() -> Result<()> {
    let env = setup_test_env().await?;

    let out = env.io.read_to_vec(Path::new("/never-written"), 16, 0).await?;
    assert!(out.is_empty());
    assert!(!env.staging("/never-written").exists());

    let err = env.io.plaintext_len(Path::new("/never-written")).await.unwrap_err();
    assert!(matches!(err, SealFsError::NotFound(_)));
    Ok(())
}

#[tokio::test]
async fn plaintext_len_matches_written_length() -> Result<()> {
    let env = setup_test_env().await?;
    let vpath = Path::new("/big.bin");
    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

    env.io.write(vpath, &data, 0).await?;
    assert_eq!(env.io.plaintext_len(vpath).await?, data.len() as u64);

    env.io.truncate(vpath, 100).await?;
    assert_eq!(env.io.plaintext_len(vpath).await?, 100);
    assert_eq!(env.io.read_to_vec(vpath, 200, 0).await?, &data[..100]);
    Ok(())
}

#[tokio::test]
async fn files_survive_a_new_session() -> Result<()> {
    let env = setup_test_env().await?;
    env.io.write(Path::new("/persist.txt"), b"across mounts", 0).await?;

    // Same passphrase, new process-wide salt
    let later = EncryptedIo::new(
        PathResolver::new(env.backing_dir(), env.tmp.path().join("scratch2")),
        StreamCipher::new(keys("integration passphrase")),
        MemoryFlagStore::new(),
    );
    assert_eq!(
        later.read_to_vec(Path::new("/persist.txt"), 64, 0).await?,
        b"across mounts"
    );
    Ok(())
}

#[tokio::test]
async fn wrong_passphrase_is_a_transform_failure() -> Result<()> {
    let env = setup_test_env().await?;
    env.io.write(Path::new("/locked.txt"), b"secret", 0).await?;

    let intruder = EncryptedIo::new(
        PathResolver::new(env.backing_dir(), env.tmp.path().join("scratch2")),
        StreamCipher::new(keys("not the passphrase")),
        MemoryFlagStore::new(),
    );
    let err = intruder
        .read_to_vec(Path::new("/locked.txt"), 64, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, SealFsError::Transform(_)));
    assert_eq!(err.to_errno(), libc::EIO);

    let staging = intruder.resolver().resolve_staging(Path::new("/locked.txt"))?;
    assert!(!staging.exists(), "failed unseal leaves no plaintext behind");
    Ok(())
}

#[tokio::test]
async fn prepare_purges_stale_working_copies() -> Result<()> {
    let env = setup_test_env().await?;
    let stale = env.staging("/old/leftover.txt");
    fs::create_dir_all(stale.parent().unwrap())?;
    fs::write(&stale, b"plaintext from a crashed run")?;

    env.io.prepare().await?;
    assert!(!stale.exists());

    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(env.io.resolver().scratch_root())?.permissions().mode();
    assert_eq!(mode & 0o777, 0o700);
    Ok(())
}
