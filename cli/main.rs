use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use sealfs::config::{self, Config, FlagStoreKind};
use sealfs::filesystem::{self, SealFs};
use sealfs::key_manager::{self, KeyManager};
use sealfs::{
    CipherTransform, EncryptedIo, FlagStore, MemoryFlagStore, PathResolver, StreamCipher,
    XattrFlagStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// sealfs - transparent on-access encrypting filesystem
#[derive(Parser)]
#[command(name = "sealfs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "sealfs.json")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a configuration file and create the backing directory
    Init {
        /// Directory holding the sealed files
        #[arg(short, long, default_value = "./backing")]
        backing_dir: String,

        /// Private directory for plaintext working copies
        #[arg(short, long, default_value = "/tmp/sealfs")]
        scratch_dir: String,

        /// File containing the passphrase
        #[arg(short, long)]
        passphrase_file: Option<String>,
    },

    /// Mount the backing directory and serve it until unmounted
    Mount {
        mountpoint: PathBuf,

        /// Let other users access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Decrypt one file of the backing directory to stdout
    Cat {
        /// Path inside the mount, e.g. /docs/report.txt
        path: PathBuf,
    },

    /// Show or set the encryption flag of a file
    Flag {
        /// Path inside the mount
        path: PathBuf,

        /// New flag; only allowed on empty files
        #[arg(long, value_enum)]
        set: Option<FlagValue>,
    },

    /// Show configuration and backing directory statistics
    Status,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FlagValue {
    Encrypted,
    Plaintext,
}

/// Bytes requested per read when decrypting to stdout
const CAT_CHUNK: usize = 256 * 1024;

#[tokio::main]
async fn main() -> Result<()> {
    // Use RUST_LOG to control log level (e.g., RUST_LOG=info,sealfs=debug)
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();
    info!(command = ?cli.command, "sealfs starting");

    match cli.command {
        Commands::Init {
            backing_dir,
            scratch_dir,
            passphrase_file,
        } => cmd_init(&cli.config, backing_dir, scratch_dir, passphrase_file).await,

        Commands::Mount {
            mountpoint,
            allow_other,
        } => cmd_mount(&cli.config, &mountpoint, allow_other).await,

        Commands::Cat { path } => cmd_cat(&cli.config, &path).await,

        Commands::Flag { path, set } => cmd_flag(&cli.config, &path, set).await,

        Commands::Status => cmd_status(&cli.config).await,
    }
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Passphrase from file or environment, else an interactive prompt
async fn load_keys(cfg: &Config) -> Result<KeyManager> {
    let passphrase = match key_manager::resolve_passphrase(cfg).await? {
        Some(passphrase) => passphrase,
        None => tokio::task::spawn_blocking(|| rpassword::prompt_password("Passphrase: "))
            .await?
            .context("reading passphrase")?,
    };
    let params = cfg.kdf;
    let keys = tokio::task::spawn_blocking(move || KeyManager::from_passphrase(passphrase, params))
        .await??;
    Ok(keys)
}

async fn cmd_init(
    config_path: &str,
    backing_dir: String,
    scratch_dir: String,
    passphrase_file: Option<String>,
) -> Result<()> {
    println!("Initializing sealfs...");

    if fs::try_exists(config_path).await.unwrap_or(false) {
        anyhow::bail!(
            "Configuration file '{}' already exists. Remove it first or use a different path.",
            config_path
        );
    }

    let cfg = Config {
        passphrase_file,
        ..Config::new(backing_dir, scratch_dir)
    };
    cfg.validate()?;

    fs::create_dir_all(&cfg.backing_dir)
        .await
        .with_context(|| format!("creating backing directory '{}'", cfg.backing_dir))?;

    let config_json = serde_json::to_string_pretty(&cfg)?;
    fs::write(config_path, config_json)
        .await
        .with_context(|| format!("writing config to '{}'", config_path))?;

    println!("Initialization complete!");
    println!("Config:   {}", config_path);
    println!("Backing:  {}", cfg.backing_dir);
    println!("Scratch:  {}", cfg.scratch_dir);
    println!();
    println!("IMPORTANT: Without the passphrase, sealed files cannot be recovered.");

    Ok(())
}

async fn cmd_mount(config_path: &str, mountpoint: &Path, allow_other: bool) -> Result<()> {
    let cfg = config::Config::load_with_env(Some(config_path))?;
    let keys = load_keys(&cfg).await?;
    let resolver = PathResolver::new(&cfg.backing_dir, &cfg.scratch_dir);

    match cfg.flag_store {
        FlagStoreKind::Xattr => {
            mount_with(&cfg, resolver, keys, XattrFlagStore, mountpoint, allow_other).await
        }
        FlagStoreKind::Memory => {
            mount_with(&cfg, resolver, keys, MemoryFlagStore::new(), mountpoint, allow_other).await
        }
    }
}

async fn mount_with<F: FlagStore>(
    cfg: &Config,
    resolver: PathResolver,
    keys: KeyManager,
    flags: F,
    mountpoint: &Path,
    allow_other: bool,
) -> Result<()> {
    let io = EncryptedIo::new(resolver, StreamCipher::new(keys), flags)
        .with_lock_timeout(cfg.lock_timeout());
    io.prepare()
        .await
        .with_context(|| format!("preparing scratch directory '{}'", cfg.scratch_dir))?;

    let driver = SealFs::new(Arc::new(io), tokio::runtime::Handle::current())
        .with_op_timeout(cfg.op_timeout())
        .with_encrypt_new_files(cfg.encrypt_new_files);

    let mountpoint = mountpoint.to_path_buf();
    println!("Mounting {} at {}", cfg.backing_dir, mountpoint.display());
    tokio::task::spawn_blocking(move || filesystem::mount(driver, &mountpoint, allow_other))
        .await?
        .context("FUSE session failed")?;
    println!("Unmounted.");
    Ok(())
}

async fn cmd_cat(config_path: &str, path: &Path) -> Result<()> {
    let cfg = config::Config::load_with_env(Some(config_path))?;
    let keys = load_keys(&cfg).await?;

    match cfg.flag_store {
        FlagStoreKind::Xattr => cat_with(&cfg, keys, XattrFlagStore, path).await,
        FlagStoreKind::Memory => {
            tracing::debug!("in-memory flags start empty, every file reads as encrypted");
            cat_with(&cfg, keys, MemoryFlagStore::new(), path).await
        }
    }
}

async fn cat_with<F: FlagStore>(cfg: &Config, keys: KeyManager, flags: F, path: &Path) -> Result<()> {
    // Private scratch so a running mount's working copies are left alone
    let scratch = std::env::temp_dir().join(format!("sealfs-cat-{}", uuid::Uuid::new_v4().simple()));
    let io = EncryptedIo::new(
        PathResolver::new(&cfg.backing_dir, &scratch),
        StreamCipher::new(keys),
        flags,
    );
    io.prepare().await?;

    let spinner = create_spinner(&format!("Decrypting {}...", path.display()));
    let result = copy_to_stdout(&io, path).await;
    spinner.finish_and_clear();

    if let Err(e) = fs::remove_dir_all(&scratch).await {
        tracing::warn!(path = %scratch.display(), error = %e, "failed to remove cat scratch");
    }
    let bytes = result?;
    eprintln!("Decrypted {} bytes to stdout", bytes);
    Ok(())
}

async fn copy_to_stdout<F: FlagStore>(io: &EncryptedIo<StreamCipher, F>, path: &Path) -> Result<u64> {
    let mut stdout = tokio::io::stdout();
    let bytes = copy_plaintext(io, path, &mut stdout).await?;
    stdout.flush().await?;
    Ok(bytes)
}

/// Streams the plaintext of `path` into `out` in `CAT_CHUNK` pieces, stopping
/// at the plaintext length so the last read ends the session
async fn copy_plaintext<T, F, W>(io: &EncryptedIo<T, F>, path: &Path, out: &mut W) -> Result<u64>
where
    T: CipherTransform,
    F: FlagStore,
    W: AsyncWrite + Unpin,
{
    let len = io
        .plaintext_len(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let mut offset = 0u64;
    while offset < len {
        let want = (len - offset).min(CAT_CHUNK as u64) as usize;
        let chunk = io
            .read_to_vec(path, want, offset)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        if chunk.is_empty() {
            // Shrunk underneath us
            break;
        }
        out.write_all(&chunk).await?;
        offset += chunk.len() as u64;
    }
    Ok(offset)
}

async fn cmd_flag(config_path: &str, path: &Path, set: Option<FlagValue>) -> Result<()> {
    let cfg = config::Config::load_with_env(Some(config_path))?;
    if matches!(cfg.flag_store, FlagStoreKind::Memory) {
        anyhow::bail!("in-memory flags exist only inside a running mount");
    }
    let resolver = PathResolver::new(&cfg.backing_dir, &cfg.scratch_dir);
    let backing = resolver.resolve_backing(path)?;
    let store = XattrFlagStore;

    let meta = fs::metadata(&backing)
        .await
        .with_context(|| format!("reading metadata for {}", backing.display()))?;

    if let Some(value) = set {
        if meta.len() != 0 {
            anyhow::bail!(
                "{} is not empty; its content was written under the current flag",
                path.display()
            );
        }
        store.set_encrypted(&backing, matches!(value, FlagValue::Encrypted))?;
    }

    let state = if store.is_encrypted(&backing) {
        "encrypted"
    } else {
        "plaintext"
    };
    println!("{}: {}", path.display(), state);
    Ok(())
}

#[derive(Default)]
struct TreeStats {
    files: u64,
    plaintext_files: u64,
    sealed_bytes: u64,
    directories: u64,
    stale_temps: u64,
}

fn walk(dir: &Path, store: &XattrFlagStore, stats: &mut TreeStats) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_dir() {
            stats.directories += 1;
            walk(&path, store, stats)?;
        } else if file_type.is_file() {
            if sealfs::staging::is_sealing_temp(&entry.file_name()) {
                stats.stale_temps += 1;
                continue;
            }
            stats.files += 1;
            stats.sealed_bytes += entry.metadata()?.len();
            if !store.is_encrypted(&path) {
                stats.plaintext_files += 1;
            }
        }
    }
    Ok(())
}

async fn cmd_status(config_path: &str) -> Result<()> {
    let cfg = config::Config::load_with_env(Some(config_path))?;

    println!("sealfs Status");
    println!();
    println!("Configuration:");
    println!("  Config file:     {}", config_path);
    println!("  Backing dir:     {}", cfg.backing_dir);
    println!("  Scratch dir:     {}", cfg.scratch_dir);
    println!("  Flag store:      {:?}", cfg.flag_store);
    println!("  Encrypt new:     {}", cfg.encrypt_new_files);
    println!(
        "  Passphrase:      {}",
        match cfg.passphrase_file {
            Some(ref p) => format!("file {}", p),
            None if std::env::var(key_manager::ENV_PASSPHRASE).is_ok() => {
                format!("${}", key_manager::ENV_PASSPHRASE)
            }
            None => "prompt".to_string(),
        }
    );
    println!();

    if !fs::try_exists(&cfg.backing_dir).await.unwrap_or(false) {
        println!("Backing directory is missing. Run `sealfs init` first.");
        return Ok(());
    }

    let backing = PathBuf::from(&cfg.backing_dir);
    let stats = tokio::task::spawn_blocking(move || {
        let mut stats = TreeStats::default();
        walk(&backing, &XattrFlagStore, &mut stats).map(|_| stats)
    })
    .await?
    .context("scanning backing directory")?;

    println!("Backing Statistics:");
    println!("  Files:             {}", stats.files);
    println!("  Plaintext files:   {}", stats.plaintext_files);
    println!("  Directories:       {}", stats.directories);
    println!(
        "  Stored size:       {} bytes ({:.2} MB)",
        stats.sealed_bytes,
        stats.sealed_bytes as f64 / 1_048_576.0
    );

    if stats.stale_temps > 0 {
        println!();
        println!(
            "WARNING: {} leftover reseal temporary file(s) in the backing directory",
            stats.stale_temps
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sealfs::config::KdfParams;
    use sealfs::Direction;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::io::AsyncRead;

    /// Counts unseals, i.e. how often a file was staged
    struct CountingCipher {
        inner: StreamCipher,
        unseals: Arc<AtomicUsize>,
    }

    impl CipherTransform for CountingCipher {
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
            if direction == Direction::Unseal {
                self.unseals.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.transform(direction, reader, writer).await
        }

        fn plaintext_len(&self, sealed_len: u64) -> Option<u64> {
            self.inner.plaintext_len(sealed_len)
        }
    }

    #[tokio::test]
    async fn cat_stages_once_for_an_exact_multiple_of_the_chunk() {
        let tmp = TempDir::new().unwrap();
        let backing = tmp.path().join("backing");
        std::fs::create_dir_all(&backing).unwrap();
        let params = KdfParams {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        };
        let unseals = Arc::new(AtomicUsize::new(0));
        let io = EncryptedIo::new(
            PathResolver::new(&backing, tmp.path().join("scratch")),
            CountingCipher {
                inner: StreamCipher::new(KeyManager::from_passphrase("cat", params).unwrap()),
                unseals: Arc::clone(&unseals),
            },
            MemoryFlagStore::new(),
        );
        let vpath = Path::new("/big.bin");
        let data: Vec<u8> = (0..2 * CAT_CHUNK).map(|i| (i % 251) as u8).collect();
        io.write(vpath, &data, 0).await.unwrap();
        unseals.store(0, Ordering::SeqCst);

        let mut out = Vec::new();
        let bytes = copy_plaintext(&io, vpath, &mut out).await.unwrap();
        assert_eq!(bytes, data.len() as u64);
        assert_eq!(out, data);
        assert_eq!(unseals.load(Ordering::SeqCst), 1);
        assert!(!io.resolver().resolve_staging(vpath).unwrap().exists());
    }

    #[tokio::test]
    async fn cat_of_an_empty_file_reads_nothing() {
        let tmp = TempDir::new().unwrap();
        let backing = tmp.path().join("backing");
        std::fs::create_dir_all(&backing).unwrap();
        std::fs::write(backing.join("empty"), b"").unwrap();
        let params = KdfParams {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        };
        let flags = MemoryFlagStore::new();
        flags.set_encrypted(&backing.join("empty"), false).unwrap();
        let io = EncryptedIo::new(
            PathResolver::new(&backing, tmp.path().join("scratch")),
            StreamCipher::new(KeyManager::from_passphrase("cat", params).unwrap()),
            flags,
        );

        let mut out = Vec::new();
        assert_eq!(copy_plaintext(&io, Path::new("/empty"), &mut out).await.unwrap(), 0);
        assert!(out.is_empty());
    }
}
