//! zkd: zero-knowledge storage client
//!
//! Commands:
//!   keygen                        - create the passphrase-sealed keyring
//!   upload <file>                 - encrypt, chunk and upload a file
//!   cat <object-id> [--range a-b] - decrypt an object (or a byte range) to stdout or a file
//!   info <object-id>              - verified object metadata and chunk layout
//!   queue status|replay|watch     - inspect or drain the offline write queue
//!   config show                   - print the active configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use zkd_chunks::{hash_bytes, hash_file_streaming, hash_to_hex, ProcessorPool};
use zkd_core::config::ZkdConfig;
use zkd_core::types::ConflictResolution;
use zkd_crypto::{EncryptedKeyring, KdfParams, KeyManager};
use zkd_storage::{BlobTransport, HttpObjectApi, HttpTransport, ObjectApi, OperatorTransport, TransferScheduler};
use zkd_sync::{
    ApiQueueExecutor, ChunkSource, DownloadSessionManager, FileSource, FixedResolver, JsonFileQueueStore,
    OfflineSyncQueue, ProgressFn, ResumeToken, RetryPolicy, UploadControl, UploadOptions, UploadOutcome,
    UploadSessionCoordinator,
};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "zkd",
    version,
    about = "Zero-knowledge storage client",
    long_about = "zkd: end-to-end encrypted chunked upload, decrypting range reads and offline write replay"
)]
struct Cli {
    /// Path to zkd.toml configuration file
    #[arg(long, short = 'c', env = "ZKD_CONFIG", default_value = "~/.config/zkd/config.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [log].level
    #[arg(long, env = "ZKD_LOG")]
    log: Option<String>,

    /// Log format; overrides [log].format
    #[arg(long, env = "ZKD_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate keypairs and seal them under a passphrase
    ///
    /// The passphrase is read from ZKD_PASSPHRASE or prompted for.
    Keygen {
        /// Overwrite an existing keyring (the old keys become unrecoverable)
        #[arg(long)]
        force: bool,
    },

    /// Encrypt and upload a file
    Upload {
        /// Local file
        file: PathBuf,
        /// Object name (default: file name)
        #[arg(long, short = 'n')]
        name: Option<String>,
        /// MIME type recorded in the signed manifest
        #[arg(long, default_value = "application/octet-stream")]
        mime_type: String,
        /// What to do when the name is taken
        #[arg(long, value_enum, default_value = "fail")]
        on_conflict: ConflictPolicy,
        /// Resume file: Ctrl-C pauses into it, and an existing one is resumed
        #[arg(long, short = 'r')]
        resume: Option<PathBuf>,
    },

    /// Decrypt an object, or a byte range of it
    Cat {
        object_id: String,
        /// Inclusive byte range: `start-end` or `start-`
        #[arg(long)]
        range: Option<ByteRange>,
        /// Write to a file instead of stdout
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Show verified object metadata and chunk layout
    Info { object_id: String },

    /// Offline write queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum QueueAction {
    /// List queued writes in replay order
    Status,
    /// Run one replay pass
    Replay {
        /// Ignore backoff and retry the head item now
        #[arg(long)]
        force: bool,
    },
    /// Replay periodically until interrupted
    Watch,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
enum ConflictPolicy {
    /// Stop with an error
    Fail,
    /// Replace the existing object
    Replace,
    /// Upload as `name (n).ext`
    KeepBoth,
    /// Leave the existing object alone and upload nothing
    Skip,
}

impl ConflictPolicy {
    fn resolution(self) -> Option<ConflictResolution> {
        match self {
            ConflictPolicy::Fail => None,
            ConflictPolicy::Replace => Some(ConflictResolution::Replace),
            ConflictPolicy::KeepBoth => Some(ConflictResolution::KeepBoth),
            ConflictPolicy::Skip => Some(ConflictResolution::Skip),
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
enum LogFormat {
    Json,
    Text,
}

/// Inclusive byte range from the command line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ByteRange {
    start: u64,
    end: Option<u64>,
}

impl FromStr for ByteRange {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| format!("expected START-END or START-, got {s:?}"))?;
        let start: u64 = start
            .trim()
            .parse()
            .map_err(|e| format!("bad range start {start:?}: {e}"))?;
        let end = match end.trim() {
            "" => None,
            e => Some(e.parse::<u64>().map_err(|err| format!("bad range end {e:?}: {err}"))?),
        };
        if matches!(end, Some(e) if e < start) {
            return Err(format!("range end precedes start in {s:?}"));
        }
        Ok(Self { start, end })
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let config = ZkdConfig::load(&config_path)
        .with_context(|| format!("loading config: {}", config_path.display()))?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.unwrap_or(if config.log.format == "json" {
        LogFormat::Json
    } else {
        LogFormat::Text
    });
    init_logging(&level, format);
    info!(version = env!("CARGO_PKG_VERSION"), config = %config_path.display(), "zkd starting");

    match cli.command {
        Commands::Keygen { force } => cmd_keygen(&config, force),
        Commands::Upload {
            file,
            name,
            mime_type,
            on_conflict,
            resume,
        } => {
            let keys = unlock(&config)?;
            let client = Client::connect(config, keys)?;
            cmd_upload(&client, &file, name, mime_type, on_conflict, resume.as_deref()).await
        }
        Commands::Cat {
            object_id,
            range,
            output,
        } => {
            let keys = unlock(&config)?;
            let client = Client::connect(config, keys)?;
            cmd_cat(&client, &object_id, range, output.as_deref()).await
        }
        Commands::Info { object_id } => {
            let keys = unlock(&config)?;
            let client = Client::connect(config, keys)?;
            cmd_info(&client, &object_id).await
        }
        Commands::Queue { action } => {
            let client = Client::connect(config, Arc::new(KeyManager::new()))?;
            match action {
                QueueAction::Status => cmd_queue_status(&client).await,
                QueueAction::Replay { force } => cmd_queue_replay(&client, force).await,
                QueueAction::Watch => cmd_queue_watch(&client).await,
            }
        }
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path),
    }
}

/// Logs go to stderr; stdout carries object data for `cat`.
fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Client wiring ─────────────────────────────────────────────────────────────

/// Everything a command needs to talk to the backend
struct Client {
    config: ZkdConfig,
    keys: Arc<KeyManager>,
    api: Arc<dyn ObjectApi>,
    transport: Arc<dyn BlobTransport>,
    pool: Arc<ProcessorPool>,
    scheduler: TransferScheduler,
}

impl Client {
    fn connect(config: ZkdConfig, keys: Arc<KeyManager>) -> Result<Self> {
        let api: Arc<dyn ObjectApi> =
            Arc::new(HttpObjectApi::from_config(&config.api).context("building API client")?);
        let transport = build_transport(&config)?;
        let threads = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        let pool = Arc::new(ProcessorPool::new(threads).context("starting chunk worker pool")?);
        let scheduler = TransferScheduler::new(config.transfer.effective_concurrency());
        Ok(Self {
            config,
            keys,
            api,
            transport,
            pool,
            scheduler,
        })
    }

    fn coordinator(&self) -> UploadSessionCoordinator {
        UploadSessionCoordinator::new(
            self.api.clone(),
            self.transport.clone(),
            self.keys.clone(),
            self.pool.clone(),
            self.scheduler.clone(),
        )
        .with_transfer_config(&self.config.transfer)
        .with_chunking(self.config.chunking.clone())
    }

    fn downloads(&self) -> DownloadSessionManager {
        DownloadSessionManager::with_config(
            self.api.clone(),
            self.transport.clone(),
            self.keys.clone(),
            self.pool.clone(),
            self.scheduler.clone(),
            &self.config.transfer,
        )
    }

    fn queue_path(&self) -> PathBuf {
        expand_tilde(&self.config.queue.path)
    }

    fn queue(&self) -> Result<OfflineSyncQueue> {
        let executor = Arc::new(ApiQueueExecutor::new(
            self.api.clone(),
            self.transport.clone(),
            self.scheduler.clone(),
        ));
        OfflineSyncQueue::open(
            Arc::new(JsonFileQueueStore::new(self.queue_path())),
            executor,
            RetryPolicy::for_queue(&self.config.queue),
        )
        .with_context(|| format!("opening queue: {}", self.queue_path().display()))
    }
}

/// Pre-signed URLs over HTTP, or object keys in an S3 bucket.
///
/// The bucket backend reads AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY.
fn build_transport(config: &ZkdConfig) -> Result<Arc<dyn BlobTransport>> {
    match config.storage.backend.as_str() {
        "presigned" => {
            let timeout = Duration::from_secs(config.api.request_timeout_secs);
            Ok(Arc::new(HttpTransport::new(timeout).context("building transfer client")?))
        }
        "s3" => {
            let access_key = std::env::var("AWS_ACCESS_KEY_ID")
                .or_else(|_| std::env::var("ZKD_ACCESS_KEY_ID"))
                .context(
                    "S3 credentials not set\n\
                     Set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY environment variables.",
                )?;
            let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY")
                .or_else(|_| std::env::var("ZKD_SECRET_ACCESS_KEY"))
                .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
            let op = zkd_storage::build_from_core_config(&config.storage, &access_key, &secret_key)
                .context("building storage operator")?;
            Ok(Arc::new(OperatorTransport::new(op)))
        }
        other => anyhow::bail!("unknown storage backend {other:?} (expected \"presigned\" or \"s3\")"),
    }
}

// ── Keys ──────────────────────────────────────────────────────────────────────

fn read_passphrase(prompt: &str) -> Result<SecretString> {
    if let Ok(p) = std::env::var("ZKD_PASSPHRASE") {
        if !p.is_empty() {
            return Ok(SecretString::from(p));
        }
    }
    let p = rpassword::prompt_password(prompt).context("reading passphrase")?;
    Ok(SecretString::from(p))
}

/// Load the keyring and unlock a key manager with it.
fn unlock(config: &ZkdConfig) -> Result<Arc<KeyManager>> {
    let path = expand_tilde(&config.crypto.keyring_file);
    let keyring = EncryptedKeyring::load(&path)
        .with_context(|| format!("loading keyring: {} (run `zkd keygen` first)", path.display()))?;
    let passphrase = read_passphrase("Passphrase: ")?;
    let master = keyring.derive_key(&passphrase).context("deriving master key")?;

    let keys = Arc::new(KeyManager::new());
    keys.unlock(master, keyring);
    keys.get_or_decrypt_user_keypairs()
        .context("opening keyring (wrong passphrase?)")?;
    Ok(keys)
}

fn fingerprint(public_key: &[u8]) -> String {
    let hex = hash_to_hex(&hash_bytes(public_key));
    hex[..16.min(hex.len())].to_string()
}

// ── `zkd keygen` ──────────────────────────────────────────────────────────────

fn cmd_keygen(config: &ZkdConfig, force: bool) -> Result<()> {
    let path = expand_tilde(&config.crypto.keyring_file);
    if path.exists() && !force {
        anyhow::bail!(
            "keyring already exists at {} (use --force to overwrite)",
            path.display()
        );
    }

    let passphrase = read_passphrase("New passphrase: ")?;
    if std::env::var("ZKD_PASSPHRASE").is_err() {
        let again = read_passphrase("Repeat passphrase: ")?;
        if again.expose_secret() != passphrase.expose_secret() {
            anyhow::bail!("passphrases do not match");
        }
    }

    let params = KdfParams::from(&config.crypto);
    let (keyring, _, _) = EncryptedKeyring::create(&passphrase, &params).context("generating keyring")?;
    keyring
        .save(&path)
        .with_context(|| format!("writing keyring: {}", path.display()))?;

    println!("Keyring written to {}", path.display());
    println!("  ed25519:     {}", fingerprint(&keyring.public_keys.classical));
    println!("  ml-dsa-65:   {}", fingerprint(&keyring.public_keys.post_quantum));
    println!("  ml-kem-768:  {}", fingerprint(&keyring.public_keys.kem));
    Ok(())
}

// ── `zkd upload` ──────────────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} {msg}",
        )
        .context("progress template")?
        .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

async fn cmd_upload(
    client: &Client,
    file: &Path,
    name: Option<String>,
    mime_type: String,
    on_conflict: ConflictPolicy,
    resume: Option<&Path>,
) -> Result<()> {
    let source = Arc::new(
        FileSource::open(file)
            .await
            .with_context(|| format!("opening {}", file.display()))?,
    );
    let size = source.len();
    let name = match name {
        Some(n) => n,
        None => file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("cannot derive an object name from the path; pass --name")?,
    };

    let mut coordinator = client
        .coordinator()
        .with_offline_queue(Arc::new(client.queue()?));
    if let Some(resolution) = on_conflict.resolution() {
        coordinator = coordinator.with_conflict_resolver(Arc::new(FixedResolver(resolution)));
    }

    // Ctrl-C pauses when there is somewhere to put the resume token
    let control = UploadControl::new();
    let interrupt = {
        let control = control.clone();
        let pausable = resume.is_some();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                if pausable {
                    control.pause();
                } else {
                    control.cancel();
                }
            }
        })
    };

    let pb = make_progress_bar(size, "upload")?;
    pb.set_message(name.clone());
    let pb_progress = pb.clone();
    let progress: ProgressFn = Box::new(move |e| pb_progress.set_position(e.bytes_completed));

    let outcome = match resume.filter(|p| p.exists()) {
        Some(path) => {
            let token = ResumeToken::load(path)
                .with_context(|| format!("reading resume file: {}", path.display()))?;
            pb.println(format!(
                "Resuming {} ({} of {} chunks already confirmed)",
                token.name,
                token.confirmed.len(),
                token.plan.len()
            ));
            coordinator
                .resume(source, token, &control, Some(progress))
                .await
        }
        None => {
            let path = file.to_path_buf();
            let content_hash = tokio::task::spawn_blocking(move || hash_file_streaming(&path))
                .await
                .context("hashing task panicked")?
                .with_context(|| format!("hashing {}", file.display()))?;
            let options = UploadOptions::new(name.clone())
                .with_mime_type(mime_type)
                .with_content_hash(hash_to_hex(&content_hash));
            coordinator
                .upload(source, options, &control, Some(progress))
                .await
        }
    };
    interrupt.abort();
    let outcome = outcome.with_context(|| format!("uploading {}", file.display()));
    if outcome.is_err() {
        pb.abandon_with_message("failed");
    }

    match outcome? {
        UploadOutcome::Complete(receipt) => {
            pb.finish_with_message("done");
            if let Some(path) = resume {
                if path.exists() {
                    std::fs::remove_file(path)
                        .with_context(|| format!("removing resume file: {}", path.display()))?;
                }
            }
            println!();
            println!("Uploaded:");
            println!("  object:    {}", receipt.object_id);
            println!("  name:      {}", receipt.name);
            println!("  bytes:     {}", fmt_bytes(receipt.size));
            println!("  chunks:    {}", receipt.chunks.len());
            println!("  manifest:  {}", &receipt.manifest_hash[..16.min(receipt.manifest_hash.len())]);
            let retried = receipt.attempts.values().filter(|a| **a > 1).count();
            if retried > 0 {
                println!("  retried:   {retried} chunks");
            }
            if let Some(replaced) = receipt.replaced {
                println!("  replaced:  {replaced}");
            }
        }
        UploadOutcome::Paused(token) => {
            pb.abandon_with_message("paused");
            let path = resume.context("upload paused without a resume file")?;
            token
                .save(path)
                .with_context(|| format!("writing resume file: {}", path.display()))?;
            println!();
            println!(
                "Paused with {} of {} chunks confirmed ({}).",
                token.confirmed.len(),
                token.plan.len(),
                fmt_bytes(token.confirmed_bytes())
            );
            println!("Resume with: zkd upload {} --resume {}", file.display(), path.display());
        }
        UploadOutcome::Deferred(token) => {
            pb.abandon_with_message("queued");
            let path = match resume {
                Some(path) => path.to_path_buf(),
                None => client
                    .queue_path()
                    .with_file_name(format!("{}.resume", token.object_id)),
            };
            token
                .save(&path)
                .with_context(|| format!("writing resume file: {}", path.display()))?;
            println!();
            println!(
                "Network unavailable: {} chunk(s) queued, {} of {} confirmed.",
                token.queued.len(),
                token.confirmed.len(),
                token.plan.len()
            );
            println!("Drain the queue with: zkd queue replay");
            println!("Then finish with:     zkd upload {} --resume {}", file.display(), path.display());
        }
        UploadOutcome::Skipped(conflict) => {
            pb.abandon_with_message("skipped");
            println!(
                "Skipped: {} already exists as object {}",
                conflict.conflicting_name, conflict.existing_object_id
            );
        }
    }
    Ok(())
}

// ── `zkd cat` / `zkd info` ────────────────────────────────────────────────────

async fn cmd_cat(client: &Client, object_id: &str, range: Option<ByteRange>, output: Option<&Path>) -> Result<()> {
    let downloads = client.downloads();
    let summary = downloads
        .summary(object_id)
        .await
        .with_context(|| format!("opening object {object_id}"))?;
    let size = summary.declared_size;

    let mut out: Box<dyn tokio::io::AsyncWrite + Unpin + Send> = match output {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("creating {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };
    // an empty object reads as nothing unless a range was asked for
    if size == 0 && range.is_none() {
        out.flush().await.context("flushing output")?;
        return Ok(());
    }

    let range = range.unwrap_or(ByteRange { start: 0, end: None });
    let last = range.end.map_or(size.saturating_sub(1), |e| e.min(size.saturating_sub(1)));
    let window = client.config.transfer.stream_window_bytes.max(1);

    let mut pos = range.start;
    let mut written = 0u64;
    loop {
        let window_end = pos.saturating_add(window - 1).min(last);
        let bytes = downloads
            .fetch_range(object_id, pos, Some(window_end))
            .await
            .with_context(|| format!("reading bytes {pos}-{window_end} of {object_id}"))?;
        out.write_all(&bytes).await.context("writing output")?;
        written += bytes.len() as u64;
        pos += bytes.len() as u64;
        if bytes.is_empty() || pos > last {
            break;
        }
    }
    out.flush().await.context("flushing output")?;

    if let Some(path) = output {
        eprintln!("{} → {} ({})", object_id, path.display(), fmt_bytes(written));
    }
    Ok(())
}

async fn cmd_info(client: &Client, object_id: &str) -> Result<()> {
    let downloads = client.downloads();
    let summary = downloads
        .summary(object_id)
        .await
        .with_context(|| format!("opening object {object_id}"))?;
    let map = downloads.chunk_map(object_id).await?;

    println!("Object: {}", summary.object_id);
    println!("  name:    {}", summary.name.as_deref().unwrap_or("(not listed)"));
    println!("  type:    {}", summary.mime_type);
    println!("  bytes:   {}", fmt_bytes(summary.declared_size));
    println!("  chunks:  {}", summary.chunk_count);
    for entry in &map {
        println!(
            "    #{:<5} {:>12}..{:<12} {:>10} stored",
            entry.index,
            entry.plaintext_start,
            entry.plaintext_end,
            fmt_bytes(entry.encrypted_size)
        );
    }
    Ok(())
}

// ── `zkd queue` ───────────────────────────────────────────────────────────────

async fn cmd_queue_status(client: &Client) -> Result<()> {
    let queue = client.queue()?;
    let items = queue.items().await;
    let now = zkd_core::types::unix_now_millis();

    println!("Queue: {}", client.queue_path().display());
    println!("Items: {}", items.len());
    for item in items {
        let id = item.id.to_string();
        let wait = if item.next_attempt_at > now {
            format!("next try in {}s", (item.next_attempt_at - now).div_ceil(1000))
        } else {
            "due".to_string()
        };
        println!(
            "  {}  {:<14} parent={}  retries={}  {}",
            &id[..8],
            item.op.kind(),
            item.parent_id,
            item.retry_count,
            wait
        );
    }
    Ok(())
}

async fn cmd_queue_replay(client: &Client, force: bool) -> Result<()> {
    let queue = client.queue()?;
    let report = if force {
        queue.replay_now().await
    } else {
        queue.replay().await
    }
    .context("replaying queue")?;

    println!("Replayed: {}", report.completed);
    println!("Remaining: {}", report.remaining);
    if let Some(id) = report.failed {
        println!("Failed: {id} (backing off)");
    } else if report.deferred_until.is_some() && report.completed == 0 {
        println!("Head item is backing off; use --force to retry now");
    }
    Ok(())
}

async fn cmd_queue_watch(client: &Client) -> Result<()> {
    let queue = Arc::new(client.queue()?);
    let cancel = CancellationToken::new();
    let tick = Duration::from_secs(client.config.queue.tick_secs.max(1));

    let runner = {
        let queue = queue.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { queue.run(cancel, tick).await })
    };
    println!("Watching {} (Ctrl-C to stop)", client.queue_path().display());
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    cancel.cancel();
    runner.await.context("queue loop panicked")?;
    println!("Remaining: {}", queue.size().await);
    Ok(())
}

// ── `zkd config show` ─────────────────────────────────────────────────────────

fn cmd_config_show(config: &ZkdConfig, path: &Path) -> Result<()> {
    let rendered = toml::to_string_pretty(config).context("serializing config")?;
    println!("# {}", path.display());
    println!("{rendered}");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_ranges() {
        assert_eq!(
            "10-20".parse::<ByteRange>().unwrap(),
            ByteRange { start: 10, end: Some(20) }
        );
        assert_eq!("5-".parse::<ByteRange>().unwrap(), ByteRange { start: 5, end: None });
        assert!("20-10".parse::<ByteRange>().is_err());
        assert!("abc".parse::<ByteRange>().is_err());
        assert!("-5".parse::<ByteRange>().is_err());
    }

    #[test]
    fn conflict_policy_maps_to_resolution() {
        assert_eq!(ConflictPolicy::Fail.resolution(), None);
        assert_eq!(
            ConflictPolicy::KeepBoth.resolution(),
            Some(ConflictResolution::KeepBoth)
        );
    }

    #[test]
    fn upload_flags_parse() {
        let cli = Cli::try_parse_from([
            "zkd",
            "upload",
            "report.pdf",
            "--on-conflict",
            "keep-both",
            "--resume",
            "/tmp/report.resume",
        ])
        .unwrap();
        match cli.command {
            Commands::Upload {
                on_conflict, resume, ..
            } => {
                assert_eq!(on_conflict, ConflictPolicy::KeepBoth);
                assert_eq!(resume, Some(PathBuf::from("/tmp/report.resume")));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn tilde_expansion() {
        let home = std::env::var("HOME").unwrap_or_default();
        assert_eq!(
            expand_tilde(Path::new("~/x/y.json")),
            PathBuf::from(home).join("x/y.json")
        );
        assert_eq!(expand_tilde(Path::new("/abs")), PathBuf::from("/abs"));
    }

    #[test]
    fn byte_formatting() {
        assert_eq!(fmt_bytes(512), "512 B");
        assert_eq!(fmt_bytes(2048), "2.0 KB");
        assert_eq!(fmt_bytes(10 * 1024 * 1024), "10.0 MB");
    }
}
