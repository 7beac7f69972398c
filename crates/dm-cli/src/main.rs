//! dm: drivemerge command-line driver
//!
//! Runs the orchestrator in-process over the configured store, so a single
//! machine can exercise the whole pipeline:
//!   chunk <file>            - chunk + encrypt, print the chunk table or submission JSON
//!   submit <file>           - derive, chunk, wrap, submit, run workers to quiescence
//!   commit <hash>...        - record uploads (simulated) for hashes or a whole job
//!   files / file <id>       - inspect the catalog
//!   jobs / job <id>         - inspect jobs
//!   hashes                  - inspect the dedup store
//!   unlock <id>             - re-derive and unwrap a catalogued file key
//!   sweep                   - fault jobs whose uploads were never committed
//!   patch <id>              - repair file metadata
//!   config show             - display current configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dm_chunks::{recover_file_key, ChunkProducer, EncryptedFile};
use dm_core::api::{CommitRequest, PatchRequest};
use dm_core::config::DmConfig;
use dm_core::types::ItemStatus;
use dm_crypto::{encoding, KdfAlgorithm, KeyService, SALT_SIZE};
use dm_jobs::Runtime;
use dm_store::Stores;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "dm",
    version,
    about = "drivemerge: encrypted, deduplicated chunk submission",
    long_about = "dm: chunk and encrypt files, submit them for deduplicated upload, and inspect catalog, job and hash state"
)]
struct Cli {
    /// Path to the drivemerge TOML configuration file
    #[arg(
        long,
        short = 'c',
        env = "DM_CONFIG",
        default_value = "~/.config/drivemerge/config.toml"
    )]
    config: PathBuf,

    /// Store directory (overrides [store] path)
    #[arg(long, env = "DM_DB")]
    db: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to [log] level
    #[arg(long, env = "DM_LOG")]
    log: Option<String>,

    /// Log format; defaults to [log] format
    #[arg(long, env = "DM_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Chunk and encrypt a file without submitting it
    Chunk {
        file: PathBuf,
        /// Print the submission request JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Chunk, encrypt and submit a file, then assign upload destinations
    ///
    /// Without a passphrase the file key is not wrapped and is printed once;
    /// it must then be kept out of band.
    Submit {
        file: PathBuf,
        /// Read the passphrase from this environment variable
        #[arg(long, conflicts_with = "ask_passphrase")]
        passphrase_env: Option<String>,
        /// Prompt for the passphrase on the terminal
        #[arg(long)]
        ask_passphrase: bool,
        /// Owner recorded on the file (only the owner may patch it later)
        #[arg(long)]
        owner: Option<String>,
        /// Leave the job queued instead of running workers
        #[arg(long)]
        no_wait: bool,
    },

    /// Record completed uploads (simulated) and complete finished jobs
    Commit {
        /// Plaintext SHA-256 hashes (hex)
        #[arg(required_unless_present = "job", conflicts_with = "job")]
        hashes: Vec<String>,
        /// Commit every url_ready item of this job
        #[arg(long)]
        job: Option<String>,
    },

    /// List catalogued files
    Files,

    /// Show one file record as JSON
    File { id: String },

    /// List jobs
    Jobs,

    /// Show one job as JSON
    Job { id: String },

    /// List dedup store entries
    Hashes,

    /// Re-derive the master key for a file and check that its key unwraps
    Unlock {
        id: String,
        /// Read the passphrase from this environment variable
        #[arg(long, conflicts_with = "ask_passphrase")]
        passphrase_env: Option<String>,
        /// Prompt for the passphrase on the terminal
        #[arg(long)]
        ask_passphrase: bool,
        /// Print the unwrapped file key (base64)
        #[arg(long)]
        show_key: bool,
    },

    /// Fault jobs whose url_ready items were never committed
    Sweep {
        /// Overrides [jobs] upload_deadline_secs
        #[arg(long)]
        older_than_secs: Option<u64>,
    },

    /// Patch a file's mutable metadata
    Patch {
        id: String,
        #[arg(long)]
        note: Option<String>,
        /// Base64 wrapped file key
        #[arg(long)]
        wrapped_file_key: Option<String>,
        /// Base64 nonce of the wrapped file key
        #[arg(long)]
        wrap_nonce: Option<String>,
        /// Requester identity, checked against the file owner
        #[arg(long = "as")]
        requester: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let (config, found) = load_config(&config_path).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.clone().unwrap_or(if config.log.format == "json" {
        LogFormat::Json
    } else {
        LogFormat::Text
    });
    init_logging(&level, &format);
    if !found {
        warn!(
            "config file not found: {}  (using defaults)",
            config_path.display()
        );
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted");
                cancel.cancel();
            }
        }
    });

    match cli.command {
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path, found),
        Commands::Chunk { file, json } => cmd_chunk(&config, &file, json).await,
        command => {
            let db = cli
                .db
                .as_deref()
                .map(expand_tilde)
                .unwrap_or_else(|| expand_tilde(&config.store.path));
            let stores = Stores::open(config.store.backend, &db)
                .with_context(|| format!("opening store: {}", db.display()))?;
            let rt = Runtime::from_config(stores, &config.jobs)
                .await
                .context("starting job runtime")?;
            run(command, &config, &rt, &cancel).await
        }
    }
}

async fn run(command: Commands, config: &DmConfig, rt: &Runtime, cancel: &CancellationToken) -> Result<()> {
    let orch = &rt.orchestrator;
    match command {
        Commands::Submit {
            file,
            passphrase_env,
            ask_passphrase,
            owner,
            no_wait,
        } => {
            let passphrase = read_passphrase(passphrase_env.as_deref(), ask_passphrase)?;
            cmd_submit(config, rt, &file, passphrase, owner, no_wait, cancel).await
        }
        Commands::Commit { hashes, job } => {
            let hashes = match job {
                Some(job_id) => {
                    let job = orch.get_job(&job_id)?;
                    job.items
                        .iter()
                        .filter(|it| it.status == ItemStatus::UrlReady)
                        .map(|it| it.hash.clone())
                        .collect()
                }
                None => hashes,
            };
            if hashes.is_empty() {
                println!("nothing to commit");
                return Ok(());
            }
            let resp = orch
                .commit(CommitRequest {
                    chunk_hashes: hashes,
                })
                .await?;
            print_json(&resp)
        }
        Commands::Files => {
            let files = orch.list_files()?;
            println!("{:<36}  {:>10}  {:>6}  {:<8}  name", "id", "size", "chunks", "wrapped");
            for f in &files {
                println!(
                    "{:<36}  {:>10}  {:>6}  {:<8}  {}",
                    f.id,
                    f.file_size.map(fmt_bytes).unwrap_or_else(|| "-".into()),
                    f.chunks.len(),
                    if f.wrapped_file_key.is_some() { "yes" } else { "no" },
                    f.file_name.as_deref().unwrap_or("-"),
                );
            }
            println!("{} file(s)", files.len());
            Ok(())
        }
        Commands::File { id } => print_json(&orch.get_file(&id)?),
        Commands::Jobs => {
            let jobs = orch.list_jobs()?;
            println!("{:<36}  {:<11}  {:>5}  {:>5}  {:>5}  file", "id", "status", "items", "dedup", "ready");
            for j in &jobs {
                println!(
                    "{:<36}  {:<11}  {:>5}  {:>5}  {:>5}  {}",
                    j.id,
                    j.status.as_str(),
                    j.items.len(),
                    j.count(ItemStatus::Deduplicated),
                    j.count(ItemStatus::UrlReady),
                    j.file_id,
                );
                if let Some(err) = &j.last_error {
                    println!("    fault after {} attempt(s): {err}", j.attempts);
                }
            }
            Ok(())
        }
        Commands::Job { id } => print_json(&orch.get_job(&id)?),
        Commands::Hashes => {
            let hashes = orch.list_hashes()?;
            for h in &hashes {
                println!("{}  {}", h.sha256, h.ref_count);
            }
            println!("{} hash(es)", hashes.len());
            Ok(())
        }
        Commands::Unlock {
            id,
            passphrase_env,
            ask_passphrase,
            show_key,
        } => {
            let Some(passphrase) = read_passphrase(passphrase_env.as_deref(), ask_passphrase)? else {
                anyhow::bail!("unlock needs --passphrase-env or --ask-passphrase");
            };
            cmd_unlock(config, rt, &id, passphrase, show_key, cancel).await
        }
        Commands::Sweep { older_than_secs } => {
            let secs = older_than_secs.unwrap_or(config.jobs.upload_deadline_secs);
            let faulted = orch.fault_stalled(Duration::from_secs(secs)).await?;
            for job_id in &faulted {
                println!("faulted {job_id}");
            }
            println!("{} job(s) overdue", faulted.len());
            Ok(())
        }
        Commands::Patch {
            id,
            note,
            wrapped_file_key,
            wrap_nonce,
            requester,
        } => {
            let patch = PatchRequest {
                wrapped_file_key,
                wrapped_file_key_iv: wrap_nonce,
                note,
            }
            .into_patch();
            if patch.is_empty() {
                anyhow::bail!("nothing to patch: pass --note, --wrapped-file-key or --wrap-nonce");
            }
            let updated = orch.patch_file(&id, patch, requester.as_deref()).await?;
            print_json(&updated)
        }
        Commands::Chunk { .. } | Commands::Config { .. } => Ok(()),
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

/// Returns the config and whether a file was found.
async fn load_config(path: &Path) -> Result<(DmConfig, bool)> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config = DmConfig::from_toml(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((DmConfig::default(), false))
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // logs go to stderr so stdout stays parseable
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

fn read_passphrase(env_var: Option<&str>, ask: bool) -> Result<Option<SecretString>> {
    if let Some(var) = env_var {
        let value = std::env::var(var)
            .with_context(|| format!("passphrase variable {var} is not set"))?;
        return Ok(Some(SecretString::from(value)));
    }
    if ask {
        let value = rpassword::prompt_password("Passphrase: ").context("reading passphrase")?;
        if value.is_empty() {
            anyhow::bail!("empty passphrase");
        }
        return Ok(Some(SecretString::from(value)));
    }
    Ok(None)
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template(
        "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=>-");
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

async fn chunk_file(config: &DmConfig, path: &Path) -> Result<EncryptedFile> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let size = file
        .metadata()
        .await
        .with_context(|| format!("stat: {}", path.display()))?
        .len();

    let pb = make_progress_bar(size, "chunk");
    pb.set_message(file_name(path));
    let encrypted = ChunkProducer::from_config(&config.chunking)
        .spawn(file, Some(size))
        .collect_with_progress(|bytes, _| pb.set_position(bytes))
        .await
        .with_context(|| format!("chunking {}", path.display()))?;
    pb.finish_with_message(format!("{} chunks", encrypted.chunks.len()));
    Ok(encrypted)
}

// ── `dm chunk` ────────────────────────────────────────────────────────────────

async fn cmd_chunk(config: &DmConfig, path: &Path, json: bool) -> Result<()> {
    let encrypted = chunk_file(config, path).await?;
    if json {
        let submission = encrypted.into_unprotected_submission(Some(file_name(path)));
        return print_json(&submission.request);
    }

    println!("{:>5}  {:>10}  {:>10}  hash", "index", "offset", "size");
    let mut offset = 0u64;
    for chunk in &encrypted.chunks {
        let size = chunk.record.size.unwrap_or(0);
        println!(
            "{:>5}  {:>10}  {:>10}  {}",
            chunk.record.index, offset, size, chunk.record.hash
        );
        offset += size;
    }
    println!(
        "{} chunks, {} (min/avg/max = {}/{}/{})",
        encrypted.chunks.len(),
        fmt_bytes(encrypted.file_size),
        config.chunking.min_chunk,
        config.chunking.avg_chunk,
        config.chunking.max_chunk,
    );
    Ok(())
}

// ── `dm submit` ───────────────────────────────────────────────────────────────

async fn cmd_submit(
    config: &DmConfig,
    rt: &Runtime,
    path: &Path,
    passphrase: Option<SecretString>,
    owner: Option<String>,
    no_wait: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let keys = KeyService::from_config(&config.crypto);

    // Derive first: a failed derivation must not leave anything behind.
    let derived = match passphrase {
        Some(passphrase) => {
            let pb = make_spinner("derive");
            pb.set_message("deriving master key...");
            let derived = keys.derive(passphrase, None, cancel).await;
            pb.finish_and_clear();
            let derived = derived.context("deriving master key")?;
            info!(algorithm = %derived.algorithm, "master key derived");
            Some(derived)
        }
        None => None,
    };

    let encrypted = chunk_file(config, path).await?;
    let name = Some(file_name(path));
    let submission = match &derived {
        Some(derived) => encrypted
            .into_protected_submission(name, &keys, derived, cancel)
            .await
            .context("wrapping file key")?,
        None => encrypted.into_unprotected_submission(name),
    };
    if let Some(raw) = &submission.raw_file_key {
        eprintln!("WARNING: no passphrase given; the file key is not wrapped.");
        eprintln!("         Keep this key to decrypt the file later:");
        eprintln!("         {}", encoding::encode(raw.as_bytes()));
    }

    let resp = rt.orchestrator.submit(submission.request, owner).await?;
    let needs_upload = resp
        .jobs
        .iter()
        .filter(|v| v.status == ItemStatus::NeedsUpload)
        .count();
    println!(
        "submitted {} ({} chunks, {} new, {} deduplicated)",
        resp.file_id,
        resp.jobs.len(),
        needs_upload,
        resp.jobs.len() - needs_upload,
    );

    if no_wait {
        return print_json(&resp);
    }

    let handled = rt.workers.drain().await?;
    info!(handled, "workers idle");
    match &resp.job {
        Some(summary) => print_json(&rt.orchestrator.get_job(&summary.id)?),
        None => print_json(&resp),
    }
}

// ── `dm unlock` ───────────────────────────────────────────────────────────────

async fn cmd_unlock(
    config: &DmConfig,
    rt: &Runtime,
    id: &str,
    passphrase: SecretString,
    show_key: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let record = rt.orchestrator.get_file(id)?;
    let Some(kdf) = &record.kdf else {
        anyhow::bail!("file {id} has no recorded KDF; its key was not wrapped");
    };
    let algorithm: KdfAlgorithm = kdf.algorithm.parse()?;
    let salt: [u8; SALT_SIZE] = encoding::decode_array(&kdf.salt, "kdf salt")?;

    let keys = KeyService::from_config(&config.crypto);
    let pb = make_spinner("derive");
    pb.set_message(format!("re-deriving with {algorithm}..."));
    let derived = keys.derive_with(algorithm, passphrase, salt, cancel).await;
    pb.finish_and_clear();
    let derived = derived.context("re-deriving master key")?;

    let file_key = recover_file_key(&record, &derived.master, &keys, cancel)
        .await
        .context("unwrapping file key")?;
    info!(file_id = id, "file key unwrapped");
    if show_key {
        println!("{}", encoding::encode(file_key.as_bytes()));
    } else {
        println!("ok: file key for {id} unwraps");
    }
    Ok(())
}

// ── `dm config show` ──────────────────────────────────────────────────────────

fn cmd_config_show(config: &DmConfig, config_path: &Path, found: bool) -> Result<()> {
    if found {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = config.to_toml().context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── Output helpers ────────────────────────────────────────────────────────────

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serializing output")?
    );
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
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
        format!("{} B", bytes)
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
    fn commit_takes_hashes_or_job() {
        let cli = Cli::try_parse_from(["dm", "commit", "--job", "j1"]).unwrap();
        assert!(matches!(cli.command, Commands::Commit { job: Some(_), .. }));
        assert!(Cli::try_parse_from(["dm", "commit"]).is_err());
        assert!(Cli::try_parse_from(["dm", "commit", "abc", "--job", "j1"]).is_err());
    }

    #[test]
    fn patch_requester_flag_is_as() {
        let cli = Cli::try_parse_from(["dm", "patch", "f1", "--note", "n", "--as", "alice"]).unwrap();
        match cli.command {
            Commands::Patch { requester, note, .. } => {
                assert_eq!(requester.as_deref(), Some("alice"));
                assert_eq!(note.as_deref(), Some("n"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn unlock_takes_one_passphrase_source() {
        let cli = Cli::try_parse_from(["dm", "unlock", "f1", "--passphrase-env", "PW", "--show-key"]).unwrap();
        match cli.command {
            Commands::Unlock {
                id,
                passphrase_env,
                show_key,
                ..
            } => {
                assert_eq!(id, "f1");
                assert_eq!(passphrase_env.as_deref(), Some("PW"));
                assert!(show_key);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["dm", "unlock", "f1", "--passphrase-env", "PW", "--ask-passphrase"]).is_err());
    }

    #[test]
    fn sweep_deadline_is_optional() {
        let cli = Cli::try_parse_from(["dm", "sweep"]).unwrap();
        assert!(matches!(cli.command, Commands::Sweep { older_than_secs: None }));
        let cli = Cli::try_parse_from(["dm", "sweep", "--older-than-secs", "60"]).unwrap();
        assert!(matches!(cli.command, Commands::Sweep { older_than_secs: Some(60) }));
    }

    #[test]
    fn tilde_expands_to_home() {
        let home = std::env::var("HOME").unwrap_or_default();
        assert_eq!(
            expand_tilde(Path::new("~/.local/share/drivemerge/db")),
            PathBuf::from(home).join(".local/share/drivemerge/db")
        );
        assert_eq!(expand_tilde(Path::new("/abs/db")), PathBuf::from("/abs/db"));
    }

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(fmt_bytes(512), "512 B");
        assert_eq!(fmt_bytes(200 * 1024), "200.0 KB");
        assert_eq!(fmt_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
