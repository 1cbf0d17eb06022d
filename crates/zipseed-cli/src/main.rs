//! zipseed: compressed web-seed publishing and fetching
//!
//! Commands:
//!   create <path>          - compress content into a blob and write its metadata
//!   fetch <meta>           - download content from the metadata's web seeds
//!   inspect <meta>         - summarize a metadata file
//!   range <meta> <piece>   - print the Range header that fetches one piece
//!   config show            - display current configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use zipseed_chunks::{codec_for, encode_to_file, FileLayout, Metainfo, ProgressFn, UrlList, ZipInfo};
use zipseed_core::config::{validate_piece_size, ZipseedConfig};
use zipseed_core::CodecKind;
use zipseed_storage::{check_blob, open_seed, SeedLocation};
use zipseed_transfer::{FetchSession, RangeMapper, SessionProgressFn};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "zipseed",
    version,
    about = "Compressed web-seed content tool",
    long_about = "zipseed: publish content as independently compressed pieces behind HTTP web seeds, and fetch it back"
)]
struct Cli {
    /// Path to zipseed.toml configuration file
    #[arg(long, env = "ZIPSEED_CONFIG", default_value = "zipseed.toml", global = true)]
    config: PathBuf,

    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, env = "ZIPSEED_LOG", global = true)]
    log: Option<String>,

    /// Log output format
    #[arg(long, env = "ZIPSEED_LOG_FORMAT", value_enum, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compress a file or directory into a blob and write its metadata
    Create {
        /// Content to publish (file or directory)
        path: PathBuf,
        /// Web seed URL serving the compressed blob (repeatable)
        #[arg(long = "web-seed", short = 'z', value_name = "URL")]
        web_seeds: Vec<String>,
        /// Output path for the compressed blob (default: <PATH>.dat)
        #[arg(long, short = 'Z', value_name = "BLOB")]
        blob: Option<PathBuf>,
        /// Output path for the metadata (default: <PATH>.zipseed.json)
        #[arg(long, short = 'o', value_name = "META")]
        output: Option<PathBuf>,
        /// Piece size in bytes, a power of two (0 picks one automatically)
        #[arg(long, short = 's')]
        piece_size: Option<u64>,
        /// Codec level
        #[arg(long, short = 'l')]
        level: Option<i32>,
        /// Piece codec
        #[arg(long)]
        codec: Option<CodecKind>,
        /// Free-form comment stored in the metadata
        #[arg(long, short = 'c')]
        comment: Option<String>,
        /// Creator string stored in the metadata
        #[arg(long = "creator", short = 'C')]
        creator: Option<String>,
        /// Include files and directories whose names start with '.'
        #[arg(long)]
        include_hidden: bool,
    },

    /// Download content described by a metadata file
    Fetch {
        /// Metadata file
        meta: PathBuf,
        /// Directory to write the content into
        #[arg(long, short = 'd', default_value = ".")]
        out_dir: PathBuf,
        /// Additional web seed URL (repeatable)
        #[arg(long = "url", value_name = "URL")]
        urls: Vec<String>,
    },

    /// Summarize a metadata file
    Inspect {
        /// Metadata file
        meta: PathBuf,
        /// Also check that every web seed serves a blob of the expected size
        #[arg(long)]
        check: bool,
    },

    /// Print the Range header that fetches one piece from the blob
    Range {
        /// Metadata file
        meta: PathBuf,
        /// Zero-based piece index
        piece: u32,
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
    let config = load_config(&cli.config)?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| log_format_from_config(&config.log.format));
    init_logging(&level, &format);

    match cli.command {
        Commands::Create {
            path,
            web_seeds,
            blob,
            output,
            piece_size,
            level,
            codec,
            comment,
            creator,
            include_hidden,
        } => {
            let opts = CreateOptions {
                web_seeds,
                blob,
                output,
                piece_size,
                level,
                codec,
                comment,
                creator,
                include_hidden,
            };
            cmd_create(&config, &path, opts).await
        }
        Commands::Fetch {
            meta,
            out_dir,
            urls,
        } => cmd_fetch(&config, &meta, &out_dir, &urls).await,
        Commands::Inspect { meta, check } => cmd_inspect(&config, &meta, check).await,
        Commands::Range { meta, piece } => cmd_range(&meta, piece),
        Commands::Config { action } => match action {
            ConfigAction::Show => cmd_config_show(&config, &cli.config),
        },
    }
}

// ── Config + logging ──────────────────────────────────────────────────────────

fn load_config(path: &Path) -> Result<ZipseedConfig> {
    ZipseedConfig::load(path).with_context(|| format!("loading config: {}", path.display()))
}

fn log_format_from_config(format: &str) -> LogFormat {
    if format.eq_ignore_ascii_case("json") {
        LogFormat::Json
    } else {
        LogFormat::Text
    }
}

/// Logs go to stderr so command output on stdout stays clean.
fn init_logging(level: &str, format: &LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

// ── Progress display ──────────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .map(|s| s.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
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

// ── `zipseed create` ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct CreateOptions {
    web_seeds: Vec<String>,
    blob: Option<PathBuf>,
    output: Option<PathBuf>,
    piece_size: Option<u64>,
    level: Option<i32>,
    codec: Option<CodecKind>,
    comment: Option<String>,
    creator: Option<String>,
    include_hidden: bool,
}

/// `<path>` with `suffix` appended to its final component.
fn sibling_path(path: &Path, suffix: &str) -> Result<PathBuf> {
    let name = path
        .file_name()
        .with_context(|| format!("path has no file name: {}", path.display()))?;
    let mut name = name.to_os_string();
    name.push(suffix);
    Ok(path.with_file_name(name))
}

fn content_base(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

async fn cmd_create(config: &ZipseedConfig, path: &Path, opts: CreateOptions) -> Result<()> {
    for url in &opts.web_seeds {
        SeedLocation::parse(url).with_context(|| format!("invalid web seed URL: {url}"))?;
    }
    let url_list = UrlList::from_urls(opts.web_seeds.clone())
        .context("at least one --web-seed URL is required")?;

    let mut create = config.create.clone();
    if let Some(size) = opts.piece_size {
        create.piece_size = size;
    }
    if let Some(kind) = opts.codec {
        create.codec = kind;
        if opts.level.is_none() {
            create.level = None;
        }
    }
    if opts.level.is_some() {
        create.level = opts.level;
    }
    validate_piece_size(create.piece_size)?;

    let blob_path = match opts.blob {
        Some(p) => p,
        None => sibling_path(path, ".dat")?,
    };
    let meta_path = match opts.output {
        Some(p) => p,
        None => sibling_path(path, ".zipseed.json")?,
    };

    let layout = FileLayout::scan(path, create.piece_size, create.include_hidden)?;
    let level = create.effective_level();
    let codec = codec_for(create.codec, level);
    tracing::info!(
        name = %layout.name,
        files = layout.files.len(),
        piece_length = layout.piece_length,
        codec = %create.codec,
        level,
        "creating"
    );

    let pb = make_progress_bar(layout.num_pieces() as u64, "compress");
    let pb_cb = pb.clone();
    let progress: ProgressFn = Box::new(move |done, total| {
        pb_cb.set_length(total);
        pb_cb.set_position(done);
    });

    let base = content_base(path);
    let encoded = {
        let layout = layout.clone();
        let blob_path = blob_path.clone();
        tokio::task::spawn_blocking(move || {
            encode_to_file(&layout, &base, &codec, &blob_path, Some(&progress))
        })
        .await
        .context("encode task failed")?
        .with_context(|| format!("encoding {}", path.display()))?
    };
    pb.finish_and_clear();

    let meta = Metainfo {
        name: layout.name.clone(),
        piece_length: layout.piece_length,
        files: layout.files.clone(),
        piece_hashes: encoded.piece_hashes,
        created_by: Some(
            opts.creator
                .unwrap_or_else(|| format!("zipseed/{}", env!("CARGO_PKG_VERSION"))),
        ),
        comment: opts.comment,
        zipinfo: Some(ZipInfo {
            total_size: encoded.index.total_size(),
            level,
            codec: create.codec,
            pieces_size: encoded.index,
            url_list,
        }),
    };
    meta.validate()?;
    meta.save(&meta_path)?;

    let stats = encoded.stats;
    println!("created:    {}", meta_path.display());
    println!("blob:       {}", blob_path.display());
    println!("pieces:     {} x {}", stats.pieces, fmt_bytes(layout.piece_length));
    println!(
        "size:       {} -> {} ({:.1}%)",
        fmt_bytes(stats.plain_bytes),
        fmt_bytes(stats.compressed_bytes),
        stats.ratio() * 100.0
    );
    Ok(())
}

// ── `zipseed fetch` ───────────────────────────────────────────────────────────

async fn cmd_fetch(
    config: &ZipseedConfig,
    meta_path: &Path,
    out_dir: &Path,
    extra_urls: &[String],
) -> Result<()> {
    let meta = Metainfo::load(meta_path)?;
    let pieces = meta.num_pieces() as u64;
    let session = FetchSession::from_metainfo(meta, extra_urls, config.transfer.clone(), out_dir)
        .with_context(|| format!("preparing fetch for {}", meta_path.display()))?;

    let pb = make_progress_bar(pieces, "fetch");
    let pb_cb = pb.clone();
    let progress: SessionProgressFn = Arc::new(move |done, total| {
        pb_cb.set_length(total);
        pb_cb.set_position(done);
    });

    let result = session.run(Some(progress)).await;
    pb.finish_and_clear();
    let report = result.with_context(|| format!("fetching {}", meta_path.display()))?;

    for (url, reason) in &report.failed_seeds {
        eprintln!("dropped seed {url}: {reason}");
    }
    println!("fetched:    {} pieces", report.pieces);
    println!(
        "size:       {} ({} on the wire)",
        fmt_bytes(report.plain_bytes),
        fmt_bytes(report.compressed_bytes)
    );
    if report.hash_failures > 0 {
        println!("retried:    {} pieces after hash failures", report.hash_failures);
    }
    for file in &report.files {
        println!("  {}", file.display());
    }
    Ok(())
}

// ── `zipseed inspect` ─────────────────────────────────────────────────────────

async fn cmd_inspect(config: &ZipseedConfig, meta_path: &Path, check: bool) -> Result<()> {
    let meta = Metainfo::load(meta_path)?;
    let layout = meta.layout();

    println!("name:       {}", meta.name);
    println!("files:      {}", meta.files.len());
    println!("size:       {}", fmt_bytes(layout.total_length()));
    println!(
        "pieces:     {} x {}",
        meta.num_pieces(),
        fmt_bytes(meta.piece_length)
    );
    if let Some(creator) = &meta.created_by {
        println!("created by: {creator}");
    }
    if let Some(comment) = &meta.comment {
        println!("comment:    {comment}");
    }

    let Some(zip) = &meta.zipinfo else {
        println!("zipinfo:    none");
        return Ok(());
    };
    println!("codec:      {} (level {})", zip.codec, zip.level);
    println!("blob size:  {}", fmt_bytes(zip.total_size));
    for url in zip.url_list.urls() {
        println!("web seed:   {url}");
    }

    if check {
        let spinner = make_spinner("check");
        let mut failed = 0usize;
        for url in zip.url_list.urls() {
            spinner.set_message(url.to_string());
            let outcome = match open_seed(url, config.transfer.max_retries) {
                Ok((op, location)) => check_blob(&op, &location.path, zip.total_size).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => spinner.println(format!("  ok      {url}")),
                Err(e) => {
                    failed += 1;
                    spinner.println(format!("  FAILED  {url}: {e}"));
                }
            }
        }
        spinner.finish_and_clear();
        if failed > 0 {
            anyhow::bail!("{failed} web seed(s) failed the blob check");
        }
    }
    Ok(())
}

// ── `zipseed range` ───────────────────────────────────────────────────────────

fn cmd_range(meta_path: &Path, piece: u32) -> Result<()> {
    let meta = Metainfo::load(meta_path)?;
    let zip = meta
        .zipinfo
        .as_ref()
        .with_context(|| format!("{} carries no zipinfo record", meta_path.display()))?;

    let mapper = RangeMapper::new(
        Arc::new(zip.pieces_size.clone()),
        meta.piece_length,
        meta.layout().total_length(),
    );
    let range = mapper.map(piece)?;
    println!("Range: {}", range.header_value());
    println!(
        "# piece {piece}: {} compressed, {} plain",
        range.compressed_length, range.expected_plain_length
    );
    Ok(())
}

// ── `zipseed config show` ─────────────────────────────────────────────────────

fn cmd_config_show(config: &ZipseedConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

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
