//! CLI binary for paper2md.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ConversionConfig` and prints results.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use paper2md::config::{DEFAULT_BASE_URL, DEFAULT_CACHE_DIR, DEFAULT_MODEL};
use paper2md::{
    convert, inspect, invalidate, ConversionConfig, ConversionOutput, ConversionProgressCallback,
    Converter, PageSeparator, PdfiumExtractor, ProgressCallback,
};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const SPINNER: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar over the document's images plus a
/// log line per image. Images finish out of order, so timings are keyed by
/// `(page, position)`.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<(usize, usize), Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    /// Spinner until `on_run_start` reports how many images there are.
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(SPINNER);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Extracting text and images…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} images  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(SPINNER);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Captioning");
        self.bar.reset_eta();
    }

    fn elapsed_ms(&self, page: usize, position: usize) -> u128 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&(page, position)))
            .map(|t| t.elapsed().as_millis())
            .unwrap_or(0)
    }
}

impl ConversionProgressCallback for CliProgressCallback {
    fn on_run_start(&self, total_pages: usize, total_images: usize) {
        self.activate_bar(total_images);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!(
                "{total_pages} pages, {total_images} distinct images to caption…"
            ))
        ));
    }

    fn on_image_start(&self, page: usize, position: usize) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert((page, position), Instant::now());
        }
        self.bar
            .set_message(format!("page {page} image {}", position + 1));
    }

    fn on_image_complete(&self, page: usize, position: usize, cached: bool) {
        let elapsed_ms = self.elapsed_ms(page, position);
        self.bar.println(format!(
            "  {} Page {:>3} image {:<3} {}",
            green("✓"),
            page,
            position + 1,
            if cached {
                dim("cached")
            } else {
                dim(&format!("{:.1}s", elapsed_ms as f64 / 1000.0))
            },
        ));
        self.bar.inc(1);
    }

    fn on_image_error(&self, page: usize, position: usize, error: &str) {
        let elapsed_ms = self.elapsed_ms(page, position);
        self.errors.fetch_add(1, Ordering::SeqCst);

        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };

        self.bar.println(format!(
            "  {} Page {:>3} image {:<3} {}  {}",
            red("✗"),
            page,
            position + 1,
            red(&msg),
            dim(&format!("{:.1}s", elapsed_ms as f64 / 1000.0)),
        ));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, captioned: usize, uncaptioned: usize) {
        self.bar.finish_and_clear();
        let failed = self.errors.load(Ordering::SeqCst);
        if uncaptioned == 0 {
            eprintln!(
                "{} {} images captioned",
                green("✔"),
                bold(&captioned.to_string())
            );
        } else {
            eprintln!(
                "{} {} images captioned, {} without caption ({} failed)",
                yellow("⚠"),
                bold(&captioned.to_string()),
                uncaptioned,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert with captions (key from the environment)
  export PAPER2MD_API_KEY=sk-...
  paper2md convert paper.pdf

  # Choose output and cache locations
  paper2md convert paper.pdf --output out/paper --db-dir ~/.cache/paper2md

  # Convert from URL, caching under the URL
  paper2md convert https://arxiv.org/pdf/1706.03762

  # Any edgequake-llm provider instead of the OpenAI-compatible endpoint
  paper2md convert paper.pdf --provider openai --model gpt-4.1-mini

  # Ignore the cached document (captions are still reused)
  paper2md convert paper.pdf --refresh

  # No key: images are embedded without captions
  paper2md convert paper.pdf

  # Inspect PDF metadata (no API key needed)
  paper2md inspect paper.pdf

  # Forget a cached document
  paper2md invalidate paper.pdf

OUTPUT:
  <output>/<stem>.md            assembled Markdown
  <output>/images/<sha256>.png  extracted images, named by content
  <db-dir>/paper2md.sqlite3     image store, caption and document cache

ENVIRONMENT VARIABLES:
  PAPER2MD_API_KEY        API key for the OpenAI-compatible endpoint
  PAPER2MD_BASE_URL       Endpoint base URL
  PAPER2MD_MODEL          Captioning model ID
  PAPER2MD_PROVIDER       edgequake-llm provider name (openai, anthropic, gemini, ollama)
  PAPER2MD_DB_DIR         Cache directory
  PDFIUM_LIB_PATH         Path to an existing libpdfium, skips auto-download
  PDFIUM_AUTO_CACHE_DIR   Override the default pdfium cache directory
"#;

/// Convert PDF papers to Markdown with VLM-captioned figures.
#[derive(Parser, Debug)]
#[command(
    name = "paper2md",
    version,
    about = "Convert PDF papers to Markdown with VLM-captioned figures",
    long_about = "Extract text and figures from PDF documents (local files or URLs), caption \
every figure with a Vision Language Model and assemble one Markdown file. Results are cached \
in SQLite, so re-running on the same document issues no model calls.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PAPER2MD_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "PAPER2MD_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a PDF to Markdown.
    Convert(ConvertArgs),
    /// Print PDF metadata only, no conversion.
    Inspect {
        /// Local PDF file path or HTTP/HTTPS URL.
        input: String,
        /// PDF user password for encrypted documents.
        #[arg(long, env = "PAPER2MD_PASSWORD")]
        password: Option<String>,
        /// Output JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Remove the cached document and captions for an input.
    Invalidate {
        /// Local PDF file path or HTTP/HTTPS URL.
        input: String,
        /// Cache identity used instead of the path or URL.
        #[arg(long)]
        identity: Option<String>,
        /// Cache directory.
        #[arg(long, env = "PAPER2MD_DB_DIR", default_value = DEFAULT_CACHE_DIR)]
        db_dir: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Output directory [default: outputs/<pdf stem>].
    #[arg(short, long, env = "PAPER2MD_OUTPUT")]
    output: Option<PathBuf>,

    /// API key for the OpenAI-compatible captioning endpoint.
    #[arg(long, env = "PAPER2MD_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Cache directory.
    #[arg(long, env = "PAPER2MD_DB_DIR", default_value = DEFAULT_CACHE_DIR)]
    db_dir: PathBuf,

    /// Base URL of the OpenAI-compatible endpoint.
    #[arg(long, env = "PAPER2MD_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Captioning model ID.
    #[arg(long, env = "PAPER2MD_MODEL", default_value = DEFAULT_MODEL)]
    model: String,

    /// edgequake-llm provider name, used when no API key is given.
    #[arg(long, env = "PAPER2MD_PROVIDER")]
    provider: Option<String>,

    /// Maximum concurrent caption requests.
    #[arg(short, long, env = "PAPER2MD_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Retries per image on transient model failures.
    #[arg(long, env = "PAPER2MD_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Cache identity used instead of the path or URL.
    #[arg(long)]
    identity: Option<String>,

    /// Skip the document cache lookup (captions are still reused).
    #[arg(long)]
    refresh: bool,

    /// Drop everything from the "References" heading onwards.
    #[arg(long)]
    strip_references: bool,

    /// Page separator: none, hr, comment, or custom string.
    #[arg(long, env = "PAPER2MD_SEPARATOR", default_value = "hr")]
    separator: String,

    /// Prepend YAML front-matter with document metadata.
    #[arg(long)]
    metadata: bool,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PAPER2MD_PASSWORD")]
    password: Option<String>,

    /// Path to a text file containing a custom caption prompt.
    #[arg(long)]
    caption_prompt: Option<PathBuf>,

    /// Whole-run deadline in seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Per-request model timeout in seconds.
    #[arg(long, env = "PAPER2MD_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "PAPER2MD_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Print the structured result (ConversionOutput) as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "PAPER2MD_NO_PROGRESS")]
    no_progress: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level library logs.
    let show_progress = match cli.command {
        Command::Convert(ref args) => !cli.quiet && !args.no_progress && !args.json,
        _ => false,
    };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Convert(ref args) => {
            ensure_pdfium(cli.quiet)?;
            run_convert(args, cli.quiet, show_progress).await
        }
        Command::Inspect {
            ref input,
            ref password,
            json,
        } => {
            ensure_pdfium(cli.quiet)?;
            run_inspect(input, password.as_deref(), json).await
        }
        Command::Invalidate {
            ref input,
            ref identity,
            ref db_dir,
        } => {
            let removed = invalidate(input, identity.as_deref(), db_dir)
                .context("Failed to invalidate cache entry")?;
            if !cli.quiet {
                if removed {
                    eprintln!("{} Cache entry removed for {}", green("✔"), bold(input));
                } else {
                    eprintln!("{} Nothing cached for {}", dim("·"), input);
                }
            }
            Ok(())
        }
    }
}

/// Download pdfium on first use (~30 MB) to the pdfium-auto cache dir.
/// Later startups only check the path.
fn ensure_pdfium(quiet: bool) -> Result<()> {
    if pdfium_auto::is_pdfium_cached() {
        return Ok(());
    }
    if quiet {
        tokio::task::block_in_place(|| pdfium_auto::ensure_pdfium_library(None))
            .context("Failed to download PDFium engine")?;
        return Ok(());
    }

    let dl_bar = ProgressBar::new(0);
    dl_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {bytes}/{total_bytes}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(SPINNER),
    );
    dl_bar.set_prefix("PDF engine");
    dl_bar.set_message("Connecting…");
    dl_bar.enable_steady_tick(Duration::from_millis(80));

    let bar = dl_bar.clone();
    tokio::task::block_in_place(|| {
        pdfium_auto::ensure_pdfium_library(Some(&|downloaded, total| {
            if let Some(t) = total {
                if bar.length().unwrap_or(0) != t {
                    bar.set_length(t);
                }
            }
            bar.set_position(downloaded);
        }))
    })
    .context("Failed to download PDFium engine")?;

    dl_bar.finish_with_message("ready ✓");
    Ok(())
}

async fn run_convert(args: &ConvertArgs, quiet: bool, show_progress: bool) -> Result<()> {
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new_dynamic() as Arc<dyn ConversionProgressCallback>)
    } else {
        None
    };

    let config = build_config(args, progress_cb).await?;
    if !config.captioning_enabled() && !quiet {
        eprintln!(
            "{} No API key or provider configured; images will be embedded without captions",
            yellow("⚠")
        );
    }

    let output = convert(&args.input, &config)
        .await
        .context("Conversion failed")?;

    if args.json {
        let json = serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
        println!("{json}");
    }
    if !quiet {
        print_summary(&output, show_progress);
    }
    Ok(())
}

/// Final report. Partial caption failure is a warning, never an error.
fn print_summary(output: &ConversionOutput, show_progress: bool) {
    let stats = &output.stats;
    if output.from_cache {
        eprintln!(
            "{}  served from cache  {} images  {}ms  →  {}",
            green("✔"),
            stats.total_images,
            stats.total_duration_ms,
            bold(&output.markdown_path.display().to_string()),
        );
        return;
    }

    let uncaptioned = stats.uncaptioned();
    eprintln!(
        "{}  {} pages  {}/{} images captioned  {}ms  →  {}",
        if uncaptioned == 0 {
            green("✔")
        } else {
            yellow("⚠")
        },
        stats.total_pages,
        stats.captioned_images,
        stats.total_images,
        stats.total_duration_ms,
        bold(&output.markdown_path.display().to_string()),
    );
    if !show_progress || stats.cached_captions > 0 {
        eprintln!(
            "   {} from cache  /  {} model calls",
            dim(&stats.cached_captions.to_string()),
            dim(&stats.model_calls.to_string()),
        );
    }
    if stats.failed_images > 0 {
        eprintln!(
            "{} {} images could not be captioned and are embedded without description",
            yellow("⚠"),
            stats.failed_images
        );
    }
}

async fn run_inspect(input: &str, password: Option<&str>, json: bool) -> Result<()> {
    let result = match password {
        Some(pwd) => {
            let config = ConversionConfig::builder()
                .password(pwd)
                .build()
                .context("Invalid configuration")?;
            Converter::new(config, Arc::new(PdfiumExtractor), None, None)
                .inspect(input)
                .await
        }
        None => inspect(input).await,
    };
    let meta = result.context("Failed to inspect PDF")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&meta).context("Failed to serialize metadata")?
        );
        return Ok(());
    }

    println!("File:         {}", input);
    if let Some(ref t) = meta.title {
        println!("Title:        {}", t);
    }
    if let Some(ref a) = meta.author {
        println!("Author:       {}", a);
    }
    if let Some(ref s) = meta.subject {
        println!("Subject:      {}", s);
    }
    println!("Pages:        {}", meta.page_count);
    println!("PDF Version:  {}", meta.pdf_version);
    if let Some(ref p) = meta.producer {
        println!("Producer:     {}", p);
    }
    if let Some(ref c) = meta.creator {
        println!("Creator:      {}", c);
    }
    if let Some(ref d) = meta.creation_date {
        println!("Created:      {}", d);
    }
    Ok(())
}

/// Map CLI args to `ConversionConfig`.
async fn build_config(
    args: &ConvertArgs,
    progress: Option<ProgressCallback>,
) -> Result<ConversionConfig> {
    let mut builder = ConversionConfig::builder()
        .base_url(&args.base_url)
        .model_identifier(&args.model)
        .cache_dir(&args.db_dir)
        .concurrency_limit(args.concurrency)
        .max_retries(args.max_retries)
        .refresh(args.refresh)
        .strip_references(args.strip_references)
        .page_separator(parse_separator(&args.separator))
        .include_metadata(args.metadata)
        .api_timeout_secs(args.api_timeout)
        .download_timeout_secs(args.download_timeout);

    if let Some(ref key) = args.api_key {
        builder = builder.api_key(key);
    }
    if let Some(ref provider) = args.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref dir) = args.output {
        builder = builder.output_dir(dir);
    }
    if let Some(ref id) = args.identity {
        builder = builder.cache_identity_override(id);
    }
    if let Some(ref pwd) = args.password {
        builder = builder.password(pwd);
    }
    if let Some(secs) = args.timeout {
        builder = builder.run_timeout_secs(secs);
    }
    if let Some(ref path) = args.caption_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read caption prompt from {:?}", path))?;
        builder = builder.caption_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Parse `--separator` string into `PageSeparator`.
fn parse_separator(s: &str) -> PageSeparator {
    match s.to_lowercase().as_str() {
        "none" => PageSeparator::None,
        "hr" | "---" => PageSeparator::HorizontalRule,
        "comment" => PageSeparator::Comment,
        _ => PageSeparator::Custom(s.to_string()),
    }
}
