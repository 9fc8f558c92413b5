use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;

use feedmail::config::{AppConfig, TransportKind};
use feedmail::feed::Fetcher;
use feedmail::mail::{MailTransport, MessageTemplate, DEFAULT_TEMPLATE};
use feedmail::processor::{Processor, ProcessorSettings, RunReport};
use feedmail::storage::{Database, StateError, StateStore};
use feedmail::subscriptions::{file, opml, parse_notify, FeedConfig, SubscriptionError};
use feedmail::util::validate_url;

const FEEDS_FILE: &str = "feeds.txt";
const CONFIG_FILE: &str = "config.toml";
const STATE_FILE: &str = "state.db";

#[derive(Parser, Debug)]
#[command(name = "feedmail", version, about = "Mail new Atom/RSS entries as they appear")]
struct Cli {
    /// Configuration directory (default: ~/.config/feedmail)
    #[arg(long, global = true, value_name = "DIR")]
    dir: Option<PathBuf>,

    /// Log debug output to stderr (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll every feed once and mail new entries
    Cron(RunArgs),
    /// Poll repeatedly, sleeping between runs
    Daemon(RunArgs),
    /// List subscribed feeds
    List {
        /// Show each feed's options too
        #[arg(long)]
        options: bool,
    },
    /// Subscribe to a feed
    Add { url: String },
    /// Unsubscribe from a feed
    Del { url: String },
    /// Subscribe to every feed in an OPML file
    Import { file: PathBuf },
    /// Print subscriptions as OPML
    Export,
    /// List every remembered item, grouped by feed
    Seen,
    /// Forget items so they are mailed again
    Unsee {
        #[arg(required = true, value_name = "LINK")]
        links: Vec<String>,
    },
    /// Show the effective configuration
    Config,
    /// Print the built-in message template
    ListDefaultTemplate,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Record state but do not send anything
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Recipient addresses
    #[arg(value_name = "EMAIL")]
    recipients: Vec<String>,
}

/// Everything a command may need from the config directory.
struct Workspace {
    dir: PathBuf,
    config: AppConfig,
}

impl Workspace {
    fn feeds_path(&self) -> PathBuf {
        self.dir.join(FEEDS_FILE)
    }

    async fn open_store(&self) -> Result<Database> {
        let path = self.dir.join(STATE_FILE);
        let path = path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in state database path"))?;
        match Database::open(path).await {
            Ok(db) => Ok(db),
            Err(StateError::Locked) => {
                bail!("Another feedmail process is using {path}; try again once it has finished")
            }
            Err(e) => Err(e).context("Failed to open state database"),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let dir = match cli.dir {
        Some(dir) => dir,
        None => get_config_dir()?,
    };
    ensure_config_dir(&dir)?;

    let mut config = AppConfig::load(&dir.join(CONFIG_FILE)).context("Failed to load config.toml")?;
    config
        .apply_env(|key| std::env::var(key).ok())
        .context("Invalid SMTP environment")?;
    let ctx = Workspace { dir, config };

    match cli.command {
        Command::Cron(args) => cron(&ctx, args).await,
        Command::Daemon(args) => daemon(&ctx, args).await,
        Command::List { options } => list(&ctx, options).map(|()| ExitCode::SUCCESS),
        Command::Add { url } => add(&ctx, &url).map(|()| ExitCode::SUCCESS),
        Command::Del { url } => del(&ctx, &url).map(|()| ExitCode::SUCCESS),
        Command::Import { file } => import(&ctx, &file).await.map(|()| ExitCode::SUCCESS),
        Command::Export => export(&ctx).map(|()| ExitCode::SUCCESS),
        Command::Seen => seen(&ctx).await.map(|()| ExitCode::SUCCESS),
        Command::Unsee { links } => unsee(&ctx, &links).await.map(|()| ExitCode::SUCCESS),
        Command::Config => {
            show_config(&ctx);
            Ok(ExitCode::SUCCESS)
        }
        Command::ListDefaultTemplate => {
            print!("{DEFAULT_TEMPLATE}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Get the config directory path (~/.config/feedmail/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedmail"))
}

fn ensure_config_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        tracing::info!(path = %dir.display(), "Created config directory");
    }

    // User-only access: the directory holds SMTP credentials and state
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(dir) {
            Ok(metadata) => {
                let mut perms = metadata.permissions();
                perms.set_mode(0o700);
                if let Err(e) = std::fs::set_permissions(dir, perms) {
                    tracing::warn!(
                        path = %dir.display(),
                        error = %e,
                        "Failed to set config directory permissions to 0700"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %dir.display(),
                    error = %e,
                    "Failed to read config directory metadata"
                );
            }
        }
    }

    Ok(())
}

// ============================================================================
// Polling
// ============================================================================

fn load_feeds(ctx: &Workspace) -> Result<Vec<FeedConfig>> {
    let path = ctx.feeds_path();
    file::load(&path).with_context(|| {
        format!(
            "No usable feed list at {}; add one with `feedmail add URL`",
            path.display()
        )
    })
}

/// Like [`load_feeds`], but a missing file is an empty list.
fn load_feeds_or_empty(ctx: &Workspace) -> Result<Vec<FeedConfig>> {
    match file::load(&ctx.feeds_path()) {
        Ok(feeds) => Ok(feeds),
        Err(SubscriptionError::Io { source, .. })
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            Ok(Vec::new())
        }
        Err(e) => Err(e.into()),
    }
}

fn check_recipients(feeds: &[FeedConfig], args: &RunArgs) -> Result<()> {
    // The last `notify` wins, and one naming no address leaves the feed uncovered
    let uncovered = feeds
        .iter()
        .any(|f| f.values("notify").last().and_then(parse_notify).is_none());
    if !args.dry_run && args.recipients.is_empty() && uncovered {
        bail!("No recipients given; pass at least one EMAIL or use --dry-run");
    }
    Ok(())
}

fn build_transport(config: &AppConfig) -> Result<MailTransport> {
    let transport = match config.transport_kind() {
        TransportKind::Sendmail => {
            MailTransport::sendmail(config.sendmail_path.as_os_str(), config.from.as_deref())?
        }
        TransportKind::Smtp => {
            let settings = config.smtp_settings()?;
            MailTransport::smtp(&settings, config.from.as_deref())?
        }
    };
    tracing::debug!(transport = ?config.transport_kind(), "Selected mail transport");
    Ok(transport)
}

async fn build_processor(
    ctx: &Workspace,
    args: &RunArgs,
) -> Result<Processor<Database, MailTransport>> {
    let store = ctx.open_store().await?;
    let transport = build_transport(&ctx.config)?;
    let fetcher = Fetcher::new().context("Failed to build HTTP client")?;
    let template = MessageTemplate::from_dir(&ctx.dir)
        .await
        .context("Failed to load message template")?;
    let settings = ProcessorSettings {
        send: !args.dry_run,
        host_delay: ctx.config.host_delay(),
        defaults: ctx.config.option_defaults(&ctx.dir),
        subject: ctx.config.subject.clone(),
        template: Arc::new(template),
    };
    Ok(Processor::new(store, transport, fetcher, settings))
}

/// Prints every feed error; returns the exit code for the run.
fn summarize(report: &RunReport) -> ExitCode {
    for error in &report.errors {
        eprintln!("{error}");
    }
    if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn cron(ctx: &Workspace, args: RunArgs) -> Result<ExitCode> {
    let feeds = load_feeds(ctx)?;
    check_recipients(&feeds, &args)?;

    let mut processor = build_processor(ctx, &args).await?;
    let report = processor
        .run(&feeds, &args.recipients)
        .await
        .context("Run aborted")?;
    processor.store().close().await;

    Ok(summarize(&report))
}

async fn daemon(ctx: &Workspace, args: RunArgs) -> Result<ExitCode> {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, stopping after the current feed");
            let _ = stop_tx.send(true);
        }
    });

    let mut processor = build_processor(ctx, &args)
        .await?
        .with_shutdown(stop_rx.clone());
    let sleep = ctx.config.daemon_sleep();

    // The exit code reflects the last completed round
    let exit = loop {
        // Re-read each round so edits to feeds.txt apply without a restart
        let exit = match load_feeds(ctx).and_then(|feeds| {
            check_recipients(&feeds, &args)?;
            Ok(feeds)
        }) {
            Ok(feeds) => {
                let report = processor
                    .run(&feeds, &args.recipients)
                    .await
                    .context("Run aborted")?;
                summarize(&report)
            }
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "Skipping run");
                ExitCode::FAILURE
            }
        };

        if *stop_rx.borrow() {
            break exit;
        }
        tracing::info!(minutes = sleep.as_secs() / 60, "Sleeping until next run");
        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            _ = stop_rx.wait_for(|stop| *stop) => break exit,
        }
    };

    processor.store().close().await;
    Ok(exit)
}

// ============================================================================
// Subscriptions
// ============================================================================

fn list(ctx: &Workspace, options: bool) -> Result<()> {
    for feed in load_feeds_or_empty(ctx)? {
        println!("{}", feed.url);
        if options {
            for opt in &feed.options {
                println!("  {}: {}", opt.name, opt.value);
            }
        }
    }
    Ok(())
}

fn add(ctx: &Workspace, url: &str) -> Result<()> {
    let url = validate_url(url)?.to_string();
    let mut feeds = load_feeds_or_empty(ctx)?;
    if !file::add(&mut feeds, &url) {
        println!("Already subscribed to {url}");
        return Ok(());
    }
    file::save(&ctx.feeds_path(), &feeds)?;
    println!("Added {url}");
    Ok(())
}

fn del(ctx: &Workspace, url: &str) -> Result<()> {
    let mut feeds = load_feeds(ctx)?;
    if !file::remove(&mut feeds, url.trim()) {
        bail!("Not subscribed to {url}");
    }
    file::save(&ctx.feeds_path(), &feeds)?;
    println!("Removed {url}");
    Ok(())
}

async fn import(ctx: &Workspace, path: &Path) -> Result<()> {
    let imported = opml::import(path)
        .await
        .with_context(|| format!("Failed to import {}", path.display()))?;

    let mut feeds = load_feeds_or_empty(ctx)?;
    let mut added = 0;
    for feed in &imported {
        if file::add(&mut feeds, &feed.xml_url) {
            added += 1;
        }
    }

    if added > 0 {
        file::save(&ctx.feeds_path(), &feeds)?;
    }
    println!(
        "Imported {added} new feed(s) ({} in file)",
        imported.len()
    );
    Ok(())
}

fn export(ctx: &Workspace) -> Result<()> {
    let feeds = load_feeds_or_empty(ctx)?;
    print!("{}", opml::export_opml(&feeds)?);
    Ok(())
}

// ============================================================================
// State
// ============================================================================

async fn seen(ctx: &Workspace) -> Result<()> {
    let store = ctx.open_store().await?;
    for bucket in store.buckets().await? {
        println!("{bucket}");
        for key in store.keys(&bucket).await? {
            println!("    {key}");
        }
    }
    store.close().await;
    Ok(())
}

async fn unsee(ctx: &Workspace, links: &[String]) -> Result<()> {
    let store = ctx.open_store().await?;
    for link in links {
        let removed = store.unsee(link).await?;
        if removed == 0 {
            eprintln!("Not seen: {link}");
        } else {
            println!("Forgot {link} ({removed} feed(s))");
        }
    }
    store.close().await;
    Ok(())
}

fn show_config(ctx: &Workspace) {
    println!("directory: {}", ctx.dir.display());
    println!("transport: {:?}", ctx.config.transport_kind());
    println!("{:#?}", ctx.config);
}
