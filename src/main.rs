use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval};

use feedsync::config::{config_dir, Config};
use feedsync::feed::{build_client, FetchEvent, HttpDownloader};
use feedsync::storage::{Database, DatabaseError};
use feedsync::sync::{
    Aggregator, ContentClassifier, KeywordClassifier, NoopClassifier, Notice, ReconciliationEngine,
    RetentionPolicy,
};

#[derive(Parser, Debug)]
#[command(name = "feedsync", about = "Keeps a local store of RSS/Atom feeds in sync")]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/feedsync/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// SQLite database (overrides `database_path` from the config)
    #[arg(long, value_name = "FILE", global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a feed
    Add {
        url: String,
        /// Tags for the feed's channels, comma separated
        #[arg(short, long, value_delimiter = ',')]
        tags: Vec<String>,
    },
    /// Unsubscribe from a feed
    Remove { url: String },
    /// Fetch one feed, or every feed when no URL is given
    Refresh { url: Option<String> },
    /// Subscribe to every feed in an OPML file
    Import {
        file: PathBuf,
        /// Tags added to every imported feed, comma separated
        #[arg(short, long, value_delimiter = ',')]
        tags: Vec<String>,
    },
    /// List feeds, channels and unread counts
    List,
    /// Mark every item of a feed (or of all feeds) as read
    MarkRead { url: Option<String> },
    /// Stay running, refreshing on the configured interval
    Watch,
}

/// Everything a command needs: the engine host, its event stream and the store.
struct Session {
    aggregator: Aggregator<HttpDownloader>,
    events: mpsc::UnboundedReceiver<FetchEvent>,
    db: Database,
    retention: watch::Sender<RetentionPolicy>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("feedsync=info,sqlx=warn,reqwest=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn config_path(args: &Args) -> Option<PathBuf> {
    args.config
        .clone()
        .or_else(|| config_dir().map(|dir| dir.join("config.toml")))
}

async fn open_database(path: &Path) -> Result<Database> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data directory {}", parent.display()))?;
    }
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    match Database::open(path_str).await {
        Ok(db) => Ok(db),
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: Another instance of feedsync appears to be running. Please close it and try again.");
            std::process::exit(1);
        }
        Err(e) => Err(anyhow::anyhow!("Failed to open database: {}", e)),
    }
}

async fn open_session(args: &Args, config: &Config) -> Result<Session> {
    let db_path = args
        .db
        .clone()
        .or_else(|| config.database_path())
        .context("Could not determine a database path; set HOME or pass --db")?;
    let db = open_database(&db_path).await?;
    let feeds = db.load_feeds().await.context("Failed to load feeds")?;
    tracing::debug!(path = %db_path.display(), feeds = feeds.len(), "Opened store");

    let client = build_client(&config.user_agent).context("Failed to build HTTP client")?;
    let (tx, events) = mpsc::unbounded_channel();
    let downloader = HttpDownloader::new(client, tx).allow_private_hosts(config.allow_private_hosts);

    let (retention, retention_rx) = watch::channel(config.retention());
    let classifier: Box<dyn ContentClassifier> = if config.classifier_rules.is_empty() {
        Box::new(NoopClassifier)
    } else {
        Box::new(KeywordClassifier::new(config.classifier_rules.clone()))
    };
    let engine = ReconciliationEngine::new(retention_rx, classifier);
    let aggregator = Aggregator::new(downloader, engine)
        .with_feeds(feeds)
        .with_global_tags(config.global_tags.iter().cloned());

    Ok(Session {
        aggregator,
        events,
        db,
        retention,
    })
}

fn print_notices(aggregator: &mut Aggregator<HttpDownloader>) {
    for notice in aggregator.take_notices() {
        match notice {
            Notice::Updated(text) => println!("{}", text),
            Notice::Error(text) => eprintln!("Error: {}", text),
        }
    }
}

/// Processes downloader events until no job is left, then saves.
async fn drain(session: &mut Session) -> Result<()> {
    while session.aggregator.pending_jobs() > 0 {
        let Some(event) = session.events.recv().await else {
            tracing::warn!("Downloader event stream closed with jobs pending");
            break;
        };
        session.aggregator.handle_event(event);
        // View events only matter to an interactive front end.
        session.aggregator.take_events();
        print_notices(&mut session.aggregator);
    }
    session
        .aggregator
        .flush(&session.db)
        .await
        .context("Failed to save feeds")?;
    Ok(())
}

fn list(session: &Session) {
    let registry = session.aggregator.registry();
    if registry.is_empty() {
        println!("No feeds. Add one with: feedsync add <URL>");
        return;
    }
    for feed in registry.feeds() {
        if feed.tags.is_empty() {
            println!("{}", feed.url);
        } else {
            println!("{} [{}]", feed.url, feed.tags.join(", "));
        }
        for channel in &feed.channels {
            println!(
                "  {} ({} unread / {} items)",
                channel.title,
                channel.unread_count(),
                channel.items.len()
            );
        }
    }
    println!("Total unread: {}", session.aggregator.unread_count());
}

fn mark_read(session: &mut Session, url: Option<&str>) -> Result<usize> {
    let channels: Vec<_> = session
        .aggregator
        .registry()
        .feeds()
        .filter(|feed| url.map_or(true, |u| feed.url == u))
        .flat_map(|feed| feed.channels.iter().map(|c| c.id()))
        .collect();
    if let Some(url) = url {
        if !session.aggregator.registry().contains(url) {
            anyhow::bail!("Not subscribed to {}", url);
        }
    }
    let mut marked = 0;
    for id in channels {
        marked += session.aggregator.mark_channel(id, false)?;
    }
    Ok(marked)
}

/// Refresh timer for `period`; the first tick comes one full period from now.
fn refresh_timer(period: Option<Duration>) -> Option<Interval> {
    period.map(|p| tokio::time::interval_at(Instant::now() + p, p))
}

/// Restarts `timer` if `wanted` differs from the period it runs at. Returns whether it did.
fn retime(timer: &mut Option<Interval>, period: &mut Option<Duration>, wanted: Option<Duration>) -> bool {
    if *period == wanted {
        return false;
    }
    *period = wanted;
    *timer = refresh_timer(wanted);
    true
}

async fn run_watch(
    session: &mut Session,
    config: Config,
    config_file: Option<PathBuf>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let mut config = config;
    if config.update_on_startup {
        session.aggregator.update_all();
    }

    let mut period = config.update_interval();
    let mut interval = refresh_timer(period);
    let mut save_at: Option<Instant> = None;
    tokio::pin!(shutdown);
    tracing::info!(
        feeds = session.aggregator.registry().len(),
        interval_minutes = config.update_interval_minutes,
        "Watching feeds"
    );

    loop {
        let tick = async {
            match interval.as_mut() {
                Some(interval) => {
                    interval.tick().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            event = session.events.recv() => {
                let Some(event) = event else { break };
                session.aggregator.handle_event(event);
                session.aggregator.take_events();
                print_notices(&mut session.aggregator);
            }
            _ = tick => {
                if let Some(path) = &config_file {
                    match Config::load(path) {
                        Ok(reloaded) => {
                            if reloaded.retention() != config.retention() {
                                tracing::info!(
                                    max_items = reloaded.max_items_per_channel,
                                    max_age_days = reloaded.max_item_age_days,
                                    "Retention limits changed"
                                );
                                session.retention.send_replace(reloaded.retention());
                            }
                            config = reloaded;
                        }
                        Err(e) => tracing::warn!(error = %e, "Keeping previous configuration"),
                    }
                }
                session.aggregator.update_all();
                print_notices(&mut session.aggregator);
            }
            _ = tokio::time::sleep_until(save_at.unwrap_or_else(Instant::now)), if save_at.is_some() => {
                save_at = None;
                if let Err(e) = session.aggregator.flush(&session.db).await {
                    tracing::error!(error = %e, "Failed to save feeds");
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
        }

        if retime(&mut interval, &mut period, config.update_interval()) {
            tracing::info!(interval_minutes = config.update_interval_minutes, "Refresh interval changed");
        }
        // The save delay is read from the current config, so reloads apply to the next save.
        if save_at.is_none() && session.aggregator.save_scheduled() {
            save_at = Some(Instant::now() + config.save_delay());
        }
    }

    let cancelled = session.aggregator.cancel_all();
    tracing::debug!(cancelled, "Cancelled in-flight downloads");
    session
        .aggregator
        .flush(&session.db)
        .await
        .context("Failed to save feeds")?;
    Ok(())
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Could not listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config_file = config_path(&args);
    let config = match &config_file {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    let mut session = open_session(&args, &config).await?;

    match &args.command {
        Command::Add { url, tags } => {
            session.aggregator.add_feed(url, tags.clone())?;
            drain(&mut session).await?;
        }
        Command::Remove { url } => {
            let feed = session.aggregator.remove_feed(url)?;
            drain(&mut session).await?;
            println!("Removed {} ({} channels)", feed.url, feed.channels.len());
        }
        Command::Refresh { url: Some(url) } => {
            session.aggregator.update_feed(url)?;
            drain(&mut session).await?;
        }
        Command::Refresh { url: None } => {
            session.aggregator.update_all();
            print_notices(&mut session.aggregator);
            drain(&mut session).await?;
        }
        Command::Import { file, tags } => {
            let results = session
                .aggregator
                .import_opml(file, tags)
                .await
                .with_context(|| format!("Failed to import {}", file.display()))?;
            for (url, result) in &results {
                if let Err(e) = result {
                    eprintln!("Skipping {}: {}", url, e);
                }
            }
            drain(&mut session).await?;
        }
        Command::List => list(&session),
        Command::MarkRead { url } => {
            let marked = mark_read(&mut session, url.as_deref())?;
            drain(&mut session).await?;
            println!("Marked {} items as read", marked);
        }
        Command::Watch => run_watch(&mut session, config, config_file, ctrl_c()).await?,
    }

    Ok(())
}
