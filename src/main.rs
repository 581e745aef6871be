use rd_rss::config::{ConfigStore, DEFAULT_CONFIG_PATH};
use rd_rss::http::ReqwestTransport;
use rd_rss::rss::HttpFeedSource;
use rd_rss::RunContext;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;

/// Feed magnet links from RSS feeds into Real-Debrid
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to the config file
    #[clap(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Set Real-Debrid token (acquire token at https://real-debrid.com/apitoken)
    #[clap(short, long)]
    token: Option<String>,

    /// List RSS urls
    #[clap(short, long)]
    list: bool,

    /// Add RSS url
    #[clap(short, long)]
    add: Option<String>,

    /// Remove RSS url at index (obtained using --list)
    #[clap(short, long)]
    remove: Option<usize>,

    /// Add magnet to Real-Debrid
    #[clap(short, long)]
    magnet: Option<String>,

    /// Select added files on Real-Debrid
    #[clap(short, long)]
    select: bool,

    /// Add the preferred YTS RSS feeds
    #[clap(long)]
    auto_add_feeds: bool,
}

fn main() -> Result<()> {
    pretty_env_logger::formatted_builder()
        .filter(None, log::LevelFilter::Warn)
        .filter(Some("rd_rss"), log::LevelFilter::Info)
        .parse_filters(&std::env::var("RUST_LOG").unwrap_or_default())
        .init();

    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            log::warn!("Ignoring .env file: {err}");
        }
    }

    let args = Args::parse();
    let store = ConfigStore::new(&args.config);

    if let Some(token) = args.token {
        let mut cfg = store.load()?;
        cfg.auth_token = token;
        store.save(&cfg).context("Couldn't store token")?;
        log::info!("Token successfully added.");
    } else if args.list {
        list_feeds(&store)?;
    } else if let Some(url) = args.add {
        let mut cfg = store.load()?;
        cfg.add_feed(&url)?;
        store.save(&cfg).context("Couldn't store RSS url")?;
        log::info!("RSS url successfully added.");
    } else if let Some(index) = args.remove {
        let mut cfg = store.load()?;
        match cfg.remove_feed(index) {
            Ok(url) => {
                store.save(&cfg).context("Couldn't remove RSS url")?;
                log::info!("RSS url `{url}` successfully removed.");
            }
            Err(err) => log::error!("{err}"),
        }
    } else if let Some(magnet) = args.magnet {
        if let Some(ctx) = connect(&store)? {
            ctx.submit_magnet(&magnet);
        }
    } else if args.select {
        if let Some(ctx) = connect(&store)? {
            ctx.select_files_sweep();
        }
    } else if args.auto_add_feeds {
        let mut cfg = store.load()?;
        let added = cfg.add_preferred_feeds();
        if added.is_empty() {
            log::info!("All preferred RSS feeds already added.");
        } else {
            store.save(&cfg).context("Failed to save RSS feeds")?;
            for url in &added {
                log::info!("Added preferred RSS feed: {url}");
            }
            log::info!("Successfully added {} preferred RSS feeds.", added.len());
        }
    } else if let Some(mut ctx) = connect(&store)? {
        let feeds = HttpFeedSource::new()?;
        let summary = ctx.run_pass(&feeds, &store, Utc::now());
        log::info!(
            "Run finished: {} feeds ({} failed), {} cached, {} added, {} skipped, {} selected",
            summary.feeds,
            summary.failed_feeds,
            summary.totals.cached,
            summary.totals.added,
            summary.totals.skipped,
            summary.selected
        );
    }

    Ok(())
}

fn connect(store: &ConfigStore) -> Result<Option<RunContext<ReqwestTransport>>> {
    let cfg = store.load()?;
    let ctx = RunContext::connect(cfg).context("Unable to build the HTTP client")?;
    if ctx.is_none() {
        log::error!(
            "Missing Real-Debrid authentication token. Set RD_TOKEN environment variable or use --token <value>"
        );
    }
    Ok(ctx)
}

fn list_feeds(store: &ConfigStore) -> Result<()> {
    let cfg = store.load()?;
    if cfg.rss_urls.is_empty() {
        println!("No RSS url added. To add RSS url, use --add <value>");
        return Ok(());
    }

    println!("RSS urls stored:");
    for (i, url) in cfg.rss_urls.iter().enumerate() {
        println!(" [{}] {url}", i + 1);
    }
    Ok(())
}
