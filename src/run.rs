use chrono::{DateTime, Utc};

use crate::config::{Config, ConfigStore, Credential, TOKEN_ENV};
use crate::debrid::{DebridClient, TorrentStatus};
use crate::http::{ReqwestTransport, RetryPolicy, Transport, TransportError};
use crate::rss::{process_feed, FeedSource, FeedStats};

/// Number of remote torrents inspected by the select-files sweep.
pub const SWEEP_LIMIT: u32 = 100;

/// Everything one invocation works with: the loaded config, the resolved
/// credential and the API client built from it.
pub struct RunContext<T> {
    pub config: Config,
    pub credential: Credential,
    pub debrid: DebridClient<T>,
}

impl RunContext<ReqwestTransport> {
    /// Builds a context for the real API, or `None` when no token is available.
    pub fn connect(config: Config) -> Result<Option<Self>, TransportError> {
        Self::with_transport(
            config,
            std::env::var(TOKEN_ENV).ok(),
            RetryPolicy::default(),
            |credential| ReqwestTransport::new(credential.token()),
        )
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Whether the advanced watermark was written back to the config file.
    pub saved: bool,
    pub feeds: usize,
    pub failed_feeds: usize,
    pub totals: FeedStats,
    pub selected: usize,
}

impl<T: Transport> RunContext<T> {
    pub fn new(config: Config, credential: Credential, debrid: DebridClient<T>) -> Self {
        Self {
            config,
            credential,
            debrid,
        }
    }

    /// Resolves the credential and only then builds the transport with it.
    ///
    /// Returns `None` without calling `connect` when neither the config nor
    /// `env_token` holds a token.
    pub fn with_transport<C>(
        config: Config,
        env_token: Option<String>,
        policy: RetryPolicy,
        connect: C,
    ) -> Result<Option<Self>, TransportError>
    where
        C: FnOnce(&Credential) -> Result<T, TransportError>,
    {
        let credential = match Credential::resolve(&config, env_token) {
            Some(credential) => credential,
            None => return Ok(None),
        };
        let debrid = DebridClient::new(connect(&credential)?, policy);

        Ok(Some(Self::new(config, credential, debrid)))
    }

    /// Processes every configured feed, then stores `now` as the new
    /// watermark and finalizes torrents waiting for file selection.
    ///
    /// The watermark advances even if some feeds failed, so their entries
    /// from this window are not retried by the next run. A failed save is
    /// logged and reported in the summary; the sweep still runs.
    pub fn run_pass<F: FeedSource>(
        &mut self,
        feeds: &F,
        store: &ConfigStore,
        now: DateTime<Utc>,
    ) -> RunSummary {
        let mut summary = RunSummary::default();

        let urls = self.config.rss_urls.clone();
        if urls.is_empty() {
            log::warn!("Missing RSS url. To add RSS url, use --add <value>");
            return summary;
        }

        let watermark = self.config.watermark();
        let trackers = self.config.trackers();
        for (i, url) in urls.iter().enumerate() {
            log::info!("({}/{}) {url}", i + 1, urls.len());
            summary.feeds += 1;
            match process_feed(url, watermark, feeds, &self.debrid, trackers.as_slice()) {
                Ok(stats) => summary.totals += stats,
                Err(err) => {
                    summary.failed_feeds += 1;
                    log::error!("Couldn't process feed `{url}`: {err}");
                }
            }
        }

        self.config.advance_watermark(now);
        match store.save(&self.config) {
            Ok(()) => summary.saved = true,
            Err(err) => log::error!("Couldn't store update time: {err:#}"),
        }

        summary.selected = self.select_files_sweep();
        summary
    }

    /// Selects all files of every torrent waiting for file selection.
    pub fn select_files_sweep(&self) -> usize {
        let mut selected = 0;
        for torrent in self.debrid.list_torrents(SWEEP_LIMIT) {
            if torrent.status != TorrentStatus::WaitingFilesSelection {
                continue;
            }

            let name = torrent.filename.as_deref().unwrap_or(&torrent.id);
            match self.debrid.select_files(&torrent.id) {
                Ok(()) => {
                    log::debug!("Selected files of `{name}`");
                    selected += 1;
                }
                Err(err) => log::error!("Files of `{name}` could not be selected: {err}"),
            }
        }

        log::info!("Successfully selected {selected} files on RD.");
        selected
    }

    /// Adds one magnet without checking the cache first.
    pub fn submit_magnet(&self, magnet: &str) -> bool {
        match self.debrid.add_magnet(magnet) {
            Ok(()) => true,
            Err(err) => {
                log::error!("Failed to add magnet: {err}");
                false
            }
        }
    }
}
