use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use rss::{Channel, Item};
use thiserror::Error;

use crate::debrid::DebridClient;
use crate::http::{Transport, TIMEOUT};
use crate::magnet::{self, MagnetReference, YTS_DOWNLOAD_PREFIX};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Couldn't fetch feed: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("Feed is invalid: {0}")]
    Parse(#[from] rss::Error),
    #[error("RSS had no entries")]
    Empty,
}

/// One item of a feed, reduced to what decides whether it is submitted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedEntry {
    pub primary_link: Option<String>,
    pub enclosure_links: Vec<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl FeedEntry {
    /// Whether the entry is newer than `watermark`. Undated entries always are.
    pub fn is_new(&self, watermark: DateTime<Utc>) -> bool {
        match self.updated_at {
            Some(updated_at) => updated_at > watermark,
            None => true,
        }
    }
}

impl From<Item> for FeedEntry {
    fn from(item: Item) -> Self {
        let updated_at = item
            .pub_date()
            .and_then(|date| DateTime::parse_from_rfc2822(date).ok())
            .or_else(|| {
                item.dublin_core_ext()
                    .and_then(|dc| dc.dates().first())
                    .and_then(|date| DateTime::parse_from_rfc3339(date).ok())
            })
            .map(|date| date.with_timezone(&Utc));

        FeedEntry {
            enclosure_links: item.enclosure.map(|e| e.url).into_iter().collect(),
            primary_link: item.link,
            updated_at,
        }
    }
}

/// Produces the entries of a feed.
pub trait FeedSource {
    fn fetch(&self, url: &str) -> Result<Vec<FeedEntry>, FeedError>;
}

/// Downloads and parses RSS feeds over HTTP.
pub struct HttpFeedSource {
    client: Client,
}

impl HttpFeedSource {
    pub fn new() -> Result<Self, FeedError> {
        let client = Client::builder().timeout(TIMEOUT).build()?;
        Ok(Self { client })
    }
}

impl FeedSource for HttpFeedSource {
    fn fetch(&self, url: &str) -> Result<Vec<FeedEntry>, FeedError> {
        let content = self.client.get(url).send()?.error_for_status()?.bytes()?;
        let channel = Channel::read_from(&content[..])?;

        let entries: Vec<FeedEntry> = channel
            .into_items()
            .into_iter()
            .map(FeedEntry::from)
            .collect();
        if entries.is_empty() {
            return Err(FeedError::Empty);
        }
        Ok(entries)
    }
}

/// Finds the torrent an entry points to, as a magnet.
///
/// In order: a magnet primary link, the first magnet enclosure, then the
/// first provider download enclosure. A provider link that does not end in a
/// 40 character hash ends the search.
pub fn resolve<S: AsRef<str>>(entry: &FeedEntry, trackers: &[S]) -> Option<MagnetReference> {
    let uri = match entry.primary_link.as_deref() {
        Some(link) if link.starts_with("magnet:") => link.to_string(),
        _ => match entry
            .enclosure_links
            .iter()
            .find(|link| link.starts_with("magnet:"))
        {
            Some(link) => link.clone(),
            None => {
                let provider = entry
                    .enclosure_links
                    .iter()
                    .find(|link| link.starts_with(YTS_DOWNLOAD_PREFIX))?;
                magnet::from_provider_url(provider, trackers)?
            }
        },
    };

    Some(MagnetReference::new(uri))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeedStats {
    pub added: usize,
    pub cached: usize,
    pub skipped: usize,
}

impl std::ops::AddAssign for FeedStats {
    fn add_assign(&mut self, other: Self) {
        self.added += other.added;
        self.cached += other.cached;
        self.skipped += other.skipped;
    }
}

/// Submits the cached torrents of one feed published after `watermark`.
pub fn process_feed<T, F, S>(
    feed_url: &str,
    watermark: DateTime<Utc>,
    source: &F,
    debrid: &DebridClient<T>,
    trackers: &[S],
) -> Result<FeedStats, FeedError>
where
    T: Transport,
    F: FeedSource,
    S: AsRef<str>,
{
    let mut stats = FeedStats::default();

    let entries = match source.fetch(feed_url) {
        Ok(entries) if !entries.is_empty() => entries,
        Ok(_) | Err(FeedError::Empty) => {
            log::warn!("Fetch from RSS failed ({})", FeedError::Empty);
            return Ok(stats);
        }
        Err(err) => return Err(err),
    };

    for entry in entries.iter().filter(|entry| entry.is_new(watermark)) {
        let magnet = match resolve(entry, trackers) {
            Some(magnet) => magnet,
            None => {
                log::debug!("No torrent link in entry {entry:?}");
                continue;
            }
        };

        if !debrid.check_cached(&magnet) {
            stats.skipped += 1;
            log::info!("Skipping uncached torrent");
            continue;
        }

        stats.cached += 1;
        match debrid.add_magnet(&magnet.uri) {
            Ok(()) => stats.added += 1,
            Err(err) => log::error!("Failed to add magnet: {err}"),
        }
    }

    log::info!(
        "Found {} cached torrents, successfully added {} to RD, skipped {} uncached.",
        stats.cached,
        stats.added,
        stats.skipped
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;
    use std::collections::HashMap;

    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use crate::http::{ApiRequest, ApiResponse, RetryPolicy, TransportError};
    use crate::magnet::DEFAULT_TRACKERS;

    const HASH: &str = "c9e15763f722f23e98a29decdfae341b98d53056";
    const OTHER: &str = "dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c";

    struct StaticFeeds(HashMap<String, Vec<FeedEntry>>);

    impl FeedSource for StaticFeeds {
        fn fetch(&self, url: &str) -> Result<Vec<FeedEntry>, FeedError> {
            self.0.get(url).cloned().ok_or(FeedError::Empty)
        }
    }

    fn feeds(url: &str, entries: Vec<FeedEntry>) -> StaticFeeds {
        StaticFeeds(HashMap::from([(url.to_string(), entries)]))
    }

    fn magnet_entry(hash: &str, updated_at: Option<DateTime<Utc>>) -> FeedEntry {
        FeedEntry {
            primary_link: Some(format!("magnet:?xt=urn:btih:{hash}")),
            enclosure_links: Vec::new(),
            updated_at,
        }
    }

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
    }

    fn cached_body(hash: &str) -> String {
        format!(r#"{{"{hash}": {{"rd": [{{"1": {{"filename": "movie.mkv"}}}}]}}}}"#)
    }

    /// Answers cache checks from `cached` and accepts every added magnet.
    fn api<'a>(
        requests: &'a RefCell<Vec<ApiRequest>>,
        cached: &'a [&'a str],
    ) -> DebridClient<impl Transport + 'a> {
        let transport = move |request: &ApiRequest| -> Result<ApiResponse, TransportError> {
            requests.borrow_mut().push(request.clone());
            let response = match request.path.rsplit('/').next() {
                Some("addMagnet") => ApiResponse::new(201, r#"{"id": "X"}"#),
                Some(hash) if cached.contains(&hash.to_ascii_lowercase().as_str()) => {
                    ApiResponse::new(200, cached_body(&hash.to_ascii_lowercase()))
                }
                _ => ApiResponse::new(404, ""),
            };
            Ok(response)
        };
        DebridClient::new(transport, RetryPolicy::immediate(0))
    }

    fn added(requests: &RefCell<Vec<ApiRequest>>) -> usize {
        requests
            .borrow()
            .iter()
            .filter(|r| r.path == "torrents/addMagnet")
            .count()
    }

    #[test]
    fn magnet_primary_link_wins() {
        let entry = FeedEntry {
            primary_link: Some(format!("magnet:?xt=urn:btih:{}", HASH.to_uppercase())),
            enclosure_links: vec![format!("magnet:?xt=urn:btih:{OTHER}")],
            updated_at: None,
        };

        let magnet = resolve(&entry, DEFAULT_TRACKERS).unwrap();
        assert_eq!(magnet.uri, format!("magnet:?xt=urn:btih:{}", HASH.to_uppercase()));
        assert_eq!(magnet.hash.unwrap().as_str(), HASH);
    }

    #[test]
    fn magnet_enclosure_beats_provider_link() {
        let entry = FeedEntry {
            primary_link: Some("https://example.com/movie".into()),
            enclosure_links: vec![
                format!("{YTS_DOWNLOAD_PREFIX}{OTHER}"),
                format!("magnet:?xt=urn:btih:{HASH}"),
            ],
            updated_at: None,
        };

        let magnet = resolve(&entry, DEFAULT_TRACKERS).unwrap();
        assert_eq!(magnet.uri, format!("magnet:?xt=urn:btih:{HASH}"));
    }

    #[test]
    fn provider_link_is_synthesized() {
        let entry = FeedEntry {
            enclosure_links: vec![format!("{YTS_DOWNLOAD_PREFIX}{HASH}")],
            ..FeedEntry::default()
        };

        let magnet = resolve(&entry, DEFAULT_TRACKERS).unwrap();
        assert!(magnet.uri.contains(&format!("xt=urn:btih:{HASH}")));
        assert!(magnet.uri.contains("&tr="));
        assert_eq!(magnet.hash.unwrap().as_str(), HASH);
    }

    #[test]
    fn bad_provider_link_ends_resolution() {
        let entry = FeedEntry {
            enclosure_links: vec![
                format!("{YTS_DOWNLOAD_PREFIX}short"),
                format!("{YTS_DOWNLOAD_PREFIX}{HASH}"),
            ],
            ..FeedEntry::default()
        };
        assert!(resolve(&entry, DEFAULT_TRACKERS).is_none());
    }

    #[test]
    fn entries_without_torrent_links_are_absent() {
        let entry = FeedEntry {
            primary_link: Some("https://example.com/movie".into()),
            enclosure_links: vec!["https://example.com/poster.jpg".into()],
            updated_at: None,
        };
        assert!(resolve(&entry, DEFAULT_TRACKERS).is_none());
        assert!(resolve(&FeedEntry::default(), DEFAULT_TRACKERS).is_none());
    }

    #[test]
    fn unparsable_magnet_keeps_uri_without_hash() {
        let entry = FeedEntry {
            primary_link: Some("magnet:?dn=no-hash".into()),
            ..FeedEntry::default()
        };
        let magnet = resolve(&entry, DEFAULT_TRACKERS).unwrap();
        assert_eq!(magnet.uri, "magnet:?dn=no-hash");
        assert!(magnet.hash.is_none());
    }

    #[test]
    fn only_entries_after_watermark_are_processed() {
        let url = "https://feeds.example/movies.xml";
        let source = feeds(
            url,
            vec![
                magnet_entry(OTHER, Some(at(2019, 12, 31))),
                magnet_entry(HASH, Some(at(2021, 1, 1))),
            ],
        );
        let requests = RefCell::new(Vec::new());
        let debrid = api(&requests, &[HASH, OTHER]);

        let stats = process_feed(url, at(2020, 1, 1), &source, &debrid, DEFAULT_TRACKERS).unwrap();
        assert_eq!(
            stats,
            FeedStats {
                added: 1,
                cached: 1,
                skipped: 0
            }
        );
        assert!(requests
            .borrow()
            .iter()
            .all(|r| !r.path.to_ascii_lowercase().contains(OTHER)));
    }

    #[test]
    fn entry_at_watermark_is_not_new() {
        let watermark = at(2020, 1, 1);
        assert!(!magnet_entry(HASH, Some(watermark)).is_new(watermark));
        assert!(magnet_entry(HASH, None).is_new(watermark));
    }

    #[test]
    fn uncached_torrents_are_skipped_not_added() {
        let url = "https://feeds.example/movies.xml";
        let source = feeds(url, vec![magnet_entry(HASH, Some(at(2021, 1, 1)))]);
        let requests = RefCell::new(Vec::new());
        let debrid = api(&requests, &[]);

        let stats = process_feed(url, at(2020, 1, 1), &source, &debrid, DEFAULT_TRACKERS).unwrap();
        assert_eq!(
            stats,
            FeedStats {
                added: 0,
                cached: 0,
                skipped: 1
            }
        );
        assert_eq!(added(&requests), 0);
    }

    #[test]
    fn undated_and_unresolvable_entries() {
        let url = "https://feeds.example/movies.xml";
        let source = feeds(
            url,
            vec![
                magnet_entry(HASH, None),
                FeedEntry {
                    primary_link: Some("https://example.com/article".into()),
                    ..FeedEntry::default()
                },
            ],
        );
        let requests = RefCell::new(Vec::new());
        let debrid = api(&requests, &[HASH]);

        let stats = process_feed(url, at(2020, 1, 1), &source, &debrid, DEFAULT_TRACKERS).unwrap();
        assert_eq!(
            stats,
            FeedStats {
                added: 1,
                cached: 1,
                skipped: 0
            }
        );
    }

    #[test]
    fn failed_submission_counts_as_cached_only() {
        let url = "https://feeds.example/movies.xml";
        let source = feeds(url, vec![magnet_entry(HASH, None)]);
        let transport = |request: &ApiRequest| -> Result<ApiResponse, TransportError> {
            if request.path == "torrents/addMagnet" {
                Ok(ApiResponse::new(402, ""))
            } else {
                Ok(ApiResponse::new(403, ""))
            }
        };
        let debrid = DebridClient::new(transport, RetryPolicy::immediate(0));

        let stats = process_feed(url, at(2020, 1, 1), &source, &debrid, DEFAULT_TRACKERS).unwrap();
        assert_eq!(
            stats,
            FeedStats {
                added: 0,
                cached: 1,
                skipped: 0
            }
        );
    }

    #[test]
    fn empty_feed_reports_zero() {
        let url = "https://feeds.example/empty.xml";
        let source = feeds(url, Vec::new());
        let requests = RefCell::new(Vec::new());
        let debrid = api(&requests, &[]);

        let stats = process_feed(url, at(2020, 1, 1), &source, &debrid, DEFAULT_TRACKERS).unwrap();
        assert_eq!(stats, FeedStats::default());
        assert!(requests.borrow().is_empty());
    }

    #[test]
    fn rss_items_are_mapped_to_entries() {
        let xml = format!(
            r#"<?xml version="1.0"?>
            <rss version="2.0" xmlns:dc="http://purl.org/dc/elements/1.1/">
              <channel>
                <title>Movies</title>
                <link>https://feeds.example</link>
                <description>test</description>
                <item>
                  <title>First</title>
                  <link>https://example.com/first</link>
                  <enclosure url="{YTS_DOWNLOAD_PREFIX}{HASH}" length="0" type="application/x-bittorrent"/>
                  <pubDate>Fri, 01 Jan 2021 10:00:00 +0000</pubDate>
                </item>
                <item>
                  <title>Second</title>
                  <link>magnet:?xt=urn:btih:{OTHER}</link>
                  <dc:date>2022-02-03T04:05:06Z</dc:date>
                </item>
                <item>
                  <title>Third</title>
                  <pubDate>not a date</pubDate>
                </item>
              </channel>
            </rss>"#
        );
        let channel = Channel::read_from(xml.as_bytes()).unwrap();
        let entries: Vec<FeedEntry> = channel.into_items().into_iter().map(FeedEntry::from).collect();

        assert_eq!(
            entries,
            vec![
                FeedEntry {
                    primary_link: Some("https://example.com/first".into()),
                    enclosure_links: vec![format!("{YTS_DOWNLOAD_PREFIX}{HASH}")],
                    updated_at: Some(Utc.with_ymd_and_hms(2021, 1, 1, 10, 0, 0).unwrap()),
                },
                FeedEntry {
                    primary_link: Some(format!("magnet:?xt=urn:btih:{OTHER}")),
                    enclosure_links: Vec::new(),
                    updated_at: Some(Utc.with_ymd_and_hms(2022, 2, 3, 4, 5, 6).unwrap()),
                },
                FeedEntry::default(),
            ]
        );
    }

    #[test]
    fn stats_accumulate() {
        let mut total = FeedStats::default();
        total += FeedStats {
            added: 1,
            cached: 2,
            skipped: 3,
        };
        total += FeedStats {
            added: 1,
            cached: 1,
            skipped: 0,
        };
        assert_eq!(
            total,
            FeedStats {
                added: 2,
                cached: 3,
                skipped: 3
            }
        );
    }
}
