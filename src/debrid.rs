use std::collections::HashMap;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::http::{ApiRequest, ApiResponse, RateLimitedHttpClient, RetryPolicy, Transport};
use crate::magnet::{truncate, MagnetReference, TorrentHash};

/// Host value sent along with every added magnet.
pub const HOST: &str = "real-debrid.com";

/// Outcome of a non-successful API call.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid token, set one with --token <value> or the RD_TOKEN environment variable")]
    InvalidCredential,
    #[error("User not premium")]
    AccountNotEligible,
    #[error("Service not available")]
    ServiceUnavailable,
    #[error("Rate limited, retries exhausted")]
    RateLimited,
    #[error("Unexpected status {0}")]
    Status(u16),
    #[error("No response received")]
    NoResponse,
    #[error("Malformed response body: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Maps a response to success or the matching [`ApiError`].
pub fn classify(response: &ApiResponse) -> Result<(), ApiError> {
    match response.status {
        _ if response.is_success() => Ok(()),
        401 => Err(ApiError::InvalidCredential),
        402 => Err(ApiError::AccountNotEligible),
        429 => Err(ApiError::RateLimited),
        503 => Err(ApiError::ServiceUnavailable),
        status => Err(ApiError::Status(status)),
    }
}

fn classify_option(response: Option<ApiResponse>) -> Result<ApiResponse, ApiError> {
    let response = response.ok_or(ApiError::NoResponse)?;
    classify(&response)?;
    Ok(response)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentStatus {
    WaitingFilesSelection,
    Other(String),
}

impl<'de> Deserialize<'de> for TorrentStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let status = String::deserialize(deserializer)?;
        Ok(match status.as_str() {
            "waiting_files_selection" => TorrentStatus::WaitingFilesSelection,
            _ => TorrentStatus::Other(status),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteTorrent {
    pub id: String,
    pub status: TorrentStatus,
    #[serde(default)]
    pub filename: Option<String>,
}

/// File variants the API lists for one host; only a non-empty list counts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FileVariants {
    List(Vec<serde_json::Value>),
    Other(serde_json::Value),
}

/// Availability of one hash: a host map, or any other shape (the API answers
/// `[]` for hashes it does not know).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum HashAvailability {
    Hosts(HashMap<String, FileVariants>),
    Other(serde_json::Value),
}

impl HashAvailability {
    pub fn has_files(&self) -> bool {
        match self {
            HashAvailability::Hosts(hosts) => hosts
                .values()
                .any(|variants| matches!(variants, FileVariants::List(list) if !list.is_empty())),
            HashAvailability::Other(_) => false,
        }
    }
}

/// Result of querying instant availability for one spelling of a hash.
#[derive(Debug)]
pub enum CacheProbeResult {
    /// 404: the API does not hold the torrent.
    NotFound,
    /// 403: the endpoint is restricted for this account.
    PermissionDenied,
    AvailabilityData(HashMap<String, HashAvailability>),
    /// No response or a non-successful status; the next spelling is tried.
    Failed(ApiError),
    /// The body was not valid JSON.
    Degraded(String),
}

impl CacheProbeResult {
    fn from_response(response: Option<ApiResponse>) -> Self {
        let response = match response {
            Some(response) => response,
            None => return CacheProbeResult::Failed(ApiError::NoResponse),
        };

        match response.status {
            403 => return CacheProbeResult::PermissionDenied,
            404 => return CacheProbeResult::NotFound,
            _ => (),
        }
        if let Err(err) = classify(&response) {
            return CacheProbeResult::Failed(err);
        }

        let body: serde_json::Value = match serde_json::from_str(&response.body) {
            Ok(body) => body,
            Err(err) => return CacheProbeResult::Degraded(err.to_string()),
        };

        // Well-formed JSON without a hash map simply lists nothing for this spelling
        if !body.is_object() {
            return CacheProbeResult::AvailabilityData(HashMap::new());
        }
        match serde_json::from_value(body) {
            Ok(data) => CacheProbeResult::AvailabilityData(data),
            Err(err) => CacheProbeResult::Degraded(err.to_string()),
        }
    }

    /// `Some(cached)` when this lookup settles the question, `None` to try the
    /// next spelling.
    ///
    /// A denied or uninterpretable lookup counts as cached: submission is
    /// favoured over strict cache hygiene when the API cannot answer.
    pub fn verdict(&self, hash: &TorrentHash) -> Option<bool> {
        match self {
            CacheProbeResult::NotFound => Some(false),
            CacheProbeResult::PermissionDenied => Some(true),
            CacheProbeResult::Degraded(_) => Some(true),
            CacheProbeResult::Failed(_) => None,
            CacheProbeResult::AvailabilityData(data) => {
                let [upper, lower] = hash.spellings();
                let entry = data.get(&lower).or_else(|| data.get(&upper))?;
                entry.has_files().then_some(true)
            }
        }
    }
}

/// Client for the Real-Debrid torrent endpoints.
pub struct DebridClient<T> {
    http: RateLimitedHttpClient<T>,
}

impl<T: Transport> DebridClient<T> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        Self {
            http: RateLimitedHttpClient::new(transport, policy),
        }
    }

    pub fn query_availability(&self, spelling: &str) -> CacheProbeResult {
        let request = ApiRequest::get(format!("torrents/instantAvailability/{spelling}"));
        CacheProbeResult::from_response(self.http.execute(&request))
    }

    /// Whether the torrent is already cached, trying both hash spellings.
    pub fn check_cached(&self, magnet: &MagnetReference) -> bool {
        let hash = match &magnet.hash {
            Some(hash) => hash,
            None => {
                log::warn!("No hash for `{}`, treating as uncached", truncate(&magnet.uri));
                return false;
            }
        };

        let short = hash.as_str().get(..16).unwrap_or(hash.as_str());
        log::info!("Checking cache for hash {short}...");
        for spelling in hash.spellings() {
            let lookup = self.query_availability(&spelling);
            match &lookup {
                CacheProbeResult::PermissionDenied => {
                    log::warn!("Cache check not available (403), assuming torrent is available")
                }
                CacheProbeResult::Degraded(reason) => {
                    log::warn!("Cache check failed: {reason}, allowing torrent anyway")
                }
                CacheProbeResult::Failed(err) => log::warn!("Cache check for {spelling}: {err}"),
                _ => (),
            }

            if let Some(cached) = lookup.verdict(hash) {
                if cached {
                    log::info!("Torrent is cached");
                } else {
                    log::info!("Torrent not found in cache");
                }
                return cached;
            }
        }

        log::info!("Torrent is not cached");
        false
    }

    pub fn add_magnet(&self, magnet: &str) -> Result<(), ApiError> {
        log::info!("Adding magnet: {}...", truncate(magnet));
        let request = ApiRequest::post("torrents/addMagnet")
            .field("magnet", magnet)
            .field("host", HOST);
        classify_option(self.http.execute(&request))?;
        log::info!("Magnet added successfully");
        Ok(())
    }

    /// Lists remote torrents; failures are logged and yield an empty list.
    pub fn list_torrents(&self, limit: u32) -> Vec<RemoteTorrent> {
        let request = ApiRequest::get("torrents").query("limit", limit.to_string());
        let result = classify_option(self.http.execute(&request))
            .and_then(|response| Ok(serde_json::from_str(&response.body)?));

        match result {
            Ok(torrents) => torrents,
            Err(err) => {
                log::error!("Failed to list torrents: {err}");
                Vec::new()
            }
        }
    }

    pub fn select_files(&self, torrent_id: &str) -> Result<(), ApiError> {
        let request =
            ApiRequest::post(format!("torrents/selectFiles/{torrent_id}")).field("files", "all");
        classify_option(self.http.execute(&request))?;
        Ok(())
    }
}
