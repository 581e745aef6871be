use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::magnet::DEFAULT_TRACKERS;

pub const DEFAULT_CONFIG_PATH: &str = "RDRSSconfig/rdrss.json";

/// Environment variable consulted when no token is stored.
pub const TOKEN_ENV: &str = "RD_TOKEN";

pub const WATERMARK_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const BASE_WATERMARK: &str = "2000-01-01 00:00:00";

pub const PREFERRED_FEED_BASE: &str =
    "https://raw.githubusercontent.com/Zero0Q/yts-json-to-rss/refs/heads/main/feeds/";
pub const PREFERRED_FEEDS: &[&str] = &["2160p.xml"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("`{0}` is not a valid url: {1}")]
    InvalidUrl(String, url::ParseError),
    #[error("No url at index {0} found")]
    NoSuchFeed(usize),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub rss_urls: Vec<String>,
    pub updated: String,
    pub auth_token: String,
    /// Overrides the announce URLs used when building magnets from provider links.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trackers: Option<Vec<String>>,
    /// Keys this tool does not know about, kept so saving round-trips them.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rss_urls: Vec::new(),
            updated: BASE_WATERMARK.to_string(),
            auth_token: String::new(),
            trackers: None,
            extra: serde_json::Map::new(),
        }
    }
}

impl Config {
    /// Time of the last run; entries updated after it are new.
    pub fn watermark(&self) -> DateTime<Utc> {
        parse_watermark(&self.updated).unwrap_or_else(|| {
            log::warn!(
                "Stored update time `{}` is invalid, using {BASE_WATERMARK}",
                self.updated
            );
            base_watermark()
        })
    }

    /// Moves the watermark forward to `now`. It never moves backwards.
    pub fn advance_watermark(&mut self, now: DateTime<Utc>) {
        let next = now.max(self.watermark());
        self.updated = next.format(WATERMARK_FORMAT).to_string();
    }

    pub fn trackers(&self) -> Vec<String> {
        match &self.trackers {
            Some(trackers) => trackers.clone(),
            None => DEFAULT_TRACKERS.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn add_feed(&mut self, url: &str) -> Result<(), ConfigError> {
        Url::parse(url).map_err(|err| ConfigError::InvalidUrl(url.to_string(), err))?;
        self.rss_urls.push(url.to_string());
        Ok(())
    }

    /// Removes the feed at a 1-based `index`, as shown by `--list`.
    pub fn remove_feed(&mut self, index: usize) -> Result<String, ConfigError> {
        if index == 0 || index > self.rss_urls.len() {
            return Err(ConfigError::NoSuchFeed(index));
        }
        Ok(self.rss_urls.remove(index - 1))
    }

    /// Appends the preferred feeds not configured yet and returns them.
    pub fn add_preferred_feeds(&mut self) -> Vec<String> {
        let mut added = Vec::new();
        for file in PREFERRED_FEEDS {
            let url = format!("{PREFERRED_FEED_BASE}{file}");
            if !self.rss_urls.contains(&url) {
                self.rss_urls.push(url.clone());
                added.push(url);
            }
        }
        added
    }
}

fn parse_watermark(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, WATERMARK_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

fn base_watermark() -> DateTime<Utc> {
    parse_watermark(BASE_WATERMARK).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// The JSON document holding feeds, watermark and token.
///
/// Read and written as a whole. Concurrent runs against the same file are
/// not supported.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the document, falling back to defaults when the file does not exist.
    pub fn load(&self) -> Result<Config> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                log::debug!("No config at {:?}, using defaults", self.path);
                return Ok(Config::default());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to open config file {:?}", self.path))
            }
        };

        serde_json::from_str(&content)
            .with_context(|| format!("Config file {:?} is invalid", self.path))
    }

    pub fn save(&self, config: &Config) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("Unable to create directory {dir:?}"))?;
        }

        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        config
            .serialize(&mut serializer)
            .context("Unable to serialize config")?;

        fs::write(&self.path, out)
            .with_context(|| format!("Unable to write config file {:?}", self.path))
    }
}

/// Bearer token for the API.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// The stored token wins; `env_token` is used only when none is stored.
    pub fn resolve(config: &Config, env_token: Option<String>) -> Option<Self> {
        if !config.auth_token.is_empty() {
            return Some(Credential(config.auth_token.clone()));
        }
        env_token
            .filter(|token| !token.is_empty())
            .map(Credential)
    }

    pub fn from_env(config: &Config) -> Option<Self> {
        Self::resolve(config, std::env::var(TOKEN_ENV).ok())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}
