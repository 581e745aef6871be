use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// Prefix of YTS download links, whose last path segment is the info-hash.
pub const YTS_DOWNLOAD_PREFIX: &str = "https://yts.mx/torrent/download/";

/// Announce URLs appended to magnets built from provider download links.
pub const DEFAULT_TRACKERS: &[&str] = &[
    "udp://open.demonii.com:1337/announce",
    "udp://tracker.openbittorrent.com:80",
    "udp://tracker.coppersurfer.tk:6969",
    "udp://glotorrents.pw:6969/announce",
    "udp://tracker.opentrackr.org:1337/announce",
    "udp://torrent.gresille.org:80/announce",
    "udp://p4p.arenabg.com:1337",
    "udp://tracker.leechers-paradise.org:6969",
];

/// Canonical identity of a torrent: 40 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TorrentHash(String);

impl TorrentHash {
    /// Extracts the `xt=urn:btih:` value of a magnet URI.
    ///
    /// Hex hashes are lowercased. Base32 hashes are decoded and re-encoded as
    /// hex; if decoding fails the raw token is returned lowercased instead.
    pub fn from_magnet(uri: &str) -> Option<Self> {
        if let Some(caps) = hex_pattern().captures(uri) {
            return Some(Self(caps[1].to_ascii_lowercase()));
        }

        let caps = base32_pattern().captures(uri)?;
        let token = &caps[1];
        match decode_base32(token) {
            Some(bytes) => Some(Self(hex::encode(bytes))),
            // The pattern only admits the base32 alphabet, so this is not
            // expected to trigger for matched tokens.
            None => {
                log::warn!("Could not decode base32 hash `{token}`, using it as is");
                Some(Self(token.to_ascii_lowercase()))
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Spellings to query the API with, uppercase first.
    pub fn spellings(&self) -> [String; 2] {
        [self.0.to_ascii_uppercase(), self.0.clone()]
    }
}

impl fmt::Display for TorrentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A magnet URI together with the hash extracted from it, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetReference {
    pub uri: String,
    pub hash: Option<TorrentHash>,
}

impl MagnetReference {
    pub fn new(uri: String) -> Self {
        let hash = TorrentHash::from_magnet(&uri);
        if hash.is_none() {
            log::warn!("Could not extract hash from magnet `{}`", truncate(&uri));
        }
        Self { uri, hash }
    }
}

/// Builds a magnet URI from a provider download URL ending in a 40 character hash.
pub fn from_provider_url<S: AsRef<str>>(url: &str, trackers: &[S]) -> Option<String> {
    let hash = url.rsplit('/').next()?;
    if hash.len() != 40 {
        log::warn!("Provider link `{url}` does not end with a 40 character hash");
        return None;
    }

    let mut magnet = format!("magnet:?xt=urn:btih:{hash}");
    for tracker in trackers {
        magnet.push_str("&tr=");
        magnet.push_str(tracker.as_ref());
    }
    Some(magnet)
}

/// Shortens a magnet URI for log output.
pub fn truncate(uri: &str) -> &str {
    match uri.char_indices().nth(60) {
        Some((idx, _)) => &uri[..idx],
        None => uri,
    }
}

fn hex_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)xt=urn:btih:([0-9a-f]{40})").expect("hex hash pattern is valid")
    })
}

fn base32_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)xt=urn:btih:([a-z2-7]{32})").expect("base32 hash pattern is valid")
    })
}

fn decode_base32(token: &str) -> Option<Vec<u8>> {
    // Pad to a multiple of 8 characters like a standard base32 decoder expects
    let padding = (8 - token.len() % 8) % 8;
    let padded = format!("{token}{}", "=".repeat(padding));

    let mut out = Vec::with_capacity(padded.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits: u8 = 0;
    for ch in padded.chars() {
        if ch == '=' {
            break;
        }
        let val = base32_value(ch)?;
        buffer = (buffer << 5) | u32::from(val);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push(((buffer >> bits) & 0xff) as u8);
        }
    }

    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

fn base32_value(ch: char) -> Option<u8> {
    let ch = ch.to_ascii_uppercase();
    match ch {
        'A'..='Z' => Some((ch as u8) - b'A'),
        '2'..='7' => Some((ch as u8) - b'2' + 26),
        _ => None,
    }
}
