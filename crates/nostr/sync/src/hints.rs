//! Relay selection hints.

use crate::error::{Result, SyncError};
use nostr::Event;
use std::collections::{BTreeSet, HashMap};
use url::Url;

/// Source of relay URLs relevant to a pubkey or an event.
pub trait RelayHints: Send + Sync {
    /// Relays `pubkey` publishes to, best first.
    fn pubkey_read_relays(&self, pubkey: &str) -> Vec<String>;

    /// Relays `pubkey` reads from, best first.
    fn pubkey_write_relays(&self, pubkey: &str) -> Vec<String>;

    /// Relays an event should be published to.
    fn publish_relays(&self, event: &Event) -> Vec<String>;
}

/// Combine ranked relay lists into one of at most `limit` relays.
///
/// Each relay scores `1 / (rank + 1) / len` per list it appears in; scores
/// add up across lists. Ties keep URL order so the result is deterministic.
pub fn merge_hints(limit: usize, groups: &[Vec<String>]) -> Vec<String> {
    let mut scores: HashMap<&str, f64> = HashMap::new();

    for group in groups {
        for (rank, url) in group.iter().enumerate() {
            *scores.entry(url.as_str()).or_default() +=
                1.0 / (rank as f64 + 1.0) / group.len() as f64;
        }
    }

    let mut ranked: Vec<(&str, f64)> = scores.into_iter().collect();
    ranked.sort_by(|(a_url, a_score), (b_url, b_score)| {
        b_score.total_cmp(a_score).then_with(|| a_url.cmp(b_url))
    });

    ranked
        .into_iter()
        .take(limit)
        .map(|(url, _)| url.to_string())
        .collect()
}

/// Normalize a relay URL: `ws`/`wss` only, lowercase host, no trailing slash
/// on an empty path.
pub fn normalize_relay_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("wss://{trimmed}")
    };

    let url = Url::parse(&with_scheme)?;
    if url.scheme() != "ws" && url.scheme() != "wss" {
        return Err(SyncError::InvalidRelayUrl(format!(
            "URL must use ws:// or wss:// scheme, got: {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(SyncError::InvalidRelayUrl(raw.to_string()));
    }

    let normalized = url.to_string();
    Ok(match normalized.strip_suffix('/') {
        Some(stripped) if url.path() == "/" && url.query().is_none() => stripped.to_string(),
        _ => normalized,
    })
}

/// Normalize and dedupe relay URLs, preserving order and skipping invalid ones.
pub fn normalize_relay_urls<I, S>(urls: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = BTreeSet::new();
    urls.into_iter()
        .filter_map(|url| normalize_relay_url(url.as_ref()).ok())
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

/// Fixed hints, for embedders without a relay-list store and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticRelayHints {
    pub read: HashMap<String, Vec<String>>,
    pub write: HashMap<String, Vec<String>>,
    /// Outbox relays used for publishing and as the read fallback.
    pub fallback: Vec<String>,
}

impl StaticRelayHints {
    pub fn new(fallback: Vec<String>) -> Self {
        Self {
            fallback,
            ..Self::default()
        }
    }

    pub fn with_read_relays(mut self, pubkey: impl Into<String>, relays: Vec<String>) -> Self {
        self.read.insert(pubkey.into(), relays);
        self
    }
}

impl RelayHints for StaticRelayHints {
    fn pubkey_read_relays(&self, pubkey: &str) -> Vec<String> {
        self.read
            .get(pubkey)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    fn pubkey_write_relays(&self, pubkey: &str) -> Vec<String> {
        self.write
            .get(pubkey)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    fn publish_relays(&self, event: &Event) -> Vec<String> {
        let mut groups = vec![self.fallback.clone()];
        for pubkey in event.tag_values("p") {
            groups.push(self.pubkey_write_relays(&pubkey));
        }
        merge_hints(self.fallback.len().max(1) * 2, &groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| (*value).to_string()).collect()
    }

    #[test]
    fn merge_prefers_relays_shared_across_lists() {
        let groups = vec![
            urls(&["wss://a", "wss://b", "wss://c"]),
            urls(&["wss://b", "wss://d"]),
            urls(&["wss://b"]),
        ];
        let merged = merge_hints(3, &groups);
        assert_eq!(merged, urls(&["wss://b", "wss://a", "wss://d"]));
        assert!(merge_hints(0, &groups).is_empty());
    }

    #[test]
    fn normalizes_relay_urls() -> Result<()> {
        assert_eq!(normalize_relay_url("WSS://Relay.Example.com/")?, "wss://relay.example.com");
        assert_eq!(normalize_relay_url("relay.example.com")?, "wss://relay.example.com");
        assert_eq!(normalize_relay_url("ws://localhost:7777/nostr")?, "ws://localhost:7777/nostr");
        assert!(matches!(
            normalize_relay_url("https://relay.example.com"),
            Err(SyncError::InvalidRelayUrl(_))
        ));
        assert_eq!(
            normalize_relay_urls(["wss://a.com", "wss://a.com/", "http://b.com", "wss://c.com"]),
            urls(&["wss://a.com", "wss://c.com"])
        );
        Ok(())
    }
}
