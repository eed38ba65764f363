//! Tunables for feeds, publishing, pubkey loading and projections.
//!
//! Every value has a default; `SyncConfig::from_env` overrides them from
//! `NOSTR_SYNC_*` variables.

use std::env;
use std::time::Duration;

use thiserror::Error;

/// Earliest timestamp a cursor will page back to (2020-01-01T00:00:00Z).
pub const NETWORK_EPOCH: u64 = 1_577_836_800;

/// Timing and paging knobs shared by every feed.
#[derive(Clone, Debug)]
pub struct FeedConfig {
    /// Share of initial page requests that must complete before `load` proceeds.
    pub ready_fraction: f64,
    /// Upper bound on the readiness wait.
    pub ready_timeout: Duration,
    /// Hold time for replies whose parent is not known yet.
    pub orphan_delay: Duration,
    /// Hold time for events older than the expected filter window.
    pub ancient_delay: Duration,
    /// Coalescing window for live-tail events.
    pub live_batch: Duration,
    /// Coalescing window for cursor events feeding parent lookups.
    pub cursor_batch: Duration,
    pub initial_page: usize,
    /// `take(n)` preloads `n * buffer_factor` events per relay.
    pub buffer_factor: usize,
    /// Bound on a single cursor page request.
    pub page_timeout: Duration,
    pub floor: u64,
    /// Longest parent chain walked when collapsing threads.
    pub max_thread_depth: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ready_fraction: 0.4,
            ready_timeout: Duration::from_secs(3),
            orphan_delay: Duration::from_millis(1_500),
            ancient_delay: Duration::from_secs(4),
            live_batch: Duration::from_millis(300),
            cursor_batch: Duration::from_millis(100),
            initial_page: 50,
            buffer_factor: 4,
            page_timeout: Duration::from_secs(3),
            floor: NETWORK_EPOCH,
            max_thread_depth: 64,
        }
    }
}

/// Publish timeouts.
#[derive(Clone, Debug)]
pub struct PublishConfig {
    pub timeout: Duration,
    /// Timeout of template publishes (`publish_template`, `create_and_publish`).
    pub template_timeout: Duration,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            template_timeout: Duration::from_secs(5),
        }
    }
}

/// Chunking, staleness and relay selection for pubkey loads.
#[derive(Clone, Debug)]
pub struct PubkeyLoaderConfig {
    /// Pubkeys attempted within this window are skipped unless forced.
    pub stale_window: Duration,
    pub chunk_size: usize,
    pub chunk_timeout: Duration,
    pub relay_limit: usize,
    /// Read relays taken from each pubkey's relay list.
    pub hints_per_pubkey: usize,
}

impl Default for PubkeyLoaderConfig {
    fn default() -> Self {
        Self {
            stale_window: Duration::from_secs(3 * 60 * 60),
            chunk_size: 256,
            chunk_timeout: Duration::from_secs(10),
            relay_limit: 10,
            hints_per_pubkey: 3,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProjectionConfig {
    pub batch_size: usize,
    /// Cap on the stored events authored by local sessions.
    pub user_events_limit: usize,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            user_events_limit: 1_000,
        }
    }
}

/// Engine configuration. `Default` holds the production values;
/// `from_env` overrides them from `NOSTR_SYNC_*` variables.
#[derive(Clone, Debug, Default)]
pub struct SyncConfig {
    pub feed: FeedConfig,
    pub publish: PublishConfig,
    pub pubkeys: PubkeyLoaderConfig,
    pub projections: ProjectionConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {key}: {message}")]
    InvalidValue { key: String, message: String },
    #[error("invalid NOSTR_SYNC_READY_FRACTION: {0} is outside 0..=1")]
    ReadyFractionOutOfRange(f64),
    #[error("invalid {0}: must be greater than zero")]
    Zero(String),
}

impl SyncConfig {
    /// Read overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let ready_fraction = parse_with_lookup(
            &lookup,
            "NOSTR_SYNC_READY_FRACTION",
            defaults.feed.ready_fraction,
            |raw| {
                let value = parse_value::<f64>("NOSTR_SYNC_READY_FRACTION", &raw)?;
                if !(0.0..=1.0).contains(&value) {
                    return Err(ConfigError::ReadyFractionOutOfRange(value));
                }
                Ok(value)
            },
        )?;

        let feed = FeedConfig {
            ready_fraction,
            ready_timeout: millis(
                &lookup,
                "NOSTR_SYNC_READY_TIMEOUT_MS",
                defaults.feed.ready_timeout,
            )?,
            orphan_delay: millis(
                &lookup,
                "NOSTR_SYNC_ORPHAN_DELAY_MS",
                defaults.feed.orphan_delay,
            )?,
            ancient_delay: millis(
                &lookup,
                "NOSTR_SYNC_ANCIENT_DELAY_MS",
                defaults.feed.ancient_delay,
            )?,
            live_batch: millis(&lookup, "NOSTR_SYNC_LIVE_BATCH_MS", defaults.feed.live_batch)?,
            cursor_batch: millis(
                &lookup,
                "NOSTR_SYNC_CURSOR_BATCH_MS",
                defaults.feed.cursor_batch,
            )?,
            initial_page: count(&lookup, "NOSTR_SYNC_INITIAL_PAGE", defaults.feed.initial_page)?,
            buffer_factor: count(&lookup, "NOSTR_SYNC_BUFFER_FACTOR", defaults.feed.buffer_factor)?,
            page_timeout: millis(
                &lookup,
                "NOSTR_SYNC_PAGE_TIMEOUT_MS",
                defaults.feed.page_timeout,
            )?,
            floor: parse_with_lookup(&lookup, "NOSTR_SYNC_FLOOR", defaults.feed.floor, |raw| {
                parse_value("NOSTR_SYNC_FLOOR", &raw)
            })?,
            max_thread_depth: count(
                &lookup,
                "NOSTR_SYNC_MAX_THREAD_DEPTH",
                defaults.feed.max_thread_depth,
            )?,
        };

        let publish = PublishConfig {
            timeout: millis(&lookup, "NOSTR_SYNC_PUBLISH_TIMEOUT_MS", defaults.publish.timeout)?,
            template_timeout: millis(
                &lookup,
                "NOSTR_SYNC_TEMPLATE_PUBLISH_TIMEOUT_MS",
                defaults.publish.template_timeout,
            )?,
        };

        let pubkeys = PubkeyLoaderConfig {
            stale_window: parse_with_lookup(
                &lookup,
                "NOSTR_SYNC_PUBKEY_STALE_SECS",
                defaults.pubkeys.stale_window,
                |raw| parse_value("NOSTR_SYNC_PUBKEY_STALE_SECS", &raw).map(Duration::from_secs),
            )?,
            chunk_size: count(
                &lookup,
                "NOSTR_SYNC_PUBKEY_CHUNK_SIZE",
                defaults.pubkeys.chunk_size,
            )?,
            chunk_timeout: millis(
                &lookup,
                "NOSTR_SYNC_PUBKEY_CHUNK_TIMEOUT_MS",
                defaults.pubkeys.chunk_timeout,
            )?,
            relay_limit: count(
                &lookup,
                "NOSTR_SYNC_PUBKEY_RELAY_LIMIT",
                defaults.pubkeys.relay_limit,
            )?,
            hints_per_pubkey: count(
                &lookup,
                "NOSTR_SYNC_PUBKEY_HINTS_PER_PUBKEY",
                defaults.pubkeys.hints_per_pubkey,
            )?,
        };

        let projections = ProjectionConfig {
            batch_size: count(
                &lookup,
                "NOSTR_SYNC_PROJECTION_BATCH_SIZE",
                defaults.projections.batch_size,
            )?,
            user_events_limit: count(
                &lookup,
                "NOSTR_SYNC_USER_EVENTS_LIMIT",
                defaults.projections.user_events_limit,
            )?,
        };

        Ok(Self {
            feed,
            publish,
            pubkeys,
            projections,
        })
    }
}

fn parse_with_lookup<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    parser: impl FnOnce(String) -> Result<T, ConfigError>,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => parser(raw),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|error| ConfigError::InvalidValue {
            key: key.to_string(),
            message: error.to_string(),
        })
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_with_lookup(lookup, key, default, |raw| {
        parse_value(key, &raw).map(Duration::from_millis)
    })
}

fn count(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: usize,
) -> Result<usize, ConfigError> {
    parse_with_lookup(lookup, key, default, |raw| {
        let value = parse_value::<usize>(key, &raw)?;
        if value == 0 {
            return Err(ConfigError::Zero(key.to_string()));
        }
        Ok(value)
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::{ConfigError, SyncConfig};

    #[test]
    fn defaults_match_documented_timings() {
        let config = SyncConfig::default();
        assert_eq!(config.feed.orphan_delay, Duration::from_millis(1_500));
        assert_eq!(config.feed.ancient_delay, Duration::from_secs(4));
        assert_eq!(config.publish.timeout, Duration::from_secs(10));
        assert_eq!(config.publish.template_timeout, Duration::from_secs(5));
        assert_eq!(config.pubkeys.chunk_size, 256);
        assert_eq!(config.projections.batch_size, 500);
    }

    #[test]
    fn lookup_overrides_defaults() -> Result<(), ConfigError> {
        let values = HashMap::from([
            ("NOSTR_SYNC_ORPHAN_DELAY_MS", "250"),
            ("NOSTR_SYNC_READY_FRACTION", "0.5"),
            ("NOSTR_SYNC_PUBKEY_STALE_SECS", "60"),
            ("NOSTR_SYNC_PUBKEY_CHUNK_SIZE", " 32 "),
        ]);
        let config = SyncConfig::from_lookup(|key| values.get(key).map(ToString::to_string))?;
        assert_eq!(config.feed.orphan_delay, Duration::from_millis(250));
        assert!((config.feed.ready_fraction - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.pubkeys.stale_window, Duration::from_secs(60));
        assert_eq!(config.pubkeys.chunk_size, 32);
        assert_eq!(config.feed.initial_page, 50);
        Ok(())
    }

    #[test]
    fn rejects_malformed_values() {
        let values = HashMap::from([("NOSTR_SYNC_PUBLISH_TIMEOUT_MS", "soon")]);
        let error = SyncConfig::from_lookup(|key| values.get(key).map(ToString::to_string));
        assert!(matches!(
            error,
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "NOSTR_SYNC_PUBLISH_TIMEOUT_MS"
        ));

        let values = HashMap::from([("NOSTR_SYNC_PUBKEY_CHUNK_SIZE", "0")]);
        assert!(matches!(
            SyncConfig::from_lookup(|key| values.get(key).map(ToString::to_string)),
            Err(ConfigError::Zero(_))
        ));

        let values = HashMap::from([("NOSTR_SYNC_READY_FRACTION", "1.5")]);
        assert!(matches!(
            SyncConfig::from_lookup(|key| values.get(key).map(ToString::to_string)),
            Err(ConfigError::ReadyFractionOutOfRange(_))
        ));
    }
}
