//! Bulk loading of profile-level events for many pubkeys.

use crate::config::PubkeyLoaderConfig;
use crate::hints::{RelayHints, merge_hints, normalize_relay_urls};
use crate::network::{Network, SubscribeRequest};
use crate::projections::ProjectionPipeline;
use crate::subscription::SubscriptionMessage;
use futures_util::future::join_all;
use nostr::Filter;
use nostr::kinds::{APP_DATA, APP_DATA_KEYS, PERSON_KINDS};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::Instant;
use tracing::{debug, info};

/// Options for [`PubkeyLoader::load`].
#[derive(Debug, Clone)]
pub struct PubkeyLoadOptions {
    /// Relays to query; relay hints are used when empty.
    pub relays: Vec<String>,
    /// Load even pubkeys attempted recently.
    pub force: bool,
    pub kinds: Vec<u16>,
}

impl Default for PubkeyLoadOptions {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            force: false,
            kinds: PERSON_KINDS.to_vec(),
        }
    }
}

/// Outcome of one `load` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PubkeyLoadReport {
    /// Pubkeys requested from relays.
    pub loaded: Vec<String>,
    /// Pubkeys skipped because they were attempted recently.
    pub skipped: Vec<String>,
    pub chunks: usize,
    /// Events received across all chunks.
    pub events: usize,
}

/// Bulk loader for the events describing a set of pubkeys.
///
/// Pubkeys attempted within the stale window are skipped unless forced.
/// Results flow into the projection pipeline, not back to the caller.
pub struct PubkeyLoader {
    network: Arc<dyn Network>,
    hints: Arc<dyn RelayHints>,
    pipeline: Arc<ProjectionPipeline>,
    config: PubkeyLoaderConfig,
    attempted: Mutex<HashMap<String, Instant>>,
}

impl PubkeyLoader {
    pub fn new(
        network: Arc<dyn Network>,
        hints: Arc<dyn RelayHints>,
        pipeline: Arc<ProjectionPipeline>,
        config: PubkeyLoaderConfig,
    ) -> Self {
        Self {
            network,
            hints,
            pipeline,
            config,
            attempted: Mutex::new(HashMap::new()),
        }
    }

    /// Pick the pubkeys to load and mark them attempted.
    fn select(&self, pubkeys: Vec<String>, force: bool) -> (Vec<String>, Vec<String>) {
        let now = Instant::now();
        let mut attempted = self
            .attempted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let (selected, skipped): (Vec<String>, Vec<String>) =
            pubkeys.into_iter().partition(|pubkey| {
                force
                    || attempted
                        .get(pubkey)
                        .is_none_or(|at| now.duration_since(*at) >= self.config.stale_window)
            });
        for pubkey in &selected {
            attempted.insert(pubkey.clone(), now);
        }
        (selected, skipped)
    }

    fn chunk_relays(&self, chunk: &[String], explicit: &[String]) -> Vec<String> {
        if !explicit.is_empty() {
            return explicit.to_vec();
        }
        let groups: Vec<Vec<String>> = chunk
            .iter()
            .map(|pubkey| {
                normalize_relay_urls(self.hints.pubkey_read_relays(pubkey))
                    .into_iter()
                    .take(self.config.hints_per_pubkey)
                    .collect()
            })
            .collect();
        merge_hints(self.config.relay_limit, &groups)
    }

    /// Everything but application data, plus application data limited to
    /// the keys this client reads.
    fn chunk_filters(chunk: &[String], kinds: &[u16]) -> Vec<Filter> {
        let mut filters = Vec::new();
        let plain: Vec<u16> = kinds.iter().copied().filter(|kind| *kind != APP_DATA).collect();
        if !plain.is_empty() {
            filters.push(Filter::new().kinds(plain).authors(chunk.iter().cloned()));
        }
        if kinds.contains(&APP_DATA) {
            filters.push(
                Filter::new()
                    .kinds([APP_DATA])
                    .authors(chunk.iter().cloned())
                    .tag("d", APP_DATA_KEYS.iter().copied()),
            );
        }
        filters
    }

    /// Load `kinds` for every stale pubkey, in chunks, and feed the results
    /// to the projections.
    pub async fn load<I, S>(&self, pubkeys: I, options: PubkeyLoadOptions) -> PubkeyLoadReport
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let unique: Vec<String> = pubkeys
            .into_iter()
            .map(Into::into)
            .filter(|pubkey| seen.insert(pubkey.clone()))
            .collect();

        let (selected, skipped) = self.select(unique, options.force);
        let explicit = normalize_relay_urls(&options.relays);
        let chunks: Vec<&[String]> = selected.chunks(self.config.chunk_size.max(1)).collect();

        let requests = chunks.iter().map(|chunk| {
            let relays = self.chunk_relays(chunk, &explicit);
            let filters = Self::chunk_filters(chunk, &options.kinds);
            self.load_chunk(relays, filters)
        });
        let events: usize = join_all(requests).await.into_iter().sum();

        if !selected.is_empty() {
            info!(
                pubkeys = selected.len(),
                skipped = skipped.len(),
                chunks = chunks.len(),
                events,
                "loaded pubkeys"
            );
        }

        PubkeyLoadReport {
            chunks: chunks.len(),
            loaded: selected,
            skipped,
            events,
        }
    }

    async fn load_chunk(&self, relays: Vec<String>, filters: Vec<Filter>) -> usize {
        if relays.is_empty() || filters.is_empty() {
            debug!("no relays for pubkey chunk");
            return 0;
        }

        let timeout = self.config.chunk_timeout;
        let mut subscription = self
            .network
            .subscribe(SubscribeRequest::once(relays, filters).with_timeout(timeout));

        let mut received = 0;
        let collect = async {
            while let Some(message) = subscription.recv().await {
                match message {
                    SubscriptionMessage::Event(event) => {
                        received += 1;
                        self.pipeline.push(event);
                    }
                    SubscriptionMessage::Eose(_) => {}
                    SubscriptionMessage::Complete => break,
                }
            }
        };
        if tokio::time::timeout(timeout, collect).await.is_err() {
            debug!(received, "pubkey chunk timed out");
        }
        subscription.close();
        received
    }
}
