//! Multi-relay publishing with per-relay acknowledgement tracking.
//!
//! A publish targets a fixed set of relays. Every relay ends up in exactly
//! one of `succeeded`, `failed` or `timeouts`; the publish resolves once,
//! when no relay is pending. Acks arriving before resolution may move a
//! relay between `succeeded` and `failed` (last write wins).

use crate::clock::now;
use crate::config::PublishConfig;
use crate::error::{Result, SyncError};
use crate::hints::{RelayHints, normalize_relay_urls};
use crate::network::{Network, PublishVerb, Signer};
use crate::projections::ProjectionPipeline;
use crate::subscription::PublishMessage;
use nostr::{Event, EventTemplate};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

/// Snapshot of a publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishProgress {
    pub event: Event,
    pub attempted: BTreeSet<String>,
    pub succeeded: BTreeSet<String>,
    pub failed: BTreeSet<String>,
    pub timeouts: BTreeSet<String>,
    /// `succeeded ∪ failed ∪ timeouts`.
    pub completed: BTreeSet<String>,
    /// `attempted − completed`.
    pub pending: BTreeSet<String>,
}

impl PublishProgress {
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Pure state machine behind a publish.
#[derive(Debug)]
struct PublishTracker {
    event: Event,
    attempted: BTreeSet<String>,
    succeeded: BTreeSet<String>,
    failed: BTreeSet<String>,
    timeouts: BTreeSet<String>,
    resolved: bool,
}

impl PublishTracker {
    fn new(event: Event, relays: &[String]) -> Self {
        Self {
            event,
            attempted: relays.iter().cloned().collect(),
            succeeded: BTreeSet::new(),
            failed: BTreeSet::new(),
            timeouts: BTreeSet::new(),
            resolved: false,
        }
    }

    fn on_ok(&mut self, relay: &str, ok: bool) {
        if !self.attempted.contains(relay) {
            return;
        }
        if ok {
            self.event.mark_seen(relay);
            self.succeeded.insert(relay.to_string());
            self.failed.remove(relay);
        } else {
            self.succeeded.remove(relay);
            self.failed.insert(relay.to_string());
        }
        self.timeouts.remove(relay);
    }

    fn on_error(&mut self, relay: &str) {
        if !self.attempted.contains(relay) {
            return;
        }
        self.succeeded.remove(relay);
        self.failed.insert(relay.to_string());
        self.timeouts.remove(relay);
    }

    /// Every relay without an outcome times out.
    fn on_timeout(&mut self) {
        for relay in &self.attempted {
            if !self.succeeded.contains(relay) && !self.failed.contains(relay) {
                self.timeouts.insert(relay.clone());
            }
        }
    }

    fn progress(&self) -> PublishProgress {
        let completed: BTreeSet<String> = self
            .succeeded
            .iter()
            .chain(&self.failed)
            .chain(&self.timeouts)
            .cloned()
            .collect();
        let pending = self.attempted.difference(&completed).cloned().collect();

        PublishProgress {
            event: self.event.clone(),
            attempted: self.attempted.clone(),
            succeeded: self.succeeded.clone(),
            failed: self.failed.clone(),
            timeouts: self.timeouts.clone(),
            completed,
            pending,
        }
    }

    /// The final progress, the first time nothing is pending.
    fn try_resolve(&mut self) -> Option<PublishProgress> {
        if self.resolved {
            return None;
        }
        let progress = self.progress();
        if progress.is_complete() {
            self.resolved = true;
            return Some(progress);
        }
        None
    }
}

/// Per-publish settings.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub timeout: Duration,
    pub verb: PublishVerb,
    /// Skip the publish log line.
    pub silent: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            verb: PublishVerb::Event,
            silent: false,
        }
    }
}

impl PublishOptions {
    /// Default `EVENT` publish settling after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

/// Handle on a running publish.
#[derive(Debug, Clone)]
pub struct PublishHandle {
    progress: watch::Receiver<PublishProgress>,
    updates: broadcast::Sender<PublishProgress>,
    result: watch::Receiver<Option<PublishProgress>>,
}

impl PublishHandle {
    /// Latest snapshot.
    pub fn progress(&self) -> PublishProgress {
        self.progress.borrow().clone()
    }

    /// Every snapshot emitted from now on, one per transition.
    pub fn subscribe(&self) -> broadcast::Receiver<PublishProgress> {
        self.updates.subscribe()
    }

    pub fn is_resolved(&self) -> bool {
        self.result.borrow().is_some()
    }

    /// Wait for the final progress.
    pub async fn result(&self) -> Result<PublishProgress> {
        let mut result = self.result.clone();
        let resolved = result
            .wait_for(Option::is_some)
            .await
            .map_err(|_| SyncError::Closed("publish ended without a result".to_string()))?;
        resolved
            .clone()
            .ok_or_else(|| SyncError::Internal("publish resolved without progress".to_string()))
    }
}

/// Publishes one event.
pub struct Publisher {
    event: Event,
    network: Arc<dyn Network>,
    pipeline: Arc<ProjectionPipeline>,
}

impl Publisher {
    /// Fails for events revealed from a gift wrap; those were never meant
    /// for broadcast.
    pub fn new(
        event: Event,
        network: Arc<dyn Network>,
        pipeline: Arc<ProjectionPipeline>,
    ) -> Result<Self> {
        if event.is_wrapped() {
            return Err(SyncError::Unpublishable(event.id));
        }
        let mut event = event;
        event.seen_on.clear();
        Ok(Self {
            event,
            network,
            pipeline,
        })
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Send the event to `relays`. The event enters the local projections
    /// before any relay is contacted.
    pub fn publish(&self, relays: &[String], options: PublishOptions) -> PublishHandle {
        let relays = normalize_relay_urls(relays);
        if !options.silent {
            info!(
                event = %self.event.id,
                kind = self.event.kind,
                relays = relays.len(),
                "publishing event"
            );
        }

        let mut tracker = PublishTracker::new(self.event.clone(), &relays);
        self.pipeline.push(self.event.clone());

        let mut subscription = self.network.publish(&relays, &self.event, options.verb);
        let (progress_tx, progress) = watch::channel(tracker.progress());
        let (updates, _) = broadcast::channel(relays.len().saturating_mul(2).max(16));
        let (result_tx, result) = watch::channel(None);

        let handle = PublishHandle {
            progress,
            updates: updates.clone(),
            result,
        };

        let emit = move |snapshot: PublishProgress| {
            let _ = updates.send(snapshot.clone());
            progress_tx.send_replace(snapshot);
        };

        emit(tracker.progress());
        if let Some(done) = tracker.try_resolve() {
            subscription.close();
            result_tx.send_replace(Some(done));
            return handle;
        }

        let timeout = options.timeout;
        tokio::spawn(async move {
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    () = &mut deadline => {
                        debug!(event = %tracker.event.id, "publish timed out");
                        tracker.on_timeout();
                    }
                    message = subscription.recv() => match message {
                        Some(PublishMessage::Ok { relay, ok, message, .. }) => {
                            debug!(relay = %relay, ok, message = %message, "publish acknowledged");
                            tracker.on_ok(&relay, ok);
                        }
                        Some(PublishMessage::Error { relay, message }) => {
                            debug!(relay = %relay, message = %message, "publish failed");
                            tracker.on_error(&relay);
                        }
                        None => {
                            (&mut deadline).await;
                            tracker.on_timeout();
                        }
                    },
                }

                emit(tracker.progress());
                if let Some(done) = tracker.try_resolve() {
                    subscription.close();
                    info!(
                        event = %done.event.id,
                        succeeded = done.succeeded.len(),
                        failed = done.failed.len(),
                        timeouts = done.timeouts.len(),
                        "publish resolved"
                    );
                    result_tx.send_replace(Some(done));
                    break;
                }
            }
        });

        handle
    }
}

/// Deduplicate tags: `param` tags by their full contents, every other tag
/// by name and value. The first occurrence wins.
pub fn uniq_tags(tags: Vec<Vec<String>>) -> Vec<Vec<String>> {
    let mut seen = HashSet::new();
    tags.into_iter()
        .filter(|tag| {
            let key = if tag.first().is_some_and(|name| name == "param") {
                tag.join(":")
            } else {
                tag.iter().take(2).cloned().collect::<Vec<_>>().join(":")
            };
            seen.insert(key)
        })
        .collect()
}

static TOPIC: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)#([\p{L}\p{N}_]+)").ok());

/// Hashtags in `content`, lowercased and without the `#`.
pub fn hashtags(content: &str) -> Vec<String> {
    let Some(topic) = TOPIC.as_ref() else {
        return Vec::new();
    };
    topic
        .captures_iter(content)
        .filter_map(|captures| captures.get(1))
        .map(|topic| topic.as_str().to_lowercase())
        .collect()
}

/// `t` tags for the hashtags in `content`.
pub fn topic_tags(content: &str) -> Vec<Vec<String>> {
    hashtags(content)
        .into_iter()
        .map(|topic| vec!["t".to_string(), topic])
        .collect()
}

/// Publishing entry points shared by an engine: relay selection through
/// hints and signing through the session signer.
pub struct Outbox {
    network: Arc<dyn Network>,
    pipeline: Arc<ProjectionPipeline>,
    hints: Arc<dyn RelayHints>,
    signer: Option<Arc<dyn Signer>>,
    config: PublishConfig,
}

impl Outbox {
    pub fn new(
        network: Arc<dyn Network>,
        pipeline: Arc<ProjectionPipeline>,
        hints: Arc<dyn RelayHints>,
        config: PublishConfig,
    ) -> Self {
        Self {
            network,
            pipeline,
            hints,
            signer: None,
            config,
        }
    }

    #[must_use]
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Replace or clear the signer used for templates.
    pub fn set_signer(&mut self, signer: Option<Arc<dyn Signer>>) {
        self.signer = signer;
    }

    /// A publisher wired to this outbox's network and pipeline. Fails for
    /// wrapped events.
    pub fn publisher(&self, event: Event) -> Result<Publisher> {
        Publisher::new(event, Arc::clone(&self.network), Arc::clone(&self.pipeline))
    }

    /// Publish a signed event to `relays`, or to its publish hints.
    pub fn publish_event(
        &self,
        event: Event,
        relays: Option<Vec<String>>,
    ) -> Result<PublishHandle> {
        self.publish_with(event, relays, PublishOptions::with_timeout(self.config.timeout))
    }

    /// Sign `template` as the session user and publish it.
    pub async fn publish_template(
        &self,
        template: EventTemplate,
        relays: Option<Vec<String>>,
    ) -> Result<PublishHandle> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| SyncError::Signer("no signer configured".to_string()))?;
        let event = signer.sign(template).await?;
        self.publish_with(
            event,
            relays,
            PublishOptions::with_timeout(self.config.template_timeout),
        )
    }

    /// Build, sign and publish an event, adding topic tags for the hashtags
    /// in `content`.
    pub async fn create_and_publish(
        &self,
        kind: u16,
        content: &str,
        tags: Vec<Vec<String>>,
        relays: Option<Vec<String>>,
    ) -> Result<PublishHandle> {
        let mut tags = tags;
        tags.extend(topic_tags(content));
        let template = EventTemplate::new(kind, now(), content).with_tags(uniq_tags(tags));
        self.publish_template(template, relays).await
    }

    fn publish_with(
        &self,
        event: Event,
        relays: Option<Vec<String>>,
        options: PublishOptions,
    ) -> Result<PublishHandle> {
        let publisher = self.publisher(event)?;
        let relays = relays.unwrap_or_else(|| self.hints.publish_relays(publisher.event()));
        Ok(publisher.publish(&relays, options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> Event {
        Event {
            id: "ev".to_string(),
            pubkey: "me".to_string(),
            created_at: 1,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
            seen_on: BTreeSet::new(),
            wrapper: None,
        }
    }

    fn relays(urls: &[&str]) -> Vec<String> {
        urls.iter().map(ToString::to_string).collect()
    }

    fn assert_consistent(progress: &PublishProgress) {
        let union: BTreeSet<String> = progress
            .succeeded
            .iter()
            .chain(&progress.failed)
            .chain(&progress.timeouts)
            .cloned()
            .collect();
        assert_eq!(progress.completed, union);
        assert_eq!(
            progress.pending,
            progress.attempted.difference(&progress.completed).cloned().collect()
        );
    }

    #[test]
    fn tracker_last_ack_wins() {
        let mut tracker = PublishTracker::new(event(), &relays(&["wss://a", "wss://b"]));
        tracker.on_ok("wss://a", false);
        tracker.on_ok("wss://a", true);
        tracker.on_error("wss://b");
        tracker.on_ok("wss://unknown", true);

        let progress = tracker.progress();
        assert_consistent(&progress);
        assert_eq!(progress.succeeded, BTreeSet::from(["wss://a".to_string()]));
        assert_eq!(progress.failed, BTreeSet::from(["wss://b".to_string()]));
        assert!(progress.event.seen_on.contains("wss://a"));
        assert!(!progress.attempted.contains("wss://unknown"));
    }

    #[test]
    fn tracker_resolves_once() {
        let mut tracker = PublishTracker::new(event(), &relays(&["wss://a", "wss://b"]));
        tracker.on_ok("wss://a", true);
        assert!(tracker.try_resolve().is_none());

        tracker.on_timeout();
        let resolved = tracker.try_resolve();
        assert_eq!(
            resolved.map(|progress| progress.timeouts),
            Some(BTreeSet::from(["wss://b".to_string()]))
        );
        assert!(tracker.try_resolve().is_none());
    }

    #[test]
    fn uniq_tags_keeps_first_by_name_and_value() {
        let tags = vec![
            vec!["t".to_string(), "rust".to_string()],
            vec!["t".to_string(), "rust".to_string(), "extra".to_string()],
            vec!["param".to_string(), "a".to_string(), "1".to_string()],
            vec!["param".to_string(), "a".to_string(), "2".to_string()],
            vec!["param".to_string(), "a".to_string(), "1".to_string()],
        ];

        assert_eq!(
            uniq_tags(tags),
            vec![
                vec!["t".to_string(), "rust".to_string()],
                vec!["param".to_string(), "a".to_string(), "1".to_string()],
                vec!["param".to_string(), "a".to_string(), "2".to_string()],
            ]
        );
    }

    #[test]
    fn topic_tags_from_hashtags() {
        assert_eq!(
            topic_tags("#Nostr is neat, see #rust_lang but not a#b"),
            vec![
                vec!["t".to_string(), "nostr".to_string()],
                vec!["t".to_string(), "rust_lang".to_string()],
            ]
        );
    }
}
