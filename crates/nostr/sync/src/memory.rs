//! In-memory relay network.
//!
//! Simulated relays hold stored events and answer subscriptions and
//! publishes with configurable latency, acknowledgement behaviour and
//! hangs. Everything runs on tokio timers, so paused-clock tests observe
//! exact timings.

use crate::network::{Network, PublishVerb, SubscribeRequest};
use crate::subscription::{
    PublishMessage, Subscription, SubscriptionMessage, SubscriptionSender, channel,
};
use futures_util::future::join_all;
use nostr::{Event, Filter};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// How a relay answers publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckPolicy {
    /// Store the event and answer `OK true` after `delay`.
    Accept { delay: Duration },
    /// Answer `OK false` after `delay`.
    Reject { delay: Duration, message: String },
    /// Report a transport error after `delay`.
    Fail { delay: Duration },
    /// Never answer.
    Silent,
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self::Accept {
            delay: Duration::ZERO,
        }
    }
}

/// One simulated relay: its stored events and how it answers.
#[derive(Debug, Clone, Default)]
pub struct MemoryRelay {
    events: Vec<Event>,
    latency: Duration,
    ack: AckPolicy,
    hang: bool,
    ignore_time_bounds: bool,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(mut self, events: impl IntoIterator<Item = Event>) -> Self {
        self.events.extend(events);
        self
    }

    /// Delay before stored events and EOSE are sent.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// How the relay answers publishes. Defaults to accepting.
    pub fn with_ack(mut self, ack: AckPolicy) -> Self {
        self.ack = ack;
        self
    }

    /// Accept requests but never answer them.
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Answer queries as if `since` and `until` were absent, like relays
    /// that ignore time bounds.
    pub fn ignoring_time_bounds(mut self) -> Self {
        self.ignore_time_bounds = true;
        self
    }

    fn query(&self, filters: &[Filter]) -> Vec<Event> {
        let mut seen = HashSet::new();
        let mut results = Vec::new();

        for filter in filters {
            let mut filter = filter.clone();
            if self.ignore_time_bounds {
                filter.since = None;
                filter.until = None;
            }
            let mut matching: Vec<&Event> = self
                .events
                .iter()
                .filter(|event| filter.matches(event))
                .collect();
            matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            if let Some(limit) = filter.limit {
                matching.truncate(limit);
            }
            for event in matching {
                if seen.insert(event.id.clone()) {
                    results.push(event.clone());
                }
            }
        }

        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        results
    }
}

struct LiveSubscription {
    relays: Vec<String>,
    filters: Vec<Filter>,
    sender: SubscriptionSender<SubscriptionMessage>,
}

#[derive(Default)]
struct Inner {
    relays: HashMap<String, MemoryRelay>,
    live: Vec<LiveSubscription>,
    requests: Vec<SubscribeRequest>,
    published: Vec<(Vec<String>, Event)>,
}

/// In-memory [`Network`] implementation.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<Inner>>,
}

struct RelayPlan {
    url: String,
    events: Vec<Event>,
    latency: Duration,
    hang: bool,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_relay(&self, url: impl Into<String>, relay: MemoryRelay) {
        self.lock().relays.insert(url.into(), relay);
    }

    pub fn with_relay(self, url: impl Into<String>, relay: MemoryRelay) -> Self {
        self.add_relay(url, relay);
        self
    }

    /// Store an event on a relay without notifying live subscriptions.
    pub fn store(&self, relay: &str, event: Event) {
        self.lock()
            .relays
            .entry(relay.to_string())
            .or_default()
            .events
            .push(event);
    }

    /// Store an event and push it to every open live subscription on `relay`
    /// whose filters match.
    pub fn inject(&self, relay: &str, event: Event) {
        let mut inner = self.lock();
        inner
            .relays
            .entry(relay.to_string())
            .or_default()
            .events
            .push(event.clone());

        inner.live.retain(|live| !live.sender.is_closed());
        for live in &inner.live {
            if live.relays.iter().any(|url| url == relay)
                && live.filters.iter().any(|filter| filter.matches(&event))
            {
                let mut event = event.clone();
                event.mark_seen(relay);
                live.sender.send(SubscriptionMessage::Event(event));
            }
        }
    }

    /// Every subscribe request issued so far, in order.
    pub fn requests(&self) -> Vec<SubscribeRequest> {
        self.lock().requests.clone()
    }

    /// Every publish issued so far, with its target relays.
    pub fn published(&self) -> Vec<(Vec<String>, Event)> {
        self.lock().published.clone()
    }

    /// Open subscriptions that stay alive after EOSE.
    pub fn open_live_subscriptions(&self) -> usize {
        self.lock()
            .live
            .iter()
            .filter(|live| !live.sender.is_closed())
            .count()
    }
}

impl Network for MemoryNetwork {
    fn subscribe(&self, request: SubscribeRequest) -> Subscription<SubscriptionMessage> {
        let (sender, subscription) = channel();

        let plans: Vec<RelayPlan> = {
            let mut inner = self.lock();
            inner.requests.push(request.clone());
            if !request.close_on_eose {
                inner.live.push(LiveSubscription {
                    relays: request.relays.clone(),
                    filters: request.filters.clone(),
                    sender: sender.clone(),
                });
            }
            request
                .relays
                .iter()
                .map(|url| match inner.relays.get(url) {
                    Some(relay) => RelayPlan {
                        url: url.clone(),
                        events: relay.query(&request.filters),
                        latency: relay.latency,
                        hang: relay.hang,
                    },
                    None => RelayPlan {
                        url: url.clone(),
                        events: Vec::new(),
                        latency: Duration::ZERO,
                        hang: false,
                    },
                })
                .collect()
        };

        debug!(
            subscription = subscription.id(),
            relays = request.relays.len(),
            filters = request.filters.len(),
            "memory network subscribe"
        );

        let relay_tasks: Vec<_> = plans
            .into_iter()
            .map(|plan| {
                let sender = sender.clone();
                async move {
                    if plan.hang {
                        std::future::pending::<()>().await;
                    }
                    tokio::time::sleep(plan.latency).await;
                    for mut event in plan.events {
                        event.mark_seen(plan.url.clone());
                        sender.send(SubscriptionMessage::Event(event));
                    }
                    sender.send(SubscriptionMessage::Eose(plan.url));
                }
            })
            .collect();

        let timeout = request.timeout;
        let close_on_eose = request.close_on_eose;
        tokio::spawn(async move {
            let deadline = async move {
                match timeout {
                    Some(timeout) => tokio::time::sleep(timeout).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::pin!(deadline);

            tokio::select! {
                () = sender.closed() => return,
                _ = join_all(relay_tasks) => {
                    if close_on_eose {
                        sender.send(SubscriptionMessage::Complete);
                        return;
                    }
                }
                () = &mut deadline => {
                    sender.send(SubscriptionMessage::Complete);
                    return;
                }
            }

            tokio::select! {
                () = sender.closed() => {}
                () = &mut deadline => {
                    sender.send(SubscriptionMessage::Complete);
                }
            }
        });

        subscription
    }

    fn publish(
        &self,
        relays: &[String],
        event: &Event,
        verb: PublishVerb,
    ) -> Subscription<PublishMessage> {
        let (sender, subscription) = channel();
        debug!(
            subscription = subscription.id(),
            verb = verb.as_str(),
            event = %event.id,
            relays = relays.len(),
            "memory network publish"
        );

        let plans: Vec<(String, Option<AckPolicy>)> = {
            let mut inner = self.lock();
            inner.published.push((relays.to_vec(), event.clone()));
            relays
                .iter()
                .map(|url| {
                    let policy = inner.relays.get_mut(url).map(|relay| {
                        if relay.hang {
                            return AckPolicy::Silent;
                        }
                        if matches!(relay.ack, AckPolicy::Accept { .. }) {
                            relay.events.push(event.clone());
                        }
                        relay.ack.clone()
                    });
                    (url.clone(), policy)
                })
                .collect()
        };

        for (relay, policy) in plans {
            let sender = sender.clone();
            let event_id = event.id.clone();
            tokio::spawn(async move {
                let message = match policy {
                    None => PublishMessage::Error {
                        relay,
                        message: "unknown relay".to_string(),
                    },
                    Some(AckPolicy::Silent) => return,
                    Some(AckPolicy::Accept { delay }) => {
                        tokio::time::sleep(delay).await;
                        PublishMessage::Ok {
                            relay,
                            event_id,
                            ok: true,
                            message: String::new(),
                        }
                    }
                    Some(AckPolicy::Reject { delay, message }) => {
                        tokio::time::sleep(delay).await;
                        PublishMessage::Ok {
                            relay,
                            event_id,
                            ok: false,
                            message,
                        }
                    }
                    Some(AckPolicy::Fail { delay }) => {
                        tokio::time::sleep(delay).await;
                        PublishMessage::Error {
                            relay,
                            message: "connection failed".to_string(),
                        }
                    }
                };
                sender.send(message);
            });
        }

        subscription
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn note(id: &str, created_at: u64) -> Event {
        Event {
            id: id.to_string(),
            pubkey: "alice".to_string(),
            created_at,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
            seen_on: BTreeSet::new(),
            wrapper: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_stored_events_then_completes() {
        let network = MemoryNetwork::new().with_relay(
            "wss://a",
            MemoryRelay::new()
                .with_events([note("old", 1), note("new", 2), note("newest", 3)])
                .with_latency(Duration::from_millis(50)),
        );

        let mut subscription = network.subscribe(SubscribeRequest::once(
            vec!["wss://a".to_string()],
            vec![Filter::new().kinds([1]).limit(2)],
        ));

        let mut ids = Vec::new();
        let mut eose = false;
        while let Some(message) = subscription.recv().await {
            match message {
                SubscriptionMessage::Event(event) => {
                    assert!(event.seen_on.contains("wss://a"));
                    ids.push(event.id);
                }
                SubscriptionMessage::Eose(relay) => {
                    assert_eq!(relay, "wss://a");
                    eose = true;
                }
                SubscriptionMessage::Complete => break,
            }
        }

        assert_eq!(ids, vec!["newest".to_string(), "new".to_string()]);
        assert!(eose);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_relay_completes_at_timeout() {
        let network = MemoryNetwork::new().with_relay("wss://slow", MemoryRelay::new().hanging());
        let started = tokio::time::Instant::now();

        let mut subscription = network.subscribe(
            SubscribeRequest::once(vec!["wss://slow".to_string()], vec![Filter::new()])
                .with_timeout(Duration::from_secs(2)),
        );

        assert_eq!(subscription.recv().await, Some(SubscriptionMessage::Complete));
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn live_subscriptions_receive_injected_events() {
        let network = MemoryNetwork::new().with_relay("wss://a", MemoryRelay::new());
        let mut subscription = network.subscribe(SubscribeRequest::new(
            vec!["wss://a".to_string()],
            vec![Filter::new().kinds([1])],
        ));

        assert_eq!(
            subscription.recv().await,
            Some(SubscriptionMessage::Eose("wss://a".to_string()))
        );

        network.inject("wss://a", note("live", 10));
        match subscription.recv().await {
            Some(SubscriptionMessage::Event(event)) => assert_eq!(event.id, "live"),
            other => unreachable!("unexpected message {other:?}"),
        }

        assert_eq!(network.open_live_subscriptions(), 1);
        subscription.close();
        assert_eq!(network.open_live_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_follows_ack_policy() {
        let network = MemoryNetwork::new()
            .with_relay("wss://ok", MemoryRelay::new())
            .with_relay(
                "wss://no",
                MemoryRelay::new().with_ack(AckPolicy::Reject {
                    delay: Duration::from_millis(10),
                    message: "blocked".to_string(),
                }),
            );

        let relays = vec!["wss://ok".to_string(), "wss://no".to_string()];
        let mut subscription = network.publish(&relays, &note("mine", 5), PublishVerb::Event);

        let mut outcomes = Vec::new();
        for _ in 0..2 {
            if let Some(PublishMessage::Ok { relay, ok, .. }) = subscription.recv().await {
                outcomes.push((relay, ok));
            }
        }

        assert_eq!(
            outcomes,
            vec![("wss://ok".to_string(), true), ("wss://no".to_string(), false)]
        );
        assert_eq!(network.published().len(), 1);
    }
}
