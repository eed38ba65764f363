//! Collaborator interfaces: relay transport, signing and gift-wrap decryption.

use crate::error::Result;
use crate::subscription::{PublishMessage, Subscription, SubscriptionMessage};
use async_trait::async_trait;
use nostr::{Event, EventTemplate, Filter};
use std::time::Duration;

/// A read request against a set of relays. Filters are OR-ed.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeRequest {
    pub relays: Vec<String>,
    pub filters: Vec<Filter>,
    /// Complete the subscription after this long even if relays are silent.
    pub timeout: Option<Duration>,
    /// Complete once every relay has sent EOSE instead of staying open for
    /// live events.
    pub close_on_eose: bool,
}

impl SubscribeRequest {
    /// A live request: it stays open after EOSE until closed.
    pub fn new(relays: Vec<String>, filters: Vec<Filter>) -> Self {
        Self {
            relays,
            filters,
            timeout: None,
            close_on_eose: false,
        }
    }

    /// A request that completes after stored events were delivered.
    pub fn once(relays: Vec<String>, filters: Vec<Filter>) -> Self {
        Self {
            close_on_eose: true,
            ..Self::new(relays, filters)
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Client message used to send an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishVerb {
    #[default]
    Event,
    /// NIP-42 authentication response.
    Auth,
}

impl PublishVerb {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Event => "EVENT",
            Self::Auth => "AUTH",
        }
    }
}

/// Multi-relay transport.
///
/// Implementations spawn their own delivery and return immediately. Events
/// carry the URL of the relay they came from in `seen_on`. Publish outcomes
/// arrive once per relay, with possible later corrections.
pub trait Network: Send + Sync {
    fn subscribe(&self, request: SubscribeRequest) -> Subscription<SubscriptionMessage>;

    fn publish(
        &self,
        relays: &[String],
        event: &Event,
        verb: PublishVerb,
    ) -> Subscription<PublishMessage>;
}

/// Signs templates as the active user.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, template: EventTemplate) -> Result<Event>;
}

/// A session's gift-wrap decryption capability.
#[async_trait]
pub trait Unwrapper: Send + Sync {
    /// Reveal the rumor inside `wrap`.
    async fn unwrap(&self, wrap: &Event) -> Result<Event>;
}
