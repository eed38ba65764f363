//! NIP-01: event model, kind classification and event addresses.
//!
//! Replaceable and addressable events are identified by their
//! `kind:pubkey:identifier` address rather than by their id, so two events
//! with different ids can be two versions of the same logical resource. The
//! newer `created_at` wins.

use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::tag_parsing::{collect_tag_values, find_tag_value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// A signed Nostr event.
///
/// Only the seven wire fields are serialized. `seen_on` and `wrapper` are
/// local annotations attached after receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
    /// Relay URLs this event was received from.
    #[serde(skip)]
    pub seen_on: BTreeSet<String>,
    /// Id of the gift wrap this event was revealed from. Such events were
    /// never signed for broadcast and must not be published on their own.
    #[serde(skip)]
    pub wrapper: Option<String>,
}

impl Event {
    #[must_use]
    pub fn classification(&self) -> KindClassification {
        KindClassification::from_kind(self.kind)
    }

    #[must_use]
    pub fn is_addressable(&self) -> bool {
        self.classification().is_addressable()
    }

    /// The event's address, for replaceable and addressable kinds.
    #[must_use]
    pub fn address(&self) -> Option<Address> {
        self.is_addressable().then(|| Address::from_event(self))
    }

    /// Address for replaceable/addressable events, id otherwise.
    #[must_use]
    pub fn id_or_address(&self) -> String {
        match self.address() {
            Some(address) => address.to_string(),
            None => self.id.clone(),
        }
    }

    /// Id, followed by the address when the event has one.
    #[must_use]
    pub fn id_and_address(&self) -> Vec<String> {
        let mut keys = vec![self.id.clone()];
        if let Some(address) = self.address() {
            keys.push(address.to_string());
        }
        keys
    }

    #[must_use]
    pub fn tag_values(&self, name: &str) -> Vec<String> {
        collect_tag_values(&self.tags, name)
    }

    /// Record that this event was observed on `relay`.
    pub fn mark_seen(&mut self, relay: impl Into<String>) {
        self.seen_on.insert(relay.into());
    }

    #[must_use]
    pub fn is_wrapped(&self) -> bool {
        self.wrapper.is_some()
    }
}

/// An unsigned event body, handed to a signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTemplate {
    pub kind: u16,
    pub created_at: u64,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl EventTemplate {
    pub fn new(kind: u16, created_at: u64, content: impl Into<String>) -> Self {
        Self {
            kind,
            created_at,
            tags: Vec::new(),
            content: content.into(),
        }
    }

    #[must_use]
    pub fn with_tags(mut self, tags: Vec<Vec<String>>) -> Self {
        self.tags = tags;
        self
    }
}

/// Storage semantics of a kind, as defined by NIP-01.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClassification {
    Regular,
    Replaceable,
    Ephemeral,
    Addressable,
}

impl KindClassification {
    #[must_use]
    pub fn from_kind(kind: u16) -> Self {
        match kind {
            0 | 3 | 10_000..20_000 => Self::Replaceable,
            20_000..30_000 => Self::Ephemeral,
            30_000..40_000 => Self::Addressable,
            _ => Self::Regular,
        }
    }

    /// Whether events of this class are identified by an address.
    #[must_use]
    pub fn is_addressable(self) -> bool {
        matches!(self, Self::Replaceable | Self::Addressable)
    }
}

/// `kind:pubkey:identifier` coordinate of a replaceable or addressable event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub kind: u16,
    pub pubkey: String,
    pub identifier: String,
}

impl Address {
    pub fn new(kind: u16, pubkey: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            kind,
            pubkey: pubkey.into(),
            identifier: identifier.into(),
        }
    }

    #[must_use]
    pub fn from_event(event: &Event) -> Self {
        Self::new(
            event.kind,
            event.pubkey.clone(),
            find_tag_value(&event.tags, "d").unwrap_or_default(),
        )
    }

    /// Whether a tag value looks like an address rather than an event id.
    #[must_use]
    pub fn is_address(value: &str) -> bool {
        value.contains(':')
    }

    /// Filter selecting every version of the addressed resource.
    #[must_use]
    pub fn as_filter(&self) -> Filter {
        Filter::new()
            .kinds([self.kind])
            .authors([self.pubkey.clone()])
            .tag("d", [self.identifier.clone()])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.pubkey, self.identifier)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let mut parts = value.splitn(3, ':');
        let kind = parts
            .next()
            .and_then(|kind| kind.parse::<u16>().ok())
            .ok_or_else(|| Error::InvalidAddress(value.to_string()))?;
        let pubkey = parts
            .next()
            .filter(|pubkey| !pubkey.is_empty())
            .ok_or_else(|| Error::InvalidAddress(value.to_string()))?;
        let identifier = parts.next().unwrap_or_default();

        Ok(Self::new(kind, pubkey, identifier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: u16, tags: Vec<Vec<String>>) -> Event {
        Event {
            id: "id1".to_string(),
            pubkey: "pk".to_string(),
            created_at: 10,
            kind,
            tags,
            content: String::new(),
            sig: "sig".to_string(),
            seen_on: BTreeSet::new(),
            wrapper: None,
        }
    }

    #[test]
    fn classifies_kinds() {
        assert_eq!(KindClassification::from_kind(1), KindClassification::Regular);
        assert_eq!(KindClassification::from_kind(0), KindClassification::Replaceable);
        assert_eq!(
            KindClassification::from_kind(10_002),
            KindClassification::Replaceable
        );
        assert_eq!(
            KindClassification::from_kind(20_001),
            KindClassification::Ephemeral
        );
        assert_eq!(
            KindClassification::from_kind(30_023),
            KindClassification::Addressable
        );
        assert_eq!(KindClassification::from_kind(40_000), KindClassification::Regular);
    }

    #[test]
    fn id_or_address_prefers_address() {
        let note = event(1, vec![]);
        assert_eq!(note.id_or_address(), "id1");
        assert_eq!(note.id_and_address(), vec!["id1".to_string()]);

        let article = event(30_023, vec![vec!["d".to_string(), "slug".to_string()]]);
        assert_eq!(article.id_or_address(), "30023:pk:slug");
        assert_eq!(
            article.id_and_address(),
            vec!["id1".to_string(), "30023:pk:slug".to_string()]
        );

        let list = event(10_000, vec![]);
        assert_eq!(list.id_or_address(), "10000:pk:");
    }

    #[test]
    fn parses_addresses() -> Result<()> {
        let address: Address = "30023:pk:with:colons".parse()?;
        assert_eq!(address, Address::new(30_023, "pk", "with:colons"));
        assert_eq!(address.to_string(), "30023:pk:with:colons");

        let bare: Address = "10002:pk".parse()?;
        assert_eq!(bare.identifier, "");

        assert!("note:pk:x".parse::<Address>().is_err());
        assert!("1:".parse::<Address>().is_err());
        Ok(())
    }

    #[test]
    fn local_fields_are_not_serialized() -> Result<()> {
        let mut note = event(1, vec![]);
        note.mark_seen("wss://relay.one");
        note.wrapper = Some("wrap".to_string());

        let json = serde_json::to_value(&note)?;
        assert!(json.get("seen_on").is_none());
        assert!(json.get("wrapper").is_none());

        let parsed: Event = serde_json::from_value(json)?;
        assert!(parsed.seen_on.is_empty());
        assert!(!parsed.is_wrapped());
        Ok(())
    }
}
