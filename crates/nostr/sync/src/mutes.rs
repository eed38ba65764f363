//! Mute list evaluation.

use nostr::Ancestors;
use nostr::Event;
use nostr::kinds::MUTE_LIST;
use nostr::tag_parsing::{tag_name, tag_value};
use std::collections::BTreeSet;

/// Muted pubkeys, events and words of the active user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MuteList {
    pub pubkeys: BTreeSet<String>,
    pub events: BTreeSet<String>,
    /// Lowercased words matched against event content.
    pub words: BTreeSet<String>,
    /// Events by this pubkey are never muted.
    pub owner: Option<String>,
}

impl MuteList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the public tags of a kind 10000 mute list.
    pub fn from_event(event: &Event) -> Self {
        let mut mutes = Self {
            owner: Some(event.pubkey.clone()),
            ..Self::default()
        };
        if event.kind != MUTE_LIST {
            return mutes;
        }

        for tag in &event.tags {
            let Some(value) = tag_value(tag) else {
                continue;
            };
            match tag_name(tag) {
                Some("p") => {
                    mutes.pubkeys.insert(value.to_string());
                }
                Some("e") => {
                    mutes.events.insert(value.to_string());
                }
                Some("word") => {
                    mutes.words.insert(value.to_lowercase());
                }
                _ => {}
            }
        }
        mutes
    }

    pub fn mute_pubkey(mut self, pubkey: impl Into<String>) -> Self {
        self.pubkeys.insert(pubkey.into());
        self
    }

    pub fn mute_event(mut self, id: impl Into<String>) -> Self {
        self.events.insert(id.into());
        self
    }

    pub fn mute_word(mut self, word: &str) -> Self {
        self.words.insert(word.to_lowercase());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pubkeys.is_empty() && self.events.is_empty() && self.words.is_empty()
    }

    /// Whether `event` should be hidden.
    ///
    /// An event is muted when its author, its id or one of its thread
    /// ancestors is muted, or its content contains a muted word. Strict mode
    /// also hides events that mention a muted pubkey.
    pub fn is_event_muted(&self, event: &Event, strict: bool) -> bool {
        if self.is_empty() || self.owner.as_deref() == Some(event.pubkey.as_str()) {
            return false;
        }

        if self.pubkeys.contains(&event.pubkey) || self.events.contains(&event.id) {
            return true;
        }

        let ancestors = Ancestors::from_event(event);
        let muted_ancestor = ancestors
            .roots
            .iter()
            .chain(&ancestors.replies)
            .filter_map(|tag| tag_value(tag))
            .any(|id| self.events.contains(id));
        if muted_ancestor {
            return true;
        }

        if !self.words.is_empty() {
            let content = event.content.to_lowercase();
            if self.words.iter().any(|word| content.contains(word.as_str())) {
                return true;
            }
        }

        strict
            && event
                .tag_values("p")
                .iter()
                .any(|pubkey| self.pubkeys.contains(pubkey))
    }
}
