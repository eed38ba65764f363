//! NIP-10: thread structure of text notes.
//!
//! Marked `e`/`a` tags (`["e", id, relay, "root" | "reply" | "mention"]`)
//! are read by marker. Events without root or reply markers fall back to
//! the deprecated positional scheme: the first `e` tag is the root, the
//! last is the reply and anything between is a mention.

use crate::nip01::Event;
use crate::tag_parsing::{is_tag, tag_field, tag_value};

const ROOT: &str = "root";
const REPLY: &str = "reply";
const MENTION: &str = "mention";

/// Thread references of an event, each a full `e` or `a` tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ancestors {
    pub roots: Vec<Vec<String>>,
    pub replies: Vec<Vec<String>>,
    pub mentions: Vec<Vec<String>>,
}

impl Ancestors {
    pub fn from_event(event: &Event) -> Self {
        Self::from_tags(&event.tags)
    }

    pub fn from_tags(tags: &[Vec<String>]) -> Self {
        let refs: Vec<&Vec<String>> = tags
            .iter()
            .filter(|tag| (is_tag(tag, "e") || is_tag(tag, "a")) && tag_value(tag).is_some())
            .collect();

        let mut ancestors = Self::default();
        let is_marked = refs
            .iter()
            .any(|tag| matches!(tag_field(tag, 3), Some(ROOT | REPLY)));

        if is_marked {
            for tag in refs {
                match tag_field(tag, 3) {
                    Some(ROOT) => ancestors.roots.push(tag.clone()),
                    Some(REPLY) => ancestors.replies.push(tag.clone()),
                    _ => ancestors.mentions.push(tag.clone()),
                }
            }
            return ancestors;
        }

        let (positional, mentions): (Vec<&Vec<String>>, Vec<&Vec<String>>) = refs
            .into_iter()
            .partition(|tag| is_tag(tag, "e") && tag_field(tag, 3) != Some(MENTION));
        ancestors.mentions = mentions.into_iter().cloned().collect();

        match positional.as_slice() {
            [] => {}
            [only] => {
                ancestors.roots.push((*only).clone());
                ancestors.replies.push((*only).clone());
            }
            [first, middle @ .., last] => {
                ancestors.roots.push((*first).clone());
                ancestors
                    .mentions
                    .extend(middle.iter().map(|tag| (*tag).clone()));
                ancestors.replies.push((*last).clone());
            }
        }

        ancestors
    }

    /// Id or address of the event this one directly replies to.
    pub fn parent_id(&self) -> Option<&str> {
        self.replies
            .first()
            .or_else(|| self.roots.first())
            .and_then(|tag| tag_value(tag))
    }

    pub fn root_id(&self) -> Option<&str> {
        self.roots.first().and_then(|tag| tag_value(tag))
    }

    /// Ids and addresses of the direct parent references.
    pub fn parent_ids(&self) -> Vec<String> {
        let parents = if self.replies.is_empty() {
            &self.roots
        } else {
            &self.replies
        };
        parents
            .iter()
            .filter_map(|tag| tag_value(tag).map(str::to_owned))
            .collect()
    }
}

/// Direct parent id or address of `event`, if it is a reply.
pub fn parent_id(event: &Event) -> Option<String> {
    Ancestors::from_event(event).parent_id().map(str::to_owned)
}

pub fn is_reply(event: &Event) -> bool {
    parent_id(event).is_some()
}

/// Whether `child` directly replies to `parent`, by id or address.
pub fn is_child_of(child: &Event, parent: &Event) -> bool {
    let parent_ids = Ancestors::from_event(child).parent_ids();
    parent
        .id_and_address()
        .iter()
        .any(|key| parent_ids.contains(key))
}

fn marked(tag: &[String], marker: &str) -> Vec<String> {
    vec![
        tag.first().cloned().unwrap_or_default(),
        tag.get(1).cloned().unwrap_or_default(),
        tag.get(2).cloned().unwrap_or_default(),
        marker.to_string(),
    ]
}

/// Tags for a reply to `parent`: author mentions, the thread root, optionally
/// inherited mentions, then the parent itself marked as `reply`.
pub fn reply_tags(parent: &Event, user_pubkey: Option<&str>, inherit: bool) -> Vec<Vec<String>> {
    let ancestors = Ancestors::from_event(parent);
    let parent_keys = parent.id_and_address();
    let is_self = |pubkey: &str| user_pubkey == Some(pubkey);
    let mut tags: Vec<Vec<String>> = Vec::new();

    if !is_self(&parent.pubkey) {
        tags.push(vec!["p".to_string(), parent.pubkey.clone()]);
    }

    if inherit {
        for pubkey in parent.tag_values("p") {
            if !is_self(&pubkey) && !tags.iter().any(|tag| tag_field(tag, 1) == Some(&pubkey)) {
                tags.push(vec!["p".to_string(), pubkey]);
            }
        }
    }

    let roots = if ancestors.roots.is_empty() {
        &ancestors.replies
    } else {
        &ancestors.roots
    };
    tags.extend(roots.iter().map(|tag| marked(tag, ROOT)));

    if inherit {
        let mut inherited = ancestors.mentions.clone();
        if !ancestors.roots.is_empty() {
            inherited.extend(ancestors.replies.iter().cloned());
        }

        for tag in inherited {
            let Some(value) = tag_value(&tag) else {
                continue;
            };
            let repeated = parent_keys.iter().any(|key| key == value)
                || tags.iter().any(|existing| tag_field(existing, 1) == Some(value));
            if !repeated {
                tags.push(marked(&tag, MENTION));
            }
        }
    }

    tags.push(vec![
        "e".to_string(),
        parent.id.clone(),
        String::new(),
        REPLY.to_string(),
    ]);
    if let Some(address) = parent.address() {
        tags.push(vec![
            "a".to_string(),
            address.to_string(),
            String::new(),
            REPLY.to_string(),
        ]);
    }

    tags
}
