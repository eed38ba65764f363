//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use chrono::Utc;
use nostr::Event;
use std::collections::BTreeSet;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn now() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or_default()
}

pub fn event(id: &str, pubkey: &str, kind: u16, created_at: u64, tags: &[&[&str]]) -> Event {
    Event {
        id: id.to_string(),
        pubkey: pubkey.to_string(),
        created_at,
        kind,
        tags: tags
            .iter()
            .map(|tag| tag.iter().map(|field| (*field).to_string()).collect())
            .collect(),
        content: String::new(),
        sig: String::new(),
        seen_on: BTreeSet::new(),
        wrapper: None,
    }
}

pub fn note(id: &str, created_at: u64) -> Event {
    event(id, "alice", 1, created_at, &[])
}

pub fn reply(id: &str, parent: &str, created_at: u64) -> Event {
    event(id, "bob", 1, created_at, &[&["e", parent, "", "reply"]])
}

pub fn urls(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_string()).collect()
}

pub fn set(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|value| (*value).to_string()).collect()
}
