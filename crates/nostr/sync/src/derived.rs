//! Derived state written by projection handlers and read by feeds.
//!
//! Readers get eventually-consistent snapshots: a read never waits for
//! events still queued in the projection pipeline.

use crate::mutes::MuteList;
use crate::network::Unwrapper;
use nostr::Event;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Sync watermarks of a local session. Both only ever grow.
///
/// Embedders persist these to resume syncing deletions and receipts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermarks {
    pub deletes_last_synced: u64,
    pub seen_last_synced: u64,
}

/// How often a topic was seen and when it was last used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub name: String,
    pub count: u64,
    pub last_seen: u64,
}

struct Session {
    watermarks: Watermarks,
    unwrapper: Option<Arc<dyn Unwrapper>>,
}

#[derive(Default)]
struct Receipts {
    by_id: HashMap<String, Event>,
    seen: HashSet<String>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Tombstones, read receipts, sessions, mutes and the sessions' own events.
pub struct DerivedState {
    tombstones: RwLock<HashSet<String>>,
    receipts: RwLock<Receipts>,
    sessions: RwLock<HashMap<String, Session>>,
    mutes: RwLock<MuteList>,
    user_events: RwLock<VecDeque<Event>>,
    user_events_limit: usize,
    topics: RwLock<HashMap<String, Topic>>,
}

impl fmt::Debug for DerivedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedState")
            .field("tombstones", &read(&self.tombstones).len())
            .field("receipts", &read(&self.receipts).by_id.len())
            .field("sessions", &read(&self.sessions).len())
            .field("user_events", &read(&self.user_events).len())
            .field("topics", &read(&self.topics).len())
            .finish_non_exhaustive()
    }
}

impl DerivedState {
    /// Empty state keeping at most `user_events_limit` session events.
    pub fn new(user_events_limit: usize) -> Self {
        Self {
            tombstones: RwLock::new(HashSet::new()),
            receipts: RwLock::new(Receipts::default()),
            sessions: RwLock::new(HashMap::new()),
            mutes: RwLock::new(MuteList::default()),
            user_events: RwLock::new(VecDeque::new()),
            user_events_limit,
            topics: RwLock::new(HashMap::new()),
        }
    }

    // Sessions

    /// Register a local session. Re-adding keeps existing watermarks.
    pub fn add_session(&self, pubkey: impl Into<String>, unwrapper: Option<Arc<dyn Unwrapper>>) {
        let mut sessions = write(&self.sessions);
        let session = sessions.entry(pubkey.into()).or_insert_with(|| Session {
            watermarks: Watermarks::default(),
            unwrapper: None,
        });
        session.unwrapper = unwrapper;
    }

    pub fn has_session(&self, pubkey: &str) -> bool {
        read(&self.sessions).contains_key(pubkey)
    }

    /// The unwrapper registered for a session, if any.
    pub fn session_unwrapper(&self, pubkey: &str) -> Option<Arc<dyn Unwrapper>> {
        read(&self.sessions)
            .get(pubkey)
            .and_then(|session| session.unwrapper.clone())
    }

    /// `None` for pubkeys without a session.
    pub fn watermarks(&self, pubkey: &str) -> Option<Watermarks> {
        read(&self.sessions)
            .get(pubkey)
            .map(|session| session.watermarks)
    }

    /// Raise the session's deletion watermark; lower values are ignored.
    pub fn advance_deletes_synced(&self, pubkey: &str, created_at: u64) {
        if let Some(session) = write(&self.sessions).get_mut(pubkey) {
            let watermark = &mut session.watermarks.deletes_last_synced;
            *watermark = (*watermark).max(created_at);
        }
    }

    pub fn advance_seen_synced(&self, pubkey: &str, created_at: u64) {
        if let Some(session) = write(&self.sessions).get_mut(pubkey) {
            let watermark = &mut session.watermarks.seen_last_synced;
            *watermark = (*watermark).max(created_at);
        }
    }

    // Tombstones

    /// Record deleted event ids and addresses.
    pub fn add_tombstones<I>(&self, targets: I)
    where
        I: IntoIterator<Item = String>,
    {
        write(&self.tombstones).extend(targets);
    }

    /// Whether the event was deleted, by id or by address.
    pub fn is_deleted(&self, event: &Event) -> bool {
        let tombstones = read(&self.tombstones);
        event
            .id_and_address()
            .iter()
            .any(|key| tombstones.contains(key))
    }

    pub fn tombstone_count(&self) -> usize {
        read(&self.tombstones).len()
    }

    // Receipts

    /// Store kind 15 receipts and mark every `e` target as seen.
    pub fn add_receipts(&self, receipts: &[Event]) {
        let mut state = write(&self.receipts);
        for receipt in receipts {
            state.seen.extend(receipt.tag_values("e"));
            state.by_id.insert(receipt.id.clone(), receipt.clone());
        }
    }

    pub fn receipt(&self, id: &str) -> Option<Event> {
        read(&self.receipts).by_id.get(id).cloned()
    }

    /// Whether some read receipt covers `event_id`.
    pub fn is_seen(&self, event_id: &str) -> bool {
        read(&self.receipts).seen.contains(event_id)
    }

    // Mutes

    /// Replace the active mute list.
    pub fn set_mutes(&self, mutes: MuteList) {
        *write(&self.mutes) = mutes;
    }

    /// Check `event` against the active mute list.
    pub fn is_event_muted(&self, event: &Event, strict: bool) -> bool {
        read(&self.mutes).is_event_muted(event, strict)
    }

    // Session events

    /// Store events authored by local sessions, keeping the newest
    /// `user_events_limit`.
    pub fn add_user_events(&self, events: &[Event]) {
        let mut stored = write(&self.user_events);
        for event in events {
            if stored.iter().any(|existing| existing.id == event.id) {
                continue;
            }
            stored.push_back(event.clone());
        }
        while stored.len() > self.user_events_limit {
            stored.pop_front();
        }
    }

    pub fn user_events(&self) -> Vec<Event> {
        read(&self.user_events).iter().cloned().collect()
    }

    // Topics

    /// Count one use of `name` (case-insensitive) at `created_at`.
    pub fn add_topic(&self, name: &str, created_at: u64) {
        let name = name.trim().trim_start_matches('#').to_lowercase();
        if name.is_empty() {
            return;
        }
        let mut topics = write(&self.topics);
        let topic = topics.entry(name.clone()).or_insert_with(|| Topic {
            name,
            count: 0,
            last_seen: 0,
        });
        topic.count += 1;
        topic.last_seen = topic.last_seen.max(created_at);
    }

    pub fn topic(&self, name: &str) -> Option<Topic> {
        read(&self.topics).get(&name.to_lowercase()).cloned()
    }

    /// Every known topic, most used first.
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = read(&self.topics).values().cloned().collect();
        topics.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
        topics
    }
}

impl Default for DerivedState {
    fn default() -> Self {
        Self::new(1_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn event(id: &str, kind: u16, tags: Vec<Vec<String>>) -> Event {
        Event {
            id: id.to_string(),
            pubkey: "me".to_string(),
            created_at: 100,
            kind,
            tags,
            content: String::new(),
            sig: String::new(),
            seen_on: BTreeSet::new(),
            wrapper: None,
        }
    }

    #[test]
    fn tombstones_match_id_or_address() {
        let state = DerivedState::default();
        state.add_tombstones(["gone".to_string(), "30023:me:post".to_string()]);

        assert!(state.is_deleted(&event("gone", 1, vec![])));
        assert!(state.is_deleted(&event(
            "fresh-version",
            30_023,
            vec![vec!["d".to_string(), "post".to_string()]]
        )));
        assert!(!state.is_deleted(&event("kept", 1, vec![])));
    }

    #[test]
    fn watermarks_never_move_backwards() {
        let state = DerivedState::default();
        state.advance_deletes_synced("me", 10);
        assert_eq!(state.watermarks("me"), None);

        state.add_session("me", None);
        state.advance_deletes_synced("me", 50);
        state.advance_deletes_synced("me", 20);
        state.advance_seen_synced("me", 7);

        assert_eq!(
            state.watermarks("me"),
            Some(Watermarks {
                deletes_last_synced: 50,
                seen_last_synced: 7,
            })
        );

        state.add_session("me", None);
        assert_eq!(state.watermarks("me").map(|w| w.deletes_last_synced), Some(50));
    }

    #[test]
    fn restored_watermarks_resume_from_persisted_values() -> serde_json::Result<()> {
        let persisted: Watermarks =
            serde_json::from_str(r#"{"deletes_last_synced":120,"seen_last_synced":80}"#)?;
        let state = DerivedState::default();
        state.add_session("me", None);
        state.advance_deletes_synced("me", persisted.deletes_last_synced);
        state.advance_seen_synced("me", persisted.seen_last_synced);
        state.advance_deletes_synced("me", 100);

        assert_eq!(state.watermarks("me"), Some(persisted));
        Ok(())
    }

    #[test]
    fn user_events_are_bounded() {
        let state = DerivedState::new(2);
        state.add_user_events(&[event("a", 1, vec![]), event("b", 1, vec![])]);
        state.add_user_events(&[event("b", 1, vec![]), event("c", 1, vec![])]);

        let ids: Vec<String> = state.user_events().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn topics_are_case_insensitive_and_ranked() {
        let state = DerivedState::default();
        state.add_topic("Nostr", 10);
        state.add_topic("#nostr", 30);
        state.add_topic("rust", 20);
        state.add_topic("  ", 40);

        assert_eq!(
            state.topic("NOSTR"),
            Some(Topic {
                name: "nostr".to_string(),
                count: 2,
                last_seen: 30,
            })
        );
        let names: Vec<String> = state.topics().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["nostr".to_string(), "rust".to_string()]);
    }

    #[test]
    fn receipts_track_seen_events() {
        let state = DerivedState::default();
        state.add_receipts(&[event("r1", 15, vec![vec!["e".to_string(), "note".to_string()]])]);
        assert!(state.is_seen("note"));
        assert!(state.receipt("r1").is_some());
    }
}
