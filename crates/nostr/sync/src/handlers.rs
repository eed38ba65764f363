//! Built-in projection handlers: deletions, read receipts, mute lists, gift
//! wraps, topics and the sessions' own events.

use crate::derived::DerivedState;
use crate::error::Result;
use crate::mutes::MuteList;
use crate::projections::{EventHandler, ProjectionPipeline, ProjectionQueue};
use crate::publish::hashtags;
use async_trait::async_trait;
use nostr::Event;
use nostr::kinds::{LABEL, MUTE_LIST, READ_RECEIPT, TEXT_NOTE};
use nostr::nip09::{DELETION, deletion_targets};
use nostr::nip59::{GIFT_WRAP, LEGACY_GIFT_WRAP, is_gift_wrap, recipient};
use nostr::tag_parsing::{tag_field, tag_name, tag_value};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Highest `created_at` per author in a batch.
fn latest_by_author(events: &[Event]) -> BTreeMap<&str, u64> {
    let mut latest: BTreeMap<&str, u64> = BTreeMap::new();
    for event in events {
        let entry = latest.entry(event.pubkey.as_str()).or_default();
        *entry = (*entry).max(event.created_at);
    }
    latest
}

/// Kind 5: record tombstones and advance the authors' delete watermarks.
pub struct DeletionHandler {
    derived: Arc<DerivedState>,
}

impl DeletionHandler {
    pub fn new(derived: Arc<DerivedState>) -> Self {
        Self { derived }
    }
}

#[async_trait]
impl EventHandler for DeletionHandler {
    fn name(&self) -> &str {
        "deletions"
    }

    async fn handle(&self, events: &[Event], _queue: &ProjectionQueue) -> Result<()> {
        for (pubkey, created_at) in latest_by_author(events) {
            self.derived.advance_deletes_synced(pubkey, created_at);
        }
        self.derived
            .add_tombstones(events.iter().flat_map(deletion_targets));
        Ok(())
    }
}

/// Kind 15: store receipts and advance the authors' seen watermarks.
pub struct ReceiptHandler {
    derived: Arc<DerivedState>,
}

impl ReceiptHandler {
    pub fn new(derived: Arc<DerivedState>) -> Self {
        Self { derived }
    }
}

#[async_trait]
impl EventHandler for ReceiptHandler {
    fn name(&self) -> &str {
        "receipts"
    }

    async fn handle(&self, events: &[Event], _queue: &ProjectionQueue) -> Result<()> {
        for (pubkey, created_at) in latest_by_author(events) {
            self.derived.advance_seen_synced(pubkey, created_at);
        }
        self.derived.add_receipts(events);
        Ok(())
    }
}

/// Kind 10000: the newest mute list published by a session becomes the
/// active one.
pub struct MuteListHandler {
    derived: Arc<DerivedState>,
    latest: Mutex<u64>,
}

impl MuteListHandler {
    pub fn new(derived: Arc<DerivedState>) -> Self {
        Self {
            derived,
            latest: Mutex::new(0),
        }
    }
}

#[async_trait]
impl EventHandler for MuteListHandler {
    fn name(&self) -> &str {
        "mute-lists"
    }

    async fn handle(&self, events: &[Event], _queue: &ProjectionQueue) -> Result<()> {
        let Some(newest) = events
            .iter()
            .filter(|event| self.derived.has_session(&event.pubkey))
            .max_by_key(|event| event.created_at)
        else {
            return Ok(());
        };

        let mut latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        if newest.created_at > *latest {
            *latest = newest.created_at;
            let mutes = MuteList::from_event(newest);
            debug!(
                pubkeys = mutes.pubkeys.len(),
                events = mutes.events.len(),
                words = mutes.words.len(),
                "mute list updated"
            );
            self.derived.set_mutes(mutes);
        }
        Ok(())
    }
}

/// Kinds 1059/1060: reveal rumors for local recipients and push them back
/// into the pipeline, marked with the wrap they came from.
pub struct GiftWrapHandler {
    derived: Arc<DerivedState>,
    unwrapped: Mutex<HashSet<String>>,
}

impl GiftWrapHandler {
    pub fn new(derived: Arc<DerivedState>) -> Self {
        Self {
            derived,
            unwrapped: Mutex::new(HashSet::new()),
        }
    }

    /// Claim a wrap id; `false` if it was already unwrapped or is being
    /// unwrapped.
    fn claim(&self, id: &str) -> bool {
        self.unwrapped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string())
    }

    fn release(&self, id: &str) {
        self.unwrapped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

#[async_trait]
impl EventHandler for GiftWrapHandler {
    fn name(&self) -> &str {
        "gift-wraps"
    }

    async fn handle(&self, events: &[Event], queue: &ProjectionQueue) -> Result<()> {
        for wrap in events {
            if !is_gift_wrap(wrap) || wrap.wrapper.is_some() {
                continue;
            }

            // Wraps without a local recipient stay unclaimed.
            let Some(unwrapper) =
                recipient(wrap).and_then(|pubkey| self.derived.session_unwrapper(pubkey))
            else {
                continue;
            };
            if !self.claim(&wrap.id) {
                continue;
            }

            match unwrapper.unwrap(wrap).await {
                Ok(mut rumor) => {
                    debug!(
                        wrap = %wrap.id,
                        rumor = %rumor.id,
                        kind = rumor.kind,
                        "unwrapped gift wrap"
                    );
                    rumor.wrapper = Some(wrap.id.clone());
                    rumor.seen_on.clone_from(&wrap.seen_on);
                    queue.push(rumor);
                }
                Err(error) => {
                    warn!(wrap = %wrap.id, %error, "failed to unwrap gift wrap");
                    self.release(&wrap.id);
                }
            }
        }
        Ok(())
    }
}

/// Kind 1 hashtags (`t` tags and `#word` in content) and kind 1985 labels
/// in the `#t` namespace feed the topic counts. Each event counts once.
pub struct TopicHandler {
    derived: Arc<DerivedState>,
    counted: Mutex<Counted>,
}

/// Ids of the most recently counted events, oldest evicted first.
#[derive(Default)]
struct Counted {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl Counted {
    const LIMIT: usize = 10_000;

    fn insert(&mut self, id: &str) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > Self::LIMIT {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

impl TopicHandler {
    pub fn new(derived: Arc<DerivedState>) -> Self {
        Self {
            derived,
            counted: Mutex::new(Counted::default()),
        }
    }

    fn topics(event: &Event) -> Vec<String> {
        let mut names: Vec<String> = match event.kind {
            TEXT_NOTE => event
                .tag_values("t")
                .into_iter()
                .chain(hashtags(&event.content))
                .collect(),
            LABEL => event
                .tags
                .iter()
                .filter(|tag| tag_name(tag) == Some("l") && tag_field(tag, 2) == Some("#t"))
                .filter_map(|tag| tag_value(tag).map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };
        for name in &mut names {
            *name = name.to_lowercase();
        }
        names.sort();
        names.dedup();
        names
    }
}

#[async_trait]
impl EventHandler for TopicHandler {
    fn name(&self) -> &str {
        "topics"
    }

    async fn handle(&self, events: &[Event], _queue: &ProjectionQueue) -> Result<()> {
        let mut counted = self.counted.lock().unwrap_or_else(PoisonError::into_inner);
        for event in events {
            if !counted.insert(&event.id) {
                continue;
            }
            for name in Self::topics(event) {
                self.derived.add_topic(&name, event.created_at);
            }
        }
        Ok(())
    }
}

/// Global handler keeping the sessions' own events.
pub struct UserEventsHandler {
    derived: Arc<DerivedState>,
}

impl UserEventsHandler {
    pub fn new(derived: Arc<DerivedState>) -> Self {
        Self { derived }
    }
}

#[async_trait]
impl EventHandler for UserEventsHandler {
    fn name(&self) -> &str {
        "user-events"
    }

    async fn handle(&self, events: &[Event], _queue: &ProjectionQueue) -> Result<()> {
        self.derived.add_user_events(events);
        Ok(())
    }
}

/// Register every built-in handler on `pipeline`.
pub fn register_builtin_handlers(pipeline: &ProjectionPipeline) {
    let derived = Arc::clone(pipeline.derived());

    pipeline.add_global_handler(Arc::new(UserEventsHandler::new(Arc::clone(&derived))));
    pipeline.add_handler(DELETION, Arc::new(DeletionHandler::new(Arc::clone(&derived))));
    pipeline.add_handler(READ_RECEIPT, Arc::new(ReceiptHandler::new(Arc::clone(&derived))));
    pipeline.add_handler(MUTE_LIST, Arc::new(MuteListHandler::new(Arc::clone(&derived))));

    let topics: Arc<dyn EventHandler> = Arc::new(TopicHandler::new(Arc::clone(&derived)));
    pipeline.add_handler(TEXT_NOTE, Arc::clone(&topics));
    pipeline.add_handler(LABEL, topics);

    let wraps: Arc<dyn EventHandler> = Arc::new(GiftWrapHandler::new(derived));
    pipeline.add_handler(GIFT_WRAP, Arc::clone(&wraps));
    pipeline.add_handler(LEGACY_GIFT_WRAP, wraps);
}
