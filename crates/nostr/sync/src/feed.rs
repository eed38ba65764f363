//! Threaded, deduplicated feeds over many relays.
//!
//! A [`FeedLoader`] pages history backwards through a [`MultiCursor`],
//! optionally tails new events live, and merges everything it receives into
//! a newest-first list of [`DisplayEvent`]s. Replies collapse into their
//! topmost known ancestor, reposts into the reposted event, and replaceable
//! events into their newest version.

use crate::clock::now;
use crate::config::FeedConfig;
use crate::cursor::{MultiCursor, PageHandle};
use crate::derived::DerivedState;
use crate::hints::normalize_relay_urls;
use crate::network::{Network, SubscribeRequest};
use crate::projections::ProjectionPipeline;
use crate::subscription::{Subscription, SubscriptionHandle, SubscriptionMessage};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use nostr::kinds::{is_note_kind, is_reaction_kind, is_repost_kind};
use nostr::nip10::parent_id;
use nostr::nip18::unwrap_repost;
use nostr::{Event, Filter, guess_filter_delta, id_filters};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// An event as shown in a feed, with its replies and reposts attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayEvent {
    pub event: Event,
    pub replies: Vec<DisplayEvent>,
    pub reposts: Vec<Event>,
}

impl DisplayEvent {
    pub fn new(event: Event) -> Self {
        Self {
            event,
            replies: Vec::new(),
            reposts: Vec::new(),
        }
    }

    /// Ids of this event and every nested reply, depth first.
    pub fn thread_ids(&self) -> Vec<String> {
        let mut ids = vec![self.event.id.clone()];
        for reply in &self.replies {
            ids.extend(reply.thread_ids());
        }
        ids
    }
}

/// What a feed loads and how it treats incoming events.
#[derive(Debug, Clone)]
pub struct FeedOptions {
    pub relays: Vec<String>,
    pub filters: Vec<Filter>,
    /// Id or address of an event never shown in this feed, typically the
    /// event a thread view is anchored on.
    pub anchor: Option<String>,
    /// Tail new events live.
    pub should_listen: bool,
    /// Hold live events in a buffer until `load_buffer` instead of
    /// prepending them.
    pub should_buffer: bool,
    pub should_hide_replies: bool,
    /// Fetch parents of received replies so threads can be collapsed.
    pub should_load_parents: bool,
    /// Hold orphans and ancient events back before merging them.
    pub should_defer: bool,
}

impl FeedOptions {
    /// A one-shot feed over `relays`: no live tail, no parent loading,
    /// replies shown. Deferral is on.
    pub fn new(relays: Vec<String>, filters: Vec<Filter>) -> Self {
        Self {
            relays,
            filters,
            anchor: None,
            should_listen: false,
            should_buffer: false,
            should_hide_replies: false,
            should_load_parents: false,
            should_defer: true,
        }
    }
}

struct Deferred {
    event: Event,
    release_at: Instant,
}

#[derive(Default)]
struct FeedState {
    notes: Vec<DisplayEvent>,
    buffer: Vec<Event>,
    /// Known parents, keyed by id and by address.
    parents: HashMap<String, Event>,
    /// Reposts keyed by the reposted event's id.
    reposts: HashMap<String, Vec<Event>>,
    /// Replies keyed by their parent's id or address.
    replies: HashMap<String, Vec<Event>>,
    deferred: Vec<Deferred>,
    /// Ids already handed to the projection pipeline.
    projected: HashSet<String>,
}

impl FeedState {
    fn remember_parent(&mut self, event: &Event) {
        for key in event.id_and_address() {
            self.parents.insert(key, event.clone());
        }
    }

    fn take_released(&mut self, now: Instant) -> Vec<Event> {
        let (released, held): (Vec<Deferred>, Vec<Deferred>) = self
            .deferred
            .drain(..)
            .partition(|deferred| deferred.release_at <= now);
        self.deferred = held;
        released.into_iter().map(|deferred| deferred.event).collect()
    }
}

fn push_unique(index: &mut HashMap<String, Vec<Event>>, key: String, event: &Event) {
    let entries = index.entry(key).or_default();
    if !entries.iter().any(|existing| existing.id == event.id) {
        entries.push(event.clone());
    }
}

fn sort_desc(events: &mut [Event]) {
    events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

struct FeedInner {
    options: FeedOptions,
    config: FeedConfig,
    network: Arc<dyn Network>,
    derived: Arc<DerivedState>,
    pipeline: Arc<ProjectionPipeline>,
    cursor: MultiCursor,
    /// Feeds filtering by community (`#a`) mute strictly.
    strict: bool,
    /// Events older than `now - delta` count as ancient.
    delta: u64,
    state: Mutex<FeedState>,
    notes_tx: watch::Sender<Vec<DisplayEvent>>,
    ready: watch::Receiver<bool>,
    stopped: AtomicBool,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wait for one event, then gather everything else arriving within `window`.
async fn next_event_batch(
    subscription: &mut Subscription<SubscriptionMessage>,
    window: Duration,
) -> Option<Vec<Event>> {
    let first = loop {
        match subscription.recv().await? {
            SubscriptionMessage::Event(event) => break event,
            SubscriptionMessage::Eose(_) => {}
            SubscriptionMessage::Complete => return None,
        }
    };

    let mut batch = vec![first];
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => break,
            message = subscription.recv() => match message {
                Some(SubscriptionMessage::Event(event)) => batch.push(event),
                Some(SubscriptionMessage::Eose(_)) => {}
                Some(SubscriptionMessage::Complete) | None => break,
            },
        }
    }
    Some(batch)
}

async fn next_channel_batch(
    receiver: &mut mpsc::UnboundedReceiver<Event>,
    window: Duration,
) -> Option<Vec<Event>> {
    let mut batch = vec![receiver.recv().await?];
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => break,
            event = receiver.recv() => match event {
                Some(event) => batch.push(event),
                None => break,
            },
        }
    }
    Some(batch)
}

impl FeedInner {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn track(&self, handle: SubscriptionHandle) {
        if self.is_stopped() {
            handle.close();
            return;
        }
        let mut subscriptions = lock(&self.subscriptions);
        subscriptions.retain(|existing| !existing.is_closed());
        subscriptions.push(handle);
    }

    fn track_pages(&self, pages: &[PageHandle]) {
        for page in pages {
            self.track(page.subscription());
        }
    }

    fn track_task(&self, task: JoinHandle<()>) {
        if self.is_stopped() {
            task.abort();
            return;
        }
        let mut tasks = lock(&self.tasks);
        tasks.retain(|existing| !existing.is_finished());
        tasks.push(task);
    }

    /// Hand every event this feed has not projected yet to the pipeline,
    /// before any discard policy applies.
    fn project(&self, events: &[Event]) {
        if self.is_stopped() {
            return;
        }
        let fresh: Vec<Event> = {
            let mut state = lock(&self.state);
            events
                .iter()
                .filter(|event| state.projected.insert(event.id.clone()))
                .cloned()
                .collect()
        };
        if !fresh.is_empty() {
            self.pipeline.push_all(fresh);
        }
    }

    /// Whether `event` is tombstoned or muted for this feed.
    fn is_hidden(&self, event: &Event) -> bool {
        self.derived.is_deleted(event) || self.derived.is_event_muted(event, self.strict)
    }

    /// Drop deleted, muted, hidden-reply and anchor events.
    fn discard(&self, events: Vec<Event>) -> Vec<Event> {
        events
            .into_iter()
            .filter(|event| {
                if self.is_hidden(event) {
                    return false;
                }
                if self.options.should_hide_replies && parent_id(event).is_some() {
                    return false;
                }
                self.options
                    .anchor
                    .as_deref()
                    .is_none_or(|anchor| event.id_or_address() != anchor)
            })
            .collect()
    }

    /// Remember `events` as potential parents and fetch their missing parents.
    fn load_parents(self: &Arc<Self>, events: &[Event]) {
        if self.is_stopped() || events.is_empty() {
            return;
        }

        let missing: Vec<String> = {
            let mut state = lock(&self.state);
            for event in events {
                state.remember_parent(event);
            }

            let mut missing = Vec::new();
            for event in events {
                if is_repost_kind(event.kind) || self.derived.is_event_muted(event, false) {
                    continue;
                }
                if let Some(parent) = parent_id(event)
                    && !state.parents.contains_key(&parent)
                    && !missing.contains(&parent)
                {
                    missing.push(parent);
                }
            }
            missing
        };

        if missing.is_empty() {
            return;
        }

        debug!(count = missing.len(), "loading missing parents");
        let mut subscription = self.network.subscribe(
            SubscribeRequest::once(self.options.relays.clone(), id_filters(&missing))
                .with_timeout(self.config.page_timeout),
        );
        self.track(subscription.handle());

        let inner = Arc::clone(self);
        let window = self.config.cursor_batch;
        self.track_task(tokio::spawn(async move {
            while let Some(batch) = next_event_batch(&mut subscription, window).await {
                if inner.is_stopped() {
                    break;
                }
                inner.project(&batch);
                let parents = inner.discard(batch);
                let mut state = lock(&inner.state);
                for parent in &parents {
                    state.remember_parent(parent);
                }
            }
        }));
    }

    fn on_live_events(self: &Arc<Self>, events: Vec<Event>) {
        if self.is_stopped() {
            return;
        }
        let events = self.discard(events);
        if events.is_empty() {
            return;
        }

        if self.options.should_load_parents {
            self.load_parents(&events);
        }

        if self.options.should_buffer {
            lock(&self.state).buffer.extend(events);
        } else {
            self.add_to_feed(events, true);
        }
    }

    /// Hold back replies whose parent has not been seen yet.
    fn defer_orphans(self: &Arc<Self>, events: Vec<Event>) -> Vec<Event> {
        if !self.options.should_load_parents {
            return events;
        }

        let (orphans, ok): (Vec<Event>, Vec<Event>) = {
            let state = lock(&self.state);
            events.into_iter().partition(|event| {
                parent_id(event).is_some_and(|parent| !state.parents.contains_key(&parent))
            })
        };
        self.defer(orphans, self.config.orphan_delay);
        ok
    }

    /// Hold back events older than the filters are expected to reach.
    fn defer_ancient(self: &Arc<Self>, events: Vec<Event>) -> Vec<Event> {
        let cutoff = now().saturating_sub(self.delta);
        let (ancient, ok): (Vec<Event>, Vec<Event>) = events
            .into_iter()
            .partition(|event| event.created_at < cutoff);
        self.defer(ancient, self.config.ancient_delay);
        ok
    }

    fn defer(self: &Arc<Self>, events: Vec<Event>, delay: Duration) {
        if events.is_empty() {
            return;
        }

        debug!(count = events.len(), delay_ms = delay.as_millis(), "deferring events");
        let release_at = Instant::now() + delay;
        lock(&self.state)
            .deferred
            .extend(events.into_iter().map(|event| Deferred { event, release_at }));

        let inner = Arc::clone(self);
        self.track_task(tokio::spawn(async move {
            tokio::time::sleep_until(release_at).await;
            inner.release_deferred();
        }));
    }

    /// Merge every deferred event whose delay has elapsed.
    fn release_deferred(&self) {
        if self.is_stopped() {
            return;
        }
        let released = lock(&self.state).take_released(Instant::now());
        if !released.is_empty() {
            let released = self.discard(released);
            self.add_to_feed(released, false);
        }
    }

    fn add_to_feed(&self, events: Vec<Event>, prepend: bool) {
        if self.is_stopped() {
            return;
        }

        let mut state = lock(&self.state);
        let (chunk, replacements) = self.build_feed_chunk(&mut state, events);

        let mut notes = std::mem::take(&mut state.notes);
        for replacement in replacements {
            let address = replacement.id_or_address();
            if let Some(note) = notes.iter_mut().find(|note| {
                note.event.id_or_address() == address
                    && note.event.created_at < replacement.created_at
            }) {
                note.event = replacement;
            }
        }

        let combined = if prepend {
            chunk.into_iter().chain(notes).collect::<Vec<_>>()
        } else {
            notes.into_iter().chain(chunk).collect::<Vec<_>>()
        };

        let mut ids = HashSet::new();
        let max_depth = self.config.max_thread_depth;
        let notes: Vec<DisplayEvent> = combined
            .into_iter()
            .filter(|note| ids.insert(note.event.id.clone()))
            .map(|note| attach(note.event, &state, &mut HashSet::new(), max_depth))
            .collect();
        state.notes = notes;

        self.notes_tx.send_replace(state.notes.clone());
    }

    /// Turn a batch of candidates into new top-level entries, plus newer
    /// versions of replaceable events already shown.
    fn build_feed_chunk(
        &self,
        state: &mut FeedState,
        mut events: Vec<Event>,
    ) -> (Vec<DisplayEvent>, Vec<Event>) {
        let mut seen: HashSet<String> = state
            .notes
            .iter()
            .map(|note| note.event.id_or_address())
            .collect();
        let mut shown_versions: HashMap<String, u64> = state
            .notes
            .iter()
            .filter(|note| note.event.is_addressable())
            .map(|note| (note.event.id_or_address(), note.event.created_at))
            .collect();

        sort_desc(&mut events);

        let mut candidates = Vec::with_capacity(events.len());
        for mut event in events {
            if is_repost_kind(event.kind)
                && let Some(reposted) = unwrap_repost(&event)
            {
                if self.is_hidden(&reposted) {
                    continue;
                }
                push_unique(&mut state.reposts, reposted.id.clone(), &event);
                event = reposted;
            }

            if is_note_kind(event.kind)
                && let Some(parent) = parent_id(&event)
            {
                push_unique(&mut state.replies, parent, &event);
            }

            let mut visited = HashSet::from([event.id.clone()]);
            for _ in 0..self.config.max_thread_depth {
                let Some(parent) = parent_id(&event).and_then(|id| state.parents.get(&id)) else {
                    break;
                };
                if self.is_hidden(parent) || !visited.insert(parent.id.clone()) {
                    break;
                }
                event = parent.clone();
            }

            candidates.push(event);
        }

        let mut ids = HashSet::new();
        let mut chunk = Vec::new();
        let mut replacements = Vec::new();
        for event in candidates {
            if is_repost_kind(event.kind) || is_reaction_kind(event.kind) {
                continue;
            }
            if !ids.insert(event.id.clone()) {
                continue;
            }

            let key = event.id_or_address();
            if seen.contains(&key) {
                if event.is_addressable()
                    && shown_versions
                        .get(&key)
                        .is_some_and(|shown| *shown < event.created_at)
                {
                    shown_versions.insert(key, event.created_at);
                    replacements.push(event);
                }
                continue;
            }

            seen.insert(key);
            chunk.push(event);
        }

        sort_desc(&mut chunk);
        let chunk = chunk.into_iter().map(DisplayEvent::new).collect();
        (chunk, replacements)
    }
}

/// Build a display entry with replies and reposts looked up by id and
/// address. `visited` guards against reply cycles.
fn attach(
    event: Event,
    state: &FeedState,
    visited: &mut HashSet<String>,
    depth: usize,
) -> DisplayEvent {
    visited.insert(event.id.clone());
    let keys = event.id_and_address();

    let mut reposts: Vec<Event> = Vec::new();
    for repost in keys.iter().filter_map(|key| state.reposts.get(key)).flatten() {
        if !reposts.iter().any(|existing| existing.id == repost.id) {
            reposts.push(repost.clone());
        }
    }

    let mut replies = Vec::new();
    if depth > 0 {
        let children: Vec<Event> = keys
            .iter()
            .filter_map(|key| state.replies.get(key))
            .flatten()
            .filter(|reply| !visited.contains(&reply.id))
            .cloned()
            .collect();
        for child in children {
            if visited.contains(&child.id) {
                continue;
            }
            replies.push(attach(child, state, visited, depth - 1));
        }
    }

    DisplayEvent {
        event,
        replies,
        reposts,
    }
}

/// A live, paginated feed.
#[derive(Clone)]
pub struct FeedLoader {
    inner: Arc<FeedInner>,
}

impl FeedLoader {
    /// Start a feed: open the live tail when requested and the filters are
    /// open-ended, and request the first page from every relay.
    ///
    /// Every event the feed receives is pushed to `pipeline`; the feed reads
    /// tombstones and mutes from the pipeline's derived state.
    pub fn new(
        options: FeedOptions,
        network: Arc<dyn Network>,
        pipeline: Arc<ProjectionPipeline>,
        config: FeedConfig,
    ) -> Self {
        let mut options = options;
        options.relays = normalize_relay_urls(&options.relays);
        let start = now();

        let strict = options
            .filters
            .iter()
            .any(|filter| filter.tag_constraint("a").is_some());
        let delta = guess_filter_delta(&options.filters, start);

        let (sink, mut cursor_events) = mpsc::unbounded_channel();
        let cursor = MultiCursor::new(
            &options.relays,
            &options.filters,
            Arc::clone(&network),
            &config,
            Some(sink),
        );
        let derived = Arc::clone(pipeline.derived());

        let (notes_tx, _) = watch::channel(Vec::new());
        let (ready_tx, ready) = watch::channel(false);

        let inner = Arc::new(FeedInner {
            options,
            config,
            network,
            derived,
            pipeline,
            cursor,
            strict,
            delta,
            state: Mutex::new(FeedState::default()),
            notes_tx,
            ready,
            stopped: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let listen = inner.options.should_listen
            && !inner.options.filters.iter().any(|filter| filter.until.is_some());
        if listen {
            let filters = inner
                .options
                .filters
                .iter()
                .map(|filter| filter.clone().since(start))
                .collect();
            let mut live = inner
                .network
                .subscribe(SubscribeRequest::new(inner.options.relays.clone(), filters));
            inner.track(live.handle());

            let feed = Arc::clone(&inner);
            let window = inner.config.live_batch;
            inner.track_task(tokio::spawn(async move {
                while let Some(batch) = next_event_batch(&mut live, window).await {
                    feed.project(&batch);
                    feed.on_live_events(batch);
                }
            }));
        }

        let feed = Arc::clone(&inner);
        let window = inner.config.cursor_batch;
        inner.track_task(tokio::spawn(async move {
            while let Some(batch) = next_channel_batch(&mut cursor_events, window).await {
                if feed.is_stopped() {
                    break;
                }
                feed.project(&batch);
                if feed.options.should_load_parents {
                    let events = feed.discard(batch);
                    feed.load_parents(&events);
                }
            }
        }));

        let pages = inner.cursor.load(inner.config.initial_page);
        inner.track_pages(&pages);
        Self::spawn_barrier(&inner, pages, ready_tx);

        info!(
            relays = inner.options.relays.len(),
            filters = inner.options.filters.len(),
            listen,
            "feed started"
        );

        Self { inner }
    }

    /// Resolve readiness once enough initial pages completed or the ready
    /// timeout elapsed.
    fn spawn_barrier(
        inner: &Arc<FeedInner>,
        pages: Vec<PageHandle>,
        ready_tx: watch::Sender<bool>,
    ) {
        let needed = (pages.len() as f64 * inner.config.ready_fraction).ceil() as usize;
        if needed == 0 {
            ready_tx.send_replace(true);
            return;
        }

        let timeout = inner.config.ready_timeout;
        inner.track_task(tokio::spawn(async move {
            let mut pending: FuturesUnordered<_> = pages
                .into_iter()
                .map(|page| async move { page.completed().await })
                .collect();

            let enough = async {
                let mut completed = 0;
                while pending.next().await.is_some() {
                    completed += 1;
                    if completed >= needed {
                        break;
                    }
                }
            };
            if tokio::time::timeout(timeout, enough).await.is_err() {
                debug!(needed, "feed readiness timed out");
            }
            ready_tx.send_replace(true);
        }));
    }

    pub fn options(&self) -> &FeedOptions {
        &self.inner.options
    }

    /// Whether the readiness barrier has resolved.
    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Wait for the readiness barrier.
    pub async fn ready(&self) {
        let mut ready = self.inner.ready.clone();
        let _ = ready.wait_for(|ready| *ready).await;
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    /// Load up to `n` more events from the cursors and merge them.
    pub async fn load(&self, n: usize) {
        self.ready().await;

        let inner = &self.inner;
        if inner.is_stopped() || inner.cursor.done() {
            return;
        }

        info!(n, relays = inner.options.relays.len(), "loading more events");

        let (pages, events) = inner.cursor.take(n);
        inner.track_pages(&pages);

        let mut events = inner.discard(events);
        if inner.options.should_defer {
            events = inner.defer_orphans(events);
            events = inner.defer_ancient(events);
        }

        let released = lock(&inner.state).take_released(Instant::now());
        let mut merged = inner.discard(released);
        merged.extend(events);
        inner.add_to_feed(merged, false);
    }

    /// Merge buffered live events into the feed.
    pub fn load_buffer(&self) {
        let buffer = std::mem::take(&mut lock(&self.inner.state).buffer);
        self.inner.add_to_feed(buffer, true);
    }

    /// Live events waiting for [`FeedLoader::load_buffer`].
    pub fn buffered(&self) -> Vec<Event> {
        lock(&self.inner.state).buffer.clone()
    }

    /// Merge `events` into the feed as if they arrived from a page.
    pub fn add_to_feed(&self, events: Vec<Event>, prepend: bool) {
        let events = self.inner.discard(events);
        self.inner.add_to_feed(events, prepend);
    }

    /// Snapshot of the materialised feed, newest first.
    pub fn notes(&self) -> Vec<DisplayEvent> {
        lock(&self.inner.state).notes.clone()
    }

    /// Receive the materialised feed after every merge.
    pub fn subscribe(&self) -> watch::Receiver<Vec<DisplayEvent>> {
        self.inner.notes_tx.subscribe()
    }

    /// Orphan and ancient events waiting for their delay.
    pub fn deferred_count(&self) -> usize {
        lock(&self.inner.state).deferred.len()
    }

    /// Whether every cursor is exhausted and nothing is buffered.
    pub fn done(&self) -> bool {
        self.inner.cursor.done()
    }

    /// Close every subscription owned by the feed. Later deliveries are
    /// ignored and the feed never changes again.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let subscriptions = std::mem::take(&mut *lock(&self.inner.subscriptions));
        for subscription in &subscriptions {
            subscription.close();
        }
        let tasks = std::mem::take(&mut *lock(&self.inner.tasks));
        for task in &tasks {
            task.abort();
        }
        info!(subscriptions = subscriptions.len(), "feed stopped");
    }
}
