//! Backward pagination over many relays.
//!
//! Each [`Cursor`] walks one relay's history with a `[since, until]` window
//! moving back from now. A page that returns events lowers `until` below
//! the oldest event received; an empty page moves the whole window down and
//! widens it tenfold, so sparse relays are crossed in a few requests. A
//! cursor is done once a complete page reached its floor.

use crate::clock::now;
use crate::config::FeedConfig;
use crate::network::{Network, SubscribeRequest};
use crate::subscription::{SubscriptionHandle, SubscriptionMessage};
use nostr::{Event, Filter, guess_filter_delta};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Snapshot of a cursor's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorWindow {
    pub since: u64,
    pub until: u64,
    pub delta: u64,
    pub floor: u64,
}

struct Buffered {
    event: Event,
    /// Global receipt order, used to break `created_at` ties.
    seq: u64,
}

struct CursorState {
    window: CursorWindow,
    /// Newest first; equal timestamps keep receipt order.
    buffer: VecDeque<Buffered>,
    loading: bool,
    done: bool,
}

impl CursorState {
    fn receive(&mut self, event: Event, seq: u64) {
        self.window.until = self.window.until.min(event.created_at.saturating_sub(1));
        if self.buffer.iter().any(|buffered| buffered.event.id == event.id) {
            return;
        }
        let index = self
            .buffer
            .partition_point(|buffered| buffered.event.created_at >= event.created_at);
        self.buffer.insert(index, Buffered { event, seq });
    }

    fn complete_page(&mut self, requested_since: u64, received: usize, limit: usize) {
        self.loading = false;
        let window = &mut self.window;

        if received == 0 {
            window.until = requested_since;
            window.delta = window.delta.saturating_mul(10);
        }
        if requested_since <= window.floor && received < limit {
            self.done = true;
        }
        window.since = window.until.saturating_sub(window.delta).max(window.floor);
    }
}

/// Handle on one in-flight page request.
#[derive(Debug, Clone)]
pub struct PageHandle {
    relay: String,
    subscription: SubscriptionHandle,
    completed: watch::Receiver<bool>,
}

impl PageHandle {
    pub fn relay(&self) -> &str {
        &self.relay
    }

    pub fn subscription(&self) -> SubscriptionHandle {
        self.subscription.clone()
    }

    /// Whether the page reached EOSE or was closed.
    pub fn is_complete(&self) -> bool {
        *self.completed.borrow()
    }

    /// Resolves when the page finished, failed or was closed.
    pub async fn completed(&self) {
        let mut completed = self.completed.clone();
        let _ = completed.wait_for(|completed| *completed).await;
    }

    pub fn close(&self) {
        self.subscription.close();
    }
}

/// Pagination state for a single relay.
pub struct Cursor {
    relay: String,
    filters: Vec<Filter>,
    state: Arc<Mutex<CursorState>>,
    page_timeout: Duration,
    receipts: Arc<AtomicU64>,
    sink: Option<mpsc::UnboundedSender<Event>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lowest timestamp the filters can match: the smallest `since` when every
/// filter has one, `default` otherwise.
fn filter_floor(filters: &[Filter], default: u64) -> u64 {
    filters
        .iter()
        .map(|filter| filter.since)
        .collect::<Option<Vec<u64>>>()
        .and_then(|sinces| sinces.into_iter().min())
        .unwrap_or(default)
}

impl Cursor {
    /// A cursor paging `filters` backwards from now on one relay.
    pub fn new(relay: impl Into<String>, filters: Vec<Filter>, config: &FeedConfig) -> Self {
        let now = now();
        let floor = filter_floor(&filters, config.floor);
        let until = filters
            .iter()
            .map(|filter| filter.until)
            .collect::<Option<Vec<u64>>>()
            .and_then(|untils| untils.into_iter().max())
            .unwrap_or(now);
        let delta = guess_filter_delta(&filters, now).max(1);

        Self {
            relay: relay.into(),
            filters,
            state: Arc::new(Mutex::new(CursorState {
                window: CursorWindow {
                    since: until.saturating_sub(delta).max(floor),
                    until,
                    delta,
                    floor,
                },
                buffer: VecDeque::new(),
                loading: false,
                done: false,
            })),
            page_timeout: config.page_timeout,
            receipts: Arc::new(AtomicU64::new(0)),
            sink: None,
        }
    }

    fn with_shared(
        mut self,
        receipts: Arc<AtomicU64>,
        sink: Option<mpsc::UnboundedSender<Event>>,
    ) -> Self {
        self.receipts = receipts;
        self.sink = sink;
        self
    }

    pub fn relay(&self) -> &str {
        &self.relay
    }

    /// The window the next page will request.
    pub fn window(&self) -> CursorWindow {
        lock(&self.state).window
    }

    /// Whether the window reached the floor with a short page.
    pub fn is_done(&self) -> bool {
        lock(&self.state).done
    }

    pub fn is_loading(&self) -> bool {
        lock(&self.state).loading
    }

    pub fn buffered(&self) -> usize {
        lock(&self.state).buffer.len()
    }

    fn peek(&self) -> Option<(u64, u64)> {
        lock(&self.state)
            .buffer
            .front()
            .map(|buffered| (buffered.event.created_at, buffered.seq))
    }

    fn pop(&self) -> Option<Event> {
        lock(&self.state)
            .buffer
            .pop_front()
            .map(|buffered| buffered.event)
    }

    fn remove(&self, id: &str) -> Option<Event> {
        let mut state = lock(&self.state);
        let index = state
            .buffer
            .iter()
            .position(|buffered| buffered.event.id == id)?;
        state.buffer.remove(index).map(|buffered| buffered.event)
    }

    /// Request the next page unless one is in flight, the cursor is done or
    /// `n` events are already buffered.
    pub fn load(&self, n: usize, network: &dyn Network) -> Option<PageHandle> {
        let (window, limit) = {
            let mut state = lock(&self.state);
            if state.loading || state.done {
                return None;
            }
            let limit = n.saturating_sub(state.buffer.len());
            if limit == 0 {
                return None;
            }
            state.loading = true;
            (state.window, limit)
        };

        let filters: Vec<Filter> = self
            .filters
            .iter()
            .map(|filter| {
                let mut page = filter.clone();
                page.since = Some(
                    filter
                        .since
                        .map_or(window.since, |since| since.max(window.since)),
                );
                page.until = Some(
                    filter
                        .until
                        .map_or(window.until, |until| until.min(window.until)),
                );
                page.limit = Some(limit);
                page
            })
            .collect();

        debug!(
            relay = %self.relay,
            since = window.since,
            until = window.until,
            limit,
            "loading cursor page"
        );

        let mut subscription = network.subscribe(
            SubscribeRequest::once(vec![self.relay.clone()], filters)
                .with_timeout(self.page_timeout),
        );
        let (completed_tx, completed) = watch::channel(false);
        let handle = PageHandle {
            relay: self.relay.clone(),
            subscription: subscription.handle(),
            completed,
        };

        let state = Arc::clone(&self.state);
        let receipts = Arc::clone(&self.receipts);
        let sink = self.sink.clone();
        let relay = self.relay.clone();
        tokio::spawn(async move {
            let mut received = 0;
            let mut finished = false;

            while let Some(message) = subscription.recv().await {
                match message {
                    SubscriptionMessage::Event(event) => {
                        received += 1;
                        if let Some(sink) = &sink {
                            let _ = sink.send(event.clone());
                        }
                        let seq = receipts.fetch_add(1, Ordering::Relaxed);
                        lock(&state).receive(event, seq);
                    }
                    SubscriptionMessage::Eose(_) => {}
                    SubscriptionMessage::Complete => {
                        finished = true;
                        break;
                    }
                }
            }
            subscription.close();

            {
                let mut state = lock(&state);
                if finished {
                    state.complete_page(window.since, received, limit);
                } else {
                    state.loading = false;
                }
                debug!(
                    relay = %relay,
                    received,
                    since = state.window.since,
                    until = state.window.until,
                    done = state.done,
                    "cursor page complete"
                );
            }
            let _ = completed_tx.send(true);
        });

        Some(handle)
    }
}

/// Cursors over every relay of a feed, merged newest first.
pub struct MultiCursor {
    cursors: Vec<Cursor>,
    network: Arc<dyn Network>,
    emitted: Mutex<HashSet<String>>,
    buffer_factor: usize,
}

impl MultiCursor {
    /// `sink` receives every event as soon as a page delivers it.
    pub fn new(
        relays: &[String],
        filters: &[Filter],
        network: Arc<dyn Network>,
        config: &FeedConfig,
        sink: Option<mpsc::UnboundedSender<Event>>,
    ) -> Self {
        let receipts = Arc::new(AtomicU64::new(0));
        let cursors = relays
            .iter()
            .map(|relay| {
                Cursor::new(relay.clone(), filters.to_vec(), config)
                    .with_shared(Arc::clone(&receipts), sink.clone())
            })
            .collect();

        Self {
            cursors,
            network,
            emitted: Mutex::new(HashSet::new()),
            buffer_factor: config.buffer_factor.max(1),
        }
    }

    pub fn cursors(&self) -> &[Cursor] {
        &self.cursors
    }

    /// Ask every cursor for up to `n` events; returns the pages issued.
    pub fn load(&self, n: usize) -> Vec<PageHandle> {
        self.cursors
            .iter()
            .filter_map(|cursor| cursor.load(n, self.network.as_ref()))
            .collect()
    }

    /// Pop up to `n` buffered events newest first, then preload
    /// `n * buffer_factor` more. Duplicates across relays are emitted once,
    /// with their `seen_on` merged.
    pub fn take(&self, n: usize) -> (Vec<PageHandle>, Vec<Event>) {
        let mut events = Vec::new();

        {
            let mut emitted = lock(&self.emitted);
            while events.len() < n {
                let best = self
                    .cursors
                    .iter()
                    .enumerate()
                    .filter_map(|(index, cursor)| {
                        cursor.peek().map(|(created_at, seq)| (index, created_at, seq))
                    })
                    .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.2.cmp(&a.2)));

                let Some(mut event) = best
                    .and_then(|(index, ..)| self.cursors.get(index))
                    .and_then(Cursor::pop)
                else {
                    break;
                };

                for cursor in &self.cursors {
                    if let Some(duplicate) = cursor.remove(&event.id) {
                        event.seen_on.extend(duplicate.seen_on);
                    }
                }

                if emitted.insert(event.id.clone()) {
                    events.push(event);
                }
            }
        }

        let pages = self.load(n.saturating_mul(self.buffer_factor));
        (pages, events)
    }

    /// Whether every cursor is exhausted and nothing is left buffered.
    pub fn done(&self) -> bool {
        self.cursors
            .iter()
            .all(|cursor| cursor.is_done() && cursor.buffered() == 0)
    }
}
