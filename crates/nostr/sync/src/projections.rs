//! Ordered, batched fan-out of observed events to state handlers.
//!
//! Events pushed into the pipeline are queued and dispatched in push order,
//! in batches of at most `batch_size`. Global handlers see events authored
//! by a local session that were not revealed from a gift wrap; kind handlers
//! see only their kind. Handlers may push follow-up events through the
//! [`ProjectionQueue`]; draining continues until the queue is empty.

use crate::derived::DerivedState;
use crate::error::Result;
use async_trait::async_trait;
use nostr::Event;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A handler over an ordered batch of events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, events: &[Event], queue: &ProjectionQueue) -> Result<()>;
}

/// Shared work queue of the pipeline.
#[derive(Clone, Default)]
pub struct ProjectionQueue {
    events: Arc<Mutex<VecDeque<Event>>>,
    notify: Arc<Notify>,
}

impl ProjectionQueue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<Event>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, event: Event) {
        self.lock().push_back(event);
        self.notify.notify_one();
    }

    pub fn extend(&self, events: impl IntoIterator<Item = Event>) {
        self.lock().extend(events);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn take(&self, limit: usize) -> Vec<Event> {
        let mut events = self.lock();
        let count = limit.min(events.len());
        events.drain(..count).collect()
    }
}

/// Ordered event queue dispatched to projection handlers in batches.
///
/// Global handlers see events authored by local sessions; kind handlers
/// see every event of their kind. Handlers may push follow-up events onto
/// the queue and they are processed in the same drain.
pub struct ProjectionPipeline {
    queue: ProjectionQueue,
    derived: Arc<DerivedState>,
    global_handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    kind_handlers: RwLock<HashMap<u16, Vec<Arc<dyn EventHandler>>>>,
    batch_size: usize,
    draining: tokio::sync::Mutex<()>,
}

impl ProjectionPipeline {
    /// A pipeline without handlers. Batches hold at most `batch_size` events.
    pub fn new(derived: Arc<DerivedState>, batch_size: usize) -> Self {
        Self {
            queue: ProjectionQueue::default(),
            derived,
            global_handlers: RwLock::new(Vec::new()),
            kind_handlers: RwLock::new(HashMap::new()),
            batch_size: batch_size.max(1),
            draining: tokio::sync::Mutex::new(()),
        }
    }

    pub fn queue(&self) -> &ProjectionQueue {
        &self.queue
    }

    pub fn derived(&self) -> &Arc<DerivedState> {
        &self.derived
    }

    pub fn push(&self, event: Event) {
        self.queue.push(event);
    }

    /// Queue events in order.
    pub fn push_all(&self, events: impl IntoIterator<Item = Event>) {
        self.queue.extend(events);
    }

    /// Register a handler for events authored by local sessions.
    pub fn add_global_handler(&self, handler: Arc<dyn EventHandler>) {
        self.global_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Register a handler for one kind.
    pub fn add_handler(&self, kind: u16, handler: Arc<dyn EventHandler>) {
        self.kind_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(handler);
    }

    /// Process queued events, including any pushed by handlers meanwhile,
    /// until the queue is empty. Returns the number of events dispatched.
    pub async fn drain(&self) -> usize {
        let _draining = self.draining.lock().await;
        let mut processed = 0;

        loop {
            let batch = self.queue.take(self.batch_size);
            if batch.is_empty() {
                break;
            }
            processed += batch.len();
            self.dispatch(&batch).await;
        }

        if processed > 0 {
            debug!(processed, "projection queue drained");
        }
        processed
    }

    /// Drain in the background whenever events are pushed.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                pipeline.queue.notify.notified().await;
                pipeline.drain().await;
            }
        })
    }

    async fn dispatch(&self, batch: &[Event]) {
        let user_events: Vec<Event> = batch
            .iter()
            .filter(|event| event.wrapper.is_none() && self.derived.has_session(&event.pubkey))
            .cloned()
            .collect();

        if !user_events.is_empty() {
            let handlers = self
                .global_handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for handler in handlers {
                self.run(&handler, &user_events).await;
            }
        }

        let mut kinds: Vec<u16> = Vec::new();
        for event in batch {
            if !kinds.contains(&event.kind) {
                kinds.push(event.kind);
            }
        }

        for kind in kinds {
            let handlers = self
                .kind_handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&kind)
                .cloned()
                .unwrap_or_default();
            if handlers.is_empty() {
                continue;
            }

            let events: Vec<Event> = batch
                .iter()
                .filter(|event| event.kind == kind)
                .cloned()
                .collect();
            for handler in handlers {
                self.run(&handler, &events).await;
            }
        }
    }

    async fn run(&self, handler: &Arc<dyn EventHandler>, events: &[Event]) {
        if let Err(error) = handler.handle(events, &self.queue).await {
            warn!(handler = handler.name(), %error, "projection handler failed");
        }
    }
}
