//! The service object tying collaborators, caches and components together.

use crate::config::SyncConfig;
use crate::derived::DerivedState;
use crate::error::Result;
use crate::feed::{FeedLoader, FeedOptions};
use crate::handlers::register_builtin_handlers;
use crate::hints::RelayHints;
use crate::mutes::MuteList;
use crate::network::{Network, Signer, Unwrapper};
use crate::projections::ProjectionPipeline;
use crate::publish::{Outbox, Publisher};
use crate::pubkey_loader::{PubkeyLoadOptions, PubkeyLoadReport, PubkeyLoader};
use nostr::Event;
use nostr::kinds::USER_KINDS;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::info;

/// Owns the process-wide state of a client: derived stores, the projection
/// pipeline, the pubkey loader's attempt cache and the publishing outbox.
pub struct Engine {
    config: SyncConfig,
    network: Arc<dyn Network>,
    derived: Arc<DerivedState>,
    pipeline: Arc<ProjectionPipeline>,
    pubkeys: PubkeyLoader,
    outbox: Outbox,
    projection_task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Build an engine over `network`, with the built-in handlers registered.
    /// Call [`Engine::start`] to drain projections in the background.
    pub fn new(config: SyncConfig, network: Arc<dyn Network>, hints: Arc<dyn RelayHints>) -> Self {
        let derived = Arc::new(DerivedState::new(config.projections.user_events_limit));
        let pipeline = Arc::new(ProjectionPipeline::new(
            Arc::clone(&derived),
            config.projections.batch_size,
        ));
        register_builtin_handlers(&pipeline);

        let pubkeys = PubkeyLoader::new(
            Arc::clone(&network),
            Arc::clone(&hints),
            Arc::clone(&pipeline),
            config.pubkeys.clone(),
        );
        let outbox = Outbox::new(
            Arc::clone(&network),
            Arc::clone(&pipeline),
            hints,
            config.publish.clone(),
        );

        Self {
            config,
            network,
            derived,
            pipeline,
            pubkeys,
            outbox,
            projection_task: Mutex::new(None),
        }
    }

    /// Signer used by `publish_template` and `create_and_publish`.
    #[must_use]
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.outbox.set_signer(Some(signer));
        self
    }

    /// Drain the projection pipeline in the background. Calling it again
    /// is a no-op.
    pub fn start(&self) {
        let mut task = self
            .projection_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if task.is_none() {
            *task = Some(self.pipeline.spawn());
            info!("projection pipeline started");
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn network(&self) -> &Arc<dyn Network> {
        &self.network
    }

    pub fn derived(&self) -> &Arc<DerivedState> {
        &self.derived
    }

    pub fn pipeline(&self) -> &Arc<ProjectionPipeline> {
        &self.pipeline
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Register a local session; `unwrapper` reveals gift wraps sent to it.
    pub fn add_session(&self, pubkey: impl Into<String>, unwrapper: Option<Arc<dyn Unwrapper>>) {
        self.derived.add_session(pubkey, unwrapper);
    }

    /// Replace the active mute list.
    pub fn set_mutes(&self, mutes: MuteList) {
        self.derived.set_mutes(mutes);
    }

    /// Feed events received outside this engine's feeds and loaders into
    /// the projections.
    pub fn ingest(&self, events: impl IntoIterator<Item = Event>) {
        self.pipeline.push_all(events);
    }

    /// Process every queued event now.
    pub async fn sync_projections(&self) -> usize {
        self.pipeline.drain().await
    }

    /// Start a feed whose events are projected by this engine.
    pub fn feed(&self, options: FeedOptions) -> FeedLoader {
        FeedLoader::new(
            options,
            Arc::clone(&self.network),
            Arc::clone(&self.pipeline),
            self.config.feed.clone(),
        )
    }

    /// A publisher for a signed event, wired to this engine's projections.
    pub fn publisher(&self, event: Event) -> Result<Publisher> {
        self.outbox.publisher(event)
    }

    /// Load profile data for `pubkeys`; see [`PubkeyLoader::load`].
    pub async fn load_pubkeys<I, S>(
        &self,
        pubkeys: I,
        options: PubkeyLoadOptions,
    ) -> PubkeyLoadReport
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pubkeys.load(pubkeys, options).await
    }

    /// Load everything a local session needs about its own user: profile,
    /// lists and application data. Always reloads.
    pub async fn load_session(&self, pubkey: &str) -> PubkeyLoadReport {
        let options = PubkeyLoadOptions {
            force: true,
            kinds: USER_KINDS.to_vec(),
            ..PubkeyLoadOptions::default()
        };
        self.pubkeys.load([pubkey], options).await
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(task) = self
            .projection_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}
