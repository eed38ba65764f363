//! Client-side synchronization for Nostr.
//!
//! This crate merges partial, out-of-order views from many relays into one
//! local view and publishes to many relays at once:
//! - paginated, threaded feeds over many relays (`FeedLoader`)
//! - multi-relay publishing with per-relay acknowledgement tracking
//! - ordered projection of observed events into derived state
//! - stale-aware bulk loading of profile events
//!
//! Relay transport, signing and gift-wrap decryption are collaborators behind
//! the traits in [`network`]. [`MemoryNetwork`] implements the transport in
//! memory.

mod clock;
pub mod config;
pub mod cursor;
pub mod derived;
pub mod engine;
pub mod error;
pub mod feed;
pub mod handlers;
pub mod hints;
pub mod memory;
pub mod mutes;
pub mod network;
pub mod projections;
pub mod publish;
pub mod pubkey_loader;
pub mod subscription;

pub use config::{
    ConfigError, FeedConfig, ProjectionConfig, PubkeyLoaderConfig, PublishConfig, SyncConfig,
};
pub use cursor::{Cursor, CursorWindow, MultiCursor, PageHandle};
pub use derived::{DerivedState, Topic, Watermarks};
pub use engine::Engine;
pub use error::{Result, SyncError};
pub use feed::{DisplayEvent, FeedLoader, FeedOptions};
pub use hints::{RelayHints, StaticRelayHints, merge_hints, normalize_relay_url};
pub use memory::{AckPolicy, MemoryNetwork, MemoryRelay};
pub use mutes::MuteList;
pub use network::{Network, PublishVerb, Signer, SubscribeRequest, Unwrapper};
pub use projections::{EventHandler, ProjectionPipeline, ProjectionQueue};
pub use publish::{
    Outbox, PublishHandle, PublishOptions, PublishProgress, Publisher, hashtags, uniq_tags,
};
pub use pubkey_loader::{PubkeyLoadOptions, PubkeyLoadReport, PubkeyLoader};
pub use subscription::{PublishMessage, Subscription, SubscriptionHandle, SubscriptionMessage};
