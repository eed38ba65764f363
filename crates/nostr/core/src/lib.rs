//! Nostr protocol primitives: events, filters, addresses and the handful of
//! NIPs the sync engine needs to interpret threads, reposts, deletions and
//! gift wraps.

mod error;
pub mod filter;
pub mod kinds;
pub mod nip01;
pub mod nip09;
pub mod nip10;
pub mod nip18;
pub mod nip59;
pub mod tag_parsing;

pub use error::{Error, Result};
pub use filter::{Filter, guess_filter_delta, id_filters};
pub use nip01::{Address, Event, EventTemplate, KindClassification};
pub use nip10::Ancestors;
