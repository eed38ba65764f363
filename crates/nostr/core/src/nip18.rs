//! NIP-18: reposts.

use crate::error::{Error, Result};
use crate::nip01::Event;

pub const REPOST: u16 = 6;
pub const GENERIC_REPOST: u16 = 16;

/// Parse the event embedded in a repost's content.
pub fn parse_repost(repost: &Event) -> Result<Event> {
    if !matches!(repost.kind, REPOST | GENERIC_REPOST) {
        return Err(Error::NotARepost(repost.kind));
    }
    if repost.content.trim().is_empty() {
        return Err(Error::EmptyRepost);
    }

    let mut reposted: Event = serde_json::from_str(&repost.content)?;
    if reposted.id.is_empty() || reposted.pubkey.is_empty() {
        return Err(Error::EmptyRepost);
    }
    reposted.seen_on.clone_from(&repost.seen_on);
    Ok(reposted)
}

/// The reposted event, carrying the repost's relay origins, or `None` when
/// the content does not hold one.
pub fn unwrap_repost(repost: &Event) -> Option<Event> {
    parse_repost(repost).ok()
}
