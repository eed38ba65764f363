//! NIP-59: gift wrap envelopes.
//!
//! Decryption lives outside this crate; only the envelope shape is modelled.

use crate::nip01::Event;
use crate::tag_parsing::find_tag_value;

pub const GIFT_WRAP: u16 = 1059;
/// Wrap kind used before NIP-59 settled on 1059.
pub const LEGACY_GIFT_WRAP: u16 = 1060;
pub const SEAL: u16 = 13;

pub fn is_gift_wrap(event: &Event) -> bool {
    matches!(event.kind, GIFT_WRAP | LEGACY_GIFT_WRAP)
}

/// Pubkey the wrap is addressed to.
pub fn recipient(event: &Event) -> Option<&str> {
    find_tag_value(&event.tags, "p")
}
