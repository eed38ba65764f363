//! Kind groupings used by feeds and loaders.

pub const METADATA: u16 = 0;
pub const TEXT_NOTE: u16 = 1;
pub const CONTACTS: u16 = 3;
pub const REACTION: u16 = 7;
pub const READ_RECEIPT: u16 = 15;
pub const LABEL: u16 = 1985;
pub const ZAP_RECEIPT: u16 = 9735;
pub const MUTE_LIST: u16 = 10_000;
pub const RELAY_LIST: u16 = 10_002;
pub const APP_DATA: u16 = 30_078;

/// Kinds rendered as standalone notes in a feed.
pub const NOTE_KINDS: &[u16] = &[1, 30_023, 9802, 1808, 32_123, 31_923, 30_402];

/// Kinds describing a person: profile, contacts, mutes and relay lists.
pub const PERSON_KINDS: &[u16] = &[METADATA, 2, CONTACTS, MUTE_LIST, RELAY_LIST];

/// Person kinds plus the lists and application data a logged-in user keeps.
pub const USER_KINDS: &[u16] = &[
    METADATA, 2, CONTACTS, MUTE_LIST, RELAY_LIST, 30_001, 30_003, APP_DATA, 10_004,
];

pub const REACTION_KINDS: &[u16] = &[REACTION, ZAP_RECEIPT];

pub const REPOST_KINDS: &[u16] = &[crate::nip18::REPOST, crate::nip18::GENERIC_REPOST];

/// Application data keys (`d` tags of kind 30078) this client reads.
pub const USER_SETTINGS_KEY: &str = "nostr-engine/User/settings/v1";
pub const NIP24_LAST_CHECKED_KEY: &str = "nostr-engine/Nip24/last_checked/v1";
pub const APP_DATA_KEYS: &[&str] = &[USER_SETTINGS_KEY, NIP24_LAST_CHECKED_KEY];

pub fn is_note_kind(kind: u16) -> bool {
    NOTE_KINDS.contains(&kind)
}

pub fn is_reaction_kind(kind: u16) -> bool {
    REACTION_KINDS.contains(&kind)
}

pub fn is_repost_kind(kind: u16) -> bool {
    REPOST_KINDS.contains(&kind)
}
