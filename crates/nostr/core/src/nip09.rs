//! NIP-09: event deletion requests.

use crate::nip01::Event;
use crate::tag_parsing::collect_tag_values_any;

pub const DELETION: u16 = 5;

/// Ids and addresses a deletion request refers to.
pub fn deletion_targets(event: &Event) -> Vec<String> {
    if event.kind != DELETION {
        return Vec::new();
    }
    collect_tag_values_any(&event.tags, &["e", "a"])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn collects_ids_and_addresses() {
        let event = Event {
            id: "del".to_string(),
            pubkey: "pk".to_string(),
            created_at: 5,
            kind: DELETION,
            tags: vec![
                vec!["e".to_string(), "note1".to_string()],
                vec!["a".to_string(), "30023:pk:slug".to_string()],
                vec!["k".to_string(), "1".to_string()],
            ],
            content: String::new(),
            sig: String::new(),
            seen_on: BTreeSet::new(),
            wrapper: None,
        };

        assert_eq!(
            deletion_targets(&event),
            vec!["note1".to_string(), "30023:pk:slug".to_string()]
        );

        let note = Event { kind: 1, ..event };
        assert!(deletion_targets(&note).is_empty());
    }
}
