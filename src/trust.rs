//! Policy for room metadata changes proposed by the backend.

use crate::{room_cache::RoomMetadata, transport::StateKind};

pub const MAX_NAME_CHARS: usize = 100;
pub const MAX_TOPIC_CHARS: usize = 1000;
pub const MAX_AVATAR_CHARS: usize = 100;
pub const MEDIA_SCHEME: &str = "mxc://";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustDecision {
    /// Nothing differs from the cached values.
    Unchanged,
    /// The whole proposal is refused; nothing is applied.
    Rejected,
    /// Slots to publish, in name/topic/avatar order.
    Apply(Vec<(StateKind, String)>),
}

/// Decide what to do with `proposed` given the cached `current` values.
///
/// Any single offending slot rejects the whole proposal, including
/// changes to the other slots that would have been fine on their own.
pub fn evaluate(current: &RoomMetadata, proposed: &RoomMetadata, untrusted: bool) -> TrustDecision {
    let changed: Vec<(StateKind, String)> = StateKind::ALL
        .into_iter()
        .filter(|kind| proposed.get(*kind) != current.get(*kind))
        .map(|kind| (kind, proposed.get(kind).to_string()))
        .collect();

    if changed.is_empty() {
        return TrustDecision::Unchanged;
    }

    let offending = changed.iter().any(|(kind, value)| violates_limits(*kind, value));
    if untrusted || offending {
        return TrustDecision::Rejected;
    }
    TrustDecision::Apply(changed)
}

/// Only called for slots that differ from the cached value.
fn violates_limits(kind: StateKind, value: &str) -> bool {
    let chars = value.chars().count();
    match kind {
        StateKind::Name => chars > MAX_NAME_CHARS,
        StateKind::Topic => chars > MAX_TOPIC_CHARS,
        StateKind::Avatar => {
            !value.is_empty() && (!value.starts_with(MEDIA_SCHEME) || chars > MAX_AVATAR_CHARS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{evaluate, TrustDecision};
    use crate::{room_cache::RoomMetadata, transport::StateKind};

    fn meta(name: &str, topic: &str, avatar: &str) -> RoomMetadata {
        RoomMetadata {
            name: name.into(),
            topic: topic.into(),
            avatar: avatar.into(),
        }
    }

    #[test]
    fn identical_values_are_unchanged() {
        let current = meta("n", "t", "mxc://x/a");
        assert_eq!(evaluate(&current, &current, true), TrustDecision::Unchanged);
    }

    #[test]
    fn only_changed_slots_are_applied() {
        let current = meta("old", "topic", "");
        let proposed = meta("new", "topic", "");
        assert_eq!(
            evaluate(&current, &proposed, false),
            TrustDecision::Apply(vec![(StateKind::Name, "new".into())])
        );
    }

    #[test]
    fn untrusted_sender_is_always_rejected() {
        let current = meta("old", "", "");
        let proposed = meta("new", "", "");
        assert_eq!(evaluate(&current, &proposed, true), TrustDecision::Rejected);
    }

    #[test]
    fn name_length_boundary() {
        let current = meta("", "", "");
        let ok = meta(&"n".repeat(100), "", "");
        let too_long = meta(&"n".repeat(101), "", "");
        assert!(matches!(evaluate(&current, &ok, false), TrustDecision::Apply(_)));
        assert_eq!(evaluate(&current, &too_long, false), TrustDecision::Rejected);
    }

    #[test]
    fn oversized_but_unchanged_name_is_tolerated() {
        let long = "n".repeat(150);
        let current = meta(&long, "", "");
        let proposed = meta(&long, "new topic", "");
        assert_eq!(
            evaluate(&current, &proposed, false),
            TrustDecision::Apply(vec![(StateKind::Topic, "new topic".into())])
        );
    }

    #[test]
    fn length_counts_characters_not_bytes() {
        let current = meta("", "", "");
        let proposed = meta(&"é".repeat(100), "", "");
        assert!(matches!(evaluate(&current, &proposed, false), TrustDecision::Apply(_)));
    }

    #[test]
    fn topic_limit_rejects_unrelated_name_change() {
        let current = meta("a", "", "");
        let proposed = meta("b", &"t".repeat(1001), "");
        assert_eq!(evaluate(&current, &proposed, false), TrustDecision::Rejected);
    }

    #[test]
    fn avatar_must_be_short_media_reference() {
        let current = meta("", "", "mxc://x/old");
        assert_eq!(
            evaluate(&current, &meta("", "", "https://evil/img.png"), false),
            TrustDecision::Rejected
        );
        let long = format!("mxc://x/{}", "a".repeat(100));
        assert_eq!(
            evaluate(&current, &meta("", "", &long), false),
            TrustDecision::Rejected
        );
        assert_eq!(
            evaluate(&current, &meta("", "", "mxc://x/new"), false),
            TrustDecision::Apply(vec![(StateKind::Avatar, "mxc://x/new".into())])
        );
        // Clearing the avatar is allowed.
        assert_eq!(
            evaluate(&current, &meta("", "", ""), false),
            TrustDecision::Apply(vec![(StateKind::Avatar, String::new())])
        );
    }
}
