//! Deterministic leader election
//!
//! Both clients compute the same answer from the same two identifiers
//! without exchanging anything: the lexicographically lower participant
//! leads. Identifiers compare byte-wise, which is what `Pubkey`'s `Ord` does.

use crate::types::Role;
use ledger_types::{ParticipantId, ParticipantPair};

/// Order two distinct participants.
///
/// # Panics
///
/// Panics if `a == b`. A match against oneself is a local precondition
/// violation, never a runtime condition to recover from.
pub fn sort_pair(a: &ParticipantId, b: &ParticipantId) -> ParticipantPair {
    match ParticipantPair::new(*a, *b) {
        Ok(pair) => pair,
        Err(e) => panic!("cannot elect a leader: {e}"),
    }
}

/// The participant responsible for submitting the initialization sequence
pub fn elect(a: &ParticipantId, b: &ParticipantId) -> ParticipantId {
    *sort_pair(a, b).lower()
}

/// Whether `local` is the one that submits
pub fn should_submit(local: &ParticipantId, pair: &ParticipantPair) -> bool {
    local == pair.lower()
}

/// Role of `local` in `pair`, `None` if it is not a member
pub fn role_of(local: &ParticipantId, pair: &ParticipantPair) -> Option<Role> {
    if !pair.contains(local) {
        None
    } else if should_submit(local, pair) {
        Some(Role::Leader)
    } else {
        Some(Role::Follower)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::pubkey::Pubkey;

    fn key(first: u8) -> Pubkey {
        let mut bytes = [0xffu8; 32];
        bytes[0] = first;
        Pubkey::new_from_array(bytes)
    }

    #[test]
    fn test_lower_identifier_leads() {
        let x = key(0x01);
        let y = key(0x02);

        assert_eq!(elect(&x, &y), x);
        assert_eq!(elect(&y, &x), x);

        let pair = sort_pair(&y, &x);
        assert_eq!(pair.lower(), &x);
        assert_eq!(pair.higher(), &y);
    }

    #[test]
    fn test_both_sides_agree() {
        for _ in 0..32 {
            let a = Pubkey::new_unique();
            let b = Pubkey::new_unique();
            let from_a = sort_pair(&a, &b);
            let from_b = sort_pair(&b, &a);
            assert_eq!(from_a, from_b);

            // exactly one of the two submits
            assert_ne!(should_submit(&a, &from_a), should_submit(&b, &from_b));
        }
    }

    #[test]
    fn test_roles() {
        let x = key(0x01);
        let y = key(0x02);
        let pair = sort_pair(&x, &y);

        assert_eq!(role_of(&x, &pair), Some(Role::Leader));
        assert_eq!(role_of(&y, &pair), Some(Role::Follower));
        assert_eq!(role_of(&key(0x03), &pair), None);
    }

    #[test]
    fn test_comparison_is_byte_wise() {
        // differs only in the last byte
        let mut low = [7u8; 32];
        let mut high = [7u8; 32];
        low[31] = 0x00;
        high[31] = 0x80;
        let low = Pubkey::new_from_array(low);
        let high = Pubkey::new_from_array(high);
        assert_eq!(elect(&high, &low), low);
    }

    #[test]
    #[should_panic(expected = "cannot elect a leader")]
    fn test_equal_identifiers_are_fatal() {
        let x = key(0x01);
        sort_pair(&x, &x);
    }
}
