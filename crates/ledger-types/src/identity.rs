//! Match identity and participant ordering
//!
//! Both clients derive the same identity from the lobby's match token and the
//! same canonical pair from the two wallets, so every record address agrees
//! without any communication between them.

use crate::error::IdentityError;
use solana_sdk::{hash::hash, pubkey::Pubkey};
use std::cmp::Ordering;
use std::fmt;

/// A participant is identified by its wallet public key
pub type ParticipantId = Pubkey;

/// Deterministic identity of one match
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MatchIdentity {
    token: String,
    numeric_id: u64,
    identity_hash: [u8; 32],
}

impl MatchIdentity {
    /// Derive the identity from the lobby's match token.
    ///
    /// The hash is SHA-256 over the token bytes; the numeric id is the
    /// little-endian u64 of the first eight hash bytes, which is also what
    /// the program derives when it is not given an explicit id.
    pub fn derive(token: &str) -> Result<Self, IdentityError> {
        if token.is_empty() {
            return Err(IdentityError::EmptyToken);
        }
        let identity_hash = hash(token.as_bytes()).to_bytes();
        Ok(Self {
            token: token.to_string(),
            numeric_id: numeric_id_from_hash(&identity_hash),
            identity_hash,
        })
    }

    /// Lobby match token this identity was derived from
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Numeric match id used in dependent record seeds
    pub fn numeric_id(&self) -> u64 {
        self.numeric_id
    }

    /// SHA-256 of the match token
    pub fn identity_hash(&self) -> &[u8; 32] {
        &self.identity_hash
    }

    /// Seed bytes for records keyed by the numeric id
    pub fn numeric_seed(&self) -> [u8; 8] {
        self.numeric_id.to_le_bytes()
    }
}

impl fmt::Display for MatchIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{})", self.token, self.numeric_id)
    }
}

/// First eight hash bytes as a little-endian u64
pub fn numeric_id_from_hash(identity_hash: &[u8; 32]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&identity_hash[..8]);
    u64::from_le_bytes(bytes)
}

/// Two participants in byte-lexicographic order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ParticipantPair {
    lower: ParticipantId,
    higher: ParticipantId,
}

impl ParticipantPair {
    /// Order two distinct participants. Argument order does not matter.
    pub fn new(a: ParticipantId, b: ParticipantId) -> Result<Self, IdentityError> {
        match a.cmp(&b) {
            Ordering::Less => Ok(Self {
                lower: a,
                higher: b,
            }),
            Ordering::Greater => Ok(Self {
                lower: b,
                higher: a,
            }),
            Ordering::Equal => Err(IdentityError::DuplicateParticipant(a)),
        }
    }

    /// Player A on chain
    pub fn lower(&self) -> &ParticipantId {
        &self.lower
    }

    /// Player B on chain
    pub fn higher(&self) -> &ParticipantId {
        &self.higher
    }

    /// Whether `participant` is one of the two
    pub fn contains(&self, participant: &ParticipantId) -> bool {
        self.lower == *participant || self.higher == *participant
    }

    /// The opponent of `participant`, if it is part of this pair
    pub fn other(&self, participant: &ParticipantId) -> Option<ParticipantId> {
        if *participant == self.lower {
            Some(self.higher)
        } else if *participant == self.higher {
            Some(self.lower)
        } else {
            None
        }
    }
}
