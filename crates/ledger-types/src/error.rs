//! Errors for identity derivation and record decoding

use solana_sdk::pubkey::Pubkey;
use thiserror::Error;

/// Local precondition violations when building a match identity or pair
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Match token is empty")]
    EmptyToken,

    #[error("Participant {0} appears twice in the pair")]
    DuplicateParticipant(Pubkey),
}

/// A record exists on the ledger but cannot be trusted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("{record} account is too short ({len} bytes)")]
    TooShort { record: &'static str, len: usize },

    #[error("{record} account has an unexpected discriminator")]
    WrongDiscriminator { record: &'static str },

    #[error("{record} account failed to decode: {reason}")]
    Decode { record: &'static str, reason: String },

    #[error("{record} account does not belong to this match: {field} mismatch")]
    Mismatch {
        record: &'static str,
        field: &'static str,
    },
}
