//! Shared types for match-start coordination
//!
//! This crate mirrors the game program's on-chain layout for the records the
//! coordinator creates and reads, and holds the pure derivations (match
//! identity, participant ordering, record addresses) that both clients must
//! compute identically without talking to each other.

use borsh::{BorshDeserialize, BorshSerialize};

pub mod accounts;
pub mod addresses;
pub mod error;
pub mod identity;

pub use accounts::{
    DeliveryRecord, GrowRecord, LedgerRecord, MatchRecord, StakeRecord, StakeStatus,
};
pub use addresses::MatchAddresses;
pub use error::{IdentityError, RecordError};
pub use identity::{MatchIdentity, ParticipantId, ParticipantPair};

/// Match length fixed by the program (end_ts = start_ts + 10 minutes)
pub const MATCH_DURATION_SECS: i64 = 10 * 60;

/// The program rejects a start timestamp further than this in the future
pub const MAX_START_LEAD_SECS: i64 = 60;

/// Fixed stake per player in raw token units (1 token, 6 decimals)
pub const STAKE_AMOUNT: u64 = 1_000_000;

/// PDA seeds
pub mod seeds {
    pub const MATCH: &[u8] = b"match";
    pub const STAKE: &[u8] = b"stake";
    pub const ESCROW: &[u8] = b"escrow";
    pub const ESCROW_AUTHORITY: &[u8] = b"escrow_auth";
    pub const GROW: &[u8] = b"grow";
    pub const DELIVERY: &[u8] = b"delivery";
}

/// Authoritative match clock recorded once when coordination completes
#[derive(BorshSerialize, BorshDeserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatchClock {
    pub start_ts: i64,
    pub end_ts: i64,
}

impl MatchClock {
    /// Seconds remaining at `now`, clamped at zero
    pub fn remaining_secs(&self, now: i64) -> i64 {
        (self.end_ts - now.max(self.start_ts)).max(0)
    }

    /// Whether gameplay timing has begun at `now`
    pub fn has_started(&self, now: i64) -> bool {
        now >= self.start_ts
    }
}

impl From<&MatchRecord> for MatchClock {
    fn from(record: &MatchRecord) -> Self {
        Self {
            start_ts: record.start_ts,
            end_ts: record.end_ts,
        }
    }
}
