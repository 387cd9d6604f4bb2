//! On-chain record mirrors
//!
//! Every record is stored as an 8-byte discriminator followed by the Borsh
//! encoding of its fields. Only the leading fields this client needs are
//! mirrored; decoding reads a prefix and ignores the rest of the account.

use crate::error::RecordError;
use crate::identity::{MatchIdentity, ParticipantPair};
use borsh::{BorshDeserialize, BorshSerialize};
use solana_sdk::{hash::hash, pubkey::Pubkey};

/// Length of the record discriminator
pub const DISCRIMINATOR_LEN: usize = 8;

/// Discriminator for an account type: sha256("account:<Name>")[..8]
pub fn account_discriminator(name: &str) -> [u8; DISCRIMINATOR_LEN] {
    prefix_hash(&format!("account:{name}"))
}

/// Discriminator for an instruction: sha256("global:<name>")[..8]
pub fn instruction_discriminator(name: &str) -> [u8; DISCRIMINATOR_LEN] {
    prefix_hash(&format!("global:{name}"))
}

fn prefix_hash(preimage: &str) -> [u8; DISCRIMINATOR_LEN] {
    let digest = hash(preimage.as_bytes()).to_bytes();
    let mut out = [0u8; DISCRIMINATOR_LEN];
    out.copy_from_slice(&digest[..DISCRIMINATOR_LEN]);
    out
}

/// A record stored under a program-derived address
pub trait LedgerRecord: BorshSerialize + BorshDeserialize {
    /// Account type name used for the discriminator
    const NAME: &'static str;

    /// Decode from raw account data, checking the discriminator
    fn decode(data: &[u8]) -> Result<Self, RecordError> {
        if data.len() < DISCRIMINATOR_LEN {
            return Err(RecordError::TooShort {
                record: Self::NAME,
                len: data.len(),
            });
        }
        if data[..DISCRIMINATOR_LEN] != account_discriminator(Self::NAME) {
            return Err(RecordError::WrongDiscriminator { record: Self::NAME });
        }
        let mut body = &data[DISCRIMINATOR_LEN..];
        Self::deserialize(&mut body).map_err(|e| RecordError::Decode {
            record: Self::NAME,
            reason: e.to_string(),
        })
    }

    /// Encode with the discriminator prepended
    fn encode(&self) -> Vec<u8> {
        let mut data = account_discriminator(Self::NAME).to_vec();
        // Writing into a Vec cannot fail
        let _ = self.serialize(&mut data);
        data
    }
}

/// Primary match record (leading fields)
#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, PartialEq, Eq)]
pub struct MatchRecord {
    pub match_id: u64,
    pub match_id_hash: [u8; 32],
    pub start_ts: i64,
    pub end_ts: i64,
    pub player_a: Pubkey,
    pub player_b: Pubkey,
}

impl LedgerRecord for MatchRecord {
    const NAME: &'static str = "MatchState";
}

impl MatchRecord {
    /// Check the record was written for this identity and pair
    pub fn validate(
        &self,
        identity: &MatchIdentity,
        pair: &ParticipantPair,
    ) -> Result<(), RecordError> {
        check(Self::NAME, "match_id_hash", self.match_id_hash == *identity.identity_hash())?;
        check(Self::NAME, "match_id", self.match_id == identity.numeric_id())?;
        check(Self::NAME, "player_a", self.player_a == *pair.lower())?;
        check(Self::NAME, "player_b", self.player_b == *pair.higher())?;
        check(Self::NAME, "end_ts", self.end_ts > self.start_ts)
    }
}

/// Staking lifecycle status
#[derive(BorshSerialize, BorshDeserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum StakeStatus {
    /// Player A escrowed, waiting for player B
    #[default]
    Pending,
    /// Both stakes escrowed, match running
    Active,
    /// Winner paid out
    Finalized,
    /// Player A refunded before player B joined
    Cancelled,
}

/// Stake record, created in the same transaction as the match record
#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, PartialEq, Eq)]
pub struct StakeRecord {
    pub match_id: u64,
    pub match_id_hash: [u8; 32],
    pub player_a: Pubkey,
    pub player_b: Pubkey,
    pub status: StakeStatus,
    pub player_a_escrowed: u64,
    pub player_b_escrowed: u64,
    pub created_at: i64,
    pub bump: u8,
    pub escrow_bump: u8,
}

impl LedgerRecord for StakeRecord {
    const NAME: &'static str = "MatchStakeState";
}

impl StakeRecord {
    /// Check the record belongs to this match and pair
    pub fn validate(
        &self,
        identity: &MatchIdentity,
        pair: &ParticipantPair,
    ) -> Result<(), RecordError> {
        check(Self::NAME, "match_id_hash", self.match_id_hash == *identity.identity_hash())?;
        check(Self::NAME, "player_a", self.player_a == *pair.lower())?;
        check(Self::NAME, "player_b", self.player_b == *pair.higher())
    }

    /// Player B still has to deposit
    pub fn awaiting_join(&self) -> bool {
        self.status == StakeStatus::Pending && self.player_b_escrowed == 0
    }
}

/// First dependent record (leading fields)
#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, PartialEq, Eq)]
pub struct GrowRecord {
    pub match_id: u64,
    pub match_id_hash: [u8; 32],
    pub player_a: Pubkey,
    pub player_b: Pubkey,
}

impl LedgerRecord for GrowRecord {
    const NAME: &'static str = "MatchGrowState";
}

impl GrowRecord {
    /// Check the record belongs to this match
    pub fn validate(&self, identity: &MatchIdentity) -> Result<(), RecordError> {
        check(Self::NAME, "match_id", self.match_id == identity.numeric_id())?;
        check(Self::NAME, "match_id_hash", self.match_id_hash == *identity.identity_hash())
    }
}

/// Second dependent record (leading fields)
#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub match_id: u64,
    pub last_update_ts: i64,
    pub available_customers: [u8; 5],
    pub active_count: u8,
    pub bump: u8,
}

impl LedgerRecord for DeliveryRecord {
    const NAME: &'static str = "MatchDeliveryState";
}

impl DeliveryRecord {
    /// Check the record belongs to this match
    pub fn validate(&self, identity: &MatchIdentity) -> Result<(), RecordError> {
        check(Self::NAME, "match_id", self.match_id == identity.numeric_id())
    }
}

fn check(record: &'static str, field: &'static str, ok: bool) -> Result<(), RecordError> {
    if ok {
        Ok(())
    } else {
        Err(RecordError::Mismatch { record, field })
    }
}
