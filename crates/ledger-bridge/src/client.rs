//! Ledger collaborator traits
//!
//! Reads are side-effect free and shared by both roles. Writes carry the
//! local wallet's signature; which participant may call which write is the
//! coordinator's concern, the ledger only enforces it on chain.

use crate::error::LedgerError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use ledger_types::{LedgerRecord, MatchIdentity, ParticipantPair};
use solana_sdk::{pubkey::Pubkey, signature::Signature};

/// Change notification for one address
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountUpdate {
    pub address: Pubkey,
    pub slot: u64,
    /// `None` when the account was closed
    pub data: Option<Vec<u8>>,
}

/// Stream of change notifications; ends when the transport drops
pub type AccountUpdates = BoxStream<'static, AccountUpdate>;

/// Read access to ledger state
#[async_trait]
pub trait LedgerReader: Send + Sync {
    /// Current account data, or `None` if the account does not exist
    async fn get_account_data(&self, address: &Pubkey) -> Result<Option<Vec<u8>>, LedgerError>;

    /// Notifications whenever the account at `address` changes
    async fn subscribe_account(&self, address: &Pubkey) -> Result<AccountUpdates, LedgerError>;
}

/// Record-creation operations, signed by the local wallet
#[async_trait]
pub trait LedgerWriter: Send + Sync {
    /// Create the primary match record and stake record, escrowing player A's stake
    async fn init_match(
        &self,
        identity: &MatchIdentity,
        pair: &ParticipantPair,
        start_ts: i64,
    ) -> Result<Signature, LedgerError>;

    /// Create the first dependent record
    async fn init_grow_state(
        &self,
        identity: &MatchIdentity,
        pair: &ParticipantPair,
    ) -> Result<Signature, LedgerError>;

    /// Create the second dependent record
    async fn init_delivery_state(
        &self,
        identity: &MatchIdentity,
        pair: &ParticipantPair,
    ) -> Result<Signature, LedgerError>;

    /// Player B deposits and activates the match
    async fn join_match_with_stake(
        &self,
        identity: &MatchIdentity,
        pair: &ParticipantPair,
    ) -> Result<Signature, LedgerError>;
}

/// Full ledger access
pub trait Ledger: LedgerReader + LedgerWriter {}

impl<T: LedgerReader + LedgerWriter> Ledger for T {}

/// Fetch and decode a record; missing accounts are `Ok(None)`
pub async fn fetch_record<R: LedgerRecord>(
    reader: &(impl LedgerReader + ?Sized),
    address: &Pubkey,
) -> Result<Option<R>, LedgerError> {
    match reader.get_account_data(address).await? {
        Some(data) => Ok(Some(R::decode(&data)?)),
        None => Ok(None),
    }
}
