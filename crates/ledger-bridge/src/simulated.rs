//! In-memory ledger
//!
//! Holds record data in a DashMap and fans out change notifications per
//! address over broadcast channels, the way an account store and its
//! subscription manager work together. The write operations enforce the same
//! preconditions the game program does. Faults can be queued per operation to
//! simulate congestion and committed-but-unacknowledged writes, and push
//! delivery can be switched off to simulate a dead transport.

use crate::client::{AccountUpdate, AccountUpdates, LedgerReader, LedgerWriter};
use crate::error::LedgerError;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use ledger_types::{
    DeliveryRecord, GrowRecord, LedgerRecord, MatchAddresses, MatchIdentity, MatchRecord,
    ParticipantPair, StakeRecord, StakeStatus, MATCH_DURATION_SECS, MAX_START_LEAD_SECS,
    STAKE_AMOUNT,
};
use parking_lot::Mutex;
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use std::collections::{HashMap, VecDeque};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use tokio::sync::broadcast;

/// Operations that can be counted and faulted
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LedgerOp {
    InitMatch,
    InitGrowState,
    InitDeliveryState,
    JoinMatchWithStake,
}

/// When an injected fault fires relative to the state change
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultTiming {
    /// Nothing is written
    BeforeCommit,
    /// The write lands but the caller sees an error
    AfterCommit,
}

/// Shared ledger state. Each participant talks to it through a
/// [`SimulatedClient`] bound to its wallet.
pub struct SimulatedLedger {
    program_id: Pubkey,
    accounts: DashMap<Pubkey, Vec<u8>>,
    subscribers: DashMap<Pubkey, broadcast::Sender<AccountUpdate>>,
    slot: AtomicU64,
    push_enabled: AtomicBool,
    faults: Mutex<HashMap<LedgerOp, VecDeque<(LedgerError, FaultTiming)>>>,
    /// Serializes check-then-write program logic, like a single block producer
    commit_lock: Mutex<()>,
    calls: DashMap<LedgerOp, usize>,
    commits: DashMap<LedgerOp, usize>,
}

impl SimulatedLedger {
    /// Create a new, empty ledger
    pub fn new(program_id: Pubkey) -> Arc<Self> {
        Arc::new(Self {
            program_id,
            accounts: DashMap::new(),
            subscribers: DashMap::new(),
            slot: AtomicU64::new(1),
            push_enabled: AtomicBool::new(true),
            faults: Mutex::new(HashMap::new()),
            commit_lock: Mutex::new(()),
            calls: DashMap::new(),
            commits: DashMap::new(),
        })
    }

    /// A client that signs as `wallet`
    pub fn client(self: &Arc<Self>, wallet: Pubkey) -> SimulatedClient {
        SimulatedClient {
            ledger: self.clone(),
            wallet,
        }
    }

    /// Program id the records are derived under
    pub fn program_id(&self) -> &Pubkey {
        &self.program_id
    }

    /// All record addresses for a match
    pub fn addresses(&self, identity: &MatchIdentity, pair: &ParticipantPair) -> MatchAddresses {
        MatchAddresses::derive(&self.program_id, identity, pair)
    }

    /// Queue a fault for the next call of `op`
    pub fn inject_fault(&self, op: LedgerOp, error: LedgerError, timing: FaultTiming) {
        self.faults
            .lock()
            .entry(op)
            .or_default()
            .push_back((error, timing));
    }

    /// Turn push notifications on or off. Subscriptions opened while off
    /// never yield.
    pub fn set_push_enabled(&self, enabled: bool) {
        self.push_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Times `op` was called
    pub fn call_count(&self, op: LedgerOp) -> usize {
        self.calls.get(&op).map(|c| *c).unwrap_or(0)
    }

    /// Times `op` actually changed state
    pub fn commit_count(&self, op: LedgerOp) -> usize {
        self.commits.get(&op).map(|c| *c).unwrap_or(0)
    }

    /// Whether anything is stored at `address`
    pub fn account_exists(&self, address: &Pubkey) -> bool {
        self.accounts.contains_key(address)
    }

    /// Write raw bytes, bypassing program checks
    pub fn store_raw(&self, address: Pubkey, data: Vec<u8>) {
        self.write(address, data);
    }

    /// Current stake status, if the stake record exists and decodes
    pub fn stake_status(&self, identity: &MatchIdentity, pair: &ParticipantPair) -> Option<StakeStatus> {
        let address = self.addresses(identity, pair).stake_state;
        let data = self.accounts.get(&address)?;
        StakeRecord::decode(data.value()).ok().map(|s| s.status)
    }

    fn write(&self, address: Pubkey, data: Vec<u8>) {
        let slot = self.slot.fetch_add(1, Ordering::SeqCst);
        self.accounts.insert(address, data.clone());

        let orphaned = match self.subscribers.get(&address) {
            Some(sender) => sender
                .send(AccountUpdate {
                    address,
                    slot,
                    data: Some(data),
                })
                .is_err(),
            None => false,
        };
        if orphaned {
            self.prune_subscribers();
        }
    }

    /// Drop channels whose subscribers have all gone away
    fn prune_subscribers(&self) {
        self.subscribers
            .retain(|_, sender| sender.receiver_count() > 0);
    }

    /// Addresses with at least one channel still registered
    pub fn watched_addresses(&self) -> usize {
        self.subscribers.len()
    }

    fn record<R: LedgerRecord>(&self, address: &Pubkey) -> Result<Option<R>, LedgerError> {
        match self.accounts.get(address) {
            Some(data) => Ok(Some(R::decode(data.value())?)),
            None => Ok(None),
        }
    }

    fn take_fault(&self, op: LedgerOp) -> Option<(LedgerError, FaultTiming)> {
        self.faults.lock().get_mut(&op).and_then(|q| q.pop_front())
    }

    /// Count the call, apply any queued fault around `commit`
    fn execute(
        &self,
        op: LedgerOp,
        commit: impl FnOnce() -> Result<(), LedgerError>,
    ) -> Result<Signature, LedgerError> {
        *self.calls.entry(op).or_insert(0) += 1;

        let fault = self.take_fault(op);
        if let Some((error, FaultTiming::BeforeCommit)) = fault {
            tracing::debug!("Simulated {:?} failed before commit: {}", op, error);
            return Err(error);
        }

        {
            let _guard = self.commit_lock.lock();
            commit()?;
        }
        *self.commits.entry(op).or_insert(0) += 1;

        if let Some((error, FaultTiming::AfterCommit)) = fault {
            tracing::debug!("Simulated {:?} committed but reported: {}", op, error);
            return Err(error);
        }
        Ok(Signature::new_unique())
    }

    fn init_match(
        &self,
        wallet: &Pubkey,
        identity: &MatchIdentity,
        pair: &ParticipantPair,
        start_ts: i64,
    ) -> Result<(), LedgerError> {
        if wallet != pair.lower() {
            return Err(LedgerError::Rejected("InvalidPlayerOrder".into()));
        }
        let now = chrono::Utc::now().timestamp();
        if start_ts > now + MAX_START_LEAD_SECS {
            return Err(LedgerError::Rejected("MatchNotStarted".into()));
        }

        let addresses = self.addresses(identity, pair);
        if self.account_exists(&addresses.match_state) || self.account_exists(&addresses.stake_state)
        {
            return Err(LedgerError::AlreadyExists(format!(
                "Allocate: account {} already in use",
                addresses.match_state
            )));
        }

        let match_record = MatchRecord {
            match_id: identity.numeric_id(),
            match_id_hash: *identity.identity_hash(),
            start_ts,
            end_ts: start_ts + MATCH_DURATION_SECS,
            player_a: *pair.lower(),
            player_b: *pair.higher(),
        };
        let stake_record = StakeRecord {
            match_id: identity.numeric_id(),
            match_id_hash: *identity.identity_hash(),
            player_a: *pair.lower(),
            player_b: *pair.higher(),
            status: StakeStatus::Pending,
            player_a_escrowed: STAKE_AMOUNT,
            player_b_escrowed: 0,
            created_at: now,
            bump: 255,
            escrow_bump: 255,
        };

        self.write(addresses.stake_state, stake_record.encode());
        self.write(addresses.match_state, match_record.encode());
        Ok(())
    }

    fn init_dependent(
        &self,
        address: Pubkey,
        identity: &MatchIdentity,
        pair: &ParticipantPair,
        data: Vec<u8>,
    ) -> Result<(), LedgerError> {
        let match_state = self.addresses(identity, pair).match_state;
        let Some(record) = self.record::<MatchRecord>(&match_state)? else {
            return Err(LedgerError::PreconditionNotMet(
                "AccountNotInitialized: match_state".into(),
            ));
        };
        if record.match_id != identity.numeric_id() {
            return Err(LedgerError::Rejected("MatchIdMismatch".into()));
        }
        if self.account_exists(&address) {
            return Err(LedgerError::AlreadyExists(format!(
                "Allocate: account {address} already in use"
            )));
        }

        self.write(address, data);
        Ok(())
    }

    fn join(
        &self,
        wallet: &Pubkey,
        identity: &MatchIdentity,
        pair: &ParticipantPair,
    ) -> Result<(), LedgerError> {
        if wallet != pair.higher() {
            return Err(LedgerError::Rejected("InvalidPlayer".into()));
        }
        let address = self.addresses(identity, pair).stake_state;
        let Some(mut stake) = self.record::<StakeRecord>(&address)? else {
            return Err(LedgerError::PreconditionNotMet(
                "AccountNotInitialized: stake_state".into(),
            ));
        };
        if stake.status != StakeStatus::Pending {
            return Err(LedgerError::Rejected("MatchNotPending".into()));
        }
        if stake.player_b_escrowed != 0 {
            return Err(LedgerError::Rejected("AlreadyStaked".into()));
        }

        stake.player_b_escrowed = STAKE_AMOUNT;
        stake.status = StakeStatus::Active;
        self.write(address, stake.encode());
        Ok(())
    }
}

/// A participant's handle on the shared [`SimulatedLedger`]
#[derive(Clone)]
pub struct SimulatedClient {
    ledger: Arc<SimulatedLedger>,
    wallet: Pubkey,
}

impl SimulatedClient {
    /// Wallet this client signs as
    pub fn wallet(&self) -> &Pubkey {
        &self.wallet
    }

    /// The shared ledger behind this client
    pub fn ledger(&self) -> &Arc<SimulatedLedger> {
        &self.ledger
    }
}

#[async_trait]
impl LedgerReader for SimulatedClient {
    async fn get_account_data(&self, address: &Pubkey) -> Result<Option<Vec<u8>>, LedgerError> {
        Ok(self.ledger.accounts.get(address).map(|d| d.value().clone()))
    }

    async fn subscribe_account(&self, address: &Pubkey) -> Result<AccountUpdates, LedgerError> {
        if !self.ledger.push_enabled.load(Ordering::SeqCst) {
            return Ok(futures::stream::pending::<AccountUpdate>().boxed());
        }

        let receiver = self
            .ledger
            .subscribers
            .entry(*address)
            .or_insert_with(|| broadcast::channel(64).0)
            .subscribe();

        let updates = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(update) => return Some((update, receiver)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Simulated subscriber lagged {} updates", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(updates.boxed())
    }
}

#[async_trait]
impl LedgerWriter for SimulatedClient {
    async fn init_match(
        &self,
        identity: &MatchIdentity,
        pair: &ParticipantPair,
        start_ts: i64,
    ) -> Result<Signature, LedgerError> {
        self.ledger.execute(LedgerOp::InitMatch, || {
            self.ledger.init_match(&self.wallet, identity, pair, start_ts)
        })
    }

    async fn init_grow_state(
        &self,
        identity: &MatchIdentity,
        pair: &ParticipantPair,
    ) -> Result<Signature, LedgerError> {
        let address = self.ledger.addresses(identity, pair).grow_state;
        let record = GrowRecord {
            match_id: identity.numeric_id(),
            match_id_hash: *identity.identity_hash(),
            player_a: *pair.lower(),
            player_b: *pair.higher(),
        };
        self.ledger.execute(LedgerOp::InitGrowState, || {
            self.ledger
                .init_dependent(address, identity, pair, record.encode())
        })
    }

    async fn init_delivery_state(
        &self,
        identity: &MatchIdentity,
        pair: &ParticipantPair,
    ) -> Result<Signature, LedgerError> {
        let address = self.ledger.addresses(identity, pair).delivery_state;
        let record = DeliveryRecord {
            match_id: identity.numeric_id(),
            last_update_ts: chrono::Utc::now().timestamp(),
            available_customers: [11, 12, 3, 255, 255],
            active_count: 3,
            bump: 255,
        };
        self.ledger.execute(LedgerOp::InitDeliveryState, || {
            self.ledger
                .init_dependent(address, identity, pair, record.encode())
        })
    }

    async fn join_match_with_stake(
        &self,
        identity: &MatchIdentity,
        pair: &ParticipantPair,
    ) -> Result<Signature, LedgerError> {
        self.ledger.execute(LedgerOp::JoinMatchWithStake, || {
            self.ledger.join(&self.wallet, identity, pair)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fetch_record;

    fn setup() -> (Arc<SimulatedLedger>, MatchIdentity, ParticipantPair) {
        let ledger = SimulatedLedger::new(Pubkey::new_unique());
        let identity = MatchIdentity::derive("sim").unwrap();
        let pair = ParticipantPair::new(Pubkey::new_unique(), Pubkey::new_unique()).unwrap();
        (ledger, identity, pair)
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    #[tokio::test]
    async fn test_init_match_creates_match_and_stake() {
        let (ledger, identity, pair) = setup();
        let leader = ledger.client(*pair.lower());

        leader.init_match(&identity, &pair, now() + 10).await.unwrap();

        let addresses = ledger.addresses(&identity, &pair);
        let record: MatchRecord = fetch_record(&leader, &addresses.match_state)
            .await
            .unwrap()
            .unwrap();
        record.validate(&identity, &pair).unwrap();
        assert_eq!(record.end_ts - record.start_ts, MATCH_DURATION_SECS);
        assert_eq!(ledger.stake_status(&identity, &pair), Some(StakeStatus::Pending));
    }

    #[tokio::test]
    async fn test_second_init_match_reports_already_exists() {
        let (ledger, identity, pair) = setup();
        let leader = ledger.client(*pair.lower());

        leader.init_match(&identity, &pair, now()).await.unwrap();
        let err = leader.init_match(&identity, &pair, now()).await.unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyExists(_)));
        assert_eq!(ledger.commit_count(LedgerOp::InitMatch), 1);
    }

    #[tokio::test]
    async fn test_higher_participant_cannot_init_match() {
        let (ledger, identity, pair) = setup();
        let follower = ledger.client(*pair.higher());
        let err = follower.init_match(&identity, &pair, now()).await.unwrap_err();
        assert!(matches!(err, LedgerError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_dependent_requires_match_record() {
        let (ledger, identity, pair) = setup();
        let leader = ledger.client(*pair.lower());
        let err = leader.init_grow_state(&identity, &pair).await.unwrap_err();
        assert!(matches!(err, LedgerError::PreconditionNotMet(_)));
    }

    #[tokio::test]
    async fn test_join_activates_once() {
        let (ledger, identity, pair) = setup();
        let leader = ledger.client(*pair.lower());
        let follower = ledger.client(*pair.higher());

        leader.init_match(&identity, &pair, now()).await.unwrap();
        follower.join_match_with_stake(&identity, &pair).await.unwrap();
        assert_eq!(ledger.stake_status(&identity, &pair), Some(StakeStatus::Active));

        let err = follower
            .join_match_with_stake(&identity, &pair)
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::Rejected("MatchNotPending".into()));
    }

    #[tokio::test]
    async fn test_fault_after_commit_still_writes() {
        let (ledger, identity, pair) = setup();
        let leader = ledger.client(*pair.lower());
        ledger.inject_fault(
            LedgerOp::InitMatch,
            LedgerError::RateLimited("429".into()),
            FaultTiming::AfterCommit,
        );

        assert!(leader.init_match(&identity, &pair, now()).await.is_err());
        let addresses = ledger.addresses(&identity, &pair);
        assert!(ledger.account_exists(&addresses.match_state));
        assert_eq!(ledger.call_count(LedgerOp::InitMatch), 1);
        assert_eq!(ledger.commit_count(LedgerOp::InitMatch), 1);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned_on_publish() {
        let (ledger, identity, pair) = setup();
        let leader = ledger.client(*pair.lower());
        let addresses = ledger.addresses(&identity, &pair);

        let match_updates = leader.subscribe_account(&addresses.match_state).await.unwrap();
        let _stake_updates = leader.subscribe_account(&addresses.stake_state).await.unwrap();
        assert_eq!(ledger.watched_addresses(), 2);

        drop(match_updates);
        leader.init_match(&identity, &pair, now()).await.unwrap();

        // the stake subscriber is still listening
        assert_eq!(ledger.watched_addresses(), 1);
    }

    #[tokio::test]
    async fn test_subscription_sees_writes() {
        let (ledger, identity, pair) = setup();
        let leader = ledger.client(*pair.lower());
        let addresses = ledger.addresses(&identity, &pair);

        let mut updates = leader.subscribe_account(&addresses.match_state).await.unwrap();
        leader.init_match(&identity, &pair, now()).await.unwrap();

        let update = updates.next().await.unwrap();
        assert_eq!(update.address, addresses.match_state);
        assert!(update.data.is_some());
    }
}
