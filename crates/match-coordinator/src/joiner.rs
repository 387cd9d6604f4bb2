//! Follower-side stake deposit
//!
//! Once the leader's stake record shows up in `Pending`, the follower
//! deposits its own stake exactly once. Observations come from both the
//! stake record subscription and a polling backstop, so the same state is
//! usually seen more than once.

use crate::convergence::{DetectionStrategy, Tick};
use crate::dismissal::DismissalGuard;
use crate::election;
use crate::retry::RetryPolicy;
use crate::types::{ProgressReporter, StatusText};
use futures::StreamExt;
use ledger_bridge::{fetch_record, Ledger, LedgerError};
use ledger_types::{
    LedgerRecord, MatchAddresses, MatchIdentity, ParticipantId, ParticipantPair, RecordError,
    StakeRecord, StakeStatus,
};
use solana_sdk::signature::Signature;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    #[error("Match is {0:?}, nothing to join")]
    Closed(StakeStatus),

    #[error("Malformed stake record: {0}")]
    Malformed(#[from] RecordError),

    #[error("Join failed: {0}")]
    Ledger(LedgerError),

    #[error("Stake record never became observable")]
    NoObservations,
}

impl From<LedgerError> for JoinError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Malformed(e) => JoinError::Malformed(e),
            other => JoinError::Ledger(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined(Signature),
    /// Both stakes were already in
    AlreadyActive,
    /// The local participant leads; leaders never join
    NotFollower,
}

pub struct Joiner {
    ledger: Arc<dyn Ledger>,
    local: ParticipantId,
    identity: MatchIdentity,
    pair: ParticipantPair,
    addresses: MatchAddresses,
    retry: RetryPolicy,
    progress: ProgressReporter,
    latch: DismissalGuard,
}

impl Joiner {
    /// Create a new joiner for the local participant
    pub fn new(
        ledger: Arc<dyn Ledger>,
        local: ParticipantId,
        identity: MatchIdentity,
        pair: ParticipantPair,
        addresses: MatchAddresses,
        retry: RetryPolicy,
        progress: ProgressReporter,
    ) -> Self {
        Self {
            ledger,
            local,
            identity,
            pair,
            addresses,
            retry,
            progress,
            latch: DismissalGuard::new(),
        }
    }

    /// Whether the join call has been made (successfully or not)
    pub fn has_fired(&self) -> bool {
        self.latch.has_fired()
    }

    /// React to one observation of the stake record. Returns `None` while
    /// there is nothing to do yet.
    pub async fn observe(&self, stake: Option<&StakeRecord>) -> Result<Option<JoinOutcome>, JoinError> {
        let Some(stake) = stake else {
            return Ok(None);
        };
        stake.validate(&self.identity, &self.pair)?;

        match stake.status {
            StakeStatus::Active => return Ok(Some(JoinOutcome::AlreadyActive)),
            StakeStatus::Finalized | StakeStatus::Cancelled => {
                return Err(JoinError::Closed(stake.status))
            }
            StakeStatus::Pending if !stake.awaiting_join() => return Ok(None),
            StakeStatus::Pending => {}
        }

        // checked again right before the call, whatever the caller decided
        if election::should_submit(&self.local, &self.pair) || !self.pair.contains(&self.local) {
            tracing::warn!("Refusing to join: {} is not the follower", self.local);
            return Ok(Some(JoinOutcome::NotFollower));
        }

        if !self.latch.fire() {
            tracing::debug!("Join already in flight, ignoring duplicate observation");
            return Ok(None);
        }

        self.progress.set(StatusText::Staking);
        let result = self
            .retry
            .run(
                "join_match_with_stake",
                |_| self.ledger.join_match_with_stake(&self.identity, &self.pair),
                |_, _| self.progress.set(StatusText::RetryingAfterRateLimit),
            )
            .await;

        match result {
            Ok(signature) => {
                tracing::info!("Stake deposited: {}", signature);
                Ok(Some(JoinOutcome::Joined(signature)))
            }
            Err(e) => {
                // a lost response can hide a successful join
                let current =
                    fetch_record::<StakeRecord>(self.ledger.as_ref(), &self.addresses.stake_state)
                        .await?;
                if current.map(|s| s.status) == Some(StakeStatus::Active) {
                    tracing::warn!("Join reported {} but the match is active", e);
                    Ok(Some(JoinOutcome::AlreadyActive))
                } else {
                    Err(JoinError::from(e))
                }
            }
        }
    }

    /// Merge all strategies' observations of the stake record and handle
    /// them until the join resolves.
    pub async fn run(
        self: Arc<Self>,
        strategies: Vec<Arc<dyn DetectionStrategy>>,
    ) -> Result<JoinOutcome, JoinError> {
        let mut sources = Vec::new();
        for strategy in strategies {
            match strategy.ticks(self.addresses.stake_state, &[]).await {
                Ok(ticks) => sources.push(ticks),
                Err(e) => tracing::warn!("Stake {} path unavailable: {}", strategy.path(), e),
            }
        }
        let mut ticks = futures::stream::select_all(sources);

        while let Some(tick) = ticks.next().await {
            let stake = match tick {
                Tick::Scheduled => {
                    fetch_record::<StakeRecord>(self.ledger.as_ref(), &self.addresses.stake_state)
                        .await
                }
                Tick::Changed(data) => data
                    .as_deref()
                    .map(StakeRecord::decode)
                    .transpose()
                    .map_err(LedgerError::from),
            };

            let stake = match stake {
                Ok(stake) => stake,
                Err(e) if !matches!(e, LedgerError::Malformed(_)) => {
                    tracing::debug!("Stake read failed: {}", e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if let Some(outcome) = self.observe(stake.as_ref()).await? {
                return Ok(outcome);
            }
        }

        Err(JoinError::NoObservations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergence::PollStrategy;
    use crate::tests::support::ordered_keys;
    use ledger_bridge::{FaultTiming, LedgerOp, LedgerWriter, SimulatedLedger};
    use solana_sdk::pubkey::Pubkey;
    use std::time::Duration;

    struct Fixture {
        ledger: Arc<SimulatedLedger>,
        identity: MatchIdentity,
        pair: ParticipantPair,
    }

    fn fixture() -> Fixture {
        let (low, high) = ordered_keys();
        Fixture {
            ledger: SimulatedLedger::new(Pubkey::new_unique()),
            identity: MatchIdentity::derive("joiner-test").unwrap(),
            pair: ParticipantPair::new(low, high).unwrap(),
        }
    }

    fn joiner(f: &Fixture, local: Pubkey) -> Arc<Joiner> {
        Arc::new(Joiner::new(
            Arc::new(f.ledger.client(local)),
            local,
            f.identity.clone(),
            f.pair,
            f.ledger.addresses(&f.identity, &f.pair),
            RetryPolicy::default(),
            ProgressReporter::new(),
        ))
    }

    async fn init_match(f: &Fixture) -> StakeRecord {
        f.ledger
            .client(*f.pair.lower())
            .init_match(&f.identity, &f.pair, chrono::Utc::now().timestamp())
            .await
            .unwrap();
        let address = f.ledger.addresses(&f.identity, &f.pair).stake_state;
        fetch_record::<StakeRecord>(&f.ledger.client(*f.pair.higher()), &address)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_double_observation_joins_once() {
        let f = fixture();
        let stake = init_match(&f).await;
        let follower = joiner(&f, *f.pair.higher());

        let (first, second) = tokio::join!(
            follower.observe(Some(&stake)),
            follower.observe(Some(&stake))
        );

        let outcomes = [first.unwrap(), second.unwrap()];
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, Some(JoinOutcome::Joined(_))))
                .count(),
            1
        );
        assert_eq!(f.ledger.call_count(LedgerOp::JoinMatchWithStake), 1);
        assert_eq!(
            f.ledger.stake_status(&f.identity, &f.pair),
            Some(StakeStatus::Active)
        );
    }

    #[tokio::test]
    async fn test_leader_never_joins() {
        let f = fixture();
        let stake = init_match(&f).await;
        let leader = joiner(&f, *f.pair.lower());

        let outcome = leader.observe(Some(&stake)).await.unwrap();
        assert_eq!(outcome, Some(JoinOutcome::NotFollower));
        assert!(!leader.has_fired());
        assert_eq!(f.ledger.call_count(LedgerOp::JoinMatchWithStake), 0);
    }

    #[tokio::test]
    async fn test_missing_stake_waits() {
        let f = fixture();
        let follower = joiner(&f, *f.pair.higher());
        assert_eq!(follower.observe(None).await.unwrap(), None);
        assert!(!follower.has_fired());
    }

    #[tokio::test]
    async fn test_active_match_needs_no_join() {
        let f = fixture();
        let mut stake = init_match(&f).await;
        stake.status = StakeStatus::Active;
        stake.player_b_escrowed = stake.player_a_escrowed;

        let follower = joiner(&f, *f.pair.higher());
        assert_eq!(
            follower.observe(Some(&stake)).await.unwrap(),
            Some(JoinOutcome::AlreadyActive)
        );
        assert_eq!(f.ledger.call_count(LedgerOp::JoinMatchWithStake), 0);
    }

    #[tokio::test]
    async fn test_cancelled_match() {
        let f = fixture();
        let mut stake = init_match(&f).await;
        stake.status = StakeStatus::Cancelled;

        let follower = joiner(&f, *f.pair.higher());
        assert_eq!(
            follower.observe(Some(&stake)).await,
            Err(JoinError::Closed(StakeStatus::Cancelled))
        );
    }

    #[tokio::test]
    async fn test_lost_response_resolves_to_active() {
        let f = fixture();
        let stake = init_match(&f).await;
        f.ledger.inject_fault(
            LedgerOp::JoinMatchWithStake,
            LedgerError::Transport("connection reset".into()),
            FaultTiming::AfterCommit,
        );

        let follower = joiner(&f, *f.pair.higher());
        assert_eq!(
            follower.observe(Some(&stake)).await.unwrap(),
            Some(JoinOutcome::AlreadyActive)
        );
    }

    #[tokio::test]
    async fn test_failed_join_is_not_repeated() {
        let f = fixture();
        let stake = init_match(&f).await;
        f.ledger.inject_fault(
            LedgerOp::JoinMatchWithStake,
            LedgerError::Rejected("insufficient funds".into()),
            FaultTiming::BeforeCommit,
        );

        let follower = joiner(&f, *f.pair.higher());
        assert!(follower.observe(Some(&stake)).await.is_err());
        assert_eq!(follower.observe(Some(&stake)).await.unwrap(), None);
        assert_eq!(f.ledger.call_count(LedgerOp::JoinMatchWithStake), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_joins_when_stake_appears() {
        let f = fixture();
        let follower = joiner(&f, *f.pair.higher());
        let poll: Arc<dyn DetectionStrategy> = Arc::new(PollStrategy::new(Duration::from_secs(3)));
        let task = tokio::spawn(follower.clone().run(vec![poll]));

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(f.ledger.call_count(LedgerOp::JoinMatchWithStake), 0);
        init_match(&f).await;

        let outcome = task.await.unwrap().unwrap();
        assert!(matches!(outcome, JoinOutcome::Joined(_)));
        assert_eq!(f.ledger.call_count(LedgerOp::JoinMatchWithStake), 1);
    }
}
