//! Convergence detection
//!
//! Both participants wait for the same three records. A detector evaluates
//! ledger state without side effects; strategies decide when it looks.
//! Push reacts to changes of the primary record, poll looks on a fixed
//! interval. Both may run at once and share one [`DismissalGuard`].

use crate::dismissal::{DetectionPath, DismissalGuard};
use crate::types::{ConvergenceState, StatusText};
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use ledger_bridge::{fetch_record, LedgerError, LedgerReader};
use ledger_types::{
    DeliveryRecord, GrowRecord, LedgerRecord, MatchAddresses, MatchIdentity, MatchRecord,
    ParticipantPair, RecordError,
};
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceError {
    #[error("Ledger read failed: {0}")]
    Ledger(LedgerError),

    #[error("Malformed record: {0}")]
    Malformed(#[from] RecordError),
}

impl From<LedgerError> for ConvergenceError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Malformed(e) => ConvergenceError::Malformed(e),
            other => ConvergenceError::Ledger(other),
        }
    }
}

/// Result of one evaluation pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergenceCheck {
    pub state: ConvergenceState,
    /// Decoded primary record, when present
    pub match_record: Option<MatchRecord>,
}

/// A reason to evaluate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// Timer fired; read everything
    Scheduled,
    /// The watched account changed; carries its new content
    Changed(Option<Vec<u8>>),
}

pub type Ticks = BoxStream<'static, Tick>;

/// When to look at the ledger
#[async_trait]
pub trait DetectionStrategy: Send + Sync {
    fn path(&self) -> DetectionPath;

    /// Ticks for `primary`. Changes to any of `related` trigger a full read.
    async fn ticks(&self, primary: Pubkey, related: &[Pubkey]) -> Result<Ticks, LedgerError>;
}

/// Ledger change notifications. Once the primary record shows up the
/// dependent records are what change next, so they are watched too.
pub struct PushStrategy {
    reader: Arc<dyn LedgerReader>,
}

impl PushStrategy {
    /// Create a new push strategy reading through `reader`
    pub fn new(reader: Arc<dyn LedgerReader>) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl DetectionStrategy for PushStrategy {
    fn path(&self) -> DetectionPath {
        DetectionPath::Push
    }

    async fn ticks(&self, primary: Pubkey, related: &[Pubkey]) -> Result<Ticks, LedgerError> {
        let mut streams = vec![self
            .reader
            .subscribe_account(&primary)
            .await?
            .map(|update| Tick::Changed(update.data))
            .boxed()];
        for address in related {
            let updates = self.reader.subscribe_account(address).await?;
            streams.push(updates.map(|_| Tick::Scheduled).boxed());
        }
        Ok(futures::stream::select_all(streams).boxed())
    }
}

/// Fixed-interval reads; the first tick is immediate
pub struct PollStrategy {
    interval: Duration,
}

impl PollStrategy {
    /// Create a new poll strategy ticking every `interval`
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

#[async_trait]
impl DetectionStrategy for PollStrategy {
    fn path(&self) -> DetectionPath {
        DetectionPath::Poll
    }

    async fn ticks(&self, _primary: Pubkey, _related: &[Pubkey]) -> Result<Ticks, LedgerError> {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let ticks = futures::stream::unfold(interval, |mut interval| async move {
            interval.tick().await;
            Some((Tick::Scheduled, interval))
        });
        Ok(ticks.boxed())
    }
}

/// What a running detector reports to its session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorEvent {
    Progress(StatusText),
    /// Sent by exactly one path, the one that won the guard
    Converged {
        path: DetectionPath,
        record: MatchRecord,
    },
}

pub struct ConvergenceDetector {
    reader: Arc<dyn LedgerReader>,
    identity: MatchIdentity,
    pair: ParticipantPair,
    addresses: MatchAddresses,
}

impl ConvergenceDetector {
    /// Create a new detector for one match
    pub fn new(
        reader: Arc<dyn LedgerReader>,
        identity: MatchIdentity,
        pair: ParticipantPair,
        addresses: MatchAddresses,
    ) -> Self {
        Self {
            reader,
            identity,
            pair,
            addresses,
        }
    }

    /// Record addresses this detector checks
    pub fn addresses(&self) -> &MatchAddresses {
        &self.addresses
    }

    /// Read all three records
    pub async fn poll(&self) -> Result<ConvergenceCheck, ConvergenceError> {
        let match_record =
            fetch_record::<MatchRecord>(self.reader.as_ref(), &self.addresses.match_state).await?;
        self.evaluate(match_record).await
    }

    /// Evaluate with primary record content already in hand, reading the
    /// dependent records directly
    pub async fn observe(&self, data: Option<&[u8]>) -> Result<ConvergenceCheck, ConvergenceError> {
        let match_record = data.map(MatchRecord::decode).transpose()?;
        self.evaluate(match_record).await
    }

    async fn evaluate(
        &self,
        match_record: Option<MatchRecord>,
    ) -> Result<ConvergenceCheck, ConvergenceError> {
        if let Some(record) = &match_record {
            record.validate(&self.identity, &self.pair)?;
        }

        let grow =
            fetch_record::<GrowRecord>(self.reader.as_ref(), &self.addresses.grow_state).await?;
        if let Some(record) = &grow {
            record.validate(&self.identity)?;
        }
        let delivery =
            fetch_record::<DeliveryRecord>(self.reader.as_ref(), &self.addresses.delivery_state)
                .await?;
        if let Some(record) = &delivery {
            record.validate(&self.identity)?;
        }

        Ok(ConvergenceCheck {
            state: ConvergenceState {
                match_record_exists: match_record.is_some(),
                dependent_a_exists: grow.is_some(),
                dependent_b_exists: delivery.is_some(),
            },
            match_record,
        })
    }

    /// Drive one strategy until convergence is seen (by this or any other
    /// path sharing `guard`) or its tick source ends.
    ///
    /// Read failures and malformed records are reported as progress and
    /// never stop the loop.
    pub async fn run(
        self: Arc<Self>,
        strategy: Arc<dyn DetectionStrategy>,
        guard: Arc<DismissalGuard>,
        events: mpsc::Sender<DetectorEvent>,
    ) {
        let path = strategy.path();
        let related = [self.addresses.grow_state, self.addresses.delivery_state];
        let mut ticks = match strategy.ticks(self.addresses.match_state, &related).await {
            Ok(ticks) => ticks,
            Err(e) => {
                tracing::warn!("Convergence {} path unavailable: {}", path, e);
                return;
            }
        };

        while let Some(tick) = ticks.next().await {
            if guard.has_fired() {
                return;
            }

            let result = match &tick {
                Tick::Scheduled => self.poll().await,
                Tick::Changed(data) => self.observe(data.as_deref()).await,
            };

            let progress = match result {
                Ok(check) if check.state.is_converged() => {
                    if let Some(record) = check.match_record {
                        if guard.fire_from(path) {
                            let _ = events.send(DetectorEvent::Converged { path, record }).await;
                        }
                    }
                    return;
                }
                Ok(check) => StatusText::WaitingForInitialization {
                    pending: check.state.pending(),
                },
                Err(e) => {
                    tracing::error!("Convergence check via {} failed: {}", path, e);
                    StatusText::Error(e.to_string())
                }
            };

            if events.send(DetectorEvent::Progress(progress)).await.is_err() {
                return;
            }
        }

        tracing::debug!("Convergence {} path ended", path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::ordered_keys;
    use ledger_bridge::{LedgerReader as _, LedgerWriter, SimulatedLedger};

    struct Fixture {
        ledger: Arc<SimulatedLedger>,
        identity: MatchIdentity,
        pair: ParticipantPair,
        detector: Arc<ConvergenceDetector>,
    }

    fn fixture() -> Fixture {
        let ledger = SimulatedLedger::new(Pubkey::new_unique());
        let identity = MatchIdentity::derive("convergence-test").unwrap();
        let (low, high) = ordered_keys();
        let pair = ParticipantPair::new(low, high).unwrap();
        let reader: Arc<dyn LedgerReader> = Arc::new(ledger.client(high));
        let detector = Arc::new(ConvergenceDetector::new(
            reader,
            identity.clone(),
            pair,
            ledger.addresses(&identity, &pair),
        ));
        Fixture {
            ledger,
            identity,
            pair,
            detector,
        }
    }

    async fn create(f: &Fixture, grow: bool, delivery: bool) {
        let leader = f.ledger.client(*f.pair.lower());
        let start = chrono::Utc::now().timestamp();
        leader.init_match(&f.identity, &f.pair, start).await.unwrap();
        if grow {
            leader.init_grow_state(&f.identity, &f.pair).await.unwrap();
        }
        if delivery {
            leader.init_delivery_state(&f.identity, &f.pair).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_poll_reports_missing_records() {
        let f = fixture();
        let check = f.detector.poll().await.unwrap();
        assert_eq!(check.state, ConvergenceState::default());
        assert!(check.match_record.is_none());
    }

    #[tokio::test]
    async fn test_primary_alone_is_not_convergence() {
        let f = fixture();
        create(&f, true, false).await;

        let check = f.detector.poll().await.unwrap();
        assert!(check.state.match_record_exists);
        assert!(check.state.dependent_a_exists);
        assert!(!check.state.is_converged());
        assert_eq!(check.state.pending(), vec!["delivery record"]);
    }

    #[tokio::test]
    async fn test_poll_has_no_side_effects() {
        let f = fixture();
        for _ in 0..3 {
            f.detector.poll().await.unwrap();
        }
        assert!(!f.ledger.account_exists(&f.detector.addresses().match_state));
    }

    #[tokio::test]
    async fn test_malformed_primary_record() {
        let f = fixture();
        f.ledger
            .store_raw(f.detector.addresses().match_state, vec![0u8; 4]);
        assert!(matches!(
            f.detector.poll().await,
            Err(ConvergenceError::Malformed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_premature_dismissal() {
        let f = fixture();
        create(&f, true, false).await;

        let guard = Arc::new(DismissalGuard::new());
        let (tx, mut rx) = mpsc::channel(64);
        let task = tokio::spawn(f.detector.clone().run(
            Arc::new(PollStrategy::new(Duration::from_secs(3))),
            guard.clone(),
            tx,
        ));

        for _ in 0..5 {
            match rx.recv().await.unwrap() {
                DetectorEvent::Progress(StatusText::WaitingForInitialization { pending }) => {
                    assert_eq!(pending, vec!["delivery record"]);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(!guard.has_fired());
        task.abort();
    }

    #[tokio::test]
    async fn test_observed_primary_still_reads_dependents() {
        let f = fixture();
        create(&f, false, false).await;
        let data = f
            .ledger
            .client(*f.pair.higher())
            .get_account_data(&f.detector.addresses().match_state)
            .await
            .unwrap();

        let check = f.detector.observe(data.as_deref()).await.unwrap();
        assert!(check.state.match_record_exists);
        assert!(!check.state.is_converged());

        let leader = f.ledger.client(*f.pair.lower());
        leader.init_grow_state(&f.identity, &f.pair).await.unwrap();
        leader.init_delivery_state(&f.identity, &f.pair).await.unwrap();

        let check = f.detector.observe(data.as_deref()).await.unwrap();
        assert!(check.state.is_converged());
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_paths_single_event() {
        let f = fixture();
        create(&f, true, true).await;

        let guard = Arc::new(DismissalGuard::new());
        let (tx, mut rx) = mpsc::channel(64);
        let reader: Arc<dyn LedgerReader> = Arc::new(f.ledger.client(*f.pair.higher()));
        tokio::spawn(f.detector.clone().run(
            Arc::new(PollStrategy::new(Duration::from_secs(3))),
            guard.clone(),
            tx.clone(),
        ));
        tokio::spawn(f.detector.clone().run(
            Arc::new(PushStrategy::new(reader)),
            guard.clone(),
            tx,
        ));

        // the push path never ticks; stop once events dry up
        let mut converged = 0;
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
            if let DetectorEvent::Converged { record, .. } = event {
                assert_eq!(record.match_id, f.identity.numeric_id());
                converged += 1;
            }
        }
        assert_eq!(converged, 1);
        assert!(guard.has_fired());
    }
}
