//! One participant's coordination session
//!
//! Waits for both players to be ready, elects the leader, then runs the
//! leader's submission (or the follower's join) alongside the convergence
//! detector until the three records exist. Every background task belongs
//! to the session's `JoinSet` and stops when the session is dropped.

use crate::config::{ConfigError, CoordinatorConfig};
use crate::convergence::{
    ConvergenceDetector, DetectionStrategy, DetectorEvent, PollStrategy, PushStrategy,
};
use crate::dismissal::{DetectionPath, DismissalGuard};
use crate::election;
use crate::joiner::{JoinError, JoinOutcome, Joiner};
use crate::lobby::LobbyService;
use crate::pipeline::{SubmissionError, SubmissionPipeline};
use crate::status_channel::MatchStatusChannel;
use crate::types::{
    IdentityContext, ProgressReporter, ProtocolPhase, Role, StatusError, StatusText,
    SubmissionState,
};
use ledger_bridge::{Ledger, LedgerReader};
use ledger_types::{MatchAddresses, MatchClock, MatchRecord, ParticipantId, ParticipantPair};
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;

#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("Lobby status stream ended before everyone was ready")]
    LobbyClosed,

    #[error("Invalid lobby snapshot: {0}")]
    Status(#[from] StatusError),

    #[error("{0} is not a participant of this match")]
    NotAParticipant(ParticipantId),

    #[error(transparent)]
    Submission(#[from] SubmissionError),

    #[error("Convergence detection stopped")]
    DetectorStopped,

    #[error("Gave up after {0:?} waiting for the match to start")]
    TimedOut(Duration),

    #[error("Session already ran")]
    AlreadyRan,
}

/// Everything known once the waiting screen is dismissed
#[derive(Debug)]
pub struct CoordinationOutcome {
    pub role: Role,
    pub pair: ParticipantPair,
    /// Recorded from the primary record at dismissal
    pub clock: MatchClock,
    pub detected_by: DetectionPath,
    /// Leader only, when the pipeline finished before dismissal
    pub submission: Option<SubmissionState>,
    /// Follower only
    pub join: Option<Result<JoinOutcome, JoinError>>,
}

pub struct CoordinationSession {
    context: IdentityContext,
    config: CoordinatorConfig,
    ledger: Arc<dyn Ledger>,
    reader: Arc<dyn LedgerReader>,
    lobby: Arc<dyn LobbyService>,
    program_id: Pubkey,
    lobby_push: bool,
    ledger_push: bool,
    phase: ProtocolPhase,
    guard: Arc<DismissalGuard>,
    progress: ProgressReporter,
    tasks: JoinSet<()>,
    clock: Option<MatchClock>,
}

impl CoordinationSession {
    /// Start building a session for the local participant
    pub fn builder<L: Ledger + 'static>(
        context: IdentityContext,
        ledger: Arc<L>,
        lobby: Arc<dyn LobbyService>,
        program_id: Pubkey,
    ) -> CoordinationSessionBuilder {
        CoordinationSessionBuilder::new(context, ledger, lobby, program_id)
    }

    /// Latest status text; updated on every detector tick
    pub fn status(&self) -> watch::Receiver<StatusText> {
        self.progress.subscribe()
    }

    /// Current protocol phase
    pub fn phase(&self) -> &ProtocolPhase {
        &self.phase
    }

    /// Authoritative start and end, once dismissed
    pub fn clock(&self) -> Option<MatchClock> {
        self.clock
    }

    /// Whether the waiting screen has been dismissed
    pub fn is_dismissed(&self) -> bool {
        self.guard.has_fired()
    }

    /// Run to dismissal, or until the configured deadline
    pub async fn run(&mut self) -> Result<CoordinationOutcome, CoordinationError> {
        let result = match self.config.max_wait() {
            Some(limit) => match tokio::time::timeout(limit, self.coordinate()).await {
                Ok(result) => result,
                Err(_) => Err(CoordinationError::TimedOut(limit)),
            },
            None => self.coordinate().await,
        };

        if let Err(e) = &result {
            tracing::error!("Coordination failed: {}", e);
            self.progress.set(StatusText::Error(e.to_string()));
            self.tasks.abort_all();
        }
        result
    }

    fn advance(&mut self, next: ProtocolPhase) {
        match self.phase.transition(next) {
            Ok(next) => {
                tracing::debug!("Phase: {:?}", next);
                self.phase = next;
            }
            Err(e) => tracing::error!("Protocol state machine: {}", e),
        }
    }

    fn strategies(&self) -> Vec<Arc<dyn DetectionStrategy>> {
        let mut strategies: Vec<Arc<dyn DetectionStrategy>> = vec![Arc::new(PollStrategy::new(
            self.config.convergence_poll_interval(),
        ))];
        if self.ledger_push {
            strategies.push(Arc::new(PushStrategy::new(self.reader.clone())));
        }
        strategies
    }

    async fn await_both_ready(&mut self) -> Result<ParticipantPair, CoordinationError> {
        self.advance(ProtocolPhase::AwaitingBothReady);
        self.progress.set(StatusText::WaitingForOpponent);

        let mut channel =
            MatchStatusChannel::new(self.lobby.clone(), self.config.status_poll_interval());
        if !self.lobby_push {
            channel = channel.polling_only();
        }
        let mut subscription = channel.subscribe();
        let status = subscription
            .wait_until_complete()
            .await
            .ok_or(CoordinationError::LobbyClosed)?;

        Ok(status.settlement_pair()?)
    }

    async fn coordinate(&mut self) -> Result<CoordinationOutcome, CoordinationError> {
        if self.phase != ProtocolPhase::Idle {
            return Err(CoordinationError::AlreadyRan);
        }

        let pair = self.await_both_ready().await?;
        let local = *self.context.local();
        let role =
            election::role_of(&local, &pair).ok_or(CoordinationError::NotAParticipant(local))?;
        self.advance(ProtocolPhase::RoleDetermined(role));

        let identity = self.context.identity().clone();
        let addresses = MatchAddresses::derive(&self.program_id, &identity, &pair);
        tracing::info!(
            "Match {} ready: leader {}, local role {:?}",
            identity,
            pair.lower(),
            role
        );

        let detector = Arc::new(ConvergenceDetector::new(
            self.reader.clone(),
            identity.clone(),
            pair,
            addresses,
        ));
        let (events_tx, mut events) = mpsc::channel(32);
        for strategy in self.strategies() {
            self.tasks.spawn(
                detector
                    .clone()
                    .run(strategy, self.guard.clone(), events_tx.clone()),
            );
        }
        drop(events_tx);

        let (join_tx, mut join_rx) = oneshot::channel();
        let pipeline = match role {
            Role::Leader => {
                self.advance(ProtocolPhase::Submitting);
                Some(SubmissionPipeline::new(
                    self.ledger.clone(),
                    &local,
                    identity.clone(),
                    pair,
                    addresses,
                    self.config.retry.clone(),
                    self.config.start_buffer_secs,
                    self.config.confirm_poll_interval(),
                    self.progress.clone(),
                )?)
            }
            Role::Follower => {
                self.advance(ProtocolPhase::AwaitingDependentRecords);
                let joiner = Arc::new(Joiner::new(
                    self.ledger.clone(),
                    local,
                    identity.clone(),
                    pair,
                    addresses,
                    self.config.retry.clone(),
                    self.progress.clone(),
                ));
                let strategies = self.strategies();
                self.tasks.spawn(async move {
                    let _ = join_tx.send(joiner.run(strategies).await);
                });
                None
            }
        };

        let submit = async move {
            let mut pipeline = pipeline?;
            let result = pipeline.submit().await;
            Some((result, pipeline.state().clone()))
        };
        tokio::pin!(submit);

        let mut submit_done = role != Role::Leader;
        let mut join_done = role != Role::Follower;
        let mut submission = None;
        let mut join = None;
        // set once the local side has failed; its error stays on screen
        let mut local_failure = false;

        loop {
            tokio::select! {
                finished = &mut submit, if !submit_done => {
                    submit_done = true;
                    let Some((result, state)) = finished else { continue };
                    submission = Some(state);
                    match result {
                        Ok(()) => {
                            self.advance(ProtocolPhase::AwaitingDependentRecords);
                            if let Some(record) = self.check_after_submission(&detector).await {
                                return Ok(self.finish(
                                    role, pair, DetectionPath::PostSubmission, &record, submission, None,
                                ));
                            }
                        }
                        Err(e) => {
                            local_failure = true;
                            self.advance(ProtocolPhase::Failed(e.to_string()));
                            self.progress.set(StatusText::Error(e.to_string()));
                        }
                    }
                }
                joined = &mut join_rx, if !join_done => {
                    join_done = true;
                    if let Ok(result) = joined {
                        if let Err(e) = &result {
                            tracing::error!("Stake deposit failed: {}", e);
                            local_failure = true;
                            self.progress.set(StatusText::Error(e.to_string()));
                        }
                        join = Some(result);
                    }
                }
                event = events.recv() => match event {
                    Some(DetectorEvent::Progress(text)) => {
                        if !local_failure {
                            self.progress.set(text);
                        }
                    }
                    Some(DetectorEvent::Converged { path, record }) => {
                        if !join_done {
                            // the stake record predates convergence; the join is close behind
                            join = (&mut join_rx).await.ok();
                        }
                        return Ok(self.finish(role, pair, path, &record, submission, join));
                    }
                    None => return Err(CoordinationError::DetectorStopped),
                },
            }
        }
    }

    /// The leader's direct look right after its own submission succeeded
    async fn check_after_submission(&self, detector: &ConvergenceDetector) -> Option<MatchRecord> {
        match detector.poll().await {
            Ok(check) if check.state.is_converged() => {
                let record = check.match_record?;
                self.guard
                    .fire_from(DetectionPath::PostSubmission)
                    .then_some(record)
            }
            Ok(check) => {
                self.progress.set(StatusText::WaitingForInitialization {
                    pending: check.state.pending(),
                });
                None
            }
            Err(e) => {
                tracing::warn!("Post-submission check failed: {}", e);
                None
            }
        }
    }

    fn finish(
        &mut self,
        role: Role,
        pair: ParticipantPair,
        detected_by: DetectionPath,
        record: &MatchRecord,
        submission: Option<SubmissionState>,
        join: Option<Result<JoinOutcome, JoinError>>,
    ) -> CoordinationOutcome {
        self.advance(ProtocolPhase::Converged);
        let clock = MatchClock::from(record);
        self.clock = Some(clock);
        self.advance(ProtocolPhase::Dismissed);
        self.progress.set(StatusText::Ready);
        self.tasks.abort_all();

        tracing::info!(
            "Match {} dismissed via {}: start {} end {}",
            self.context.identity(),
            detected_by,
            clock.start_ts,
            clock.end_ts
        );

        CoordinationOutcome {
            role,
            pair,
            clock,
            detected_by,
            submission,
            join,
        }
    }
}

/// Builder for [`CoordinationSession`]
pub struct CoordinationSessionBuilder {
    context: IdentityContext,
    ledger: Arc<dyn Ledger>,
    reader: Arc<dyn LedgerReader>,
    lobby: Arc<dyn LobbyService>,
    program_id: Pubkey,
    config: CoordinatorConfig,
    lobby_push: bool,
    ledger_push: bool,
}

impl CoordinationSessionBuilder {
    /// Create a new builder with default config and both push paths on
    pub fn new<L: Ledger + 'static>(
        context: IdentityContext,
        ledger: Arc<L>,
        lobby: Arc<dyn LobbyService>,
        program_id: Pubkey,
    ) -> Self {
        Self {
            context,
            ledger: ledger.clone(),
            reader: ledger,
            lobby,
            program_id,
            config: CoordinatorConfig::default(),
            lobby_push: true,
            ledger_push: true,
        }
    }

    /// Replace the default config
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Use the lobby's push channel (falls back to polling either way)
    pub fn lobby_push(mut self, enabled: bool) -> Self {
        self.lobby_push = enabled;
        self
    }

    /// Run the ledger push path next to the poll path
    pub fn ledger_push(mut self, enabled: bool) -> Self {
        self.ledger_push = enabled;
        self
    }

    /// Validate the config and build the session
    pub fn build(self) -> Result<CoordinationSession, ConfigError> {
        self.config.validate()?;
        Ok(CoordinationSession {
            context: self.context,
            config: self.config,
            ledger: self.ledger,
            reader: self.reader,
            lobby: self.lobby,
            program_id: self.program_id,
            lobby_push: self.lobby_push,
            ledger_push: self.ledger_push,
            phase: ProtocolPhase::Idle,
            guard: Arc::new(DismissalGuard::new()),
            progress: ProgressReporter::new(),
            tasks: JoinSet::new(),
            clock: None,
        })
    }
}
