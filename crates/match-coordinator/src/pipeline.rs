//! Leader-side submission pipeline
//!
//! Creates the primary record, then the two dependent records, in that
//! order. Every step checks for the record before creating it and treats
//! "already exists" as success, so the whole sequence can be re-run after a
//! crash, a retry, or a race with another instance of the same client.

use crate::election;
use crate::retry::RetryPolicy;
use crate::types::{ProgressReporter, StatusText, SubmissionState};
use ledger_bridge::{fetch_record, Ledger, LedgerError};
use ledger_types::{
    DeliveryRecord, GrowRecord, MatchAddresses, MatchIdentity, MatchRecord, ParticipantId,
    ParticipantPair, RecordError,
};
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("Only the elected leader submits")]
    NotLeader,

    #[error("{step} still rate limited after {attempts} attempts")]
    RateLimited { step: Step, attempts: u32 },

    #[error("{step} record is malformed: {source}")]
    Malformed { step: Step, source: RecordError },

    #[error("{step} failed: {source}")]
    Ledger { step: Step, source: LedgerError },
}

impl SubmissionError {
    /// Worth re-running the whole pipeline later
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubmissionError::RateLimited { .. })
    }
}

/// One record-creating step, in submission order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Match,
    Grow,
    Delivery,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Match => write!(f, "init_match"),
            Step::Grow => write!(f, "init_grow_state"),
            Step::Delivery => write!(f, "init_delivery_state"),
        }
    }
}

impl Step {
    /// Grow and delivery records reference the primary record on chain
    pub fn is_dependent(&self) -> bool {
        !matches!(self, Step::Match)
    }

    fn address(&self, addresses: &MatchAddresses) -> Pubkey {
        match self {
            Step::Match => addresses.match_state,
            Step::Grow => addresses.grow_state,
            Step::Delivery => addresses.delivery_state,
        }
    }
}

/// How a step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Created(Signature),
    AlreadyPresent,
}

pub struct SubmissionPipeline {
    ledger: Arc<dyn Ledger>,
    identity: MatchIdentity,
    pair: ParticipantPair,
    addresses: MatchAddresses,
    retry: RetryPolicy,
    start_buffer_secs: i64,
    visibility_poll: Duration,
    progress: ProgressReporter,
    state: SubmissionState,
}

impl SubmissionPipeline {
    /// Fails with [`SubmissionError::NotLeader`] unless `local` is the
    /// lower participant of `pair`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<dyn Ledger>,
        local: &ParticipantId,
        identity: MatchIdentity,
        pair: ParticipantPair,
        addresses: MatchAddresses,
        retry: RetryPolicy,
        start_buffer_secs: i64,
        visibility_poll: Duration,
        progress: ProgressReporter,
    ) -> Result<Self, SubmissionError> {
        if !election::should_submit(local, &pair) {
            return Err(SubmissionError::NotLeader);
        }
        Ok(Self {
            ledger,
            identity,
            pair,
            addresses,
            retry,
            start_buffer_secs,
            visibility_poll,
            progress,
            state: SubmissionState::AwaitingRole,
        })
    }

    /// Current submission state
    pub fn state(&self) -> &SubmissionState {
        &self.state
    }

    fn advance(&mut self, next: SubmissionState) {
        match self.state.transition(next) {
            Ok(next) => self.state = next,
            Err(e) => tracing::error!("Submission state machine: {}", e),
        }
    }

    /// Run the full sequence
    pub async fn submit(&mut self) -> Result<(), SubmissionError> {
        self.advance(SubmissionState::Submitting);
        match self.run_steps().await {
            Ok(()) => {
                self.advance(SubmissionState::Complete);
                tracing::info!("Initialization sequence complete for {}", self.identity);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Initialization sequence failed: {}", e);
                self.advance(SubmissionState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn run_steps(&mut self) -> Result<(), SubmissionError> {
        if let StepOutcome::Created(signature) = self.run_step(Step::Match).await? {
            tracing::info!("Match record created: {}", signature);
            self.advance(SubmissionState::AwaitingConfirmation);
        }
        // dependent records reference the primary record on chain
        self.await_match_visible()
            .await
            .map_err(|e| step_error(Step::Match, e, 1))?;

        self.advance(SubmissionState::InitializingDependents);
        for step in [Step::Grow, Step::Delivery] {
            if let StepOutcome::Created(signature) = self.run_step(step).await? {
                tracing::info!("{} created: {}", step, signature);
            }
        }
        Ok(())
    }

    async fn run_step(&self, step: Step) -> Result<StepOutcome, SubmissionError> {
        let attempts = self.retry.max_attempts.max(1);
        self.retry
            .run(
                &step.to_string(),
                |_attempt| self.attempt(step),
                |_, _| self.progress.set(StatusText::RetryingAfterRateLimit),
            )
            .await
            .map_err(|e| step_error(step, e, attempts))
    }

    /// One check-then-create attempt
    async fn attempt(&self, step: Step) -> Result<StepOutcome, LedgerError> {
        loop {
            if self.record_exists(step).await? {
                tracing::debug!("{} skipped, record exists", step);
                return Ok(StepOutcome::AlreadyPresent);
            }

            self.progress.set(StatusText::Signing);
            match self.create(step).await {
                Ok(signature) => return Ok(StepOutcome::Created(signature)),
                Err(LedgerError::AlreadyExists(_)) => {
                    tracing::debug!("{} lost a creation race", step);
                    return Ok(StepOutcome::AlreadyPresent);
                }
                // only dependents wait; their prerequisite is the primary record
                Err(LedgerError::PreconditionNotMet(reason)) if step.is_dependent() => {
                    tracing::debug!("{} waiting for prerequisite: {}", step, reason);
                    tokio::time::sleep(self.visibility_poll).await;
                }
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    // the write may have landed even though the call failed
                    if self.record_exists(step).await? {
                        tracing::warn!("{} reported {} but the record exists", step, e);
                        return Ok(StepOutcome::AlreadyPresent);
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn create(&self, step: Step) -> Result<Signature, LedgerError> {
        match step {
            Step::Match => {
                let start_ts = chrono::Utc::now().timestamp() + self.start_buffer_secs;
                self.ledger
                    .init_match(&self.identity, &self.pair, start_ts)
                    .await
            }
            Step::Grow => self.ledger.init_grow_state(&self.identity, &self.pair).await,
            Step::Delivery => {
                self.ledger
                    .init_delivery_state(&self.identity, &self.pair)
                    .await
            }
        }
    }

    /// Decodes and validates, so a record at the right address with the
    /// wrong content is an error rather than "exists"
    async fn record_exists(&self, step: Step) -> Result<bool, LedgerError> {
        let reader = self.ledger.as_ref();
        let address = step.address(&self.addresses);
        match step {
            Step::Match => match fetch_record::<MatchRecord>(reader, &address).await? {
                Some(record) => {
                    record.validate(&self.identity, &self.pair)?;
                    Ok(true)
                }
                None => Ok(false),
            },
            Step::Grow => match fetch_record::<GrowRecord>(reader, &address).await? {
                Some(record) => {
                    record.validate(&self.identity)?;
                    Ok(true)
                }
                None => Ok(false),
            },
            Step::Delivery => match fetch_record::<DeliveryRecord>(reader, &address).await? {
                Some(record) => {
                    record.validate(&self.identity)?;
                    Ok(true)
                }
                None => Ok(false),
            },
        }
    }

    /// Wait until the primary record can be read back. Unbounded; the
    /// session's deadline cancels it.
    async fn await_match_visible(&self) -> Result<(), LedgerError> {
        loop {
            match self.record_exists(Step::Match).await {
                Ok(true) => return Ok(()),
                Ok(false) => tracing::debug!("Match record not visible yet"),
                Err(e) if e.is_transient() => tracing::debug!("Visibility check: {}", e),
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.visibility_poll).await;
        }
    }
}

fn step_error(step: Step, error: LedgerError, attempts: u32) -> SubmissionError {
    match error {
        LedgerError::RateLimited(_) => SubmissionError::RateLimited { step, attempts },
        LedgerError::Malformed(source) => SubmissionError::Malformed { step, source },
        source => SubmissionError::Ledger { step, source },
    }
}
