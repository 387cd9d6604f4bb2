//! Core types for match-start coordination

use ledger_types::{IdentityError, MatchIdentity, ParticipantId, ParticipantPair};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// The local participant and the match it is trying to start
#[derive(Clone)]
pub struct IdentityContext {
    local: ParticipantId,
    session_token: String,
    identity: MatchIdentity,
}

impl IdentityContext {
    /// Create a new context, deriving the match identity from its token
    pub fn new(
        local: ParticipantId,
        session_token: impl Into<String>,
        match_token: &str,
    ) -> Result<Self, IdentityError> {
        Ok(Self {
            local,
            session_token: session_token.into(),
            identity: MatchIdentity::derive(match_token)?,
        })
    }

    /// Local wallet
    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    /// Bearer credential for the lobby service
    pub fn session_token(&self) -> &str {
        &self.session_token
    }

    /// Identity derived from the match token
    pub fn identity(&self) -> &MatchIdentity {
        &self.identity
    }
}

impl fmt::Debug for IdentityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityContext")
            .field("local", &self.local)
            .field("session_token", &"<redacted>")
            .field("identity", &self.identity)
            .finish()
    }
}

/// Which side of the protocol this client plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    /// Submits the initialization sequence
    Leader,
    /// Waits for the leader's records and deposits its stake
    Follower,
}

/// Lobby snapshot of who is present and ready
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchStatus {
    pub all_ready: bool,
    #[serde(default, with = "base58_keys")]
    pub participants: Vec<ParticipantId>,
    #[serde(default, with = "base58_keys")]
    pub ready_participants: Vec<ParticipantId>,
    #[serde(default)]
    pub settlement_address_lower: Option<String>,
    #[serde(default)]
    pub settlement_address_higher: Option<String>,
}

impl MatchStatus {
    /// Everyone is ready and both settlement addresses are known
    pub fn is_complete(&self) -> bool {
        self.all_ready
            && self.settlement_address_lower.is_some()
            && self.settlement_address_higher.is_some()
    }

    /// The on-chain pair from the settlement addresses
    pub fn settlement_pair(&self) -> Result<ParticipantPair, StatusError> {
        let lower = parse_settlement(self.settlement_address_lower.as_deref())?;
        let higher = parse_settlement(self.settlement_address_higher.as_deref())?;
        Ok(ParticipantPair::new(lower, higher)?)
    }
}

fn parse_settlement(address: Option<&str>) -> Result<Pubkey, StatusError> {
    let address = address.ok_or(StatusError::MissingSettlementAddress)?;
    Pubkey::from_str(address).map_err(|_| StatusError::InvalidSettlementAddress(address.to_string()))
}

/// A complete-looking snapshot that cannot be turned into a pair
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatusError {
    #[error("Settlement address missing")]
    MissingSettlementAddress,

    #[error("Invalid settlement address: {0}")]
    InvalidSettlementAddress(String),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Base58 string encoding for lists of public keys
mod base58_keys {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use solana_sdk::pubkey::Pubkey;
    use std::str::FromStr;

    /// Serialize keys as base58 strings
    pub fn serialize<S: Serializer>(keys: &[Pubkey], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(keys.iter().map(|k| k.to_string()))
    }

    /// Deserialize base58 strings into keys
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Pubkey>, D::Error> {
        let raw = Vec::<String>::deserialize(deserializer)?;
        raw.iter()
            .map(|s| Pubkey::from_str(s).map_err(|_| D::Error::custom(format!("invalid key {s}"))))
            .collect()
    }
}

/// Existence of the three initialization records, from a single pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvergenceState {
    pub match_record_exists: bool,
    /// Grow record
    pub dependent_a_exists: bool,
    /// Delivery record
    pub dependent_b_exists: bool,
}

impl ConvergenceState {
    /// All three records exist
    pub fn is_converged(&self) -> bool {
        self.match_record_exists && self.dependent_a_exists && self.dependent_b_exists
    }

    /// Human-readable names of the records still missing
    pub fn pending(&self) -> Vec<&'static str> {
        let mut pending = Vec::new();
        if !self.match_record_exists {
            pending.push("match record");
        }
        if !self.dependent_a_exists {
            pending.push("grow record");
        }
        if !self.dependent_b_exists {
            pending.push("delivery record");
        }
        pending
    }
}

/// Coarse progress shown to the player
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusText {
    Preparing,
    WaitingForOpponent,
    Signing,
    WaitingForInitialization { pending: Vec<&'static str> },
    Staking,
    RetryingAfterRateLimit,
    Ready,
    Error(String),
}

impl fmt::Display for StatusText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusText::Preparing => write!(f, "preparing"),
            StatusText::WaitingForOpponent => write!(f, "waiting for opponent"),
            StatusText::Signing => write!(f, "signing"),
            StatusText::WaitingForInitialization { pending } if pending.is_empty() => {
                write!(f, "waiting for initialization")
            }
            StatusText::WaitingForInitialization { pending } => {
                write!(f, "waiting for initialization of {}", pending.join(", "))
            }
            StatusText::Staking => write!(f, "staking"),
            StatusText::RetryingAfterRateLimit => write!(f, "retrying after rate limit"),
            StatusText::Ready => write!(f, "ready"),
            StatusText::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Publishes the latest status text; cheap to clone into tasks
#[derive(Clone)]
pub struct ProgressReporter {
    tx: Arc<watch::Sender<StatusText>>,
}

impl ProgressReporter {
    /// Create a new reporter starting at `Preparing`
    pub fn new() -> Self {
        let (tx, _) = watch::channel(StatusText::Preparing);
        Self { tx: Arc::new(tx) }
    }

    /// Publish `status`; unchanged values wake no one
    pub fn set(&self, status: StatusText) {
        self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                tracing::debug!("Status: {}", status);
                *current = status;
                true
            }
        });
    }

    /// Last published status
    pub fn current(&self) -> StatusText {
        self.tx.borrow().clone()
    }

    /// Receiver that sees every later change
    pub fn subscribe(&self) -> watch::Receiver<StatusText> {
        self.tx.subscribe()
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Rejected state machine edge
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: String,
    pub to: String,
}

fn invalid(from: &impl fmt::Debug, to: &impl fmt::Debug) -> InvalidTransition {
    InvalidTransition {
        from: format!("{from:?}"),
        to: format!("{to:?}"),
    }
}

/// Leader-side progress through the initialization sequence
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SubmissionState {
    #[default]
    NotStarted,
    AwaitingRole,
    Submitting,
    AwaitingConfirmation,
    InitializingDependents,
    Complete,
    Failed(String),
}

impl SubmissionState {
    /// No further transitions out of this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubmissionState::Complete | SubmissionState::Failed(_))
    }

    /// Validate and apply one edge
    pub fn transition(&self, next: SubmissionState) -> Result<SubmissionState, InvalidTransition> {
        use SubmissionState::*;
        let allowed = matches!(
            (self, &next),
            (NotStarted, AwaitingRole)
                | (AwaitingRole, Submitting)
                | (Submitting, AwaitingConfirmation)
                | (Submitting, InitializingDependents)
                | (Submitting, Failed(_))
                | (AwaitingConfirmation, InitializingDependents)
                | (AwaitingConfirmation, Failed(_))
                | (InitializingDependents, Complete)
                | (InitializingDependents, Failed(_))
        );
        if allowed {
            Ok(next)
        } else {
            Err(invalid(self, &next))
        }
    }
}

/// Per-client protocol phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolPhase {
    Idle,
    AwaitingBothReady,
    RoleDetermined(Role),
    Submitting,
    AwaitingDependentRecords,
    Converged,
    Dismissed,
    Failed(String),
}

impl ProtocolPhase {
    /// Validate and apply one edge.
    ///
    /// `Failed` is only entered from `Submitting`. The detector keeps
    /// running after a failed submission, so `Failed -> Converged` is legal.
    pub fn transition(&self, next: ProtocolPhase) -> Result<ProtocolPhase, InvalidTransition> {
        use ProtocolPhase::*;
        let allowed = matches!(
            (self, &next),
            (Idle, AwaitingBothReady)
                | (AwaitingBothReady, RoleDetermined(_))
                | (RoleDetermined(Role::Leader), Submitting)
                | (RoleDetermined(Role::Follower), AwaitingDependentRecords)
                | (Submitting, AwaitingDependentRecords)
                | (Submitting, Converged)
                | (Submitting, Failed(_))
                | (AwaitingDependentRecords, Converged)
                | (Failed(_), Converged)
                | (Converged, Dismissed)
        );
        if allowed {
            Ok(next)
        } else {
            Err(invalid(self, &next))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_status_decodes_lobby_json() {
        let a = Pubkey::new_unique();
        let b = Pubkey::new_unique();
        let json = serde_json::json!({
            "allReady": true,
            "participants": [a.to_string(), b.to_string()],
            "readyParticipants": [a.to_string()],
            "settlementAddressLower": a.to_string(),
            "settlementAddressHigher": b.to_string(),
        });

        let status: MatchStatus = serde_json::from_value(json).unwrap();
        assert!(status.is_complete());
        assert_eq!(status.participants, vec![a, b]);
        assert_eq!(status.ready_participants, vec![a]);

        let pair = status.settlement_pair().unwrap();
        assert!(pair.contains(&a) && pair.contains(&b));
    }

    #[test]
    fn test_incomplete_status() {
        let status: MatchStatus = serde_json::from_str(r#"{"allReady": true}"#).unwrap();
        assert!(!status.is_complete());
        assert_eq!(
            status.settlement_pair(),
            Err(StatusError::MissingSettlementAddress)
        );
    }

    #[test]
    fn test_convergence_requires_all_three() {
        let mut state = ConvergenceState {
            match_record_exists: true,
            dependent_a_exists: true,
            dependent_b_exists: false,
        };
        assert!(!state.is_converged());
        assert_eq!(state.pending(), vec!["delivery record"]);

        state.dependent_b_exists = true;
        assert!(state.is_converged());
        assert!(state.pending().is_empty());
    }

    #[test]
    fn test_status_text_display() {
        let text = StatusText::WaitingForInitialization {
            pending: vec!["grow record", "delivery record"],
        };
        assert_eq!(
            text.to_string(),
            "waiting for initialization of grow record, delivery record"
        );
        assert_eq!(StatusText::Error("boom".into()).to_string(), "error: boom");
    }

    #[test]
    fn test_progress_reporter_publishes_changes() {
        let progress = ProgressReporter::new();
        let mut rx = progress.subscribe();
        progress.set(StatusText::Signing);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), StatusText::Signing);

        progress.set(StatusText::Signing);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_submission_state_edges() {
        let state = SubmissionState::NotStarted;
        let state = state.transition(SubmissionState::AwaitingRole).unwrap();
        let state = state.transition(SubmissionState::Submitting).unwrap();
        let state = state
            .transition(SubmissionState::InitializingDependents)
            .unwrap();
        let state = state.transition(SubmissionState::Complete).unwrap();
        assert!(state.is_terminal());
        assert!(state.transition(SubmissionState::Submitting).is_err());
    }

    #[test]
    fn test_phase_failed_only_from_submitting() {
        let waiting = ProtocolPhase::AwaitingDependentRecords;
        assert!(waiting
            .transition(ProtocolPhase::Failed("x".into()))
            .is_err());

        let submitting = ProtocolPhase::Submitting;
        let failed = submitting
            .transition(ProtocolPhase::Failed("x".into()))
            .unwrap();
        assert_eq!(
            failed.transition(ProtocolPhase::Converged).unwrap(),
            ProtocolPhase::Converged
        );
    }

    #[test]
    fn test_follower_never_submits() {
        let follower = ProtocolPhase::RoleDetermined(Role::Follower);
        assert!(follower.transition(ProtocolPhase::Submitting).is_err());
        assert!(follower
            .transition(ProtocolPhase::AwaitingDependentRecords)
            .is_ok());
    }

    #[test]
    fn test_identity_context_redacts_token() {
        let ctx = IdentityContext::new(Pubkey::new_unique(), "secret-jwt", "match-1").unwrap();
        let debug = format!("{ctx:?}");
        assert!(!debug.contains("secret-jwt"));
        assert_eq!(ctx.session_token(), "secret-jwt");
    }
}
