//! Match-start coordination
//!
//! Two players who readied up in the lobby must agree, without talking to
//! each other, on who initializes the match on the ledger and on when the
//! match is ready to start.
//!
//! Architecture:
//! - Both clients elect the lexicographically lower participant as leader
//! - The leader creates the match record, then two dependent records;
//!   every step is check-then-create and safe to repeat
//! - The follower deposits its stake once the leader's stake record appears
//! - Both run a push path and a poll path over the same detector; a single
//!   latch makes sure only one of them dismisses the waiting screen

pub mod config;
pub mod convergence;
pub mod dismissal;
pub mod election;
pub mod joiner;
pub mod lobby;
pub mod pipeline;
pub mod retry;
pub mod session;
pub mod status_channel;
pub mod types;

pub use config::{ConfigError, CoordinatorConfig};
pub use convergence::{
    ConvergenceCheck, ConvergenceDetector, ConvergenceError, DetectionStrategy, DetectorEvent,
    PollStrategy, PushStrategy, Tick,
};
pub use dismissal::{DetectionPath, DismissalGuard};
pub use election::{elect, role_of, should_submit, sort_pair};
pub use joiner::{JoinError, JoinOutcome, Joiner};
pub use lobby::{HttpLobby, LobbyError, LobbyService, StatusUpdates};
pub use pipeline::{Step, StepOutcome, SubmissionError, SubmissionPipeline};
pub use retry::{Backoff, RetryPolicy, Transient};
pub use session::{
    CoordinationError, CoordinationOutcome, CoordinationSession, CoordinationSessionBuilder,
};
pub use status_channel::{MatchStatusChannel, StatusSubscription};
pub use types::{
    ConvergenceState, IdentityContext, InvalidTransition, MatchStatus, ProgressReporter,
    ProtocolPhase, Role, StatusError, StatusText, SubmissionState,
};

#[cfg(test)]
mod tests;
