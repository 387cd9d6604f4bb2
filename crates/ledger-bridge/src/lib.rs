//! Ledger Bridge - the coordinator's view of the ledger
//!
//! Handles everything that talks to the game program:
//! - Reading records and subscribing to record changes
//! - Building and submitting the record-creation instructions
//! - An in-memory ledger with fault injection for tests and local runs

pub mod client;
pub mod connection;
pub mod error;
pub mod instructions;
pub mod rpc;
pub mod simulated;

pub use client::{fetch_record, AccountUpdate, AccountUpdates, Ledger, LedgerReader, LedgerWriter};
pub use connection::LazyConnection;
pub use error::LedgerError;
pub use instructions::InstructionBuilder;
pub use rpc::{LedgerConfig, RpcLedger};
pub use simulated::{FaultTiming, LedgerOp, SimulatedClient, SimulatedLedger};
