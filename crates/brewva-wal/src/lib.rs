//! Brewva WAL - durable record of every accepted inbound turn.
//!
//! The log is append-only JSON lines: full records on accept, small mark
//! lines on state transitions. Replay folds the lines back into records;
//! startup recovery re-enqueues everything that never reached a terminal
//! mark. Compaction periodically rewrites the file without aged-out
//! terminal records.

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod store;

pub use store::{AppendOutcome, TurnWal, WalError, WalRecord, WalState};
