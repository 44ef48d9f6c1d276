//! Session hosting for the protocol core.
//!
//! Runs a [`ProtocolOpHandler`](crate::protocol::ProtocolOpHandler) on its
//! own thread behind a single-writer feed, supplies a local sequencer for
//! producing ordered streams, and checks recorded runs for agreement.

pub mod checker;
pub mod config;
pub mod runner;
pub mod sequencer;
pub mod submitter;

#[cfg(test)]
mod tests;

pub use checker::{CheckResult, CheckStats, Checker, History, HistoryEntry, Violation, ViolationKind};
pub use config::{ConfigError, SessionConfig};
pub use runner::{spawn_session, FeedError, OpFeed, SessionCommand, SessionError, SessionHandle};
pub use sequencer::{ClientCursor, LocalSequencer, SequencerError};
pub use submitter::{ChannelSubmitter, OutboundOp};
