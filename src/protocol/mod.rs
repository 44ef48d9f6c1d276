//! Replicated protocol core.
//!
//! Consumes a totally ordered op stream and reconstructs, identically on
//! every replica, the session membership, the proposal ledger, and the
//! session watermark.
//!
//! # Invariants
//!
//! 1. **Monotonic Sequence**: `sequence_number` strictly increases per applied op.
//! 2. **Monotonic Watermark**: `minimum_sequence_number` never decreases and never exceeds `sequence_number`.
//! 3. **Single Membership**: a client id appears in the member list at most once.
//! 4. **Final Resolution**: an approved or rejected proposal never returns to pending.
//! 5. **Veto Wins**: a proposal rejected before the MSN passes it is never committed.

pub mod errors;
pub mod handler;
pub mod message;
pub mod quorum;
pub mod summary;


pub use errors::{MalformedOp, ProtocolError, ProtocolViolation, QuorumError, SummaryError};
pub use handler::{HandlerStatus, ProcessOutcome, ProtocolOpHandler, ProtocolState};
pub use message::{ClientJoin, MessageType, ProposalContents, ProtocolOp, SequencedMessage};
pub use quorum::{
    CommittedProposal, LocalProposalStatus, NullSubmitter, OpSubmitter, PendingProposal, Quorum,
    QuorumEvent, QuorumSnapshot, SequencedClient, SequencedProposal,
};
pub use summary::{DocumentAttributes, SummaryObject, SummaryTree};
