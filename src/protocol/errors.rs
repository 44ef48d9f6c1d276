use thiserror::Error;

use super::message::MessageType;

/// Fatal errors: the shared-order assumption is broken and the session
/// cannot continue. The handler halts on the first one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    /// Sequence number did not strictly increase.
    #[error("sequence number not increasing: previous {previous}, found {found}")]
    SequenceNotIncreasing { previous: u64, found: u64 },

    /// Minimum sequence number moved backwards.
    #[error("minimum sequence number regressed: previous {previous}, found {found}")]
    MinimumSequenceRegression { previous: u64, found: u64 },

    /// Minimum sequence number is ahead of the op's own sequence number.
    #[error("minimum sequence number {minimum} is above sequence number {sequence}")]
    MinimumAboveSequence { minimum: u64, sequence: u64 },
}

/// Recoverable conditions: the op payload does not match its declared kind.
/// The op is dropped and the session continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedOp {
    /// The op kind requires a payload and none was present.
    #[error("{kind} op at sequence {sequence_number} is missing its payload")]
    MissingPayload {
        kind: MessageType,
        sequence_number: u64,
    },

    /// The payload is present but has the wrong shape.
    #[error("{kind} op at sequence {sequence_number} has an invalid payload: {reason}")]
    InvalidPayload {
        kind: MessageType,
        sequence_number: u64,
        reason: String,
    },

    /// The op kind requires an originating client and none was present.
    #[error("{kind} op at sequence {sequence_number} has no originating client")]
    MissingClientId {
        kind: MessageType,
        sequence_number: u64,
    },
}

/// Errors returned by [`ProtocolOpHandler::process_message`](super::ProtocolOpHandler::process_message).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("protocol violation: {0}")]
    Violation(#[from] ProtocolViolation),

    /// The handler already observed a violation. All later ops return this.
    #[error("protocol handler is halted")]
    Halted,
}

/// Errors from summary capture and load.
#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("summary is missing blob {0:?}")]
    MissingBlob(&'static str),

    #[error("summary entry {0:?} is not a blob")]
    NotABlob(&'static str),

    #[error("failed to decode summary blob {blob:?}: {source}")]
    Decode {
        blob: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode summary: {0}")]
    Encode(#[source] serde_json::Error),

    /// The decoded state breaks a protocol invariant.
    #[error("summary state is invalid: {0}")]
    InvalidState(String),
}

/// Errors from the outbound side of the quorum.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuorumError {
    #[error("no pending proposal at sequence {0}")]
    NoSuchProposal(u64),
}
