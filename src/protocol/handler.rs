//! Protocol op handler: the entry point for applying one sequenced op.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::errors::{MalformedOp, ProtocolError, ProtocolViolation, SummaryError};
use super::message::{MessageType, ProtocolOp, SequencedMessage};
use super::quorum::{
    CommittedProposal, OpSubmitter, Quorum, QuorumEvent, QuorumSnapshot, SequencedClient,
    SequencedProposal,
};
use super::summary::{self, DocumentAttributes, SummaryTree};

// =============================================================================
// PROTOCOL STATE
// =============================================================================

/// Point-in-time export of the whole protocol state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolState {
    pub sequence_number: u64,
    pub minimum_sequence_number: u64,
    pub members: Vec<(String, SequencedClient)>,
    pub proposals: Vec<(u64, SequencedProposal, Vec<String>)>,
    pub values: Vec<(String, CommittedProposal)>,
}

impl ProtocolState {
    pub fn from_parts(sequence_number: u64, minimum_sequence_number: u64, snapshot: QuorumSnapshot) -> Self {
        ProtocolState {
            sequence_number,
            minimum_sequence_number,
            members: snapshot.members,
            proposals: snapshot.proposals,
            values: snapshot.values,
        }
    }

    pub fn quorum_snapshot(&self) -> QuorumSnapshot {
        QuorumSnapshot {
            members: self.members.clone(),
            proposals: self.proposals.clone(),
            values: self.values.clone(),
        }
    }

    /// Check the invariants a state reached by applying ops always satisfies.
    pub fn validate(&self) -> Result<(), String> {
        if self.minimum_sequence_number > self.sequence_number {
            return Err(format!(
                "minimum sequence number {} above sequence number {}",
                self.minimum_sequence_number, self.sequence_number
            ));
        }

        let mut seen = HashSet::new();
        for (client_id, client) in &self.members {
            if !seen.insert(client_id.as_str()) {
                return Err(format!("duplicate member {}", client_id));
            }
            if client.sequence_number > self.sequence_number {
                return Err(format!(
                    "member {} joined at {} after sequence number {}",
                    client_id, client.sequence_number, self.sequence_number
                ));
            }
        }

        let mut previous: Option<u64> = None;
        for (sequence_number, proposal, _) in &self.proposals {
            if *sequence_number != proposal.sequence_number {
                return Err(format!(
                    "proposal listed at {} carries sequence number {}",
                    sequence_number, proposal.sequence_number
                ));
            }
            if previous.is_some_and(|p| p >= *sequence_number) {
                return Err(format!("proposal {} out of order", sequence_number));
            }
            if *sequence_number < self.minimum_sequence_number
                || *sequence_number > self.sequence_number
            {
                return Err(format!(
                    "pending proposal {} outside [{}, {}]",
                    sequence_number, self.minimum_sequence_number, self.sequence_number
                ));
            }
            previous = Some(*sequence_number);
        }

        let mut keys = HashSet::new();
        for (key, committed) in &self.values {
            if !keys.insert(key.as_str()) {
                return Err(format!("duplicate committed key {}", key));
            }
            if key != &committed.key {
                return Err(format!("committed key {} stored under {}", committed.key, key));
            }
        }

        Ok(())
    }
}

// =============================================================================
// STATUS AND OUTCOME
// =============================================================================

/// Terminal status of the handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerStatus {
    Running,
    /// A protocol violation was observed. No further ops are applied.
    Halted,
}

/// Result of applying one op.
#[derive(Clone, Debug, PartialEq)]
pub enum ProcessOutcome {
    /// The op was applied and the sequence numbers advanced.
    Applied {
        sequence_number: u64,
        message_type: MessageType,
        /// Quorum changes caused by this op, in order.
        events: Vec<QuorumEvent>,
    },
    /// The payload did not match its kind and was ignored. The op still took
    /// its place in the order: the sequence numbers advanced and the MSN it
    /// carried was observed.
    Dropped {
        sequence_number: u64,
        error: MalformedOp,
        /// Quorum changes caused by the MSN this op carried.
        events: Vec<QuorumEvent>,
    },
}

// =============================================================================
// HANDLER
// =============================================================================

/// Owns the session sequence state and drives the quorum.
pub struct ProtocolOpHandler {
    branch_id: String,
    sequence_number: u64,
    minimum_sequence_number: u64,
    quorum: Quorum,
    status: HandlerStatus,
}

impl ProtocolOpHandler {
    /// Handler for a new session.
    pub fn new(branch_id: impl Into<String>, submitter: Box<dyn OpSubmitter>) -> Self {
        ProtocolOpHandler {
            branch_id: branch_id.into(),
            sequence_number: 0,
            minimum_sequence_number: 0,
            quorum: Quorum::new(submitter),
            status: HandlerStatus::Running,
        }
    }

    /// Handler starting from an exported state, e.g. for a late-joining client.
    pub fn from_state(
        branch_id: impl Into<String>,
        state: ProtocolState,
        submitter: Box<dyn OpSubmitter>,
    ) -> Result<Self, SummaryError> {
        state.validate().map_err(SummaryError::InvalidState)?;

        let quorum = Quorum::from_snapshot(
            state.minimum_sequence_number,
            state.quorum_snapshot(),
            submitter,
        );
        Ok(ProtocolOpHandler {
            branch_id: branch_id.into(),
            sequence_number: state.sequence_number,
            minimum_sequence_number: state.minimum_sequence_number,
            quorum,
            status: HandlerStatus::Running,
        })
    }

    /// Handler starting from a summary produced by [`ProtocolOpHandler::capture_summary`].
    pub fn from_summary(summary: &SummaryTree, submitter: Box<dyn OpSubmitter>) -> Result<Self, SummaryError> {
        let (attributes, state) = summary::load_summary(summary)?;
        Self::from_state(attributes.branch, state, submitter)
    }

    /// Apply one sequenced op.
    ///
    /// # Ordering contract
    ///
    /// Every replica of the session must be fed the same ops in the same
    /// order, exactly once each, one call at a time. The acceptance rule is
    /// only sound under that order. Sequence numbers must strictly increase
    /// and the MSN must never regress or pass the op's sequence number;
    /// anything else halts the handler with [`ProtocolError::Violation`].
    ///
    /// `local` marks ops this replica originated. It only affects local
    /// proposal tracking; agreement is identical for local and remote ops.
    ///
    /// An op whose payload does not match its kind is logged and its payload
    /// ignored. The sequence numbers still advance past it.
    pub fn process_message(
        &mut self,
        message: &SequencedMessage,
        local: bool,
    ) -> Result<ProcessOutcome, ProtocolError> {
        if self.status == HandlerStatus::Halted {
            return Err(ProtocolError::Halted);
        }

        if let Err(violation) = self.check_order(message) {
            tracing::error!(
                sequence_number = message.sequence_number,
                minimum_sequence_number = message.minimum_sequence_number,
                "protocol violation, halting: {}",
                violation
            );
            self.status = HandlerStatus::Halted;
            return Err(ProtocolError::Violation(violation));
        }

        let malformed = match ProtocolOp::decode(message) {
            Ok(op) => {
                self.dispatch(op, message, local);
                None
            }
            Err(error) => {
                tracing::warn!(sequence_number = message.sequence_number, "dropping op payload: {}", error);
                Some(error)
            }
        };

        self.sequence_number = message.sequence_number;
        self.minimum_sequence_number = message.minimum_sequence_number;
        self.quorum.update_minimum_sequence_number(message);

        let events = self.quorum.take_events();
        Ok(match malformed {
            None => ProcessOutcome::Applied {
                sequence_number: message.sequence_number,
                message_type: message.message_type,
                events,
            },
            Some(error) => ProcessOutcome::Dropped {
                sequence_number: message.sequence_number,
                error,
                events,
            },
        })
    }

    fn dispatch(&mut self, op: ProtocolOp, message: &SequencedMessage, local: bool) {
        match op {
            ProtocolOp::Join(join) => {
                let member = SequencedClient {
                    client: join.detail,
                    sequence_number: message.sequence_number,
                };
                self.quorum.add_member(&join.client_id, member);
            }
            ProtocolOp::Leave { client_id } => {
                self.quorum.remove_member(&client_id);
            }
            ProtocolOp::Propose(proposal) => {
                self.quorum.add_proposal(
                    proposal.key,
                    proposal.value,
                    message.sequence_number,
                    local,
                    message.client_sequence_number,
                );
            }
            ProtocolOp::Reject {
                client_id,
                target_sequence_number,
            } => {
                self.quorum.reject_proposal(&client_id, target_sequence_number);
            }
            ProtocolOp::Summarize(contents) => {
                tracing::debug!(sequence_number = message.sequence_number, %contents, "summarize");
            }
            ProtocolOp::SummaryAck(contents) => {
                tracing::debug!(sequence_number = message.sequence_number, %contents, "summary ack");
            }
            ProtocolOp::SummaryNack(contents) => {
                tracing::debug!(sequence_number = message.sequence_number, %contents, "summary nack");
            }
            ProtocolOp::NoOp | ProtocolOp::Passthrough(_) => {}
        }
    }

    fn check_order(&self, message: &SequencedMessage) -> Result<(), ProtocolViolation> {
        if message.sequence_number <= self.sequence_number {
            return Err(ProtocolViolation::SequenceNotIncreasing {
                previous: self.sequence_number,
                found: message.sequence_number,
            });
        }
        if message.minimum_sequence_number < self.minimum_sequence_number {
            return Err(ProtocolViolation::MinimumSequenceRegression {
                previous: self.minimum_sequence_number,
                found: message.minimum_sequence_number,
            });
        }
        if message.minimum_sequence_number > message.sequence_number {
            return Err(ProtocolViolation::MinimumAboveSequence {
                minimum: message.minimum_sequence_number,
                sequence: message.sequence_number,
            });
        }
        Ok(())
    }

    /// Current sequence state plus a fresh quorum snapshot.
    pub fn get_protocol_state(&self) -> ProtocolState {
        ProtocolState::from_parts(
            self.sequence_number,
            self.minimum_sequence_number,
            self.quorum.snapshot(),
        )
    }

    /// Serialize the current state into a summary tree.
    pub fn capture_summary(&self) -> Result<SummaryTree, SummaryError> {
        summary::capture(&self.attributes(), &self.get_protocol_state())
    }

    pub fn attributes(&self) -> DocumentAttributes {
        DocumentAttributes {
            branch: self.branch_id.clone(),
            minimum_sequence_number: self.minimum_sequence_number,
            sequence_number: self.sequence_number,
        }
    }

    pub fn branch_id(&self) -> &str {
        &self.branch_id
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn minimum_sequence_number(&self) -> u64 {
        self.minimum_sequence_number
    }

    pub fn quorum(&self) -> &Quorum {
        &self.quorum
    }

    /// Mutable access for the outbound side channel ([`Quorum::propose`], [`Quorum::reject`]).
    pub fn quorum_mut(&mut self) -> &mut Quorum {
        &mut self.quorum
    }

    pub fn status(&self) -> HandlerStatus {
        self.status
    }

    pub fn is_halted(&self) -> bool {
        self.status == HandlerStatus::Halted
    }
}
