//! History checker.
//!
//! Records every op fed to a replica together with the state it produced,
//! then verifies the agreement invariants over the whole run:
//! - Sequence numbers and the MSN move forward only, with MSN <= sequence number
//! - A proposal is approved only after the MSN passed it
//! - A rejected proposal is never approved, and a resolved one never returns
//! - A committed key never disappears
//!
//! [`Checker::compare_replicas`] checks that replicas fed the same stream agree.

use std::collections::HashSet;

use crate::protocol::{ProtocolOp, ProtocolState, SequencedMessage};

/// One applied (or dropped) op and the state after it.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub message: SequencedMessage,
    pub state: ProtocolState,
}

/// Ordered record of a replica's run.
#[derive(Debug, Default, Clone)]
pub struct History {
    entries: Vec<HistoryEntry>,
}

impl History {
    pub fn new() -> Self {
        History::default()
    }

    pub fn record(&mut self, message: SequencedMessage, state: ProtocolState) {
        self.entries.push(HistoryEntry { message, state });
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of a consistency check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub violations: Vec<Violation>,
    pub stats: CheckStats,
}

#[derive(Debug, Clone)]
pub struct Violation {
    pub kind: ViolationKind,
    pub description: String,
    /// Related history entries (by index).
    pub related_entries: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    SequenceRegression,
    MinimumSequenceRegression,
    MinimumAboveSequence,
    /// A recorded state fails [`ProtocolState::validate`].
    InvalidState,
    /// A value was approved before the MSN passed its proposal.
    PrematureAcceptance,
    RejectedProposalCommitted,
    /// A resolved proposal showed up as pending again.
    ProposalResurrected,
    CommittedValueLost,
    ReplicaDivergence,
}

#[derive(Debug, Clone, Default)]
pub struct CheckStats {
    pub total_operations: usize,
    pub applied_operations: usize,
    /// Ops whose payload was malformed. They advance the sequence numbers only.
    pub dropped_operations: usize,
    pub approved_proposals: usize,
    pub rejected_proposals: usize,
    pub final_members: usize,
    pub final_values: usize,
}

/// The consistency checker (oracle).
pub struct Checker {
    initial: ProtocolState,
}

impl Checker {
    /// Checker for a history that starts from an empty session.
    pub fn new() -> Self {
        Checker {
            initial: ProtocolState::default(),
        }
    }

    /// Checker for a history that starts from a loaded state.
    pub fn starting_from(initial: ProtocolState) -> Self {
        Checker { initial }
    }

    pub fn verify(&self, history: &History) -> CheckResult {
        let mut violations = Vec::new();
        let mut stats = CheckStats::default();

        let mut rejected: HashSet<u64> = HashSet::new();
        let mut resolved: HashSet<u64> = HashSet::new();
        let mut previous = &self.initial;

        for (idx, entry) in history.entries().iter().enumerate() {
            let state = &entry.state;
            let message = &entry.message;
            stats.total_operations += 1;

            let mut violation = |kind: ViolationKind, description: String| {
                violations.push(Violation {
                    kind,
                    description,
                    related_entries: vec![idx],
                });
            };

            let decoded = ProtocolOp::decode(message);
            if state.sequence_number == message.sequence_number
                && state.sequence_number > previous.sequence_number
            {
                if decoded.is_ok() {
                    stats.applied_operations += 1;
                } else {
                    stats.dropped_operations += 1;
                }
            } else {
                violation(
                    ViolationKind::SequenceRegression,
                    format!(
                        "op {} moved the sequence number from {} to {}",
                        message.sequence_number, previous.sequence_number, state.sequence_number
                    ),
                );
            }

            if state.minimum_sequence_number < previous.minimum_sequence_number {
                violation(
                    ViolationKind::MinimumSequenceRegression,
                    format!(
                        "op {} moved the MSN back from {} to {}",
                        message.sequence_number,
                        previous.minimum_sequence_number,
                        state.minimum_sequence_number
                    ),
                );
            }
            if state.minimum_sequence_number > state.sequence_number {
                violation(
                    ViolationKind::MinimumAboveSequence,
                    format!(
                        "MSN {} above sequence number {} after op {}",
                        state.minimum_sequence_number, state.sequence_number, message.sequence_number
                    ),
                );
            }
            if let Err(reason) = state.validate() {
                violation(ViolationKind::InvalidState, reason);
            }

            // Pending proposals that resolved on this op. Only a member's reject counts.
            let reject_target = match &decoded {
                Ok(ProtocolOp::Reject {
                    client_id,
                    target_sequence_number,
                }) if previous.members.iter().any(|(id, _)| id == client_id) => Some(*target_sequence_number),
                _ => None,
            };
            let now_pending: HashSet<u64> = state.proposals.iter().map(|(seq, _, _)| *seq).collect();
            for (seq, _, rejections) in &previous.proposals {
                if now_pending.contains(seq) {
                    continue;
                }
                resolved.insert(*seq);
                if !rejections.is_empty() || reject_target == Some(*seq) {
                    rejected.insert(*seq);
                    stats.rejected_proposals += 1;
                }
            }
            for seq in &now_pending {
                if resolved.contains(seq) {
                    violation(
                        ViolationKind::ProposalResurrected,
                        format!("proposal {} is pending again after op {}", seq, message.sequence_number),
                    );
                }
            }

            for (key, committed) in &state.values {
                let is_new = !previous
                    .values
                    .iter()
                    .any(|(k, c)| k == key && c.sequence_number == committed.sequence_number);
                if !is_new {
                    continue;
                }
                stats.approved_proposals += 1;
                if committed.sequence_number >= state.minimum_sequence_number {
                    violation(
                        ViolationKind::PrematureAcceptance,
                        format!(
                            "proposal {} for {} approved at MSN {}",
                            committed.sequence_number, key, state.minimum_sequence_number
                        ),
                    );
                }
                if rejected.contains(&committed.sequence_number) {
                    violation(
                        ViolationKind::RejectedProposalCommitted,
                        format!("rejected proposal {} for {} was approved", committed.sequence_number, key),
                    );
                }
            }

            for (key, before) in &previous.values {
                match state.values.iter().find(|(k, _)| k == key) {
                    None => violation(
                        ViolationKind::CommittedValueLost,
                        format!("committed key {} vanished at op {}", key, message.sequence_number),
                    ),
                    Some((_, after))
                        if after.sequence_number == before.sequence_number
                            && before.commit_sequence_number.is_some()
                            && after.commit_sequence_number.is_none() =>
                    {
                        violation(
                            ViolationKind::CommittedValueLost,
                            format!("commit of {} was undone at op {}", key, message.sequence_number),
                        )
                    }
                    Some(_) => {}
                }
            }

            previous = state;
        }

        stats.final_members = previous.members.len();
        stats.final_values = previous.values.len();

        CheckResult {
            passed: violations.is_empty(),
            violations,
            stats,
        }
    }

    /// Check that every replica reached the same state.
    pub fn compare_replicas(states: &[ProtocolState]) -> CheckResult {
        let mut violations = Vec::new();

        if let Some((reference, rest)) = states.split_first() {
            for (offset, state) in rest.iter().enumerate() {
                if state == reference {
                    continue;
                }
                let mut differing = Vec::new();
                if state.sequence_number != reference.sequence_number {
                    differing.push("sequenceNumber");
                }
                if state.minimum_sequence_number != reference.minimum_sequence_number {
                    differing.push("minimumSequenceNumber");
                }
                if state.members != reference.members {
                    differing.push("members");
                }
                if state.proposals != reference.proposals {
                    differing.push("proposals");
                }
                if state.values != reference.values {
                    differing.push("values");
                }
                violations.push(Violation {
                    kind: ViolationKind::ReplicaDivergence,
                    description: format!("replica {} differs from replica 0 in {}", offset + 1, differing.join(", ")),
                    related_entries: vec![],
                });
            }
        }

        CheckResult {
            passed: violations.is_empty(),
            violations,
            stats: CheckStats {
                final_members: states.first().map_or(0, |s| s.members.len()),
                final_values: states.first().map_or(0, |s| s.values.len()),
                ..CheckStats::default()
            },
        }
    }
}

impl Default for Checker {
    fn default() -> Self {
        Self::new()
    }
}
