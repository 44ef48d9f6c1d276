//! Quorum: session membership and proposal agreement.
//!
//! Acceptance needs no vote collection. Every replica sees the same op order,
//! so once the MSN has passed a proposal's sequence number every connected
//! client has seen the proposal, and any Reject for it has already been
//! applied by every replica. A proposal that survives to that point is
//! approved; the approval itself commits once the MSN passes the op that
//! approved it.

use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::QuorumError;
use super::message::SequencedMessage;

// =============================================================================
// MEMBERS AND PROPOSALS
// =============================================================================

/// A connected client and the sequence number of its join op.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedClient {
    /// Opaque client detail, passed through unexamined.
    pub client: Value,
    pub sequence_number: u64,
}

/// Identity of a sequenced proposal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedProposal {
    pub key: String,
    pub value: Value,
    /// Sequence number of the propose op.
    pub sequence_number: u64,
    #[serde(default)]
    pub client_sequence_number: u64,
}

/// A proposal that has been sequenced but not yet resolved.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingProposal {
    pub proposal: SequencedProposal,
    /// Whether this replica originated the propose op.
    pub local: bool,
    /// Clients that vetoed the proposal.
    pub rejections: BTreeSet<String>,
}

/// The outcome of an approved proposal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedProposal {
    pub key: String,
    pub value: Value,
    /// Sequence number of the propose op.
    pub sequence_number: u64,
    /// Sequence number of the op whose MSN approved the proposal.
    pub approval_sequence_number: u64,
    /// Sequence number of the op whose MSN passed the approval. `None` until then.
    #[serde(default)]
    pub commit_sequence_number: Option<u64>,
}

/// Progress of a proposal this replica submitted through [`Quorum::propose`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalProposalStatus {
    /// Handed to the submitter, not yet seen in the op stream.
    Submitted,
    /// Sequenced at the given sequence number, awaiting the MSN.
    Sequenced(u64),
    Approved(u64),
    Rejected(u64),
}

/// Observable quorum changes, drained with [`Quorum::take_events`].
#[derive(Clone, Debug, PartialEq)]
pub enum QuorumEvent {
    AddMember {
        client_id: String,
        client: SequencedClient,
    },
    RemoveMember {
        client_id: String,
    },
    AddProposal {
        proposal: SequencedProposal,
        local: bool,
    },
    ApproveProposal {
        proposal: CommittedProposal,
        /// The committed entry this approval replaced, if the key was reused.
        superseded: Option<CommittedProposal>,
        local: bool,
    },
    RejectProposal {
        proposal: SequencedProposal,
        rejections: Vec<String>,
        local: bool,
    },
    CommitProposal {
        proposal: CommittedProposal,
    },
}

/// Ordered export of the quorum.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QuorumSnapshot {
    pub members: Vec<(String, SequencedClient)>,
    pub proposals: Vec<(u64, SequencedProposal, Vec<String>)>,
    pub values: Vec<(String, CommittedProposal)>,
}

// =============================================================================
// OUTBOUND SIDE CHANNEL
// =============================================================================

/// Publishes new propose and reject ops back through the sequencer.
///
/// Provided by the host. Nothing here changes quorum state; the quorum only
/// reacts once the resulting op comes back through the ordered stream.
pub trait OpSubmitter: Send {
    /// Submit a propose op. Returns the client sequence number it was sent with.
    fn send_proposal(&mut self, key: &str, value: &Value) -> u64;

    /// Submit a reject op for the proposal at `sequence_number`.
    fn send_reject(&mut self, sequence_number: u64);
}

/// Submitter for replicas that never originate ops (observers, replay).
#[derive(Debug, Default)]
pub struct NullSubmitter {
    next_client_sequence_number: u64,
}

impl NullSubmitter {
    pub fn new() -> Self {
        NullSubmitter::default()
    }
}

impl OpSubmitter for NullSubmitter {
    fn send_proposal(&mut self, _key: &str, _value: &Value) -> u64 {
        self.next_client_sequence_number += 1;
        self.next_client_sequence_number
    }

    fn send_reject(&mut self, _sequence_number: u64) {}
}

// =============================================================================
// QUORUM
// =============================================================================

/// Membership registry and proposal ledger for one session.
pub struct Quorum {
    /// Connected clients in join order.
    members: IndexMap<String, SequencedClient>,
    /// Unresolved proposals keyed by sequence number.
    proposals: BTreeMap<u64, PendingProposal>,
    /// Approved values by key, in first-approval order.
    values: IndexMap<String, CommittedProposal>,
    /// Keys whose latest approval has not committed yet, in approval order.
    awaiting_commit: Vec<String>,
    /// Proposals submitted by this replica, keyed by client sequence number.
    local_proposals: BTreeMap<u64, LocalProposalStatus>,
    minimum_sequence_number: u64,
    submitter: Box<dyn OpSubmitter>,
    events: Vec<QuorumEvent>,
}

impl Quorum {
    /// Create an empty quorum.
    pub fn new(submitter: Box<dyn OpSubmitter>) -> Self {
        Quorum {
            members: IndexMap::new(),
            proposals: BTreeMap::new(),
            values: IndexMap::new(),
            awaiting_commit: Vec::new(),
            local_proposals: BTreeMap::new(),
            minimum_sequence_number: 0,
            submitter,
            events: Vec::new(),
        }
    }

    /// Rebuild a quorum from a snapshot taken at `minimum_sequence_number`.
    ///
    /// The snapshot is trusted; callers validate it first.
    pub fn from_snapshot(
        minimum_sequence_number: u64,
        snapshot: QuorumSnapshot,
        submitter: Box<dyn OpSubmitter>,
    ) -> Self {
        let members = snapshot.members.into_iter().collect();
        let proposals = snapshot
            .proposals
            .into_iter()
            .map(|(sequence_number, proposal, rejections)| {
                let pending = PendingProposal {
                    proposal,
                    local: false,
                    rejections: rejections.into_iter().collect(),
                };
                (sequence_number, pending)
            })
            .collect();
        let values: IndexMap<String, CommittedProposal> = snapshot.values.into_iter().collect();

        let mut awaiting: Vec<(u64, String)> = values
            .iter()
            .filter(|(_, value)| value.commit_sequence_number.is_none())
            .map(|(key, value)| (value.approval_sequence_number, key.clone()))
            .collect();
        awaiting.sort();

        Quorum {
            members,
            proposals,
            values,
            awaiting_commit: awaiting.into_iter().map(|(_, key)| key).collect(),
            local_proposals: BTreeMap::new(),
            minimum_sequence_number,
            submitter,
            events: Vec::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Membership
    // -------------------------------------------------------------------------

    /// Add a member. Returns false, changing nothing, if the id is already present.
    pub fn add_member(&mut self, client_id: &str, client: SequencedClient) -> bool {
        if self.members.contains_key(client_id) {
            tracing::warn!(client_id = %client_id, "ignoring duplicate join");
            return false;
        }

        self.members.insert(client_id.to_string(), client.clone());
        self.events.push(QuorumEvent::AddMember {
            client_id: client_id.to_string(),
            client,
        });
        true
    }

    /// Remove a member. Returns false if it was not present.
    ///
    /// Pending proposals by the departing client are left in place.
    pub fn remove_member(&mut self, client_id: &str) -> bool {
        if self.members.shift_remove(client_id).is_none() {
            tracing::debug!(client_id = %client_id, "leave for absent client");
            return false;
        }

        self.events.push(QuorumEvent::RemoveMember {
            client_id: client_id.to_string(),
        });
        true
    }

    pub fn members(&self) -> &IndexMap<String, SequencedClient> {
        &self.members
    }

    pub fn member(&self, client_id: &str) -> Option<&SequencedClient> {
        self.members.get(client_id)
    }

    // -------------------------------------------------------------------------
    // Proposals
    // -------------------------------------------------------------------------

    /// Record a sequenced propose op.
    ///
    /// `sequence_number` is the current op's, which is never below the MSN, so
    /// the proposal cannot be resolved until a later op advances the MSN.
    pub fn add_proposal(
        &mut self,
        key: String,
        value: Value,
        sequence_number: u64,
        local: bool,
        client_sequence_number: u64,
    ) {
        let proposal = SequencedProposal {
            key,
            value,
            sequence_number,
            client_sequence_number,
        };

        if local {
            if let Some(status) = self.local_proposals.get_mut(&client_sequence_number) {
                *status = LocalProposalStatus::Sequenced(sequence_number);
            }
        }

        self.proposals.insert(
            sequence_number,
            PendingProposal {
                proposal: proposal.clone(),
                local,
                rejections: BTreeSet::new(),
            },
        );
        self.events.push(QuorumEvent::AddProposal { proposal, local });
    }

    /// Apply a sequenced reject op. A single veto from a connected client is final.
    ///
    /// Returns false if `client_id` is not a member, or if no proposal is
    /// pending at `sequence_number`; late rejects for already resolved
    /// proposals are expected and harmless.
    pub fn reject_proposal(&mut self, client_id: &str, sequence_number: u64) -> bool {
        if !self.members.contains_key(client_id) {
            tracing::debug!(
                client_id = %client_id,
                sequence_number,
                "reject from a client that is not a member"
            );
            return false;
        }

        let Some(mut pending) = self.proposals.remove(&sequence_number) else {
            tracing::debug!(
                client_id = %client_id,
                sequence_number,
                "reject for a proposal that is not pending"
            );
            return false;
        };

        pending.rejections.insert(client_id.to_string());
        tracing::info!(
            key = %pending.proposal.key,
            sequence_number,
            client_id = %client_id,
            "proposal rejected"
        );
        self.finish_rejection(pending);
        true
    }

    /// Observe the MSN carried by `message` and resolve what it covers.
    pub fn update_minimum_sequence_number(&mut self, message: &SequencedMessage) {
        let value = message.minimum_sequence_number;
        if value < self.minimum_sequence_number {
            tracing::error!(
                previous = self.minimum_sequence_number,
                found = value,
                "quorum saw the minimum sequence number regress"
            );
            return;
        }
        if value == self.minimum_sequence_number {
            return;
        }
        self.minimum_sequence_number = value;

        // Everything strictly below the new MSN resolves, in sequence order.
        let still_pending = self.proposals.split_off(&value);
        let resolved = std::mem::replace(&mut self.proposals, still_pending);

        for (_, pending) in resolved {
            if pending.rejections.is_empty() {
                self.approve(pending, message.sequence_number);
            } else {
                self.finish_rejection(pending);
            }
        }

        let ready = self
            .awaiting_commit
            .iter()
            .take_while(|key| {
                self.values
                    .get(key.as_str())
                    .map_or(true, |committed| committed.approval_sequence_number < value)
            })
            .count();

        for key in self.awaiting_commit.drain(..ready) {
            if let Some(committed) = self.values.get_mut(&key) {
                committed.commit_sequence_number = Some(message.sequence_number);
                tracing::debug!(
                    key = %key,
                    sequence_number = committed.sequence_number,
                    commit_sequence_number = message.sequence_number,
                    "proposal committed"
                );
                self.events.push(QuorumEvent::CommitProposal {
                    proposal: committed.clone(),
                });
            }
        }
    }

    fn approve(&mut self, pending: PendingProposal, approval_sequence_number: u64) {
        let PendingProposal { proposal, local, .. } = pending;
        let committed = CommittedProposal {
            key: proposal.key.clone(),
            value: proposal.value,
            sequence_number: proposal.sequence_number,
            approval_sequence_number,
            commit_sequence_number: None,
        };

        tracing::info!(
            key = %committed.key,
            sequence_number = committed.sequence_number,
            approval_sequence_number,
            "proposal approved"
        );

        let superseded = self.values.insert(committed.key.clone(), committed.clone());
        self.awaiting_commit.retain(|key| key != &committed.key);
        self.awaiting_commit.push(committed.key.clone());

        if local {
            self.set_local_status(
                proposal.client_sequence_number,
                LocalProposalStatus::Approved(committed.sequence_number),
            );
        }
        self.events.push(QuorumEvent::ApproveProposal {
            proposal: committed,
            superseded,
            local,
        });
    }

    fn finish_rejection(&mut self, pending: PendingProposal) {
        let PendingProposal { proposal, local, rejections } = pending;
        if local {
            self.set_local_status(
                proposal.client_sequence_number,
                LocalProposalStatus::Rejected(proposal.sequence_number),
            );
        }
        self.events.push(QuorumEvent::RejectProposal {
            proposal,
            rejections: rejections.into_iter().collect(),
            local,
        });
    }

    fn set_local_status(&mut self, client_sequence_number: u64, status: LocalProposalStatus) {
        if let Some(entry) = self.local_proposals.get_mut(&client_sequence_number) {
            *entry = status;
        }
    }

    /// Submit a new proposal through the side channel.
    ///
    /// Returns the client sequence number; track it with [`Quorum::local_proposal`].
    pub fn propose(&mut self, key: &str, value: &Value) -> u64 {
        let client_sequence_number = self.submitter.send_proposal(key, value);
        self.local_proposals
            .insert(client_sequence_number, LocalProposalStatus::Submitted);
        client_sequence_number
    }

    /// Veto a pending proposal through the side channel.
    pub fn reject(&mut self, sequence_number: u64) -> Result<(), QuorumError> {
        if !self.proposals.contains_key(&sequence_number) {
            return Err(QuorumError::NoSuchProposal(sequence_number));
        }
        self.submitter.send_reject(sequence_number);
        Ok(())
    }

    pub fn local_proposal(&self, client_sequence_number: u64) -> Option<LocalProposalStatus> {
        self.local_proposals.get(&client_sequence_number).copied()
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Whether `key` has an approved value.
    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Approved value for `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key).map(|committed| &committed.value)
    }

    /// Full approval record for `key`.
    pub fn approval_data(&self, key: &str) -> Option<&CommittedProposal> {
        self.values.get(key)
    }

    pub fn pending_proposal(&self, sequence_number: u64) -> Option<&PendingProposal> {
        self.proposals.get(&sequence_number)
    }

    pub fn pending_count(&self) -> usize {
        self.proposals.len()
    }

    pub fn minimum_sequence_number(&self) -> u64 {
        self.minimum_sequence_number
    }

    /// Drain the events produced since the last call.
    pub fn take_events(&mut self) -> Vec<QuorumEvent> {
        std::mem::take(&mut self.events)
    }

    /// Ordered export of members, pending proposals, and committed values.
    pub fn snapshot(&self) -> QuorumSnapshot {
        QuorumSnapshot {
            members: self
                .members
                .iter()
                .map(|(id, client)| (id.clone(), client.clone()))
                .collect(),
            proposals: self
                .proposals
                .iter()
                .map(|(sequence_number, pending)| {
                    (
                        *sequence_number,
                        pending.proposal.clone(),
                        pending.rejections.iter().cloned().collect(),
                    )
                })
                .collect(),
            values: self
                .values
                .iter()
                .map(|(key, committed)| (key.clone(), committed.clone()))
                .collect(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
