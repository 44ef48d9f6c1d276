//! In-process total-order sequencer.
//!
//! Stamps ops with a sequence number and the session MSN, the minimum
//! reference sequence number over connected clients. Test harnesses and the
//! `qp` binary use it to produce the ordered stream a real ordering service
//! would deliver.

use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error;

use crate::protocol::{MessageType, SequencedMessage};

use super::submitter::OutboundOp;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequencerError {
    #[error("client {0} is not connected")]
    UnknownClient(String),

    #[error("client {0} is already connected")]
    AlreadyConnected(String),
}

/// What the sequencer tracks per connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientCursor {
    /// Highest sequence number the client has acknowledged seeing.
    pub reference_sequence_number: u64,
    /// Last client sequence number stamped for the client.
    pub client_sequence_number: u64,
}

/// Assigns the total order for one session.
#[derive(Debug, Default)]
pub struct LocalSequencer {
    sequence_number: u64,
    minimum_sequence_number: u64,
    clients: IndexMap<String, ClientCursor>,
}

impl LocalSequencer {
    pub fn new() -> Self {
        LocalSequencer::default()
    }

    /// Resume after `sequence_number` with the given MSN and no connected clients.
    pub fn resume(sequence_number: u64, minimum_sequence_number: u64) -> Self {
        LocalSequencer {
            sequence_number,
            minimum_sequence_number,
            clients: IndexMap::new(),
        }
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn minimum_sequence_number(&self) -> u64 {
        self.minimum_sequence_number
    }

    pub fn clients(&self) -> &IndexMap<String, ClientCursor> {
        &self.clients
    }

    /// Sequence a join. The client's reference starts at its own join op.
    pub fn join(&mut self, client_id: &str, detail: Value) -> Result<SequencedMessage, SequencerError> {
        if self.clients.contains_key(client_id) {
            return Err(SequencerError::AlreadyConnected(client_id.to_string()));
        }
        let sequence_number = self.advance();
        self.clients.insert(
            client_id.to_string(),
            ClientCursor {
                reference_sequence_number: sequence_number,
                client_sequence_number: 0,
            },
        );
        let minimum_sequence_number = self.recompute_minimum(sequence_number);
        Ok(SequencedMessage::join(client_id, detail, sequence_number, minimum_sequence_number))
    }

    /// Sequence a leave. The client stops holding back the MSN.
    pub fn leave(&mut self, client_id: &str) -> Result<SequencedMessage, SequencerError> {
        if self.clients.shift_remove(client_id).is_none() {
            return Err(SequencerError::UnknownClient(client_id.to_string()));
        }
        let sequence_number = self.advance();
        let minimum_sequence_number = self.recompute_minimum(sequence_number);
        Ok(SequencedMessage::leave(client_id, sequence_number, minimum_sequence_number))
    }

    pub fn propose(
        &mut self,
        client_id: &str,
        key: &str,
        value: Value,
    ) -> Result<SequencedMessage, SequencerError> {
        let client_sequence_number = self.next_client_sequence_number(client_id)?;
        self.stamp_propose(client_id, client_sequence_number, key, value)
    }

    pub fn reject(&mut self, client_id: &str, target_sequence_number: u64) -> Result<SequencedMessage, SequencerError> {
        let client_sequence_number = self.next_client_sequence_number(client_id)?;
        let reference_sequence_number = self.reference_of(client_id)?;
        let sequence_number = self.advance();
        let minimum_sequence_number = self.recompute_minimum(sequence_number);
        Ok(SequencedMessage::reject(
            client_id,
            client_sequence_number,
            target_sequence_number,
            sequence_number,
            minimum_sequence_number,
        )
        .with_reference(reference_sequence_number))
    }

    /// Sequence a summarize op carrying `contents`.
    pub fn summarize(&mut self, client_id: &str, contents: Value) -> Result<SequencedMessage, SequencerError> {
        let client_sequence_number = self.next_client_sequence_number(client_id)?;
        let reference_sequence_number = self.reference_of(client_id)?;
        let sequence_number = self.advance();
        let minimum_sequence_number = self.recompute_minimum(sequence_number);
        Ok(
            SequencedMessage::new(MessageType::Summarize, sequence_number, minimum_sequence_number)
                .with_client(client_id, client_sequence_number)
                .with_reference(reference_sequence_number)
                .with_contents(contents),
        )
    }

    /// Sequence a server no-op, used to publish an advanced MSN.
    pub fn noop(&mut self) -> SequencedMessage {
        let sequence_number = self.advance();
        let minimum_sequence_number = self.recompute_minimum(sequence_number);
        SequencedMessage::noop(sequence_number, minimum_sequence_number)
    }

    /// Record that `client_id` has seen everything up to `sequence_number`.
    ///
    /// The MSN moves on the next sequenced op.
    pub fn acknowledge(&mut self, client_id: &str, sequence_number: u64) -> Result<(), SequencerError> {
        let current = self.sequence_number;
        let cursor = self
            .clients
            .get_mut(client_id)
            .ok_or_else(|| SequencerError::UnknownClient(client_id.to_string()))?;
        let seen = sequence_number.min(current);
        if seen > cursor.reference_sequence_number {
            cursor.reference_sequence_number = seen;
        }
        Ok(())
    }

    /// Acknowledge the latest op on behalf of every connected client.
    pub fn acknowledge_all(&mut self) {
        let current = self.sequence_number;
        for cursor in self.clients.values_mut() {
            cursor.reference_sequence_number = current;
        }
    }

    /// Sequence an op a replica handed to its submitter.
    pub fn submit_outbound(&mut self, client_id: &str, op: OutboundOp) -> Result<SequencedMessage, SequencerError> {
        match op {
            OutboundOp::Propose {
                key,
                value,
                client_sequence_number,
            } => {
                let cursor = self
                    .clients
                    .get_mut(client_id)
                    .ok_or_else(|| SequencerError::UnknownClient(client_id.to_string()))?;
                cursor.client_sequence_number = cursor.client_sequence_number.max(client_sequence_number);
                self.stamp_propose(client_id, client_sequence_number, &key, value)
            }
            OutboundOp::Reject { sequence_number } => self.reject(client_id, sequence_number),
        }
    }

    fn stamp_propose(
        &mut self,
        client_id: &str,
        client_sequence_number: u64,
        key: &str,
        value: Value,
    ) -> Result<SequencedMessage, SequencerError> {
        let reference_sequence_number = self.reference_of(client_id)?;
        let sequence_number = self.advance();
        let minimum_sequence_number = self.recompute_minimum(sequence_number);
        Ok(SequencedMessage::propose(
            client_id,
            client_sequence_number,
            key,
            value,
            sequence_number,
            minimum_sequence_number,
        )
        .with_reference(reference_sequence_number))
    }

    fn advance(&mut self) -> u64 {
        self.sequence_number += 1;
        self.sequence_number
    }

    fn next_client_sequence_number(&mut self, client_id: &str) -> Result<u64, SequencerError> {
        let cursor = self
            .clients
            .get_mut(client_id)
            .ok_or_else(|| SequencerError::UnknownClient(client_id.to_string()))?;
        cursor.client_sequence_number += 1;
        Ok(cursor.client_sequence_number)
    }

    fn reference_of(&self, client_id: &str) -> Result<u64, SequencerError> {
        self.clients
            .get(client_id)
            .map(|cursor| cursor.reference_sequence_number)
            .ok_or_else(|| SequencerError::UnknownClient(client_id.to_string()))
    }

    /// MSN for the op at `sequence_number`. With nobody connected it is the op itself.
    fn recompute_minimum(&mut self, sequence_number: u64) -> u64 {
        let candidate = self
            .clients
            .values()
            .map(|cursor| cursor.reference_sequence_number)
            .min()
            .unwrap_or(sequence_number);
        self.minimum_sequence_number = self.minimum_sequence_number.max(candidate);
        self.minimum_sequence_number
    }
}
