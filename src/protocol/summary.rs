//! Summary tree export and import.
//!
//! A summary is a tree of named blobs. Each blob holds a JSON document;
//! serde_json writes object keys sorted and the lists in state order, so two
//! replicas with the same state produce byte-identical summaries.
//!
//! ```text
//! .attributes       {branch, minimumSequenceNumber, sequenceNumber}
//! quorumMembers     [[clientId, {client, sequenceNumber}], ...]
//! quorumProposals   [[sequenceNumber, {key, value, ...}, [rejector, ...]], ...]
//! quorumValues      [[key, {key, value, sequenceNumber, approvalSequenceNumber, ...}], ...]
//! ```

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::errors::SummaryError;
use super::handler::ProtocolState;
use super::quorum::QuorumSnapshot;

pub const ATTRIBUTES_BLOB: &str = ".attributes";
pub const QUORUM_MEMBERS_BLOB: &str = "quorumMembers";
pub const QUORUM_PROPOSALS_BLOB: &str = "quorumProposals";
pub const QUORUM_VALUES_BLOB: &str = "quorumValues";

/// Document-level attributes stored beside the quorum blobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentAttributes {
    pub branch: String,
    pub minimum_sequence_number: u64,
    pub sequence_number: u64,
}

/// A node of a summary tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SummaryObject {
    Blob { content: String },
    Tree(SummaryTree),
}

/// Named entries, kept sorted by name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryTree {
    pub tree: BTreeMap<String, SummaryObject>,
}

impl SummaryTree {
    pub fn new() -> Self {
        SummaryTree::default()
    }

    pub fn insert_blob(&mut self, name: impl Into<String>, content: String) {
        self.tree.insert(name.into(), SummaryObject::Blob { content });
    }

    /// Content of the blob at `name`.
    pub fn blob(&self, name: &'static str) -> Result<&str, SummaryError> {
        match self.tree.get(name) {
            Some(SummaryObject::Blob { content }) => Ok(content),
            Some(SummaryObject::Tree(_)) => Err(SummaryError::NotABlob(name)),
            None => Err(SummaryError::MissingBlob(name)),
        }
    }

    /// Canonical encoding of the whole tree.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SummaryError> {
        serde_json::to_vec(self).map_err(SummaryError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SummaryError> {
        serde_json::from_slice(bytes).map_err(|source| SummaryError::Decode {
            blob: "<tree>",
            source,
        })
    }

    /// BLAKE3 digest of the canonical encoding, hex encoded.
    pub fn fingerprint(&self) -> Result<String, SummaryError> {
        let bytes = self.to_bytes()?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }
}

/// Serialize protocol state into a summary tree.
pub fn capture(attributes: &DocumentAttributes, state: &ProtocolState) -> Result<SummaryTree, SummaryError> {
    let mut summary = SummaryTree::new();
    summary.insert_blob(ATTRIBUTES_BLOB, encode(attributes)?);
    summary.insert_blob(QUORUM_MEMBERS_BLOB, encode(&state.members)?);
    summary.insert_blob(QUORUM_PROPOSALS_BLOB, encode(&state.proposals)?);
    summary.insert_blob(QUORUM_VALUES_BLOB, encode(&state.values)?);
    Ok(summary)
}

/// Decode and validate a summary produced by [`capture`].
pub fn load_summary(summary: &SummaryTree) -> Result<(DocumentAttributes, ProtocolState), SummaryError> {
    let attributes: DocumentAttributes = decode(summary, ATTRIBUTES_BLOB)?;
    let snapshot = QuorumSnapshot {
        members: decode(summary, QUORUM_MEMBERS_BLOB)?,
        proposals: decode(summary, QUORUM_PROPOSALS_BLOB)?,
        values: decode(summary, QUORUM_VALUES_BLOB)?,
    };

    let state = ProtocolState::from_parts(
        attributes.sequence_number,
        attributes.minimum_sequence_number,
        snapshot,
    );
    state.validate().map_err(SummaryError::InvalidState)?;
    Ok((attributes, state))
}

fn encode<T: Serialize>(value: &T) -> Result<String, SummaryError> {
    serde_json::to_string(value).map_err(SummaryError::Encode)
}

fn decode<T: DeserializeOwned>(summary: &SummaryTree, blob: &'static str) -> Result<T, SummaryError> {
    let content = summary.blob(blob)?;
    serde_json::from_str(content).map_err(|source| SummaryError::Decode { blob, source })
}

// =============================================================================
// TESTS
// =============================================================================
