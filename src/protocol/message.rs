//! Sequenced ops as delivered by the sequencer, and their decode into protocol actions.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::errors::MalformedOp;

// =============================================================================
// MESSAGE TYPE
// =============================================================================

/// Kind of a sequenced op, as stamped by the sequencer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "join")]
    ClientJoin,
    #[serde(rename = "leave")]
    ClientLeave,
    #[serde(rename = "propose")]
    Propose,
    #[serde(rename = "reject")]
    Reject,
    #[serde(rename = "noop")]
    NoOp,
    #[serde(rename = "summarize")]
    Summarize,
    #[serde(rename = "summaryAck")]
    SummaryAck,
    #[serde(rename = "summaryNack")]
    SummaryNack,
    /// Application content op. Carried by the same order, not interpreted here.
    #[serde(rename = "op")]
    Operation,
    #[serde(rename = "unknown", other)]
    Unknown,
}

impl MessageType {
    /// Whether this kind belongs to the protocol layer rather than content.
    pub fn is_protocol(self) -> bool {
        matches!(
            self,
            MessageType::ClientJoin
                | MessageType::ClientLeave
                | MessageType::Propose
                | MessageType::Reject
                | MessageType::NoOp
                | MessageType::Summarize
                | MessageType::SummaryAck
                | MessageType::SummaryNack
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::ClientJoin => "join",
            MessageType::ClientLeave => "leave",
            MessageType::Propose => "propose",
            MessageType::Reject => "reject",
            MessageType::NoOp => "noop",
            MessageType::Summarize => "summarize",
            MessageType::SummaryAck => "summaryAck",
            MessageType::SummaryNack => "summaryNack",
            MessageType::Operation => "op",
            MessageType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// SEQUENCED MESSAGE
// =============================================================================

/// One op as delivered by the sequencer.
///
/// Payloads stay untyped here; [`ProtocolOp::decode`] is the only place they
/// are interpreted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Originating client. `None` for sequencer-generated system ops.
    #[serde(default)]
    pub client_id: Option<String>,
    pub sequence_number: u64,
    pub minimum_sequence_number: u64,
    #[serde(default)]
    pub client_sequence_number: u64,
    #[serde(default)]
    pub reference_sequence_number: u64,
    #[serde(default)]
    pub contents: Value,
    /// System payload, a JSON document encoded as a string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl SequencedMessage {
    pub fn new(message_type: MessageType, sequence_number: u64, minimum_sequence_number: u64) -> Self {
        SequencedMessage {
            message_type,
            client_id: None,
            sequence_number,
            minimum_sequence_number,
            client_sequence_number: 0,
            reference_sequence_number: 0,
            contents: Value::Null,
            data: None,
        }
    }

    pub fn with_client(mut self, client_id: impl Into<String>, client_sequence_number: u64) -> Self {
        self.client_id = Some(client_id.into());
        self.client_sequence_number = client_sequence_number;
        self
    }

    pub fn with_reference(mut self, reference_sequence_number: u64) -> Self {
        self.reference_sequence_number = reference_sequence_number;
        self
    }

    pub fn with_contents(mut self, contents: Value) -> Self {
        self.contents = contents;
        self
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// System join op announcing `client_id`.
    pub fn join(client_id: &str, detail: Value, sequence_number: u64, minimum_sequence_number: u64) -> Self {
        let data = json!({ "clientId": client_id, "detail": detail }).to_string();
        SequencedMessage::new(MessageType::ClientJoin, sequence_number, minimum_sequence_number).with_data(data)
    }

    /// System leave op for `client_id`.
    pub fn leave(client_id: &str, sequence_number: u64, minimum_sequence_number: u64) -> Self {
        let data = Value::String(client_id.to_string()).to_string();
        SequencedMessage::new(MessageType::ClientLeave, sequence_number, minimum_sequence_number).with_data(data)
    }

    pub fn propose(
        client_id: &str,
        client_sequence_number: u64,
        key: &str,
        value: Value,
        sequence_number: u64,
        minimum_sequence_number: u64,
    ) -> Self {
        SequencedMessage::new(MessageType::Propose, sequence_number, minimum_sequence_number)
            .with_client(client_id, client_sequence_number)
            .with_contents(json!({ "key": key, "value": value }))
    }

    pub fn reject(
        client_id: &str,
        client_sequence_number: u64,
        target_sequence_number: u64,
        sequence_number: u64,
        minimum_sequence_number: u64,
    ) -> Self {
        SequencedMessage::new(MessageType::Reject, sequence_number, minimum_sequence_number)
            .with_client(client_id, client_sequence_number)
            .with_contents(Value::from(target_sequence_number))
    }

    pub fn noop(sequence_number: u64, minimum_sequence_number: u64) -> Self {
        SequencedMessage::new(MessageType::NoOp, sequence_number, minimum_sequence_number)
    }
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// Payload of a join op.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientJoin {
    pub client_id: String,
    #[serde(default)]
    pub detail: Value,
}

/// Payload of a propose op.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProposalContents {
    pub key: String,
    #[serde(default)]
    pub value: Value,
}

// =============================================================================
// PROTOCOL OP
// =============================================================================

/// A sequenced message decoded into exactly one protocol action.
#[derive(Clone, Debug, PartialEq)]
pub enum ProtocolOp {
    Join(ClientJoin),
    Leave { client_id: String },
    Propose(ProposalContents),
    Reject { client_id: String, target_sequence_number: u64 },
    Summarize(Value),
    SummaryAck(Value),
    SummaryNack(Value),
    NoOp,
    /// Content ops and unknown kinds. Only the sequence numbers apply.
    Passthrough(MessageType),
}

impl ProtocolOp {
    /// Decode the payload of `message` according to its kind.
    ///
    /// Nothing about the session is consulted; a message either has the
    /// shape its kind demands or it is rejected here.
    pub fn decode(message: &SequencedMessage) -> Result<Self, MalformedOp> {
        let kind = message.message_type;
        let sequence_number = message.sequence_number;
        let invalid = |reason: String| MalformedOp::InvalidPayload {
            kind,
            sequence_number,
            reason,
        };

        match kind {
            MessageType::ClientJoin => {
                let payload = system_payload(message)?;
                let join: ClientJoin =
                    serde_json::from_value(payload).map_err(|e| invalid(e.to_string()))?;
                Ok(ProtocolOp::Join(join))
            }
            MessageType::ClientLeave => match system_payload(message)? {
                Value::String(client_id) => Ok(ProtocolOp::Leave { client_id }),
                other => Err(invalid(format!("expected client id string, found {}", other))),
            },
            MessageType::Propose => {
                if message.contents.is_null() {
                    return Err(MalformedOp::MissingPayload { kind, sequence_number });
                }
                let proposal: ProposalContents = serde_json::from_value(message.contents.clone())
                    .map_err(|e| invalid(e.to_string()))?;
                Ok(ProtocolOp::Propose(proposal))
            }
            MessageType::Reject => {
                let client_id = message
                    .client_id
                    .clone()
                    .ok_or(MalformedOp::MissingClientId { kind, sequence_number })?;
                if message.contents.is_null() {
                    return Err(MalformedOp::MissingPayload { kind, sequence_number });
                }
                let target_sequence_number = message.contents.as_u64().ok_or_else(|| {
                    invalid(format!("expected sequence number, found {}", message.contents))
                })?;
                Ok(ProtocolOp::Reject {
                    client_id,
                    target_sequence_number,
                })
            }
            MessageType::Summarize => Ok(ProtocolOp::Summarize(message.contents.clone())),
            MessageType::SummaryAck => Ok(ProtocolOp::SummaryAck(message.contents.clone())),
            MessageType::SummaryNack => Ok(ProtocolOp::SummaryNack(message.contents.clone())),
            MessageType::NoOp => Ok(ProtocolOp::NoOp),
            MessageType::Operation | MessageType::Unknown => Ok(ProtocolOp::Passthrough(kind)),
        }
    }
}

/// Payload of a system op: the JSON document in `data`, else `contents`.
fn system_payload(message: &SequencedMessage) -> Result<Value, MalformedOp> {
    let kind = message.message_type;
    let sequence_number = message.sequence_number;

    if let Some(data) = &message.data {
        return serde_json::from_str(data).map_err(|e| MalformedOp::InvalidPayload {
            kind,
            sequence_number,
            reason: e.to_string(),
        });
    }
    if message.contents.is_null() {
        return Err(MalformedOp::MissingPayload { kind, sequence_number });
    }
    Ok(message.contents.clone())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_join_from_data() {
        let message = SequencedMessage::join("alice", json!({ "user": "a" }), 1, 0);
        let op = ProtocolOp::decode(&message).unwrap();
        assert_eq!(
            op,
            ProtocolOp::Join(ClientJoin {
                client_id: "alice".to_string(),
                detail: json!({ "user": "a" }),
            })
        );
    }

    #[test]
    fn test_decode_join_from_contents() {
        let message = SequencedMessage::new(MessageType::ClientJoin, 1, 0)
            .with_contents(json!({ "clientId": "bob" }));
        match ProtocolOp::decode(&message).unwrap() {
            ProtocolOp::Join(join) => {
                assert_eq!(join.client_id, "bob");
                assert!(join.detail.is_null());
            }
            other => panic!("unexpected op {:?}", other),
        }
    }

    #[test]
    fn test_decode_leave() {
        let message = SequencedMessage::leave("alice", 4, 2);
        assert_eq!(
            ProtocolOp::decode(&message).unwrap(),
            ProtocolOp::Leave { client_id: "alice".to_string() }
        );
    }

    #[test]
    fn test_decode_leave_rejects_non_string() {
        let message = SequencedMessage::new(MessageType::ClientLeave, 4, 2).with_data("42");
        assert!(matches!(
            ProtocolOp::decode(&message),
            Err(MalformedOp::InvalidPayload { sequence_number: 4, .. })
        ));
    }

    #[test]
    fn test_decode_join_with_garbage_data() {
        let message = SequencedMessage::new(MessageType::ClientJoin, 3, 0).with_data("{not json");
        assert!(matches!(
            ProtocolOp::decode(&message),
            Err(MalformedOp::InvalidPayload { kind: MessageType::ClientJoin, .. })
        ));
    }

    #[test]
    fn test_decode_propose() {
        let message = SequencedMessage::propose("alice", 7, "code", json!("v1"), 5, 3);
        assert_eq!(
            ProtocolOp::decode(&message).unwrap(),
            ProtocolOp::Propose(ProposalContents {
                key: "code".to_string(),
                value: json!("v1"),
            })
        );
    }

    #[test]
    fn test_decode_propose_missing_contents() {
        let message = SequencedMessage::new(MessageType::Propose, 5, 3).with_client("alice", 1);
        assert_eq!(
            ProtocolOp::decode(&message),
            Err(MalformedOp::MissingPayload {
                kind: MessageType::Propose,
                sequence_number: 5,
            })
        );
    }

    #[test]
    fn test_decode_propose_missing_key() {
        let message = SequencedMessage::new(MessageType::Propose, 5, 3)
            .with_contents(json!({ "value": 1 }));
        assert!(matches!(
            ProtocolOp::decode(&message),
            Err(MalformedOp::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_decode_reject_requires_client() {
        let message = SequencedMessage::new(MessageType::Reject, 6, 5).with_contents(json!(5));
        assert_eq!(
            ProtocolOp::decode(&message),
            Err(MalformedOp::MissingClientId {
                kind: MessageType::Reject,
                sequence_number: 6,
            })
        );
    }

    #[test]
    fn test_decode_reject() {
        let message = SequencedMessage::reject("bob", 2, 5, 6, 5);
        assert_eq!(
            ProtocolOp::decode(&message).unwrap(),
            ProtocolOp::Reject {
                client_id: "bob".to_string(),
                target_sequence_number: 5,
            }
        );
    }

    #[test]
    fn test_unknown_type_is_passthrough() {
        let raw = r#"{"type":"control","sequenceNumber":9,"minimumSequenceNumber":4}"#;
        let message: SequencedMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(message.message_type, MessageType::Unknown);
        assert_eq!(
            ProtocolOp::decode(&message).unwrap(),
            ProtocolOp::Passthrough(MessageType::Unknown)
        );
    }

    #[test]
    fn test_wire_field_names() {
        let message = SequencedMessage::reject("bob", 2, 5, 6, 5);
        let encoded = serde_json::to_value(&message).unwrap();
        assert_eq!(encoded["type"], json!("reject"));
        assert_eq!(encoded["clientId"], json!("bob"));
        assert_eq!(encoded["sequenceNumber"], json!(6));
        assert_eq!(encoded["minimumSequenceNumber"], json!(5));
        assert!(encoded.get("data").is_none());
    }

    #[test]
    fn test_protocol_kinds() {
        assert!(MessageType::Reject.is_protocol());
        assert!(MessageType::SummaryNack.is_protocol());
        assert!(!MessageType::Operation.is_protocol());
        assert!(!MessageType::Unknown.is_protocol());
    }
}
