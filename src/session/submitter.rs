//! Channel-backed outbound side channel.

use crossbeam_channel::Sender;
use serde_json::Value;

use crate::protocol::OpSubmitter;

/// An op a replica asked to have sequenced.
#[derive(Clone, Debug, PartialEq)]
pub enum OutboundOp {
    Propose {
        key: String,
        value: Value,
        client_sequence_number: u64,
    },
    Reject {
        sequence_number: u64,
    },
}

/// Forwards outbound ops to whoever owns the receiving end, usually a sequencer.
pub struct ChannelSubmitter {
    tx: Sender<OutboundOp>,
    next_client_sequence_number: u64,
}

impl ChannelSubmitter {
    pub fn new(tx: Sender<OutboundOp>) -> Self {
        ChannelSubmitter {
            tx,
            next_client_sequence_number: 0,
        }
    }

    fn send(&self, op: OutboundOp) {
        if self.tx.send(op).is_err() {
            tracing::warn!("outbound channel closed, op discarded");
        }
    }
}

impl OpSubmitter for ChannelSubmitter {
    fn send_proposal(&mut self, key: &str, value: &Value) -> u64 {
        self.next_client_sequence_number += 1;
        let client_sequence_number = self.next_client_sequence_number;
        self.send(OutboundOp::Propose {
            key: key.to_string(),
            value: value.clone(),
            client_sequence_number,
        });
        client_sequence_number
    }

    fn send_reject(&mut self, sequence_number: u64) {
        self.send(OutboundOp::Reject { sequence_number });
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::unbounded;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_client_sequence_numbers_increase() {
        let (tx, rx) = unbounded();
        let mut submitter = ChannelSubmitter::new(tx);

        assert_eq!(submitter.send_proposal("a", &json!(1)), 1);
        assert_eq!(submitter.send_proposal("b", &json!(2)), 2);
        submitter.send_reject(9);

        let sent: Vec<_> = rx.try_iter().collect();
        assert_eq!(sent.len(), 3);
        assert_eq!(
            sent[1],
            OutboundOp::Propose {
                key: "b".to_string(),
                value: json!(2),
                client_sequence_number: 2,
            }
        );
        assert_eq!(sent[2], OutboundOp::Reject { sequence_number: 9 });
    }

    #[test]
    fn test_closed_channel_is_not_fatal() {
        let (tx, rx) = unbounded();
        drop(rx);
        let mut submitter = ChannelSubmitter::new(tx);
        assert_eq!(submitter.send_proposal("a", &json!(null)), 1);
    }
}
