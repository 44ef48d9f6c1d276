//! Session integration tests.
//!
//! Replicas run on their own threads and are fed streams produced by the
//! local sequencer. Randomized streams are seeded so failures reproduce.

use std::time::Duration;

use crossbeam_channel::unbounded;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use crate::protocol::{
    HandlerStatus, LocalProposalStatus, MessageType, NullSubmitter, ProtocolError, ProtocolOpHandler,
    ProtocolViolation, QuorumError, QuorumEvent, SequencedMessage,
};
use crate::session::checker::{Checker, History};
use crate::session::config::SessionConfig;
use crate::session::runner::{spawn_session, FeedError, SessionError};
use crate::session::sequencer::LocalSequencer;
use crate::session::submitter::{ChannelSubmitter, OutboundOp};

const CLIENTS: [&str; 4] = ["alice", "bob", "carol", "dave"];
const KEYS: [&str; 3] = ["code", "schema", "quota"];

fn observer(branch_id: &str) -> ProtocolOpHandler {
    ProtocolOpHandler::new(branch_id, Box::new(NullSubmitter::new()))
}

/// A random but valid op stream, ending with every proposal resolved.
fn generate_stream(seed: u64, len: usize) -> Vec<SequencedMessage> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut sequencer = LocalSequencer::new();
    let mut proposals: Vec<u64> = Vec::new();
    let mut departed: Vec<String> = Vec::new();
    let mut stream = Vec::new();

    while stream.len() < len {
        let connected: Vec<String> = sequencer.clients().keys().cloned().collect();
        let idle: Vec<&str> = CLIENTS
            .iter()
            .copied()
            .filter(|id| !sequencer.clients().contains_key(*id))
            .collect();

        let message = match rng.gen_range(0..11) {
            0 | 1 if !idle.is_empty() => {
                let id = idle[rng.gen_range(0..idle.len())];
                departed.retain(|gone| gone != id);
                sequencer.join(id, json!({ "user": id })).unwrap()
            }
            2 if connected.len() > 1 => {
                let id = &connected[rng.gen_range(0..connected.len())];
                departed.push(id.clone());
                sequencer.leave(id).unwrap()
            }
            3..=5 if !connected.is_empty() => {
                let id = &connected[rng.gen_range(0..connected.len())];
                let key = KEYS[rng.gen_range(0..KEYS.len())];
                sequencer.propose(id, key, json!(rng.gen_range(0..100))).unwrap()
            }
            6 if !connected.is_empty() && !proposals.is_empty() => {
                let id = &connected[rng.gen_range(0..connected.len())];
                let target = proposals[rng.gen_range(0..proposals.len())];
                sequencer.reject(id, target).unwrap()
            }
            7 if !connected.is_empty() => {
                let id = &connected[rng.gen_range(0..connected.len())];
                let seen = sequencer.sequence_number();
                sequencer.acknowledge(id, seen).unwrap();
                continue;
            }
            8 => {
                sequencer.acknowledge_all();
                continue;
            }
            9 if !departed.is_empty() && !proposals.is_empty() => {
                // A reject from a client that already left, which every replica ignores.
                let id = &departed[rng.gen_range(0..departed.len())];
                let target = proposals[rng.gen_range(0..proposals.len())];
                let stamp = sequencer.noop();
                SequencedMessage::reject(id, 1, target, stamp.sequence_number, stamp.minimum_sequence_number)
            }
            _ => sequencer.noop(),
        };

        if message.message_type == MessageType::Propose {
            proposals.push(message.sequence_number);
        }
        stream.push(message);
    }

    // Two full rounds move the MSN past every proposal in the stream.
    for _ in 0..2 {
        sequencer.acknowledge_all();
        stream.push(sequencer.noop());
    }
    stream
}

#[test]
fn test_randomized_replicas_agree() {
    let config = SessionConfig::default();

    for seed in [1, 7, 42] {
        let stream = generate_stream(seed, 200);

        let sessions: Vec<_> = (0..3).map(|_| spawn_session(&config, observer("main"))).collect();
        let (mut feeds, handles): (Vec<_>, Vec<_>) = sessions.into_iter().unzip();
        for message in &stream {
            for feed in feeds.iter_mut() {
                feed.append(message.clone(), false).unwrap();
            }
        }

        let states: Vec<_> = handles.iter().map(|h| h.get_state().unwrap()).collect();
        let comparison = Checker::compare_replicas(&states);
        assert!(comparison.passed, "seed {}: {:?}", seed, comparison.violations);

        let fingerprints: Vec<_> = handles
            .iter()
            .map(|h| h.capture_summary().unwrap().fingerprint().unwrap())
            .collect();
        assert!(fingerprints.windows(2).all(|pair| pair[0] == pair[1]), "seed {}", seed);

        let state = &states[0];
        assert_eq!(state.sequence_number, stream.len() as u64);
        assert!(state.proposals.is_empty(), "seed {}: {:?}", seed, state.proposals);
        assert!(!state.values.is_empty(), "seed {}", seed);

        for handle in &handles {
            assert_eq!(handle.status().unwrap(), HandlerStatus::Running);
        }
    }
}

#[test]
fn test_randomized_history_passes_checker() {
    for seed in [3, 11] {
        let mut handler = observer("main");
        let mut history = History::new();
        for message in generate_stream(seed, 300) {
            handler.process_message(&message, false).unwrap();
            history.record(message, handler.get_protocol_state());
        }

        let result = Checker::new().verify(&history);
        assert!(result.passed, "seed {}: {:?}", seed, result.violations);
        assert_eq!(result.stats.dropped_operations, 0);
        assert_eq!(result.stats.final_values, handler.get_protocol_state().values.len());
    }
}

#[test]
fn test_late_joiner_from_summary_converges() {
    let stream = generate_stream(5, 240);
    let (head, tail) = stream.split_at(120);

    let mut full = observer("main");
    for message in &stream {
        full.process_message(message, false).unwrap();
    }

    let mut early = observer("main");
    for message in head {
        early.process_message(message, false).unwrap();
    }
    let summary = early.capture_summary().unwrap();

    let mut late = ProtocolOpHandler::from_summary(&summary, Box::new(NullSubmitter::new())).unwrap();
    assert_eq!(late.get_protocol_state(), early.get_protocol_state());

    let mut history = History::new();
    for message in tail {
        late.process_message(message, false).unwrap();
        history.record(message.clone(), late.get_protocol_state());
    }

    assert_eq!(late.get_protocol_state(), full.get_protocol_state());
    assert_eq!(
        late.capture_summary().unwrap().fingerprint().unwrap(),
        full.capture_summary().unwrap().fingerprint().unwrap()
    );

    let result = Checker::starting_from(early.get_protocol_state()).verify(&history);
    assert!(result.passed, "{:?}", result.violations);
}

#[test]
fn test_outbound_proposal_round_trip() {
    let (outbound_tx, outbound_rx) = unbounded();
    let handler = ProtocolOpHandler::new("main", Box::new(ChannelSubmitter::new(outbound_tx)));
    let (mut feed, handle) = spawn_session(&SessionConfig::default(), handler);
    let mut sequencer = LocalSequencer::new();

    feed.append(sequencer.join("alice", json!({})).unwrap(), true).unwrap();
    feed.append(sequencer.join("bob", json!({})).unwrap(), false).unwrap();

    let client_sequence_number = handle.propose("code", json!("pkg@1")).unwrap();
    assert_eq!(
        handle.local_proposal(client_sequence_number).unwrap(),
        Some(LocalProposalStatus::Submitted)
    );

    let outbound = outbound_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(
        outbound,
        OutboundOp::Propose {
            key: "code".to_string(),
            value: json!("pkg@1"),
            client_sequence_number,
        }
    );

    let propose = sequencer.submit_outbound("alice", outbound).unwrap();
    let proposal_sequence_number = propose.sequence_number;
    feed.append(propose, true).unwrap();
    assert_eq!(
        handle.local_proposal(client_sequence_number).unwrap(),
        Some(LocalProposalStatus::Sequenced(proposal_sequence_number))
    );

    // The first round only brings the MSN up to the proposal itself.
    sequencer.acknowledge_all();
    feed.append(sequencer.noop(), false).unwrap();
    assert!(handle.get_state().unwrap().values.is_empty());

    sequencer.acknowledge_all();
    feed.append(sequencer.noop(), false).unwrap();
    assert_eq!(
        handle.local_proposal(client_sequence_number).unwrap(),
        Some(LocalProposalStatus::Approved(proposal_sequence_number))
    );

    let state = handle.get_state().unwrap();
    assert_eq!(state.values.len(), 1);
    assert_eq!(state.values[0].1.value, json!("pkg@1"));

    let events: Vec<_> = handle.events().try_iter().collect();
    assert_eq!(events.len(), 4);
    assert!(matches!(events[2], QuorumEvent::AddProposal { local: true, .. }));
    assert!(matches!(events[3], QuorumEvent::ApproveProposal { local: true, .. }));
}

#[test]
fn test_outbound_reject_round_trip() {
    let (outbound_tx, outbound_rx) = unbounded();
    let handler = ProtocolOpHandler::new("main", Box::new(ChannelSubmitter::new(outbound_tx)));
    let (mut feed, handle) = spawn_session(&SessionConfig::default(), handler);
    let mut sequencer = LocalSequencer::new();

    feed.append(sequencer.join("alice", json!({})).unwrap(), true).unwrap();
    feed.append(sequencer.join("bob", json!({})).unwrap(), false).unwrap();
    let propose = sequencer.propose("bob", "code", json!("bad")).unwrap();
    let target = propose.sequence_number;
    feed.append(propose, false).unwrap();

    assert!(matches!(
        handle.reject(999),
        Err(SessionError::Quorum(QuorumError::NoSuchProposal(999)))
    ));
    handle.reject(target).unwrap();

    let outbound = outbound_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(outbound, OutboundOp::Reject { sequence_number: target });
    feed.append(sequencer.submit_outbound("alice", outbound).unwrap(), true)
        .unwrap();

    for _ in 0..2 {
        sequencer.acknowledge_all();
        feed.append(sequencer.noop(), false).unwrap();
    }

    let state = handle.get_state().unwrap();
    assert!(state.proposals.is_empty());
    assert!(state.values.is_empty());
}

#[test]
fn test_departed_rejecter_in_stream_is_ignored() {
    let mut handler = observer("main");
    let mut history = History::new();
    let mut ghost_rejects = 0;
    for message in generate_stream(13, 400) {
        if message.message_type == MessageType::Reject {
            let rejecter = message.client_id.as_deref().unwrap_or_default();
            if handler.quorum().member(rejecter).is_none() {
                ghost_rejects += 1;
            }
        }
        handler.process_message(&message, false).unwrap();
        history.record(message, handler.get_protocol_state());
    }
    assert!(ghost_rejects > 0);

    let result = Checker::new().verify(&history);
    assert!(result.passed, "{:?}", result.violations);
    assert!(handler.get_protocol_state().proposals.is_empty());
}

#[test]
fn test_unread_events_are_bounded() {
    let config = SessionConfig {
        event_capacity: 2,
        ..SessionConfig::default()
    };
    let (mut feed, handle) = spawn_session(&config, observer("main"));
    let mut sequencer = LocalSequencer::new();

    for id in CLIENTS {
        feed.append(sequencer.join(id, json!({})).unwrap(), false).unwrap();
    }
    assert_eq!(handle.get_state().unwrap().members.len(), CLIENTS.len());
    assert_eq!(handle.events().len(), 2);

    // The oldest events are kept; the overflow is discarded.
    let events: Vec<_> = handle.events().try_iter().collect();
    assert!(matches!(&events[0], QuorumEvent::AddMember { client_id, .. } if client_id == "alice"));
    assert!(matches!(&events[1], QuorumEvent::AddMember { client_id, .. } if client_id == "bob"));

    feed.append(sequencer.leave("dave").unwrap(), false).unwrap();
    handle.get_state().unwrap();
    let events: Vec<_> = handle.events().try_iter().collect();
    assert!(matches!(events.as_slice(), [QuorumEvent::RemoveMember { client_id }] if client_id == "dave"));
}

#[test]
fn test_feed_refuses_out_of_order_append() {
    let (mut feed, handle) = spawn_session(&SessionConfig::default(), observer("main"));
    feed.append(SequencedMessage::noop(1, 0), false).unwrap();

    assert_eq!(
        feed.append(SequencedMessage::noop(1, 0), false),
        Err(FeedError::OutOfOrder { previous: 1, found: 1 })
    );
    assert_eq!(feed.last_sequence_number(), 1);
    assert_eq!(handle.get_state().unwrap().sequence_number, 1);
}

#[test]
fn test_halted_session_still_answers_reads() {
    let (mut feed, mut handle) = spawn_session(&SessionConfig::default(), observer("main"));
    feed.append(SequencedMessage::noop(1, 1), false).unwrap();
    feed.append(SequencedMessage::noop(2, 0), false).unwrap();
    feed.append(SequencedMessage::noop(3, 3), false).unwrap();

    assert_eq!(handle.status().unwrap(), HandlerStatus::Halted);
    assert_eq!(handle.get_state().unwrap().sequence_number, 1);

    let failure = handle.stop().unwrap();
    assert_eq!(
        failure,
        Some(ProtocolError::Violation(ProtocolViolation::MinimumSequenceRegression {
            previous: 1,
            found: 0,
        }))
    );
    assert!(matches!(handle.get_state(), Err(SessionError::Closed)));
    assert_eq!(feed.append(SequencedMessage::noop(4, 3), false), Err(FeedError::Closed));
}

#[test]
fn test_session_starts_from_loaded_state() {
    let stream = generate_stream(9, 60);
    let mut source = observer("doc");
    for message in &stream {
        source.process_message(message, false).unwrap();
    }
    let summary = source.capture_summary().unwrap();

    let handler = ProtocolOpHandler::from_summary(&summary, Box::new(NullSubmitter::new())).unwrap();
    let (mut feed, handle) = spawn_session(&SessionConfig::default(), handler);
    assert_eq!(handle.branch_id(), "doc");
    assert_eq!(feed.last_sequence_number(), source.sequence_number());

    let stale = stream[0].clone();
    assert!(matches!(feed.append(stale, false), Err(FeedError::OutOfOrder { .. })));
    assert_eq!(handle.capture_summary().unwrap(), summary);
}
