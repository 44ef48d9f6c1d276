//! Threaded session runner.
//!
//! One thread owns the [`ProtocolOpHandler`] for a session. Ops and reads
//! arrive on a single command channel, so an op appended before a read is
//! always applied before that read is answered. [`OpFeed`] is the only way
//! to append ops and it is not `Clone`: one writer per session.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde_json::Value;
use thiserror::Error;

use crate::protocol::{
    HandlerStatus, LocalProposalStatus, ProcessOutcome, ProtocolError, ProtocolOpHandler,
    ProtocolState, QuorumError, QuorumEvent, SequencedMessage, SummaryError, SummaryTree,
};

use super::config::SessionConfig;

/// Errors from appending to an [`OpFeed`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("session thread has stopped")]
    Closed,

    #[error("op {found} appended after {previous}")]
    OutOfOrder { previous: u64, found: u64 },
}

/// Errors from requests to a running session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session thread has stopped")]
    Closed,

    #[error("no reply from session thread within {0:?}")]
    Timeout(Duration),

    #[error("session thread panicked")]
    Panicked,

    #[error(transparent)]
    Summary(#[from] SummaryError),

    #[error(transparent)]
    Quorum(#[from] QuorumError),
}

/// Commands understood by a session thread.
#[derive(Debug)]
pub enum SessionCommand {
    Apply {
        message: SequencedMessage,
        local: bool,
    },
    GetState(Sender<ProtocolState>),
    GetStatus(Sender<HandlerStatus>),
    CaptureSummary(Sender<Result<SummaryTree, SummaryError>>),
    Propose {
        key: String,
        value: Value,
        reply: Sender<u64>,
    },
    Reject {
        sequence_number: u64,
        reply: Sender<Result<(), QuorumError>>,
    },
    LocalProposal {
        client_sequence_number: u64,
        reply: Sender<Option<LocalProposalStatus>>,
    },
    Stop,
}

/// Start a session thread that owns `handler`.
pub fn spawn_session(config: &SessionConfig, handler: ProtocolOpHandler) -> (OpFeed, SessionHandle) {
    let (command_tx, command_rx) = bounded(config.feed_capacity);
    let (events_tx, events_rx) = bounded(config.event_capacity);
    let last_sequence_number = handler.sequence_number();
    let branch_id = handler.branch_id().to_string();

    let runner = SessionRunner {
        handler,
        command_rx,
        events_tx,
        dropped_events: 0,
        failure: None,
    };
    let thread_handle = thread::Builder::new()
        .name(format!("session-{}", branch_id))
        .spawn(move || runner.run());

    let thread_handle = match thread_handle {
        Ok(handle) => Some(handle),
        Err(error) => {
            tracing::error!(branch = %branch_id, %error, "failed to spawn session thread");
            None
        }
    };

    let feed = OpFeed {
        command_tx: command_tx.clone(),
        last_sequence_number,
    };
    let handle = SessionHandle {
        branch_id,
        command_tx,
        events_rx,
        thread_handle,
        reply_timeout: config.reply_timeout(),
    };
    (feed, handle)
}

// =============================================================================
// FEED
// =============================================================================

/// Single writer for a session's op stream.
pub struct OpFeed {
    command_tx: Sender<SessionCommand>,
    last_sequence_number: u64,
}

impl OpFeed {
    /// Queue `message` for application. Sequence numbers must strictly increase.
    pub fn append(&mut self, message: SequencedMessage, local: bool) -> Result<(), FeedError> {
        if message.sequence_number <= self.last_sequence_number {
            return Err(FeedError::OutOfOrder {
                previous: self.last_sequence_number,
                found: message.sequence_number,
            });
        }
        let sequence_number = message.sequence_number;
        self.command_tx
            .send(SessionCommand::Apply { message, local })
            .map_err(|_| FeedError::Closed)?;
        self.last_sequence_number = sequence_number;
        Ok(())
    }

    pub fn last_sequence_number(&self) -> u64 {
        self.last_sequence_number
    }
}

// =============================================================================
// HANDLE
// =============================================================================

/// Read and control handle for a session thread.
pub struct SessionHandle {
    branch_id: String,
    command_tx: Sender<SessionCommand>,
    events_rx: Receiver<QuorumEvent>,
    thread_handle: Option<JoinHandle<Option<ProtocolError>>>,
    reply_timeout: Duration,
}

impl SessionHandle {
    pub fn branch_id(&self) -> &str {
        &self.branch_id
    }

    /// Quorum events in application order.
    ///
    /// At most `event_capacity` unread events are buffered. Once the buffer is
    /// full, newer events are discarded until the host reads.
    pub fn events(&self) -> &Receiver<QuorumEvent> {
        &self.events_rx
    }

    pub fn get_state(&self) -> Result<ProtocolState, SessionError> {
        self.request(SessionCommand::GetState)
    }

    pub fn status(&self) -> Result<HandlerStatus, SessionError> {
        self.request(SessionCommand::GetStatus)
    }

    pub fn capture_summary(&self) -> Result<SummaryTree, SessionError> {
        Ok(self.request(SessionCommand::CaptureSummary)??)
    }

    /// Submit a proposal through the handler's submitter.
    pub fn propose(&self, key: &str, value: Value) -> Result<u64, SessionError> {
        let key = key.to_string();
        self.request(|reply| SessionCommand::Propose { key, value, reply })
    }

    pub fn reject(&self, sequence_number: u64) -> Result<(), SessionError> {
        Ok(self.request(|reply| SessionCommand::Reject {
            sequence_number,
            reply,
        })??)
    }

    pub fn local_proposal(&self, client_sequence_number: u64) -> Result<Option<LocalProposalStatus>, SessionError> {
        self.request(|reply| SessionCommand::LocalProposal {
            client_sequence_number,
            reply,
        })
    }

    /// Stop the thread after it drains queued ops.
    ///
    /// Returns the violation that halted the handler, if any.
    pub fn stop(&mut self) -> Result<Option<ProtocolError>, SessionError> {
        let Some(handle) = self.thread_handle.take() else {
            return Ok(None);
        };
        let _ = self.command_tx.send(SessionCommand::Stop);
        handle.join().map_err(|_| SessionError::Panicked)
    }

    fn request<T>(&self, command: impl FnOnce(Sender<T>) -> SessionCommand) -> Result<T, SessionError> {
        if self.thread_handle.is_none() {
            return Err(SessionError::Closed);
        }
        let (reply_tx, reply_rx) = bounded(1);
        self.command_tx
            .send(command(reply_tx))
            .map_err(|_| SessionError::Closed)?;
        reply_rx
            .recv_timeout(self.reply_timeout)
            .map_err(|error| match error {
                crossbeam_channel::RecvTimeoutError::Timeout => SessionError::Timeout(self.reply_timeout),
                crossbeam_channel::RecvTimeoutError::Disconnected => SessionError::Closed,
            })
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Err(error) = self.stop() {
            tracing::error!(branch = %self.branch_id, %error, "session thread did not stop cleanly");
        }
    }
}

// =============================================================================
// RUNNER
// =============================================================================

struct SessionRunner {
    handler: ProtocolOpHandler,
    command_rx: Receiver<SessionCommand>,
    events_tx: Sender<QuorumEvent>,
    dropped_events: u64,
    failure: Option<ProtocolError>,
}

impl SessionRunner {
    fn run(mut self) -> Option<ProtocolError> {
        tracing::debug!(branch = %self.handler.branch_id(), "session thread started");

        while let Ok(command) = self.command_rx.recv() {
            match command {
                SessionCommand::Apply { message, local } => self.apply(&message, local),
                SessionCommand::GetState(reply) => {
                    let _ = reply.send(self.handler.get_protocol_state());
                }
                SessionCommand::GetStatus(reply) => {
                    let _ = reply.send(self.handler.status());
                }
                SessionCommand::CaptureSummary(reply) => {
                    let _ = reply.send(self.handler.capture_summary());
                }
                SessionCommand::Propose { key, value, reply } => {
                    let _ = reply.send(self.handler.quorum_mut().propose(&key, &value));
                }
                SessionCommand::Reject {
                    sequence_number,
                    reply,
                } => {
                    let _ = reply.send(self.handler.quorum_mut().reject(sequence_number));
                }
                SessionCommand::LocalProposal {
                    client_sequence_number,
                    reply,
                } => {
                    let _ = reply.send(self.handler.quorum().local_proposal(client_sequence_number));
                }
                SessionCommand::Stop => break,
            }
        }

        tracing::debug!(
            branch = %self.handler.branch_id(),
            sequence_number = self.handler.sequence_number(),
            dropped_events = self.dropped_events,
            "session thread stopped"
        );
        self.failure
    }

    fn apply(&mut self, message: &SequencedMessage, local: bool) {
        // After a halt, ops are discarded; reads keep answering.
        if self.failure.is_some() {
            return;
        }
        match self.handler.process_message(message, local) {
            Ok(ProcessOutcome::Applied { events, .. }) | Ok(ProcessOutcome::Dropped { events, .. }) => {
                self.publish(events);
            }
            Err(error) => {
                tracing::error!(branch = %self.handler.branch_id(), %error, "session halted");
                self.failure = Some(error);
            }
        }
    }

    fn publish(&mut self, events: Vec<QuorumEvent>) {
        for event in events {
            match self.events_tx.try_send(event) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped_events += 1;
                    tracing::warn!(
                        branch = %self.handler.branch_id(),
                        dropped_events = self.dropped_events,
                        "event buffer full, discarding quorum event"
                    );
                }
            }
        }
    }
}
