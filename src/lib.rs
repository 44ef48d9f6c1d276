//! Replicated session protocol.
//!
//! Every replica of a collaborative session consumes the same totally
//! ordered op stream and derives identical membership, proposal
//! outcomes, and watermarks from it without any extra coordination.
//!
//! - [`protocol`]: the deterministic core (ops, quorum, handler, summaries)
//! - [`session`]: threaded hosting, a local sequencer, and a history checker

pub mod protocol;
pub mod session;

pub use protocol::{ProtocolOpHandler, ProtocolState, Quorum, SequencedMessage};
pub use session::{spawn_session, SessionConfig};
