//! Error kinds for the consensus core.
//!
//! Validity failures and round-expiry are protocol-internal signals, not
//! surfaced failures: a Byzantine sender must never be able to halt an
//! honest sequence by crafting a malformed message. Only [`Error::Cancelled`]
//! and [`Error::ProtocolFault`] propagate out of [`crate::sequencer::Sequencer::finalize`].

use crate::message::ValidatorId;
use crate::view::View;

/// Errors surfaced by the consensus core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The host's context was cancelled; not a protocol failure.
    #[error("sequence cancelled by host")]
    Cancelled,

    /// A message failed a validity predicate and was dropped.
    ///
    /// Carried as a distinct variant (rather than logged-and-discarded
    /// inline) so callers that want to audit rejected messages can do so;
    /// the sequencer itself never lets this variant escape `finalize`.
    #[error("invalid {class} message from {from:?} at {view:?}: {reason}")]
    InvalidMessage {
        class: &'static str,
        from: ValidatorId,
        view: View,
        reason: &'static str,
    },

    /// A round's timeout expired. Defined for parity with the source
    /// design's four error kinds; this implementation models round
    /// expiry as a return value of the round-change watcher rather than
    /// a raised error, so this variant is never constructed.
    #[allow(dead_code)]
    #[error("round {round} of sequence {sequence} expired")]
    RoundExpired { sequence: u64, round: u64 },

    /// Should-be-unreachable invariant violation. Fatal for the sequence.
    #[error("protocol invariant violated: {0}")]
    ProtocolFault(&'static str),

    /// `MessageStore::add` rejected a syntactically malformed message.
    #[error("store rejected message: {0}")]
    Store(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
