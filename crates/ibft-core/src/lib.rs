//! Transport-agnostic IBFT 2.0 consensus core.
//!
//! A host wires up a [`context::RoundContext`] — transport, message
//! feed, quorum policy, hashing, signature recovery, signing, block
//! source, and a verifier over its validator set — and drives one
//! sequence at a time with [`sequencer::Sequencer::finalize`].

#![cfg_attr(not(test), deny(clippy::unwrap_used))]

pub mod cache;
pub mod context;
pub mod encoding;
pub mod error;
pub mod message;
pub mod sequencer;
pub mod state;
pub mod store;
pub mod view;

#[cfg(test)]
mod test_support;

pub use context::RoundContext;
pub use error::{Error, Result};
pub use message::{
    Commit, CommitSeal, ConsensusMessage, FinalizedBlock, OutboundMessage, Prepare,
    PreparedCertificate, Proposal, ProposedBlock, RoundChange, RoundChangeCertificate, ValidatorId,
};
pub use sequencer::Sequencer;
pub use state::SequencerState;
pub use store::ConsensusStore;
pub use view::View;
