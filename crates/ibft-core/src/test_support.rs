//! Minimal fakes shared by unit tests across this crate. Not part of
//! the public API.

use bytes::Bytes;

use crate::context::{BlockSource, MessageFeed, Signer, Transport};
use crate::message::{Commit, OutboundMessage, Prepare, Proposal, RoundChange, ValidatorId};
use crate::store::{MessageStore, Subscription};
use crate::view::View;

pub struct NullTransport;
impl Transport for NullTransport {
    fn multicast(&self, _message: OutboundMessage) {}
}

pub struct NullSigner;
impl Signer for NullSigner {
    fn sign(&self, _data: &[u8]) -> Bytes {
        Bytes::new()
    }
}

pub struct FixedBlockSource {
    pub id: ValidatorId,
    pub block: Bytes,
}
impl BlockSource for FixedBlockSource {
    fn id(&self) -> ValidatorId {
        self.id.clone()
    }
    fn build_block(&self, _sequence: u64) -> Bytes {
        self.block.clone()
    }
}

/// A feed backed by four empty, freshly subscribed stores — enough for
/// tests that never expect a message to actually arrive.
pub struct NullFeed;
impl MessageFeed for NullFeed {
    fn subscribe_proposals(&self, view: View, higher_rounds: bool) -> Subscription<Proposal> {
        MessageStore::new().subscribe(view, higher_rounds)
    }
    fn subscribe_prepares(&self, view: View, higher_rounds: bool) -> Subscription<Prepare> {
        MessageStore::new().subscribe(view, higher_rounds)
    }
    fn subscribe_commits(&self, view: View, higher_rounds: bool) -> Subscription<Commit> {
        MessageStore::new().subscribe(view, higher_rounds)
    }
    fn subscribe_round_changes(&self, view: View, higher_rounds: bool) -> Subscription<RoundChange> {
        MessageStore::new().subscribe(view, higher_rounds)
    }
}
