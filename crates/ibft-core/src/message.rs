//! The four consensus message classes, `ProposedBlock`, the two
//! certificate types, and the `FinalizedBlock` result.

use bytes::Bytes;

use crate::encoding::{write_bytes, write_option, write_repeated, write_u64, CanonicalEncode};
use crate::view::View;

/// Opaque sender identity. The core never interprets these bytes; it
/// only compares them for equality and passes them to the host's
/// `Verifier`/`SignatureRecovery` collaborators.
pub type ValidatorId = Bytes;

/// A trait implemented by each of the four message classes, giving the
/// [`crate::store::MessageStore`] a uniform way to extract the
/// `(sequence, round, from)` triple it indexes by.
pub trait ConsensusMessage: Clone + Send + Sync + 'static {
    const CLASS: &'static str;

    fn view(&self) -> View;
    fn from(&self) -> &ValidatorId;
    fn signature(&self) -> &Bytes;
}

/// A block proposal together with the round it was first proposed at.
///
/// The round is part of the hashed payload: the same block bytes
/// proposed in different rounds hash differently, so a stale proposal
/// from an earlier round can never be mistaken for a current one.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProposedBlock {
    pub block: Bytes,
    pub round: u64,
}

impl CanonicalEncode for ProposedBlock {
    fn encode_canonical(&self, buf: &mut Vec<u8>) {
        write_bytes(buf, &self.block);
        write_u64(buf, self.round);
    }
}

/// Witnesses that `proposal_message`'s sender saw a quorum of prepares
/// for one block in a past round.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PreparedCertificate {
    pub proposal_message: Proposal,
    pub prepare_messages: Vec<Prepare>,
}

impl PreparedCertificate {
    /// The round at which this certificate's proposal was made — used
    /// to pick the "highest PC round" among several RCC entries.
    pub fn round(&self) -> u64 {
        self.proposal_message.proposed_block.round
    }
}

impl CanonicalEncode for PreparedCertificate {
    fn encode_canonical(&self, buf: &mut Vec<u8>) {
        self.proposal_message.encode_canonical(buf);
        write_repeated(buf, &self.prepare_messages, |buf, p| p.encode_canonical(buf));
    }
}

/// A quorum of round-change messages for a target round, justifying a
/// new proposal at that round.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RoundChangeCertificate {
    pub messages: Vec<RoundChange>,
}

impl CanonicalEncode for RoundChangeCertificate {
    fn encode_canonical(&self, buf: &mut Vec<u8>) {
        write_repeated(buf, &self.messages, |buf, m| m.encode_canonical(buf));
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Proposal {
    pub view: View,
    pub from: ValidatorId,
    pub signature: Bytes,
    pub proposed_block: ProposedBlock,
    pub block_hash: Bytes,
    pub round_change_certificate: Option<RoundChangeCertificate>,
}

impl ConsensusMessage for Proposal {
    const CLASS: &'static str = "Proposal";

    fn view(&self) -> View {
        self.view
    }

    fn from(&self) -> &ValidatorId {
        &self.from
    }

    fn signature(&self) -> &Bytes {
        &self.signature
    }
}

impl CanonicalEncode for Proposal {
    fn encode_canonical(&self, buf: &mut Vec<u8>) {
        self.view.encode_canonical(buf);
        write_bytes(buf, &self.from);
        self.proposed_block.encode_canonical(buf);
        write_bytes(buf, &self.block_hash);
        write_option(buf, &self.round_change_certificate, |buf, rcc| {
            rcc.encode_canonical(buf)
        });
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Prepare {
    pub view: View,
    pub from: ValidatorId,
    pub signature: Bytes,
    pub block_hash: Bytes,
}

impl ConsensusMessage for Prepare {
    const CLASS: &'static str = "Prepare";

    fn view(&self) -> View {
        self.view
    }

    fn from(&self) -> &ValidatorId {
        &self.from
    }

    fn signature(&self) -> &Bytes {
        &self.signature
    }
}

impl CanonicalEncode for Prepare {
    fn encode_canonical(&self, buf: &mut Vec<u8>) {
        self.view.encode_canonical(buf);
        write_bytes(buf, &self.from);
        write_bytes(buf, &self.block_hash);
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Commit {
    pub view: View,
    pub from: ValidatorId,
    pub signature: Bytes,
    pub block_hash: Bytes,
    pub commit_seal: Bytes,
}

impl ConsensusMessage for Commit {
    const CLASS: &'static str = "Commit";

    fn view(&self) -> View {
        self.view
    }

    fn from(&self) -> &ValidatorId {
        &self.from
    }

    fn signature(&self) -> &Bytes {
        &self.signature
    }
}

impl CanonicalEncode for Commit {
    fn encode_canonical(&self, buf: &mut Vec<u8>) {
        self.view.encode_canonical(buf);
        write_bytes(buf, &self.from);
        write_bytes(buf, &self.block_hash);
        write_bytes(buf, &self.commit_seal);
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RoundChange {
    pub view: View,
    pub from: ValidatorId,
    pub signature: Bytes,
    /// Both present or both absent (enforced by the validity predicate,
    /// not the type system, to mirror the wire format of peers that
    /// don't separately tag presence).
    pub prepared: Option<(ProposedBlock, PreparedCertificate)>,
}

impl ConsensusMessage for RoundChange {
    const CLASS: &'static str = "RoundChange";

    fn view(&self) -> View {
        self.view
    }

    fn from(&self) -> &ValidatorId {
        &self.from
    }

    fn signature(&self) -> &Bytes {
        &self.signature
    }
}

impl CanonicalEncode for RoundChange {
    fn encode_canonical(&self, buf: &mut Vec<u8>) {
        self.view.encode_canonical(buf);
        write_bytes(buf, &self.from);
        write_option(buf, &self.prepared, |buf, (block, pc)| {
            block.encode_canonical(buf);
            pc.encode_canonical(buf);
        });
    }
}

/// One validator's signature over the finalized block hash, carried in
/// the output [`FinalizedBlock`] as proof of commitment.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CommitSeal {
    pub from: ValidatorId,
    pub commit_seal: Bytes,
}

/// The output of a completed sequence.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FinalizedBlock {
    pub block: Bytes,
    pub seals: Vec<CommitSeal>,
    pub round: u64,
}

/// Any one of the four message classes, for `Transport::multicast`,
/// which must be able to send whichever message the sequencer just
/// produced without the host matching on a class-specific method name.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Proposal(Proposal),
    Prepare(Prepare),
    Commit(Commit),
    RoundChange(RoundChange),
}
