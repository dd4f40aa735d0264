//! End-to-end scenarios (S1-S6) against hand-rolled fakes: no mock
//! framework, just plain structs implementing the collaborator traits.

use std::time::Duration;

use bytes::Bytes;
use ibft_core::context::{
    BlockSource, CancelSignal, Hasher, Quorum, RoundContext, RoundTimeoutPolicy, SignatureRecovery,
    Signer, Transport, Verifier,
};
use ibft_core::encoding::CanonicalEncode;
use ibft_core::{
    ConsensusStore, FinalizedBlock, OutboundMessage, Prepare, PreparedCertificate, Proposal,
    ProposedBlock, RoundChange, RoundChangeCertificate, Sequencer,
};
use sha3::{Digest, Keccak256};

struct Sha3Hasher;
impl Hasher for Sha3Hasher {
    fn hash(&self, data: &[u8]) -> Bytes {
        Bytes::copy_from_slice(&Keccak256::digest(data))
    }
}

/// Treats the "signature" as the signer's raw id: enough to exercise
/// the validity predicates without a real signature scheme.
struct IdentitySigner(Bytes);
impl Signer for IdentitySigner {
    fn sign(&self, _data: &[u8]) -> Bytes {
        self.0.clone()
    }
}

struct IdentityRecovery;
impl SignatureRecovery for IdentityRecovery {
    fn recover(&self, _data: &[u8], signature: &Bytes) -> Option<Bytes> {
        Some(signature.clone())
    }
}

struct RoundRobinVerifier {
    validators: Vec<Bytes>,
}
impl Verifier for RoundRobinVerifier {
    fn is_validator(&self, id: &Bytes, _sequence: u64) -> bool {
        self.validators.contains(id)
    }
    fn is_proposer(&self, id: &Bytes, sequence: u64, round: u64) -> bool {
        let idx = (sequence.wrapping_add(round)) as usize % self.validators.len();
        self.validators[idx] == *id
    }
    fn is_valid_block(&self, _block: &Bytes, _sequence: u64) -> bool {
        true
    }
}

struct MajorityQuorum {
    threshold: usize,
}
impl Quorum for MajorityQuorum {
    fn has_quorum(&self, senders: &[Bytes]) -> bool {
        let mut distinct: Vec<&Bytes> = senders.iter().collect();
        distinct.sort();
        distinct.dedup();
        distinct.len() >= self.threshold
    }
}

struct FixedBlockSource {
    id: Bytes,
    block: Bytes,
}
impl BlockSource for FixedBlockSource {
    fn id(&self) -> Bytes {
        self.id.clone()
    }
    fn build_block(&self, _sequence: u64) -> Bytes {
        self.block.clone()
    }
}

/// Loopback transport: a validator's multicast writes straight into the
/// one store every validator in the test shares, simulating instant,
/// reliable broadcast.
struct LoopbackTransport<'a> {
    store: &'a ConsensusStore,
}
impl Transport for LoopbackTransport<'_> {
    fn multicast(&self, message: OutboundMessage) {
        match message {
            OutboundMessage::Proposal(m) => self.store.proposals.add(m).unwrap(),
            OutboundMessage::Prepare(m) => self.store.prepares.add(m).unwrap(),
            OutboundMessage::Commit(m) => self.store.commits.add(m).unwrap(),
            OutboundMessage::RoundChange(m) => self.store.round_changes.add(m).unwrap(),
        }
    }
}

fn four_validators() -> Vec<Bytes> {
    vec![
        Bytes::from_static(b"v0"),
        Bytes::from_static(b"v1"),
        Bytes::from_static(b"v2"),
        Bytes::from_static(b"v3"),
    ]
}

fn fast_timeout() -> RoundTimeoutPolicy {
    RoundTimeoutPolicy::new(Duration::from_millis(50), Duration::from_secs(1))
}

/// S1: round-0 happy path. All four validators run `finalize`
/// concurrently against one shared store and agree on one block.
#[tokio::test]
async fn s1_round_zero_happy_path() {
    let validators = four_validators();
    let store = ConsensusStore::new();
    let verifier = RoundRobinVerifier { validators: validators.clone() };
    let hasher = Sha3Hasher;
    let sig_recovery = IdentityRecovery;
    let quorum = MajorityQuorum { threshold: 3 };
    let block = Bytes::from_static(b"b");

    let transports: Vec<LoopbackTransport> = validators.iter().map(|_| LoopbackTransport { store: &store }).collect();
    let signers: Vec<IdentitySigner> = validators.iter().map(|v| IdentitySigner(v.clone())).collect();
    let block_sources: Vec<FixedBlockSource> = validators
        .iter()
        .map(|v| FixedBlockSource { id: v.clone(), block: block.clone() })
        .collect();
    let ctxs: Vec<RoundContext> = (0..validators.len())
        .map(|i| RoundContext {
            transport: &transports[i],
            feed: &store,
            quorum: &quorum,
            hasher: &hasher,
            sig_recovery: &sig_recovery,
            signer: &signers[i],
            verifier: &verifier,
            block_source: &block_sources[i],
            cancel: CancelSignal::new(),
            round_timeout: fast_timeout(),
        })
        .collect();

    let futs = ctxs.iter().map(|ctx| Sequencer::finalize(ctx, 101));
    let results: Vec<Result<FinalizedBlock, ibft_core::Error>> = futures::future::join_all(futs).await;
    let expected_block = ProposedBlock { block: block.clone(), round: 0 };
    let expected_hash = hasher.hash(&expected_block.to_canonical_bytes());

    for result in results {
        let finalized = result.expect("every honest validator finalizes");
        assert_eq!(finalized.block, block);
        assert_eq!(finalized.round, 0);
        assert!(quorum.has_quorum(&finalized.seals.iter().map(|s| s.from.clone()).collect::<Vec<_>>()));
        for seal in &finalized.seals {
            assert_eq!(
                sig_recovery.recover(&expected_hash, &seal.commit_seal),
                Some(seal.from.clone())
            );
        }
    }
}

/// S2: no proposal arrives before the round-0 timeout; all four
/// validators round-change to round 1 and finalize there.
#[tokio::test]
async fn s2_round_change_without_prepared_block() {
    let validators = four_validators();
    let store = ConsensusStore::new();
    // Proposer for (sequence=102, round=0) never runs; everyone else
    // times out waiting and jumps to round 1.
    let proposer_round0 = validators[(102usize) % validators.len()].clone();
    let verifier = RoundRobinVerifier { validators: validators.clone() };
    let hasher = Sha3Hasher;
    let sig_recovery = IdentityRecovery;
    let quorum = MajorityQuorum { threshold: 3 };
    let block = Bytes::from_static(b"b1");

    let active: Vec<Bytes> = validators.iter().filter(|v| **v != proposer_round0).cloned().collect();
    let transports: Vec<LoopbackTransport> = active.iter().map(|_| LoopbackTransport { store: &store }).collect();
    let signers: Vec<IdentitySigner> = active.iter().map(|v| IdentitySigner(v.clone())).collect();
    let block_sources: Vec<FixedBlockSource> = active
        .iter()
        .map(|v| FixedBlockSource { id: v.clone(), block: block.clone() })
        .collect();
    let ctxs: Vec<RoundContext> = (0..active.len())
        .map(|i| RoundContext {
            transport: &transports[i],
            feed: &store,
            quorum: &quorum,
            hasher: &hasher,
            sig_recovery: &sig_recovery,
            signer: &signers[i],
            verifier: &verifier,
            block_source: &block_sources[i],
            cancel: CancelSignal::new(),
            round_timeout: fast_timeout(),
        })
        .collect();

    let futs = ctxs.iter().map(|ctx| Sequencer::finalize(ctx, 102));
    let results: Vec<Result<FinalizedBlock, ibft_core::Error>> = futures::future::join_all(futs).await;
    for result in results {
        let finalized = result.expect("the three non-proposer validators still finalize at round 1");
        assert_eq!(finalized.round, 1);
    }
}

/// S3: a round-change carrying a prepared certificate forces the
/// round-1 proposer to re-propose the same block; the PC-round rule is
/// exercised through `is_valid_proposal`.
#[test]
fn s3_pc_round_rule_rejects_a_different_block() {
    let validators = four_validators();
    let verifier = RoundRobinVerifier { validators: validators.clone() };
    let hasher = Sha3Hasher;
    let quorum = MajorityQuorum { threshold: 3 };

    let round0_proposer = validators[0].clone();
    let prepared_block = ProposedBlock { block: Bytes::from_static(b"b"), round: 0 };
    let prepared_hash = hasher.hash(&prepared_block.to_canonical_bytes());
    let round0_view = ibft_core::View::new(103, 0);

    let proposal_msg = Proposal {
        view: round0_view,
        from: round0_proposer.clone(),
        signature: Bytes::new(),
        proposed_block: prepared_block.clone(),
        block_hash: prepared_hash.clone(),
        round_change_certificate: None,
    };
    let prepares: Vec<Prepare> = validators
        .iter()
        .take(3)
        .map(|v| Prepare {
            view: round0_view,
            from: v.clone(),
            signature: Bytes::new(),
            block_hash: prepared_hash.clone(),
        })
        .collect();
    let pc = PreparedCertificate {
        proposal_message: proposal_msg,
        prepare_messages: prepares,
    };

    let round1_view = ibft_core::View::new(103, 1);
    let rcc_messages: Vec<RoundChange> = validators
        .iter()
        .take(3)
        .map(|v| RoundChange {
            view: round1_view,
            from: v.clone(),
            signature: Bytes::new(),
            prepared: Some((prepared_block.clone(), pc.clone())),
        })
        .collect();
    let rcc = RoundChangeCertificate { messages: rcc_messages };

    let round1_proposer = validators[1].clone();

    let correct_block = ProposedBlock { block: Bytes::from_static(b"b"), round: 1 };
    let correct_hash = hasher.hash(&correct_block.to_canonical_bytes());
    let correct_proposal = Proposal {
        view: round1_view,
        from: round1_proposer.clone(),
        signature: Bytes::new(),
        proposed_block: correct_block,
        block_hash: correct_hash,
        round_change_certificate: Some(rcc.clone()),
    };

    let wrong_block = ProposedBlock { block: Bytes::from_static(b"different"), round: 1 };
    let wrong_hash = hasher.hash(&wrong_block.to_canonical_bytes());
    let wrong_proposal = Proposal {
        view: round1_view,
        from: round1_proposer.clone(),
        signature: Bytes::new(),
        proposed_block: wrong_block,
        block_hash: wrong_hash,
        round_change_certificate: Some(rcc),
    };

    let sig_recovery = IdentityRecovery;
    let signer = IdentitySigner(Bytes::from_static(b"unused"));
    let transport = NoopTransport;
    let block_source = FixedBlockSource {
        id: Bytes::from_static(b"self"),
        block: Bytes::from_static(b"unused"),
    };
    let store = ibft_core::ConsensusStore::new();
    let ctx = RoundContext {
        transport: &transport,
        feed: &store,
        quorum: &quorum,
        hasher: &hasher,
        sig_recovery: &sig_recovery,
        signer: &signer,
        verifier: &verifier,
        block_source: &block_source,
        cancel: CancelSignal::new(),
        round_timeout: RoundTimeoutPolicy::default(),
    };

    assert!(ibft_core::sequencer::is_valid_proposal(
        &ctx,
        &Bytes::from_static(b"self"),
        round1_view,
        &correct_proposal
    ));
    assert!(!ibft_core::sequencer::is_valid_proposal(
        &ctx,
        &Bytes::from_static(b"self"),
        round1_view,
        &wrong_proposal
    ));
}

struct NoopTransport;
impl Transport for NoopTransport {
    fn multicast(&self, _message: OutboundMessage) {}
}

/// S4: a proposal recorded before the sequencer subscribes is still
/// delivered on the initial snapshot.
#[tokio::test]
async fn s4_late_delivery_is_still_observed() {
    let store = ConsensusStore::new();
    let view = ibft_core::View::new(104, 0);
    let proposal = Proposal {
        view,
        from: Bytes::from_static(b"p"),
        signature: Bytes::new(),
        proposed_block: ProposedBlock { block: Bytes::from_static(b"b"), round: 0 },
        block_hash: Bytes::from_static(b"hash"),
        round_change_certificate: None,
    };
    store.proposals.add(proposal.clone()).unwrap();

    let mut sub = ibft_core::context::MessageFeed::subscribe_proposals(&store, view, false);
    let snapshot = sub.recv().await.expect("subscription open");
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].from, proposal.from);
}

/// S5: an RCC with two entries from the same sender is rejected, and so
/// is a proposal that relies on it.
#[test]
fn s5_duplicate_rcc_sender_is_rejected() {
    let validators = four_validators();
    let verifier = RoundRobinVerifier { validators: validators.clone() };
    let hasher = Sha3Hasher;
    let quorum = MajorityQuorum { threshold: 3 };
    let view = ibft_core::View::new(105, 1);

    let duplicate_sender = validators[0].clone();
    let rcc = RoundChangeCertificate {
        messages: vec![
            RoundChange { view, from: duplicate_sender.clone(), signature: Bytes::new(), prepared: None },
            RoundChange { view, from: duplicate_sender, signature: Bytes::new(), prepared: None },
            RoundChange { view, from: validators[2].clone(), signature: Bytes::new(), prepared: None },
        ],
    };
    let block = ProposedBlock { block: Bytes::from_static(b"b"), round: 1 };
    let proposal = Proposal {
        view,
        from: validators[1].clone(),
        signature: Bytes::new(),
        proposed_block: block.clone(),
        block_hash: hasher.hash(&block.to_canonical_bytes()),
        round_change_certificate: Some(rcc),
    };

    let sig_recovery = IdentityRecovery;
    let signer = IdentitySigner(Bytes::from_static(b"unused"));
    let transport = NoopTransport;
    let block_source = FixedBlockSource { id: Bytes::from_static(b"self"), block: Bytes::from_static(b"unused") };
    let store = ibft_core::ConsensusStore::new();
    let ctx = RoundContext {
        transport: &transport,
        feed: &store,
        quorum: &quorum,
        hasher: &hasher,
        sig_recovery: &sig_recovery,
        signer: &signer,
        verifier: &verifier,
        block_source: &block_source,
        cancel: CancelSignal::new(),
        round_timeout: RoundTimeoutPolicy::default(),
    };

    assert!(!ibft_core::sequencer::is_valid_proposal(
        &ctx,
        &Bytes::from_static(b"self"),
        view,
        &proposal
    ));
}

/// S6: cancelling the context mid-round makes `finalize` return
/// `Cancelled` promptly.
#[tokio::test]
async fn s6_cancellation_is_observed_promptly() {
    let validators = four_validators();
    let store = ConsensusStore::new();
    let verifier = RoundRobinVerifier { validators: validators.clone() };
    let hasher = Sha3Hasher;
    let sig_recovery = IdentityRecovery;
    let quorum = MajorityQuorum { threshold: 3 };
    let transport = LoopbackTransport { store: &store };

    // This validator is not the round-0 proposer, so it sits in
    // `await_round_change_jump` / `timeout_round_change` until cancelled.
    let v = validators.iter().find(|v| !verifier.is_proposer(*v, 106, 0)).unwrap().clone();
    let signer = IdentitySigner(v.clone());
    let block_source = FixedBlockSource { id: v.clone(), block: Bytes::from_static(b"b") };
    let cancel = CancelSignal::new();
    let ctx = RoundContext {
        transport: &transport,
        feed: &store,
        quorum: &quorum,
        hasher: &hasher,
        sig_recovery: &sig_recovery,
        signer: &signer,
        verifier: &verifier,
        block_source: &block_source,
        cancel: cancel.clone(),
        round_timeout: RoundTimeoutPolicy::new(Duration::from_secs(30), Duration::from_secs(60)),
    };

    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        }
    });

    let result = Sequencer::finalize(&ctx, 106).await;
    assert!(matches!(result, Err(ibft_core::Error::Cancelled)));
    handle.await.unwrap();
}
