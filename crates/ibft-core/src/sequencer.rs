//! The per-sequence driver: runs one sequence from round 0 to
//! finalization, multicasting messages and awaiting quorums as it goes.

use std::time::Duration;

use bytes::Bytes;

use crate::cache::MessageCache;
use crate::context::RoundContext;
use crate::encoding::CanonicalEncode;
use crate::error::{Error, Result};
use crate::message::{
    Commit, CommitSeal, ConsensusMessage, FinalizedBlock, OutboundMessage, Prepare,
    PreparedCertificate, Proposal, ProposedBlock, RoundChange, RoundChangeCertificate, ValidatorId,
};
use crate::state::SequencerState;
use crate::store::ConsensusStore;
use crate::view::View;

/// Runs one sequence to completion against the collaborators in `ctx`.
pub struct Sequencer;

impl Sequencer {
    /// Drives `sequence` from round 0 until a block finalizes or `ctx`
    /// is cancelled.
    ///
    /// This does not evict the store on its own: `ctx.feed` is an
    /// arbitrary [`crate::context::MessageFeed`], not necessarily a
    /// [`ConsensusStore`]. Hosts that do feed a `ConsensusStore` should
    /// call [`Sequencer::finalize_and_evict`] instead so retention does
    /// not grow unbounded across sequences.
    pub async fn finalize(ctx: &RoundContext<'_>, sequence: u64) -> Result<FinalizedBlock> {
        Self::run(ctx, sequence).await
    }

    /// Runs [`Sequencer::finalize`] and evicts every message recorded
    /// for `sequence` from `store` before returning, whatever the
    /// outcome (success, protocol fault, or cancellation).
    pub async fn finalize_and_evict(
        store: &ConsensusStore,
        ctx: &RoundContext<'_>,
        sequence: u64,
    ) -> Result<FinalizedBlock> {
        let result = Self::run(ctx, sequence).await;
        store.evict_sequence(sequence);
        result
    }

    async fn run(ctx: &RoundContext<'_>, sequence: u64) -> Result<FinalizedBlock> {
        let mut state = SequencerState::new(sequence);
        let mut carried_rcc: Option<RoundChangeCertificate> = None;

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let view = state.current_view();
            log::info!("sequence {} entering round {}", view.sequence, view.round);

            match Self::run_round(ctx, &mut state, carried_rcc.take()).await {
                Ok(RoundOutcome::Finalized(block)) => {
                    log::info!("sequence {} finalized at round {}", sequence, block.round);
                    return Ok(block);
                }
                Ok(RoundOutcome::RoundChanged { next_round, rcc }) => {
                    state.advance_round(next_round)?;
                    carried_rcc = rcc;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs a single round: proposal/prepare/commit phases raced against
    /// a higher-round watcher and a round timer. Returns either a
    /// finalized block or the round to jump to next.
    async fn run_round(
        ctx: &RoundContext<'_>,
        state: &mut SequencerState,
        justifying_rcc: Option<RoundChangeCertificate>,
    ) -> Result<RoundOutcome> {
        let view = state.current_view();
        let self_id = ctx.block_source.id();

        let proposal = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
            outcome = Self::await_round_change_jump(ctx, view) => {
                return Ok(outcome?);
            }
            outcome = Self::timeout_round_change(ctx, view, state) => {
                return Ok(outcome?);
            }
            proposal = Self::propose_or_await_proposal(ctx, state, &self_id, justifying_rcc) => proposal?,
        };
        state.accept_proposal(proposal.clone())?;

        let prepare = build_prepare(ctx, view, &self_id, &proposal.block_hash);
        ctx.transport.multicast(OutboundMessage::Prepare(prepare));

        let prepares = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
            outcome = Self::await_round_change_jump(ctx, view) => return Ok(outcome?),
            outcome = Self::timeout_round_change(ctx, view, state) => return Ok(outcome?),
            prepares = Self::await_prepare_quorum(ctx, &proposal) => prepares?,
        };

        let pc = PreparedCertificate {
            proposal_message: proposal.clone(),
            prepare_messages: prepares,
        };
        state.record_prepared(proposal.proposed_block.clone(), pc)?;

        let commit_seal = ctx.signer.sign(&proposal.block_hash);
        let commit = build_commit(ctx, view, &self_id, &proposal.block_hash, commit_seal.clone());
        state.record_commit_seal(self_id.clone(), commit_seal)?;
        ctx.transport.multicast(OutboundMessage::Commit(commit));

        let commits = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
            outcome = Self::await_round_change_jump(ctx, view) => return Ok(outcome?),
            outcome = Self::timeout_round_change(ctx, view, state) => return Ok(outcome?),
            commits = Self::await_commit_quorum(ctx, &proposal) => commits?,
        };

        for c in &commits {
            state.record_commit_seal(c.from.clone(), c.commit_seal.clone())?;
        }
        let seals = state
            .accepted_seals()
            .iter()
            .map(|(from, seal)| CommitSeal {
                from: from.clone(),
                commit_seal: seal.clone(),
            })
            .collect();

        Ok(RoundOutcome::Finalized(FinalizedBlock {
            block: proposal.proposed_block.block.clone(),
            seals,
            round: view.round,
        }))
    }

    /// If this validator is the proposer for `view`, builds and
    /// multicasts a Proposal and returns it immediately. Otherwise
    /// awaits a valid Proposal from the network.
    async fn propose_or_await_proposal(
        ctx: &RoundContext<'_>,
        state: &SequencerState,
        self_id: &ValidatorId,
        justifying_rcc: Option<RoundChangeCertificate>,
    ) -> Result<Proposal> {
        let view = state.current_view();
        if ctx.verifier.is_proposer(self_id, view.sequence, view.round) {
            let proposed_block = build_proposed_block(ctx, view, justifying_rcc.as_ref());
            let block_hash = ctx.hasher.hash(&proposed_block.to_canonical_bytes());
            let proposal = Proposal {
                view,
                from: self_id.clone(),
                signature: Bytes::new(),
                proposed_block,
                block_hash,
                round_change_certificate: justifying_rcc,
            };
            let mut proposal = proposal;
            proposal.signature = ctx.signer.sign(&proposal.to_canonical_bytes());
            ctx.transport
                .multicast(OutboundMessage::Proposal(proposal.clone()));
            return Ok(proposal);
        }

        let mut sub = ctx.feed.subscribe_proposals(view, false);
        let mut cache = MessageCache::new(|m: &Proposal| is_valid_proposal(ctx, self_id, view, m));
        loop {
            let snapshot = sub.recv().await.ok_or(Error::Cancelled)?;
            cache.add(&snapshot);
            if let Some(proposal) = cache.get().into_iter().next() {
                return Ok(proposal);
            }
        }
    }

    async fn await_prepare_quorum(ctx: &RoundContext<'_>, proposal: &Proposal) -> Result<Vec<Prepare>> {
        let view = proposal.view;
        let mut sub = ctx.feed.subscribe_prepares(view, false);
        let mut cache = MessageCache::new(|m: &Prepare| is_valid_prepare(ctx, proposal, m));
        loop {
            let snapshot = sub.recv().await.ok_or(Error::Cancelled)?;
            cache.add(&snapshot);
            let retained = cache.get();
            let senders: Vec<ValidatorId> = retained.iter().map(|m| m.from().clone()).collect();
            if ctx.quorum.has_quorum(&senders) {
                return Ok(retained);
            }
        }
    }

    async fn await_commit_quorum(ctx: &RoundContext<'_>, proposal: &Proposal) -> Result<Vec<Commit>> {
        let view = proposal.view;
        let mut sub = ctx.feed.subscribe_commits(view, false);
        let mut cache = MessageCache::new(|m: &Commit| is_valid_commit(ctx, proposal, m));
        loop {
            let snapshot = sub.recv().await.ok_or(Error::Cancelled)?;
            cache.add(&snapshot);
            let retained = cache.get();
            let senders: Vec<ValidatorId> = retained.iter().map(|m| m.from().clone()).collect();
            if ctx.quorum.has_quorum(&senders) {
                return Ok(retained);
            }
        }
    }

    /// Watches for a round-change quorum at a round strictly higher
    /// than `view.round`. Runs for the lifetime of the round; dropped
    /// (and its subscription cancelled) the instant the racing
    /// `tokio::select!` picks another branch.
    async fn await_round_change_jump(ctx: &RoundContext<'_>, view: View) -> Result<RoundOutcome> {
        let mut sub = ctx.feed.subscribe_round_changes(view.at_round(view.round + 1), true);
        let mut cache = MessageCache::new(|m: &RoundChange| is_valid_round_change(ctx, view.sequence, m));
        loop {
            let snapshot = sub.recv().await.ok_or(Error::Cancelled)?;
            cache.add(&snapshot);
            let retained = cache.get();
            if retained.is_empty() {
                continue;
            }
            let target_round = retained.iter().map(|m| m.view.round).max().unwrap();
            if target_round <= view.round {
                continue;
            }
            let at_target: Vec<RoundChange> = retained
                .into_iter()
                .filter(|m| m.view.round == target_round)
                .collect();
            let senders: Vec<ValidatorId> = at_target.iter().map(|m| m.from.clone()).collect();
            if ctx.quorum.has_quorum(&senders) {
                return Ok(RoundOutcome::RoundChanged {
                    next_round: target_round,
                    rcc: Some(RoundChangeCertificate { messages: at_target }),
                });
            }
        }
    }

    /// Fires after the round's timeout, multicasts this validator's own
    /// RoundChange for `round + 1`, then keeps waiting (the caller's
    /// `select!` re-enters this future on the next round iteration if
    /// no higher RCC arrives in the meantime — see `run`'s loop).
    ///
    /// Carries `state`'s latest prepared artifacts, if any were recorded
    /// in an earlier round of this same sequence, so a later proposer can
    /// honor the "must propose the highest prepared block" rule.
    async fn timeout_round_change(ctx: &RoundContext<'_>, view: View, state: &SequencerState) -> Result<RoundOutcome> {
        tokio::time::sleep(ctx.round_timeout.timeout_for(view.round)).await;
        log::warn!("round {} of sequence {} timed out", view.round, view.sequence);
        let self_id = ctx.block_source.id();
        let next_round = view.round + 1;
        let prepared = state
            .latest_prepared()
            .map(|(block, pc)| (block.clone(), pc.clone()));
        let round_change = RoundChange {
            view: view.at_round(next_round),
            from: self_id,
            signature: Bytes::new(),
            prepared,
        };
        let mut round_change = round_change;
        round_change.signature = ctx.signer.sign(&round_change.to_canonical_bytes());
        ctx.transport
            .multicast(OutboundMessage::RoundChange(round_change));

        // Having announced intent, keep watching for the quorum that
        // actually authorizes the jump; this mirrors `await_round_change_jump`
        // but is reached only after this validator's own timeout fired.
        Self::await_round_change_jump(ctx, view).await
    }
}

enum RoundOutcome {
    Finalized(FinalizedBlock),
    RoundChanged {
        next_round: u64,
        rcc: Option<RoundChangeCertificate>,
    },
}

fn build_proposed_block(
    ctx: &RoundContext<'_>,
    view: View,
    justifying_rcc: Option<&RoundChangeCertificate>,
) -> ProposedBlock {
    if view.round == 0 {
        return ProposedBlock {
            block: ctx.block_source.build_block(view.sequence),
            round: 0,
        };
    }
    let carried = justifying_rcc.and_then(highest_round_prepared_block);
    match carried {
        Some(block) => ProposedBlock {
            block: block.block.clone(),
            round: view.round,
        },
        None => ProposedBlock {
            block: ctx.block_source.build_block(view.sequence),
            round: view.round,
        },
    }
}

/// Among an RCC's entries carrying a prepared certificate, the block
/// belonging to the one with the highest PC round. `None` if no entry
/// carries a PC.
fn highest_round_prepared_block(rcc: &RoundChangeCertificate) -> Option<&ProposedBlock> {
    rcc.messages
        .iter()
        .filter_map(|m| m.prepared.as_ref())
        .max_by_key(|(_, pc)| pc.round())
        .map(|(block, _)| block)
}

fn build_prepare(ctx: &RoundContext<'_>, view: View, self_id: &ValidatorId, block_hash: &Bytes) -> Prepare {
    let mut prepare = Prepare {
        view,
        from: self_id.clone(),
        signature: Bytes::new(),
        block_hash: block_hash.clone(),
    };
    prepare.signature = ctx.signer.sign(&prepare.to_canonical_bytes());
    prepare
}

fn build_commit(
    ctx: &RoundContext<'_>,
    view: View,
    self_id: &ValidatorId,
    block_hash: &Bytes,
    commit_seal: Bytes,
) -> Commit {
    let mut commit = Commit {
        view,
        from: self_id.clone(),
        signature: Bytes::new(),
        block_hash: block_hash.clone(),
        commit_seal,
    };
    commit.signature = ctx.signer.sign(&commit.to_canonical_bytes());
    commit
}

// ─── Validity predicates (SPEC_FULL.md §4.5) ───────────────────────────

pub fn is_valid_proposal(ctx: &RoundContext<'_>, self_id: &ValidatorId, view: View, m: &Proposal) -> bool {
    if m.view != view {
        return reject("Proposal", &m.from, view, "view mismatch");
    }
    if m.proposed_block.round != view.round {
        return reject("Proposal", &m.from, view, "proposed_block.round != view.round");
    }
    if &m.from == self_id {
        return reject("Proposal", &m.from, view, "self-authored proposal");
    }
    if !ctx.verifier.is_proposer(&m.from, view.sequence, view.round) {
        return reject("Proposal", &m.from, view, "sender is not the proposer for this round");
    }
    let expected_hash = ctx.hasher.hash(&m.proposed_block.to_canonical_bytes());
    if m.block_hash != expected_hash {
        return reject("Proposal", &m.from, view, "block_hash does not match proposed_block");
    }

    if view.round == 0 {
        if !ctx.verifier.is_valid_block(&m.proposed_block.block, view.sequence) {
            return reject("Proposal", &m.from, view, "block failed host validity check");
        }
        return true;
    }

    let rcc = match &m.round_change_certificate {
        Some(rcc) if !rcc.messages.is_empty() => rcc,
        _ => return reject("Proposal", &m.from, view, "round > 0 requires a non-empty RCC"),
    };

    let mut seen_senders = std::collections::HashSet::new();
    for rc in &rcc.messages {
        if rc.view != m.view {
            return reject("Proposal", &m.from, view, "RCC entry view mismatch");
        }
        if !ctx.verifier.is_validator(&rc.from, view.sequence) {
            return reject("Proposal", &m.from, view, "RCC entry from non-validator");
        }
        if !seen_senders.insert(rc.from.clone()) {
            return reject("Proposal", &m.from, view, "RCC has duplicate sender");
        }
        if !is_valid_round_change_certificate_entry(ctx, view.sequence, rc) {
            return reject("Proposal", &m.from, view, "RCC entry carries an invalid prepared certificate");
        }
    }
    let senders: Vec<ValidatorId> = rcc.messages.iter().map(|rc| rc.from.clone()).collect();
    if !ctx.quorum.has_quorum(&senders) {
        return reject("Proposal", &m.from, view, "RCC does not satisfy quorum");
    }

    match highest_round_prepared_block(rcc) {
        Some(block) => {
            let expected = ctx.hasher.hash(&block.to_canonical_bytes());
            if expected != m.block_hash {
                return reject("Proposal", &m.from, view, "must propose the highest-round prepared block");
            }
        }
        None => {
            if !ctx.verifier.is_valid_block(&m.proposed_block.block, view.sequence) {
                return reject("Proposal", &m.from, view, "no PC in RCC and block failed host validity check");
            }
        }
    }
    true
}

fn is_valid_round_change_certificate_entry(ctx: &RoundContext<'_>, sequence: u64, rc: &RoundChange) -> bool {
    match &rc.prepared {
        None => true,
        Some((block, pc)) => {
            if !is_valid_prepared_certificate(ctx, sequence, rc.view, pc) {
                return false;
            }
            ctx.hasher.hash(&block.to_canonical_bytes()) == pc.proposal_message.block_hash
        }
    }
}

pub fn is_valid_prepare(ctx: &RoundContext<'_>, accepted: &Proposal, m: &Prepare) -> bool {
    if m.view != accepted.view {
        return reject("Prepare", &m.from, accepted.view, "view mismatch");
    }
    if !ctx.verifier.is_validator(&m.from, m.view.sequence) {
        return reject("Prepare", &m.from, accepted.view, "sender is not a validator");
    }
    if m.block_hash != accepted.block_hash {
        return reject("Prepare", &m.from, accepted.view, "block_hash does not match accepted proposal");
    }
    true
}

pub fn is_valid_commit(ctx: &RoundContext<'_>, accepted: &Proposal, m: &Commit) -> bool {
    if m.view != accepted.view {
        return reject("Commit", &m.from, accepted.view, "view mismatch");
    }
    if !ctx.verifier.is_validator(&m.from, m.view.sequence) {
        return reject("Commit", &m.from, accepted.view, "sender is not a validator");
    }
    if m.block_hash != accepted.block_hash {
        return reject("Commit", &m.from, accepted.view, "block_hash does not match accepted proposal");
    }
    match ctx.sig_recovery.recover(&m.block_hash, &m.commit_seal) {
        Some(recovered) if recovered == m.from => true,
        _ => reject("Commit", &m.from, accepted.view, "commit_seal does not recover to sender"),
    }
}

pub fn is_valid_round_change(ctx: &RoundContext<'_>, sequence: u64, m: &RoundChange) -> bool {
    if !ctx.verifier.is_validator(&m.from, sequence) {
        return reject("RoundChange", &m.from, m.view, "sender is not a validator");
    }
    match &m.prepared {
        None => true,
        Some((block, pc)) => {
            if !is_valid_prepared_certificate(ctx, sequence, m.view, pc) {
                return false;
            }
            ctx.hasher.hash(&block.to_canonical_bytes()) == pc.proposal_message.block_hash
        }
    }
}

fn is_valid_prepared_certificate(ctx: &RoundContext<'_>, sequence: u64, enclosing_view: View, pc: &PreparedCertificate) -> bool {
    let proposal = &pc.proposal_message;
    if pc.prepare_messages.is_empty() {
        return false;
    }
    if proposal.view.sequence != sequence || proposal.view.sequence != enclosing_view.sequence {
        return false;
    }
    if proposal.view.round >= enclosing_view.round {
        return false;
    }
    if !ctx
        .verifier
        .is_proposer(&proposal.from, proposal.view.sequence, proposal.view.round)
    {
        return false;
    }

    let mut senders = std::collections::HashSet::new();
    senders.insert(proposal.from.clone());
    for prepare in &pc.prepare_messages {
        if prepare.view != proposal.view {
            return false;
        }
        if prepare.block_hash != proposal.block_hash {
            return false;
        }
        if !ctx.verifier.is_validator(&prepare.from, sequence) {
            return false;
        }
        if !senders.insert(prepare.from.clone()) {
            return false;
        }
    }
    let all_senders: Vec<ValidatorId> = senders.into_iter().collect();
    ctx.quorum.has_quorum(&all_senders)
}

fn reject(class: &'static str, from: &ValidatorId, view: View, reason: &'static str) -> bool {
    log::debug!("rejected {} from {:?} at {:?}: {}", class, from, view, reason);
    false
}
