//! Per-sequence sequencer state, mutated only through invariant-checked
//! setters so a bug elsewhere in the driver can't silently corrupt the
//! view or lose track of prepared artifacts.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::message::{Proposal, ProposedBlock, PreparedCertificate, ValidatorId};
use crate::view::View;

/// The mutable state one running [`crate::sequencer::Sequencer::finalize`]
/// call owns for the duration of a sequence.
#[derive(Debug, Clone)]
pub struct SequencerState {
    current_view: View,
    accepted_proposal: Option<Proposal>,
    latest_prepared_certificate: Option<PreparedCertificate>,
    latest_prepared_proposed_block: Option<ProposedBlock>,
    accepted_seals: BTreeMap<ValidatorId, Bytes>,
}

impl SequencerState {
    pub fn new(sequence: u64) -> Self {
        Self {
            current_view: View::new(sequence, 0),
            accepted_proposal: None,
            latest_prepared_certificate: None,
            latest_prepared_proposed_block: None,
            accepted_seals: BTreeMap::new(),
        }
    }

    pub fn current_view(&self) -> View {
        self.current_view
    }

    pub fn accepted_proposal(&self) -> Option<&Proposal> {
        self.accepted_proposal.as_ref()
    }

    pub fn latest_prepared(&self) -> Option<(&ProposedBlock, &PreparedCertificate)> {
        match (&self.latest_prepared_proposed_block, &self.latest_prepared_certificate) {
            (Some(block), Some(pc)) => Some((block, pc)),
            _ => None,
        }
    }

    pub fn accepted_seals(&self) -> &BTreeMap<ValidatorId, Bytes> {
        &self.accepted_seals
    }

    /// Moves to `round` within the same sequence, clearing the
    /// round-scoped accepted proposal and commit seals. `round` must be
    /// strictly greater than the current round: the sequence never
    /// moves backwards.
    pub fn advance_round(&mut self, round: u64) -> Result<()> {
        if round <= self.current_view.round {
            return Err(Error::ProtocolFault("round must advance, never repeat or regress"));
        }
        self.current_view = self.current_view.at_round(round);
        self.accepted_proposal = None;
        self.accepted_seals.clear();
        Ok(())
    }

    /// Records the proposal this validator accepted for the current
    /// round. Rejects a proposal whose view doesn't match.
    pub fn accept_proposal(&mut self, proposal: Proposal) -> Result<()> {
        if proposal.view != self.current_view {
            return Err(Error::ProtocolFault("accepted proposal view must match current view"));
        }
        self.accepted_proposal = Some(proposal);
        Ok(())
    }

    /// Records a new "latest prepared" artifact pair after assembling a
    /// quorum of prepares. The new round must not regress behind
    /// whatever was previously recorded.
    pub fn record_prepared(&mut self, block: ProposedBlock, certificate: PreparedCertificate) -> Result<()> {
        if let Some(existing) = &self.latest_prepared_certificate {
            if certificate.round() < existing.round() {
                return Err(Error::ProtocolFault(
                    "latest prepared certificate round must not regress",
                ));
            }
        }
        self.latest_prepared_proposed_block = Some(block);
        self.latest_prepared_certificate = Some(certificate);
        Ok(())
    }

    /// Records `seal` as coming from `sender`, rejecting a second,
    /// differing seal from the same sender within this round.
    pub fn record_commit_seal(&mut self, sender: ValidatorId, seal: Bytes) -> Result<()> {
        if let Some(existing) = self.accepted_seals.get(&sender) {
            if *existing != seal {
                return Err(Error::ProtocolFault("sender sent two different commit seals in one round"));
            }
            return Ok(());
        }
        self.accepted_seals.insert(sender, seal);
        Ok(())
    }
}
