//! Dependency injection: the host-supplied collaborators the sequencer
//! drives, bundled into one `RoundContext` passed by reference into
//! `Sequencer::finalize`.
//!
//! This is a source idiom reimplemented as a typed struct of trait
//! object references rather than a value-keyed dynamic-dispatch map —
//! the latter is untyped and defers mismatches to runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;

use crate::message::{
    Commit, OutboundMessage, Prepare, Proposal, RoundChange, ValidatorId,
};
use crate::store::Subscription;
use crate::view::View;

/// Recovers the sender of a signed payload.
pub trait SignatureRecovery: Send + Sync {
    /// Recovers the signer id from `signature` over `data`, or `None`
    /// if the signature does not verify.
    fn recover(&self, data: &[u8], signature: &Bytes) -> Option<ValidatorId>;
}

/// Produces signatures on behalf of this validator.
pub trait Signer: Send + Sync {
    fn sign(&self, data: &[u8]) -> Bytes;
}

/// 32-byte keccak-256 (or equivalent) hashing, injected so the core
/// never hard-codes a crypto backend.
pub trait Hasher: Send + Sync {
    fn hash(&self, data: &[u8]) -> Bytes;
}

/// Fire-and-forget delivery to every validator.
pub trait Transport: Send + Sync {
    fn multicast(&self, message: OutboundMessage);
}

/// Validator-set and proposer-selection queries, and block-content
/// validity. The core never interprets block bytes itself.
pub trait Verifier: Send + Sync {
    fn is_validator(&self, id: &ValidatorId, sequence: u64) -> bool;
    fn is_proposer(&self, id: &ValidatorId, sequence: u64, round: u64) -> bool;
    fn is_valid_block(&self, block: &Bytes, sequence: u64) -> bool;
}

/// Quorum policy, typically `len(distinct_senders) >= 2f + 1`. Takes
/// the list of distinct senders rather than the messages themselves so
/// callers don't need to pick a message class to satisfy the trait.
pub trait Quorum: Send + Sync {
    fn has_quorum(&self, senders: &[ValidatorId]) -> bool;
}

/// This validator's identity and block-building capability.
pub trait BlockSource: Send + Sync {
    fn id(&self) -> ValidatorId;
    fn build_block(&self, sequence: u64) -> Bytes;
}

/// The four per-class subscription entry points a [`crate::sequencer::Sequencer`]
/// needs. Implemented by the host's message store (see [`crate::store::MessageStore`]
/// for a ready-made generic implementation; a host composes one instance
/// per class and implements this trait over the bundle).
pub trait MessageFeed: Send + Sync {
    fn subscribe_proposals(&self, view: View, higher_rounds: bool) -> Subscription<Proposal>;
    fn subscribe_prepares(&self, view: View, higher_rounds: bool) -> Subscription<Prepare>;
    fn subscribe_commits(&self, view: View, higher_rounds: bool) -> Subscription<Commit>;
    fn subscribe_round_changes(&self, view: View, higher_rounds: bool) -> Subscription<RoundChange>;
}

/// Cooperative cancellation signal, checked at every suspension point
/// and raced against every subscription/timer await in the sequencer.
#[derive(Clone)]
pub struct CancelSignal {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`CancelSignal::cancel`] has been called. Intended
    /// as a `tokio::select!` branch raced alongside subscriptions and
    /// timers so cancellation preempts any in-flight await.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// How long the sequencer waits for round progress before giving up and
/// multicasting its own round-change. Grows per round so a string of
/// failed rounds doesn't busy-loop against an unreachable quorum.
#[derive(Debug, Clone, Copy)]
pub struct RoundTimeoutPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl RoundTimeoutPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Doubles per round past 0, capped at `max`.
    pub fn timeout_for(&self, round: u64) -> Duration {
        let shift = round.min(32) as u32;
        self.base
            .checked_mul(1u32.checked_shl(shift).unwrap_or(u32::MAX))
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for RoundTimeoutPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(60))
    }
}

/// Bundles every collaborator the sequencer needs for one `finalize`
/// call. Holds references, not ownership: the host owns the lifetime
/// of its transport/store/signer and lends them for the call.
pub struct RoundContext<'a> {
    pub transport: &'a dyn Transport,
    pub feed: &'a dyn MessageFeed,
    pub quorum: &'a dyn Quorum,
    pub hasher: &'a dyn Hasher,
    pub sig_recovery: &'a dyn SignatureRecovery,
    pub signer: &'a dyn Signer,
    pub verifier: &'a dyn Verifier,
    pub block_source: &'a dyn BlockSource,
    pub cancel: CancelSignal,
    pub round_timeout: RoundTimeoutPolicy,
}
