//! View-indexed, sender-deduplicated message storage with cancelable,
//! snapshot-on-demand subscriptions.
//!
//! The store is generic over the message class so the four concrete
//! classes (`Proposal`, `Prepare`, `Commit`, `RoundChange`) share one
//! implementation of the indexing, subscription, and notification
//! logic, per SPEC_FULL.md's generic-message-handling note.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::context::MessageFeed;
use crate::error::{Error, Result};
use crate::message::{Commit, ConsensusMessage, Prepare, Proposal, RoundChange};
use crate::view::View;

/// Opaque subscription identifier, used for O(1) removal on cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A recomputation thunk: re-walks the store under its own lock when
/// invoked. Nothing is materialized until a consumer actually calls it.
type SnapshotThunk<T> = Box<dyn Fn() -> Vec<T> + Send>;

/// A single-slot, coalescing notification channel.
///
/// A pending-but-unread *thunk* is replaced, never queued, by a newer
/// publish — the producer never walks the store itself, and the
/// consumer decides when to pay the cost of reading, load-shedding any
/// backlog from a slow reader down to one pending recomputation.
struct Slot<T> {
    pending: Mutex<Option<SnapshotThunk<T>>>,
    notify: Notify,
    closed: AtomicBool,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            pending: Mutex::new(None),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn publish(&self, thunk: SnapshotThunk<T>) {
        *self.pending.lock().expect("store slot mutex poisoned") = Some(thunk);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Waits for the next unread snapshot, or `None` once cancelled.
    /// Invokes the pending thunk here, at read time, so the store is
    /// only ever walked when a consumer chooses to pay for it.
    ///
    /// The `notified()` future is created before the pending/closed
    /// check so a publish racing with this call is never missed: Tokio
    /// records the wakeup as a permit against the future created here,
    /// even if the notify happens before we start awaiting it.
    async fn recv(&self) -> Option<Vec<T>> {
        loop {
            let notified = self.notify.notified();
            if let Some(thunk) = self.pending.lock().expect("store slot mutex poisoned").take() {
                return Some(thunk());
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }
}

struct Subscriber<T> {
    view: View,
    higher_rounds: bool,
    slot: Arc<Slot<T>>,
}

struct StoreInner<T: ConsensusMessage> {
    /// Messages at `(sequence, round)`, deduplicated by sender.
    by_view: HashMap<(u64, u64), HashMap<crate::message::ValidatorId, T>>,
    subscribers: HashMap<SubscriptionId, Subscriber<T>>,
}

impl<T: ConsensusMessage> StoreInner<T> {
    fn new() -> Self {
        Self {
            by_view: HashMap::new(),
            subscribers: HashMap::new(),
        }
    }
}

fn matches(sub_view: View, higher_rounds: bool, msg_view: View) -> bool {
    if higher_rounds {
        sub_view.sequence == msg_view.sequence && msg_view.round >= sub_view.round
    } else {
        sub_view == msg_view
    }
}

fn compute_snapshot<T: ConsensusMessage>(
    by_view: &HashMap<(u64, u64), HashMap<crate::message::ValidatorId, T>>,
    view: View,
    higher_rounds: bool,
) -> Vec<T> {
    if !higher_rounds {
        return by_view
            .get(&(view.sequence, view.round))
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
    }
    let highest_round = by_view
        .keys()
        .filter(|(sequence, round)| *sequence == view.sequence && *round >= view.round)
        .map(|(_, round)| *round)
        .max();
    match highest_round {
        Some(round) => by_view
            .get(&(view.sequence, round))
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default(),
        None => Vec::new(),
    }
}

/// View-indexed store for one message class.
pub struct MessageStore<T: ConsensusMessage> {
    inner: Arc<Mutex<StoreInner<T>>>,
    next_id: Arc<AtomicU64>,
}

impl<T: ConsensusMessage> Clone for MessageStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<T: ConsensusMessage> Default for MessageStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ConsensusMessage> MessageStore<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Upserts `message`, overwriting any prior message from the same
    /// sender at the same view. Notifies every subscription whose
    /// match-set includes the new message's view with a recomputation
    /// thunk; none of them are walked here — only the consumer that
    /// reads its slot pays for that.
    pub fn add(&self, message: T) -> Result<()> {
        if message.from().is_empty() {
            return Err(Error::Store("message has an empty `from`"));
        }
        let msg_view = message.view();
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        inner
            .by_view
            .entry((msg_view.sequence, msg_view.round))
            .or_default()
            .insert(message.from().clone(), message);

        let to_notify: Vec<SubscriptionId> = inner
            .subscribers
            .iter()
            .filter(|(_, sub)| matches(sub.view, sub.higher_rounds, msg_view))
            .map(|(id, _)| *id)
            .collect();
        for id in to_notify {
            if let Some(sub) = inner.subscribers.get(&id) {
                sub.slot.publish(self.snapshot_thunk(sub.view, sub.higher_rounds));
            }
        }
        Ok(())
    }

    /// Builds a thunk that, when invoked, re-locks the store and
    /// recomputes the snapshot for `(view, higher_rounds)` at that
    /// moment — not at the moment this thunk is constructed.
    fn snapshot_thunk(&self, view: View, higher_rounds: bool) -> SnapshotThunk<T> {
        let inner = Arc::clone(&self.inner);
        Box::new(move || {
            let inner = inner.lock().expect("store mutex poisoned");
            compute_snapshot(&inner.by_view, view, higher_rounds)
        })
    }

    /// All messages at exactly `view`.
    pub fn get(&self, view: View) -> Vec<T> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        compute_snapshot(&inner.by_view, view, false)
    }

    /// Subscribes for messages at `view` (or, with `higher_rounds`, the
    /// highest round `>= view.round` within `view.sequence`). Publishes
    /// one snapshot immediately so a late subscriber never misses
    /// already-stored matches.
    pub fn subscribe(&self, view: View, higher_rounds: bool) -> Subscription<T> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let slot = Arc::new(Slot::new());
        slot.publish(self.snapshot_thunk(view, higher_rounds));
        inner.subscribers.insert(
            id,
            Subscriber {
                view,
                higher_rounds,
                slot: Arc::clone(&slot),
            },
        );
        Subscription {
            id,
            slot,
            store: self.clone(),
        }
    }

    fn cancel(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        if let Some(sub) = inner.subscribers.remove(&id) {
            sub.slot.close();
        }
    }

    /// Drops every message recorded for `sequence`. Called once the
    /// sequencer's `finalize` for that sequence returns, since the
    /// source leaves retention policy across sequences unspecified and
    /// unbounded growth is not acceptable in a long-lived host process.
    pub fn evict_sequence(&self, sequence: u64) {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        inner.by_view.retain(|(seq, _), _| *seq != sequence);
    }
}

/// A live subscription. Dropping it cancels it, same as calling
/// [`Subscription::cancel`] explicitly.
pub struct Subscription<T: ConsensusMessage> {
    id: SubscriptionId,
    slot: Arc<Slot<T>>,
    store: MessageStore<T>,
}

impl<T: ConsensusMessage> Subscription<T> {
    /// Waits for the next unread snapshot; `None` once cancelled.
    pub async fn recv(&mut self) -> Option<Vec<T>> {
        self.slot.recv().await
    }

    /// Cancels the subscription, closing the channel for any pending
    /// `recv`.
    pub fn cancel(self) {
        // Explicit drop runs `Drop::drop`, which performs the cancel.
        drop(self);
    }
}

impl<T: ConsensusMessage> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.store.cancel(self.id);
    }
}

/// Bundles the four per-class stores a host needs to feed inbound
/// messages into and that a [`crate::sequencer::Sequencer`] subscribes
/// against via [`MessageFeed`].
#[derive(Clone, Default)]
pub struct ConsensusStore {
    pub proposals: MessageStore<Proposal>,
    pub prepares: MessageStore<Prepare>,
    pub commits: MessageStore<Commit>,
    pub round_changes: MessageStore<RoundChange>,
}

impl ConsensusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every stored message for `sequence` across all four
    /// classes. Called by the host once `finalize` returns.
    pub fn evict_sequence(&self, sequence: u64) {
        self.proposals.evict_sequence(sequence);
        self.prepares.evict_sequence(sequence);
        self.commits.evict_sequence(sequence);
        self.round_changes.evict_sequence(sequence);
    }
}

impl MessageFeed for ConsensusStore {
    fn subscribe_proposals(&self, view: View, higher_rounds: bool) -> Subscription<Proposal> {
        self.proposals.subscribe(view, higher_rounds)
    }
    fn subscribe_prepares(&self, view: View, higher_rounds: bool) -> Subscription<Prepare> {
        self.prepares.subscribe(view, higher_rounds)
    }
    fn subscribe_commits(&self, view: View, higher_rounds: bool) -> Subscription<Commit> {
        self.commits.subscribe(view, higher_rounds)
    }
    fn subscribe_round_changes(&self, view: View, higher_rounds: bool) -> Subscription<RoundChange> {
        self.round_changes.subscribe(view, higher_rounds)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn prepare(sequence: u64, round: u64, from: &str) -> Prepare {
        Prepare {
            view: View::new(sequence, round),
            from: Bytes::copy_from_slice(from.as_bytes()),
            signature: Bytes::new(),
            block_hash: Bytes::from_static(b"hash"),
        }
    }

    #[test]
    fn add_rejects_empty_from() {
        let store: MessageStore<Prepare> = MessageStore::new();
        let msg = prepare(1, 0, "");
        assert!(store.add(msg).is_err());
    }

    #[test]
    fn add_dedupes_by_sender_at_same_view() {
        let store: MessageStore<Prepare> = MessageStore::new();
        store.add(prepare(1, 0, "v1")).unwrap();
        store.add(prepare(1, 0, "v1")).unwrap();
        assert_eq!(store.get(View::new(1, 0)).len(), 1);
    }

    #[test]
    fn get_is_scoped_to_exact_view() {
        let store: MessageStore<Prepare> = MessageStore::new();
        store.add(prepare(1, 0, "v1")).unwrap();
        store.add(prepare(1, 1, "v1")).unwrap();
        assert_eq!(store.get(View::new(1, 0)).len(), 1);
        assert_eq!(store.get(View::new(1, 1)).len(), 1);
    }

    #[tokio::test]
    async fn subscribe_delivers_already_stored_messages_immediately() {
        let store: MessageStore<Prepare> = MessageStore::new();
        store.add(prepare(1, 0, "v1")).unwrap();
        let mut sub = store.subscribe(View::new(1, 0), false);
        let snapshot = sub.recv().await.expect("subscription still open");
        assert_eq!(snapshot.len(), 1);
    }

    #[tokio::test]
    async fn higher_rounds_subscription_returns_only_the_highest_round() {
        let store: MessageStore<Prepare> = MessageStore::new();
        let mut sub = store.subscribe(View::new(1, 0), true);
        let _ = sub.recv().await; // initial, empty snapshot

        store.add(prepare(1, 0, "v1")).unwrap();
        store.add(prepare(1, 2, "v1")).unwrap();
        let snapshot = sub.recv().await.expect("subscription still open");
        assert!(snapshot.iter().all(|m| m.view.round == 2));
    }

    #[tokio::test]
    async fn cancel_ends_the_stream() {
        let store: MessageStore<Prepare> = MessageStore::new();
        let sub = store.subscribe(View::new(1, 0), false);
        sub.cancel();
        let mut sub2 = store.subscribe(View::new(1, 0), false);
        assert!(sub2.recv().await.is_some()); // fresh subscription unaffected
    }

    #[tokio::test]
    async fn unread_snapshots_coalesce_instead_of_queueing() {
        let store: MessageStore<Prepare> = MessageStore::new();
        let mut sub = store.subscribe(View::new(1, 0), false);
        let _ = sub.recv().await; // drain initial empty snapshot

        store.add(prepare(1, 0, "v1")).unwrap();
        store.add(prepare(1, 0, "v2")).unwrap();
        store.add(prepare(1, 0, "v3")).unwrap();

        // A single coalesced snapshot reflects all three, not a queue of three.
        let snapshot = sub.recv().await.expect("subscription still open");
        assert_eq!(snapshot.len(), 3);
    }

    #[tokio::test]
    async fn evict_sequence_clears_stored_messages() {
        let store: MessageStore<Prepare> = MessageStore::new();
        store.add(prepare(1, 0, "v1")).unwrap();
        store.evict_sequence(1);
        assert!(store.get(View::new(1, 0)).is_empty());
    }
}
