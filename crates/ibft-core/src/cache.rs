//! Per-await-loop memo of which messages have already passed validation.
//!
//! A subscription notification carries the *current* matching snapshot,
//! which grows monotonically within a view; re-validating every message
//! on every notification — including signature recovery — is wasteful.
//! The cache remembers retained senders and is thrown away once the
//! await that owns it returns.

use std::collections::HashMap;

use crate::message::{ConsensusMessage, ValidatorId};

pub struct MessageCache<T: ConsensusMessage, F: FnMut(&T) -> bool> {
    predicate: F,
    retained: HashMap<ValidatorId, T>,
}

impl<T: ConsensusMessage, F: FnMut(&T) -> bool> MessageCache<T, F> {
    pub fn new(predicate: F) -> Self {
        Self {
            predicate,
            retained: HashMap::new(),
        }
    }

    /// Retains, from `messages`, those the predicate accepts and whose
    /// sender isn't already retained.
    pub fn add(&mut self, messages: &[T]) {
        for message in messages {
            if self.retained.contains_key(message.from()) {
                continue;
            }
            if (self.predicate)(message) {
                self.retained.insert(message.from().clone(), message.clone());
            }
        }
    }

    /// Retained messages, in unspecified but stable order.
    pub fn get(&self) -> Vec<T> {
        self.retained.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.retained.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retained.is_empty()
    }
}
