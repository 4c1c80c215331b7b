//! Processed-event registry
//!
//! Remembers which `(call id, effect)` pairs have already been delivered to a
//! session so the same accept/reject/cancel arriving over both the push
//! channel and the poll fallback is applied once.

use crate::event::EffectKind;
use crate::types::CallId;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// Registry shared by every session of a service
pub type SharedRegistry = Arc<Mutex<ProcessedEventRegistry>>;

/// Bounded set of effects already applied
#[derive(Debug)]
pub struct ProcessedEventRegistry {
    capacity: usize,
    entries: HashSet<(CallId, EffectKind)>,
    order: VecDeque<(CallId, EffectKind)>,
}

impl ProcessedEventRegistry {
    /// Create a registry holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Create a registry ready to be shared between sessions
    pub fn shared(capacity: usize) -> SharedRegistry {
        Arc::new(Mutex::new(Self::new(capacity)))
    }

    /// Record an effect as processed
    ///
    /// Returns `true` if the effect had not been seen before and should be
    /// delivered, `false` if it is a duplicate.
    pub fn mark_processed(&mut self, call_id: &CallId, kind: EffectKind) -> bool {
        let key = (call_id.clone(), kind);
        if self.entries.contains(&key) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(key.clone());
        self.order.push_back(key);
        true
    }

    /// Whether an effect has been processed
    #[must_use]
    pub fn is_processed(&self, call_id: &CallId, kind: EffectKind) -> bool {
        self.entries.contains(&(call_id.clone(), kind))
    }

    /// Drop every entry for a call; returns how many were removed
    pub fn evict_call(&mut self, call_id: &CallId) -> usize {
        let before = self.order.len();
        self.order.retain(|(id, _)| id != call_id);
        self.entries.retain(|(id, _)| id != call_id);
        before - self.order.len()
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
