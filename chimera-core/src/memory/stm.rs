//! Short-term memory: a bounded ring of recent turns per user
//!
//! Overflow evicts the oldest turns in batches of `cleanup_batch_size` so that
//! downstream archival work is paid once per batch instead of per message.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

use super::turn::{Turn, UserId};

/// Ordered, bounded buffer of one user's recent turns
#[derive(Debug, Clone)]
pub struct StmRing {
    turns: VecDeque<Turn>,
    capacity: usize,
    batch_size: usize,
    next_sequence: u64,
}

impl StmRing {
    /// Create an empty ring
    ///
    /// `batch_size` is clamped to `1..=capacity`.
    pub fn new(capacity: usize, batch_size: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            turns: VecDeque::with_capacity(capacity),
            capacity,
            batch_size: batch_size.clamp(1, capacity),
            next_sequence: 1,
        }
    }

    /// Sequence number the next appended turn will receive
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Append a turn at the tail, returning the evicted batch (oldest first).
    ///
    /// The ring assigns the turn's sequence number. Eviction only happens when
    /// the ring is full before the insert.
    pub fn append(&mut self, mut turn: Turn) -> Vec<Turn> {
        let evicted = if self.turns.len() >= self.capacity {
            let count = self.batch_size.min(self.turns.len());
            self.turns.drain(..count).collect()
        } else {
            Vec::new()
        };

        turn.sequence = self.next_sequence;
        self.next_sequence += 1;
        self.turns.push_back(turn);

        evicted
    }

    /// Turns in conversation order
    pub fn turns(&self) -> impl ExactSizeIterator<Item = &Turn> {
        self.turns.iter()
    }

    /// Copy of the turns in conversation order
    pub fn snapshot(&self) -> Vec<Turn> {
        self.turns.iter().cloned().collect()
    }

    /// Flag a resident turn as durably stored. Returns false if the turn has
    /// already left the ring.
    pub fn mark_promoted(&mut self, turn_id: Uuid) -> bool {
        match self.turns.iter_mut().find(|t| t.turn_id == turn_id) {
            Some(turn) => {
                turn.promoted = true;
                true
            }
            None => false,
        }
    }

    /// Empty the ring, returning every resident turn oldest first.
    ///
    /// Sequence numbering carries on from where it was.
    pub fn drain_all(&mut self) -> Vec<Turn> {
        self.turns.drain(..).collect()
    }

    /// Number of resident turns
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Whether the ring is empty
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Maximum number of resident turns
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Shared handle to one user's ring
pub type SharedRing = Arc<Mutex<StmRing>>;

/// Per-user rings keyed by `user_id`
///
/// Each user's ring sits behind its own lock, so work on one user never
/// contends with another user's ring.
#[derive(Debug)]
pub struct ShortTermMemory {
    rings: RwLock<HashMap<UserId, SharedRing>>,
    capacity: usize,
    batch_size: usize,
}

impl ShortTermMemory {
    /// Create an empty store
    pub fn new(capacity: usize, batch_size: usize) -> Self {
        Self {
            rings: RwLock::new(HashMap::new()),
            capacity,
            batch_size,
        }
    }

    /// Get the user's ring, creating it on first use
    pub fn ring(&self, user_id: UserId) -> SharedRing {
        if let Some(ring) = self.rings.read().get(&user_id) {
            return ring.clone();
        }

        self.rings
            .write()
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(StmRing::new(self.capacity, self.batch_size))))
            .clone()
    }

    /// Append to the turn owner's ring, returning the evicted batch
    pub fn append(&self, turn: Turn) -> Vec<Turn> {
        self.ring(turn.user_id).lock().append(turn)
    }

    /// Copy of the user's turns, oldest first
    pub fn snapshot(&self, user_id: UserId) -> Vec<Turn> {
        match self.rings.read().get(&user_id) {
            Some(ring) => ring.lock().snapshot(),
            None => Vec::new(),
        }
    }

    /// Flag a resident turn as durably stored
    pub fn mark_promoted(&self, user_id: UserId, turn_id: Uuid) -> bool {
        match self.rings.read().get(&user_id) {
            Some(ring) => ring.lock().mark_promoted(turn_id),
            None => false,
        }
    }

    /// Empty every ring, returning the turns grouped by user
    pub fn drain_all(&self) -> Vec<(UserId, Vec<Turn>)> {
        let rings = self.rings.read();
        let mut batches: Vec<(UserId, Vec<Turn>)> = rings
            .iter()
            .map(|(user_id, ring)| (*user_id, ring.lock().drain_all()))
            .filter(|(_, turns)| !turns.is_empty())
            .collect();
        batches.sort_by_key(|(user_id, _)| *user_id);
        batches
    }

    /// Number of users with a ring
    pub fn user_count(&self) -> usize {
        self.rings.read().len()
    }
}
