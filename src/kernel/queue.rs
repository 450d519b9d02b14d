//! Priority queue for pending work.
//!
//! Four strict priority buckets, FIFO within a bucket. Used only by the
//! scheduler; items are never re-prioritized after enqueue.

use std::collections::VecDeque;

use super::types::TaskPriority;
use crate::types::TaskId;

/// Anything the queue can hold: it needs an id and a fixed priority.
pub trait Prioritized {
    fn id(&self) -> &TaskId;
    fn priority(&self) -> TaskPriority;
}

/// Bucketed priority queue.
///
/// NOT a separate actor - owned by the scheduler and called via &mut self.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    buckets: [VecDeque<T>; 4],
}

impl<T: Prioritized> PriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
        }
    }

    pub fn enqueue(&mut self, item: T) {
        self.buckets[item.priority().index()].push_back(item);
    }

    /// Head of the highest non-empty bucket.
    pub fn dequeue(&mut self) -> Option<T> {
        self.buckets.iter_mut().find_map(VecDeque::pop_front)
    }

    pub fn peek(&self) -> Option<&T> {
        self.buckets.iter().find_map(VecDeque::front)
    }

    /// Remove a queued item by id, wherever it sits.
    pub fn remove(&mut self, id: &TaskId) -> Option<T> {
        for bucket in self.buckets.iter_mut() {
            if let Some(pos) = bucket.iter().position(|item| item.id() == id) {
                return bucket.remove(pos);
            }
        }
        None
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.buckets
            .iter()
            .any(|bucket| bucket.iter().any(|item| item.id() == id))
    }

    pub fn size(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    pub fn size_at(&self, priority: TaskPriority) -> usize {
        self.buckets[priority.index()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(VecDeque::is_empty)
    }

    /// Remove everything, most urgent first.
    pub fn drain(&mut self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.size());
        for bucket in self.buckets.iter_mut() {
            items.extend(bucket.drain(..));
        }
        items
    }
}

impl<T: Prioritized> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
