use std::collections::VecDeque;

use crate::Message;

/// Per-subscription FIFO.
///
/// When bounded and full, new messages are rejected; messages already queued
/// are never evicted or reordered.
#[derive(Debug, Default)]
pub struct SubscriptionQueue {
    items: VecDeque<Message>,
    capacity: Option<usize>,
    dropped: u64,
}

impl SubscriptionQueue {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
            dropped: 0,
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// `None` is unbounded. Shrinking below the current length keeps the
    /// queued messages and rejects pushes until the queue drains.
    pub fn set_capacity(&mut self, capacity: Option<usize>) {
        self.capacity = capacity;
    }

    /// Returns `false` if the message was rejected because the queue is full.
    pub fn push(&mut self, message: Message) -> bool {
        if let Some(capacity) = self.capacity {
            if self.items.len() >= capacity {
                self.dropped += 1;
                return false;
            }
        }
        self.items.push_back(message);
        true
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Messages rejected since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}
