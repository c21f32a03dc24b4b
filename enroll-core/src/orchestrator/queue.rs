use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// FIFO of pending slot numbers for the current batch. Workers race on
/// `pop`; the mutex makes each take atomic, so a slot runs exactly once.
#[derive(Debug, Clone, Default)]
pub struct TaskQueue {
    slots: Arc<Mutex<VecDeque<u32>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the queue with slots `1..=target`.
    pub fn fill(&self, target: u32) {
        let mut slots = self.slots.lock().unwrap();
        slots.clear();
        slots.extend(1..=target);
    }

    pub fn pop(&self) -> Option<u32> {
        self.slots.lock().unwrap().pop_front()
    }

    pub fn clear(&self) {
        self.slots.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
