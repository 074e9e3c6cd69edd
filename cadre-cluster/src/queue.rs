//! FIFO queue of pending work items

use std::collections::VecDeque;

use cadre_ipc::WorkItem;

/// Pending work items, appended at the tail and popped from the head
#[derive(Debug, Default)]
pub struct WorkQueue {
    items: VecDeque<WorkItem>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item at the tail
    pub fn enqueue(&mut self, item: WorkItem) {
        self.items.push_back(item);
    }

    /// Remove and return the head item
    pub fn pop(&mut self) -> Option<WorkItem> {
        self.items.pop_front()
    }

    pub fn peek(&self) -> Option<&WorkItem> {
        self.items.front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.iter()
    }
}

impl Extend<WorkItem> for WorkQueue {
    fn extend<I: IntoIterator<Item = WorkItem>>(&mut self, iter: I) {
        self.items.extend(iter);
    }
}
