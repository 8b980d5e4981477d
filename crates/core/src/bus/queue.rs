//! Per-priority FIFO queues.

use std::collections::VecDeque;

use super::message::{Message, Priority};

/// One FIFO per [`Priority`] level
#[derive(Debug, Default)]
pub struct PriorityQueues {
    levels: [VecDeque<Message>; 5],
}

impl PriorityQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.levels[message.priority.index()].push_back(message);
    }

    pub fn pop(&mut self, priority: Priority) -> Option<Message> {
        self.levels[priority.index()].pop_front()
    }

    pub fn len(&self, priority: Priority) -> usize {
        self.levels[priority.index()].len()
    }

    pub fn total(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(VecDeque::is_empty)
    }

    /// Queue depth per level, in drain order
    pub fn depths(&self) -> [usize; 5] {
        let mut depths = [0; 5];
        for priority in Priority::ALL {
            depths[priority.index()] = self.len(priority);
        }
        depths
    }
}
