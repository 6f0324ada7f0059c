//! Memo of recently executed task ids
//!
//! Drops a task delivered again right after it ran. With the default window
//! of 1 only the immediately preceding task is remembered, so a task id that
//! comes back after a different task runs again.

use plangraph::TaskId;
use std::collections::VecDeque;

pub const DEFAULT_WINDOW: usize = 1;

#[derive(Debug, Clone)]
pub struct RecentTasks {
    window: usize,
    ids: VecDeque<TaskId>,
}

impl RecentTasks {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            ids: VecDeque::with_capacity(window),
        }
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.ids.contains(&id)
    }

    pub fn record(&mut self, id: TaskId) {
        if self.ids.len() == self.window {
            self.ids.pop_front();
        }
        self.ids.push_back(id);
    }

    pub fn last(&self) -> Option<TaskId> {
        self.ids.back().copied()
    }
}

impl Default for RecentTasks {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
