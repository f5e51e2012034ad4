//! Cooperative task queue with a virtual millisecond clock, plus the
//! deferred startup message queue.

use std::collections::VecDeque;

/// Name of a delayed task. A plugin owns the ids it schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(pub &'static str);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Info,
    Warning,
}

/// A message waiting to be written to the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct TaskQueue {
    now_ms: u64,
    delayed: Vec<(TaskId, u64)>,
    messages: VecDeque<Message>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Run `task` after `delay_ms`. A pending task with the same id is
    /// replaced.
    pub fn schedule(&mut self, task: TaskId, delay_ms: u64) {
        self.cancel(task);
        self.delayed.push((task, self.now_ms + delay_ms));
    }

    /// Drop a pending task. Returns whether one was pending.
    pub fn cancel(&mut self, task: TaskId) -> bool {
        let before = self.delayed.len();
        self.delayed.retain(|(pending, _)| *pending != task);
        self.delayed.len() != before
    }

    pub fn is_pending(&self, task: TaskId) -> bool {
        self.delayed.iter().any(|(pending, _)| *pending == task)
    }

    /// Milliseconds until `task` is due.
    pub fn remaining_ms(&self, task: TaskId) -> Option<u64> {
        self.delayed
            .iter()
            .find(|(pending, _)| *pending == task)
            .map(|(_, due)| due.saturating_sub(self.now_ms))
    }

    /// Move the clock forward and return the tasks that fell due, earliest
    /// first.
    pub fn advance(&mut self, ms: u64) -> Vec<TaskId> {
        self.now_ms += ms;
        let now = self.now_ms;
        let mut due: Vec<(TaskId, u64)> = self.delayed.iter().copied().filter(|(_, at)| *at <= now).collect();
        self.delayed.retain(|(_, at)| *at > now);
        due.sort_by_key(|(_, at)| *at);
        due.into_iter().map(|(task, _)| task).collect()
    }

    /// Queue a message for the host to report once it is able to.
    pub fn report_message(&mut self, kind: MessageKind, text: impl Into<String>) {
        self.messages.push_back(Message {
            kind,
            text: text.into(),
        });
    }

    pub fn drain_messages(&mut self) -> Vec<Message> {
        self.messages.drain(..).collect()
    }
}
