//! Cancellable scheduled tasks driven by the session tick

use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct Entry<T> {
    handle: TimerHandle,
    deadline: Instant,
    task: T,
}

/// A deadline queue polled from the tick loop
///
/// Nothing fires on its own: `due` hands back every task whose deadline has
/// passed. Handles stay valid until the task fires or is cancelled, and
/// `clear` drops everything so no timer survives a session teardown.
pub struct Scheduler<T> {
    entries: Vec<Entry<T>>,
    next_handle: u64,
}

impl<T> Scheduler<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_handle: 1,
        }
    }

    pub fn schedule(&mut self, deadline: Instant, task: T) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        self.entries.push(Entry {
            handle,
            deadline,
            task,
        });
        handle
    }

    /// Returns true if the timer was still pending
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.handle != handle);
        self.entries.len() != before
    }

    /// Removes and returns the tasks due at `now`, earliest first
    pub fn due(&mut self, now: Instant) -> Vec<T> {
        let mut fired = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            if self.entries[index].deadline <= now {
                fired.push(self.entries.swap_remove(index));
            } else {
                index += 1;
            }
        }
        fired.sort_by_key(|entry| (entry.deadline, entry.handle.0));
        fired.into_iter().map(|entry| entry.task).collect()
    }

    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.entries.iter().any(|entry| entry.handle == handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}
