use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use irc::proto;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub timestamp: DateTime<Utc>,
    pub message: proto::Message,
}

/// Fixed capacity history of recent lines. The oldest entry is evicted
/// when a push would exceed the capacity.
#[derive(Debug, Clone)]
pub struct Backbuffer {
    capacity: usize,
    entries: VecDeque<Entry>,
}

impl Backbuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&mut self, timestamp: DateTime<Utc>, message: proto::Message) {
        if self.capacity == 0 {
            return;
        }

        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }

        self.entries.push_back(Entry { timestamp, message });
    }

    /// Changes the capacity, dropping the oldest entries that no longer fit.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;

        while self.entries.len() > capacity {
            self.entries.pop_front();
        }
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

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    /// Entries at or after `cutoff`, oldest first.
    pub fn since(&self, cutoff: Option<DateTime<Utc>>) -> impl Iterator<Item = &Entry> {
        self.entries
            .iter()
            .filter(move |entry| cutoff.is_none_or(|cutoff| entry.timestamp >= cutoff))
    }
}
