//! Bounded append-only audit log for long-running sync sessions.

use chrono::Utc;
use std::collections::VecDeque;

/// Ordered list of human-readable events, capped so that multi-hour sessions
/// cannot grow memory without bound. Oldest entries drop first.
#[derive(Debug)]
pub struct AuditLog {
    entries: VecDeque<String>,
    cap: usize,
    dropped: u64,
}

impl AuditLog {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(cap.min(1024)),
            cap: cap.max(1),
            dropped: 0,
        }
    }

    pub fn push(&mut self, message: impl Into<String>) {
        if self.entries.len() == self.cap {
            self.entries.pop_front();
            self.dropped += 1;
        }
        self.entries
            .push_back(format!("{} {}", Utc::now().format("%H:%M:%S"), message.into()));
    }

    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// How many entries have been evicted since the log was created.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn into_vec(self) -> Vec<String> {
        self.entries.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_drops_oldest_first() {
        let mut log = AuditLog::new(3);
        for i in 0..5 {
            log.push(format!("event {}", i));
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.dropped(), 2);
        let entries: Vec<&str> = log.entries().collect();
        assert!(entries[0].ends_with("event 2"));
        assert!(entries[2].ends_with("event 4"));
    }

    #[test]
    fn zero_cap_still_keeps_one_entry() {
        let mut log = AuditLog::new(0);
        log.push("only");
        assert_eq!(log.len(), 1);
    }
}
