use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

/// One out-of-protocol line a backend wrote to stderr.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StderrLine {
    pub seq: u64,
    /// Request in flight when the line was read, if any.
    pub request_id: Option<u64>,
    pub text: String,
}

/// Bounded tail of a session's stderr. Oldest lines are dropped first.
pub struct StderrTail {
    capacity: usize,
    state: Mutex<TailState>,
}

#[derive(Default)]
struct TailState {
    next_seq: u64,
    lines: VecDeque<StderrLine>,
}

impl StderrTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(TailState::default()),
        }
    }

    pub fn push(&self, request_id: Option<u64>, text: String) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.next_seq += 1;
        let seq = state.next_seq;
        state.lines.push_back(StderrLine {
            seq,
            request_id,
            text,
        });
        while state.lines.len() > self.capacity {
            state.lines.pop_front();
        }
    }

    /// The most recent `n` lines, oldest first.
    pub fn last(&self, n: usize) -> Vec<StderrLine> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let start = state.lines.len().saturating_sub(n);
        state.lines.iter().skip(start).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_the_newest_lines() {
        let tail = StderrTail::new(3);
        for line in ["a", "b", "c", "d"] {
            tail.push(None, line.to_string());
        }
        let lines = tail.last(10);
        let texts: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["b", "c", "d"]);
        assert_eq!(lines[0].seq, 2);
        assert_eq!(tail.last(1)[0].text, "d");
    }

    #[test]
    fn lines_remember_the_request_in_flight() {
        let tail = StderrTail::new(0);
        tail.push(Some(7), "Traceback".to_string());
        let lines = tail.last(5);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].request_id, Some(7));
    }
}
