//! Bounded, append-only history of decoded terminal output.
//!
//! The reader task is the only writer. Every appended chunk gets the next
//! sequence number; evicting old chunks never renumbers the survivors.
//! Waiters observe growth through a `watch` channel carrying the latest
//! sequence number.

use std::collections::VecDeque;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tokio::sync::watch;

use crate::types::OutputLine;

struct Inner {
    lines: VecDeque<OutputLine>,
    last_seq: u64,
}

/// Output history shared between the reader task and callers.
pub struct OutputBuffer {
    inner: RwLock<Inner>,
    capacity: usize,
    seq_tx: watch::Sender<u64>,
}

impl OutputBuffer {
    /// Creates a buffer retaining at most `capacity` lines (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let (seq_tx, _) = watch::channel(0);
        Self {
            inner: RwLock::new(Inner {
                lines: VecDeque::new(),
                last_seq: 0,
            }),
            capacity: capacity.max(1),
            seq_tx,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        // A panicking reader cannot leave the history half-written.
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends a chunk and returns it with its sequence number.
    pub fn append(&self, text: impl Into<String>) -> OutputLine {
        let line = {
            let mut inner = self.write();
            inner.last_seq += 1;
            let line = OutputLine {
                seq: inner.last_seq,
                text: text.into(),
                received_at: Utc::now(),
            };
            inner.lines.push_back(line.clone());
            while inner.lines.len() > self.capacity {
                inner.lines.pop_front();
            }
            line
        };

        self.seq_tx.send_replace(line.seq);
        line
    }

    /// Returns the last `last_n` chunks, or everything when `None`.
    ///
    /// Asking for more than is retained returns the full history.
    pub fn snapshot(&self, last_n: Option<usize>) -> Vec<String> {
        let inner = self.read();
        let skip = match last_n {
            Some(n) => inner.lines.len().saturating_sub(n),
            None => 0,
        };
        inner.lines.iter().skip(skip).map(|l| l.text.clone()).collect()
    }

    /// Returns the full retained history.
    pub fn history(&self) -> Vec<String> {
        self.snapshot(None)
    }

    /// Returns retained lines with a sequence number above `seq`.
    pub fn lines_after(&self, seq: u64) -> Vec<OutputLine> {
        let inner = self.read();
        inner
            .lines
            .iter()
            .filter(|l| l.seq > seq)
            .cloned()
            .collect()
    }

    /// Highest sequence number assigned so far (0 before any output).
    pub fn last_seq(&self) -> u64 {
        self.read().last_seq
    }

    /// Subscribes to sequence number updates.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.seq_tx.subscribe()
    }

    /// Number of retained lines.
    pub fn len(&self) -> usize {
        self.read().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_sequence_numbers_strictly_increase() {
        let buf = OutputBuffer::new(10);
        let seqs: Vec<u64> = (0..5).map(|i| buf.append(format!("l{}", i)).seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(buf.last_seq(), 5);
    }

    #[test]
    fn test_snapshot_last_n() {
        let buf = OutputBuffer::new(10);
        for line in ["line1", "line2", "line3"] {
            buf.append(line);
        }

        assert_eq!(buf.snapshot(None), vec!["line1", "line2", "line3"]);
        assert_eq!(buf.snapshot(Some(2)), vec!["line2", "line3"]);
        assert_eq!(buf.snapshot(Some(0)), Vec::<String>::new());
        assert_eq!(buf.snapshot(Some(50)), vec!["line1", "line2", "line3"]);
    }

    #[test]
    fn test_empty_history() {
        let buf = OutputBuffer::new(10);
        assert!(buf.is_empty());
        assert!(buf.history().is_empty());
        assert_eq!(buf.last_seq(), 0);
    }

    #[test]
    fn test_eviction_keeps_numbering() {
        let buf = OutputBuffer::new(3);
        for i in 1..=5 {
            buf.append(format!("l{}", i));
        }

        assert_eq!(buf.len(), 3);
        assert_eq!(buf.history(), vec!["l3", "l4", "l5"]);
        let seqs: Vec<u64> = buf.lines_after(0).iter().map(|l| l.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn test_lines_after_watermark() {
        let buf = OutputBuffer::new(10);
        buf.append("before");
        let watermark = buf.last_seq();
        buf.append("a");
        buf.append("b");

        let texts: Vec<String> = buf.lines_after(watermark).into_iter().map(|l| l.text).collect();
        assert_eq!(texts, vec!["a", "b"]);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let buf = OutputBuffer::new(0);
        buf.append("x");
        assert_eq!(buf.capacity(), 1);
        assert_eq!(buf.history(), vec!["x"]);
    }

    #[test]
    fn test_subscribers_see_latest_seq() {
        let buf = OutputBuffer::new(10);
        let mut rx = buf.subscribe();
        buf.append("x");
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);
    }

    #[test]
    fn test_concurrent_readers_never_see_out_of_order_lines() {
        let buf = Arc::new(OutputBuffer::new(200));
        let writer = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || {
                for i in 1..=2000u64 {
                    buf.append(i.to_string());
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let buf = Arc::clone(&buf);
                thread::spawn(move || {
                    for _ in 0..500 {
                        let lines = buf.lines_after(0);
                        for pair in lines.windows(2) {
                            assert_eq!(pair[1].seq, pair[0].seq + 1);
                            assert_eq!(pair[0].text, pair[0].seq.to_string());
                        }
                        let snapshot = buf.snapshot(Some(10));
                        let numbers: Vec<u64> =
                            snapshot.iter().map(|s| s.parse().unwrap()).collect();
                        assert!(numbers.windows(2).all(|w| w[1] == w[0] + 1));
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(buf.last_seq(), 2000);
    }
}
