//! Packetizer and bounded send queue.
//!
//! Pure state behind every endpoint's mutex: the accumulation buffer
//! that batches small sends into fewer wire packets, and the FIFO queue
//! of packets awaiting transmission. All methods are short (append,
//! enqueue, pop); the owning endpoint never holds the lock across I/O.
//!
//! Invariants:
//! - the packetizer never holds more than `max_message_size` bytes,
//! - a submitted message is never split across queued packets (the
//!   overflow check runs before the append),
//! - bytes reach the queue in submission order even when one call both
//!   overflows the packetizer and requests a flush.

use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Queued wire packets are shared so the writer task can hold one
/// outside the lock while it remains queued for retransmit-on-reconnect.
pub type Packet = Arc<Vec<u8>>;

#[derive(Debug)]
pub struct SendQueue {
    packetizer: Vec<u8>,
    queue: VecDeque<Packet>,
    max_message_size: usize,
    queue_limit: usize,
    flush_timeout: Duration,
    flush_deadline: Option<Instant>,
}

impl SendQueue {
    pub fn new(max_message_size: usize, queue_limit: usize, flush_timeout: Duration) -> Self {
        Self {
            packetizer: Vec::new(),
            queue: VecDeque::new(),
            max_message_size,
            queue_limit,
            flush_timeout,
            flush_deadline: None,
        }
    }

    /// Append one framed message, possibly enqueueing packets.
    ///
    /// Follows the client-endpoint send path: overflow enqueues the
    /// current packetizer *before* the append so no message straddles a
    /// packet boundary; `flush` enqueues the packetizer afterwards and
    /// cancels the flush timer; otherwise the timer is (re)armed.
    pub fn push(&mut self, bytes: &[u8], flush: bool, now: Instant) -> Result<()> {
        if bytes.len() > self.max_message_size {
            return Err(Error::MessageTooLarge {
                size: bytes.len(),
                limit: self.max_message_size,
            });
        }
        if self.queue.len() >= self.queue_limit {
            return Err(Error::QueueFull(self.queue_limit));
        }

        if self.packetizer.len() + bytes.len() > self.max_message_size {
            let full = std::mem::take(&mut self.packetizer);
            self.queue.push_back(Arc::new(full));
        }

        self.packetizer.extend_from_slice(bytes);

        if flush {
            self.flush_deadline = None;
            let full = std::mem::take(&mut self.packetizer);
            self.queue.push_back(Arc::new(full));
        } else {
            self.flush_deadline = Some(now + self.flush_timeout);
        }
        Ok(())
    }

    /// Move the packetizer to the queue if it holds anything.
    pub fn flush(&mut self) -> bool {
        self.flush_deadline = None;
        if self.packetizer.is_empty() {
            return false;
        }
        let full = std::mem::take(&mut self.packetizer);
        self.queue.push_back(Arc::new(full));
        true
    }

    /// Flush only when the armed deadline has passed.
    pub fn flush_if_due(&mut self, now: Instant) -> bool {
        match self.flush_deadline {
            Some(deadline) if now >= deadline => self.flush(),
            _ => false,
        }
    }

    /// Head of the queue, left in place until [`Self::pop_sent`].
    pub fn front(&self) -> Option<Packet> {
        self.queue.front().cloned()
    }

    /// Drop the head after a completed write.
    pub fn pop_sent(&mut self) {
        self.queue.pop_front();
    }

    /// Discard everything (endpoint stop).
    pub fn clear(&mut self) {
        self.packetizer.clear();
        self.queue.clear();
        self.flush_deadline = None;
    }

    pub fn flush_deadline(&self) -> Option<Instant> {
        self.flush_deadline
    }

    pub fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn queued_packets(&self) -> usize {
        self.queue.len()
    }

    pub fn packetizer_len(&self) -> usize {
        self.packetizer.len()
    }
}
