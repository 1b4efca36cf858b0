//! Transport counters shared by every connection of a table.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, v: u64) {
        self.0.fetch_add(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A value that can go up or down.
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn sub(&self, v: i64) {
        self.0.fetch_sub(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct TransportStats {
    pub bytes_sent: Counter,
    pub bytes_received: Counter,
    pub frames_sent: Counter,
    pub frames_received: Counter,
    pub messages_received: Counter,
    /// Messages that shared a frame with at least one other message.
    pub messages_batched: Counter,
    pub connections_opened: Counter,
    pub connections_closed: Counter,
    pub reconnects: Counter,
    /// Messages refused because a peer's queue was full.
    pub queue_rejections: Counter,
    /// Messages waiting in dedicated sender queues.
    pub queued_messages: Gauge,
}

/// Point-in-time copy of [`TransportStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub messages_received: u64,
    pub messages_batched: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub reconnects: u64,
    pub queue_rejections: u64,
    pub queued_messages: i64,
}

impl TransportStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent.get(),
            bytes_received: self.bytes_received.get(),
            frames_sent: self.frames_sent.get(),
            frames_received: self.frames_received.get(),
            messages_received: self.messages_received.get(),
            messages_batched: self.messages_batched.get(),
            connections_opened: self.connections_opened.get(),
            connections_closed: self.connections_closed.get(),
            reconnects: self.reconnects.get(),
            queue_rejections: self.queue_rejections.get(),
            queued_messages: self.queued_messages.get(),
        }
    }
}
