//! Message bus: embedded broker, client connection and batched publishing.
//!
//! The gateway talks to a NATS-style subject bus through [`BusClient`]. The
//! bus itself is either the embedded [`BusServer`] (in-process broker behind
//! a TCP listener, brought up by the runtime) or an external broker speaking
//! the same line protocol.
//!
//! ## Wire protocol (text, CRLF-framed)
//!
//! ```text
//! client -> server   PUB <subject> <len>\r\n<payload>\r\n
//!                    SUB <pattern> <sid>\r\n
//!                    UNSUB <sid>\r\n
//!                    PING\r\n / PONG\r\n
//! server -> client   MSG <subject> <sid> <len>\r\n<payload>\r\n
//!                    PING\r\n / PONG\r\n
//!                    -ERR <reason>\r\n
//! ```
//!
//! Delivery is at-most-once: a slow subscriber's queue overflowing drops
//! messages (counted), and nothing is replayed on reconnect. Per-subject
//! ordering is preserved between one publisher and one subscriber.

mod batch;
mod client;
mod server;
pub mod subject;

pub use batch::{BatchConfig, BatchPublisher};
pub use client::{BusClient, BusMessage, MessageHandler, Subscription};
pub use server::BusServer;

use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Default flush threshold for the batched async publisher.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Default flush timer for the batched async publisher (milliseconds).
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 50;

/// Default bound of the async publish queue.
pub const DEFAULT_ASYNC_QUEUE_CAPACITY: usize = 1024;

/// Connection attempts made when the runtime first connects to the bus.
pub const CONNECT_ATTEMPTS: u32 = 5;

/// Delay between initial connection attempts (milliseconds).
pub const CONNECT_RETRY_DELAY_MS: u64 = 1_000;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum BusError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid subject '{0}'")]
    InvalidSubject(String),

    #[error("Invalid subscription pattern '{0}'")]
    InvalidPattern(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connect to {addr} failed after {attempts} attempts: {last}")]
    ConnectExhausted {
        addr: String,
        attempts: u32,
        last: String,
    },

    #[error("Bus port {0} and fallback {1} both busy")]
    PortsBusy(u16, u16),

    #[error("Payload of {0} bytes exceeds limit {1}")]
    PayloadTooLarge(usize, usize),
}

// ============================================================================
// Shared counters
// ============================================================================

/// Hot-path bus counters, read by the metrics collector each tick.
///
/// Plain atomics: writers are lock-free, the reader takes a relaxed snapshot.
#[derive(Debug, Default)]
pub struct BusStats {
    pub published: AtomicU64,
    pub received: AtomicU64,
    pub bytes_out: AtomicU64,
    pub bytes_in: AtomicU64,
    pub sync_fallbacks: AtomicU64,
    pub batch_flushes: AtomicU64,
    pub reconnects: AtomicU64,
    pub dropped: AtomicU64,
    pub subscriptions: AtomicU64,
}

impl BusStats {
    pub fn snapshot(&self) -> BusStatsSnapshot {
        BusStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            sync_fallbacks: self.sync_fallbacks.load(Ordering::Relaxed),
            batch_flushes: self.batch_flushes.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            subscriptions: self.subscriptions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`BusStats`].
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct BusStatsSnapshot {
    pub published: u64,
    pub received: u64,
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub sync_fallbacks: u64,
    pub batch_flushes: u64,
    pub reconnects: u64,
    pub dropped: u64,
    pub subscriptions: u64,
}

/// Upper bound on a single message payload (8 MiB). Large binary points are
/// expected to be chunked by the producing adapter.
pub const MAX_PAYLOAD_BYTES: usize = 8 * 1024 * 1024;
