//! Batched asynchronous publisher.
//!
//! `publish_async` queues onto a bounded channel feeding one background
//! flusher. The flusher writes a batch when it reaches `batch_size` (default
//! 50) or when the flush timer (default 50 ms) fires. Payload buffers come
//! from a small object pool so steady-state publishing does not allocate.
//! When the queue is full the caller falls back to a synchronous publish -
//! that slow path is the producer-visible face of back-pressure.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    BusClient, BusError, BusStats, DEFAULT_ASYNC_QUEUE_CAPACITY, DEFAULT_BATCH_SIZE,
    DEFAULT_FLUSH_INTERVAL_MS,
};

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub queue_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            queue_capacity: DEFAULT_ASYNC_QUEUE_CAPACITY,
        }
    }
}

struct Queued {
    subject: String,
    buf: Vec<u8>,
}

/// Reusable payload buffers. Capped so a burst cannot pin memory forever.
struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    cap: usize,
}

impl BufferPool {
    fn new(cap: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(cap)),
            cap,
        }
    }

    fn acquire(&self) -> Vec<u8> {
        self.free
            .lock()
            .ok()
            .and_then(|mut v| v.pop())
            .unwrap_or_else(|| Vec::with_capacity(512))
    }

    fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.cap {
                free.push(buf);
            }
        }
    }
}

/// Async publishing front-end over a [`BusClient`].
#[derive(Clone)]
pub struct BatchPublisher {
    tx: mpsc::Sender<Queued>,
    pool: Arc<BufferPool>,
    client: BusClient,
    stats: Arc<BusStats>,
}

impl BatchPublisher {
    pub fn new(client: BusClient, config: BatchConfig, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let pool = Arc::new(BufferPool::new(config.queue_capacity * 2));
        let stats = client.stats();

        tokio::spawn(flush_loop(
            client.clone(),
            rx,
            Arc::clone(&pool),
            config,
            cancel,
        ));

        Self {
            tx,
            pool,
            client,
            stats,
        }
    }

    /// Queue a publish. Falls back to a synchronous publish when the queue
    /// is full; the fallback is counted so chronic overload is observable.
    pub async fn publish_async(&self, subject: &str, payload: &[u8]) -> Result<(), BusError> {
        let mut buf = self.pool.acquire();
        buf.extend_from_slice(payload);
        let queued = Queued {
            subject: subject.to_string(),
            buf,
        };
        match self.tx.try_send(queued) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(q)) => {
                self.stats.sync_fallbacks.fetch_add(1, Ordering::Relaxed);
                let result = self.client.publish(&q.subject, &q.buf).await;
                self.pool.release(q.buf);
                result
            }
            Err(mpsc::error::TrySendError::Closed(q)) => {
                self.pool.release(q.buf);
                Err(BusError::ConnectionClosed)
            }
        }
    }
}

async fn flush_loop(
    client: BusClient,
    mut rx: mpsc::Receiver<Queued>,
    pool: Arc<BufferPool>,
    config: BatchConfig,
    cancel: CancellationToken,
) {
    let mut pending: Vec<Queued> = Vec::with_capacity(config.batch_size);
    let stats = client.stats();

    loop {
        // Wait for the first message of a batch, then collect until either
        // the batch fills or the flush timer elapses.
        let first = tokio::select! {
            () = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(m) => m,
                None => break,
            }
        };
        pending.push(first);

        let deadline = tokio::time::Instant::now() + config.flush_interval;
        while pending.len() < config.batch_size {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep_until(deadline) => break,
                msg = rx.recv() => match msg {
                    Some(m) => pending.push(m),
                    None => break,
                }
            }
        }

        flush(&client, &pool, &mut pending).await;
        stats.batch_flushes.fetch_add(1, Ordering::Relaxed);

        if cancel.is_cancelled() {
            break;
        }
    }

    // Final drain on shutdown.
    while let Ok(msg) = rx.try_recv() {
        pending.push(msg);
    }
    if !pending.is_empty() {
        flush(&client, &pool, &mut pending).await;
    }
    debug!("Batch publisher stopped");
}

async fn flush(client: &BusClient, pool: &BufferPool, pending: &mut Vec<Queued>) {
    if pending.is_empty() {
        return;
    }
    {
        let subjects: Vec<&str> = pending.iter().map(|q| q.subject.as_str()).collect();
        let payloads: Vec<&[u8]> = pending.iter().map(|q| q.buf.as_slice()).collect();
        if let Err(e) = client.publish_batch(&subjects, &payloads).await {
            warn!(error = %e, batch = pending.len(), "Batch flush failed, messages dropped");
        }
    }
    for q in pending.drain(..) {
        pool.release(q.buf);
    }
}
