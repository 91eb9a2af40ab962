//! Bus client connection.
//!
//! One TCP connection to the broker (embedded or external), shared by every
//! component through `Arc<BusClient>`. The client owns a background
//! connection task that transparently reconnects with capped back-off and
//! re-establishes subscriptions; the runtime never restarts services on
//! reconnect.
//!
//! Subscription handlers run on the reader task and must not block; they
//! hand messages off to their component's own channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::subject::{valid_pattern, valid_subject};
use super::{BusError, BusStats, CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY_MS, MAX_PAYLOAD_BYTES};

/// Reconnect back-off ceiling.
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// Outbound frame queue depth. Publishes block once this fills while the
/// connection is down; that back-pressure is intentional.
const OUT_QUEUE: usize = 8_192;

/// One message delivered to a subscription handler.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

/// Subscription callback. Runs on the reader task - must not block.
pub type MessageHandler = Arc<dyn Fn(BusMessage) + Send + Sync>;

struct SubEntry {
    pattern: String,
    handler: MessageHandler,
}

struct ClientInner {
    addr: String,
    out_tx: mpsc::Sender<Vec<u8>>,
    subs: DashMap<u64, SubEntry>,
    next_sid: AtomicU64,
    closed: AtomicBool,
    cancel: CancellationToken,
    stats: Arc<BusStats>,
}

/// Handle to the shared bus connection.
#[derive(Clone)]
pub struct BusClient {
    inner: Arc<ClientInner>,
}

impl BusClient {
    /// Connect with up to [`CONNECT_ATTEMPTS`] attempts spaced
    /// [`CONNECT_RETRY_DELAY_MS`] apart. The embedded server may still be
    /// binding when the runtime gets here, hence the retry.
    pub async fn connect(addr: &str, cancel: CancellationToken) -> Result<Self, BusError> {
        let mut last_err = String::new();
        for attempt in 1..=CONNECT_ATTEMPTS {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    info!(addr, attempt, "Connected to bus");
                    return Ok(Self::from_stream(addr.to_string(), stream, cancel.clone()));
                }
                Err(e) => {
                    last_err = e.to_string();
                    debug!(addr, attempt, error = %e, "Bus connect attempt failed");
                    if attempt < CONNECT_ATTEMPTS {
                        tokio::select! {
                            () = cancel.cancelled() => return Err(BusError::ConnectionClosed),
                            () = tokio::time::sleep(Duration::from_millis(CONNECT_RETRY_DELAY_MS)) => {}
                        }
                    }
                }
            }
        }
        Err(BusError::ConnectExhausted {
            addr: addr.to_string(),
            attempts: CONNECT_ATTEMPTS,
            last: last_err,
        })
    }

    fn from_stream(addr: String, stream: TcpStream, cancel: CancellationToken) -> Self {
        let _ = stream.set_nodelay(true);
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(OUT_QUEUE);
        let inner = Arc::new(ClientInner {
            addr,
            out_tx,
            subs: DashMap::new(),
            next_sid: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            cancel: cancel.child_token(),
            stats: Arc::new(BusStats::default()),
        });

        let task_inner = Arc::clone(&inner);
        tokio::spawn(connection_task(task_inner, stream, out_rx));

        Self { inner }
    }

    /// Synchronous publish: the frame is queued for the writer before this
    /// returns. Delivery remains at-most-once.
    pub async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), BusError> {
        self.publish_batch(&[subject], &[payload]).await
    }

    /// Publish several messages as one contiguous write. Used by the batch
    /// publisher's flush.
    pub async fn publish_batch(
        &self,
        subjects: &[&str],
        payloads: &[&[u8]],
    ) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BusError::ConnectionClosed);
        }
        let mut buf = Vec::with_capacity(64 * subjects.len());
        for (subject, payload) in subjects.iter().zip(payloads.iter()) {
            if !valid_subject(subject) {
                return Err(BusError::InvalidSubject((*subject).to_string()));
            }
            if payload.len() > MAX_PAYLOAD_BYTES {
                return Err(BusError::PayloadTooLarge(payload.len(), MAX_PAYLOAD_BYTES));
            }
            buf.extend_from_slice(format!("PUB {} {}\r\n", subject, payload.len()).as_bytes());
            buf.extend_from_slice(payload);
            buf.extend_from_slice(b"\r\n");
            self.inner.stats.published.fetch_add(1, Ordering::Relaxed);
            self.inner
                .stats
                .bytes_out
                .fetch_add(payload.len() as u64, Ordering::Relaxed);
        }
        self.inner
            .out_tx
            .send(buf)
            .await
            .map_err(|_| BusError::ConnectionClosed)
    }

    /// Register a wildcard subscription. The returned handle must be
    /// explicitly released; dropping it without release is a resource leak
    /// and is logged as such.
    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: MessageHandler,
    ) -> Result<Subscription, BusError> {
        if !valid_pattern(pattern) {
            return Err(BusError::InvalidPattern(pattern.to_string()));
        }
        let sid = self.inner.next_sid.fetch_add(1, Ordering::Relaxed);
        self.inner.subs.insert(
            sid,
            SubEntry {
                pattern: pattern.to_string(),
                handler,
            },
        );
        self.inner.stats.subscriptions.fetch_add(1, Ordering::Relaxed);
        let frame = format!("SUB {} {}\r\n", pattern, sid).into_bytes();
        self.inner
            .out_tx
            .send(frame)
            .await
            .map_err(|_| BusError::ConnectionClosed)?;
        debug!(pattern, sid, "Subscribed");
        Ok(Subscription {
            sid,
            pattern: pattern.to_string(),
            inner: Arc::downgrade(&self.inner),
            released: AtomicBool::new(false),
        })
    }

    /// Hot-path counters for the metrics collector.
    pub fn stats(&self) -> Arc<BusStats> {
        Arc::clone(&self.inner.stats)
    }

    /// Close the connection. Pending frames in the outbound queue are
    /// dropped; further publishes fail with `ConnectionClosed`.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.cancel.cancel();
            info!(addr = %self.inner.addr, "Bus client closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

// ============================================================================
// Subscription handle
// ============================================================================

/// Live subscription. Release explicitly when the consumer stops.
pub struct Subscription {
    sid: u64,
    pattern: String,
    inner: Weak<ClientInner>,
    released: AtomicBool,
}

impl Subscription {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Unsubscribe from the broker and drop the handler.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            inner.subs.remove(&self.sid);
            let frame = format!("UNSUB {}\r\n", self.sid).into_bytes();
            let _ = inner.out_tx.send(frame).await;
            debug!(pattern = %self.pattern, sid = self.sid, "Subscription released");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            // Still detach the handler so messages stop flowing, but flag
            // the leak: the broker keeps fanning out to a dead sid until
            // reconnect.
            if let Some(inner) = self.inner.upgrade() {
                inner.subs.remove(&self.sid);
                if !inner.closed.load(Ordering::Acquire) {
                    warn!(
                        pattern = %self.pattern,
                        sid = self.sid,
                        "Subscription dropped without release() - broker-side entry leaked until reconnect"
                    );
                }
            }
        }
    }
}

// ============================================================================
// Connection task
// ============================================================================

async fn connection_task(
    inner: Arc<ClientInner>,
    first_stream: TcpStream,
    mut out_rx: mpsc::Receiver<Vec<u8>>,
) {
    let mut stream = Some(first_stream);
    let mut backoff = Duration::from_secs(1);

    loop {
        let current = match stream.take() {
            Some(s) => s,
            None => match reconnect(&inner, &mut backoff).await {
                Some(s) => s,
                None => return, // closed or cancelled
            },
        };

        out_rx = run_connection(&inner, current, out_rx).await;

        if inner.closed.load(Ordering::Acquire) || inner.cancel.is_cancelled() {
            return;
        }
        inner.stats.reconnects.fetch_add(1, Ordering::Relaxed);
        warn!(addr = %inner.addr, "Bus connection lost, reconnecting");
    }
}

/// Reconnect with capped exponential back-off plus jitter.
async fn reconnect(inner: &Arc<ClientInner>, backoff: &mut Duration) -> Option<TcpStream> {
    loop {
        if inner.closed.load(Ordering::Acquire) {
            return None;
        }
        match TcpStream::connect(&inner.addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                *backoff = Duration::from_secs(1);
                info!(addr = %inner.addr, "Bus reconnected");
                return Some(stream);
            }
            Err(e) => {
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
                debug!(addr = %inner.addr, error = %e, backoff = ?*backoff, "Reconnect failed");
                tokio::select! {
                    () = inner.cancel.cancelled() => return None,
                    () = tokio::time::sleep(*backoff + jitter) => {}
                }
                *backoff = (*backoff * 2).min(RECONNECT_CAP);
            }
        }
    }
}

/// Drive one live connection until it drops. Returns the outbound receiver
/// so the next connection can reuse it.
async fn run_connection(
    inner: &Arc<ClientInner>,
    stream: TcpStream,
    out_rx: mpsc::Receiver<Vec<u8>>,
) -> mpsc::Receiver<Vec<u8>> {
    let (read_half, write_half) = stream.into_split();

    // Re-announce every live subscription before anything else is written.
    let mut resub = Vec::new();
    for entry in inner.subs.iter() {
        resub.extend_from_slice(format!("SUB {} {}\r\n", entry.value().pattern, entry.key()).as_bytes());
    }

    // The writer must hand the queue back intact when this connection dies,
    // so it is stopped cooperatively (token), never aborted.
    let conn_cancel = inner.cancel.child_token();
    let writer = tokio::spawn(client_write_loop(
        write_half,
        out_rx,
        resub,
        conn_cancel.clone(),
    ));
    let read_result = client_read_loop(inner, read_half).await;
    if let Err(e) = read_result {
        debug!(error = %e, "Bus reader stopped");
    }

    conn_cancel.cancel();
    match writer.await {
        Ok(rx) => rx,
        Err(join) => {
            // Writer task panicked; the queue is unrecoverable, so close the
            // client rather than silently black-holing publishes.
            warn!(error = %join, "Bus writer task failed, closing client");
            inner.closed.store(true, Ordering::Release);
            inner.cancel.cancel();
            let (_tx, rx) = mpsc::channel(1);
            rx
        }
    }
}

async fn client_write_loop(
    mut half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Vec<u8>>,
    resub: Vec<u8>,
    cancel: CancellationToken,
) -> mpsc::Receiver<Vec<u8>> {
    if !resub.is_empty() && half.write_all(&resub).await.is_err() {
        return rx;
    }
    loop {
        tokio::select! {
            () = cancel.cancelled() => return rx,
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if half.write_all(&frame).await.is_err() {
                        return rx;
                    }
                }
                None => return rx,
            }
        }
    }
}

async fn client_read_loop(
    inner: &Arc<ClientInner>,
    read_half: OwnedReadHalf,
) -> Result<(), BusError> {
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::with_capacity(256);

    loop {
        line.clear();
        let n = tokio::select! {
            () = inner.cancel.cancelled() => return Ok(()),
            n = read_line(&mut reader, &mut line) => n?,
        };
        if n == 0 {
            return Err(BusError::ConnectionClosed);
        }

        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end();
        let mut parts = text.split_ascii_whitespace();
        match parts.next() {
            Some("MSG") => {
                let subject = parts.next().unwrap_or_default().to_string();
                let sid: u64 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| BusError::Protocol("bad MSG sid".to_string()))?;
                let len: usize = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| BusError::Protocol("bad MSG length".to_string()))?;
                if len > MAX_PAYLOAD_BYTES {
                    return Err(BusError::PayloadTooLarge(len, MAX_PAYLOAD_BYTES));
                }
                let mut payload = vec![0u8; len + 2];
                reader.read_exact(&mut payload).await?;
                payload.truncate(len);

                inner.stats.received.fetch_add(1, Ordering::Relaxed);
                inner
                    .stats
                    .bytes_in
                    .fetch_add(len as u64, Ordering::Relaxed);

                if let Some(entry) = inner.subs.get(&sid) {
                    (entry.handler)(BusMessage { subject, payload });
                }
            }
            Some("PING") => {
                let _ = inner.out_tx.try_send(b"PONG\r\n".to_vec());
            }
            Some("-ERR") => {
                warn!(reason = %text, "Bus server error frame");
            }
            Some("PONG") | Some("+OK") | None => {}
            Some(other) => {
                return Err(BusError::Protocol(format!("unknown frame {other}")));
            }
        }
    }
}

async fn read_line(
    reader: &mut BufReader<OwnedReadHalf>,
    line: &mut Vec<u8>,
) -> Result<usize, BusError> {
    use tokio::io::AsyncBufReadExt;
    let n = reader.read_until(b'\n', line).await?;
    if line.len() > 4_096 {
        return Err(BusError::Protocol("frame line too long".to_string()));
    }
    Ok(n)
}
