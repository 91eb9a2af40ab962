//! Embedded bus server.
//!
//! A minimal in-process broker exposed over TCP so that sidecar processes
//! and external tools can share the same bus as the gateway's own client.
//! Fan-out is at-most-once: every matching subscription gets the message
//! queued on its connection's outbound channel, and a full channel drops
//! (counted in [`BusStats::dropped`]).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::subject::{subject_matches, valid_pattern, valid_subject};
use super::{BusError, BusStats, MAX_PAYLOAD_BYTES};

/// Interval without inbound traffic before the server probes with PING.
const IDLE_PROBE: Duration = Duration::from_secs(60);

/// Consecutive idle probes tolerated before the connection is reaped.
const MAX_IDLE_PROBES: u32 = 2;

/// Outbound queue depth per connection.
const CLIENT_QUEUE: usize = 4_096;

/// Frame queued for a connection's writer task.
enum OutFrame {
    Msg {
        subject: Arc<str>,
        sid: u64,
        payload: Arc<Vec<u8>>,
    },
    Ping,
    Pong,
    Err(String),
}

struct ClientHandle {
    tx: mpsc::Sender<OutFrame>,
    /// sid -> pattern
    subs: DashMap<u64, String>,
}

struct ServerState {
    clients: DashMap<u64, Arc<ClientHandle>>,
    next_client: AtomicU64,
    stats: Arc<BusStats>,
}

impl ServerState {
    /// Fan a published message out to every matching subscription.
    fn dispatch(&self, subject: &str, payload: Arc<Vec<u8>>) {
        let subject: Arc<str> = Arc::from(subject);
        for client in self.clients.iter() {
            for sub in client.subs.iter() {
                if subject_matches(sub.value(), &subject) {
                    let frame = OutFrame::Msg {
                        subject: Arc::clone(&subject),
                        sid: *sub.key(),
                        payload: Arc::clone(&payload),
                    };
                    if client.tx.try_send(frame).is_err() {
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }
}

/// Embedded broker handle. Created by the runtime in embedded-bus mode.
pub struct BusServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl BusServer {
    /// Bind `port` on `host`, falling back to `fallback_port` when busy, and
    /// start accepting connections. Returns once the listener is ready.
    pub async fn start(
        host: &str,
        port: u16,
        fallback_port: u16,
        cancel: CancellationToken,
    ) -> Result<Self, BusError> {
        let listener = match TcpListener::bind((host, port)).await {
            Ok(l) => l,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                warn!(port, fallback_port, "Bus port busy, trying fallback");
                TcpListener::bind((host, fallback_port))
                    .await
                    .map_err(|_| BusError::PortsBusy(port, fallback_port))?
            }
            Err(e) => return Err(BusError::Io(e)),
        };
        let addr = listener.local_addr()?;
        info!(%addr, "Embedded bus server listening");

        let state = Arc::new(ServerState {
            clients: DashMap::new(),
            next_client: AtomicU64::new(1),
            stats: Arc::new(BusStats::default()),
        });

        let tracker = TaskTracker::new();
        let accept_state = Arc::clone(&state);
        let accept_cancel = cancel.clone();
        let accept_tracker = tracker.clone();
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    () = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "Bus connection accepted");
                            let state = Arc::clone(&accept_state);
                            let cancel = accept_cancel.clone();
                            accept_tracker.spawn(async move {
                                handle_connection(state, stream, cancel).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Bus accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        });

        Ok(Self {
            addr,
            state,
            cancel,
            tracker,
        })
    }

    /// Actual listen address (relevant when bound with port 0 in tests).
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Server-side counters (fan-out drops in particular).
    pub fn stats(&self) -> Arc<BusStats> {
        Arc::clone(&self.state.stats)
    }

    /// Stop accepting, close every connection and wait for worker tasks.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.state.clients.clear();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Embedded bus server stopped");
    }
}

async fn handle_connection(state: Arc<ServerState>, stream: TcpStream, cancel: CancellationToken) {
    let client_id = state.next_client.fetch_add(1, Ordering::Relaxed);
    let (read_half, write_half) = stream.into_split();

    let (tx, rx) = mpsc::channel::<OutFrame>(CLIENT_QUEUE);
    let handle = Arc::new(ClientHandle {
        tx,
        subs: DashMap::new(),
    });
    state.clients.insert(client_id, Arc::clone(&handle));

    let writer = tokio::spawn(write_loop(write_half, rx));

    if let Err(e) = read_loop(&state, &handle, read_half, cancel).await {
        debug!(client_id, error = %e, "Bus connection closed");
    }

    state.clients.remove(&client_id);
    // Dropping the handle closes the outbound channel and ends the writer.
    drop(handle);
    let _ = writer.await;
}

async fn write_loop(mut half: OwnedWriteHalf, mut rx: mpsc::Receiver<OutFrame>) {
    let mut buf = Vec::with_capacity(4_096);
    while let Some(frame) = rx.recv().await {
        buf.clear();
        match frame {
            OutFrame::Msg {
                subject,
                sid,
                payload,
            } => {
                buf.extend_from_slice(
                    format!("MSG {} {} {}\r\n", subject, sid, payload.len()).as_bytes(),
                );
                buf.extend_from_slice(&payload);
                buf.extend_from_slice(b"\r\n");
            }
            OutFrame::Ping => buf.extend_from_slice(b"PING\r\n"),
            OutFrame::Pong => buf.extend_from_slice(b"PONG\r\n"),
            OutFrame::Err(reason) => {
                buf.extend_from_slice(format!("-ERR {}\r\n", reason).as_bytes());
            }
        }
        if half.write_all(&buf).await.is_err() {
            return;
        }
    }
}

async fn read_loop(
    state: &ServerState,
    handle: &ClientHandle,
    read_half: OwnedReadHalf,
    cancel: CancellationToken,
) -> Result<(), BusError> {
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::with_capacity(256);
    let mut idle_probes = 0u32;

    loop {
        line.clear();
        let read = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            r = tokio::time::timeout(IDLE_PROBE, read_command(&mut reader, &mut line)) => r,
        };

        let n = match read {
            Err(_elapsed) => {
                idle_probes += 1;
                if idle_probes > MAX_IDLE_PROBES {
                    return Err(BusError::Protocol("idle connection reaped".to_string()));
                }
                let _ = handle.tx.try_send(OutFrame::Ping);
                continue;
            }
            Ok(r) => r?,
        };
        if n == 0 {
            return Ok(()); // EOF
        }
        idle_probes = 0;

        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end();
        let mut parts = text.split_ascii_whitespace();
        match parts.next() {
            Some("PUB") => {
                let subject = parts.next().unwrap_or_default().to_string();
                let len: usize = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| BusError::Protocol("bad PUB length".to_string()))?;
                if len > MAX_PAYLOAD_BYTES {
                    return Err(BusError::PayloadTooLarge(len, MAX_PAYLOAD_BYTES));
                }
                let mut payload = vec![0u8; len + 2];
                reader.read_exact(&mut payload).await?;
                payload.truncate(len); // strip trailing CRLF
                if !valid_subject(&subject) {
                    let _ = handle
                        .tx
                        .try_send(OutFrame::Err(format!("invalid subject {subject}")));
                    continue;
                }
                state.stats.received.fetch_add(1, Ordering::Relaxed);
                state
                    .stats
                    .bytes_in
                    .fetch_add(len as u64, Ordering::Relaxed);
                state.dispatch(&subject, Arc::new(payload));
            }
            Some("SUB") => {
                let pattern = parts.next().unwrap_or_default().to_string();
                let sid: u64 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| BusError::Protocol("bad SUB sid".to_string()))?;
                if !valid_pattern(&pattern) {
                    let _ = handle
                        .tx
                        .try_send(OutFrame::Err(format!("invalid pattern {pattern}")));
                    continue;
                }
                handle.subs.insert(sid, pattern);
                state.stats.subscriptions.fetch_add(1, Ordering::Relaxed);
            }
            Some("UNSUB") => {
                if let Some(sid) = parts.next().and_then(|s| s.parse::<u64>().ok()) {
                    handle.subs.remove(&sid);
                }
            }
            Some("PING") => {
                let _ = handle.tx.try_send(OutFrame::Pong);
            }
            Some("PONG") | None => {}
            Some(other) => {
                let _ = handle
                    .tx
                    .try_send(OutFrame::Err(format!("unknown op {other}")));
            }
        }
    }
}

/// Read one CRLF-terminated command line. Returns bytes read (0 on EOF).
async fn read_command(
    reader: &mut BufReader<OwnedReadHalf>,
    line: &mut Vec<u8>,
) -> Result<usize, BusError> {
    use tokio::io::AsyncBufReadExt;
    let n = reader.read_until(b'\n', line).await?;
    if line.len() > 4_096 {
        return Err(BusError::Protocol("command line too long".to_string()));
    }
    Ok(n)
}
