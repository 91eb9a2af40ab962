//! Config file watcher.
//!
//! Polls a fingerprint of the config file (mtime, size, content digest)
//! and hot-applies the whitelisted subset when the file settles on new
//! content. A change only counts once the same fingerprint is observed on
//! two consecutive polls, so editors that write in stages never trigger a
//! half-written reload; a rewrite with identical bytes (touch, atomic-save
//! round trip) is ignored outright because the digest is unchanged. An
//! invalid file is rejected and the running config stays.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ConfigChange;

/// Events emitted toward the runtime.
#[derive(Debug)]
pub enum ConfigEvent {
    /// New content accepted; lists the whitelisted changes now in effect
    /// (may be empty when nothing whitelisted differs).
    Applied(Vec<ConfigChange>),
    /// New content failed to load or validate; old config kept.
    Rejected(String),
}

/// Identity of one on-disk config revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    mtime_ms: i64,
    len: u64,
    digest: u64,
}

/// Watches one config file and drives `config::reload`.
pub struct ConfigWatcher {
    path: PathBuf,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl ConfigWatcher {
    pub fn new(path: PathBuf, cancel: CancellationToken) -> Self {
        Self {
            path,
            poll_interval: Duration::from_secs(2),
            cancel,
        }
    }

    /// Run the watch loop until cancelled or the event channel closes.
    pub async fn run(self, tx: mpsc::Sender<ConfigEvent>) {
        info!(path = %self.path.display(), "Config watcher started");

        // The revision the running config was loaded from.
        let mut applied = fingerprint(&self.path);
        // A newer revision seen once, awaiting confirmation next poll.
        let mut settling: Option<Fingerprint> = None;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(self.poll_interval) => {}
            }

            let Some(current) = fingerprint(&self.path) else {
                if applied.is_some() {
                    warn!(
                        path = %self.path.display(),
                        "Config file unreadable, keeping running config"
                    );
                }
                applied = None;
                settling = None;
                continue;
            };

            // Same digest as the running config: a touch or an identical
            // rewrite, nothing to do.
            if applied.is_some_and(|a| a.digest == current.digest) {
                applied = Some(current);
                settling = None;
                continue;
            }

            // First sighting of new content: hold one poll so a staged
            // write can finish.
            if settling != Some(current) {
                debug!(path = %self.path.display(), "Config change observed, waiting to settle");
                settling = Some(current);
                continue;
            }
            settling = None;

            let event = match super::reload(&self.path) {
                Ok(changes) => {
                    applied = Some(current);
                    ConfigEvent::Applied(changes)
                }
                Err(e) => {
                    error!(error = %e, "Config reload rejected, keeping running config");
                    // Remember the bad revision so it is not retried every
                    // poll; the next edit produces a new digest.
                    applied = Some(current);
                    ConfigEvent::Rejected(e.to_string())
                }
            };
            if tx.send(event).await.is_err() {
                debug!("Config watcher channel closed, stopping");
                return;
            }
        }
    }
}

/// Read the file's revision identity. `None` when unreadable.
fn fingerprint(path: &PathBuf) -> Option<Fingerprint> {
    let meta = std::fs::metadata(path).ok()?;
    let mtime_ms = meta
        .modified()
        .ok()?
        .duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))?;
    let bytes = std::fs::read(path).ok()?;
    Some(Fingerprint {
        mtime_ms,
        len: bytes.len() as u64,
        digest: fnv1a(&bytes),
    })
}

/// FNV-1a over the file content. Collision risk is irrelevant here: a
/// false "unchanged" needs a same-length same-hash rewrite of a config
/// file the operator just edited.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
