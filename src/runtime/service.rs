//! Service lifecycle contract.
//!
//! Every long-running component (plug-in manager, rule engine, sink router,
//! metrics updater) implements this. The runtime calls `init` then `start`
//! in dependency order and `stop` in reverse; a failing `init`/`start` is
//! fatal and rolls back what already started.

use async_trait::async_trait;

#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &'static str;

    /// Prepare resources (load files, build state). No background work yet.
    async fn init(&self) -> anyhow::Result<()>;

    /// Begin consuming: subscriptions, workers, tickers.
    async fn start(&self) -> anyhow::Result<()>;

    /// Release subscriptions and drain workers. Must respect the runtime's
    /// shutdown budget.
    async fn stop(&self) -> anyhow::Result<()>;
}
