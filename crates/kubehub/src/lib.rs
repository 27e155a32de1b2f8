//! Refuge kubehub: the watch/cache side of a controller.
//!
//! An [`Informer`] lists and watches one resource kind, mirrors it in memory, reports
//! the key of every change to a [`ChangeHandler`] and answers fresh lookups by key.
//! [`KubeInformer`] talks to a cluster; [`MemoryInformer`] is driven by hand in tests.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use refuge_core::ChangeHandler;
use tokio_util::sync::CancellationToken;

pub mod discovery;
pub mod informer;
pub mod memory;

pub use discovery::{
    discover_watchable, find_api_resource, kind_label, parse_gvk_key, run_discovery, DiscoveredResource,
};
pub use informer::KubeInformer;
pub use memory::MemoryInformer;

/// Cache mirror of one resource kind.
#[async_trait]
pub trait Informer: Send + Sync + 'static {
    /// Current object stored under `key`, as an owned copy; `None` when it no longer exists.
    fn get_by_key(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// List, then watch until `stop` fires. Every add/update/delete is reported to
    /// `handler`; every `resync` period all mirrored keys are reported again.
    async fn run(
        &self,
        handler: Arc<dyn ChangeHandler>,
        resync: Option<Duration>,
        stop: CancellationToken,
    ) -> Result<()>;

    /// Resolves once the initial list has been mirrored.
    async fn wait_synced(&self);

    fn has_synced(&self) -> bool;
}

/// Resync ticker that never fires when resync is disabled.
pub(crate) async fn resync_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

pub(crate) fn resync_ticker(resync: Option<Duration>) -> Option<tokio::time::Interval> {
    resync.filter(|d| !d.is_zero()).map(|d| {
        let mut t = tokio::time::interval_at(tokio::time::Instant::now() + d, d);
        t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        t
    })
}
