//! In-memory informer for tests and dry runs: objects are applied and deleted by hand.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use refuge_core::{key_of, ChangeHandler};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{resync_tick, resync_ticker, Informer};

#[derive(Default)]
struct Inner {
    objects: HashMap<String, serde_json::Value>,
    failures: HashMap<String, u32>,
    lookups: HashMap<String, u32>,
    handler: Option<Arc<dyn ChangeHandler>>,
}

/// Informer whose mirror is whatever the test put in it.
///
/// Changes made before [`Informer::run`] are reported as the initial list once it starts.
pub struct MemoryInformer {
    inner: Mutex<Inner>,
    synced: watch::Sender<bool>,
    sync_on_run: bool,
}

impl Default for MemoryInformer {
    fn default() -> Self { Self::new() }
}

impl MemoryInformer {
    pub fn new() -> Self { Self::with_sync(true) }

    /// An informer whose initial sync never completes.
    pub fn never_syncing() -> Self { Self::with_sync(false) }

    fn with_sync(sync_on_run: bool) -> Self {
        let (synced, _) = watch::channel(false);
        Self { inner: Mutex::new(Inner::default()), synced, sync_on_run }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Store (create or replace) an object and report its key.
    pub fn apply(&self, obj: serde_json::Value) -> Result<String> {
        let key = key_of(&obj)?;
        let handler = {
            let mut inner = self.lock();
            inner.objects.insert(key.clone(), obj);
            inner.handler.clone()
        };
        if let Some(h) = handler {
            h.on_change(key.clone());
        }
        Ok(key)
    }

    /// Remove an object and report its key.
    pub fn delete(&self, key: &str) {
        let handler = {
            let mut inner = self.lock();
            inner.objects.remove(key);
            inner.handler.clone()
        };
        if let Some(h) = handler {
            h.on_change(key.to_string());
        }
    }

    /// Remove an object without reporting it, like a delete notification lost in transit.
    pub fn delete_silently(&self, key: &str) { self.lock().objects.remove(key); }

    /// Make the next `times` lookups of `key` fail.
    pub fn fail_lookups(&self, key: &str, times: u32) { self.lock().failures.insert(key.to_string(), times); }

    /// How many times `key` was looked up.
    pub fn lookups(&self, key: &str) -> u32 { self.lock().lookups.get(key).copied().unwrap_or(0) }

    pub fn mark_synced(&self) { self.synced.send_replace(true); }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().objects.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl Informer for MemoryInformer {
    fn get_by_key(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let mut inner = self.lock();
        *inner.lookups.entry(key.to_string()).or_insert(0) += 1;
        if let Some(left) = inner.failures.get_mut(key) {
            if *left > 0 {
                *left -= 1;
                return Err(anyhow!("injected lookup failure for {}", key));
            }
        }
        Ok(inner.objects.get(key).cloned())
    }

    async fn run(
        &self,
        handler: Arc<dyn ChangeHandler>,
        resync: Option<Duration>,
        stop: CancellationToken,
    ) -> Result<()> {
        self.lock().handler = Some(Arc::clone(&handler));
        for key in self.keys() {
            handler.on_change(key);
        }
        if self.sync_on_run {
            self.mark_synced();
        }

        let mut ticker = resync_ticker(resync);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = resync_tick(&mut ticker) => {
                    for key in self.keys() { handler.on_change(key); }
                }
            }
        }
        self.lock().handler = None;
        Ok(())
    }

    async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        let _ = rx.wait_for(|synced| *synced).await;
    }

    fn has_synced(&self) -> bool { *self.synced.borrow() }
}
