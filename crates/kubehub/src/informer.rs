//! kube-rs backed informer: watcher + reflector over `DynamicObject`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject},
    discovery::Discovery,
    runtime::{
        reflector::{self, store::Writer, ObjectRef, Store},
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use metrics::counter;
use refuge_core::{object_key, split_key, ChangeHandler};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{discovery, resync_tick, resync_ticker, Informer};

pub struct KubeInformer {
    gvk_key: String,
    api: Api<DynamicObject>,
    ar: ApiResource,
    reader: Store<DynamicObject>,
    writer: Mutex<Option<Writer<DynamicObject>>>,
    synced: watch::Sender<bool>,
}

fn key_for(obj: &DynamicObject) -> Option<String> {
    let name = obj.metadata.name.as_deref().filter(|n| !n.is_empty())?;
    Some(object_key(obj.metadata.namespace.as_deref(), name))
}

/// Keys to report after a relist: everything listed, plus whatever was mirrored before
/// but is missing now (deleted while the watch was down). Sorted for stable reporting.
fn relist_changes(known: &HashSet<String>, fresh: &HashSet<String>) -> Vec<String> {
    let mut keys: Vec<String> = known.union(fresh).cloned().collect();
    keys.sort();
    keys
}

impl KubeInformer {
    /// Resolve `gvk_key` against `discovered` and mirror it, optionally restricted to one namespace.
    pub fn new(client: Client, discovered: &Discovery, gvk_key: &str, namespace: Option<&str>) -> Result<Self> {
        let gvk = discovery::parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = discovery::find_api_resource(discovered, &gvk)?;
        let api: Api<DynamicObject> = match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
            _ => Api::all_with(client, &ar),
        };
        Ok(Self::from_api(gvk_key, api, ar))
    }

    pub fn from_api(gvk_key: &str, api: Api<DynamicObject>, ar: ApiResource) -> Self {
        let writer = Writer::new(ar.clone());
        let reader = writer.as_reader();
        let (synced, _) = watch::channel(false);
        Self { gvk_key: gvk_key.to_string(), api, ar, reader, writer: Mutex::new(Some(writer)), synced }
    }

    fn mirrored_keys(&self) -> Vec<String> {
        self.reader.state().iter().filter_map(|o| key_for(o)).collect()
    }
}

#[async_trait]
impl Informer for KubeInformer {
    fn get_by_key(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let (ns, name) = split_key(key)?;
        let mut oref = ObjectRef::<DynamicObject>::new_with(name, self.ar.clone());
        if let Some(ns) = ns {
            oref = oref.within(ns);
        }
        match self.reader.get(&oref) {
            Some(obj) => {
                let raw = serde_json::to_value(obj.as_ref()).with_context(|| format!("serializing {}", key))?;
                Ok(Some(raw))
            }
            None => Ok(None),
        }
    }

    async fn run(
        &self,
        handler: Arc<dyn ChangeHandler>,
        resync: Option<Duration>,
        stop: CancellationToken,
    ) -> Result<()> {
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| anyhow!("informer for {} is already running", self.gvk_key))?;

        let stream = reflector::reflector(writer, watcher::watcher(self.api.clone(), watcher::Config::default()))
            .default_backoff();
        futures::pin_mut!(stream);
        let mut ticker = resync_ticker(resync);
        let mut known: HashSet<String> = HashSet::new();
        info!(gvk = %self.gvk_key, "watcher started");

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    debug!(gvk = %self.gvk_key, "stop requested; leaving watch loop");
                    break;
                }
                _ = resync_tick(&mut ticker) => {
                    let keys = self.mirrored_keys();
                    debug!(gvk = %self.gvk_key, count = keys.len(), "resync");
                    for key in keys { handler.on_change(key); }
                }
                next = stream.try_next() => match next {
                    Ok(Some(Event::Applied(o))) => {
                        if let Some(key) = key_for(&o) {
                            known.insert(key.clone());
                            handler.on_change(key);
                        }
                    }
                    Ok(Some(Event::Deleted(o))) => {
                        if let Some(key) = key_for(&o) {
                            known.remove(&key);
                            handler.on_change(key);
                        }
                    }
                    Ok(Some(Event::Restarted(list))) => {
                        debug!(gvk = %self.gvk_key, count = list.len(), "watch restart");
                        let fresh: HashSet<String> = list.iter().filter_map(key_for).collect();
                        for key in relist_changes(&known, &fresh) {
                            handler.on_change(key);
                        }
                        known = fresh;
                        if !self.has_synced() {
                            info!(gvk = %self.gvk_key, count = known.len(), "initial list mirrored");
                        }
                        self.synced.send_replace(true);
                    }
                    Ok(None) => {
                        warn!(gvk = %self.gvk_key, "watcher stream ended");
                        break;
                    }
                    Err(e) => {
                        counter!("kubehub_watch_errors_total", 1, "gvk" => self.gvk_key.clone());
                        warn!(gvk = %self.gvk_key, error = %e, "watch error; backing off");
                    }
                }
            }
        }
        Ok(())
    }

    async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        let _ = rx.wait_for(|synced| *synced).await;
    }

    fn has_synced(&self) -> bool { *self.synced.borrow() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;

    fn dynobj(ns: Option<&str>, name: Option<&str>) -> DynamicObject {
        let ar = ApiResource::erase::<k8s_openapi::api::core::v1::ConfigMap>(&());
        let mut o = DynamicObject::new("x", &ar);
        o.metadata = ObjectMeta {
            name: name.map(str::to_string),
            namespace: ns.map(str::to_string),
            ..Default::default()
        };
        o
    }

    #[test]
    fn keys_follow_namespace_scope() {
        assert_eq!(key_for(&dynobj(Some("prod"), Some("cfg"))).as_deref(), Some("prod/cfg"));
        assert_eq!(key_for(&dynobj(None, Some("default"))).as_deref(), Some("default"));
        assert_eq!(key_for(&dynobj(None, None)), None);
    }

    fn set(keys: &[&str]) -> HashSet<String> { keys.iter().map(|k| k.to_string()).collect() }

    #[test]
    fn relist_reports_vanished_surviving_and_new_keys() {
        let known = set(&["prod/gone", "prod/kept"]);
        let fresh = set(&["prod/kept", "prod/new"]);
        assert_eq!(relist_changes(&known, &fresh), vec!["prod/gone", "prod/kept", "prod/new"]);
    }

    #[test]
    fn first_relist_reports_the_listing() {
        assert_eq!(relist_changes(&HashSet::new(), &set(&["b", "a"])), vec!["a", "b"]);
        assert!(relist_changes(&HashSet::new(), &HashSet::new()).is_empty());
    }

    #[test]
    fn relist_of_empty_listing_reports_every_known_key() {
        assert_eq!(relist_changes(&set(&["default", "kube-system"]), &HashSet::new()), vec!["default", "kube-system"]);
    }
}
