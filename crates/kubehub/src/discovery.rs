//! GVK keys and API discovery.

use anyhow::{anyhow, Context, Result};
use kube::{
    core::{ApiResource, GroupVersionKind},
    discovery::{verbs, Discovery, Scope},
    Client,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Run API discovery once; every GVK lookup and the watchable listing read from the result.
pub async fn run_discovery(client: Client) -> Result<Discovery> {
    Discovery::new(client).run().await.context("running api discovery")
}

/// Resolve a GVK against discovered APIs, returning its resource and whether it is namespaced.
pub fn find_api_resource(discovery: &Discovery, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar, namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Every served resource (incl. CRDs) that can be listed and watched.
pub fn discover_watchable(discovery: &Discovery) -> Vec<DiscoveredResource> {
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if !(caps.supports_operation(verbs::LIST) && caps.supports_operation(verbs::WATCH)) {
                debug!(kind = %ar.kind, "skipping resource without list/watch");
                continue;
            }
            out.push(DiscoveredResource {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                namespaced: matches!(caps.scope, Scope::Namespaced),
            });
        }
    }
    // Stable-ish order
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    out
}

/// Name a kind uniquely across API groups: `Kind` for the core group, `Kind.group` otherwise.
pub fn kind_label(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        gvk.kind.clone()
    } else {
        format!("{}.{}", gvk.kind, gvk.group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_core_and_grouped_keys() {
        let core = parse_gvk_key("v1/Namespace").unwrap();
        assert_eq!((core.group.as_str(), core.version.as_str(), core.kind.as_str()), ("", "v1", "Namespace"));
        let apps = parse_gvk_key("apps/v1/Deployment").unwrap();
        assert_eq!((apps.group.as_str(), apps.version.as_str(), apps.kind.as_str()), ("apps", "v1", "Deployment"));
    }

    #[test]
    fn rejects_malformed_keys() {
        for bad in ["Namespace", "a/b/c/d", "v1/", "/Pod", ""] {
            let e = parse_gvk_key(bad).unwrap_err().to_string();
            assert!(e.contains("invalid gvk key"), "{} -> {}", bad, e);
        }
    }

    #[test]
    fn gvk_key_round_trips_through_parse() {
        let r = DiscoveredResource { group: "apps".into(), version: "v1".into(), kind: "Deployment".into(), namespaced: true };
        assert_eq!(r.gvk_key(), "apps/v1/Deployment");
        let core = DiscoveredResource { group: String::new(), version: "v1".into(), kind: "Node".into(), namespaced: false };
        assert_eq!(core.gvk_key(), "v1/Node");
        assert!(parse_gvk_key(&core.gvk_key()).is_ok());
    }

    #[test]
    fn kind_labels_keep_groups_apart() {
        let core = parse_gvk_key("v1/Event").unwrap();
        let events = parse_gvk_key("events.k8s.io/v1/Event").unwrap();
        assert_eq!(kind_label(&core), "Event");
        assert_eq!(kind_label(&events), "Event.events.k8s.io");
        assert_eq!(kind_label(&parse_gvk_key("v1/Namespace").unwrap()), "Namespace");
    }
}
