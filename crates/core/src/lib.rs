//! Refuge core types: change events, object keys and the change callback seam.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of object change carried by an [`Event`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Object was created or updated.
    Upsert,
    /// Object is gone from the cluster.
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Upsert => "upsert",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Normalized change notification for one object of one watched kind.
///
/// `obj` holds the canonical serialized object for upserts and is empty for deletes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub action: Action,
    pub key: String,
    pub kind: String,
    pub obj: String,
}

impl Event {
    pub fn upsert(key: impl Into<String>, kind: impl Into<String>, obj: String) -> Self {
        Self { action: Action::Upsert, key: key.into(), kind: kind.into(), obj }
    }

    pub fn delete(key: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { action: Action::Delete, key: key.into(), kind: kind.into(), obj: String::new() }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("object missing metadata.name")]
    MissingName,
    #[error("invalid object key: {0:?}")]
    Invalid(String),
}

/// Build the queue/cache key of an object: `namespace/name`, or `name` when cluster-scoped.
pub fn object_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

/// Derive the key of a raw object from its `metadata.namespace` and `metadata.name`.
pub fn key_of(raw: &serde_json::Value) -> Result<String, KeyError> {
    let meta = raw.get("metadata");
    let name = meta
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or(KeyError::MissingName)?;
    let ns = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str());
    Ok(object_key(ns, name))
}

/// Split a key back into `(namespace, name)`.
pub fn split_key(key: &str) -> Result<(Option<&str>, &str), KeyError> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok((None, name)),
        [ns, name] if !name.is_empty() => Ok((Some(ns), name)),
        _ => Err(KeyError::Invalid(key.to_string())),
    }
}

/// Receives the key of every object the watch layer saw added, updated or deleted.
pub trait ChangeHandler: Send + Sync {
    fn on_change(&self, key: String);
}

impl<F> ChangeHandler for F
where
    F: Fn(String) + Send + Sync,
{
    fn on_change(&self, key: String) { self(key) }
}

pub mod prelude {
    pub use super::{object_key, split_key, Action, ChangeHandler, Event, KeyError};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_for_namespaced_and_cluster_scoped() {
        assert_eq!(object_key(Some("kube-system"), "coredns"), "kube-system/coredns");
        assert_eq!(object_key(None, "default"), "default");
        assert_eq!(object_key(Some(""), "node-1"), "node-1");
    }

    #[test]
    fn key_of_reads_metadata() {
        let v = serde_json::json!({ "metadata": { "name": "web", "namespace": "prod" } });
        assert_eq!(key_of(&v).unwrap(), "prod/web");
        let v = serde_json::json!({ "metadata": { "name": "default" } });
        assert_eq!(key_of(&v).unwrap(), "default");
        let v = serde_json::json!({ "metadata": {} });
        assert_eq!(key_of(&v), Err(KeyError::MissingName));
    }

    #[test]
    fn split_key_accepts_one_or_two_segments() {
        assert_eq!(split_key("prod/web").unwrap(), (Some("prod"), "web"));
        assert_eq!(split_key("default").unwrap(), (None, "default"));
        assert!(split_key("a/b/c").is_err());
        assert!(split_key("").is_err());
        assert!(split_key("ns/").is_err());
    }

    #[test]
    fn delete_events_carry_no_object() {
        let ev = Event::delete("default", "Namespace");
        assert_eq!(ev.action, Action::Delete);
        assert!(ev.obj.is_empty());
        assert_eq!(serde_json::to_value(&ev).unwrap()["action"], "delete");
    }

    #[test]
    fn closures_are_change_handlers() {
        let seen = std::sync::Mutex::new(Vec::new());
        let h = |k: String| seen.lock().unwrap().push(k);
        h.on_change("a".into());
        h.on_change("b".into());
        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }
}
