//! Object normalization: drop server-populated fields, then render canonical YAML.

use serde_json::Value as Json;

/// Metadata fields the apiserver rewrites on its own; keeping them would turn every
/// resync into a diff.
pub const VOLATILE_METADATA: [&str; 4] = ["selfLink", "uid", "resourceVersion", "generation"];

/// Remove `status` and the [`VOLATILE_METADATA`] fields in place. Everything else is untouched.
pub fn strip_volatile(obj: &mut Json) {
    let Some(root) = obj.as_object_mut() else { return };
    root.remove("status");
    if let Some(meta) = root.get_mut("metadata").and_then(Json::as_object_mut) {
        for field in VOLATILE_METADATA {
            meta.remove(field);
        }
    }
}

/// Serialize to the canonical text form: YAML with map keys in sorted order.
pub fn to_yaml(obj: &Json) -> Result<String, serde_yaml::Error> { serde_yaml::to_string(&sorted(obj)) }

// serde_json may be built with `preserve_order`, so ordering is enforced here.
fn sorted(v: &Json) -> Json {
    match v {
        Json::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            Json::Object(keys.into_iter().map(|k| (k.clone(), sorted(&map[k]))).collect())
        }
        Json::Array(items) => Json::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

/// Strip `obj` and render it. Takes the object by value: callers hand over their own copy,
/// so the mirror's object is never touched.
pub fn normalize(mut obj: Json) -> Result<String, serde_yaml::Error> {
    strip_volatile(&mut obj);
    to_yaml(&obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment() -> Json {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "web",
                "namespace": "prod",
                "labels": { "app": "web" },
                "selfLink": "/apis/apps/v1/namespaces/prod/deployments/web",
                "uid": "0b3b6a46-2bb5-4a0e-9c39-7c3e3d3b2e10",
                "resourceVersion": "48213",
                "generation": 7,
                "managedFields": [ { "manager": "kubectl" } ]
            },
            "spec": { "replicas": 3 },
            "status": { "readyReplicas": 3 }
        })
    }

    #[test]
    fn strips_only_volatile_fields() {
        let mut v = deployment();
        strip_volatile(&mut v);
        let meta = v["metadata"].as_object().unwrap();
        for f in VOLATILE_METADATA {
            assert!(!meta.contains_key(f), "{} survived", f);
        }
        assert!(!v.as_object().unwrap().contains_key("status"));
        assert_eq!(meta["labels"], json!({ "app": "web" }));
        assert_eq!(meta["managedFields"], json!([ { "manager": "kubectl" } ]));
        assert_eq!(v["spec"], json!({ "replicas": 3 }));
        assert_eq!(v["kind"], "Deployment");
    }

    #[test]
    fn normalize_renders_without_volatile_fields() {
        let text = normalize(deployment()).unwrap();
        assert!(!text.contains("resourceVersion"));
        assert!(!text.contains("readyReplicas"));
        assert!(text.contains("replicas: 3"));
    }

    #[test]
    fn objects_without_metadata_or_non_objects_pass_through() {
        let mut v = json!({ "spec": {}, "status": { "phase": "x" } });
        strip_volatile(&mut v);
        assert_eq!(v, json!({ "spec": {} }));
        let mut s = json!("scalar");
        strip_volatile(&mut s);
        assert_eq!(s, json!("scalar"));
    }

    #[test]
    fn output_is_stable_across_key_order() {
        let a = json!({ "spec": { "b": 1, "a": 2 }, "metadata": { "name": "x" } });
        let b = json!({ "metadata": { "name": "x" }, "spec": { "a": 2, "b": 1 } });
        assert_eq!(normalize(a).unwrap(), normalize(b).unwrap());
    }

    #[test]
    fn namespace_scenario_renders_name_and_spec_only() {
        let ns = json!({
            "metadata": { "name": "default", "resourceVersion": "123", "uid": "abc" },
            "spec": {},
            "status": { "phase": "Active" }
        });
        let text = normalize(ns).unwrap();
        let back: Json = serde_yaml::from_str(&text).unwrap();
        assert_eq!(back, json!({ "metadata": { "name": "default" }, "spec": {} }));
    }
}
