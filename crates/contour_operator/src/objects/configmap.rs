//! The `contour.yaml` configuration file mounted into the Contour pods.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::{child_meta, CONTOUR_APP};
use crate::api::v1alpha1::contour::Contour;
use crate::controllers::ensure::{ensure, ensure_deleted, update_if_changed};
use crate::equality::configmap_changed;
use crate::store::ObjectStore;
use crate::util::errors::{Result, StdError};
use crate::util::labels::component_labels;

pub const CONFIG_FILE: &str = "contour.yaml";

pub fn configmap_name(contour: &Contour) -> String {
    contour.child_name("contour-config")
}

fn default_settings(contour: &Contour) -> Value {
    json!({
        "accesslog-format": "envoy",
        "disablePermitInsecure": false,
        "enableExternalNameService": contour.spec.enable_external_name_service,
        "tls": {
            "fallback-certificate": {},
            "envoy-client-certificate": {},
        },
    })
}

/// Recursively merges `overlay` into `base`; overlay values win except where
/// both sides are objects.
fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// The operator defaults with the runtime settings of `contour` applied on top, as YAML.
pub fn render_config(contour: &Contour) -> Result<String> {
    let mut settings = default_settings(contour);
    if let Some(overrides) = contour.spec.runtime_settings.as_ref() {
        deep_merge(&mut settings, overrides);
    }
    Ok(serde_yaml::to_string(&settings).map_err(StdError::YamlSerializationError)?)
}

pub fn desired_configmap(contour: &Contour) -> Result<ConfigMap> {
    Ok(ConfigMap {
        metadata: child_meta(
            contour,
            configmap_name(contour),
            true,
            component_labels(contour, CONTOUR_APP, "config"),
        ),
        data: Some(BTreeMap::from([(CONFIG_FILE.to_string(), render_config(contour)?)])),
        ..Default::default()
    })
}

/// Hex SHA-256 over the key/value pairs of the ConfigMap data.
pub fn config_hash(configmap: &ConfigMap) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in configmap.data.iter().flatten() {
        hasher.update(key.as_bytes());
        hasher.update([0]);
        hasher.update(value.as_bytes());
        hasher.update([0]);
    }
    hex::encode(hasher.finalize())
}

pub async fn ensure_configmap<S: ObjectStore>(store: &S, contour: &Contour, desired: ConfigMap) -> Result<()> {
    ensure(store, desired, |current, desired| {
        update_if_changed(store, contour, current, desired, configmap_changed)
    })
    .await
}

pub async fn ensure_configmap_deleted<S: ObjectStore>(store: &S, contour: &Contour) -> Result<()> {
    ensure_deleted::<S, ConfigMap>(store, contour.namespace().as_deref(), &configmap_name(contour), contour).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1alpha1::contour::ContourSpec;
    use assert_json_diff::assert_json_include;
    use crate::objects::test_support::{contour, contour_with};

    fn parsed(contour: &Contour) -> Value {
        serde_yaml::from_str(&render_config(contour).unwrap()).unwrap()
    }

    #[test]
    fn defaults_render_without_runtime_settings() {
        let config = parsed(&contour("demo", "ns1"));
        assert_eq!(config["accesslog-format"], "envoy");
        assert_eq!(config["enableExternalNameService"], false);
    }

    #[test]
    fn runtime_settings_win_and_merge_deeply() {
        let c = contour_with(
            "demo",
            "ns1",
            ContourSpec {
                enable_external_name_service: true,
                runtime_settings: Some(json!({
                    "accesslog-format": "json",
                    "tls": {"minimum-protocol-version": "1.3"},
                })),
                ..Default::default()
            },
        );

        assert_json_include!(
            actual: parsed(&c),
            expected: json!({
                "accesslog-format": "json",
                "enableExternalNameService": true,
                "tls": {
                    "minimum-protocol-version": "1.3",
                    "fallback-certificate": {},
                },
            })
        );
    }

    #[test]
    fn hash_tracks_the_rendered_config() {
        let a = desired_configmap(&contour("demo", "ns1")).unwrap();
        let b = desired_configmap(&contour_with(
            "demo",
            "ns1",
            ContourSpec {
                runtime_settings: Some(json!({"disablePermitInsecure": true})),
                ..Default::default()
            },
        ))
        .unwrap();

        assert_eq!(config_hash(&a), config_hash(&a.clone()));
        assert_ne!(config_hash(&a), config_hash(&b));
        assert_eq!(config_hash(&a).len(), 64);
    }
}
