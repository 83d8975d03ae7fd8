//! Building blocks for dependents that manage Kubernetes objects
//!
//! These helpers make a dependent's reconcile idempotent at the API server:
//! the desired object is only applied when the live object disagrees with it
//! on a field the dependent sets.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::Error;

/// Field manager used for every server-side apply
pub const FIELD_MANAGER: &str = "trellis-controller";

/// Controller owner reference pointing at `primary`
///
/// Objects carrying it are garbage collected by the API server once the
/// primary is gone, so dependents that rely on it need no deleter.
pub fn owner_reference_for<P>(primary: &P) -> Result<OwnerReference, Error>
where
    P: Resource<DynamicType = ()>,
{
    primary.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context(
            "owner_reference",
            format!(
                "{} '{}' has no uid yet",
                P::kind(&()),
                primary.name_any()
            ),
        )
    })
}

/// Whether every field set in `desired` has the same value in `actual`
///
/// Objects are compared key by key, so fields defaulted or added by the API
/// server do not count as drift. Arrays must match element by element.
pub fn desired_matches(desired: &Value, actual: &Value) -> bool {
    match (desired, actual) {
        (Value::Object(want), Value::Object(have)) => want.iter().all(|(key, value)| {
            match have.get(key) {
                Some(found) => desired_matches(value, found),
                None => value.is_null(),
            }
        }),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len()
                && want.iter().zip(have).all(|(w, h)| desired_matches(w, h))
        }
        (want, have) => want == have,
    }
}

/// Server-side apply `desired` unless the live object already matches it
///
/// Returns true when a write was issued.
pub async fn apply_if_changed<K>(api: &Api<K>, desired: &K) -> Result<bool, Error>
where
    K: Resource + Clone + Serialize + DeserializeOwned + std::fmt::Debug,
{
    let name = desired.name_any();
    let desired_json =
        serde_json::to_value(desired).map_err(|e| Error::serialization(e.to_string()))?;

    if let Some(live) = api
        .get_opt(&name)
        .await
        .map_err(|e| Error::from_kube(name.clone(), e))?
    {
        let live_json =
            serde_json::to_value(&live).map_err(|e| Error::serialization(e.to_string()))?;
        if desired_matches(&desired_json, &live_json) {
            debug!(object = %name, "object already matches desired state");
            return Ok(false);
        }
    }

    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&desired_json),
    )
    .await
    .map_err(|e| Error::from_kube(name.clone(), e))?;
    info!(object = %name, "applied desired state");
    Ok(true)
}

/// Delete the named object, treating an absent object as success
///
/// Returns true when a delete was issued.
pub async fn delete_if_exists<K>(api: &Api<K>, name: &str) -> Result<bool, Error>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => {
            info!(object = %name, "deleted object");
            Ok(true)
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
        Err(e) => Err(Error::from_kube(name, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde_json::json;

    /// Story: fields the API server adds are not drift
    ///
    /// A live ConfigMap carries a resourceVersion, a uid and managed fields
    /// that the dependent never set. Re-applying it would be a pointless write.
    #[test]
    fn story_server_populated_fields_are_ignored() {
        let desired = json!({
            "metadata": {"name": "web", "labels": {"app": "web"}},
            "data": {"key": "value"}
        });
        let live = json!({
            "metadata": {
                "name": "web",
                "labels": {"app": "web", "extra": "kept"},
                "resourceVersion": "42",
                "uid": "abc"
            },
            "data": {"key": "value"}
        });
        assert!(desired_matches(&desired, &live));
    }

    #[test]
    fn test_changed_value_is_drift() {
        let desired = json!({"data": {"key": "new"}});
        let live = json!({"data": {"key": "old"}});
        assert!(!desired_matches(&desired, &live));
    }

    #[test]
    fn test_missing_field_is_drift() {
        let desired = json!({"data": {"key": "value"}});
        let live = json!({"metadata": {"name": "web"}});
        assert!(!desired_matches(&desired, &live));
    }

    #[test]
    fn test_arrays_compare_elementwise() {
        let desired = json!({"refs": [{"name": "a"}]});
        assert!(desired_matches(&desired, &json!({"refs": [{"name": "a", "uid": "1"}]})));
        assert!(!desired_matches(&desired, &json!({"refs": [{"name": "a"}, {"name": "b"}]})));
    }

    #[test]
    fn test_owner_reference_requires_uid() {
        let mut primary = ConfigMap {
            metadata: ObjectMeta {
                name: Some("owner".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(owner_reference_for(&primary).is_err());

        primary.metadata.uid = Some("uid-1".to_string());
        let owner = owner_reference_for(&primary).unwrap();
        assert_eq!(owner.name, "owner");
        assert_eq!(owner.kind, "ConfigMap");
        assert_eq!(owner.controller, Some(true));
    }
}
