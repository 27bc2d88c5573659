//! Kind-agnostic create-or-update and ownership-gated delete.
//!
//! Every child object of a `Contour` goes through [`ensure`] or
//! [`ensure_deleted`]. The only per-kind behaviour is the updater closure passed
//! to [`ensure`], which usually delegates to [`update_if_changed`] with the
//! matching function from [`crate::equality`].

use std::future::Future;

use kube::ResourceExt;
use tokio::time::Duration;
use tracing::{debug, info};

use crate::api::v1alpha1::contour::Contour;
use crate::store::{is_already_exists, is_not_found, object_key, Object, ObjectStore};
use crate::util::errors::{Error, Result, StdError};
use crate::util::labels::is_owned_by;

/// Delay before the next pass when a recreated object is still terminating.
pub const RECREATE_REQUEUE: Duration = Duration::from_secs(5);

/// Signature shared by the functions of [`crate::equality`].
pub type ChangedFn<K> = fn(&K, &K) -> Option<K>;

pub(crate) fn store_failure<K: Object>(
    verb: &'static str,
    namespace: Option<&str>,
    name: &str,
    source: kube::Error,
) -> StdError {
    StdError::Store {
        verb,
        kind: K::kind(&()).to_string(),
        key: object_key(namespace, name),
        source,
    }
}

pub(crate) fn store_error<K: Object>(
    verb: &'static str,
    namespace: Option<&str>,
    name: &str,
    source: kube::Error,
) -> Error {
    Error::StdError(store_failure::<K>(verb, namespace, name, source))
}

/// Creates `desired` when absent, otherwise hands the live object to `updater`.
pub async fn ensure<S, K, F, Fut>(store: &S, desired: K, updater: F) -> Result<()>
where
    S: ObjectStore,
    K: Object,
    F: FnOnce(K, K) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let namespace = desired.namespace();
    let name = desired.name_any();

    match store.get::<K>(namespace.as_deref(), &name).await {
        Ok(current) => updater(current, desired).await,
        Err(e) if is_not_found(&e) => {
            store
                .create(&desired)
                .await
                .map_err(|e| store_error::<K>("create", namespace.as_deref(), &name, e))?;
            info!("Created {} '{}'", K::kind(&()), object_key(namespace.as_deref(), &name));
            Ok(())
        }
        Err(e) => Err(store_error::<K>("get", namespace.as_deref(), &name, e)),
    }
}

/// The standard updater: owned objects whose managed fields drifted are replaced
/// by the merged object computed by `changed`.
pub async fn update_if_changed<S, K>(
    store: &S,
    contour: &Contour,
    current: K,
    desired: K,
    changed: ChangedFn<K>,
) -> Result<()>
where
    S: ObjectStore,
    K: Object,
{
    let namespace = current.namespace();
    let name = current.name_any();
    let key = object_key(namespace.as_deref(), &name);

    if !is_owned_by(&current, contour) {
        info!(
            "{} '{}' is not owned by Contour '{}', leaving it untouched",
            K::kind(&()),
            key,
            contour.name_any()
        );
        return Ok(());
    }

    match changed(&current, &desired) {
        Some(merged) => {
            store
                .update(&merged)
                .await
                .map_err(|e| store_error::<K>("update", namespace.as_deref(), &name, e))?;
            info!("Updated {} '{}'", K::kind(&()), key);
        }
        None => debug!("{} '{}' is up to date", K::kind(&()), key),
    }
    Ok(())
}

/// Deletes the object if it exists and carries the owner labels of `contour`.
pub async fn ensure_deleted<S, K>(store: &S, namespace: Option<&str>, name: &str, contour: &Contour) -> Result<()>
where
    S: ObjectStore,
    K: Object,
{
    let current = match store.get::<K>(namespace, name).await {
        Ok(current) => current,
        Err(e) if is_not_found(&e) => return Ok(()),
        Err(e) => return Err(store_error::<K>("get", namespace, name, e)),
    };

    if !is_owned_by(&current, contour) {
        info!(
            "{} '{}' is not owned by Contour '{}', not deleting it",
            K::kind(&()),
            object_key(namespace, name),
            contour.name_any()
        );
        return Ok(());
    }

    delete::<S, K>(store, namespace, name).await
}

/// Unconditional delete that treats a concurrent deletion as success.
pub(crate) async fn delete<S, K>(store: &S, namespace: Option<&str>, name: &str) -> Result<()>
where
    S: ObjectStore,
    K: Object,
{
    match store.delete::<K>(namespace, name).await {
        Ok(()) => {
            info!("Deleted {} '{}'", K::kind(&()), object_key(namespace, name));
            Ok(())
        }
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(store_error::<K>("delete", namespace, name, e)),
    }
}

/// Replaces an owned object whose immutable fields diverged: delete, then create.
///
/// When the store still reports the old object the pass ends with a retryable
/// error and the next pass creates it.
pub async fn recreate<S, K>(store: &S, contour: &Contour, current: &K, desired: &K) -> Result<()>
where
    S: ObjectStore,
    K: Object,
{
    let namespace = current.namespace();
    let name = current.name_any();

    if !is_owned_by(current, contour) {
        info!(
            "{} '{}' needs recreating but is not owned by Contour '{}'",
            K::kind(&()),
            object_key(namespace.as_deref(), &name),
            contour.name_any()
        );
        return Ok(());
    }

    info!(
        "Immutable fields of {} '{}' changed, recreating it",
        K::kind(&()),
        object_key(namespace.as_deref(), &name)
    );
    delete::<S, K>(store, namespace.as_deref(), &name).await?;
    create_or_requeue(store, desired).await
}

pub(crate) async fn create_or_requeue<S, K>(store: &S, desired: &K) -> Result<()>
where
    S: ObjectStore,
    K: Object,
{
    let namespace = desired.namespace();
    let name = desired.name_any();
    match store.create(desired).await {
        Ok(_) => {
            info!("Created {} '{}'", K::kind(&()), object_key(namespace.as_deref(), &name));
            Ok(())
        }
        Err(e) if is_already_exists(&e) => Err(Error::requeue(
            store_failure::<K>("create", namespace.as_deref(), &name, e),
            RECREATE_REQUEUE,
        )),
        Err(e) => Err(store_error::<K>("create", namespace.as_deref(), &name, e)),
    }
}
