use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Secret};
use kube::{
    api::{Patch, PatchParams, PostParams},
    core::ErrorResponse,
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::{resources::Source, Error, Result, CONTROLLER_NAME};

#[cfg(test)]
pub(crate) mod memory;

/// An object kind the controller reads or writes.
pub trait Object:
    Resource<DynamicType = ()>
    + Clone
    + Debug
    + Default
    + PartialEq
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Handle for objects of this kind, namespaced when the kind is.
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

macro_rules! namespaced {
    ($($kind:ty),*) => {$(
        impl Object for $kind {
            fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
                match namespace {
                    Some(ns) => Api::namespaced(client, ns),
                    None => Api::default_namespaced(client),
                }
            }
        }
    )*};
}

macro_rules! cluster_scoped {
    ($($kind:ty),*) => {$(
        impl Object for $kind {
            fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
                Api::all(client)
            }
        }
    )*};
}

namespaced!(Source, Secret, PersistentVolumeClaim);
cluster_scoped!(PersistentVolume);

/// Human readable identity of an object, used in errors and logs
pub fn describe<K: Object>(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{}/{ns}/{name}", K::kind(&())),
        None => format!("{}/{name}", K::kind(&())),
    }
}

/// The typed object store the reconciler converges against.
///
/// Writes are conditional: `replace` only succeeds when the object still
/// carries the resource version it was read with, otherwise it fails with
/// [`Error::SyncConflict`].
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Fetch an object, `None` when it does not exist
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>>;

    /// Create an object that is expected not to exist yet
    async fn create<K: Object>(&self, object: &K) -> Result<K>;

    /// Overwrite an existing object at the version it was read with
    async fn replace<K: Object>(&self, object: &K) -> Result<K>;

    /// Merge `status` into the status sub-resource of an object
    async fn patch_status<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<()>;
}

/// [`Store`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(CONTROLLER_NAME.into()),

        ..Default::default()
    }
}

/// Turn write conflicts into [`Error::SyncConflict`] so they can be retried
fn write_error(error: kube::Error, what: String) -> Error {
    match error {
        kube::Error::Api(ErrorResponse { code: 409, .. }) => Error::SyncConflict(what),
        e => Error::KubeError(e),
    }
}

#[async_trait]
impl Store for KubeStore {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        let api = K::api(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create<K: Object>(&self, object: &K) -> Result<K> {
        let api = K::api(self.client.clone(), object.namespace().as_deref());
        api.create(&post_params(), object)
            .await
            .map_err(|e| write_error(e, describe::<K>(object.namespace().as_deref(), &object.name_any())))
    }

    async fn replace<K: Object>(&self, object: &K) -> Result<K> {
        let name = object.name_any();
        let api = K::api(self.client.clone(), object.namespace().as_deref());
        api.replace(&name, &post_params(), object)
            .await
            .map_err(|e| write_error(e, describe::<K>(object.namespace().as_deref(), &name)))
    }

    async fn patch_status<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<()> {
        let api = K::api(self.client.clone(), Some(namespace));
        let patch = Patch::Merge(serde_json::json!({ "status": status }));
        let params = PatchParams {
            field_manager: Some(CONTROLLER_NAME.into()),

            ..Default::default()
        };
        api.patch_status(name, &params, &patch)
            .await?;
        Ok(())
    }
}

/// What a [`create_or_update`] call did to the stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionTaken {
    Created,
    Updated,
    Unchanged,
}

impl AsRef<str> for ActionTaken {
    fn as_ref(&self) -> &str {
        match self {
            ActionTaken::Created => "created",
            ActionTaken::Updated => "updated",
            ActionTaken::Unchanged => "unchanged",
        }
    }
}

/// Read an object (or start from an empty one carrying only its identity),
/// run `mutate` on it and write it back when something changed.
///
/// `mutate` must be idempotent and only touch the fields it owns. Write
/// conflicts are retried from a fresh read up to `retries` times.
pub async fn create_or_update<K, S, F>(
    store: &S,
    namespace: Option<&str>,
    name: &str,
    retries: u32,
    mutate: F,
) -> Result<(ActionTaken, K)>
where
    K: Object,
    S: Store,
    F: Fn(&mut K) -> Result<()> + Send + Sync,
{
    let mut attempt = 0;
    loop {
        match try_create_or_update(store, namespace, name, &mutate).await {
            Err(Error::SyncConflict(what)) if attempt < retries => {
                attempt += 1;
                debug!("write conflict on {what}, retrying ({attempt}/{retries})");
            }
            result => return result,
        }
    }
}

async fn try_create_or_update<K, S, F>(
    store: &S,
    namespace: Option<&str>,
    name: &str,
    mutate: &F,
) -> Result<(ActionTaken, K)>
where
    K: Object,
    S: Store,
    F: Fn(&mut K) -> Result<()> + Send + Sync,
{
    match store.get::<K>(namespace, name).await? {
        None => {
            let mut object = K::default();
            object.meta_mut().name = Some(name.into());
            object.meta_mut().namespace = namespace.map(Into::into);
            mutate(&mut object)?;

            let created = store.create(&object).await?;
            Ok((ActionTaken::Created, created))
        }
        Some(current) => {
            let mut object = current.clone();
            mutate(&mut object)?;
            if object == current {
                return Ok((ActionTaken::Unchanged, current));
            }

            let updated = store.replace(&object).await?;
            Ok((ActionTaken::Updated, updated))
        }
    }
}
