//! An in-memory [`Store`] that behaves like the API server where the
//! reconciler can observe it: uids, resource versions, conflicting writes and
//! owner reference garbage collection.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

use async_trait::async_trait;
use kube::{core::ErrorResponse, ResourceExt};
use serde_json::Value;

use super::{describe, Object, Store};
use crate::{Error, Result};

type Key = (String, Option<String>, String);

#[derive(Default)]
pub(crate) struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, Value>,
    version: u64,
    writes: usize,
    status_writes: usize,
    conflicts: u32,
    failing_kinds: BTreeSet<String>,
    failing_status: bool,
}

fn key<K: Object>(namespace: Option<&str>, name: &str) -> Key {
    (
        K::kind(&()).to_string(),
        namespace.map(Into::into),
        name.into(),
    )
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message,
        reason: reason.into(),
        code,
    }))
}

fn decode<K: Object>(value: &Value) -> Result<K> {
    serde_json::from_value(value.clone()).map_err(Error::SerializationError)
}

fn encode<K: Object>(object: &K) -> Result<Value> {
    serde_json::to_value(object).map_err(Error::SerializationError)
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn check_write<K: Object>(&mut self, what: &str) -> Result<()> {
        if self.conflicts > 0 {
            self.conflicts -= 1;
            return Err(Error::SyncConflict(what.into()));
        }
        if self.failing_kinds.contains(&*K::kind(&())) {
            return Err(api_error(500, "InternalError", format!("writes to {what} fail")));
        }
        Ok(())
    }

    fn uid_of(value: &Value) -> Option<String> {
        value["metadata"]["uid"].as_str().map(Into::into)
    }

    fn owned_by(value: &Value, uid: &str) -> bool {
        value["metadata"]["ownerReferences"]
            .as_array()
            .map(|owners| owners.iter().any(|o| o["uid"] == uid))
            .unwrap_or(false)
    }
}

impl MemoryStore {
    /// Seed an object as if a user had created it, without counting a write
    pub(crate) fn insert<K: Object>(&self, mut object: K) -> K {
        let mut inner = self.inner.lock().unwrap();
        let version = inner.next_version();
        object.meta_mut().uid = Some(format!("uid-{version}"));
        object.meta_mut().resource_version = Some(version);
        let key = key::<K>(object.namespace().as_deref(), &object.name_any());
        inner.objects.insert(key, encode(&object).unwrap());
        object
    }

    /// Read an object outside of the reconciler
    pub(crate) fn fetch<K: Object>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .get(&key::<K>(namespace, name))
            .map(|v| decode(v).unwrap())
    }

    /// Change an object out of band, as an operator editing it would
    pub(crate) fn edit<K: Object>(&self, namespace: Option<&str>, name: &str, edit: impl FnOnce(&mut K)) {
        let mut inner = self.inner.lock().unwrap();
        let key = key::<K>(namespace, name);
        let mut object: K = decode(&inner.objects[&key]).unwrap();
        edit(&mut object);
        object.meta_mut().resource_version = Some(inner.next_version());
        inner.objects.insert(key, encode(&object).unwrap());
    }

    /// Delete an object and garbage collect everything it owns
    pub(crate) fn delete<K: Object>(&self, namespace: Option<&str>, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        let mut orphaned: Vec<String> = inner
            .objects
            .remove(&key::<K>(namespace, name))
            .as_ref()
            .and_then(Inner::uid_of)
            .into_iter()
            .collect();

        while let Some(uid) = orphaned.pop() {
            let owned: Vec<Key> = inner
                .objects
                .iter()
                .filter(|(_, v)| Inner::owned_by(v, &uid))
                .map(|(k, _)| k.clone())
                .collect();
            for key in owned {
                if let Some(uid) = inner.objects.remove(&key).as_ref().and_then(Inner::uid_of) {
                    orphaned.push(uid);
                }
            }
        }
    }

    /// Make the next `count` writes fail with a conflict
    pub(crate) fn inject_conflicts(&self, count: u32) {
        self.inner.lock().unwrap().conflicts = count;
    }

    /// Make every write to objects of kind `K` fail
    pub(crate) fn fail_writes<K: Object>(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failing_kinds.insert(K::kind(&()).to_string());
    }

    /// Make every status write fail
    pub(crate) fn fail_status_writes(&self) {
        self.inner.lock().unwrap().failing_status = true;
    }

    /// Number of successful creates and replaces
    pub(crate) fn writes(&self) -> usize {
        self.inner.lock().unwrap().writes
    }

    /// Number of successful status patches
    pub(crate) fn status_writes(&self) -> usize {
        self.inner.lock().unwrap().status_writes
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .get(&key::<K>(namespace, name))
            .map(decode::<K>)
            .transpose()
    }

    async fn create<K: Object>(&self, object: &K) -> Result<K> {
        let namespace = object.namespace();
        let name = object.name_any();
        let what = describe::<K>(namespace.as_deref(), &name);

        let mut inner = self.inner.lock().unwrap();
        inner.check_write::<K>(&what)?;
        let key = key::<K>(namespace.as_deref(), &name);
        if inner.objects.contains_key(&key) {
            return Err(Error::SyncConflict(what));
        }

        let mut created = object.clone();
        let version = inner.next_version();
        created.meta_mut().uid = Some(format!("uid-{version}"));
        created.meta_mut().resource_version = Some(version);
        inner.objects.insert(key, encode(&created)?);
        inner.writes += 1;
        Ok(created)
    }

    async fn replace<K: Object>(&self, object: &K) -> Result<K> {
        let namespace = object.namespace();
        let name = object.name_any();
        let what = describe::<K>(namespace.as_deref(), &name);

        let mut inner = self.inner.lock().unwrap();
        inner.check_write::<K>(&what)?;
        let key = key::<K>(namespace.as_deref(), &name);
        let stored_version = match inner.objects.get(&key) {
            Some(stored) => stored["metadata"]["resourceVersion"].as_str().map(String::from),
            None => return Err(api_error(404, "NotFound", format!("{what} not found"))),
        };
        if stored_version != object.resource_version() {
            return Err(Error::SyncConflict(what));
        }

        let mut replaced = object.clone();
        replaced.meta_mut().resource_version = Some(inner.next_version());
        inner.objects.insert(key, encode(&replaced)?);
        inner.writes += 1;
        Ok(replaced)
    }

    async fn patch_status<K: Object>(&self, namespace: &str, name: &str, status: Value) -> Result<()> {
        let what = describe::<K>(Some(namespace), name);

        let mut inner = self.inner.lock().unwrap();
        if inner.failing_status {
            return Err(api_error(500, "InternalError", format!("status of {what} is read only")));
        }
        let version = inner.next_version();
        let stored = inner
            .objects
            .get_mut(&key::<K>(Some(namespace), name))
            .ok_or_else(|| api_error(404, "NotFound", format!("{what} not found")))?;

        if !stored["status"].is_object() {
            stored["status"] = Value::Object(Default::default());
        }
        if let (Some(current), Value::Object(patch)) = (stored["status"].as_object_mut(), status) {
            current.extend(patch);
        }
        stored["metadata"]["resourceVersion"] = Value::String(version);
        inner.status_writes += 1;
        Ok(())
    }
}
