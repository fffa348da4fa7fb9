use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{runtime::reflector::ObjectRef, Resource};

mod source;

pub use source::*;

/// Label correlating a cluster scoped volume with the source it was made for
pub const SOURCE_NAME_LABEL: &str = "source-name";

/// Kinds whose changes trigger a reconciliation of a [`Source`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Source,
    PersistentVolumeClaim,
}

impl ResourceKind {
    /// The source to reconcile after a change to an object of this kind.
    ///
    /// A source maps to itself, a claim to the source controlling it. Claims
    /// without such an owner trigger nothing.
    pub fn source_key(self, meta: &ObjectMeta) -> Option<ObjectRef<Source>> {
        let namespace = meta.namespace.as_deref()?;
        let name = match self {
            ResourceKind::Source => meta.name.as_deref()?,
            ResourceKind::PersistentVolumeClaim => meta
                .owner_references
                .as_ref()?
                .iter()
                .find(|owner| {
                    owner.controller == Some(true)
                        && owner.kind == Source::kind(&())
                        && owner.api_version == Source::api_version(&())
                })?
                .name
                .as_str(),
        };
        Some(ObjectRef::new(name).within(namespace))
    }
}
