//! The attributes a [`Source`] wants on its volume and claim.
//!
//! Everything here is pure: the `apply` functions take the live object (or an
//! empty one carrying only its identity) and bring the fields this controller
//! owns in line, leaving all other fields untouched.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{
        CSIPersistentVolumeSource, PersistentVolume, PersistentVolumeClaim,
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{LabelSelector, OwnerReference},
    },
};
use kube::{Resource, ResourceExt};

use super::credentials::Credentials;
use crate::{
    resources::{Source, SOURCE_NAME_LABEL},
    Error, Result,
};

/// The CSI driver that mounts the bucket
pub const DRIVER: &str = "csi-rclone";
/// Storage class of a volume that does not name one
pub const DEFAULT_STORAGE_CLASS: &str = "rclone";
/// Nominal size: the bucket decides the real capacity
pub const NOMINAL_SIZE: &str = "1Mi";

const READ_WRITE_MANY: &str = "ReadWriteMany";
const STORAGE: &str = "storage";

/// Desired state of the cluster scoped volume of a source
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredVolume {
    source_name: String,
    storage_class: String,
    capacity: Quantity,
    csi: CSIPersistentVolumeSource,
}

impl DesiredVolume {
    pub fn new(source: &Source, credentials: &Credentials) -> Self {
        let bucket = &source.spec.bucket_name;
        let attributes = BTreeMap::from([
            ("remote".to_string(), "s3".to_string()),
            ("remotePath".into(), bucket.clone()),
            ("s3-provider".into(), "AWS".into()),
            ("s3-endpoint".into(), credentials.endpoint_url.clone()),
            ("s3-access-key-id".into(), credentials.access_key_id.clone()),
            (
                "s3-secret-access-key".into(),
                credentials.secret_access_key.clone(),
            ),
            ("s3-region".into(), credentials.region.clone()),
        ]);

        Self {
            source_name: source.name_any(),
            storage_class: source
                .spec
                .storage_class_name
                .clone()
                .filter(|class| !class.is_empty())
                .unwrap_or_else(|| DEFAULT_STORAGE_CLASS.into()),
            capacity: source
                .spec
                .size
                .clone()
                .unwrap_or_else(|| Quantity(NOMINAL_SIZE.into())),
            csi: CSIPersistentVolumeSource {
                driver: DRIVER.into(),
                volume_handle: bucket.clone(),
                volume_attributes: Some(attributes),

                ..Default::default()
            },
        }
    }

    /// Bring `volume` in line with this state.
    ///
    /// The storage class and capacity are defaults: a value already present
    /// on the volume wins. The CSI source is written once and then left alone.
    pub fn apply(&self, volume: &mut PersistentVolume) {
        volume
            .labels_mut()
            .insert(SOURCE_NAME_LABEL.into(), self.source_name.clone());

        let spec = volume.spec.get_or_insert_with(Default::default);
        if spec.storage_class_name.as_deref().map_or(true, str::is_empty) {
            spec.storage_class_name = Some(self.storage_class.clone());
        }
        spec.capacity
            .get_or_insert_with(BTreeMap::new)
            .entry(STORAGE.into())
            .or_insert_with(|| self.capacity.clone());
        spec.access_modes = Some(vec![READ_WRITE_MANY.into()]);
        if spec.csi.is_none() {
            spec.csi = Some(self.csi.clone());
        }
    }
}

/// Desired state of the namespaced claim of a source
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredClaim {
    owner: OwnerReference,
    owner_deleting: bool,
    storage_class: Option<String>,
    selector: BTreeMap<String, String>,
}

impl DesiredClaim {
    /// The claim binds to `volume`, so it is built from the volume as stored.
    pub fn new(source: &Source, volume: &PersistentVolume) -> Result<Self> {
        let owner = source.controller_owner_ref(&()).ok_or_else(|| {
            Error::OwnerReferenceRejected(source.name_any(), "source has no uid yet".into())
        })?;

        Ok(Self {
            owner,
            owner_deleting: source.meta().deletion_timestamp.is_some(),
            storage_class: volume
                .spec
                .as_ref()
                .and_then(|spec| spec.storage_class_name.clone()),
            selector: BTreeMap::from([(SOURCE_NAME_LABEL.into(), source.name_any())]),
        })
    }

    /// Bring `claim` in line with this state.
    ///
    /// A claim spec is immutable once bound, so apart from the owner only
    /// unset fields are filled in.
    pub fn apply(&self, claim: &mut PersistentVolumeClaim) -> Result<()> {
        self.set_controller(claim)?;

        let spec = claim.spec.get_or_insert_with(Default::default);
        if spec.access_modes.as_ref().map_or(true, Vec::is_empty) {
            spec.access_modes = Some(vec![READ_WRITE_MANY.into()]);
        }
        spec.resources
            .get_or_insert_with(Default::default)
            .requests
            .get_or_insert_with(BTreeMap::new)
            .entry(STORAGE.into())
            .or_insert_with(|| Quantity(NOMINAL_SIZE.into()));
        if spec.storage_class_name.is_none() {
            spec.storage_class_name = self.storage_class.clone();
        }
        if spec.selector.is_none() {
            spec.selector = Some(LabelSelector {
                match_labels: Some(self.selector.clone()),
                match_expressions: None,
            });
        }

        Ok(())
    }

    fn set_controller(&self, claim: &mut PersistentVolumeClaim) -> Result<()> {
        let name = claim.name_any();
        let owners = claim.owner_references_mut();

        if let Some(controller) = owners.iter().find(|o| o.controller == Some(true)) {
            if controller.uid == self.owner.uid {
                return Ok(());
            }
            return Err(Error::OwnerReferenceRejected(
                name,
                format!("already controlled by {} {}", controller.kind, controller.name),
            ));
        }
        if self.owner_deleting {
            return Err(Error::OwnerReferenceRejected(
                name,
                format!("{} {} is being deleted", self.owner.kind, self.owner.name),
            ));
        }

        owners.push(self.owner.clone());
        Ok(())
    }
}
