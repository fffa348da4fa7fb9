use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a mount of a remote object storage bucket
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    kind = "Source",
    group = "package.r",
    version = "v1alpha1",
    status = "SourceStatus",
    doc = "A remote object storage bucket exposed as a volume claim",
    derive = "PartialEq",
    derive = "Default",
    namespaced,
    printcolumn = r#"{ "name": "bucket", "type": "string", "description": "backing bucket", "jsonPath": ".spec.bucketName" }"#,
    printcolumn = r#"{ "name": "secret", "type": "string", "description": "credential secret", "jsonPath": ".spec.accessSecretName" }"#,
    printcolumn = r#"{ "name": "error", "type": "string", "description": "last reconciliation error", "jsonPath": ".status.error" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    /// Name of a secret in the same namespace holding the S3 credentials.
    ///
    /// The secret must carry `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`,
    /// `AWS_ENDPOINT_URL` and `AWS_REGION`.
    pub access_secret_name: String,

    /// The bucket to mount.
    pub bucket_name: String,

    /// Storage class given to a new volume. Defaults to `rclone`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Capacity advertised by a new volume. Defaults to `1Mi`.
    ///
    /// The real capacity is whatever the remote store allows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Quantity>,
}

/// The status of a source
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatus {
    /// Human readable reason the source cannot be mounted, empty when healthy
    #[serde(default)]
    pub error: String,
}

impl Source {
    /// The last recorded error, if any
    pub fn status_error(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|s| s.error.as_str())
            .filter(|e| !e.is_empty())
    }
}
