use thiserror::Error;

/// Expose all controller components used by main
pub mod operator;
pub mod reconcilers;
pub mod resources;

/// Typed access to the cluster object store
pub mod store;

/// Runtime settings
pub mod settings;
pub use settings::Settings;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;

/// Name used as field manager and reporter towards the API server
pub const CONTROLLER_NAME: &str = "source-controller";

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Secret {0} has no usable value for {1}")]
    InvalidCredential(String, &'static str),

    #[error("Conflicting write on {0}")]
    SyncConflict(String),

    #[error("Owner reference rejected for {0}: {1}")]
    OwnerReferenceRejected(String, String),

    #[error("IllegalSource {0}: {1}")]
    IllegalSource(String, String),

    #[error("Reconciliation cancelled")]
    Cancelled,
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::SerializationError(_) => "serializationerror",
            Error::KubeError(_) => "kubeerror",
            Error::InvalidCredential(..) => "invalidcredential",
            Error::SyncConflict(_) => "syncconflict",
            Error::OwnerReferenceRejected(..) => "ownerreferencerejected",
            Error::IllegalSource(..) => "illegalsource",
            Error::Cancelled => "cancelled",
        }
        .into()
    }

    /// Whether the failure is a timing issue rather than a broken object
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
