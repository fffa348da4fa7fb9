use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use kube::runtime::{controller::Action, reflector::ObjectRef};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    operator::Diagnostics,
    resources::{ResourceKind, Source},
    store::{KubeStore, Store},
    Error, Metrics, Result, Settings,
};

pub mod credentials;
pub mod desired;
mod source;

pub use credentials::Credentials;

/// Kinds whose changes trigger a reconciliation of a source.
///
/// Claims map back to their controlling source through the owner reference.
pub const WATCHES: &[ResourceKind] = &[ResourceKind::Source, ResourceKind::PersistentVolumeClaim];

/// The context passed around
pub struct Context<S = KubeStore> {
    /// Object store the sources are converged against
    pub store: S,

    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,

    /// Prometheus metrics
    pub metrics: Metrics,

    /// Runtime settings
    pub settings: Settings,

    /// Aborts in-flight reconciliations on shutdown
    pub cancel: CancellationToken,

    /// Consecutive failures per source, drives the error backoff
    failures: Mutex<HashMap<ObjectRef<Source>, u32>>,
}

impl<S: Store> Context<S> {
    pub fn new(
        store: S,
        diagnostics: Arc<RwLock<Diagnostics>>,
        metrics: Metrics,
        settings: Settings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            diagnostics,
            metrics,
            settings,
            cancel,
            failures: Mutex::default(),
        }
    }

    /// Count a failure of `key` and return how long to wait before retrying
    pub fn next_backoff(&self, key: &ObjectRef<Source>) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = failures.entry(key.clone()).or_insert(0);
        let delay = self.settings.backoff(*count);
        *count = count.saturating_add(1);
        delay
    }

    pub fn clear_failures(&self, key: &ObjectRef<Source>) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

#[cfg(test)]
impl<S: Store> Context<S> {
    pub(crate) fn for_tests(store: S) -> Arc<Self> {
        Arc::new(Self::new(
            store,
            Default::default(),
            Metrics::default(),
            Settings::default(),
            CancellationToken::new(),
        ))
    }
}

/// How a reconciliation cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The source is gone, its claim is left to the garbage collector
    SourceAbsent,
    /// The credential secret does not exist (yet)
    CredentialAbsent,
    /// Volume and claim match the source
    Converged,
}

impl Outcome {
    pub fn action(self, settings: &Settings) -> Action {
        match self {
            Outcome::CredentialAbsent => Action::requeue(settings.secret_requeue()),
            Outcome::SourceAbsent | Outcome::Converged => Action::await_change(),
        }
    }
}

/// A resource that can be reconciled by a controller
#[async_trait]
pub(crate) trait Reconcile<S: Store> {
    /// Attempt to reconcile a resource
    async fn reconcile(&self, ctx: Arc<Context<S>>) -> Result<Outcome>;

    /// Attempt to deploy all necessary sub-resources for this CRD.
    async fn deploy_resources(&self, ctx: Arc<Context<S>>, credentials: &Credentials) -> Result<()>;
}

/// Run one reconciliation cycle for the source behind `key`.
///
/// The source is read fresh from the store so the cycle always works on the
/// latest spec. The cycle is abandoned with [`Error::Cancelled`] when the
/// context is cancelled or the configured deadline passes.
pub async fn on_event<S: Store>(key: &ObjectRef<Source>, ctx: Arc<Context<S>>) -> Result<Outcome> {
    let cycle = async {
        let namespace = key
            .namespace
            .as_deref()
            .ok_or_else(|| Error::IllegalSource(key.name.clone(), "missing namespace".into()))?;

        match ctx.store.get::<Source>(Some(namespace), &key.name).await? {
            Some(source) => source.reconcile(ctx.clone()).await,
            None => {
                debug!(r#"Source "{namespace}/{}" is gone"#, key.name);
                Ok(Outcome::SourceAbsent)
            }
        }
    };

    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(Error::Cancelled),
        result = tokio::time::timeout(ctx.settings.reconcile_timeout(), cycle) => {
            result.map_err(|_elapsed| Error::Cancelled)?
        }
    }
}
