use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::{
    api::ListParams,
    runtime::{
        controller::{self, Action},
        reflector::ObjectRef,
        watcher::{self, Config},
        Controller,
    },
    Api, Client, Resource, ResourceExt,
};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, field, info, instrument, warn, Span};

use crate::{
    reconcilers::{on_event, Context, WATCHES},
    resources::{ResourceKind, Source},
    store::{KubeStore, Store},
    telemetry, Error, Metrics, Result, Settings,
};

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
        }
    }
}

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub(crate) fn to_context(
        &self,
        client: Client,
        settings: Settings,
        cancel: CancellationToken,
    ) -> Result<Arc<Context>, prometheus::Error> {
        Ok(Arc::new(Context::new(
            KubeStore::new(client),
            self.diagnostics.clone(),
            Metrics::default().register(&self.registry)?,
            settings,
            cancel,
        )))
    }
}

pub struct SourceController {
    state: State,
}

impl SourceController {
    pub fn new(state: State) -> Self {
        Self { state }
    }

    /// Initialize the controller and shared state (given the crd is installed)
    ///
    /// Returns once the controller has shut down, either on a termination
    /// signal or when `cancel` fires.
    pub async fn run(self, settings: Settings, cancel: CancellationToken) -> Result<(), anyhow::Error> {
        // Get a k8s client for communicating with the cluster
        let client = Client::try_default().await?;

        let sources = Api::<Source>::all(client.clone());

        // Test that we can actually query for our CRD (a.k.a. it is installed)
        if let Err(e) = sources.list(&ListParams::default().limit(1)).await {
            error!("CRD is not queryable; {e:?}. Is the CRD installed?");
            info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
            return Err(e.into());
        }

        let concurrency = settings.concurrency;
        let context = self.state.to_context(client.clone(), settings, cancel.clone())?;

        let watching_config = Config::default().any_semantic();
        let mut wiring = Controller::new(sources, watching_config.clone());
        for kind in WATCHES {
            wiring = match kind {
                ResourceKind::Source => wiring,
                ResourceKind::PersistentVolumeClaim => wiring.watches(
                    Api::<PersistentVolumeClaim>::all(client.clone()),
                    watching_config.clone(),
                    |claim| ResourceKind::PersistentVolumeClaim.source_key(claim.meta()),
                ),
            };
        }

        wiring
            .with_config(controller::Config::default().concurrency(concurrency))
            .shutdown_on_signal()
            .graceful_shutdown_on(async move { cancel.cancelled().await })
            .run(reconcile, error_policy, context.clone())
            .for_each(|result| {
                handle_result(&context, result);
                futures::future::ready(())
            })
            .await;

        info!("controller shut down");
        Ok(())
    }
}

/// Main reconciler, drives one cycle for the source that triggered it
#[instrument(skip(ctx, source), fields(trace_id))]
async fn reconcile(source: Arc<Source>, ctx: Arc<Context>) -> Result<Action> {
    // Add some tracing for debugging's sake
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", &field::display(&trace_id));

    // Take some metrics to see the average reconcile time
    let _timer = ctx.metrics.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let key = ObjectRef::from_obj(&*source);
    let outcome = on_event(&key, ctx.clone()).await?;

    ctx.clear_failures(&key);
    info!(r#"Source "{key}" reconciled: {outcome:?}"#);
    Ok(outcome.action(&ctx.settings))
}

/// Error handler for failed reconciliations
fn error_policy(source: Arc<Source>, error: &Error, ctx: Arc<Context>) -> Action {
    ctx.metrics.reconcile_failure(&source, error);

    let key = ObjectRef::from_obj(&*source);
    if error.is_transient() {
        info!(r#"reconcile of "{}" interrupted: {error}"#, source.name_any());
        return Action::requeue(ctx.settings.cancelled_requeue());
    }

    let delay = ctx.next_backoff(&key);
    error!(r#"reconcile of "{}" failed, retrying in {delay:?}: {error:?}"#, source.name_any());
    Action::requeue(delay)
}

/// Log the end of a reconciliation and drop the failure count of sources
/// that no longer exist, since those are never reconciled again
fn handle_result<S: Store>(
    ctx: &Context<S>,
    result: Result<(ObjectRef<Source>, Action), controller::Error<Error, watcher::Error>>,
) {
    match result {
        Ok(_) => {}
        Err(controller::Error::ObjectNotFound(gone)) => {
            debug!("{gone} was deleted, forgetting its failures");
            let mut key = ObjectRef::<Source>::new(&gone.name);
            key.namespace = gone.namespace;
            ctx.clear_failures(&key);
        }
        Err(e) => warn!("reconcile failed: {e}"),
    }
}
