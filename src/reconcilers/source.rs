use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::ResourceExt as _;
use serde_json::json;
use tracing::{info, warn};

use super::{
    credentials::Credentials,
    desired::{DesiredClaim, DesiredVolume},
    Context, Outcome, Reconcile,
};
use crate::{
    resources::Source,
    store::{create_or_update, Store},
    Error, Result,
};

#[async_trait]
impl<S: Store> Reconcile<S> for Source {
    async fn reconcile(&self, ctx: Arc<Context<S>>) -> Result<Outcome> {
        let name = self.name_any();
        let namespace = self
            .namespace()
            .ok_or_else(|| Error::IllegalSource(name.clone(), "missing namespace".into()))?;
        let secret_name = &self.spec.access_secret_name;

        info!(r#"Reconciling source "{namespace}/{name}""#);
        let Some(credentials) = Credentials::resolve(&ctx.store, &namespace, secret_name).await? else {
            warn!(r#"Secret "{namespace}/{secret_name}" for source "{name}" not found"#);
            self.record_error(&ctx, format!("Secret {secret_name} not found"))
                .await;
            return Ok(Outcome::CredentialAbsent);
        };

        self.deploy_resources(ctx.clone(), &credentials).await?;

        // the secret showed up again, drop the stale message
        if self.status_error().is_some() {
            self.record_error(&ctx, String::new()).await;
        }

        Ok(Outcome::Converged)
    }

    async fn deploy_resources(&self, ctx: Arc<Context<S>>, credentials: &Credentials) -> Result<()> {
        let name = self.name_any();
        let namespace = self.namespace();
        let retries = ctx.settings.conflict_retries;

        // The claim binds to the volume, so the volume has to exist first
        let desired = DesiredVolume::new(self, credentials);
        let (action, volume) = create_or_update::<PersistentVolume, _, _>(
            &ctx.store,
            None,
            &name,
            retries,
            |volume| {
                desired.apply(volume);
                Ok(())
            },
        )
        .await?;
        info!("PersistentVolume {name} {}", action.as_ref());
        ctx.metrics.dependent_action("PersistentVolume", action);

        let desired = DesiredClaim::new(self, &volume)?;
        let (action, _) = create_or_update::<PersistentVolumeClaim, _, _>(
            &ctx.store,
            namespace.as_deref(),
            &name,
            retries,
            |claim| desired.apply(claim),
        )
        .await?;
        info!("PersistentVolumeClaim {name} {}", action.as_ref());
        ctx.metrics.dependent_action("PersistentVolumeClaim", action);

        Ok(())
    }
}

impl Source {
    /// Write `message` to the status of this source.
    ///
    /// Status is informational: a failed write is logged and otherwise
    /// ignored, and nothing is written when the message is already there.
    async fn record_error<S: Store>(&self, ctx: &Context<S>, message: String) {
        if self.status.as_ref().map(|s| s.error.as_str()).unwrap_or_default() == message {
            return;
        }

        let name = self.name_any();
        let Some(namespace) = self.namespace() else {
            return;
        };
        let status = json!({ "error": message });
        if let Err(e) = ctx.store.patch_status::<Source>(&namespace, &name, status).await {
            warn!(r#"Failed to update status of source "{namespace}/{name}": {e}"#);
        }
    }
}
