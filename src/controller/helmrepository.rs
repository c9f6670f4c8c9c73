//! HelmRepository reconciler for OCI-typed repositories.
//!
//! An OCI HelmRepository produces no artifact of its own: reconciliation
//! validates the URL and credentials so dependent HelmCharts fail fast with
//! a useful Ready condition on the repository.

use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, Patch, PatchParams};
use kube::{Resource, ResourceExt};
use tracing::{error, info, instrument, warn};

use super::{
    ensure_finalizer, get_optional, interval_of, object_reference, remove_finalizer, requested_at,
    Context, ReconcileOutcome,
};
use crate::conditions::{self, reasons, types};
use crate::credentials::{CloudProvider, CredentialProvider};
use crate::error::ReconcileError;
use crate::events::{EVENT_TYPE_NORMAL, EVENT_TYPE_WARNING};
use crate::index::ObjectKey;
use crate::metrics;
use crate::models::{HelmRepository, SOURCE_FINALIZER};
use crate::registry::{parse_repository_url, RegistryClient};

const KIND: &str = "HelmRepository";

pub struct HelmRepositoryReconciler {
    ctx: Arc<Context>,
}

impl HelmRepositoryReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self), fields(kind = KIND, object = %key))]
    pub async fn reconcile(&self, key: ObjectKey) -> (ReconcileOutcome, Duration) {
        let timer = metrics::RECONCILE_DURATION
            .with_label_values(&[KIND])
            .start_timer();
        metrics::RECONCILES_TOTAL.with_label_values(&[KIND]).inc();

        let interval = self.ctx.config.default_requeue_interval;
        let result = self.reconcile_inner(&key).await;
        timer.observe_duration();

        match result {
            Ok(outcome) => outcome,
            Err(err) => {
                metrics::RECONCILE_ERRORS.with_label_values(&[KIND]).inc();
                if err.is_stalling() {
                    warn!(error = %err, "reconciliation stalled");
                    (ReconcileOutcome::Stalled, interval)
                } else {
                    error!(error = %err, "reconciliation failed");
                    (ReconcileOutcome::Retry, interval)
                }
            }
        }
    }

    async fn reconcile_inner(
        &self,
        key: &ObjectKey,
    ) -> Result<(ReconcileOutcome, Duration), ReconcileError> {
        let api: Api<HelmRepository> = Api::namespaced(self.ctx.client.clone(), &key.namespace);
        let Some(mut obj) = get_optional(&api, &key.name).await? else {
            self.ctx.index.forget_repository(key).await;
            return Ok((ReconcileOutcome::Finished, self.ctx.config.default_requeue_interval));
        };
        let interval = interval_of(
            obj.spec.interval.as_deref(),
            self.ctx.config.default_requeue_interval,
        );

        metrics::SUSPENDED_RESOURCES
            .with_label_values(&[KIND, &key.namespace, &key.name])
            .set(obj.spec.suspend as i64);

        if ensure_finalizer(&api, &obj, SOURCE_FINALIZER).await? {
            return Ok((ReconcileOutcome::RequeueImmediate, interval));
        }

        if obj.meta().deletion_timestamp.is_some() {
            // No artifacts of its own, only the finalizer to release.
            remove_finalizer(&api, &obj, SOURCE_FINALIZER).await?;
            return Ok((ReconcileOutcome::Finished, interval));
        }

        if obj.spec.suspend {
            info!("reconciliation is suspended for this object");
            return Ok((ReconcileOutcome::Finished, interval));
        }

        self.ctx.index.index_repository(&obj).await;

        // Classic repositories are consumed directly by the chart builder;
        // stale conditions from a previous OCI configuration are cleared.
        if !obj.is_oci() {
            if obj
                .status
                .as_ref()
                .map(|s| !s.conditions.is_empty())
                .unwrap_or(false)
            {
                obj.status.get_or_insert_with(Default::default).conditions = Vec::new();
                self.patch_status(&api, &obj).await?;
            }
            return Ok((ReconcileOutcome::Finished, interval));
        }

        let generation = obj.meta().generation.unwrap_or(0);
        let was_ready = conditions::is_ready(&obj);

        let check = self.check_registry_access(&obj).await;

        // SUMMARIZE: Ready follows the registry check outcome directly, as
        // there are no artifact sub-conditions on this kind.
        match &check {
            Ok(()) => {
                conditions::delete(&mut obj, types::RECONCILING);
                conditions::delete(&mut obj, types::STALLED);
                conditions::mark_true(
                    &mut obj,
                    types::READY,
                    reasons::SUCCEEDED,
                    "Helm repository is ready",
                    generation,
                );
                obj.status.get_or_insert_with(Default::default).observed_generation =
                    Some(generation);
            }
            Err(err) => {
                conditions::mark_false(
                    &mut obj,
                    types::READY,
                    err.reason(),
                    err.to_string(),
                    generation,
                );
                if err.is_stalling() {
                    conditions::mark_stalled(&mut obj, err.reason(), err.to_string(), generation);
                    obj.status.get_or_insert_with(Default::default).observed_generation =
                        Some(generation);
                }
            }
        }

        if let Some(requested) = requested_at(obj.meta()) {
            obj.status.get_or_insert_with(Default::default).last_handled_reconcile_at =
                Some(requested);
        }
        self.patch_status(&api, &obj).await?;

        // One Ready transition event per run.
        let is_ready = conditions::is_ready(&obj);
        if was_ready != is_ready {
            if let Some(ready) = conditions::get(&obj, types::READY).cloned() {
                let type_ = if is_ready { EVENT_TYPE_NORMAL } else { EVENT_TYPE_WARNING };
                self.ctx
                    .events
                    .publish(
                        &object_reference(&obj, KIND),
                        type_,
                        &ready.reason,
                        &ready.message,
                        None,
                    )
                    .await;
            }
        }

        match check {
            Ok(()) => Ok((ReconcileOutcome::RequeueAfter(interval), interval)),
            Err(err) => Err(err),
        }
    }

    /// Validates the URL and logs into the registry with the resolved
    /// credentials.
    async fn check_registry_access(&self, obj: &HelmRepository) -> Result<(), ReconcileError> {
        let repo_path = parse_repository_url(&obj.spec.url).map_err(|err| {
            ReconcileError::stalling(reasons::URL_INVALID, err.to_string())
        })?;
        let host = repo_path.split('/').next().unwrap_or_default().to_string();
        let namespace = obj.namespace().unwrap_or_default();

        let provider: CloudProvider = obj
            .spec
            .provider
            .as_deref()
            .unwrap_or("generic")
            .parse()
            .unwrap_or_default();
        let credential_provider = CredentialProvider::new(self.ctx.client.clone());
        let credentials = credential_provider
            .resolve(&namespace, obj.spec.secret_ref.as_ref(), None, provider, &host)
            .await
            .map_err(|err| {
                ReconcileError::generic(
                    reasons::AUTHENTICATION_FAILED,
                    format!("failed to get credential: {}", err),
                )
            })?;

        if let Some(basic) = &credentials.basic {
            let mut registry = RegistryClient::new(false, None);
            registry.with_basic_auth(&basic.username, &basic.password);
            registry.login(&repo_path).await.map_err(|err| {
                ReconcileError::generic(
                    reasons::AUTHENTICATION_FAILED,
                    format!("failed to login to registry '{}': {}", obj.spec.url, err),
                )
            })?;
        }
        Ok(())
    }

    async fn patch_status(
        &self,
        api: &Api<HelmRepository>,
        obj: &HelmRepository,
    ) -> Result<(), ReconcileError> {
        let status = obj.status.clone().unwrap_or_default();
        api.patch_status(
            &obj.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&serde_json::json!({ "status": status })),
        )
        .await?;
        Ok(())
    }
}
