//! OCIRepository reconciler: mirrors an OCI artifact into storage.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, Patch, PatchParams};
use kube::{Resource, ResourceExt};
use tracing::{error, info, instrument, warn};

use super::{
    ensure_finalizer, get_optional, interval_of, lowest_requeuing, object_reference,
    reconcile_requested, remove_finalizer, requested_at, timeout_of, Context, PhaseResult,
    ReconcileOutcome, GC_LOCK_TIMEOUT,
};
use crate::builder::chart::extract_tgz;
use crate::conditions::{self, reasons, types};
use crate::credentials::{CloudProvider, CredentialProvider};
use crate::error::ReconcileError;
use crate::events::{self, EVENT_TYPE_NORMAL, EVENT_TYPE_WARNING};
use crate::index::ObjectKey;
use crate::metrics;
use crate::models::{
    artifact::has_revision, Artifact, OCIRepository, LAYER_OPERATION_COPY, LAYER_OPERATION_EXTRACT,
    SOURCE_FINALIZER,
};
use crate::registry::{
    digest_from_revision, parse_repository_url, resolve_reference, revision_for, RegistryClient,
    RegistryError,
};
use crate::storage::{ignore, Storage};
use crate::verify::CosignVerifier;

const KIND: &str = "OCIRepository";

/// Metadata of the upstream artifact, carried between the source and
/// artifact phases.
#[derive(Default)]
struct FetchedArtifact {
    revision: String,
    annotations: Option<std::collections::BTreeMap<String, String>>,
    /// Relative path of the copied layer file, for the copy operation.
    copied_path: Option<String>,
}

pub struct OCIRepositoryReconciler {
    ctx: Arc<Context>,
}

impl OCIRepositoryReconciler {
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
        let api: Api<OCIRepository> = Api::namespaced(self.ctx.client.clone(), &key.namespace);
        let Some(mut obj) = get_optional(&api, &key.name).await? else {
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
            self.reconcile_delete(&api, &obj).await?;
            return Ok((ReconcileOutcome::Finished, interval));
        }

        if obj.spec.suspend {
            info!("reconciliation is suspended for this object");
            return Ok((ReconcileOutcome::Finished, interval));
        }

        let generation = obj.meta().generation.unwrap_or(0);
        let observed_generation = obj
            .status
            .as_ref()
            .and_then(|s| s.observed_generation)
            .unwrap_or(0);
        let last_handled = obj
            .status
            .as_ref()
            .and_then(|s| s.last_handled_reconcile_at.clone());
        let force = generation != observed_generation
            || reconcile_requested(obj.meta(), last_handled.as_deref());

        let old_checksum = obj.artifact().and_then(|a| a.checksum.clone());
        let had_failure = [types::FETCH_FAILED, types::STORAGE_OPERATION_FAILED]
            .iter()
            .any(|t| conditions::is_true(&obj, t));

        conditions::mark_reconciling(
            &mut obj,
            reasons::PROGRESSING,
            "reconciliation in progress",
            generation,
        );
        if force {
            self.patch_status(&api, &obj).await?;
        }

        let staging = tempfile::tempdir().map_err(|err| {
            let err = ReconcileError::generic(
                "DirCreationFailed",
                format!("failed to create temporary working directory: {}", err),
            );
            conditions::mark_true(
                &mut obj,
                types::STORAGE_OPERATION_FAILED,
                err.reason(),
                err.to_string(),
                generation,
            );
            err
        })?;
        conditions::delete(&mut obj, types::STORAGE_OPERATION_FAILED);

        let mut result = PhaseResult::Empty;
        let mut phase_err: Option<ReconcileError> = None;
        let mut fetched = FetchedArtifact::default();

        match self.reconcile_storage(&mut obj, generation).await {
            Ok(r) => result = lowest_requeuing(result, r),
            Err(err) => phase_err = Some(err),
        }
        if phase_err.is_none() {
            match self
                .reconcile_source(&mut obj, &mut fetched, generation, staging.path())
                .await
            {
                Ok(PhaseResult::Requeue) => result = PhaseResult::Requeue,
                Ok(r) => result = lowest_requeuing(result, r),
                Err(err) => phase_err = Some(err),
            }
        }
        if phase_err.is_none() && result != PhaseResult::Requeue {
            match self
                .reconcile_artifact(&mut obj, &fetched, generation, staging.path())
                .await
            {
                Ok(r) => result = lowest_requeuing(result, r),
                Err(err) => phase_err = Some(err),
            }
        }

        self.summarize(&api, &mut obj, result, &phase_err, generation, old_checksum, had_failure)
            .await?;

        match phase_err {
            Some(err) => Err(err),
            None if result == PhaseResult::Requeue => {
                Ok((ReconcileOutcome::RequeueImmediate, interval))
            }
            None => Ok((ReconcileOutcome::RequeueAfter(interval), interval)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn summarize(
        &self,
        api: &Api<OCIRepository>,
        obj: &mut OCIRepository,
        result: PhaseResult,
        phase_err: &Option<ReconcileError>,
        generation: i64,
        old_checksum: Option<String>,
        had_failure: bool,
    ) -> Result<(), ReconcileError> {
        if let Some(err) = phase_err {
            if err.is_stalling() {
                conditions::mark_stalled(obj, err.reason(), err.to_string(), generation);
            }
        } else if result == PhaseResult::Success {
            conditions::delete(obj, types::RECONCILING);
        }

        let transition = conditions::summarize(obj, generation);

        if conditions::is_ready(obj) || conditions::is_stalled(obj) {
            obj.status.get_or_insert_with(Default::default).observed_generation = Some(generation);
        }
        if let Some(requested) = requested_at(obj.meta()) {
            obj.status.get_or_insert_with(Default::default).last_handled_reconcile_at =
                Some(requested);
        }

        self.patch_status(api, obj).await?;

        let obj_ref = object_reference(obj, KIND);
        if let Some(transition) = &transition {
            let (type_, reason, message) = match transition {
                conditions::ReadyTransition::BecameReady { reason, message } => {
                    (EVENT_TYPE_NORMAL, reason, message)
                }
                conditions::ReadyTransition::BecameUnready { reason, message } => {
                    (EVENT_TYPE_WARNING, reason, message)
                }
            };
            self.ctx
                .events
                .publish(&obj_ref, type_, reason, message, None)
                .await;
        }

        if phase_err.is_none() && result == PhaseResult::Success {
            if let Some(artifact) = obj.artifact() {
                let new_artifact = old_checksum != artifact.checksum;
                let recovered = had_failure && !new_artifact;
                if new_artifact || recovered {
                    let mut message = format!(
                        "stored artifact with revision '{}' from '{}'",
                        artifact.revision, obj.spec.url
                    );
                    // Enrich with upstream provenance annotations if present.
                    if let Some(metadata) = &artifact.metadata {
                        if let (Some(source), Some(revision)) = (
                            metadata.get("org.opencontainers.image.source"),
                            metadata.get("org.opencontainers.image.revision"),
                        ) {
                            message.push_str(&format!(
                                ", origin source '{}', origin revision '{}'",
                                source, revision
                            ));
                        }
                    }
                    self.ctx
                        .events
                        .publish(
                            &obj_ref,
                            EVENT_TYPE_NORMAL,
                            events::reasons::NEW_ARTIFACT,
                            &message,
                            Some(events::artifact_annotations(
                                &artifact.revision,
                                artifact.checksum.as_deref(),
                            )),
                        )
                        .await;
                }
            }
        }
        Ok(())
    }

    async fn reconcile_storage(
        &self,
        obj: &mut OCIRepository,
        generation: i64,
    ) -> Result<PhaseResult, ReconcileError> {
        if let Err(err) = self.garbage_collect(obj).await {
            self.ctx
                .events
                .publish(
                    &object_reference(obj, KIND),
                    EVENT_TYPE_WARNING,
                    events::reasons::GARBAGE_COLLECTION_FAILED,
                    &err.to_string(),
                    None,
                )
                .await;
        }

        let mut artifact_missing = false;
        if let Some(artifact) = obj.artifact() {
            if !self.ctx.storage.artifact_exists(artifact) {
                let status = obj.status.get_or_insert_with(Default::default);
                status.artifact = None;
                status.url = None;
                artifact_missing = true;
                conditions::delete(obj, types::ARTIFACT_IN_STORAGE);
            }
        }

        if obj.artifact().is_none() {
            let mut msg = "building artifact".to_string();
            if artifact_missing {
                msg.push_str(": disappeared from storage");
            }
            conditions::mark_reconciling(obj, reasons::PROGRESSING, msg, generation);
            conditions::delete(obj, types::ARTIFACT_IN_STORAGE);
            return Ok(PhaseResult::Success);
        }

        let storage = Arc::clone(&self.ctx.storage);
        let status = obj.status.get_or_insert_with(Default::default);
        if let Some(artifact) = status.artifact.as_mut() {
            storage.set_artifact_url(artifact);
        }
        if let Some(url) = status.url.take() {
            status.url = Some(storage.set_hostname(&url));
        }
        Ok(PhaseResult::Success)
    }

    /// SOURCE: resolve the reference, verify, and pull the layer content
    /// into the staging directory.
    async fn reconcile_source(
        &self,
        obj: &mut OCIRepository,
        fetched: &mut FetchedArtifact,
        generation: i64,
        staging: &Path,
    ) -> Result<PhaseResult, ReconcileError> {
        if conditions::is_false(obj, types::SOURCE_VERIFIED) {
            conditions::delete(obj, types::SOURCE_VERIFIED);
        }

        let namespace = obj.namespace().unwrap_or_default();
        let url = obj.spec.url.clone();
        let timeout = timeout_of(obj.spec.timeout.as_deref(), self.ctx.config.default_timeout);

        let fetch_failed = |obj: &mut OCIRepository, reason: &str, message: String| {
            conditions::mark_true(obj, types::FETCH_FAILED, reason, message.as_str(), generation);
            ReconcileError::generic(reason, message)
        };

        // Credentials, in spec priority order.
        let provider: CloudProvider = obj
            .spec
            .provider
            .as_deref()
            .unwrap_or("generic")
            .parse()
            .unwrap_or_default();
        let repo_path = match parse_repository_url(&obj.spec.url) {
            Ok(path) => path,
            Err(err) => {
                let err = ReconcileError::stalling(
                    reasons::URL_INVALID,
                    format!("URL validation failed for '{}': {}", obj.spec.url, err),
                );
                conditions::mark_true(
                    obj,
                    types::FETCH_FAILED,
                    err.reason(),
                    err.to_string(),
                    generation,
                );
                return Err(err);
            }
        };
        let host = repo_path.split('/').next().unwrap_or_default().to_string();

        let credential_provider = CredentialProvider::new(self.ctx.client.clone());
        let credentials = credential_provider
            .resolve(
                &namespace,
                obj.spec.secret_ref.as_ref(),
                obj.spec.service_account_name.as_deref(),
                provider,
                &host,
            )
            .await
            .map_err(|err| {
                fetch_failed(
                    obj,
                    reasons::AUTHENTICATION_FAILED,
                    format!("failed to get credential: {}", err),
                )
            })?;

        let certs = match obj.spec.cert_secret_ref.as_ref() {
            Some(secret_ref) => Some(
                credential_provider
                    .tls_certificates(&namespace, secret_ref)
                    .await
                    .map_err(|err| {
                        fetch_failed(
                            obj,
                            reasons::AUTHENTICATION_FAILED,
                            format!("failed to generate transport for '{}': {}", url, err),
                        )
                    })?,
            ),
            None => None,
        };

        let mut registry = RegistryClient::new(obj.spec.insecure, certs.as_ref());
        if let Some(basic) = &credentials.basic {
            registry.with_basic_auth(&basic.username, &basic.password);
        }

        // Reference resolution: digest > semVer > tag > latest.
        let (reference, tag) = tokio::time::timeout(
            timeout,
            resolve_reference(&mut registry, &repo_path, obj.spec.reference.as_ref()),
        )
        .await
        .map_err(|_| {
            fetch_failed(
                obj,
                "ReadOperationFailed",
                format!("timed out resolving artifact reference for '{}'", url),
            )
        })?
        .map_err(|err| match err {
            RegistryError::InvalidSemver { .. } => {
                let err = ReconcileError::stalling(reasons::URL_INVALID, err.to_string());
                conditions::mark_true(
                    obj,
                    types::FETCH_FAILED,
                    err.reason(),
                    err.to_string(),
                    generation,
                );
                err
            }
            other => fetch_failed(
                obj,
                "ReadOperationFailed",
                format!("failed to determine the artifact tag for '{}': {}", url, other),
            ),
        })?;

        let digest = tokio::time::timeout(timeout, registry.digest(&reference))
            .await
            .map_err(|_| {
                fetch_failed(
                    obj,
                    "OCIPullFailed",
                    format!("timed out resolving digest of '{}'", reference),
                )
            })?
            .map_err(|err| {
                fetch_failed(
                    obj,
                    "OCIPullFailed",
                    format!("failed to determine artifact digest: {}", err),
                )
            })?;
        let revision = revision_for(tag.as_deref(), &digest);
        fetched.revision = revision.clone();

        if !has_revision(obj.artifact(), &revision) {
            let message = format!("new revision '{}' for '{}'", revision, url);
            if obj.artifact().is_some() {
                conditions::mark_true(
                    obj,
                    types::ARTIFACT_OUTDATED,
                    reasons::NEW_REVISION,
                    message.as_str(),
                    generation,
                );
            }
            conditions::mark_reconciling(
                obj,
                reasons::PROGRESSING,
                format!("building artifact: {}", message),
                generation,
            );
        }

        // Signature verification: on revision drift, generation drift, or a
        // previously failed verification.
        match obj.spec.verify.clone() {
            None => {
                conditions::delete(obj, types::SOURCE_VERIFIED);
            }
            Some(verify) => {
                let verified_generation = conditions::get(obj, types::SOURCE_VERIFIED)
                    .and_then(|c| c.observed_generation);
                let needs_verify = !has_revision(obj.artifact(), &revision)
                    || verified_generation != Some(generation)
                    || conditions::is_false(obj, types::SOURCE_VERIFIED);
                if needs_verify {
                    self.verify_signature(obj, verify, &mut registry, &repo_path, &digest, generation)
                        .await?;
                    conditions::mark_true(
                        obj,
                        types::SOURCE_VERIFIED,
                        reasons::SUCCEEDED,
                        format!("verified signature of revision {}", revision),
                        generation,
                    );
                }
            }
        }

        // Unchanged revision and content configuration: nothing to pull.
        if has_revision(obj.artifact(), &revision) && !obj.content_config_changed() {
            conditions::delete(obj, types::FETCH_FAILED);
            return Ok(PhaseResult::Success);
        }

        let pulled = tokio::time::timeout(timeout, registry.pull(&reference))
            .await
            .map_err(|_| {
                fetch_failed(obj, "OCIPullFailed", format!("timed out pulling '{}'", reference))
            })?
            .map_err(|err| {
                fetch_failed(
                    obj,
                    "OCIPullFailed",
                    format!("failed to pull artifact from '{}': {}", url, err),
                )
            })?;
        fetched.annotations = pulled.annotations.clone();

        // Select the layer and persist its content to the staging area.
        let media_type = obj.layer_media_type().to_string();
        let layer = if media_type.is_empty() {
            pulled.layers.first()
        } else {
            pulled.layers.iter().find(|l| l.media_type == media_type)
        };
        let layer = layer.ok_or_else(|| {
            let message = if media_type.is_empty() {
                "no layers found in artifact".to_string()
            } else {
                format!("failed to find layer with media type '{}' in artifact", media_type)
            };
            fetch_failed(obj, "OCILayerOperationFailed", message)
        })?;

        let operation = obj.layer_operation().to_string();
        match operation.as_str() {
            LAYER_OPERATION_EXTRACT => {
                extract_tgz(&layer.data, staging).map_err(|err| {
                    fetch_failed(
                        obj,
                        "OCILayerOperationFailed",
                        format!("failed to extract layer contents from artifact: {}", err),
                    )
                })?;
            }
            LAYER_OPERATION_COPY => {
                let file_name = format!("{}.tgz", digest_from_revision(&revision));
                std::fs::write(staging.join(&file_name), &layer.data).map_err(|err| {
                    fetch_failed(
                        obj,
                        "OCILayerOperationFailed",
                        format!("failed to copy layer from artifact: {}", err),
                    )
                })?;
                fetched.copied_path = Some(file_name);
            }
            other => {
                return Err(fetch_failed(
                    obj,
                    "OCILayerOperationFailed",
                    format!("unsupported layer operation: {}", other),
                ));
            }
        }

        conditions::delete(obj, types::FETCH_FAILED);
        Ok(PhaseResult::Success)
    }

    /// ARTIFACT: archive or copy the staged content into storage.
    async fn reconcile_artifact(
        &self,
        obj: &mut OCIRepository,
        fetched: &FetchedArtifact,
        generation: i64,
        staging: &Path,
    ) -> Result<PhaseResult, ReconcileError> {
        if fetched.revision.is_empty() {
            return Ok(PhaseResult::Requeue);
        }
        let revision = &fetched.revision;
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();

        let up_to_date = has_revision(obj.artifact(), revision) && !obj.content_config_changed();
        if up_to_date {
            self.ctx
                .events
                .publish(
                    &object_reference(obj, KIND),
                    EVENT_TYPE_NORMAL,
                    events::reasons::ARTIFACT_UP_TO_DATE,
                    &format!("artifact up-to-date with remote revision: '{}'", revision),
                    None,
                )
                .await;
            mark_artifact_in_storage(obj, revision, generation);
            return Ok(PhaseResult::Success);
        }

        let mut artifact = self.ctx.storage.artifact_for(
            KIND,
            &namespace,
            &name,
            revision,
            &format!("{}.tar.gz", digest_from_revision(revision)),
        );

        let storage = Arc::clone(&self.ctx.storage);
        let staging = staging.to_path_buf();
        let copied_path = fetched.copied_path.clone();
        let ignore_spec = obj.spec.ignore.clone();
        let persisted = tokio::task::spawn_blocking(move || -> Result<Artifact, ReconcileError> {
            persist_artifact(&storage, &mut artifact, &staging, copied_path, ignore_spec)?;
            Ok(artifact)
        })
        .await
        .map_err(|err| ReconcileError::generic(reasons::FAILED, err.to_string()))?;

        let mut artifact = match persisted {
            Ok(artifact) => artifact,
            Err(err) => {
                conditions::mark_true(
                    obj,
                    types::STORAGE_OPERATION_FAILED,
                    err.reason(),
                    err.to_string(),
                    generation,
                );
                return Err(err);
            }
        };
        artifact.metadata = fetched.annotations.clone();

        metrics::ARTIFACTS_STORED_TOTAL.with_label_values(&[KIND]).inc();
        {
            let status = obj.status.get_or_insert_with(Default::default);
            status.artifact = Some(artifact.clone());
            status.observed_ignore = obj.spec.ignore.clone();
            status.observed_layer_selector = obj.spec.layer_selector.clone();
        }

        match self.ctx.storage.symlink(&artifact, "latest.tar.gz") {
            Ok(url) => {
                obj.status.get_or_insert_with(Default::default).url = Some(url);
            }
            Err(err) => warn!(error = %err, "failed to update status URL symlink"),
        }

        conditions::delete(obj, types::STORAGE_OPERATION_FAILED);
        mark_artifact_in_storage(obj, revision, generation);
        Ok(PhaseResult::Success)
    }

    async fn reconcile_delete(
        &self,
        api: &Api<OCIRepository>,
        obj: &OCIRepository,
    ) -> Result<(), ReconcileError> {
        let namespace = obj.namespace().unwrap_or_default();
        let probe = self
            .ctx
            .storage
            .artifact_for(KIND, &namespace, &obj.name_any(), "", "*");
        let deleted = self.ctx.storage.remove_all(&probe).map_err(|err| {
            ReconcileError::generic(
                events::reasons::GARBAGE_COLLECTION_FAILED,
                format!("garbage collection for deleted resource failed: {}", err),
            )
        })?;
        if deleted.is_some() {
            self.ctx
                .events
                .publish(
                    &object_reference(obj, KIND),
                    EVENT_TYPE_NORMAL,
                    events::reasons::GARBAGE_COLLECTION_SUCCEEDED,
                    "garbage collected artifacts for deleted resource",
                    None,
                )
                .await;
        }
        remove_finalizer(api, obj, SOURCE_FINALIZER).await
    }

    async fn garbage_collect(&self, obj: &OCIRepository) -> Result<(), ReconcileError> {
        let Some(artifact) = obj.artifact().cloned() else {
            return Ok(());
        };
        let storage = Arc::clone(&self.ctx.storage);
        let deleted = tokio::task::spawn_blocking(move || {
            storage.garbage_collect(&artifact, GC_LOCK_TIMEOUT)
        })
        .await
        .map_err(|err| ReconcileError::generic(reasons::FAILED, err.to_string()))?
        .map_err(|err| {
            ReconcileError::generic(
                events::reasons::GARBAGE_COLLECTION_FAILED,
                format!("garbage collection of artifacts failed: {}", err),
            )
        })?;
        if !deleted.is_empty() {
            metrics::GC_DELETED_FILES_TOTAL
                .with_label_values(&[KIND])
                .inc_by(deleted.len() as u64);
            self.ctx
                .events
                .publish(
                    &object_reference(obj, KIND),
                    EVENT_TYPE_NORMAL,
                    events::reasons::GARBAGE_COLLECTION_SUCCEEDED,
                    &format!("garbage collected {} artifacts", deleted.len()),
                    None,
                )
                .await;
        }
        Ok(())
    }

    /// Verifies the artifact signature, marking SourceVerified on failure.
    async fn verify_signature(
        &self,
        obj: &mut OCIRepository,
        verify: crate::models::VerificationSpec,
        registry: &mut RegistryClient,
        repo_path: &str,
        digest_hex: &str,
        generation: i64,
    ) -> Result<(), ReconcileError> {
        let verification_failed = |obj: &mut OCIRepository, message: String| {
            conditions::mark_false(
                obj,
                types::SOURCE_VERIFIED,
                reasons::VERIFICATION_ERROR,
                message.as_str(),
                generation,
            );
            ReconcileError::stalling(reasons::VERIFICATION_ERROR, message)
        };

        if let Err(err) = CosignVerifier::check_config(&verify.provider, obj.spec.insecure) {
            let message = err.to_string();
            return Err(verification_failed(obj, message));
        }

        let provider_label = if verify.secret_ref.is_none() {
            format!("{} keyless", verify.provider)
        } else {
            verify.provider.clone()
        };

        let verifier = match &verify.secret_ref {
            Some(secret_ref) => {
                let namespace = obj.namespace().unwrap_or_default();
                let api: Api<k8s_openapi::api::core::v1::Secret> =
                    Api::namespaced(self.ctx.client.clone(), &namespace);
                let secret = api.get(&secret_ref.name).await.map_err(|err| {
                    verification_failed(
                        obj,
                        format!("failed to get verification secret '{}': {}", secret_ref.name, err),
                    )
                })?;
                CosignVerifier::from_secret(&secret)
                    .map_err(|err| verification_failed(obj, err.to_string()))?
            }
            None => CosignVerifier::keyless(),
        };

        verifier
            .verify(registry, repo_path, digest_hex)
            .await
            .map_err(|err| {
                verification_failed(
                    obj,
                    format!(
                        "failed to verify the signature using provider '{}': {}",
                        provider_label, err
                    ),
                )
            })
    }

    async fn patch_status(
        &self,
        api: &Api<OCIRepository>,
        obj: &OCIRepository,
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

/// Writes the staged content into storage under the artifact lock.
fn persist_artifact(
    storage: &Storage,
    artifact: &mut Artifact,
    staging: &Path,
    copied_path: Option<String>,
    ignore_spec: Option<String>,
) -> Result<(), ReconcileError> {
    if !staging.is_dir() {
        return Err(ReconcileError::generic(
            "InvalidPath",
            format!("source path '{}' is not a directory", staging.display()),
        ));
    }
    storage.mkdir_all(artifact).map_err(|err| {
        ReconcileError::generic(
            "DirCreationFailed",
            format!("failed to create artifact directory: {}", err),
        )
    })?;
    let _lock = storage.lock(artifact, GC_LOCK_TIMEOUT).map_err(|err| {
        ReconcileError::generic(
            "AcquireLockFailed",
            format!("failed to acquire lock for artifact: {}", err),
        )
    })?;

    match copied_path {
        Some(file_name) => storage
            .copy_from_path(artifact, &staging.join(file_name))
            .map_err(|err| {
                ReconcileError::generic(
                    "ArchiveOperationFailed",
                    format!("unable to copy artifact to storage: {}", err),
                )
            }),
        None => {
            let patterns = ignore::default_patterns(ignore_spec.as_deref());
            let filter =
                move |rel: &str, is_dir: bool| ignore::is_ignored(&patterns, rel, is_dir);
            storage
                .archive(artifact, staging, Some(&filter))
                .map_err(|err| {
                    ReconcileError::generic(
                        "ArchiveOperationFailed",
                        format!("unable to archive artifact to storage: {}", err),
                    )
                })
        }
    }
}

fn mark_artifact_in_storage(obj: &mut OCIRepository, revision: &str, generation: i64) {
    if has_revision(obj.artifact(), revision) && !obj.content_config_changed() {
        conditions::delete(obj, types::ARTIFACT_OUTDATED);
        conditions::mark_true(
            obj,
            types::ARTIFACT_IN_STORAGE,
            reasons::SUCCEEDED,
            format!("stored artifact for revision '{}'", revision),
            generation,
        );
    }
}
