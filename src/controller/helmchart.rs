//! HelmChart reconciler: materializes charts from HelmRepository,
//! GitRepository and Bucket sources into storage artifacts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use super::{
    ensure_finalizer, get_optional, interval_of, lowest_requeuing, object_reference,
    reconcile_requested, remove_finalizer, requested_at, short_revision, timeout_of, Context,
    PhaseResult, ReconcileOutcome, GC_LOCK_TIMEOUT,
};
use crate::builder::{
    chart, Build, BuildError, BuildErrorReason, BuildOptions, ChartRepository, DependencyManager,
    HttpChartRepository, LocalBuilder, LocalReference, OciChartRepository, RemoteBuilder,
    RemoteReference, RepositoryResolver,
};
use crate::conditions::{self, reasons, types};
use crate::credentials::{CloudProvider, CredentialProvider};
use crate::error::ReconcileError;
use crate::events::{self, EVENT_TYPE_NORMAL, EVENT_TYPE_WARNING};
use crate::index::ObjectKey;
use crate::metrics;
use crate::models::{
    artifact::has_revision, Artifact, HelmChart, HelmRepository, ReconcileStrategy, Source,
    SourceKind, VerificationSpec, SOURCE_FINALIZER,
};
use crate::registry::{parse_repository_url, RegistryClient};
use crate::verify::CosignVerifier;

const KIND: &str = "HelmChart";

enum Phase {
    Storage,
    Source,
    Artifact,
}

/// A failed build step: either a classified chart build error, or an error
/// that already recorded its own conditions.
enum BuildFailure {
    Build(BuildError),
    Other(ReconcileError),
}

impl From<BuildError> for BuildFailure {
    fn from(err: BuildError) -> Self {
        BuildFailure::Build(err)
    }
}

pub struct HelmChartReconciler {
    ctx: Arc<Context>,
}

impl HelmChartReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Runs one reconciliation for the key. Returns the outcome and the
    /// object's poll interval for scheduling.
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
        let api: Api<HelmChart> = Api::namespaced(self.ctx.client.clone(), &key.namespace);
        let Some(mut obj) = get_optional(&api, &key.name).await? else {
            self.ctx.index.forget_chart(key).await;
            return Ok((ReconcileOutcome::Finished, self.ctx.config.default_requeue_interval));
        };
        let interval = interval_of(
            obj.spec.interval.as_deref(),
            self.ctx.config.default_requeue_interval,
        );

        metrics::SUSPENDED_RESOURCES
            .with_label_values(&[KIND, &key.namespace, &key.name])
            .set(obj.spec.suspend as i64);

        // Finalizer first, to win the race against deletion.
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

        self.ctx.index.index_chart(&obj).await;

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

        // Snapshot for change notification after the run.
        let old_checksum = obj.artifact().and_then(|a| a.checksum.clone());
        let had_failure = [
            types::FETCH_FAILED,
            types::BUILD_FAILED,
            types::STORAGE_OPERATION_FAILED,
        ]
        .iter()
        .any(|t| conditions::is_true(&obj, t));

        conditions::mark_reconciling(
            &mut obj,
            reasons::PROGRESSING,
            "reconciliation in progress",
            generation,
        );
        if force {
            // Surface progress before the (possibly slow) network phases.
            self.patch_status(&api, &obj).await?;
        }

        // Staging area for this run; dropped (and cleaned) with it.
        let staging = tempfile::tempdir().map_err(|err| {
            ReconcileError::generic(
                "DirCreationFailed",
                format!("failed to create working directory: {}", err),
            )
        })?;

        let mut result = PhaseResult::Empty;
        let mut phase_err: Option<ReconcileError> = None;
        let mut build = Build::default();

        let phases = [Phase::Storage, Phase::Source, Phase::Artifact];
        for phase in phases {
            let phase_result = match phase {
                Phase::Storage => self.reconcile_storage(&mut obj, generation).await,
                Phase::Source => {
                    self.reconcile_source(&mut obj, &mut build, force, generation, staging.path())
                        .await
                }
                Phase::Artifact => self.reconcile_artifact(&mut obj, &build, generation).await,
            };
            match phase_result {
                Ok(PhaseResult::Requeue) => {
                    result = PhaseResult::Requeue;
                    break;
                }
                Ok(r) => result = lowest_requeuing(result, r),
                Err(err) => {
                    phase_err = Some(err);
                    break;
                }
            }
        }

        self.summarize(&api, &mut obj, &build, result, &phase_err, generation, old_checksum, had_failure)
            .await?;

        match phase_err {
            Some(err) => Err(err),
            None if result == PhaseResult::Requeue => {
                Ok((ReconcileOutcome::RequeueImmediate, interval))
            }
            None => Ok((ReconcileOutcome::RequeueAfter(interval), interval)),
        }
    }

    /// SUMMARIZE: collapse conditions into Ready, mirror the reconcile
    /// request, patch the status once, emit events.
    #[allow(clippy::too_many_arguments)]
    async fn summarize(
        &self,
        api: &Api<HelmChart>,
        obj: &mut HelmChart,
        build: &Build,
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

        // New-artifact and failure-recovery notifications.
        if phase_err.is_none() && result == PhaseResult::Success {
            if let Some(artifact) = obj.artifact() {
                let new_artifact = old_checksum != artifact.checksum;
                let recovered = had_failure && !new_artifact;
                if new_artifact || recovered {
                    self.ctx
                        .events
                        .publish(
                            &obj_ref,
                            EVENT_TYPE_NORMAL,
                            reason_for_build(build),
                            &build.summary(),
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

    /// STORAGE: garbage collect, drop a vanished artifact, refresh URLs.
    async fn reconcile_storage(
        &self,
        obj: &mut HelmChart,
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

        // Keep advertised URLs aligned with the configured hostname.
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

    /// SOURCE: resolve the source object and run the matching builder.
    async fn reconcile_source(
        &self,
        obj: &mut HelmChart,
        build: &mut Build,
        force: bool,
        generation: i64,
        staging: &std::path::Path,
    ) -> Result<PhaseResult, ReconcileError> {
        // A failed verification is recalculated from scratch.
        if conditions::is_false(obj, types::SOURCE_VERIFIED) {
            conditions::delete(obj, types::SOURCE_VERIFIED);
        }

        let source = match self.get_source(obj).await {
            Ok(source) => source,
            Err(err) => {
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

        // Git and Bucket sources must have produced an artifact tarball in
        // storage; repositories are fetched over the network instead.
        let tarball_source = matches!(source.kind(), SourceKind::GitRepository | SourceKind::Bucket);
        let source_artifact_ok = match source.artifact() {
            Some(artifact) => self.ctx.storage.artifact_exists(artifact),
            None => false,
        };
        if tarball_source && !source_artifact_ok {
            let msg = format!(
                "no artifact available for {} source '{}'",
                obj.spec.source_ref.kind, obj.spec.source_ref.name
            );
            conditions::mark_true(
                obj,
                types::FETCH_FAILED,
                reasons::NO_SOURCE_ARTIFACT,
                msg.as_str(),
                generation,
            );
            debug!("{}", msg);
            return Ok(PhaseResult::Requeue);
        }

        if let Some(artifact) = source.artifact() {
            let key = ObjectKey::new(obj.namespace().unwrap_or_default(), obj.name_any());
            obj.status
                .get_or_insert_with(Default::default)
                .observed_source_artifact_revision = Some(artifact.revision.clone());
            self.ctx
                .index
                .record_observed_revision(&key, &artifact.revision)
                .await;
        }

        let out = staging.join("chart.tgz");
        let build_result = match &source {
            Source::HelmRepository(repo) => {
                self.build_from_helm_repository(obj, repo, force, generation, out)
                    .await
            }
            Source::GitRepository(_) | Source::Bucket(_) => {
                let Some(artifact) = source.artifact().cloned() else {
                    return Ok(PhaseResult::Requeue);
                };
                self.build_from_tarball_artifact(obj, &artifact, force, staging, out)
                    .await
            }
        };

        match build_result {
            Ok(b) => {
                *build = b;
                observe_chart_build(obj, build, None, generation);
                if build.resolved_dependencies > 0 {
                    self.ctx
                        .events
                        .publish(
                            &object_reference(obj, KIND),
                            EVENT_TYPE_NORMAL,
                            events::reasons::RESOLVED_DEPENDENCIES,
                            &format!("resolved {} chart dependencies", build.resolved_dependencies),
                            None,
                        )
                        .await;
                }
                Ok(PhaseResult::Success)
            }
            Err(BuildFailure::Build(err)) => {
                observe_chart_build(obj, build, Some(&err), generation);
                if err.is_persistent() {
                    Err(ReconcileError::stalling(err.reason.as_str(), err.message))
                } else {
                    Err(ReconcileError::generic(err.reason.as_str(), err.message))
                }
            }
            Err(BuildFailure::Other(err)) => Err(err),
        }
    }

    /// ARTIFACT: persist the build under lock and publish it on the status.
    async fn reconcile_artifact(
        &self,
        obj: &mut HelmChart,
        build: &Build,
        generation: i64,
    ) -> Result<PhaseResult, ReconcileError> {
        if !build.complete() {
            return Ok(PhaseResult::Requeue);
        }

        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let mut artifact = self.ctx.storage.artifact_for(
            KIND,
            &namespace,
            &name,
            &build.version,
            &format!("{}-{}.tgz", build.name, build.version),
        );

        // The cached chart already is the current artifact.
        if let Some(current) = obj.artifact() {
            if self.ctx.storage.local_path(current) == build.path {
                self.ctx
                    .events
                    .publish(
                        &object_reference(obj, KIND),
                        EVENT_TYPE_NORMAL,
                        events::reasons::ARTIFACT_UP_TO_DATE,
                        &format!(
                            "artifact up-to-date with remote revision: '{}'",
                            artifact.revision
                        ),
                        None,
                    )
                    .await;
                mark_artifact_in_storage(obj, build, generation);
                return Ok(PhaseResult::Success);
            }
        }

        let storage = Arc::clone(&self.ctx.storage);
        let build_path = build.path.clone();
        let persisted = tokio::task::spawn_blocking(move || -> Result<Artifact, ReconcileError> {
            storage.mkdir_all(&artifact).map_err(|err| {
                ReconcileError::generic(
                    "DirCreationFailed",
                    format!("failed to create artifact directory: {}", err),
                )
            })?;
            let _lock = storage.lock(&artifact, GC_LOCK_TIMEOUT).map_err(|err| {
                ReconcileError::generic(
                    "AcquireLockFailed",
                    format!("failed to acquire lock for artifact: {}", err),
                )
            })?;
            storage.copy_from_path(&mut artifact, &build_path).map_err(|err| {
                ReconcileError::generic(
                    "ArchiveOperationFailed",
                    format!("unable to copy Helm chart to storage: {}", err),
                )
            })?;
            Ok(artifact)
        })
        .await
        .map_err(|err| ReconcileError::generic(reasons::FAILED, err.to_string()))?;

        let artifact = match persisted {
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

        metrics::ARTIFACTS_STORED_TOTAL.with_label_values(&[KIND]).inc();
        {
            let status = obj.status.get_or_insert_with(Default::default);
            status.artifact = Some(artifact.clone());
            status.observed_chart_name = Some(build.name.clone());
        }

        match self.ctx.storage.symlink(&artifact, "latest.tar.gz") {
            Ok(url) => {
                obj.status.get_or_insert_with(Default::default).url = Some(url);
            }
            Err(err) => warn!(error = %err, "failed to update status URL symlink"),
        }

        conditions::delete(obj, types::STORAGE_OPERATION_FAILED);
        mark_artifact_in_storage(obj, build, generation);
        Ok(PhaseResult::Success)
    }

    /// DELETING: the artifact subtree is removed before the finalizer.
    async fn reconcile_delete(
        &self,
        api: &Api<HelmChart>,
        obj: &HelmChart,
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

    async fn garbage_collect(&self, obj: &HelmChart) -> Result<(), ReconcileError> {
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

    /// Fetches the referenced source object.
    async fn get_source(&self, obj: &HelmChart) -> Result<Source, ReconcileError> {
        let namespace = obj.namespace().unwrap_or_default();
        let name = &obj.spec.source_ref.name;
        let kind: SourceKind = obj
            .spec
            .source_ref
            .kind
            .parse()
            .map_err(|err: crate::models::UnsupportedSourceKind| {
                ReconcileError::stalling(reasons::UNSUPPORTED_SOURCE_KIND, err.to_string())
            })?;

        let not_found = || {
            ReconcileError::generic(
                "SourceUnavailable",
                format!("failed to get source: {} '{}' not found", kind, name),
            )
        };
        match kind {
            SourceKind::HelmRepository => {
                let api: Api<HelmRepository> = Api::namespaced(self.ctx.client.clone(), &namespace);
                let repo = get_optional(&api, name).await?.ok_or_else(not_found)?;
                Ok(Source::HelmRepository(Box::new(repo)))
            }
            SourceKind::GitRepository => {
                let api: Api<crate::models::GitRepository> =
                    Api::namespaced(self.ctx.client.clone(), &namespace);
                let repo = get_optional(&api, name).await?.ok_or_else(not_found)?;
                Ok(Source::GitRepository(Box::new(repo)))
            }
            SourceKind::Bucket => {
                let api: Api<crate::models::Bucket> =
                    Api::namespaced(self.ctx.client.clone(), &namespace);
                let bucket = get_optional(&api, name).await?.ok_or_else(not_found)?;
                Ok(Source::Bucket(Box::new(bucket)))
            }
        }
    }

    /// Builds the chart from a HelmRepository, OCI or classic.
    async fn build_from_helm_repository(
        &self,
        obj: &mut HelmChart,
        repo: &HelmRepository,
        force: bool,
        generation: i64,
        out: PathBuf,
    ) -> Result<Build, BuildFailure> {
        let namespace = obj.namespace().unwrap_or_default();
        let timeout = timeout_of(repo.spec.timeout.as_deref(), self.ctx.config.default_timeout);

        let mut opts = BuildOptions {
            values_files: obj.spec.values_files.clone(),
            force,
            cached_chart: obj.artifact().map(|a| self.ctx.storage.local_path(a)),
            verify: obj.spec.verify.is_some(),
            version_metadata: None,
        };
        // Values overrides change artifact content per generation; encode
        // the generation so consumers notice.
        if !opts.values_files.is_empty() {
            opts.version_metadata = Some(generation.to_string());
        }

        let provider: CloudProvider = repo
            .spec
            .provider
            .as_deref()
            .unwrap_or("generic")
            .parse()
            .unwrap_or_default();
        let credential_provider = CredentialProvider::new(self.ctx.client.clone());

        let reference = RemoteReference {
            name: obj.spec.chart.clone(),
            version: obj.spec.version.clone(),
        };

        if repo.is_oci() {
            let repo_path = match parse_repository_url(&repo.spec.url) {
                Ok(path) => path,
                Err(err) => {
                    let err = ReconcileError::stalling(reasons::URL_INVALID, err.to_string());
                    conditions::mark_true(
                        obj,
                        types::FETCH_FAILED,
                        err.reason(),
                        err.to_string(),
                        generation,
                    );
                    return Err(BuildFailure::Other(err));
                }
            };

            let host = repo_path.split('/').next().unwrap_or_default().to_string();
            let mut credentials = match credential_provider
                .resolve(&namespace, repo.spec.secret_ref.as_ref(), None, provider, &host)
                .await
            {
                Ok(credentials) => credentials,
                Err(err) => {
                    let err =
                        ReconcileError::generic(reasons::AUTHENTICATION_FAILED, err.to_string());
                    conditions::mark_true(
                        obj,
                        types::FETCH_FAILED,
                        err.reason(),
                        err.to_string(),
                        generation,
                    );
                    return Err(BuildFailure::Other(err));
                }
            };

            let mut registry = RegistryClient::new(false, None);
            if let Some(basic) = &credentials.basic {
                registry.with_basic_auth(&basic.username, &basic.password);
                // Some registry tooling reads credentials from disk; the
                // file is dropped with `credentials` on every exit path.
                if let Err(err) = credentials.write_docker_config(&host) {
                    warn!(error = %err, "failed to write registry credentials file");
                }
                if let Err(err) = registry.login(&repo_path).await {
                    let err = ReconcileError::generic(
                        reasons::AUTHENTICATION_FAILED,
                        format!("failed to login to OCI registry: {}", err),
                    );
                    conditions::mark_true(
                        obj,
                        types::FETCH_FAILED,
                        err.reason(),
                        err.to_string(),
                        generation,
                    );
                    return Err(BuildFailure::Other(err));
                }
            }

            let mut chart_repo = OciChartRepository::new(repo_path, registry);
            if let Some(verify) = &obj.spec.verify {
                let verifier = self
                    .make_verifier(&namespace, verify)
                    .await
                    .map_err(BuildFailure::Build)?;
                chart_repo = chart_repo.with_verifier(verifier);
            }

            run_remote_build(RemoteBuilder::new(chart_repo), &reference, out, &opts, timeout).await
        } else {
            let credentials = match repo.spec.secret_ref.as_ref() {
                Some(secret_ref) => match credential_provider
                    .resolve(&namespace, Some(secret_ref), None, CloudProvider::Generic, "")
                    .await
                {
                    Ok(resolved) => resolved.basic,
                    Err(err) => {
                        let err = ReconcileError::generic(
                            reasons::AUTHENTICATION_FAILED,
                            err.to_string(),
                        );
                        conditions::mark_true(
                            obj,
                            types::FETCH_FAILED,
                            err.reason(),
                            err.to_string(),
                            generation,
                        );
                        return Err(BuildFailure::Other(err));
                    }
                },
                None => None,
            };

            let chart_repo = HttpChartRepository::new(&repo.spec.url, timeout, credentials)
                .map_err(BuildFailure::Build)?
                .with_pass_credentials(repo.spec.pass_credentials.unwrap_or(false));
            run_remote_build(RemoteBuilder::new(chart_repo), &reference, out, &opts, timeout).await
        }
    }

    /// Builds the chart from an extracted Git or Bucket source artifact.
    async fn build_from_tarball_artifact(
        &self,
        obj: &mut HelmChart,
        source_artifact: &Artifact,
        force: bool,
        staging: &std::path::Path,
        out: PathBuf,
    ) -> Result<Build, BuildFailure> {
        let source_dir = staging.join("source");
        let bytes = std::fs::read(self.ctx.storage.local_path(source_artifact)).map_err(|err| {
            BuildFailure::Build(BuildError::new(
                BuildErrorReason::ChartPull,
                format!("failed to open source artifact: {}", err),
            ))
        })?;
        chart::extract_tgz(&bytes, &source_dir).map_err(|err| {
            BuildFailure::Build(BuildError::new(
                BuildErrorReason::ChartPull,
                format!("source artifact untar error: {}", err),
            ))
        })?;

        let mut opts = BuildOptions {
            values_files: obj.spec.values_files.clone(),
            force,
            cached_chart: obj.artifact().map(|a| self.ctx.storage.local_path(a)),
            verify: false,
            version_metadata: None,
        };
        if obj.spec.reconcile_strategy == ReconcileStrategy::Revision {
            opts.version_metadata = Some(short_revision(&source_artifact.revision, true));
        }
        if !opts.values_files.is_empty() {
            let generation = obj.meta().generation.unwrap_or(0).to_string();
            opts.version_metadata = Some(match opts.version_metadata.take() {
                Some(existing) => format!("{}.{}", existing, generation),
                None => generation,
            });
        }

        let resolver = NamespacedRepositoryResolver {
            ctx: Arc::clone(&self.ctx),
            namespace: obj.namespace().unwrap_or_default(),
        };
        let builder = LocalBuilder::new(Some(DependencyManager::new(Box::new(resolver))));
        let reference = LocalReference {
            work_dir: source_dir,
            path: obj.spec.chart.clone(),
        };
        builder
            .build(&reference, out, &opts)
            .await
            .map_err(BuildFailure::Build)
    }

    /// Builds the signature verifier declared by the chart spec.
    async fn make_verifier(
        &self,
        namespace: &str,
        verify: &VerificationSpec,
    ) -> Result<CosignVerifier, BuildError> {
        CosignVerifier::check_config(&verify.provider, false).map_err(|err| {
            BuildError::new(BuildErrorReason::ChartVerification, err.to_string())
        })?;
        match &verify.secret_ref {
            Some(secret_ref) => {
                let api: Api<k8s_openapi::api::core::v1::Secret> =
                    Api::namespaced(self.ctx.client.clone(), namespace);
                let secret = api.get(&secret_ref.name).await.map_err(|err| {
                    BuildError::new(
                        BuildErrorReason::ChartVerification,
                        format!("failed to get verification secret '{}': {}", secret_ref.name, err),
                    )
                })?;
                CosignVerifier::from_secret(&secret).map_err(|err| {
                    BuildError::new(BuildErrorReason::ChartVerification, err.to_string())
                })
            }
            None => Ok(CosignVerifier::keyless()),
        }
    }

    async fn patch_status(
        &self,
        api: &Api<HelmChart>,
        obj: &HelmChart,
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

/// Namespace-scoped resolver for chart dependency repositories. Declared
/// HelmRepository objects contribute their credentials; unknown URLs get
/// anonymous defaults.
struct NamespacedRepositoryResolver {
    ctx: Arc<Context>,
    namespace: String,
}

#[async_trait]
impl RepositoryResolver for NamespacedRepositoryResolver {
    async fn repository(&self, url: &str) -> Result<Box<dyn ChartRepository>, BuildError> {
        let declared = match self.ctx.index.repository_by_url(&self.namespace, url).await {
            Some(key) => {
                let api: Api<HelmRepository> =
                    Api::namespaced(self.ctx.client.clone(), &self.namespace);
                get_optional(&api, &key.name).await.ok().flatten()
            }
            None => None,
        };
        let timeout = timeout_of(
            declared.as_ref().and_then(|r| r.spec.timeout.as_deref()),
            self.ctx.config.default_timeout,
        );

        let credentials = match declared.as_ref().and_then(|r| r.spec.secret_ref.as_ref()) {
            Some(secret_ref) => {
                let provider = CredentialProvider::new(self.ctx.client.clone());
                provider
                    .resolve(&self.namespace, Some(secret_ref), None, CloudProvider::Generic, "")
                    .await
                    .map_err(|err| {
                        BuildError::new(BuildErrorReason::DependencyBuild, err.to_string())
                    })?
                    .basic
            }
            None => None,
        };

        if url.starts_with(crate::models::OCI_REPOSITORY_PREFIX) {
            let repo_path = parse_repository_url(url).map_err(|err| {
                BuildError::new(BuildErrorReason::DependencyBuild, err.to_string())
            })?;
            let mut registry = RegistryClient::new(false, None);
            if let Some(basic) = &credentials {
                registry.with_basic_auth(&basic.username, &basic.password);
            }
            Ok(Box::new(OciChartRepository::new(repo_path, registry)))
        } else {
            let pass_credentials = declared
                .as_ref()
                .and_then(|r| r.spec.pass_credentials)
                .unwrap_or(false);
            Ok(Box::new(
                HttpChartRepository::new(url, timeout, credentials)?
                    .with_pass_credentials(pass_credentials),
            ))
        }
    }
}

/// Runs a remote build under the repository timeout.
async fn run_remote_build<R: ChartRepository>(
    mut builder: RemoteBuilder<R>,
    reference: &RemoteReference,
    out: PathBuf,
    opts: &BuildOptions,
    timeout: Duration,
) -> Result<Build, BuildFailure> {
    match tokio::time::timeout(timeout, builder.build(reference, out, opts)).await {
        Ok(result) => result.map_err(BuildFailure::Build),
        Err(_) => Err(BuildFailure::Build(BuildError::new(
            BuildErrorReason::ChartPull,
            format!("chart build timed out after {:?}", timeout),
        ))),
    }
}

/// Records the build observations on the object, mirroring both success
/// and failure onto the conditions.
fn observe_chart_build(
    obj: &mut HelmChart,
    build: &Build,
    err: Option<&BuildError>,
    generation: i64,
) {
    if build.has_metadata() {
        let name_changed = obj
            .status
            .as_ref()
            .and_then(|s| s.observed_chart_name.as_deref())
            != Some(build.name.as_str());
        if name_changed || !has_revision(obj.artifact(), &build.version) {
            if obj.artifact().is_some() {
                conditions::mark_true(
                    obj,
                    types::ARTIFACT_OUTDATED,
                    reasons::NEW_CHART,
                    build.summary(),
                    generation,
                );
            }
            conditions::mark_reconciling(
                obj,
                reasons::PROGRESSING,
                format!("building artifact: {}", build.summary()),
                generation,
            );
        }
    }

    if build.complete() {
        conditions::delete(obj, types::FETCH_FAILED);
        conditions::delete(obj, types::BUILD_FAILED);
        if build.verified {
            conditions::mark_true(
                obj,
                types::SOURCE_VERIFIED,
                reasons::SUCCEEDED,
                format!("verified signature of version {}", build.version),
                generation,
            );
        }
    }

    if obj.spec.verify.is_none() {
        conditions::delete(obj, types::SOURCE_VERIFIED);
    }

    if let Some(err) = err {
        match err.reason {
            BuildErrorReason::ChartMetadataPatch
            | BuildErrorReason::ValuesFilesMerge
            | BuildErrorReason::DependencyBuild
            | BuildErrorReason::ChartPackage => {
                conditions::delete(obj, types::FETCH_FAILED);
                conditions::mark_true(
                    obj,
                    types::BUILD_FAILED,
                    err.reason.as_str(),
                    err.to_string(),
                    generation,
                );
            }
            BuildErrorReason::ChartVerification => {
                conditions::delete(obj, types::FETCH_FAILED);
                conditions::mark_true(
                    obj,
                    types::BUILD_FAILED,
                    err.reason.as_str(),
                    err.to_string(),
                    generation,
                );
                conditions::mark_false(
                    obj,
                    types::SOURCE_VERIFIED,
                    reasons::VERIFICATION_ERROR,
                    err.to_string(),
                    generation,
                );
            }
            _ => {
                conditions::delete(obj, types::BUILD_FAILED);
                conditions::mark_true(
                    obj,
                    types::FETCH_FAILED,
                    err.reason.as_str(),
                    err.to_string(),
                    generation,
                );
            }
        }
    }
}

fn mark_artifact_in_storage(obj: &mut HelmChart, build: &Build, generation: i64) {
    let name_matches = obj
        .status
        .as_ref()
        .and_then(|s| s.observed_chart_name.as_deref())
        == Some(build.name.as_str());
    if name_matches && has_revision(obj.artifact(), &build.version) {
        conditions::delete(obj, types::ARTIFACT_OUTDATED);
        conditions::mark_true(
            obj,
            types::ARTIFACT_IN_STORAGE,
            reason_for_build(build),
            build.summary(),
            generation,
        );
    }
}

fn reason_for_build(build: &Build) -> &'static str {
    if !build.complete() {
        return reasons::SUCCEEDED;
    }
    if build.packaged {
        events::reasons::CHART_PACKAGE_SUCCEEDED
    } else {
        events::reasons::CHART_PULL_SUCCEEDED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChartSourceReference, HelmChartSpec, HelmChartStatus};

    fn chart_with_status(status: Option<HelmChartStatus>) -> HelmChart {
        let mut chart = HelmChart::new(
            "app",
            HelmChartSpec {
                chart: "podinfo".to_string(),
                version: None,
                source_ref: ChartSourceReference {
                    kind: "HelmRepository".to_string(),
                    name: "podinfo".to_string(),
                },
                interval: None,
                reconcile_strategy: Default::default(),
                values_files: Vec::new(),
                verify: None,
                suspend: false,
            },
        );
        chart.metadata.namespace = Some("default".to_string());
        chart.status = status;
        chart
    }

    fn completed_build() -> Build {
        Build {
            name: "podinfo".to_string(),
            version: "6.2.0".to_string(),
            path: PathBuf::from("/tmp/podinfo-6.2.0.tgz"),
            packaged: false,
            verified: false,
            resolved_dependencies: 0,
        }
    }

    #[test]
    fn successful_build_clears_failure_conditions() {
        let mut obj = chart_with_status(Some(HelmChartStatus::default()));
        conditions::mark_true(&mut obj, types::FETCH_FAILED, "ChartPullFailed", "503", 1);
        conditions::mark_true(&mut obj, types::BUILD_FAILED, "ChartPackageFailed", "x", 1);

        observe_chart_build(&mut obj, &completed_build(), None, 1);

        assert!(conditions::get(&obj, types::FETCH_FAILED).is_none());
        assert!(conditions::get(&obj, types::BUILD_FAILED).is_none());
        // No verify block: the condition stays absent.
        assert!(conditions::get(&obj, types::SOURCE_VERIFIED).is_none());
    }

    #[test]
    fn new_version_marks_artifact_outdated() {
        let mut obj = chart_with_status(Some(HelmChartStatus {
            observed_chart_name: Some("podinfo".to_string()),
            artifact: Some(Artifact {
                revision: "6.1.0".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }));

        observe_chart_build(&mut obj, &completed_build(), None, 2);
        assert!(conditions::is_true(&obj, types::ARTIFACT_OUTDATED));
        assert!(conditions::is_reconciling(&obj));
    }

    #[test]
    fn verification_error_flips_source_verified() {
        let mut obj = chart_with_status(Some(HelmChartStatus::default()));
        obj.spec.verify = Some(VerificationSpec {
            provider: "cosign".to_string(),
            secret_ref: None,
        });

        let err = BuildError::new(
            BuildErrorReason::ChartVerification,
            "no matching signatures were found",
        );
        observe_chart_build(&mut obj, &Build::default(), Some(&err), 1);

        assert!(conditions::is_true(&obj, types::BUILD_FAILED));
        assert!(conditions::is_false(&obj, types::SOURCE_VERIFIED));
        assert!(conditions::get(&obj, types::FETCH_FAILED).is_none());
    }

    #[test]
    fn pull_error_marks_fetch_failed() {
        let mut obj = chart_with_status(Some(HelmChartStatus::default()));
        let err = BuildError::new(BuildErrorReason::ChartPull, "connection reset");
        observe_chart_build(&mut obj, &Build::default(), Some(&err), 1);

        assert!(conditions::is_true(&obj, types::FETCH_FAILED));
        assert!(conditions::get(&obj, types::BUILD_FAILED).is_none());
    }

    #[test]
    fn verified_build_marks_source_verified() {
        let mut obj = chart_with_status(Some(HelmChartStatus::default()));
        obj.spec.verify = Some(VerificationSpec {
            provider: "cosign".to_string(),
            secret_ref: None,
        });
        let build = Build {
            verified: true,
            ..completed_build()
        };
        observe_chart_build(&mut obj, &build, None, 1);
        assert!(conditions::is_true(&obj, types::SOURCE_VERIFIED));
    }

    #[test]
    fn build_reason_follows_packaging() {
        assert_eq!(
            reason_for_build(&completed_build()),
            events::reasons::CHART_PULL_SUCCEEDED
        );
        let packaged = Build {
            packaged: true,
            ..completed_build()
        };
        assert_eq!(
            reason_for_build(&packaged),
            events::reasons::CHART_PACKAGE_SUCCEEDED
        );
    }

    #[test]
    fn artifact_in_storage_requires_matching_observation() {
        let build = completed_build();
        let mut obj = chart_with_status(Some(HelmChartStatus {
            observed_chart_name: Some("podinfo".to_string()),
            artifact: Some(Artifact {
                revision: "6.2.0".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }));
        conditions::mark_true(&mut obj, types::ARTIFACT_OUTDATED, reasons::NEW_CHART, "x", 1);

        mark_artifact_in_storage(&mut obj, &build, 1);
        assert!(conditions::is_true(&obj, types::ARTIFACT_IN_STORAGE));
        assert!(conditions::get(&obj, types::ARTIFACT_OUTDATED).is_none());

        // Mismatched revision: no ArtifactInStorage.
        let mut obj = chart_with_status(Some(HelmChartStatus {
            observed_chart_name: Some("podinfo".to_string()),
            artifact: Some(Artifact {
                revision: "6.1.0".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }));
        mark_artifact_in_storage(&mut obj, &build, 1);
        assert!(!conditions::is_true(&obj, types::ARTIFACT_IN_STORAGE));
    }
}
