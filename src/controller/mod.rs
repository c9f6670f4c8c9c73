//! Per-kind reconcilers and the controller runtime around them.
//!
//! Each reconciler runs a fixed phase order per object: fetch, storage,
//! source, artifact, summarize. Phases return a [`PhaseResult`]; a Requeue
//! short-circuits the rest of the run, an error records its condition and
//! feeds the Ready summarization.

mod helmchart;
mod helmrepository;
mod ocirepository;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{Api, Patch, PatchParams};
use kube::core::ObjectMeta;
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use helmchart::HelmChartReconciler;
pub use helmrepository::HelmRepositoryReconciler;
pub use ocirepository::OCIRepositoryReconciler;

use crate::config::{parse_duration, Config};
use crate::error::ReconcileError;
use crate::events::EventPublisher;
use crate::index::{ChangeIndex, ObjectKey};
use crate::models::{
    Bucket, GitRepository, HelmChart, HelmRepository, OCIRepository, SourceKind,
    RECONCILE_REQUESTED_ANNOTATION,
};
use crate::queue::WorkQueue;
use crate::storage::Storage;

/// Timeout for garbage collection lock acquisition.
pub(crate) const GC_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a single reconcile phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseResult {
    /// Nothing produced; do not progress past this phase's stage.
    Empty,
    /// Short-circuit and retry immediately, without an error.
    Requeue,
    /// The phase completed.
    Success,
}

/// Combines phase results, keeping the most conservative one.
pub(crate) fn lowest_requeuing(current: PhaseResult, next: PhaseResult) -> PhaseResult {
    match (current, next) {
        (PhaseResult::Empty, r) | (r, PhaseResult::Empty) => r,
        (PhaseResult::Requeue, _) | (_, PhaseResult::Requeue) => PhaseResult::Requeue,
        _ => PhaseResult::Success,
    }
}

/// What the work queue should do with the key after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Schedule the next poll after the interval.
    RequeueAfter(Duration),
    /// Retry immediately without backoff.
    RequeueImmediate,
    /// Retry with backoff.
    Retry,
    /// Parked until the object's generation or reconcile request changes.
    Stalled,
    /// Nothing more to do (deleted or not found).
    Finished,
}

/// Shared dependencies of all reconcilers.
pub struct Context {
    pub client: Client,
    pub storage: Arc<Storage>,
    pub index: Arc<ChangeIndex>,
    pub events: Arc<dyn EventPublisher>,
    pub config: Config,
}

/// Gets a resource, mapping 404 to None.
pub(crate) async fn get_optional<K>(api: &Api<K>, name: &str) -> Result<Option<K>, ReconcileError>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(resource) => Ok(Some(resource)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Ensures the finalizer is present. Returns true when it had to be added,
/// in which case the caller requeues.
pub(crate) async fn ensure_finalizer<K>(
    api: &Api<K>,
    obj: &K,
    finalizer: &str,
) -> Result<bool, ReconcileError>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug,
{
    if obj.finalizers().iter().any(|f| f == finalizer) {
        return Ok(false);
    }
    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(finalizer.to_string());
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(true)
}

/// Removes the finalizer, allowing the API server to delete the object.
pub(crate) async fn remove_finalizer<K>(
    api: &Api<K>,
    obj: &K,
    finalizer: &str,
) -> Result<(), ReconcileError>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug,
{
    let finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| *f != finalizer)
        .cloned()
        .collect();
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// The reconcile-requested annotation value, if set.
pub(crate) fn requested_at(meta: &ObjectMeta) -> Option<String> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(RECONCILE_REQUESTED_ANNOTATION))
        .cloned()
}

/// Whether an out-of-band reconciliation was requested and not yet handled.
pub(crate) fn reconcile_requested(meta: &ObjectMeta, last_handled: Option<&str>) -> bool {
    match requested_at(meta) {
        Some(requested) => Some(requested.as_str()) != last_handled,
        None => false,
    }
}

/// The object's declared interval, or the configured default.
pub(crate) fn interval_of(spec_interval: Option<&str>, default: Duration) -> Duration {
    spec_interval.and_then(parse_duration).unwrap_or(default)
}

/// The object's declared timeout, or the configured default.
pub(crate) fn timeout_of(spec_timeout: Option<&str>, default: Duration) -> Duration {
    spec_timeout.and_then(parse_duration).unwrap_or(default)
}

/// Builds the event target reference for a reconciled object.
pub(crate) fn object_reference<K>(obj: &K, kind: &str) -> ObjectReference
where
    K: Resource<DynamicType = ()>,
{
    ObjectReference {
        api_version: Some("source.charthouse.dev/v1".to_string()),
        kind: Some(kind.to_string()),
        namespace: obj.namespace(),
        name: Some(obj.name_any()),
        uid: obj.uid(),
        ..Default::default()
    }
}

/// Git and Bucket revisions may be `branch/sha` pairs; version metadata
/// uses the short form of the SHA part.
pub(crate) fn short_revision(revision: &str, shorten: bool) -> String {
    let rev = revision.rsplit('/').next().unwrap_or(revision);
    if shorten && rev.len() > 12 && rev.chars().all(|c| c.is_ascii_hexdigit()) {
        rev[..12].to_string()
    } else {
        rev.to_string()
    }
}

/// Spawns `count` workers draining the queue through the reconcile closure.
/// A panicking reconciliation is recovered, reported, and retried.
pub(crate) fn spawn_workers<F, Fut>(
    queue: Arc<WorkQueue<ObjectKey>>,
    count: usize,
    reconcile: F,
) -> Vec<JoinHandle<()>>
where
    F: Fn(ObjectKey) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = (ReconcileOutcome, Duration)> + Send + 'static,
{
    (0..count)
        .map(|worker| {
            let queue = Arc::clone(&queue);
            let reconcile = reconcile.clone();
            tokio::spawn(async move {
                while let Some(key) = queue.get().await {
                    let run = tokio::spawn(reconcile(key.clone()));
                    match run.await {
                        Ok((outcome, interval)) => match outcome {
                            ReconcileOutcome::RequeueAfter(delay) => {
                                queue.forget(&key);
                                queue.add_after(key.clone(), delay);
                            }
                            ReconcileOutcome::RequeueImmediate => {
                                queue.forget(&key);
                                queue.add(key.clone());
                            }
                            ReconcileOutcome::Retry => {
                                queue.add_rate_limited(key.clone());
                            }
                            ReconcileOutcome::Stalled => {
                                // No retry until the object changes; the
                                // interval poll still picks it up.
                                queue.forget(&key);
                                queue.add_after(key.clone(), interval);
                            }
                            ReconcileOutcome::Finished => {
                                queue.forget(&key);
                            }
                        },
                        Err(join_err) => {
                            error!(worker, key = %key, error = %join_err, "reconciliation panicked");
                            queue.add_rate_limited(key.clone());
                        }
                    }
                    queue.done(&key);
                }
            })
        })
        .collect()
}

fn key_of<K: Resource<DynamicType = ()>>(obj: &K) -> ObjectKey {
    ObjectKey::new(obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Starts the watchers and worker pools for all three reconciled kinds.
pub async fn start_controllers(config: Config) -> Result<JoinHandle<()>> {
    let client = Client::try_default().await?;
    let storage = Arc::new(Storage::new(
        &config.storage_root,
        config.storage_hostname.clone(),
        config.artifact_retention_ttl,
        config.artifact_retention_records,
    )?);
    let index = Arc::new(ChangeIndex::new());
    let events: Arc<dyn EventPublisher> = Arc::new(crate::events::KubeEventPublisher::new(
        client.clone(),
        "charthouse",
    ));
    let ctx = Arc::new(Context {
        client: client.clone(),
        storage,
        index,
        events,
        config,
    });

    info!("starting source controllers");

    let chart_queue: Arc<WorkQueue<ObjectKey>> = Arc::new(WorkQueue::default());
    let oci_queue: Arc<WorkQueue<ObjectKey>> = Arc::new(WorkQueue::default());
    let repo_queue: Arc<WorkQueue<ObjectKey>> = Arc::new(WorkQueue::default());

    let mut handles = Vec::new();

    // HelmChart workers and watcher.
    {
        let reconciler = Arc::new(HelmChartReconciler::new(Arc::clone(&ctx)));
        handles.extend(spawn_workers(
            Arc::clone(&chart_queue),
            ctx.config.workers,
            move |key| {
                let reconciler = Arc::clone(&reconciler);
                async move { reconciler.reconcile(key).await }
            },
        ));

        let api: Api<HelmChart> = Api::all(client.clone());
        let queue = Arc::clone(&chart_queue);
        let index = Arc::clone(&ctx.index);
        handles.push(tokio::spawn(async move {
            let mut stream = Box::pin(watcher(api, watcher::Config::default()));
            while let Some(event) = stream.next().await {
                match event {
                    Ok(watcher::Event::Applied(chart)) => {
                        index.index_chart(&chart).await;
                        queue.add(key_of(&chart));
                    }
                    Ok(watcher::Event::Deleted(chart)) => {
                        let key = key_of(&chart);
                        index.forget_chart(&key).await;
                        queue.add(key);
                    }
                    Ok(watcher::Event::Restarted(charts)) => {
                        for chart in charts {
                            index.index_chart(&chart).await;
                            queue.add(key_of(&chart));
                        }
                    }
                    Err(err) => warn!(error = %err, "HelmChart watch error"),
                }
            }
        }));
    }

    // OCIRepository workers and watcher.
    {
        let reconciler = Arc::new(OCIRepositoryReconciler::new(Arc::clone(&ctx)));
        handles.extend(spawn_workers(
            Arc::clone(&oci_queue),
            ctx.config.workers,
            move |key| {
                let reconciler = Arc::clone(&reconciler);
                async move { reconciler.reconcile(key).await }
            },
        ));

        let api: Api<OCIRepository> = Api::all(client.clone());
        let queue = Arc::clone(&oci_queue);
        handles.push(tokio::spawn(async move {
            let mut stream = Box::pin(watcher(api, watcher::Config::default()));
            while let Some(event) = stream.next().await {
                match event {
                    Ok(watcher::Event::Applied(repo)) | Ok(watcher::Event::Deleted(repo)) => {
                        queue.add(key_of(&repo));
                    }
                    Ok(watcher::Event::Restarted(repos)) => {
                        for repo in repos {
                            queue.add(key_of(&repo));
                        }
                    }
                    Err(err) => warn!(error = %err, "OCIRepository watch error"),
                }
            }
        }));
    }

    // HelmRepository workers and watcher. Repository updates also fan out
    // to the HelmCharts whose observed source revision drifted.
    {
        let reconciler = Arc::new(HelmRepositoryReconciler::new(Arc::clone(&ctx)));
        handles.extend(spawn_workers(
            Arc::clone(&repo_queue),
            ctx.config.workers,
            move |key| {
                let reconciler = Arc::clone(&reconciler);
                async move { reconciler.reconcile(key).await }
            },
        ));

        let api: Api<HelmRepository> = Api::all(client.clone());
        let queue = Arc::clone(&repo_queue);
        let chart_queue = Arc::clone(&chart_queue);
        let index = Arc::clone(&ctx.index);
        handles.push(tokio::spawn(async move {
            let mut stream = Box::pin(watcher(api, watcher::Config::default()));
            while let Some(event) = stream.next().await {
                match event {
                    Ok(watcher::Event::Applied(repo)) => {
                        index.index_repository(&repo).await;
                        queue.add(key_of(&repo));
                        enqueue_dependents(
                            &index,
                            &chart_queue,
                            SourceKind::HelmRepository,
                            &key_of(&repo),
                            repo.artifact().map(|a| a.revision.clone()),
                        )
                        .await;
                    }
                    Ok(watcher::Event::Deleted(repo)) => {
                        let key = key_of(&repo);
                        index.forget_repository(&key).await;
                        queue.add(key);
                    }
                    Ok(watcher::Event::Restarted(repos)) => {
                        for repo in repos {
                            index.index_repository(&repo).await;
                            queue.add(key_of(&repo));
                        }
                    }
                    Err(err) => warn!(error = %err, "HelmRepository watch error"),
                }
            }
        }));
    }

    // GitRepository and Bucket watchers only drive chart fan-out.
    {
        let api: Api<GitRepository> = Api::all(client.clone());
        let chart_queue_git = Arc::clone(&chart_queue);
        let index = Arc::clone(&ctx.index);
        handles.push(tokio::spawn(async move {
            let mut stream = Box::pin(watcher(api, watcher::Config::default()));
            while let Some(event) = stream.next().await {
                if let Ok(watcher::Event::Applied(repo)) = event {
                    enqueue_dependents(
                        &index,
                        &chart_queue_git,
                        SourceKind::GitRepository,
                        &key_of(&repo),
                        repo.artifact().map(|a| a.revision.clone()),
                    )
                    .await;
                }
            }
        }));

        let api: Api<Bucket> = Api::all(client.clone());
        let chart_queue = Arc::clone(&chart_queue);
        let index = Arc::clone(&ctx.index);
        handles.push(tokio::spawn(async move {
            let mut stream = Box::pin(watcher(api, watcher::Config::default()));
            while let Some(event) = stream.next().await {
                if let Ok(watcher::Event::Applied(bucket)) = event {
                    enqueue_dependents(
                        &index,
                        &chart_queue,
                        SourceKind::Bucket,
                        &key_of(&bucket),
                        bucket.artifact().map(|a| a.revision.clone()),
                    )
                    .await;
                }
            }
        }));
    }

    Ok(tokio::spawn(async move {
        for handle in handles {
            if let Err(e) = handle.await {
                error!("controller task failed: {}", e);
            }
        }
    }))
}

/// Enqueues the charts referencing the changed source, once each.
async fn enqueue_dependents(
    index: &ChangeIndex,
    chart_queue: &Arc<WorkQueue<ObjectKey>>,
    kind: SourceKind,
    source: &ObjectKey,
    revision: Option<String>,
) {
    let Some(revision) = revision else { return };
    let dependents = index.charts_for_source_change(kind, source, &revision).await;
    for key in dependents {
        debug!(source = %source, chart = %key, "upstream revision changed, enqueueing dependent");
        chart_queue.add(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_results_combine_conservatively() {
        use PhaseResult::*;
        assert_eq!(lowest_requeuing(Empty, Success), Success);
        assert_eq!(lowest_requeuing(Success, Empty), Success);
        assert_eq!(lowest_requeuing(Success, Requeue), Requeue);
        assert_eq!(lowest_requeuing(Requeue, Success), Requeue);
        assert_eq!(lowest_requeuing(Success, Success), Success);
        assert_eq!(lowest_requeuing(Empty, Empty), Empty);
    }

    #[test]
    fn short_revision_shortens_sha_like_values() {
        assert_eq!(
            short_revision("main/1f2a3b4c5d6e7f8091a2b3c4d5e6f708192a3b4c", true),
            "1f2a3b4c5d6e"
        );
        assert_eq!(short_revision("6.2.0", true), "6.2.0");
        assert_eq!(
            short_revision("main/1f2a3b4c5d6e7f8091a2b3c4d5e6f708192a3b4c", false),
            "1f2a3b4c5d6e7f8091a2b3c4d5e6f708192a3b4c"
        );
    }

    #[test]
    fn reconcile_request_detection() {
        let mut meta = ObjectMeta::default();
        assert!(!reconcile_requested(&meta, None));

        let mut annotations = std::collections::BTreeMap::new();
        annotations.insert(
            RECONCILE_REQUESTED_ANNOTATION.to_string(),
            "2026-08-02T10:00:00Z".to_string(),
        );
        meta.annotations = Some(annotations);

        assert!(reconcile_requested(&meta, None));
        assert!(reconcile_requested(&meta, Some("2026-08-01T00:00:00Z")));
        assert!(!reconcile_requested(&meta, Some("2026-08-02T10:00:00Z")));
    }

    #[test]
    fn interval_falls_back_to_default() {
        let default = Duration::from_secs(600);
        assert_eq!(interval_of(Some("5m"), default), Duration::from_secs(300));
        assert_eq!(interval_of(Some("bogus"), default), default);
        assert_eq!(interval_of(None, default), default);
    }
}
