// Change index integration tests
//
// Upstream churn scenarios: a source revision flip must requeue each
// dependent chart exactly once, and observed revisions must suppress
// spurious requeues.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use charthouse::index::{ChangeIndex, ObjectKey};
use charthouse::models::SourceKind;
use charthouse::queue::WorkQueue;
use common::{create_test_helm_chart, create_test_helm_repository};

#[tokio::test]
async fn upstream_revision_flip_requeues_each_dependent_once() {
    let index = ChangeIndex::new();
    let queue: Arc<WorkQueue<ObjectKey>> = Arc::new(WorkQueue::default());

    // Two charts consume the same repository; both observed r1.
    for name in ["app-a", "app-b"] {
        let chart = create_test_helm_chart(name, "default", "HelmRepository", "podinfo");
        index.index_chart(&chart).await;
        index
            .record_observed_revision(&ObjectKey::new("default", name), "r1")
            .await;
    }

    let source = ObjectKey::new("default", "podinfo");

    // The repository artifact flips r1 -> r2; the watcher may fire several
    // times for the same flip.
    for _ in 0..3 {
        let changed = index
            .charts_for_source_change(SourceKind::HelmRepository, &source, "r2")
            .await;
        for key in changed {
            queue.add(key);
        }
    }

    // Exactly one queued item per dependent.
    assert_eq!(queue.len(), 2);
    let mut drained = HashSet::new();
    while let Some(key) = tokio::time::timeout(Duration::from_millis(100), queue.get())
        .await
        .ok()
        .flatten()
    {
        drained.insert(key.name.clone());
        queue.done(&key);
        if drained.len() == 2 {
            break;
        }
    }
    assert!(drained.contains("app-a"));
    assert!(drained.contains("app-b"));
}

#[tokio::test]
async fn dependents_already_at_the_revision_stay_quiet() {
    let index = ChangeIndex::new();

    let chart = create_test_helm_chart("app", "default", "HelmRepository", "podinfo");
    index.index_chart(&chart).await;
    index
        .record_observed_revision(&ObjectKey::new("default", "app"), "r2")
        .await;

    let source = ObjectKey::new("default", "podinfo");
    let changed = index
        .charts_for_source_change(SourceKind::HelmRepository, &source, "r2")
        .await;
    assert!(changed.is_empty());
}

#[tokio::test]
async fn charts_in_other_namespaces_are_isolated() {
    let index = ChangeIndex::new();

    let chart = create_test_helm_chart("app", "staging", "HelmRepository", "podinfo");
    index.index_chart(&chart).await;

    // A same-named repository in another namespace changes.
    let source = ObjectKey::new("production", "podinfo");
    let changed = index
        .charts_for_source_change(SourceKind::HelmRepository, &source, "r2")
        .await;
    assert!(changed.is_empty());
}

#[tokio::test]
async fn repository_url_index_supports_dependency_resolution() {
    let index = ChangeIndex::new();
    let repo = create_test_helm_repository("podinfo", "default", "https://charts.test.local/");
    index.index_repository(&repo).await;

    let found = index
        .repository_by_url("default", "https://charts.test.local")
        .await;
    assert_eq!(found, Some(ObjectKey::new("default", "podinfo")));

    index.forget_repository(&ObjectKey::new("default", "podinfo")).await;
    assert!(index
        .repository_by_url("default", "https://charts.test.local")
        .await
        .is_none());
}
