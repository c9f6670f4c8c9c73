// Chart builder integration tests
//
// End-to-end version resolution and packaging scenarios against an
// in-memory repository index and real chart trees on disk.

mod common;

use std::time::Duration;

use charthouse::builder::{
    chart, BuildOptions, HttpChartRepository, LocalBuilder, LocalReference,
};
use charthouse::registry::pick_semver_tag;
use common::{podinfo_index, write_test_chart};
use tempfile::tempdir;

#[tokio::test]
async fn version_constraint_resolves_to_highest_match() {
    // HelmChart{chart: "podinfo", version: ">=6.0 <7.0"} against an index
    // with [6.0.0, 6.1.3, 6.2.0, 7.0.0] resolves to 6.2.0.
    let mut repo =
        HttpChartRepository::new("https://charts.test.local", Duration::from_secs(5), None)
            .unwrap()
            .with_index(podinfo_index());

    use charthouse::builder::ChartRepository;
    let resolved = repo.resolve("podinfo", ">=6.0 <7.0").await.unwrap();
    assert_eq!(resolved.version, "6.2.0");
    assert!(resolved.location.ends_with("podinfo-6.2.0.tgz"));
}

#[test]
fn semver_resolution_is_order_independent() {
    let mut tags: Vec<String> = ["7.0.0", "6.1.3", "6.0.0", "6.2.0"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let first = pick_semver_tag(&tags, ">=6.0 <7.0").unwrap();
    tags.reverse();
    let second = pick_semver_tag(&tags, ">=6.0 <7.0").unwrap();

    assert_eq!(first.as_deref(), Some("6.2.0"));
    assert_eq!(first, second);
}

#[tokio::test]
async fn values_files_append_generation_metadata_to_the_revision() {
    // A values override makes the revision carry a +<generation> suffix;
    // dropping the override reverts it.
    let work = tempdir().unwrap();
    write_test_chart(work.path(), "app", "1.2.3");
    let out_dir = tempdir().unwrap();

    let builder = LocalBuilder::new(None);
    let reference = LocalReference {
        work_dir: work.path().to_path_buf(),
        path: "app".to_string(),
    };

    let opts = BuildOptions {
        values_files: vec!["values.yaml".to_string()],
        version_metadata: Some("7".to_string()),
        ..Default::default()
    };
    let with_values = builder
        .build(&reference, out_dir.path().join("with.tgz"), &opts)
        .await
        .unwrap();
    assert_eq!(with_values.version, "1.2.3+7");

    // Same chart without overrides: plain version again.
    let work = tempdir().unwrap();
    write_test_chart(work.path(), "app", "1.2.3");
    let reference = LocalReference {
        work_dir: work.path().to_path_buf(),
        path: "app".to_string(),
    };
    let without_values = builder
        .build(&reference, out_dir.path().join("without.tgz"), &BuildOptions::default())
        .await
        .unwrap();
    assert_eq!(without_values.version, "1.2.3");
}

#[tokio::test]
async fn unchanged_chart_is_a_build_no_op() {
    let work = tempdir().unwrap();
    write_test_chart(work.path(), "app", "1.2.3");
    let out_dir = tempdir().unwrap();

    let builder = LocalBuilder::new(None);
    let reference = LocalReference {
        work_dir: work.path().to_path_buf(),
        path: "app".to_string(),
    };

    let first = builder
        .build(&reference, out_dir.path().join("first.tgz"), &BuildOptions::default())
        .await
        .unwrap();
    assert!(first.packaged);

    let opts = BuildOptions {
        cached_chart: Some(first.path.clone()),
        ..Default::default()
    };
    let second = builder
        .build(&reference, out_dir.path().join("second.tgz"), &opts)
        .await
        .unwrap();

    // Identical input: the cached file is handed back untouched.
    assert!(!second.packaged);
    assert_eq!(second.path, first.path);
    assert!(!out_dir.path().join("second.tgz").exists());
}

#[tokio::test]
async fn packaged_chart_round_trips_through_metadata() {
    let work = tempdir().unwrap();
    write_test_chart(work.path(), "app", "2.0.0");
    let out_dir = tempdir().unwrap();
    let out = out_dir.path().join("app-2.0.0.tgz");

    let builder = LocalBuilder::new(None);
    let reference = LocalReference {
        work_dir: work.path().to_path_buf(),
        path: "app".to_string(),
    };
    builder
        .build(&reference, out.clone(), &BuildOptions::default())
        .await
        .unwrap();

    let metadata = chart::load_metadata_from_tgz(&out).unwrap();
    assert_eq!(metadata.name, "app");
    assert_eq!(metadata.version, "2.0.0");
}
