// Common test utilities for integration tests
//
// This module provides helper functions and fixtures for exercising the
// storage, builder and queue components against real temporary directories.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use charthouse::builder::chart;
use charthouse::builder::repository::IndexFile;
use charthouse::models::{
    ChartSourceReference, HelmChart, HelmChartSpec, HelmRepository, HelmRepositorySpec,
};
use charthouse::storage::Storage;

/// Creates a storage rooted at the given directory with test-friendly
/// retention settings.
pub fn create_test_storage(root: &Path) -> Storage {
    Storage::new(root, "storage.test.local", Duration::from_secs(3600), 2).unwrap()
}

/// Creates a sample HelmChart for testing.
pub fn create_test_helm_chart(
    name: &str,
    namespace: &str,
    source_kind: &str,
    source_name: &str,
) -> HelmChart {
    let mut chart = HelmChart::new(
        name,
        HelmChartSpec {
            chart: "podinfo".to_string(),
            version: Some(">=6.0 <7.0".to_string()),
            source_ref: ChartSourceReference {
                kind: source_kind.to_string(),
                name: source_name.to_string(),
            },
            interval: Some("10m".to_string()),
            reconcile_strategy: Default::default(),
            values_files: Vec::new(),
            verify: None,
            suspend: false,
        },
    );
    chart.metadata.namespace = Some(namespace.to_string());
    chart
}

/// Creates a sample HelmRepository for testing.
pub fn create_test_helm_repository(name: &str, namespace: &str, url: &str) -> HelmRepository {
    let mut repo = HelmRepository::new(
        name,
        HelmRepositorySpec {
            url: url.to_string(),
            interval: Some("10m".to_string()),
            timeout: Some("60s".to_string()),
            secret_ref: None,
            pass_credentials: None,
            repository_type: None,
            provider: None,
            suspend: false,
        },
    );
    repo.metadata.namespace = Some(namespace.to_string());
    repo
}

/// Writes a minimal chart tree and returns its directory.
pub fn write_test_chart(parent: &Path, name: &str, version: &str) -> PathBuf {
    let dir = parent.join(name);
    fs::create_dir_all(dir.join("templates")).unwrap();
    fs::write(
        dir.join("Chart.yaml"),
        format!("apiVersion: v2\nname: {}\nversion: {}\n", name, version),
    )
    .unwrap();
    fs::write(dir.join("values.yaml"), "replicas: 1\n").unwrap();
    fs::write(dir.join("templates/deployment.yaml"), "kind: Deployment\n").unwrap();
    dir
}

/// Packages a minimal chart and returns the path of the tarball.
pub fn package_test_chart(parent: &Path, name: &str, version: &str) -> PathBuf {
    let dir = write_test_chart(parent, name, version);
    let out = parent.join(format!("{}-{}.tgz", name, version));
    chart::package(&dir, &out, name).unwrap();
    out
}

/// The podinfo repository index used by the version resolution scenarios.
pub fn podinfo_index() -> IndexFile {
    serde_yaml::from_str(
        r#"
apiVersion: v1
entries:
  podinfo:
    - name: podinfo
      version: 6.0.0
      urls: ["charts/podinfo-6.0.0.tgz"]
    - name: podinfo
      version: 6.1.3
      urls: ["charts/podinfo-6.1.3.tgz"]
    - name: podinfo
      version: 6.2.0
      urls: ["charts/podinfo-6.2.0.tgz"]
    - name: podinfo
      version: 7.0.0
      urls: ["charts/podinfo-7.0.0.tgz"]
"#,
    )
    .unwrap()
}
