//! Builds charts pulled from a remote repository.

use std::fs;
use std::path::PathBuf;

use tracing::debug;

use super::chart;
use super::repository::ChartRepository;
use super::{apply_version_metadata, Build, BuildError, BuildErrorReason, BuildOptions};

/// A chart name and optional version constraint to build from a remote
/// repository.
#[derive(Debug, Clone)]
pub struct RemoteReference {
    pub name: String,
    pub version: Option<String>,
}

pub struct RemoteBuilder<R: ChartRepository> {
    repo: R,
}

impl<R: ChartRepository> RemoteBuilder<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Resolves, optionally verifies, and stages the chart at `out`.
    ///
    /// When a cached chart with the same name and version exists and
    /// `force` is unset, the cached file is returned without a download.
    /// Values files trigger a repackage with the merged values and the
    /// metadata-suffixed version.
    pub async fn build(
        &mut self,
        reference: &RemoteReference,
        out: PathBuf,
        opts: &BuildOptions,
    ) -> Result<Build, BuildError> {
        if reference.name.is_empty() {
            return Err(BuildError::new(
                BuildErrorReason::ChartReference,
                "chart name is empty",
            ));
        }

        let resolved = self
            .repo
            .resolve(&reference.name, reference.version.as_deref().unwrap_or(""))
            .await?;

        let mut version = resolved.version.clone();
        if let Some(metadata) = &opts.version_metadata {
            version = apply_version_metadata(&version, metadata)?;
        }

        // Verification runs every build, cached or not: a key rotation must
        // be noticed without a version change.
        let verified = if opts.verify {
            self.repo.verify(&resolved).await?
        } else {
            false
        };

        if !opts.force {
            if let Some(cached) = &opts.cached_chart {
                if let Some(meta) = chart::load_metadata_from_tgz(cached) {
                    if meta.name == resolved.name && meta.version == version {
                        debug!(chart = %meta.name, version = %meta.version, "chart unchanged, using cached build");
                        return Ok(Build {
                            name: resolved.name,
                            version,
                            path: cached.clone(),
                            packaged: false,
                            verified,
                            resolved_dependencies: 0,
                        });
                    }
                }
            }
        }

        let bytes = self.repo.download(&resolved).await?;

        if opts.values_files.is_empty() && opts.version_metadata.is_none() {
            fs::write(&out, &bytes).map_err(|err| {
                BuildError::new(
                    BuildErrorReason::ChartPull,
                    format!("failed to stage chart at '{}': {}", out.display(), err),
                )
            })?;
            return Ok(Build {
                name: resolved.name,
                version,
                path: out,
                packaged: false,
                verified,
                resolved_dependencies: 0,
            });
        }

        // Values or a version suffix require unpacking and repackaging.
        let staging = tempfile::tempdir().map_err(|err| {
            BuildError::new(
                BuildErrorReason::ChartPackage,
                format!("failed to create staging directory: {}", err),
            )
        })?;
        chart::extract_tgz(&bytes, staging.path()).map_err(|err| {
            BuildError::new(
                BuildErrorReason::ChartPackage,
                format!("failed to extract pulled chart: {}", err),
            )
        })?;
        let chart_dir = staging.path().join(&resolved.name);
        if !chart_dir.is_dir() {
            return Err(BuildError::new(
                BuildErrorReason::ChartMetadataPatch,
                format!("pulled chart has no '{}' directory", resolved.name),
            ));
        }

        chart::merge_values(&chart_dir, &opts.values_files)?;
        if version != resolved.version {
            chart::patch_metadata_version(&chart_dir, &version)?;
        }
        chart::package(&chart_dir, &out, &resolved.name)?;

        Ok(Build {
            name: resolved.name,
            version,
            path: out,
            packaged: true,
            verified,
            resolved_dependencies: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::repository::ResolvedChartVersion;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    /// In-memory repository serving one packaged chart.
    struct FakeRepository {
        name: String,
        version: String,
        bytes: Vec<u8>,
        downloads: Arc<AtomicUsize>,
    }

    impl FakeRepository {
        fn new(name: &str, version: &str) -> (Self, Arc<AtomicUsize>) {
            let dir = tempdir().unwrap();
            let chart_dir = dir.path().join(name);
            crate::builder::chart::write_chart(&chart_dir, name, version);
            let out = dir.path().join("chart.tgz");
            chart::package(&chart_dir, &out, name).unwrap();
            let downloads = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    name: name.to_string(),
                    version: version.to_string(),
                    bytes: std::fs::read(&out).unwrap(),
                    downloads: downloads.clone(),
                },
                downloads,
            )
        }
    }

    #[async_trait]
    impl ChartRepository for FakeRepository {
        async fn resolve(
            &mut self,
            name: &str,
            _version: &str,
        ) -> Result<ResolvedChartVersion, BuildError> {
            assert_eq!(name, self.name);
            Ok(ResolvedChartVersion {
                name: self.name.clone(),
                version: self.version.clone(),
                location: format!("fake://{}", self.name),
                digest_hex: None,
            })
        }

        async fn download(
            &mut self,
            _resolved: &ResolvedChartVersion,
        ) -> Result<Vec<u8>, BuildError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            Ok(self.bytes.clone())
        }

        async fn verify(&mut self, _resolved: &ResolvedChartVersion) -> Result<bool, BuildError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn pull_without_values_stages_verbatim() {
        let (repo, downloads) = FakeRepository::new("podinfo", "6.2.0");
        let mut builder = RemoteBuilder::new(repo);
        let out_dir = tempdir().unwrap();
        let out = out_dir.path().join("podinfo-6.2.0.tgz");

        let reference = RemoteReference {
            name: "podinfo".to_string(),
            version: Some(">=6.0 <7.0".to_string()),
        };
        let build = builder
            .build(&reference, out.clone(), &BuildOptions::default())
            .await
            .unwrap();

        assert!(build.complete());
        assert!(!build.packaged);
        assert_eq!(build.version, "6.2.0");
        assert_eq!(downloads.load(Ordering::SeqCst), 1);
        assert_eq!(
            chart::load_metadata_from_tgz(&out).unwrap().version,
            "6.2.0"
        );
    }

    #[tokio::test]
    async fn cached_chart_short_circuits_the_download() {
        let (repo, downloads) = FakeRepository::new("podinfo", "6.2.0");
        let mut builder = RemoteBuilder::new(repo);
        let out_dir = tempdir().unwrap();

        let reference = RemoteReference {
            name: "podinfo".to_string(),
            version: None,
        };
        let first = builder
            .build(
                &reference,
                out_dir.path().join("first.tgz"),
                &BuildOptions::default(),
            )
            .await
            .unwrap();

        let opts = BuildOptions {
            cached_chart: Some(first.path.clone()),
            ..Default::default()
        };
        let second = builder
            .build(&reference, out_dir.path().join("second.tgz"), &opts)
            .await
            .unwrap();

        assert_eq!(second.path, first.path);
        assert_eq!(downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_rebuilds_despite_cache() {
        let (repo, downloads) = FakeRepository::new("podinfo", "6.2.0");
        let mut builder = RemoteBuilder::new(repo);
        let out_dir = tempdir().unwrap();

        let reference = RemoteReference {
            name: "podinfo".to_string(),
            version: None,
        };
        let first = builder
            .build(
                &reference,
                out_dir.path().join("first.tgz"),
                &BuildOptions::default(),
            )
            .await
            .unwrap();

        let opts = BuildOptions {
            cached_chart: Some(first.path),
            force: true,
            ..Default::default()
        };
        builder
            .build(&reference, out_dir.path().join("second.tgz"), &opts)
            .await
            .unwrap();
        assert_eq!(downloads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn values_files_repackage_with_version_metadata() {
        let (repo, _) = FakeRepository::new("podinfo", "6.2.0");
        let mut builder = RemoteBuilder::new(repo);
        let out_dir = tempdir().unwrap();
        let out = out_dir.path().join("podinfo.tgz");

        // The chart written by write_chart has a values.yaml; merging it
        // onto itself exercises the repackage path.
        let opts = BuildOptions {
            values_files: vec!["values.yaml".to_string()],
            version_metadata: Some("4".to_string()),
            ..Default::default()
        };
        let reference = RemoteReference {
            name: "podinfo".to_string(),
            version: None,
        };
        let build = builder.build(&reference, out.clone(), &opts).await.unwrap();

        assert!(build.packaged);
        assert_eq!(build.version, "6.2.0+4");
        assert_eq!(
            chart::load_metadata_from_tgz(&out).unwrap().version,
            "6.2.0+4"
        );
    }

    #[tokio::test]
    async fn cache_misses_on_version_metadata_change() {
        let (repo, downloads) = FakeRepository::new("podinfo", "6.2.0");
        let mut builder = RemoteBuilder::new(repo);
        let out_dir = tempdir().unwrap();

        let reference = RemoteReference {
            name: "podinfo".to_string(),
            version: None,
        };
        let first = builder
            .build(
                &reference,
                out_dir.path().join("first.tgz"),
                &BuildOptions::default(),
            )
            .await
            .unwrap();

        // A generation bump adds metadata; the cached 6.2.0 no longer
        // matches 6.2.0+2.
        let opts = BuildOptions {
            cached_chart: Some(first.path),
            values_files: vec!["values.yaml".to_string()],
            version_metadata: Some("2".to_string()),
            ..Default::default()
        };
        let second = builder
            .build(&reference, out_dir.path().join("second.tgz"), &opts)
            .await
            .unwrap();
        assert_eq!(second.version, "6.2.0+2");
        assert_eq!(downloads.load(Ordering::SeqCst), 2);
    }
}
