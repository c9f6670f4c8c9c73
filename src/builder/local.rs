//! Builds charts packaged from an extracted source tree.

use std::fs;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::chart::{self, ChartMetadata};
use super::repository::ChartRepository;
use super::{apply_version_metadata, Build, BuildError, BuildErrorReason, BuildOptions};

/// A chart directory within an extracted source artifact.
#[derive(Debug, Clone)]
pub struct LocalReference {
    /// Root the source artifact was extracted into.
    pub work_dir: PathBuf,
    /// Chart path relative to the work directory.
    pub path: String,
}

/// Resolves a repository URL declared by a chart dependency to a
/// downloader. Implemented by the controller with namespace-scoped
/// HelmRepository lookups.
#[async_trait]
pub trait RepositoryResolver: Send + Sync {
    async fn repository(&self, url: &str) -> Result<Box<dyn ChartRepository>, BuildError>;
}

/// Downloads missing chart dependencies into the chart's `charts/`
/// directory.
pub struct DependencyManager {
    resolver: Box<dyn RepositoryResolver>,
}

impl DependencyManager {
    pub fn new(resolver: Box<dyn RepositoryResolver>) -> Self {
        Self { resolver }
    }

    /// Resolves the chart's declared dependencies. Returns how many were
    /// materialized; dependencies already vendored under `charts/` are
    /// left alone.
    pub async fn build(
        &self,
        chart_dir: &Path,
        metadata: &ChartMetadata,
    ) -> Result<usize, BuildError> {
        if metadata.dependencies.is_empty() {
            return Ok(0);
        }
        let charts_dir = chart_dir.join("charts");
        fs::create_dir_all(&charts_dir).map_err(|err| {
            BuildError::new(
                BuildErrorReason::DependencyBuild,
                format!("failed to create charts directory: {}", err),
            )
        })?;

        let mut resolved_count = 0;
        for dep in &metadata.dependencies {
            let Some(repo_url) = dep.repository.as_deref().filter(|r| !r.is_empty()) else {
                // No repository: the dependency must already be vendored.
                continue;
            };
            if dependency_present(&charts_dir, &dep.name) {
                debug!(dependency = %dep.name, "dependency already vendored, skipping");
                continue;
            }

            if let Some(rel) = repo_url.strip_prefix("file://") {
                let src = normalize_subpath(chart_dir, rel).ok_or_else(|| {
                    BuildError::new(
                        BuildErrorReason::DependencyBuild,
                        format!("dependency path '{}' escapes the source", repo_url),
                    )
                })?;
                copy_dir(&src, &charts_dir.join(&dep.name)).map_err(|err| {
                    BuildError::new(
                        BuildErrorReason::DependencyBuild,
                        format!("failed to copy local dependency '{}': {}", dep.name, err),
                    )
                })?;
                resolved_count += 1;
                continue;
            }

            let mut repo = self.resolver.repository(repo_url).await?;
            let version = dep.version.as_deref().unwrap_or("*");
            let resolved = repo.resolve(&dep.name, version).await.map_err(|err| {
                BuildError::new(
                    BuildErrorReason::DependencyBuild,
                    format!("failed to resolve dependency '{}': {}", dep.name, err.message),
                )
            })?;
            let bytes = repo.download(&resolved).await.map_err(|err| {
                BuildError::new(
                    BuildErrorReason::DependencyBuild,
                    format!("failed to download dependency '{}': {}", dep.name, err.message),
                )
            })?;
            let dest = charts_dir.join(format!("{}-{}.tgz", resolved.name, resolved.version));
            fs::write(&dest, bytes).map_err(|err| {
                BuildError::new(
                    BuildErrorReason::DependencyBuild,
                    format!("failed to write dependency '{}': {}", dep.name, err),
                )
            })?;
            resolved_count += 1;
        }
        Ok(resolved_count)
    }
}

fn dependency_present(charts_dir: &Path, name: &str) -> bool {
    if charts_dir.join(name).is_dir() {
        return true;
    }
    let prefix = format!("{}-", name);
    fs::read_dir(charts_dir)
        .map(|entries| {
            entries.flatten().any(|e| {
                let file_name = e.file_name().to_string_lossy().into_owned();
                file_name.starts_with(&prefix) && file_name.ends_with(".tgz")
            })
        })
        .unwrap_or(false)
}

pub struct LocalBuilder {
    dependency_manager: Option<DependencyManager>,
}

impl LocalBuilder {
    pub fn new(dependency_manager: Option<DependencyManager>) -> Self {
        Self { dependency_manager }
    }

    /// Loads, merges, resolves dependencies for, and packages the chart at
    /// the referenced path.
    pub async fn build(
        &self,
        reference: &LocalReference,
        out: PathBuf,
        opts: &BuildOptions,
    ) -> Result<Build, BuildError> {
        let chart_dir =
            normalize_subpath(&reference.work_dir, &reference.path).ok_or_else(|| {
                BuildError::new(
                    BuildErrorReason::ChartReference,
                    format!("chart path '{}' escapes the source artifact", reference.path),
                )
            })?;

        let metadata = chart::load_metadata_from_dir(&chart_dir)?;
        let mut version = metadata.version.clone();
        if let Some(meta) = &opts.version_metadata {
            version = apply_version_metadata(&version, meta)?;
        }

        if !opts.force {
            if let Some(cached) = &opts.cached_chart {
                if let Some(cached_meta) = chart::load_metadata_from_tgz(cached) {
                    if cached_meta.name == metadata.name && cached_meta.version == version {
                        debug!(chart = %metadata.name, version = %version, "chart unchanged, using cached build");
                        return Ok(Build {
                            name: metadata.name,
                            version,
                            path: cached.clone(),
                            packaged: false,
                            verified: false,
                            resolved_dependencies: 0,
                        });
                    }
                }
            }
        }

        chart::merge_values(&chart_dir, &opts.values_files)?;

        let resolved_dependencies = match &self.dependency_manager {
            Some(dm) => dm.build(&chart_dir, &metadata).await?,
            None => 0,
        };

        if version != metadata.version {
            chart::patch_metadata_version(&chart_dir, &version)?;
        }
        chart::package(&chart_dir, &out, &metadata.name)?;

        Ok(Build {
            name: metadata.name,
            version,
            path: out,
            packaged: true,
            verified: false,
            resolved_dependencies,
        })
    }
}

/// Joins a relative path onto a base, rejecting traversal outside it.
fn normalize_subpath(base: &Path, rel: &str) -> Option<PathBuf> {
    let rel = Path::new(rel.trim_start_matches("./"));
    let mut depth: i32 = 0;
    for component in rel.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
            }
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(base.join(rel))
}

fn copy_dir(src: &Path, dest: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.metadata()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::repository::ResolvedChartVersion;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    struct FakeResolver {
        requests: Arc<AtomicUsize>,
    }

    struct FakeDependencyRepo;

    #[async_trait]
    impl ChartRepository for FakeDependencyRepo {
        async fn resolve(
            &mut self,
            name: &str,
            _version: &str,
        ) -> Result<ResolvedChartVersion, BuildError> {
            Ok(ResolvedChartVersion {
                name: name.to_string(),
                version: "1.0.0".to_string(),
                location: format!("fake://{}", name),
                digest_hex: None,
            })
        }

        async fn download(
            &mut self,
            resolved: &ResolvedChartVersion,
        ) -> Result<Vec<u8>, BuildError> {
            let dir = tempdir().unwrap();
            let chart_dir = dir.path().join(&resolved.name);
            chart::write_chart(&chart_dir, &resolved.name, &resolved.version);
            let out = dir.path().join("dep.tgz");
            chart::package(&chart_dir, &out, &resolved.name).unwrap();
            Ok(fs::read(&out).unwrap())
        }

        async fn verify(&mut self, _resolved: &ResolvedChartVersion) -> Result<bool, BuildError> {
            Ok(false)
        }
    }

    #[async_trait]
    impl RepositoryResolver for FakeResolver {
        async fn repository(&self, _url: &str) -> Result<Box<dyn ChartRepository>, BuildError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeDependencyRepo))
        }
    }

    fn source_with_chart(name: &str, version: &str) -> (tempfile::TempDir, LocalReference) {
        let work = tempdir().unwrap();
        let chart_dir = work.path().join("charts").join(name);
        chart::write_chart(&chart_dir, name, version);
        let reference = LocalReference {
            work_dir: work.path().to_path_buf(),
            path: format!("charts/{}", name),
        };
        (work, reference)
    }

    #[tokio::test]
    async fn packages_a_chart_directory() {
        let (_work, reference) = source_with_chart("app", "1.2.3");
        let out_dir = tempdir().unwrap();
        let out = out_dir.path().join("app-1.2.3.tgz");

        let builder = LocalBuilder::new(None);
        let build = builder
            .build(&reference, out.clone(), &BuildOptions::default())
            .await
            .unwrap();

        assert!(build.packaged);
        assert_eq!(build.name, "app");
        assert_eq!(build.version, "1.2.3");
        assert_eq!(chart::load_metadata_from_tgz(&out).unwrap().name, "app");
    }

    #[tokio::test]
    async fn revision_metadata_patches_the_packaged_version() {
        let (_work, reference) = source_with_chart("app", "1.2.3");
        let out_dir = tempdir().unwrap();
        let out = out_dir.path().join("app.tgz");

        let builder = LocalBuilder::new(None);
        let opts = BuildOptions {
            version_metadata: Some("a1b2c3d4e5f6".to_string()),
            ..Default::default()
        };
        let build = builder.build(&reference, out.clone(), &opts).await.unwrap();

        assert_eq!(build.version, "1.2.3+a1b2c3d4e5f6");
        assert_eq!(
            chart::load_metadata_from_tgz(&out).unwrap().version,
            "1.2.3+a1b2c3d4e5f6"
        );
    }

    #[tokio::test]
    async fn escaping_chart_path_is_rejected() {
        let (_work, mut reference) = source_with_chart("app", "1.2.3");
        reference.path = "../outside".to_string();

        let out_dir = tempdir().unwrap();
        let builder = LocalBuilder::new(None);
        let err = builder
            .build(&reference, out_dir.path().join("x.tgz"), &BuildOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.reason, BuildErrorReason::ChartReference);
    }

    #[tokio::test]
    async fn dependencies_are_downloaded_into_charts() {
        let (work, reference) = source_with_chart("app", "1.2.3");
        let chart_dir = work.path().join("charts/app");
        fs::write(
            chart_dir.join("Chart.yaml"),
            "apiVersion: v2\nname: app\nversion: 1.2.3\ndependencies:\n  - name: redis\n    version: \"*\"\n    repository: https://charts.example.com\n",
        )
        .unwrap();

        let requests = Arc::new(AtomicUsize::new(0));
        let dm = DependencyManager::new(Box::new(FakeResolver {
            requests: requests.clone(),
        }));
        let builder = LocalBuilder::new(Some(dm));

        let out_dir = tempdir().unwrap();
        let build = builder
            .build(&reference, out_dir.path().join("app.tgz"), &BuildOptions::default())
            .await
            .unwrap();

        assert_eq!(build.resolved_dependencies, 1);
        assert_eq!(requests.load(Ordering::SeqCst), 1);
        assert!(chart_dir.join("charts/redis-1.0.0.tgz").exists());
    }

    #[tokio::test]
    async fn vendored_dependencies_are_not_refetched() {
        let (work, reference) = source_with_chart("app", "1.2.3");
        let chart_dir = work.path().join("charts/app");
        fs::write(
            chart_dir.join("Chart.yaml"),
            "apiVersion: v2\nname: app\nversion: 1.2.3\ndependencies:\n  - name: redis\n    version: \"*\"\n    repository: https://charts.example.com\n",
        )
        .unwrap();
        fs::create_dir_all(chart_dir.join("charts")).unwrap();
        fs::write(chart_dir.join("charts/redis-0.9.0.tgz"), b"vendored").unwrap();

        let requests = Arc::new(AtomicUsize::new(0));
        let dm = DependencyManager::new(Box::new(FakeResolver {
            requests: requests.clone(),
        }));
        let builder = LocalBuilder::new(Some(dm));

        let out_dir = tempdir().unwrap();
        let build = builder
            .build(&reference, out_dir.path().join("app.tgz"), &BuildOptions::default())
            .await
            .unwrap();

        assert_eq!(build.resolved_dependencies, 0);
        assert_eq!(requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cached_build_is_reused() {
        let (_work, reference) = source_with_chart("app", "1.2.3");
        let out_dir = tempdir().unwrap();

        let builder = LocalBuilder::new(None);
        let first = builder
            .build(&reference, out_dir.path().join("first.tgz"), &BuildOptions::default())
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
        assert!(!second.packaged);
    }
}
