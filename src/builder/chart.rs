//! Chart file handling: metadata, values merging and packaging.

use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use super::{BuildError, BuildErrorReason};

/// The subset of Chart.yaml the builder acts on.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChartMetadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub dependencies: Vec<ChartDependency>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChartDependency {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
}

/// Loads Chart.yaml from a chart directory.
pub fn load_metadata_from_dir(dir: &Path) -> Result<ChartMetadata, BuildError> {
    let path = dir.join("Chart.yaml");
    let contents = fs::read_to_string(&path).map_err(|err| {
        BuildError::new(
            BuildErrorReason::ChartReference,
            format!("failed to read '{}': {}", path.display(), err),
        )
    })?;
    serde_yaml::from_str(&contents).map_err(|err| {
        BuildError::new(
            BuildErrorReason::ChartMetadataPatch,
            format!("malformed Chart.yaml: {}", err),
        )
    })
}

/// Loads Chart.yaml from a packaged chart. Returns None when the file does
/// not look like a chart archive, so callers can fall back to a rebuild.
pub fn load_metadata_from_tgz(path: &Path) -> Option<ChartMetadata> {
    let file = File::open(path).ok()?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    for entry in archive.entries().ok()? {
        let mut entry = entry.ok()?;
        let entry_path = entry.path().ok()?;
        // Chart.yaml sits directly under the chart's top-level directory.
        let mut components = entry_path.components();
        let _top = components.next()?;
        if components.as_path() == Path::new("Chart.yaml") {
            let mut contents = String::new();
            entry.read_to_string(&mut contents).ok()?;
            return serde_yaml::from_str(&contents).ok();
        }
    }
    None
}

/// Rewrites the version in Chart.yaml, preserving all other fields.
pub fn patch_metadata_version(dir: &Path, version: &str) -> Result<(), BuildError> {
    let path = dir.join("Chart.yaml");
    let contents = fs::read_to_string(&path).map_err(|err| {
        BuildError::new(
            BuildErrorReason::ChartMetadataPatch,
            format!("failed to read Chart.yaml: {}", err),
        )
    })?;
    let mut value: serde_yaml::Value = serde_yaml::from_str(&contents).map_err(|err| {
        BuildError::new(
            BuildErrorReason::ChartMetadataPatch,
            format!("malformed Chart.yaml: {}", err),
        )
    })?;
    let mapping = value.as_mapping_mut().ok_or_else(|| {
        BuildError::new(
            BuildErrorReason::ChartMetadataPatch,
            "Chart.yaml is not a mapping",
        )
    })?;
    mapping.insert(
        serde_yaml::Value::String("version".to_string()),
        serde_yaml::Value::String(version.to_string()),
    );
    let patched = serde_yaml::to_string(&value).map_err(|err| {
        BuildError::new(
            BuildErrorReason::ChartMetadataPatch,
            format!("failed to serialize Chart.yaml: {}", err),
        )
    })?;
    fs::write(&path, patched).map_err(|err| {
        BuildError::new(
            BuildErrorReason::ChartMetadataPatch,
            format!("failed to write Chart.yaml: {}", err),
        )
    })
}

/// Merges the listed values files into the chart's values.yaml. Files are
/// merged in order, later files winning on conflicting keys. Returns the
/// number of merged files.
pub fn merge_values(dir: &Path, values_files: &[String]) -> Result<usize, BuildError> {
    if values_files.is_empty() {
        return Ok(0);
    }

    let base_path = dir.join("values.yaml");
    let mut merged: serde_yaml::Value = if base_path.exists() {
        parse_values(&base_path)?
    } else {
        serde_yaml::Value::Mapping(Default::default())
    };

    for file in values_files {
        let path = dir.join(file);
        if !path.starts_with(dir) {
            return Err(BuildError::new(
                BuildErrorReason::ValuesFilesMerge,
                format!("values file '{}' escapes the chart directory", file),
            ));
        }
        if !path.exists() {
            return Err(BuildError::new(
                BuildErrorReason::ValuesFilesMerge,
                format!("values file '{}' not found in chart", file),
            ));
        }
        let overlay = parse_values(&path)?;
        deep_merge(&mut merged, overlay);
    }

    let contents = serde_yaml::to_string(&merged).map_err(|err| {
        BuildError::new(
            BuildErrorReason::ValuesFilesMerge,
            format!("failed to serialize merged values: {}", err),
        )
    })?;
    fs::write(&base_path, contents).map_err(|err| {
        BuildError::new(
            BuildErrorReason::ValuesFilesMerge,
            format!("failed to write values.yaml: {}", err),
        )
    })?;
    Ok(values_files.len())
}

fn parse_values(path: &Path) -> Result<serde_yaml::Value, BuildError> {
    let contents = fs::read_to_string(path).map_err(|err| {
        BuildError::new(
            BuildErrorReason::ValuesFilesMerge,
            format!("failed to read '{}': {}", path.display(), err),
        )
    })?;
    serde_yaml::from_str(&contents).map_err(|err| {
        BuildError::new(
            BuildErrorReason::ValuesFilesMerge,
            format!("failed to parse '{}': {}", path.display(), err),
        )
    })
}

/// Recursive map merge; the overlay wins on scalar and sequence conflicts.
fn deep_merge(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Extracts a gzipped tarball into the destination directory.
pub fn extract_tgz(bytes: &[u8], dest: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    archive.unpack(dest)
}

/// Packages the chart directory as `<name>/...` into a gzipped tarball at
/// `out`.
pub fn package(dir: &Path, out: &Path, name: &str) -> Result<(), BuildError> {
    let io_err = |err: std::io::Error| {
        BuildError::new(
            BuildErrorReason::ChartPackage,
            format!("failed to package chart: {}", err),
        )
    };

    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let file = File::create(out).map_err(io_err)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    append_chart_dir(&mut builder, dir, dir, name).map_err(io_err)?;
    builder
        .into_inner()
        .map_err(io_err)?
        .finish()
        .map_err(io_err)?;
    Ok(())
}

fn append_chart_dir(
    builder: &mut tar::Builder<impl std::io::Write>,
    root: &Path,
    dir: &Path,
    prefix: &str,
) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        let rel = path
            .strip_prefix(root)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "path outside chart"))?;
        let archived = Path::new(prefix).join(rel);
        if meta.is_dir() {
            builder.append_dir(&archived, &path)?;
            append_chart_dir(builder, root, &path, prefix)?;
        } else if meta.is_file() {
            builder.append_path_with_name(&path, &archived)?;
        }
    }
    Ok(())
}

/// Writes a minimal chart tree, shared by builder tests.
#[cfg(test)]
pub(crate) fn write_chart(dir: &Path, name: &str, version: &str) {
    fs::create_dir_all(dir.join("templates")).unwrap();
    fs::write(
        dir.join("Chart.yaml"),
        format!("apiVersion: v2\nname: {}\nversion: {}\n", name, version),
    )
    .unwrap();
    fs::write(dir.join("values.yaml"), "replicas: 1\nimage:\n  tag: stable\n").unwrap();
    fs::write(dir.join("templates/deployment.yaml"), "kind: Deployment\n").unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn metadata_loads_from_dir() {
        let tmp = tempdir().unwrap();
        write_chart(tmp.path(), "podinfo", "6.2.0");
        let meta = load_metadata_from_dir(tmp.path()).unwrap();
        assert_eq!(meta.name, "podinfo");
        assert_eq!(meta.version, "6.2.0");
        assert!(meta.dependencies.is_empty());
    }

    #[test]
    fn missing_chart_yaml_is_a_reference_error() {
        let tmp = tempdir().unwrap();
        let err = load_metadata_from_dir(tmp.path()).unwrap_err();
        assert_eq!(err.reason, BuildErrorReason::ChartReference);
    }

    #[test]
    fn malformed_chart_yaml_is_persistent() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("Chart.yaml"), "name: [unterminated").unwrap();
        let err = load_metadata_from_dir(tmp.path()).unwrap_err();
        assert_eq!(err.reason, BuildErrorReason::ChartMetadataPatch);
        assert!(err.is_persistent());
    }

    #[test]
    fn package_and_reload_round_trip() {
        let tmp = tempdir().unwrap();
        let chart_dir = tmp.path().join("chart");
        write_chart(&chart_dir, "podinfo", "6.2.0");

        let out = tmp.path().join("podinfo-6.2.0.tgz");
        package(&chart_dir, &out, "podinfo").unwrap();

        let meta = load_metadata_from_tgz(&out).unwrap();
        assert_eq!(meta.name, "podinfo");
        assert_eq!(meta.version, "6.2.0");
    }

    #[test]
    fn metadata_from_non_chart_file_is_none() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("not-a-chart.tgz");
        fs::write(&path, b"plain bytes").unwrap();
        assert!(load_metadata_from_tgz(&path).is_none());
    }

    #[test]
    fn values_merge_order_wins() {
        let tmp = tempdir().unwrap();
        write_chart(tmp.path(), "podinfo", "6.2.0");
        fs::write(
            tmp.path().join("override.yaml"),
            "replicas: 3\nimage:\n  pullPolicy: Always\n",
        )
        .unwrap();

        let merged = merge_values(tmp.path(), &["override.yaml".to_string()]).unwrap();
        assert_eq!(merged, 1);

        let values: serde_yaml::Value =
            serde_yaml::from_str(&fs::read_to_string(tmp.path().join("values.yaml")).unwrap())
                .unwrap();
        assert_eq!(values["replicas"], serde_yaml::Value::Number(3.into()));
        // Nested keys merge instead of replacing the whole map.
        assert_eq!(values["image"]["tag"], "stable");
        assert_eq!(values["image"]["pullPolicy"], "Always");
    }

    #[test]
    fn missing_values_file_fails_persistently() {
        let tmp = tempdir().unwrap();
        write_chart(tmp.path(), "podinfo", "6.2.0");
        let err = merge_values(tmp.path(), &["absent.yaml".to_string()]).unwrap_err();
        assert_eq!(err.reason, BuildErrorReason::ValuesFilesMerge);
        assert!(err.is_persistent());
    }

    #[test]
    fn patch_version_preserves_other_fields() {
        let tmp = tempdir().unwrap();
        fs::write(
            tmp.path().join("Chart.yaml"),
            "apiVersion: v2\nname: podinfo\nversion: 6.2.0\ndescription: demo\n",
        )
        .unwrap();

        patch_metadata_version(tmp.path(), "6.2.0+3").unwrap();
        let meta: serde_yaml::Value =
            serde_yaml::from_str(&fs::read_to_string(tmp.path().join("Chart.yaml")).unwrap())
                .unwrap();
        assert_eq!(meta["version"], "6.2.0+3");
        assert_eq!(meta["description"], "demo");
    }
}
