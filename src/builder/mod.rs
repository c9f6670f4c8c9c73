//! Chart build pipeline.
//!
//! Two entry points: [`remote::RemoteBuilder`] pulls a packaged chart from a
//! Helm or OCI repository, [`local::LocalBuilder`] packages a chart from an
//! extracted source tree. Both produce a [`Build`] describing the staged
//! chart file, or a [`BuildError`] whose reason drives the retry policy.

pub mod chart;
pub mod local;
pub mod remote;
pub mod repository;

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

pub use local::{DependencyManager, LocalBuilder, LocalReference, RepositoryResolver};
pub use remote::{RemoteBuilder, RemoteReference};
pub use repository::{ChartRepository, HttpChartRepository, OciChartRepository, ResolvedChartVersion};

/// Options applied to a chart build.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Values files to merge into the chart, relative to the chart root.
    pub values_files: Vec<String>,
    /// Rebuild even when a cached chart matches.
    pub force: bool,
    /// Previously built chart to reuse when name and version match.
    pub cached_chart: Option<PathBuf>,
    /// Verify the chart signature during the build.
    pub verify: bool,
    /// Build metadata appended to the chart version (SemVer `+` suffix).
    pub version_metadata: Option<String>,
}

/// The result of a chart build.
#[derive(Debug, Clone, Default)]
pub struct Build {
    pub name: String,
    pub version: String,
    /// Path to the staged chart file.
    pub path: PathBuf,
    /// Whether the chart was (re)packaged, as opposed to pulled verbatim.
    pub packaged: bool,
    /// Whether the chart signature was verified.
    pub verified: bool,
    /// Number of dependencies resolved during packaging.
    pub resolved_dependencies: usize,
}

impl Build {
    pub fn has_metadata(&self) -> bool {
        !self.name.is_empty() && !self.version.is_empty()
    }

    /// A build is complete once it has metadata and a staged file.
    pub fn complete(&self) -> bool {
        self.has_metadata() && !self.path.as_os_str().is_empty()
    }

    /// Human-readable one-liner for events and logs.
    pub fn summary(&self) -> String {
        if !self.complete() {
            return "no chart build".to_string();
        }
        let action = if self.packaged { "packaged" } else { "pulled" };
        let mut summary = format!("{} '{}' chart with version '{}'", action, self.name, self.version);
        if self.verified {
            summary.push_str(", signature verified");
        }
        summary
    }
}

/// Classified build failure reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildErrorReason {
    /// The chart reference does not resolve to a chart.
    ChartReference,
    /// Downloading the chart or its index failed.
    ChartPull,
    /// Patching or parsing the chart metadata failed.
    ChartMetadataPatch,
    /// Merging the declared values files failed.
    ValuesFilesMerge,
    /// Resolving or downloading chart dependencies failed.
    DependencyBuild,
    /// Packaging the chart failed.
    ChartPackage,
    /// Signature verification failed.
    ChartVerification,
    Unknown,
}

impl BuildErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildErrorReason::ChartReference => "InvalidChartReference",
            BuildErrorReason::ChartPull => "ChartPullFailed",
            BuildErrorReason::ChartMetadataPatch => "MetadataPatchFailed",
            BuildErrorReason::ValuesFilesMerge => "ValuesFilesMergeFailed",
            BuildErrorReason::DependencyBuild => "DependencyBuildFailed",
            BuildErrorReason::ChartPackage => "ChartPackageFailed",
            BuildErrorReason::ChartVerification => "VerificationError",
            BuildErrorReason::Unknown => "BuildFailed",
        }
    }

    /// Persistent reasons stall the object: retrying without an input
    /// change cannot succeed.
    pub fn is_persistent(&self) -> bool {
        matches!(
            self,
            BuildErrorReason::ChartReference
                | BuildErrorReason::ChartMetadataPatch
                | BuildErrorReason::ValuesFilesMerge
                | BuildErrorReason::ChartVerification
        )
    }
}

impl fmt::Display for BuildErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("{reason}: {message}")]
pub struct BuildError {
    pub reason: BuildErrorReason,
    pub message: String,
}

impl BuildError {
    pub fn new(reason: BuildErrorReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.reason.is_persistent()
    }
}

/// Appends build metadata to a SemVer version, joining any existing
/// metadata with a dot.
pub fn apply_version_metadata(version: &str, metadata: &str) -> Result<String, BuildError> {
    let mut parsed = semver::Version::parse(version.trim_start_matches('v')).map_err(|err| {
        BuildError::new(
            BuildErrorReason::ChartMetadataPatch,
            format!("invalid chart version '{}': {}", version, err),
        )
    })?;

    let combined = if parsed.build.is_empty() {
        metadata.to_string()
    } else {
        format!("{}.{}", parsed.build, metadata)
    };
    parsed.build = semver::BuildMetadata::new(&combined).map_err(|err| {
        BuildError::new(
            BuildErrorReason::ChartMetadataPatch,
            format!("invalid version metadata '{}': {}", metadata, err),
        )
    })?;
    Ok(parsed.to_string())
}
