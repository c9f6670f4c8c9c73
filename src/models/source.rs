use std::fmt;
use std::str::FromStr;

use crate::models::artifact::Artifact;
use crate::models::bucket::Bucket;
use crate::models::gitrepository::GitRepository;
use crate::models::helmrepository::HelmRepository;

/// The source kinds a HelmChart may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    HelmRepository,
    GitRepository,
    Bucket,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::HelmRepository => "HelmRepository",
            SourceKind::GitRepository => "GitRepository",
            SourceKind::Bucket => "Bucket",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = UnsupportedSourceKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HelmRepository" => Ok(SourceKind::HelmRepository),
            "GitRepository" => Ok(SourceKind::GitRepository),
            "Bucket" => Ok(SourceKind::Bucket),
            other => Err(UnsupportedSourceKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsupportedSourceKind(pub String);

impl fmt::Display for UnsupportedSourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unsupported source kind '{}', must be one of: HelmRepository, GitRepository, Bucket",
            self.0
        )
    }
}

impl std::error::Error for UnsupportedSourceKind {}

/// A fetched source object, dispatched by kind in the chart builder.
#[derive(Clone, Debug)]
pub enum Source {
    HelmRepository(Box<HelmRepository>),
    GitRepository(Box<GitRepository>),
    Bucket(Box<Bucket>),
}

impl Source {
    pub fn kind(&self) -> SourceKind {
        match self {
            Source::HelmRepository(_) => SourceKind::HelmRepository,
            Source::GitRepository(_) => SourceKind::GitRepository,
            Source::Bucket(_) => SourceKind::Bucket,
        }
    }

    /// The advertised artifact of the source, if it has produced one.
    pub fn artifact(&self) -> Option<&Artifact> {
        match self {
            Source::HelmRepository(r) => r.artifact(),
            Source::GitRepository(r) => r.artifact(),
            Source::Bucket(b) => b.artifact(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_kind_round_trips() {
        for kind in ["HelmRepository", "GitRepository", "Bucket"] {
            assert_eq!(SourceKind::from_str(kind).unwrap().as_str(), kind);
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = SourceKind::from_str("ImagePolicy").unwrap_err();
        assert!(err.to_string().contains("ImagePolicy"));
        assert!(err.to_string().contains("unsupported source kind"));
    }
}
