//! Content-addressed artifact storage.
//!
//! Layout: `<root>/<kind>/<namespace>/<name>/<filename>` with a
//! `latest.tar.gz` symlink per object. Writers stage into a temporary file
//! and rename, so readers never observe partial files. A `.lock` sidecar
//! serializes writers of one object.

pub mod ignore;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use fs4::FileExt;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::models::Artifact;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("timed out acquiring lock for '{path}' after {timeout:?}")]
    LockAcquireTimeout { path: PathBuf, timeout: Duration },

    #[error("artifact path '{0}' escapes the storage root")]
    InvalidPath(PathBuf),
}

/// Artifact storage rooted at a local directory.
pub struct Storage {
    root: PathBuf,
    hostname: String,
    artifact_retention_ttl: Duration,
    artifact_retention_records: usize,
}

/// Held while writing an object's artifacts; releases the `.lock` sidecar
/// on drop.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let _ = fs::remove_file(&self.path);
    }
}

impl Storage {
    pub fn new(
        root: impl Into<PathBuf>,
        hostname: impl Into<String>,
        artifact_retention_ttl: Duration,
        artifact_retention_records: usize,
    ) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            hostname: hostname.into(),
            artifact_retention_ttl,
            artifact_retention_records,
        })
    }

    /// Returns a new Artifact for the object with its storage path and URL
    /// set. The file itself is not created.
    pub fn artifact_for(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
        revision: &str,
        filename: &str,
    ) -> Artifact {
        let path = format!("{}/{}/{}/{}", kind.to_lowercase(), namespace, name, filename);
        let mut artifact = Artifact {
            path,
            revision: revision.to_string(),
            ..Default::default()
        };
        self.set_artifact_url(&mut artifact);
        artifact
    }

    /// Absolute filesystem path of the artifact.
    pub fn local_path(&self, artifact: &Artifact) -> PathBuf {
        self.root.join(&artifact.path)
    }

    pub fn artifact_exists(&self, artifact: &Artifact) -> bool {
        self.local_path(artifact).is_file()
    }

    /// Verifies the artifact file matches its advertised checksum.
    pub fn verify_artifact(&self, artifact: &Artifact) -> Result<bool, StorageError> {
        let expected = match &artifact.checksum {
            Some(c) => c,
            None => return Ok(false),
        };
        let mut file = File::open(self.local_path(artifact))?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(&hex::encode(hasher.finalize()) == expected)
    }

    pub fn mkdir_all(&self, artifact: &Artifact) -> Result<(), StorageError> {
        let dir = self.object_dir(artifact)?;
        fs::create_dir_all(dir)?;
        Ok(())
    }

    /// Acquires the object's write lock, waiting up to `timeout`.
    pub fn lock(&self, artifact: &Artifact, timeout: Duration) -> Result<LockGuard, StorageError> {
        let dir = self.object_dir(artifact)?;
        fs::create_dir_all(&dir)?;
        let lock_path = dir.join(".lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(LockGuard {
                        file,
                        path: lock_path,
                    })
                }
                Err(_) if start.elapsed() < timeout => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(_) => {
                    return Err(StorageError::LockAcquireTimeout {
                        path: lock_path,
                        timeout,
                    })
                }
            }
        }
    }

    /// Copies the file at `src` into storage, filling in checksum, size,
    /// update time and URL on the artifact.
    pub fn copy_from_path(&self, artifact: &mut Artifact, src: &Path) -> Result<(), StorageError> {
        self.mkdir_all(artifact)?;
        let dest = self.local_path(artifact);
        let tmp = tmp_sibling(&dest);

        let mut reader = File::open(src)?;
        let mut writer = HashingWriter::new(File::create(&tmp)?);
        if let Err(err) = io::copy(&mut reader, &mut writer) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        let (checksum, size) = writer.finish()?;
        fs::rename(&tmp, &dest)?;

        artifact.checksum = Some(checksum);
        artifact.size = Some(size as i64);
        artifact.last_update_time = Some(Utc::now());
        self.set_artifact_url(artifact);
        debug!(path = %artifact.path, "copied artifact to storage");
        Ok(())
    }

    /// Archives the directory contents as a gzipped tarball, skipping paths
    /// excluded by the filter.
    pub fn archive(
        &self,
        artifact: &mut Artifact,
        dir: &Path,
        filter: Option<&dyn Fn(&str, bool) -> bool>,
    ) -> Result<(), StorageError> {
        self.mkdir_all(artifact)?;
        let dest = self.local_path(artifact);
        let tmp = tmp_sibling(&dest);

        let result = (|| -> Result<(String, u64), StorageError> {
            let writer = HashingWriter::new(File::create(&tmp)?);
            let encoder = GzEncoder::new(writer, Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder.follow_symlinks(false);
            append_dir(&mut builder, dir, dir, filter)?;
            let writer = builder.into_inner()?.finish()?;
            Ok(writer.finish()?)
        })();

        let (checksum, size) = match result {
            Ok(v) => v,
            Err(err) => {
                let _ = fs::remove_file(&tmp);
                return Err(err);
            }
        };
        fs::rename(&tmp, &dest)?;

        artifact.checksum = Some(checksum);
        artifact.size = Some(size as i64);
        artifact.last_update_time = Some(Utc::now());
        self.set_artifact_url(artifact);
        debug!(path = %artifact.path, "archived artifact to storage");
        Ok(())
    }

    /// Points the object's `linkname` symlink at the artifact and returns
    /// the symlink URL.
    pub fn symlink(&self, artifact: &Artifact, linkname: &str) -> Result<String, StorageError> {
        let dest = self.local_path(artifact);
        let dir = self.object_dir(artifact)?;
        let link = dir.join(linkname);
        let tmp_link = tmp_sibling(&link);

        let target = dest
            .file_name()
            .map(PathBuf::from)
            .ok_or_else(|| StorageError::InvalidPath(dest.clone()))?;
        let _ = fs::remove_file(&tmp_link);
        std::os::unix::fs::symlink(target, &tmp_link)?;
        fs::rename(&tmp_link, &link)?;

        let mut rel = PathBuf::from(&artifact.path);
        rel.set_file_name(linkname);
        Ok(self.url_for(&rel.to_string_lossy()))
    }

    /// Removes the object's whole artifact subtree. Returns the deleted
    /// path when something was removed.
    pub fn remove_all(&self, artifact: &Artifact) -> Result<Option<String>, StorageError> {
        let dir = self.object_dir(artifact)?;
        if !dir.exists() {
            return Ok(None);
        }
        fs::remove_dir_all(&dir)?;
        Ok(Some(dir.to_string_lossy().into_owned()))
    }

    /// Removes artifacts beyond the retention TTL or record count, keeping
    /// the currently advertised one. Returns the deleted paths.
    pub fn garbage_collect(
        &self,
        artifact: &Artifact,
        lock_timeout: Duration,
    ) -> Result<Vec<PathBuf>, StorageError> {
        let dir = self.object_dir(artifact)?;
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let _guard = self.lock(artifact, lock_timeout)?;

        let current = self.local_path(artifact);
        let mut entries: Vec<(PathBuf, SystemTime)> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let meta = entry.metadata()?;
            // Skip the lock sidecar and the latest symlink.
            if !meta.is_file() || meta.file_type().is_symlink() {
                continue;
            }
            if path.file_name().map(|n| n == ".lock").unwrap_or(false) {
                continue;
            }
            entries.push((path, meta.modified()?));
        }
        // Newest first; retention index counts from the newest file.
        entries.sort_by(|a, b| b.1.cmp(&a.1));

        let now = SystemTime::now();
        let mut deleted = Vec::new();
        for (index, (path, modified)) in entries.into_iter().enumerate() {
            if path == current {
                continue;
            }
            let age = now.duration_since(modified).unwrap_or_default();
            if age < self.artifact_retention_ttl && index < self.artifact_retention_records {
                continue;
            }
            fs::remove_file(&path)?;
            deleted.push(path);
        }
        Ok(deleted)
    }

    /// Sets the artifact URL from its storage path and the configured
    /// hostname.
    pub fn set_artifact_url(&self, artifact: &mut Artifact) {
        artifact.url = self.url_for(&artifact.path);
    }

    /// Rewrites the host part of a storage URL to the configured hostname.
    pub fn set_hostname(&self, url: &str) -> String {
        match url.split_once("://") {
            Some((scheme, rest)) => match rest.split_once('/') {
                Some((_, path)) => format!("{}://{}/{}", scheme, self.hostname, path),
                None => format!("{}://{}", scheme, self.hostname),
            },
            None => url.to_string(),
        }
    }

    fn url_for(&self, path: &str) -> String {
        format!("http://{}/{}", self.hostname, path)
    }

    fn object_dir(&self, artifact: &Artifact) -> Result<PathBuf, StorageError> {
        let path = self.root.join(&artifact.path);
        let dir = path
            .parent()
            .ok_or_else(|| StorageError::InvalidPath(path.clone()))?;
        if !dir.starts_with(&self.root) {
            return Err(StorageError::InvalidPath(path.clone()));
        }
        Ok(dir.to_path_buf())
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".tmp");
    path.with_file_name(name)
}

fn append_dir(
    builder: &mut tar::Builder<impl Write>,
    root: &Path,
    dir: &Path,
    filter: Option<&dyn Fn(&str, bool) -> bool>,
) -> Result<(), StorageError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        let rel = path
            .strip_prefix(root)
            .map_err(|_| StorageError::InvalidPath(path.clone()))?
            .to_string_lossy()
            .into_owned();
        if let Some(filter) = filter {
            if filter(&rel, meta.is_dir()) {
                continue;
            }
        }
        if meta.is_dir() {
            builder.append_dir(&rel, &path)?;
            append_dir(builder, root, &path, filter)?;
        } else if meta.is_file() {
            builder.append_path_with_name(&path, &rel)?;
        }
    }
    Ok(())
}

/// Writer that hashes and counts bytes on their way to the inner writer.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(mut self) -> io::Result<(String, u64)> {
        self.inner.flush()?;
        Ok((hex::encode(self.hasher.finalize()), self.written))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reads the file and returns its hex-encoded SHA256 checksum.
pub fn file_checksum(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
