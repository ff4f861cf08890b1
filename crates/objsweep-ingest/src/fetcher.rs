//! Local materialization of remote objects

use objsweep_common::{ObjectDescriptor, Result, SweepError};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument};

use crate::store::ObjectStore;

/// Map an object key to its local path by replacing the leading `prefix`
/// with `download_dir`.
///
/// `("in/a/b.pdf", "in/", "/tmp/out/")` becomes `/tmp/out/a/b.pdf`. When the
/// prefix has no trailing `/`, the one separator after it is dropped too.
/// Keys whose remainder is empty, absolute, has empty segments (`a//b`) or
/// walks upwards are rejected: two keys never share a local path, and nothing
/// is ever written outside `download_dir`.
pub fn derive_local_path(key: &str, prefix: &str, download_dir: &Path) -> Result<PathBuf> {
    let mut remainder = key
        .strip_prefix(prefix)
        .ok_or_else(|| SweepError::fetch(key, format!("key is outside prefix '{}'", prefix)))?;

    if !prefix.is_empty() && !prefix.ends_with('/') {
        remainder = remainder.strip_prefix('/').unwrap_or(remainder);
    }

    if remainder.is_empty() {
        return Err(SweepError::fetch(key, "key has no name below the prefix"));
    }

    if remainder.split('/').any(str::is_empty) {
        return Err(SweepError::fetch(
            key,
            "key has empty path segments and cannot be mapped to a unique local path",
        ));
    }

    let relative = Path::new(remainder);
    if !relative
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
    {
        return Err(SweepError::fetch(
            key,
            "key contains path components that escape the download directory",
        ));
    }

    Ok(download_dir.join(relative))
}

pub struct ObjectFetcher<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ObjectStore + ?Sized> ObjectFetcher<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Stream the object to `destination`, returning the number of bytes
    /// written.
    ///
    /// Bytes land in a temporary sibling file that is renamed over
    /// `destination` only once the download is complete and its length
    /// matches the listed size. On any failure (or if the future is dropped)
    /// the temporary file is removed and a previous `destination` is left as
    /// it was.
    #[instrument(skip(self, descriptor), fields(key = %descriptor.key))]
    pub async fn fetch(&self, descriptor: &ObjectDescriptor, destination: &Path) -> Result<u64> {
        let key = descriptor.key.as_str();
        let fail = |reason: String| SweepError::fetch(key, reason);

        let parent = destination
            .parent()
            .ok_or_else(|| fail(format!("no parent directory for {}", destination.display())))?;

        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| fail(format!("cannot create {}: {}", parent.display(), e)))?;

        let dir = parent.to_path_buf();
        let partial = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(".objsweep-")
                .suffix(".part")
                .tempfile_in(dir)
        })
        .await
        .map_err(|e| fail(format!("temporary file task failed: {}", e)))?
        .map_err(|e| fail(format!("cannot create temporary file: {}", e)))?;

        let mut body = self
            .store
            .get_object(&descriptor.bucket, key)
            .await
            .map_err(|e| fail(format!("{:#}", e)))?;

        let file = partial
            .as_file()
            .try_clone()
            .map_err(|e| fail(format!("cannot open temporary file: {}", e)))?;
        let mut writer = BufWriter::new(tokio::fs::File::from_std(file));

        let written = tokio::io::copy(&mut body, &mut writer)
            .await
            .map_err(|e| fail(format!("download interrupted: {}", e)))?;

        writer
            .flush()
            .await
            .map_err(|e| fail(format!("cannot write {}: {}", destination.display(), e)))?;
        writer
            .into_inner()
            .sync_all()
            .await
            .map_err(|e| fail(format!("cannot sync {}: {}", destination.display(), e)))?;

        if descriptor.size >= 0 && written != descriptor.size as u64 {
            return Err(fail(format!(
                "truncated download: listed {} bytes, received {}",
                descriptor.size, written
            )));
        }

        let target = destination.to_path_buf();
        tokio::task::spawn_blocking(move || partial.persist(target))
            .await
            .map_err(|e| fail(format!("rename task failed: {}", e)))?
            .map_err(|e| fail(format!("cannot move into {}: {}", destination.display(), e.error)))?;

        debug!(path = %destination.display(), bytes = written, "Materialized object");
        Ok(written)
    }
}
