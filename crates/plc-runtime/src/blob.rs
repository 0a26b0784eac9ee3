//! Content-addressed chunked uploads.
//!
//! A transfer starts from a client-chosen seed. Every appended chunk rolls
//! the digest forward and the blob is re-keyed under the new digest, so a
//! client knows its upload arrived intact when the returned id equals the
//! digest it computed locally over `seed || data`.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use smol_str::SmolStr;
use tracing::{debug, warn};

use crate::error::RuntimeError;

const BLOB_PREFIX: &str = "blob-";

/// Lowercase hex encoding of a digest.
#[must_use]
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Id a complete upload of `data` from `seed` ends with.
#[must_use]
pub fn content_id(seed: &[u8], data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(data);
    to_hex(&hasher.finalize())
}

/// Digest identifying a program binary.
#[must_use]
pub fn program_digest(data: &[u8]) -> String {
    to_hex(&Sha256::digest(data))
}

struct PendingBlob {
    hasher: Sha256,
    path: PathBuf,
    file: File,
}

/// Pending uploads, spooled to files under a scratch directory.
pub struct BlobStore {
    dir: PathBuf,
    blobs: Mutex<HashMap<String, PendingBlob>>,
    counter: AtomicU64,
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore")
            .field("dir", &self.dir)
            .field("pending", &self.blobs.lock().len())
            .finish()
    }
}

impl BlobStore {
    /// Open the store, discarding spool files left by a previous process.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, RuntimeError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        remove_spool_files(&dir);
        Ok(Self {
            dir,
            blobs: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
        })
    }

    /// Start a transfer. Returns the id of the empty blob.
    pub fn seed_blob(&self, seed: &[u8]) -> Result<String, RuntimeError> {
        let mut hasher = Sha256::new();
        hasher.update(seed);
        let id = to_hex(&hasher.clone().finalize());
        let serial = self.counter.fetch_add(1, Ordering::SeqCst);
        let path = self
            .dir
            .join(format!("{BLOB_PREFIX}{}-{serial}", std::process::id()));
        let file = File::create(&path)?;
        let replaced = self
            .blobs
            .lock()
            .insert(id.clone(), PendingBlob { hasher, path, file });
        if let Some(old) = replaced {
            discard(old);
        }
        debug!(blob = %id, "blob seeded");
        Ok(id)
    }

    /// Append `chunk` to blob `blob_id`. Returns the blob's new id.
    pub fn append_chunk(&self, chunk: &[u8], blob_id: &str) -> Result<String, RuntimeError> {
        let mut blobs = self.blobs.lock();
        let mut blob = blobs
            .remove(blob_id)
            .ok_or_else(|| RuntimeError::Blob(format!("unknown blob {blob_id}").into()))?;
        if let Err(err) = blob.file.write_all(chunk) {
            discard(blob);
            return Err(err.into());
        }
        blob.hasher.update(chunk);
        let id = to_hex(&blob.hasher.clone().finalize());
        if let Some(old) = blobs.insert(id.clone(), blob) {
            discard(old);
        }
        Ok(id)
    }

    #[must_use]
    pub fn contains(&self, blob_id: &str) -> bool {
        self.blobs.lock().contains_key(blob_id)
    }

    /// Consume several blobs at once, one buffer per requested id. An id
    /// listed twice yields the same data twice. Nothing is consumed unless
    /// every id is known.
    pub fn take_all(&self, ids: &[&str]) -> Result<Vec<Vec<u8>>, RuntimeError> {
        let taken = {
            let mut blobs = self.blobs.lock();
            if let Some(missing) = ids.iter().find(|id| !blobs.contains_key(**id)) {
                return Err(RuntimeError::Blob(
                    format!("unknown blob {missing}").into(),
                ));
            }
            ids.iter()
                .filter_map(|id| blobs.remove_entry(*id))
                .collect::<Vec<_>>()
        };
        let mut data = HashMap::with_capacity(taken.len());
        for (id, blob) in taken {
            data.insert(id, read_and_discard(blob)?);
        }
        ids.iter()
            .map(|id| {
                data.get(*id).cloned().ok_or_else(|| {
                    RuntimeError::Blob(format!("unknown blob {id}").into())
                })
            })
            .collect()
    }

    /// Consume one blob.
    pub fn take(&self, blob_id: &str) -> Result<Vec<u8>, RuntimeError> {
        self.take_all(&[blob_id])
            .map(|mut data| data.pop().unwrap_or_default())
    }

    /// Drop every pending transfer.
    pub fn purge(&self) {
        let drained: Vec<_> = self.blobs.lock().drain().map(|(_, blob)| blob).collect();
        let count = drained.len();
        drained.into_iter().for_each(discard);
        debug!(count, "blobs purged");
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for BlobStore {
    fn drop(&mut self) {
        self.purge();
    }
}

fn read_and_discard(mut blob: PendingBlob) -> Result<Vec<u8>, RuntimeError> {
    blob.file.flush()?;
    let data = fs::read(&blob.path)
        .map_err(|err| RuntimeError::Blob(SmolStr::new(format!("read spool: {err}"))));
    discard(blob);
    data
}

fn discard(blob: PendingBlob) {
    let PendingBlob { path, file, .. } = blob;
    drop(file);
    if let Err(err) = fs::remove_file(&path) {
        warn!(path = %path.display(), "removing blob spool failed: {err}");
    }
}

fn remove_spool_files(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let is_spool = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(BLOB_PREFIX));
        if is_spool {
            let _ = fs::remove_file(entry.path());
        }
    }
}
