//! Content-addressed blob storage.
//!
//! Blobs are immutable gzip-compressed files named by the SHA-256 of their
//! *uncompressed* contents, laid out with a two-level fan-out under
//! `<root>/blobs/xx/yyyy…`. Writes are staged into `<root>/staging/` and
//! promoted with an atomic rename-if-not-exists, so two concurrent uploads
//! of the same payload collide on the same filename and the filesystem
//! arbitrates: exactly one creates the blob, the other discards its copy.
//!
//! The store knows nothing about paths, versions or reference counts; the
//! link database owns those. Callers must hold the digest lock and have
//! confirmed a zero refcount before [`BlobStore::unlink`].

use std::path::{Path, PathBuf};

use async_compression::tokio::write::GzipEncoder;
use ft_core::Digest;
use rand::RngCore;
use sha2::{Digest as _, Sha256};
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader},
};
use tracing::{debug, warn};

/// Buffer size for the staging pipeline. Large enough to keep the SHA-256
/// implementation fed, small enough to bound per-request memory.
pub const BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("blob {0} not found")]
    NotFound(Digest),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Handle to a fully staged but not yet promoted blob.
///
/// Holds the temp file path; dropping it without [`BlobStore::promote`]
/// unlinks the temp file, so an aborted upload cleans up after itself.
#[derive(Debug)]
pub struct StagedBlob {
    digest: Digest,
    logical_size: u64,
    tmp: Option<PathBuf>,
}

impl StagedBlob {
    /// SHA-256 of the decompressed bytes that were staged.
    pub fn digest(&self) -> Digest {
        self.digest
    }

    /// Decompressed payload length in bytes.
    pub fn logical_size(&self) -> u64 {
        self.logical_size
    }
}

impl Drop for StagedBlob {
    fn drop(&mut self) {
        if let Some(tmp) = self.tmp.take() {
            if let Err(err) = std::fs::remove_file(&tmp) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove staged file {tmp:?}: {err}");
                }
            }
        }
    }
}

/// Content-addressed store rooted at `<root>/blobs` with staging space at
/// `<root>/staging`.
#[derive(Debug, Clone)]
pub struct BlobStore {
    blobs_dir: PathBuf,
    staging_dir: PathBuf,
}

impl BlobStore {
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref();
        let store = BlobStore {
            blobs_dir: root.join("blobs"),
            staging_dir: root.join("staging"),
        };
        std::fs::create_dir_all(&store.blobs_dir)?;
        std::fs::create_dir_all(&store.staging_dir)?;
        Ok(store)
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir.join(digest.fan_out())
    }

    /// Consume a stream of *decompressed* bytes into a staged temp file,
    /// computing SHA-256 and length while gzip-compressing, in one pass
    /// with bounded memory.
    pub async fn stage(&self, mut reader: impl AsyncRead + Unpin) -> StoreResult<StagedBlob> {
        let tmp = self.staging_dir.join(random_token());
        let file = File::create(&tmp).await?;
        let mut encoder = GzipEncoder::new(file);

        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; BUF_SIZE];
        let mut logical_size = 0u64;

        // Keep the temp file owned by a StagedBlob from here on so every
        // failure path below unlinks it on drop.
        let mut staged = StagedBlob {
            digest: Digest::from_bytes([0; 32]),
            logical_size: 0,
            tmp: Some(tmp),
        };

        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            let chunk = &buffer[..n];
            hasher.update(chunk);
            encoder.write_all(chunk).await?;
            logical_size += n as u64;
        }

        // Finish the gzip member, then make the bytes durable before the
        // file can become visible under its digest name.
        encoder.shutdown().await?;
        let file = encoder.into_inner();
        file.sync_all().await?;

        staged.digest = Digest::from_bytes(hasher.finalize().into());
        staged.logical_size = logical_size;
        Ok(staged)
    }

    /// Install a staged blob at its canonical location. Returns whether
    /// this call created the blob file, or `false` when an identical blob
    /// was already present and the staged copy was discarded.
    pub async fn promote(&self, mut staged: StagedBlob) -> StoreResult<bool> {
        let target = self.blob_path(&staged.digest);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // `rename` overwrites on every platform we run on, so link-then-
        // unlink provides the rename-if-not-exists arbitration: the link
        // fails with AlreadyExists when another upload won the race, and
        // the StagedBlob drop below removes the losing temp file.
        let tmp = staged.tmp.take().unwrap_or_default();
        let created = match tokio::fs::hard_link(&tmp, &target).await {
            Ok(()) => true,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!("blob {} already present", staged.digest.fmt_short());
                false
            }
            Err(err) => {
                staged.tmp = Some(tmp);
                return Err(err.into());
            }
        };
        staged.tmp = Some(tmp);
        drop(staged);
        Ok(created)
    }

    /// Open the compressed blob file for reading. The returned length is
    /// the on-disk (compressed) size.
    pub async fn open(&self, digest: &Digest) -> StoreResult<(BufReader<File>, u64)> {
        let path = self.blob_path(digest);
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(*digest));
            }
            Err(err) => return Err(err.into()),
        };
        let len = file.metadata().await?.len();
        Ok((BufReader::with_capacity(BUF_SIZE, file), len))
    }

    pub async fn exists(&self, digest: &Digest) -> StoreResult<bool> {
        match tokio::fs::metadata(self.blob_path(digest)).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Remove a blob file. Caller contract: the digest lock is held and
    /// the refcount was confirmed zero after taking it.
    pub async fn unlink(&self, digest: &Digest) -> StoreResult<()> {
        match tokio::fs::remove_file(self.blob_path(digest)).await {
            Ok(()) => {
                debug!("unlinked blob {}", digest.fmt_short());
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("blob {} already gone", digest.fmt_short());
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Remove leftover staging files. Run at startup: anything still in
    /// staging belongs to an upload that did not survive the last process.
    pub fn clear_staging(&self) -> StoreResult<usize> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.staging_dir)? {
            let entry = entry?;
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) => warn!("failed to remove stale staging file: {err}"),
            }
        }
        Ok(removed)
    }

    /// Enumerate every blob file currently on disk. Used by the startup
    /// sweep; blocking, so callers run it on a blocking thread.
    pub fn scan_blobs(&self) -> Vec<Digest> {
        let mut digests = Vec::new();
        for entry in walkdir::WalkDir::new(&self.blobs_dir)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            match digest_from_entry(&entry) {
                Some(digest) => digests.push(digest),
                None => warn!("foreign file in blob directory: {:?}", entry.path()),
            }
        }
        digests
    }
}

fn digest_from_entry(entry: &walkdir::DirEntry) -> Option<Digest> {
    let tail = entry.file_name().to_str()?;
    let prefix = entry.path().parent()?.file_name()?.to_str()?;
    format!("{prefix}{tail}").parse().ok()
}

fn random_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
