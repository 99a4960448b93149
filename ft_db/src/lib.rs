//! The link database: a transactional map from storage paths to blobs.
//!
//! Two tables live in one redb database file:
//!
//! - `links`: canonical path → encoded [`LinkRecord`],
//! - `refs`: blob digest → number of links pointing at it.
//!
//! Every modifying operation is a single write transaction across both
//! tables, so the refcount invariants hold even across a crash: a link is
//! never visible without its refcount bump, and a refcount never drops
//! without its link going away in the same commit.
//!
//! Version comparison lives here, in the transaction, not in the HTTP
//! layer: a write whose version is not strictly newer than the stored one
//! ("older or equal loses") commits nothing, and a delete succeeds when its
//! version is at least the stored one.
//!
//! redb transactions are synchronous, so all database work runs on
//! `spawn_blocking` threads.

use std::{path::Path, sync::Arc};

use ft_core::{Digest, FilePath, LinkRecord, RecordError, Version};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use tokio::sync::mpsc;
use tracing::debug;

const LINKS: TableDefinition<&str, &[u8]> = TableDefinition::new("links");
const REFS: TableDefinition<&[u8], u64> = TableDefinition::new("refs");

/// How many listing entries may be buffered between the range scan and the
/// HTTP response before the scan is paused.
const LIST_CHANNEL_DEPTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error(transparent)]
    Db(#[from] redb::Error),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("link database task failed: {0}")]
    Join(String),
}

macro_rules! via_redb_error {
    ($($err:ty),+) => {
        $(impl From<$err> for DbError {
            fn from(err: $err) -> Self {
                DbError::Db(err.into())
            }
        })+
    };
}

via_redb_error!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError
);

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The path did not exist before.
    Created,
    /// The path existed with an older version and was overwritten.
    /// `orphaned` carries the old digest when its refcount reached zero,
    /// meaning the caller now owns unlinking the blob file.
    Replaced { orphaned: Option<Digest> },
    /// The stored version is newer or equal; nothing changed.
    Stale { current: Version },
}

/// Result of a conditional delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The link was removed. `orphaned` is the digest to unlink when its
    /// refcount reached zero; `version` is the version that was stored.
    Deleted {
        orphaned: Option<Digest>,
        version: Version,
    },
    /// The stored version is strictly newer; the link was retained.
    Stale { current: Version },
    /// No link at that path.
    Missing,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DbStats {
    pub links: u64,
    pub blobs: u64,
}

/// Handle to the link database. Cheap to clone; redb serializes its own
/// write transactions.
#[derive(Clone)]
pub struct LinkDb {
    db: Arc<Database>,
}

impl std::fmt::Debug for LinkDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkDb").finish()
    }
}

impl LinkDb {
    /// Open (or create) the database at `<dir>/links.redb`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, DbError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|err| {
            DbError::Db(redb::DatabaseError::Storage(redb::StorageError::Io(err)).into())
        })?;
        let db = Database::create(dir.join("links.redb"))?;

        // Create both tables up front so a fresh database serves reads
        // without hitting TableDoesNotExist.
        let txn = db.begin_write()?;
        {
            let _ = txn.open_table(LINKS)?;
            let _ = txn.open_table(REFS)?;
        }
        txn.commit()?;

        Ok(LinkDb { db: Arc::new(db) })
    }

    pub async fn get(&self, path: &FilePath) -> Result<Option<LinkRecord>, DbError> {
        let db = self.db.clone();
        let key = path.as_str().to_owned();

        run_blocking(move || {
            let txn = db.begin_read()?;
            let table = txn.open_table(LINKS)?;
            table
                .get(key.as_str())?
                .map(|guard| LinkRecord::decode(guard.value()).map_err(DbError::from))
                .transpose()
        })
        .await
    }

    /// Insert or overwrite the link at `path` if `record.version` is
    /// strictly newer than what is stored. Refcounts for both the new and
    /// the old digest are adjusted in the same transaction.
    pub async fn put_if_newer(
        &self,
        path: &FilePath,
        record: LinkRecord,
    ) -> Result<PutOutcome, DbError> {
        let db = self.db.clone();
        let key = path.as_str().to_owned();

        run_blocking(move || {
            let txn = db.begin_write()?;
            let outcome;
            {
                let mut links = txn.open_table(LINKS)?;
                let mut refs = txn.open_table(REFS)?;

                let existing = links
                    .get(key.as_str())?
                    .map(|guard| LinkRecord::decode(guard.value()))
                    .transpose()?;

                outcome = match existing {
                    Some(current) if current.version >= record.version => PutOutcome::Stale {
                        current: current.version,
                    },
                    Some(current) => {
                        links.insert(key.as_str(), record.encode()?.as_slice())?;
                        if current.digest != record.digest {
                            bump_ref(&mut refs, &record.digest)?;
                            let orphaned = release_ref(&mut refs, &current.digest)?;
                            PutOutcome::Replaced { orphaned }
                        } else {
                            PutOutcome::Replaced { orphaned: None }
                        }
                    }
                    None => {
                        links.insert(key.as_str(), record.encode()?.as_slice())?;
                        bump_ref(&mut refs, &record.digest)?;
                        PutOutcome::Created
                    }
                };
            }
            txn.commit()?;
            Ok(outcome)
        })
        .await
    }

    /// Remove the link at `path` if `version` is at least the stored
    /// version.
    pub async fn delete_if_newer(
        &self,
        path: &FilePath,
        version: Version,
    ) -> Result<DeleteOutcome, DbError> {
        let db = self.db.clone();
        let key = path.as_str().to_owned();

        run_blocking(move || {
            let txn = db.begin_write()?;
            let outcome;
            {
                let mut links = txn.open_table(LINKS)?;
                let mut refs = txn.open_table(REFS)?;

                let existing = links
                    .get(key.as_str())?
                    .map(|guard| LinkRecord::decode(guard.value()))
                    .transpose()?;

                outcome = match existing {
                    None => DeleteOutcome::Missing,
                    Some(current) if current.version > version => DeleteOutcome::Stale {
                        current: current.version,
                    },
                    Some(current) => {
                        links.remove(key.as_str())?;
                        let orphaned = release_ref(&mut refs, &current.digest)?;
                        DeleteOutcome::Deleted {
                            orphaned,
                            version: current.version,
                        }
                    }
                };
            }
            txn.commit()?;
            Ok(outcome)
        })
        .await
    }

    /// Range-scan all links whose path starts with `prefix` (a canonical
    /// directory prefix ending in `/`), yielding prefix-stripped relative
    /// paths for records with a version strictly older than `cutoff`.
    ///
    /// Emission is lazy: entries flow through a bounded channel, and the
    /// scan pauses when the consumer falls behind and stops when the
    /// receiver is dropped. The scan runs under one read transaction, so
    /// each yielded record is consistent, but the listing as a whole is
    /// not a point-in-time snapshot of concurrent writers.
    pub fn list(&self, prefix: String, cutoff: Version) -> mpsc::Receiver<Result<String, DbError>> {
        let (tx, rx) = mpsc::channel(LIST_CHANNEL_DEPTH);
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || {
            let scan = || -> Result<(), DbError> {
                let txn = db.begin_read()?;
                let table = txn.open_table(LINKS)?;
                for entry in table.range(prefix.as_str()..)? {
                    let (key, value) = entry?;
                    let key = key.value();
                    if !key.starts_with(&prefix) {
                        break;
                    }
                    let record = LinkRecord::decode(value.value())?;
                    if record.version >= cutoff {
                        continue;
                    }
                    let relative = key[prefix.len()..].to_owned();
                    if tx.blocking_send(Ok(relative)).is_err() {
                        break;
                    }
                }
                Ok(())
            };
            if let Err(err) = scan() {
                debug!("listing scan aborted: {err}");
                let _ = tx.blocking_send(Err(err));
            }
        });

        rx
    }

    /// Current refcount for a digest; zero when unknown.
    pub async fn refcount(&self, digest: &Digest) -> Result<u64, DbError> {
        let db = self.db.clone();
        let digest = *digest;

        run_blocking(move || {
            let txn = db.begin_read()?;
            let table = txn.open_table(REFS)?;
            Ok(table
                .get(digest.as_bytes().as_slice())?
                .map(|guard| guard.value())
                .unwrap_or(0))
        })
        .await
    }

    pub async fn stats(&self) -> Result<DbStats, DbError> {
        let db = self.db.clone();

        run_blocking(move || {
            let txn = db.begin_read()?;
            let links = txn.open_table(LINKS)?;
            let refs = txn.open_table(REFS)?;
            Ok(DbStats {
                links: links.len()?,
                blobs: refs.len()?,
            })
        })
        .await
    }
}

async fn run_blocking<T: Send + 'static>(
    f: impl FnOnce() -> Result<T, DbError> + Send + 'static,
) -> Result<T, DbError> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| DbError::Join(err.to_string()))?
}

fn bump_ref(
    refs: &mut redb::Table<'_, &'static [u8], u64>,
    digest: &Digest,
) -> Result<(), DbError> {
    let key = digest.as_bytes().as_slice();
    let count = refs.get(key)?.map(|guard| guard.value()).unwrap_or(0);
    refs.insert(key, count + 1)?;
    Ok(())
}

/// Decrement a refcount, removing the row at zero. Returns the digest when
/// it reached zero, i.e. when its blob file is now garbage.
fn release_ref(
    refs: &mut redb::Table<'_, &'static [u8], u64>,
    digest: &Digest,
) -> Result<Option<Digest>, DbError> {
    let key = digest.as_bytes().as_slice();
    let count = refs.get(key)?.map(|guard| guard.value()).unwrap_or(0);
    if count <= 1 {
        refs.remove(key)?;
        Ok(Some(*digest))
    } else {
        refs.insert(key, count - 1)?;
        Ok(None)
    }
}
