//! Core filetracker types.
//!
//! This crate defines the shared types used by all filetracker crates.
//!
//! ## Persistent / wire-stable types
//!
//! - Content digests ([`Digest`]) — SHA-256 of the uncompressed payload,
//!   rendered as lowercase hex on the wire and on disk.
//! - Logical modification times ([`Version`]) — client-asserted RFC 2822
//!   timestamps with second resolution.
//! - Link records ([`LinkRecord`]) — the per-path metadata persisted in the
//!   link database.
//!
//! These types are used directly in the HTTP protocol and in persistent
//! metadata; changes to them are protocol changes.
//!
//! ## Request-scoped types
//!
//! [`FilePath`] canonicalizes and validates client-supplied storage paths.
//! Construction is the only validation point: a `FilePath` value is always
//! canonical and safe to use as a database key.

pub mod digest;
pub mod path;
pub mod record;
pub mod version;

pub use digest::{Digest, DigestError};
pub use path::{FilePath, PathError};
pub use record::{LinkRecord, RecordError};
pub use version::{Version, VersionError};
