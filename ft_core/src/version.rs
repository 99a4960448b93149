//! Logical modification times.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A client-asserted logical modification time with second resolution.
///
/// Versions travel on the wire as RFC 2822 dates (`Mon, 01 Jan 2024
/// 00:00:00 +0000`) and are totally ordered by the instant they denote.
/// The server never invents one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(i64);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid RFC 2822 date: {0:?}")]
pub struct VersionError(pub String);

impl Version {
    pub const fn from_timestamp(secs: i64) -> Self {
        Version(secs)
    }

    pub const fn timestamp(&self) -> i64 {
        self.0
    }

    /// Parse an RFC 2822 date, normalizing to UTC seconds.
    pub fn parse_rfc2822(s: &str) -> Result<Self, VersionError> {
        let dt = DateTime::parse_from_rfc2822(s).map_err(|_| VersionError(s.to_owned()))?;
        Ok(Version(dt.timestamp()))
    }

    /// Canonical wire rendering: zero-padded day, `+0000` offset.
    /// Comparisons happen on the denoted instant, not the rendered string.
    pub fn to_rfc2822(&self) -> String {
        let dt = match Utc.timestamp_opt(self.0, 0) {
            chrono::LocalResult::Single(dt) => dt,
            // Out-of-range timestamps cannot be constructed via parsing.
            _ => DateTime::UNIX_EPOCH,
        };
        // chrono's own to_rfc2822 leaves single-digit days unpadded;
        // existing clients expect the two-digit form.
        dt.format("%a, %d %b %Y %H:%M:%S +0000").to_string()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc2822())
    }
}
