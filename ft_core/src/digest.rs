//! The content digest type used by filetracker (SHA-256, 32 bytes).

use std::{borrow::Borrow, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// SHA-256 of the *uncompressed* payload of a blob. The digest is the
/// identity of the blob: equal payloads share one on-disk file.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest([u8; 32]);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DigestError {
    #[error("digest must be 64 lowercase hex characters, got {0} characters")]
    Length(usize),
    #[error("digest is not lowercase hex")]
    Encoding,
}

impl Digest {
    /// Compute the digest of a full in-memory payload.
    ///
    /// Streaming callers feed a [`sha2::Sha256`] incrementally and convert
    /// the result with [`Digest::from_bytes`] instead.
    pub fn of(buf: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(buf.as_ref());
        Digest(hasher.finalize().into())
    }

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert the digest to its canonical lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Relative on-disk location of the blob with this digest: a two-level
    /// fan-out `xx/yyyy…` so no single directory grows unbounded.
    pub fn fan_out(&self) -> String {
        let hex = self.to_hex();
        format!("{}/{}", &hex[..2], &hex[2..])
    }

    /// First few bytes as hex, for log lines.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..5])
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(DigestError::Length(s.len()));
        }
        // Uppercase hex is rejected: the wire format is lowercase only.
        if s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(DigestError::Encoding);
        }
        let bytes = hex::decode(s).map_err(|_| DigestError::Encoding)?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Digest(arr))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Borrow<[u8; 32]> for Digest {
    fn borrow(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for Digest {
    fn from(value: [u8; 32]) -> Self {
        Digest(value)
    }
}

impl From<Digest> for [u8; 32] {
    fn from(value: Digest) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // sha256("hello")
        let d = Digest::of(b"hello");
        assert_eq!(
            d.to_hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn hex_round_trip() {
        let d = Digest::of(b"some payload");
        let parsed: Digest = d.to_hex().parse().unwrap();
        assert_eq!(parsed, d);
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!("abc".parse::<Digest>(), Err(DigestError::Length(3)));
        let upper = Digest::of(b"x").to_hex().to_uppercase();
        assert_eq!(upper.parse::<Digest>(), Err(DigestError::Encoding));
        let nonhex = "zz".repeat(32);
        assert_eq!(nonhex.parse::<Digest>(), Err(DigestError::Encoding));
    }

    #[test]
    fn fan_out_splits_after_two() {
        let d = Digest::of(b"hello");
        assert!(d.fan_out().starts_with("2c/f24dba"));
    }
}
