//! The persistent per-path metadata record.

use serde::{Deserialize, Serialize};

use crate::{Digest, Version};

/// Value of a `links` table entry: everything the server knows about one
/// stored path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    /// Identity of the blob this path points at.
    pub digest: Digest,
    /// Logical modification time asserted by the client that wrote it.
    pub version: Version,
    /// Byte length of the uncompressed payload.
    pub logical_size: u64,
    /// Whether the stored blob file is gzip-encoded. Pass-through storage
    /// is admitted by the design even though uploads always compress today.
    pub compressed: bool,
}

#[derive(Debug, thiserror::Error)]
#[error("link record encoding: {0}")]
pub struct RecordError(#[from] postcard::Error);

impl LinkRecord {
    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        Ok(postcard::to_stdvec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode() {
        let record = LinkRecord {
            digest: Digest::of(b"hello"),
            version: Version::from_timestamp(1_704_067_200),
            logical_size: 5,
            compressed: true,
        };
        let bytes = record.encode().unwrap();
        assert_eq!(LinkRecord::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn decode_rejects_truncation() {
        let record = LinkRecord {
            digest: Digest::of(b"x"),
            version: Version::from_timestamp(0),
            logical_size: 1,
            compressed: false,
        };
        let bytes = record.encode().unwrap();
        assert!(LinkRecord::decode(&bytes[..bytes.len() - 1]).is_err());
    }
}
