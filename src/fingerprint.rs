//! Checksum kind and fingerprint type (spec.md §3, §7).
//!
//! spec.md is explicit that the checksum *algorithms* are out of scope,
//! "specified only by fingerprint size and a `Sum(bytes)->digest` contract".
//! `pegasusheavy-btrf-mount-windows/src/core/checksum.rs` takes the same
//! stance in a real repo: it defines all four kinds but only backs CRC32c
//! with a real implementation, leaving the others commented "not yet
//! implemented". We go one step further and back XXHASH/SHA256 for real
//! too (`twox-hash`/`sha2` are trivial, real crates), leaving only BLAKE2
//! unimplemented, matching that same "not yet implemented" texture.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ChecksumError;

pub const MAX_CSUM_SIZE: usize = 32;

#[repr(u16)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ChecksumKind {
    Crc32c = 0,
    XxHash64 = 1,
    Sha256 = 2,
    Blake2 = 3,
}

impl ChecksumKind {
    pub fn from_u16(v: u16) -> Option<ChecksumKind> {
        Some(match v {
            0 => ChecksumKind::Crc32c,
            1 => ChecksumKind::XxHash64,
            2 => ChecksumKind::Sha256,
            3 => ChecksumKind::Blake2,
            _ => return None,
        })
    }

    /// Digest size in bytes. The on-disk checksum field is always
    /// [`MAX_CSUM_SIZE`] bytes; shorter digests are zero-padded, matching
    /// the teacher's `csum_data_crc32`, which always returns a 32-byte
    /// buffer even though CRC32c only occupies the first 4.
    pub const fn size(self) -> usize {
        match self {
            ChecksumKind::Crc32c => 4,
            ChecksumKind::XxHash64 => 8,
            ChecksumKind::Sha256 => 32,
            ChecksumKind::Blake2 => 32,
        }
    }
}

/// A fixed-size digest, always stored as the full 32-byte on-disk field
/// regardless of how many bytes the algorithm actually produced.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; MAX_CSUM_SIZE]);

impl Fingerprint {
    pub const fn zero() -> Fingerprint {
        Fingerprint([0u8; MAX_CSUM_SIZE])
    }

    pub fn from_bytes(bytes: &[u8]) -> Fingerprint {
        let mut buf = [0u8; MAX_CSUM_SIZE];
        let n = bytes.len().min(MAX_CSUM_SIZE);
        buf[..n].copy_from_slice(&bytes[..n]);
        Fingerprint(buf)
    }

    /// Computes the digest of `data` under `kind`, padded/truncated to the
    /// full on-disk field width.
    pub fn sum(kind: ChecksumKind, data: &[u8]) -> Result<Fingerprint, ChecksumError> {
        let mut out = [0u8; MAX_CSUM_SIZE];
        match kind {
            ChecksumKind::Crc32c => {
                let v = crc32c::crc32c(data);
                out[..4].copy_from_slice(&v.to_le_bytes());
            }
            ChecksumKind::XxHash64 => {
                use std::hash::Hasher;
                let mut h = twox_hash::XxHash64::with_seed(0);
                h.write(data);
                out[..8].copy_from_slice(&h.finish().to_le_bytes());
            }
            ChecksumKind::Sha256 => {
                use sha2::{Digest, Sha256};
                let digest = Sha256::digest(data);
                out.copy_from_slice(&digest);
            }
            ChecksumKind::Blake2 => {
                return Err(ChecksumError::Unsupported(kind));
            }
        }
        Ok(Fingerprint(out))
    }

    pub fn as_slice(&self, kind: ChecksumKind) -> &[u8] {
        &self.0[..kind.size()]
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        Ok(Fingerprint::from_bytes(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32c_matches_known_value() {
        // well-known CRC32C("123456789") = 0xE3069283
        let fp = Fingerprint::sum(ChecksumKind::Crc32c, b"123456789").unwrap();
        let v = u32::from_le_bytes(fp.0[..4].try_into().unwrap());
        assert_eq!(v, 0xE306_9283);
    }

    #[test]
    fn blake2_is_unsupported() {
        let err = Fingerprint::sum(ChecksumKind::Blake2, b"x").unwrap_err();
        matches!(err, ChecksumError::Unsupported(ChecksumKind::Blake2));
    }

    #[test]
    fn size_matches_digest_width() {
        assert_eq!(ChecksumKind::Crc32c.size(), 4);
        assert_eq!(ChecksumKind::Sha256.size(), 32);
    }
}
