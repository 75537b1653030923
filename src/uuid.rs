//! Typed UUID wrapper (spec.md §3).
//!
//! The teacher's `dump.rs::uuid_str` formats a raw `[u8; 16]` by hand into
//! the canonical `8-4-4-4-12` hex grouping. We keep that same canonical
//! rendering but back it with the real `uuid` crate instead of ad hoc
//! `format!` calls, so filesystem/chunk-tree/subvolume uuids compare and
//! hash like any other value instead of raw byte arrays.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::structures::BtrfsUuid;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Uuid(pub uuid::Uuid);

impl Uuid {
    pub const fn nil() -> Uuid {
        Uuid(uuid::Uuid::nil())
    }

    pub fn from_bytes(b: BtrfsUuid) -> Uuid {
        Uuid(uuid::Uuid::from_bytes(b))
    }

    pub fn as_bytes(&self) -> BtrfsUuid {
        *self.0.as_bytes()
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Uuid {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Uuid {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        uuid::Uuid::parse_str(&s)
            .map(Uuid)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_round_trips_through_bytes() {
        let u = Uuid::nil();
        assert!(u.is_nil());
        assert_eq!(Uuid::from_bytes(u.as_bytes()), u);
    }

    #[test]
    fn formats_canonically() {
        let bytes: BtrfsUuid = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef,
        ];
        let u = Uuid::from_bytes(bytes);
        assert_eq!(u.to_string(), "01234567-89ab-cdef-0123-456789abcdef");
    }
}
