//! Typed address kinds (spec.md §3).
//!
//! The teacher (`wtfrank-dump_btrfs`) passes raw `u64`s for every address
//! kind — logical offsets, physical offsets, device ids, object ids and
//! generations are all just `LE64 = u64`. That is fine for a single-purpose
//! dump tool but this engine juggles all five at once and mixing them up
//! (adding a physical offset to a logical one, say) is exactly the kind of
//! bug a newtype catches at compile time. Each kind below wraps a plain
//! `i64`, matching spec.md's "all 64-bit signed, distinct types".

use std::fmt;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

macro_rules! addr_kind {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            pub const fn new(v: i64) -> Self {
                $name(v)
            }

            pub const fn as_u64(self) -> u64 {
                self.0 as u64
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(v: u64) -> Self {
                $name(v as i64)
            }
        }

        impl From<i64> for $name {
            fn from(v: i64) -> Self {
                $name(v)
            }
        }
    };
}

addr_kind!(PhysicalAddr);
addr_kind!(LogicalAddr);
addr_kind!(DeviceID);
addr_kind!(ObjID);
addr_kind!(Generation);

/// Signed difference between two addresses of the same kind.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct AddrDelta(pub i64);

impl Sub for PhysicalAddr {
    type Output = AddrDelta;
    fn sub(self, rhs: PhysicalAddr) -> AddrDelta {
        AddrDelta(self.0 - rhs.0)
    }
}

impl Sub for LogicalAddr {
    type Output = AddrDelta;
    fn sub(self, rhs: LogicalAddr) -> AddrDelta {
        AddrDelta(self.0 - rhs.0)
    }
}

impl Add<AddrDelta> for PhysicalAddr {
    type Output = PhysicalAddr;
    fn add(self, rhs: AddrDelta) -> PhysicalAddr {
        PhysicalAddr(self.0 + rhs.0)
    }
}

impl Add<AddrDelta> for LogicalAddr {
    type Output = LogicalAddr;
    fn add(self, rhs: AddrDelta) -> LogicalAddr {
        LogicalAddr(self.0 + rhs.0)
    }
}

impl Add<u64> for LogicalAddr {
    type Output = LogicalAddr;
    fn add(self, rhs: u64) -> LogicalAddr {
        LogicalAddr(self.0 + rhs as i64)
    }
}

impl Add<u64> for PhysicalAddr {
    type Output = PhysicalAddr;
    fn add(self, rhs: u64) -> PhysicalAddr {
        PhysicalAddr(self.0 + rhs as i64)
    }
}

/// Well-known object ids, taken from `structures.rs`'s `BTRFS_*_OBJECTID`
/// constants (the teacher keeps these as free `u64` consts; we hang them off
/// `ObjID` so callers get the newtype for free).
impl ObjID {
    pub const ROOT_TREE: ObjID = ObjID(1);
    pub const EXTENT_TREE: ObjID = ObjID(2);
    pub const CHUNK_TREE: ObjID = ObjID(3);
    pub const DEV_TREE: ObjID = ObjID(4);
    pub const FS_TREE: ObjID = ObjID(5);
    pub const ROOT_TREE_DIR: ObjID = ObjID(6);
    pub const CSUM_TREE: ObjID = ObjID(7);
    pub const QUOTA_TREE: ObjID = ObjID(8);
    pub const UUID_TREE: ObjID = ObjID(9);
    pub const FREE_SPACE_TREE: ObjID = ObjID(10);
    pub const BLOCK_GROUP_TREE: ObjID = ObjID(11);

    pub const DEV_STATS: ObjID = ObjID(0);
    pub const BALANCE: ObjID = ObjID(-4);
    pub const ORPHAN: ObjID = ObjID(-5);
    pub const TREE_LOG: ObjID = ObjID(-6);
    pub const TREE_LOG_FIXUP: ObjID = ObjID(-7);
    pub const TREE_RELOC: ObjID = ObjID(-8);
    pub const DATA_RELOC_TREE: ObjID = ObjID(-9);
    pub const EXTENT_CSUM: ObjID = ObjID(-10);
    pub const FREE_SPACE: ObjID = ObjID(-11);
    pub const FREE_INO: ObjID = ObjID(-12);
    pub const MULTIPLE: ObjID = ObjID(-255);

    pub const FIRST_CHUNK_TREE: ObjID = ObjID(256);

    /// True for the four trees the forest can bootstrap directly from the
    /// superblock rather than resolving through the root tree (spec.md §4.6).
    pub fn is_system_tree(self) -> bool {
        matches!(
            self,
            ObjID::ROOT_TREE | ObjID::CHUNK_TREE | ObjID::TREE_LOG | ObjID::BLOCK_GROUP_TREE
        )
    }

    /// Filesystem-visible inode ids live in `[FIRST_CHUNK_TREE, u64::MAX -
    /// 256]`; everything else names an internal object (tree ids, the
    /// handful of negative "well-known" ids above).
    pub fn is_fs_visible(self) -> bool {
        self.0 >= ObjID::FIRST_CHUNK_TREE.0 && self.0 <= (u64::MAX - 256) as i64
    }
}

/// Total-ordered item key: `(ObjectID, ItemType, Offset)`, compared
/// lexicographically in that order (spec.md §3). `ItemType` is `u8` so that
/// `MIN`/`MAX` sentinel searches (teacher's `BtrfsItemType::MIN`/`MAX`) can be
/// expressed without a special case.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    pub objectid: ObjID,
    pub item_type: u8,
    pub offset: u64,
}

impl Key {
    pub const MIN: Key = Key {
        objectid: ObjID(i64::MIN),
        item_type: 0x00,
        offset: 0,
    };
    pub const MAX: Key = Key {
        objectid: ObjID(i64::MAX),
        item_type: 0xff,
        offset: u64::MAX,
    };

    pub const fn new(objectid: ObjID, item_type: u8, offset: u64) -> Key {
        Key {
            objectid,
            item_type,
            offset,
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:?}, {:#04x}, {})",
            self.objectid, self.item_type, self.offset
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_arithmetic() {
        let a = LogicalAddr::new(100);
        let b = LogicalAddr::new(40);
        let d = a - b;
        assert_eq!(d, AddrDelta(60));
        assert_eq!(b + d, a);
    }

    #[test]
    fn key_ordering_is_lexicographic() {
        let a = Key::new(ObjID(5), 1, 10);
        let b = Key::new(ObjID(5), 1, 20);
        let c = Key::new(ObjID(5), 2, 0);
        let d = Key::new(ObjID(6), 0, 0);
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
    }

    #[test]
    fn objectid_fs_visibility() {
        assert!(!ObjID::ROOT_TREE.is_fs_visible());
        assert!(ObjID::FIRST_CHUNK_TREE.is_fs_visible());
        assert!(ObjID::from(5_000_000_i64).is_fs_visible());
    }
}
