//! On-disk record layouts (spec.md §3, §6 "Device image on-disk format").
//!
//! Field names and overall shape follow the teacher's `structures.rs`
//! (itself following `btrfs-progs`' `ctree.h`) but every struct now
//! implements [`BinStruct`] instead of being a `#[repr(C, packed)]` type read
//! through a pointer cast — see `src/binstruct.rs` for why.

use crate::addr::{Key, ObjID};
use crate::binstruct::{BinStruct, Reader, Writer};
use crate::error::NodeError;
use crate::fingerprint::ChecksumKind;

pub const BTRFS_CSUM_SIZE: usize = 32;
pub const BTRFS_FSID_SIZE: usize = 16;
pub const BTRFS_UUID_SIZE: usize = 16;
pub const BTRFS_LABEL_SIZE: usize = 256;
pub const BTRFS_SYSTEM_CHUNK_ARRAY_SIZE: usize = 2048;
pub const BTRFS_NUM_BACKUP_ROOTS: usize = 4;

pub const BTRFS_SUPER_INFO_SIZE: usize = 4096;
/// Physical offsets of the three fixed superblock copies (spec.md §6).
pub const BTRFS_SUPER_MIRROR_OFFSETS: [u64; 3] = [0x0001_0000, 0x0400_0000, 0x40_0000_0000];

pub const BTRFS_MAGIC: u64 = 0x4D5F_5366_5248_425F;

/// Node header is fixed at `0x65` bytes (spec.md §3).
pub const BTRFS_HEADER_SIZE: usize = 0x65;
pub const BTRFS_ITEM_HEADER_SIZE: usize = 25;
pub const BTRFS_KEY_PTR_SIZE: usize = 33;
pub const BTRFS_MAX_LEVEL: u8 = 8;

pub type BtrfsUuid = [u8; BTRFS_UUID_SIZE];
pub type BtrfsFsid = [u8; BTRFS_FSID_SIZE];

/// Item-type tag, dispatched on when decoding a leaf item body (spec.md
/// §4.2). Values match `structures.rs`'s `BtrfsItemType` in the teacher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ItemType {
    Min,
    InodeItem,
    InodeRef,
    InodeExtref,
    XattrItem,
    OrphanItem,
    DirLogItem,
    DirLogIndex,
    DirItem,
    DirIndex,
    ExtentData,
    CsumItem,
    ExtentCsum,
    RootItem,
    RootBackref,
    RootRef,
    ExtentItem,
    MetadataItem,
    TreeBlockRef,
    ExtentDataRef,
    SharedBlockRef,
    SharedDataRef,
    BlockGroupItem,
    FreeSpaceInfo,
    FreeSpaceExtent,
    FreeSpaceBitmap,
    DevExtent,
    DevItem,
    ChunkItem,
    QgroupStatus,
    QgroupInfo,
    QgroupLimit,
    QgroupRelation,
    TemporaryItem,
    PersistentItem,
    DevReplace,
    UuidKeySubvol,
    UuidKeyReceivedSubvol,
    StringItem,
    Max,
    Unknown(u8),
}

impl ItemType {
    pub fn from_u8(v: u8) -> ItemType {
        match v {
            0x00 => ItemType::Min,
            0x01 => ItemType::InodeItem,
            0x0c => ItemType::InodeRef,
            0x0d => ItemType::InodeExtref,
            0x18 => ItemType::XattrItem,
            0x30 => ItemType::OrphanItem,
            0x3c => ItemType::DirLogItem,
            0x48 => ItemType::DirLogIndex,
            0x54 => ItemType::DirItem,
            0x60 => ItemType::DirIndex,
            0x6c => ItemType::ExtentData,
            0x78 => ItemType::CsumItem,
            0x80 => ItemType::ExtentCsum,
            0x84 => ItemType::RootItem,
            0x90 => ItemType::RootBackref,
            0x9c => ItemType::RootRef,
            0xa8 => ItemType::ExtentItem,
            0xa9 => ItemType::MetadataItem,
            0xb0 => ItemType::TreeBlockRef,
            0xb2 => ItemType::ExtentDataRef,
            0xb6 => ItemType::SharedBlockRef,
            0xb8 => ItemType::SharedDataRef,
            0xc0 => ItemType::BlockGroupItem,
            0xc6 => ItemType::FreeSpaceInfo,
            0xc7 => ItemType::FreeSpaceExtent,
            0xc8 => ItemType::FreeSpaceBitmap,
            0xcc => ItemType::DevExtent,
            0xd8 => ItemType::DevItem,
            0xe4 => ItemType::ChunkItem,
            0xf0 => ItemType::QgroupStatus,
            0xf2 => ItemType::QgroupInfo,
            0xf4 => ItemType::QgroupLimit,
            0xf6 => ItemType::QgroupRelation,
            0xf8 => ItemType::TemporaryItem,
            0xf9 => ItemType::PersistentItem,
            0xfa => ItemType::DevReplace,
            0xfb => ItemType::UuidKeySubvol,
            0xfc => ItemType::UuidKeyReceivedSubvol,
            0xfd => ItemType::StringItem,
            0xff => ItemType::Max,
            other => ItemType::Unknown(other),
        }
    }
}

/// `(ObjectID, ItemType, Offset)` as laid out on disk: 8 + 1 + 8 = 17 bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DiskKey {
    pub objectid: i64,
    pub item_type: u8,
    pub offset: u64,
}

impl DiskKey {
    pub fn to_key(self) -> Key {
        Key::new(ObjID(self.objectid), self.item_type, self.offset)
    }

    pub fn from_key(k: Key) -> DiskKey {
        DiskKey {
            objectid: k.objectid.0,
            item_type: k.item_type,
            offset: k.offset,
        }
    }
}

impl std::fmt::Debug for DiskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {:?} {}",
            self.objectid,
            ItemType::from_u8(self.item_type),
            self.offset
        )
    }
}

impl BinStruct for DiskKey {
    const SIZE: usize = 17;
    fn unpack(r: &mut Reader) -> Result<Self, NodeError> {
        Ok(DiskKey {
            objectid: r.i64()?,
            item_type: r.u8()?,
            offset: r.u64()?,
        })
    }
    fn pack(&self, w: &mut Writer) {
        w.u64(self.objectid as u64).u8(self.item_type).u64(self.offset);
    }
}

/// Node header, present at the start of every node regardless of level.
#[derive(Clone)]
pub struct Header {
    pub csum: [u8; BTRFS_CSUM_SIZE],
    pub fsid: BtrfsFsid,
    pub bytenr: u64,
    pub flags: u64,
    pub chunk_tree_uuid: BtrfsUuid,
    pub generation: u64,
    pub owner: u64,
    pub nritems: u32,
    pub level: u8,
}

pub const HEADER_FLAG_WRITTEN: u64 = 1 << 0;
pub const HEADER_FLAG_RELOC: u64 = 1 << 2;

impl BinStruct for Header {
    const SIZE: usize = BTRFS_HEADER_SIZE;
    fn unpack(r: &mut Reader) -> Result<Self, NodeError> {
        Ok(Header {
            csum: r.array()?,
            fsid: r.array()?,
            bytenr: r.u64()?,
            flags: r.u64()?,
            chunk_tree_uuid: r.array()?,
            generation: r.u64()?,
            owner: r.u64()?,
            nritems: r.u32()?,
            level: r.u8()?,
        })
    }
    fn pack(&self, w: &mut Writer) {
        w.bytes(&self.csum)
            .bytes(&self.fsid)
            .u64(self.bytenr)
            .u64(self.flags)
            .bytes(&self.chunk_tree_uuid)
            .u64(self.generation)
            .u64(self.owner)
            .u32(self.nritems)
            .u8(self.level);
    }
}

/// Leaf item header: `(key, offset, size)`, 17 + 4 + 4 = 25 bytes.
#[derive(Clone, Copy, Debug)]
pub struct ItemHeader {
    pub key: DiskKey,
    pub offset: u32,
    pub size: u32,
}

impl BinStruct for ItemHeader {
    const SIZE: usize = BTRFS_ITEM_HEADER_SIZE;
    fn unpack(r: &mut Reader) -> Result<Self, NodeError> {
        Ok(ItemHeader {
            key: DiskKey::unpack(r)?,
            offset: r.u32()?,
            size: r.u32()?,
        })
    }
    fn pack(&self, w: &mut Writer) {
        self.key.pack(w);
        w.u32(self.offset).u32(self.size);
    }
}

/// Interior-node key-pointer: `(key, blockptr, generation)`, 17+8+8 = 33 bytes.
#[derive(Clone, Copy, Debug)]
pub struct KeyPtr {
    pub key: DiskKey,
    pub blockptr: u64,
    pub generation: u64,
}

impl BinStruct for KeyPtr {
    const SIZE: usize = BTRFS_KEY_PTR_SIZE;
    fn unpack(r: &mut Reader) -> Result<Self, NodeError> {
        Ok(KeyPtr {
            key: DiskKey::unpack(r)?,
            blockptr: r.u64()?,
            generation: r.u64()?,
        })
    }
    fn pack(&self, w: &mut Writer) {
        self.key.pack(w);
        w.u64(self.blockptr).u64(self.generation);
    }
}

#[derive(Clone, Copy)]
pub struct DevItem {
    pub devid: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub io_align: u32,
    pub io_width: u32,
    pub sector_size: u32,
    pub dev_type: u64,
    pub generation: u64,
    pub start_offset: u64,
    pub dev_group: u32,
    pub seek_speed: u8,
    pub bandwidth: u8,
    pub uuid: BtrfsUuid,
    pub fsid: BtrfsFsid,
}

impl BinStruct for DevItem {
    const SIZE: usize = 98;
    fn unpack(r: &mut Reader) -> Result<Self, NodeError> {
        Ok(DevItem {
            devid: r.u64()?,
            total_bytes: r.u64()?,
            bytes_used: r.u64()?,
            io_align: r.u32()?,
            io_width: r.u32()?,
            sector_size: r.u32()?,
            dev_type: r.u64()?,
            generation: r.u64()?,
            start_offset: r.u64()?,
            dev_group: r.u32()?,
            seek_speed: r.u8()?,
            bandwidth: r.u8()?,
            uuid: r.array()?,
            fsid: r.array()?,
        })
    }
    fn pack(&self, w: &mut Writer) {
        w.u64(self.devid)
            .u64(self.total_bytes)
            .u64(self.bytes_used)
            .u32(self.io_align)
            .u32(self.io_width)
            .u32(self.sector_size)
            .u64(self.dev_type)
            .u64(self.generation)
            .u64(self.start_offset)
            .u32(self.dev_group)
            .u8(self.seek_speed)
            .u8(self.bandwidth)
            .bytes(&self.uuid)
            .bytes(&self.fsid);
    }
}

#[derive(Clone, Copy, Default)]
pub struct RootBackup {
    pub tree_root: u64,
    pub tree_root_gen: u64,
    pub chunk_root: u64,
    pub chunk_root_gen: u64,
    pub extent_root: u64,
    pub extent_root_gen: u64,
    pub fs_root: u64,
    pub fs_root_gen: u64,
    pub dev_root: u64,
    pub dev_root_gen: u64,
    pub csum_root: u64,
    pub csum_root_gen: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub num_devices: u64,
    pub tree_root_level: u8,
    pub chunk_root_level: u8,
    pub extent_root_level: u8,
    pub fs_root_level: u8,
    pub dev_root_level: u8,
    pub csum_root_level: u8,
}

impl BinStruct for RootBackup {
    const SIZE: usize = 168;
    fn unpack(r: &mut Reader) -> Result<Self, NodeError> {
        let tree_root = r.u64()?;
        let tree_root_gen = r.u64()?;
        let chunk_root = r.u64()?;
        let chunk_root_gen = r.u64()?;
        let extent_root = r.u64()?;
        let extent_root_gen = r.u64()?;
        let fs_root = r.u64()?;
        let fs_root_gen = r.u64()?;
        let dev_root = r.u64()?;
        let dev_root_gen = r.u64()?;
        let csum_root = r.u64()?;
        let csum_root_gen = r.u64()?;
        let total_bytes = r.u64()?;
        let bytes_used = r.u64()?;
        let num_devices = r.u64()?;
        let _unused64 = r.bytes(32)?;
        let tree_root_level = r.u8()?;
        let chunk_root_level = r.u8()?;
        let extent_root_level = r.u8()?;
        let fs_root_level = r.u8()?;
        let dev_root_level = r.u8()?;
        let csum_root_level = r.u8()?;
        let _unused8 = r.bytes(10)?;
        Ok(RootBackup {
            tree_root,
            tree_root_gen,
            chunk_root,
            chunk_root_gen,
            extent_root,
            extent_root_gen,
            fs_root,
            fs_root_gen,
            dev_root,
            dev_root_gen,
            csum_root,
            csum_root_gen,
            total_bytes,
            bytes_used,
            num_devices,
            tree_root_level,
            chunk_root_level,
            extent_root_level,
            fs_root_level,
            dev_root_level,
            csum_root_level,
        })
    }
    fn pack(&self, w: &mut Writer) {
        w.u64(self.tree_root)
            .u64(self.tree_root_gen)
            .u64(self.chunk_root)
            .u64(self.chunk_root_gen)
            .u64(self.extent_root)
            .u64(self.extent_root_gen)
            .u64(self.fs_root)
            .u64(self.fs_root_gen)
            .u64(self.dev_root)
            .u64(self.dev_root_gen)
            .u64(self.csum_root)
            .u64(self.csum_root_gen)
            .u64(self.total_bytes)
            .u64(self.bytes_used)
            .u64(self.num_devices)
            .pad(32)
            .u8(self.tree_root_level)
            .u8(self.chunk_root_level)
            .u8(self.extent_root_level)
            .u8(self.fs_root_level)
            .u8(self.dev_root_level)
            .u8(self.csum_root_level)
            .pad(10);
    }
}

/// Superblock, exactly `BTRFS_SUPER_INFO_SIZE` (4096) bytes (spec.md §3, §6).
#[derive(Clone)]
pub struct SuperBlock {
    pub csum: [u8; BTRFS_CSUM_SIZE],
    pub fsid: BtrfsFsid,
    pub bytenr: u64,
    pub flags: u64,
    pub magic: u64,
    pub generation: u64,
    pub root: u64,
    pub chunk_root: u64,
    pub log_root: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub root_dir_objectid: u64,
    pub num_devices: u64,
    pub sectorsize: u32,
    pub nodesize: u32,
    pub stripesize: u32,
    pub sys_chunk_array_size: u32,
    pub chunk_root_generation: u64,
    pub compat_flags: u64,
    pub compat_ro_flags: u64,
    pub incompat_flags: u64,
    pub csum_type: u16,
    pub root_level: u8,
    pub chunk_root_level: u8,
    pub log_root_level: u8,
    pub dev_item: DevItem,
    pub label: [u8; BTRFS_LABEL_SIZE],
    pub cache_generation: u64,
    pub uuid_tree_generation: u64,
    pub metadata_uuid: BtrfsFsid,
    pub nr_global_roots: u64,
    pub block_group_root: u64,
    pub block_group_root_generation: u64,
    pub block_group_root_level: u8,
    pub sys_chunk_array: [u8; BTRFS_SYSTEM_CHUNK_ARRAY_SIZE],
    pub super_roots: [RootBackup; BTRFS_NUM_BACKUP_ROOTS],
}

impl SuperBlock {
    pub fn checksum_kind(&self) -> Option<ChecksumKind> {
        ChecksumKind::from_u16(self.csum_type)
    }

    pub fn label_str(&self) -> String {
        let end = self.label.iter().position(|&b| b == 0).unwrap_or(self.label.len());
        String::from_utf8_lossy(&self.label[..end]).into_owned()
    }
}

impl BinStruct for SuperBlock {
    const SIZE: usize = BTRFS_SUPER_INFO_SIZE;

    fn unpack(r: &mut Reader) -> Result<Self, NodeError> {
        let csum = r.array()?;
        let fsid = r.array()?;
        let bytenr = r.u64()?;
        let flags = r.u64()?;
        let magic = r.u64()?;
        let generation = r.u64()?;
        let root = r.u64()?;
        let chunk_root = r.u64()?;
        let log_root = r.u64()?;
        let _unused_log_root_transid = r.u64()?;
        let total_bytes = r.u64()?;
        let bytes_used = r.u64()?;
        let root_dir_objectid = r.u64()?;
        let num_devices = r.u64()?;
        let sectorsize = r.u32()?;
        let nodesize = r.u32()?;
        let _unused_leafsize = r.u32()?;
        let stripesize = r.u32()?;
        let sys_chunk_array_size = r.u32()?;
        let chunk_root_generation = r.u64()?;
        let compat_flags = r.u64()?;
        let compat_ro_flags = r.u64()?;
        let incompat_flags = r.u64()?;
        let csum_type = r.u16()?;
        let root_level = r.u8()?;
        let chunk_root_level = r.u8()?;
        let log_root_level = r.u8()?;
        let dev_item = DevItem::unpack(r)?;
        let label: [u8; BTRFS_LABEL_SIZE] = {
            let s = r.bytes(BTRFS_LABEL_SIZE)?;
            let mut a = [0u8; BTRFS_LABEL_SIZE];
            a.copy_from_slice(s);
            a
        };
        let cache_generation = r.u64()?;
        let uuid_tree_generation = r.u64()?;
        let metadata_uuid = r.array()?;
        let nr_global_roots = r.u64()?;
        // Block-group-tree root, generation, level (spec.md §3: one of the
        // four system trees) sit at the front of what the teacher's
        // `structures.rs` treats as a flat `reserved: [LE64; 27]` — the
        // teacher predates block-group-tree support. Carved out here so the
        // forest can bootstrap that tree the same way it does the other
        // three.
        let block_group_root = r.u64()?;
        let block_group_root_generation = r.u64()?;
        let block_group_root_level = r.u8()?;
        let _reserved = r.bytes(27 * 8 - 8 - 8 - 1)?;
        let sys_chunk_array: [u8; BTRFS_SYSTEM_CHUNK_ARRAY_SIZE] = {
            let s = r.bytes(BTRFS_SYSTEM_CHUNK_ARRAY_SIZE)?;
            let mut a = [0u8; BTRFS_SYSTEM_CHUNK_ARRAY_SIZE];
            a.copy_from_slice(s);
            a
        };
        let mut super_roots = [RootBackup::default(); BTRFS_NUM_BACKUP_ROOTS];
        for slot in super_roots.iter_mut() {
            *slot = RootBackup::unpack(r)?;
        }
        let _padding = r.bytes(565)?;

        Ok(SuperBlock {
            csum,
            fsid,
            bytenr,
            flags,
            magic,
            generation,
            root,
            chunk_root,
            log_root,
            total_bytes,
            bytes_used,
            root_dir_objectid,
            num_devices,
            sectorsize,
            nodesize,
            stripesize,
            sys_chunk_array_size,
            chunk_root_generation,
            compat_flags,
            compat_ro_flags,
            incompat_flags,
            csum_type,
            root_level,
            chunk_root_level,
            log_root_level,
            dev_item,
            label,
            cache_generation,
            uuid_tree_generation,
            metadata_uuid,
            nr_global_roots,
            block_group_root,
            block_group_root_generation,
            block_group_root_level,
            sys_chunk_array,
            super_roots,
        })
    }

    fn pack(&self, w: &mut Writer) {
        w.bytes(&self.csum)
            .bytes(&self.fsid)
            .u64(self.bytenr)
            .u64(self.flags)
            .u64(self.magic)
            .u64(self.generation)
            .u64(self.root)
            .u64(self.chunk_root)
            .u64(self.log_root)
            .u64(0)
            .u64(self.total_bytes)
            .u64(self.bytes_used)
            .u64(self.root_dir_objectid)
            .u64(self.num_devices)
            .u32(self.sectorsize)
            .u32(self.nodesize)
            .u32(0)
            .u32(self.stripesize)
            .u32(self.sys_chunk_array_size)
            .u64(self.chunk_root_generation)
            .u64(self.compat_flags)
            .u64(self.compat_ro_flags)
            .u64(self.incompat_flags)
            .u16(self.csum_type)
            .u8(self.root_level)
            .u8(self.chunk_root_level)
            .u8(self.log_root_level);
        self.dev_item.pack(w);
        w.bytes(&self.label)
            .u64(self.cache_generation)
            .u64(self.uuid_tree_generation)
            .bytes(&self.metadata_uuid)
            .u64(self.nr_global_roots)
            .u64(self.block_group_root)
            .u64(self.block_group_root_generation)
            .u8(self.block_group_root_level)
            .pad(27 * 8 - 8 - 8 - 1)
            .bytes(&self.sys_chunk_array);
        for root in &self.super_roots {
            root.pack(w);
        }
        w.pad(565);
    }
}

#[derive(Clone, Copy)]
pub struct Stripe {
    pub devid: u64,
    pub offset: u64,
    pub dev_uuid: BtrfsUuid,
}

impl BinStruct for Stripe {
    const SIZE: usize = 32;
    fn unpack(r: &mut Reader) -> Result<Self, NodeError> {
        Ok(Stripe {
            devid: r.u64()?,
            offset: r.u64()?,
            dev_uuid: r.array()?,
        })
    }
    fn pack(&self, w: &mut Writer) {
        w.u64(self.devid).u64(self.offset).bytes(&self.dev_uuid);
    }
}

/// `CHUNK_ITEM` body: a fixed header followed by `num_stripes` [`Stripe`]s
/// (spec.md §4.2 "Algorithmic points"). The header alone is returned by
/// [`BinStruct::unpack`]; callers read the stripe array separately because
/// its length is data-dependent.
#[derive(Clone, Copy)]
pub struct ChunkHeader {
    pub length: u64,
    pub owner: u64,
    pub stripe_len: u64,
    pub chunk_type: u64,
    pub io_align: u32,
    pub io_width: u32,
    pub sector_size: u32,
    pub num_stripes: u16,
    pub sub_stripes: u16,
}

impl BinStruct for ChunkHeader {
    const SIZE: usize = 48;
    fn unpack(r: &mut Reader) -> Result<Self, NodeError> {
        Ok(ChunkHeader {
            length: r.u64()?,
            owner: r.u64()?,
            stripe_len: r.u64()?,
            chunk_type: r.u64()?,
            io_align: r.u32()?,
            io_width: r.u32()?,
            sector_size: r.u32()?,
            num_stripes: r.u16()?,
            sub_stripes: r.u16()?,
        })
    }
    fn pack(&self, w: &mut Writer) {
        w.u64(self.length)
            .u64(self.owner)
            .u64(self.stripe_len)
            .u64(self.chunk_type)
            .u32(self.io_align)
            .u32(self.io_width)
            .u32(self.sector_size)
            .u16(self.num_stripes)
            .u16(self.sub_stripes);
    }
}

pub mod block_group_flags {
    pub const DATA: u64 = 1 << 0;
    pub const SYSTEM: u64 = 1 << 1;
    pub const METADATA: u64 = 1 << 2;
    pub const RAID0: u64 = 1 << 3;
    pub const RAID1: u64 = 1 << 4;
    pub const DUP: u64 = 1 << 5;
    pub const RAID10: u64 = 1 << 6;
    pub const RAID5: u64 = 1 << 7;
    pub const RAID6: u64 = 1 << 8;
    pub const RAID1C3: u64 = 1 << 9;
    pub const RAID1C4: u64 = 1 << 10;
}

#[derive(Clone, Copy)]
pub struct Timespec {
    pub sec: u64,
    pub nsec: u32,
}

impl BinStruct for Timespec {
    const SIZE: usize = 12;
    fn unpack(r: &mut Reader) -> Result<Self, NodeError> {
        Ok(Timespec {
            sec: r.u64()?,
            nsec: r.u32()?,
        })
    }
    fn pack(&self, w: &mut Writer) {
        w.u64(self.sec).u32(self.nsec);
    }
}

#[derive(Clone, Copy)]
pub struct InodeItem {
    pub generation: u64,
    pub transid: u64,
    pub size: u64,
    pub nbytes: u64,
    pub block_group: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub rdev: u64,
    pub flags: u64,
    pub sequence: u64,
    pub atime: Timespec,
    pub ctime: Timespec,
    pub mtime: Timespec,
    pub otime: Timespec,
}

impl BinStruct for InodeItem {
    const SIZE: usize = 160;
    fn unpack(r: &mut Reader) -> Result<Self, NodeError> {
        let generation = r.u64()?;
        let transid = r.u64()?;
        let size = r.u64()?;
        let nbytes = r.u64()?;
        let block_group = r.u64()?;
        let nlink = r.u32()?;
        let uid = r.u32()?;
        let gid = r.u32()?;
        let mode = r.u32()?;
        let rdev = r.u64()?;
        let flags = r.u64()?;
        let sequence = r.u64()?;
        let _reserved = r.bytes(4 * 8)?;
        let atime = Timespec::unpack(r)?;
        let ctime = Timespec::unpack(r)?;
        let mtime = Timespec::unpack(r)?;
        let otime = Timespec::unpack(r)?;
        Ok(InodeItem {
            generation,
            transid,
            size,
            nbytes,
            block_group,
            nlink,
            uid,
            gid,
            mode,
            rdev,
            flags,
            sequence,
            atime,
            ctime,
            mtime,
            otime,
        })
    }
    fn pack(&self, w: &mut Writer) {
        w.u64(self.generation)
            .u64(self.transid)
            .u64(self.size)
            .u64(self.nbytes)
            .u64(self.block_group)
            .u32(self.nlink)
            .u32(self.uid)
            .u32(self.gid)
            .u32(self.mode)
            .u64(self.rdev)
            .u64(self.flags)
            .u64(self.sequence)
            .pad(4 * 8);
        self.atime.pack(w);
        self.ctime.pack(w);
        self.mtime.pack(w);
        self.otime.pack(w);
    }
}

/// `ROOT_ITEM` body. `parent_uuid` is the hinge of COW ancestry (spec.md
/// §4.6): a non-zero value means this tree is a snapshot of the tree with
/// that UUID.
#[derive(Clone, Copy)]
pub struct RootItem {
    pub inode: InodeItem,
    pub generation: u64,
    pub root_dirid: u64,
    pub bytenr: u64,
    pub byte_limit: u64,
    pub bytes_used: u64,
    pub last_snapshot: u64,
    pub flags: u64,
    pub refs: u32,
    pub drop_progress: DiskKey,
    pub drop_level: u8,
    pub level: u8,
    pub generation_v2: u64,
    pub uuid: BtrfsUuid,
    pub parent_uuid: BtrfsUuid,
    pub received_uuid: BtrfsUuid,
    pub ctransid: u64,
    pub otransid: u64,
    pub stransid: u64,
    pub rtransid: u64,
}

impl RootItem {
    pub fn has_parent(&self) -> bool {
        self.parent_uuid != [0u8; BTRFS_UUID_SIZE]
    }
}

impl BinStruct for RootItem {
    const SIZE: usize = 439;
    fn unpack(r: &mut Reader) -> Result<Self, NodeError> {
        let inode = InodeItem::unpack(r)?;
        let generation = r.u64()?;
        let root_dirid = r.u64()?;
        let bytenr = r.u64()?;
        let byte_limit = r.u64()?;
        let bytes_used = r.u64()?;
        let last_snapshot = r.u64()?;
        let flags = r.u64()?;
        let refs = r.u32()?;
        let drop_progress = DiskKey::unpack(r)?;
        let drop_level = r.u8()?;
        let level = r.u8()?;
        let generation_v2 = r.u64()?;
        let uuid = r.array()?;
        let parent_uuid = r.array()?;
        let received_uuid = r.array()?;
        let ctransid = r.u64()?;
        let otransid = r.u64()?;
        let stransid = r.u64()?;
        let rtransid = r.u64()?;
        let _ctime = Timespec::unpack(r)?;
        let _otime = Timespec::unpack(r)?;
        let _stime = Timespec::unpack(r)?;
        let _rtime = Timespec::unpack(r)?;
        let _global_tree_id = r.u64()?;
        let _reserved = r.bytes(7 * 8)?;
        Ok(RootItem {
            inode,
            generation,
            root_dirid,
            bytenr,
            byte_limit,
            bytes_used,
            last_snapshot,
            flags,
            refs,
            drop_progress,
            drop_level,
            level,
            generation_v2,
            uuid,
            parent_uuid,
            received_uuid,
            ctransid,
            otransid,
            stransid,
            rtransid,
        })
    }
    fn pack(&self, w: &mut Writer) {
        self.inode.pack(w);
        w.u64(self.generation)
            .u64(self.root_dirid)
            .u64(self.bytenr)
            .u64(self.byte_limit)
            .u64(self.bytes_used)
            .u64(self.last_snapshot)
            .u64(self.flags)
            .u32(self.refs);
        self.drop_progress.pack(w);
        w.u8(self.drop_level).u8(self.level).u64(self.generation_v2);
        w.bytes(&self.uuid).bytes(&self.parent_uuid).bytes(&self.received_uuid);
        w.u64(self.ctransid).u64(self.otransid).u64(self.stransid).u64(self.rtransid);
        Timespec { sec: 0, nsec: 0 }.pack(w);
        Timespec { sec: 0, nsec: 0 }.pack(w);
        Timespec { sec: 0, nsec: 0 }.pack(w);
        Timespec { sec: 0, nsec: 0 }.pack(w);
        w.u64(0).pad(7 * 8);
    }
}

#[derive(Clone)]
pub struct RootRef {
    pub dirid: u64,
    pub sequence: u64,
    pub name: Vec<u8>,
}

impl RootRef {
    pub fn decode(body: &[u8]) -> Result<RootRef, NodeError> {
        let mut r = Reader::new(body);
        let dirid = r.u64()?;
        let sequence = r.u64()?;
        let name_len = r.u16()? as usize;
        let name = r.bytes(name_len)?.to_vec();
        Ok(RootRef {
            dirid,
            sequence,
            name,
        })
    }
}

#[derive(Clone, Copy)]
pub struct ExtentItem {
    pub refs: u64,
    pub generation: u64,
    pub flags: u64,
}

impl BinStruct for ExtentItem {
    const SIZE: usize = 24;
    fn unpack(r: &mut Reader) -> Result<Self, NodeError> {
        Ok(ExtentItem {
            refs: r.u64()?,
            generation: r.u64()?,
            flags: r.u64()?,
        })
    }
    fn pack(&self, w: &mut Writer) {
        w.u64(self.refs).u64(self.generation).u64(self.flags);
    }
}

/// `METADATA_ITEM` shares `ExtentItem`'s fixed header; the item key's
/// offset field (normally the extent length for `EXTENT_ITEM`) instead
/// holds the tree level for `METADATA_ITEM`.
pub type MetadataItem = ExtentItem;

#[derive(Clone, Copy)]
pub struct ExtentDataRef {
    pub root: u64,
    pub objectid: u64,
    pub offset: u64,
    pub count: u32,
}

impl BinStruct for ExtentDataRef {
    const SIZE: usize = 28;
    fn unpack(r: &mut Reader) -> Result<Self, NodeError> {
        Ok(ExtentDataRef {
            root: r.u64()?,
            objectid: r.u64()?,
            offset: r.u64()?,
            count: r.u32()?,
        })
    }
    fn pack(&self, w: &mut Writer) {
        w.u64(self.root).u64(self.objectid).u64(self.offset).u32(self.count);
    }
}

#[derive(Clone, Copy)]
pub struct SharedDataRef {
    pub count: u32,
}

impl BinStruct for SharedDataRef {
    const SIZE: usize = 4;
    fn unpack(r: &mut Reader) -> Result<Self, NodeError> {
        Ok(SharedDataRef { count: r.u32()? })
    }
    fn pack(&self, w: &mut Writer) {
        w.u32(self.count);
    }
}

#[derive(Clone, Copy)]
pub struct DevExtent {
    pub chunk_tree: u64,
    pub chunk_objectid: u64,
    pub chunk_offset: u64,
    pub length: u64,
    pub chunk_tree_uuid: BtrfsUuid,
}

impl BinStruct for DevExtent {
    const SIZE: usize = 48;
    fn unpack(r: &mut Reader) -> Result<Self, NodeError> {
        Ok(DevExtent {
            chunk_tree: r.u64()?,
            chunk_objectid: r.u64()?,
            chunk_offset: r.u64()?,
            length: r.u64()?,
            chunk_tree_uuid: r.array()?,
        })
    }
    fn pack(&self, w: &mut Writer) {
        w.u64(self.chunk_tree)
            .u64(self.chunk_objectid)
            .u64(self.chunk_offset)
            .u64(self.length)
            .bytes(&self.chunk_tree_uuid);
    }
}

#[derive(Clone, Copy)]
pub struct BlockGroupItem {
    pub used: u64,
    pub chunk_objectid: u64,
    pub flags: u64,
}

impl BinStruct for BlockGroupItem {
    const SIZE: usize = 24;
    fn unpack(r: &mut Reader) -> Result<Self, NodeError> {
        Ok(BlockGroupItem {
            used: r.u64()?,
            chunk_objectid: r.u64()?,
            flags: r.u64()?,
        })
    }
    fn pack(&self, w: &mut Writer) {
        w.u64(self.used).u64(self.chunk_objectid).u64(self.flags);
    }
}

#[derive(Clone, Copy)]
pub struct FreeSpaceInfo {
    pub extent_count: u32,
    pub flags: u32,
}

impl BinStruct for FreeSpaceInfo {
    const SIZE: usize = 8;
    fn unpack(r: &mut Reader) -> Result<Self, NodeError> {
        Ok(FreeSpaceInfo {
            extent_count: r.u32()?,
            flags: r.u32()?,
        })
    }
    fn pack(&self, w: &mut Writer) {
        w.u32(self.extent_count).u32(self.flags);
    }
}

#[derive(Clone)]
pub struct DirEntry {
    pub location: DiskKey,
    pub transid: u64,
    pub data_len: u16,
    pub name_len: u16,
    pub file_type: u8,
    pub name: Vec<u8>,
    pub data: Vec<u8>,
}

impl DirEntry {
    const FIXED_SIZE: usize = 17 + 8 + 2 + 2 + 1;

    /// Decodes every entry packed back-to-back in a `DIR_ITEM`/`DIR_INDEX`
    /// body (there can be more than one entry sharing a hash bucket).
    pub fn decode_list(body: &[u8]) -> Result<Vec<DirEntry>, NodeError> {
        let mut r = Reader::new(body);
        let mut out = Vec::new();
        while r.remaining() >= Self::FIXED_SIZE {
            let location = DiskKey::unpack(&mut r)?;
            let transid = r.u64()?;
            let data_len = r.u16()?;
            let name_len = r.u16()?;
            let file_type = r.u8()?;
            let name = r.bytes(name_len as usize)?.to_vec();
            let data = r.bytes(data_len as usize)?.to_vec();
            out.push(DirEntry {
                location,
                transid,
                data_len,
                name_len,
                file_type,
                name,
                data,
            });
        }
        Ok(out)
    }
}

#[derive(Clone)]
pub struct InodeRefEntry {
    pub index: u64,
    pub name: Vec<u8>,
}

impl InodeRefEntry {
    const FIXED_SIZE: usize = 8 + 2;

    /// A leaf may hold several `INODE_REF` items with the same key
    /// (hardlinks); each item body is itself a back-to-back run of entries.
    pub fn decode_list(body: &[u8]) -> Result<Vec<InodeRefEntry>, NodeError> {
        let mut r = Reader::new(body);
        let mut out = Vec::new();
        while r.remaining() >= Self::FIXED_SIZE {
            let index = r.u64()?;
            let name_len = r.u16()?;
            let name = r.bytes(name_len as usize)?.to_vec();
            out.push(InodeRefEntry { index, name });
        }
        Ok(out)
    }
}

/// File extent types (spec.md §4.2 "FileExtent decodes ...").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileExtentType {
    Inline,
    Reg,
    Prealloc,
}

impl FileExtentType {
    pub fn from_u8(v: u8) -> Option<FileExtentType> {
        match v {
            0 => Some(FileExtentType::Inline),
            1 => Some(FileExtentType::Reg),
            2 => Some(FileExtentType::Prealloc),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct FileExtentHeader {
    pub generation: u64,
    pub ram_bytes: u64,
    pub compression: u8,
    pub encryption: u8,
    pub other_encoding: u16,
    pub extent_type: u8,
}

impl FileExtentHeader {
    pub const SIZE: usize = 0x15;
    pub fn decode(r: &mut Reader) -> Result<FileExtentHeader, NodeError> {
        Ok(FileExtentHeader {
            generation: r.u64()?,
            ram_bytes: r.u64()?,
            compression: r.u8()?,
            encryption: r.u8()?,
            other_encoding: r.u16()?,
            extent_type: r.u8()?,
        })
    }
}

#[derive(Clone)]
pub struct FileExtentRegDescriptor {
    pub disk_bytenr: u64,
    pub disk_num_bytes: u64,
    pub offset: u64,
    pub num_bytes: u64,
}

impl FileExtentRegDescriptor {
    pub const SIZE: usize = 0x20;
    pub fn decode(r: &mut Reader) -> Result<FileExtentRegDescriptor, NodeError> {
        Ok(FileExtentRegDescriptor {
            disk_bytenr: r.u64()?,
            disk_num_bytes: r.u64()?,
            offset: r.u64()?,
            num_bytes: r.u64()?,
        })
    }
}

#[derive(Clone)]
pub enum FileExtent {
    Inline {
        header: FileExtentHeader,
        data: Vec<u8>,
    },
    Reg {
        header: FileExtentHeader,
        descriptor: FileExtentRegDescriptor,
    },
    Prealloc {
        header: FileExtentHeader,
        descriptor: FileExtentRegDescriptor,
    },
}

impl FileExtent {
    pub fn decode(body: &[u8]) -> Result<FileExtent, NodeError> {
        let mut r = Reader::new(body);
        let header = FileExtentHeader::decode(&mut r)?;
        match FileExtentType::from_u8(header.extent_type) {
            Some(FileExtentType::Inline) => {
                let data = r.rest().to_vec();
                Ok(FileExtent::Inline { header, data })
            }
            Some(FileExtentType::Reg) => {
                let descriptor = FileExtentRegDescriptor::decode(&mut r)?;
                Ok(FileExtent::Reg { header, descriptor })
            }
            Some(FileExtentType::Prealloc) => {
                let descriptor = FileExtentRegDescriptor::decode(&mut r)?;
                Ok(FileExtent::Prealloc { header, descriptor })
            }
            None => Err(NodeError::UnknownFileExtentType(header.extent_type)),
        }
    }
}

#[derive(Clone)]
pub struct DevStats {
    pub counters: Vec<u64>,
}

impl DevStats {
    pub fn decode(body: &[u8]) -> Result<DevStats, NodeError> {
        let mut r = Reader::new(body);
        let mut counters = Vec::new();
        while r.remaining() >= 8 {
            counters.push(r.u64()?);
        }
        Ok(DevStats { counters })
    }
}

/// `UUID_TREE` items map a subvolume uuid (hashed into the item key) to the
/// tree id(s) sharing that uuid, stored as a packed array of `u64`s.
#[derive(Clone)]
pub struct UuidMapItem {
    pub tree_ids: Vec<u64>,
}

impl UuidMapItem {
    pub fn decode(body: &[u8]) -> Result<UuidMapItem, NodeError> {
        let mut r = Reader::new(body);
        let mut tree_ids = Vec::new();
        while r.remaining() >= 8 {
            tree_ids.push(r.u64()?);
        }
        Ok(UuidMapItem { tree_ids })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblock_size_matches_on_disk_layout() {
        assert_eq!(SuperBlock::SIZE, BTRFS_SUPER_INFO_SIZE);
    }

    #[test]
    fn header_is_0x65_bytes() {
        assert_eq!(Header::SIZE, 0x65);
    }

    #[test]
    fn item_and_keyptr_sizes() {
        assert_eq!(ItemHeader::SIZE, 25);
        assert_eq!(KeyPtr::SIZE, 33);
    }

    #[test]
    fn disk_key_round_trips() {
        let k = DiskKey {
            objectid: -9,
            item_type: 0x84,
            offset: 12345,
        };
        let bytes = k.pack_bytes();
        let k2 = DiskKey::unpack_bytes(&bytes).unwrap();
        assert_eq!(k2.objectid, k.objectid);
        assert_eq!(k2.item_type, k.item_type);
        assert_eq!(k2.offset, k.offset);
    }

    #[test]
    fn file_extent_rejects_unknown_type() {
        let mut body = vec![0u8; FileExtentHeader::SIZE];
        body[FileExtentHeader::SIZE - 1] = 0x7f;
        let err = FileExtent::decode(&body).unwrap_err();
        assert!(matches!(err, NodeError::UnknownFileExtentType(0x7f)));
    }

    #[test]
    fn root_item_round_trips_header_fields() {
        let root = RootItem {
            inode: InodeItem {
                generation: 1,
                transid: 2,
                size: 3,
                nbytes: 4,
                block_group: 0,
                nlink: 1,
                uid: 0,
                gid: 0,
                mode: 0o40755,
                rdev: 0,
                flags: 0,
                sequence: 0,
                atime: Timespec { sec: 0, nsec: 0 },
                ctime: Timespec { sec: 0, nsec: 0 },
                mtime: Timespec { sec: 0, nsec: 0 },
                otime: Timespec { sec: 0, nsec: 0 },
            },
            generation: 7,
            root_dirid: 256,
            bytenr: 0x1000,
            byte_limit: 0,
            bytes_used: 0,
            last_snapshot: 0,
            flags: 0,
            refs: 1,
            drop_progress: DiskKey {
                objectid: 0,
                item_type: 0,
                offset: 0,
            },
            drop_level: 0,
            level: 0,
            generation_v2: 7,
            uuid: [0u8; 16],
            parent_uuid: [0u8; 16],
            received_uuid: [0u8; 16],
            ctransid: 0,
            otransid: 0,
            stransid: 0,
            rtransid: 0,
        };
        let bytes = root.pack_bytes();
        assert_eq!(bytes.len(), RootItem::SIZE);
        let r2 = RootItem::unpack_bytes(&bytes).unwrap();
        assert_eq!(r2.generation, root.generation);
        assert_eq!(r2.root_dirid, root.root_dirid);
        assert!(!r2.has_parent());
    }
}
