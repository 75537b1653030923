//! Leaf item bodies: a closed sum type dispatched on `Key.ItemType` (spec.md
//! §4.2, §9 "Dynamic dispatch on item types").
//!
//! The teacher never decodes item bodies beyond raw `offset`/`size` pairs
//! (`btrfs_node.rs::BtrfsLeafNodeIter` just hands back the header and a
//! byte slice); `structures.rs` in this repo already grew the typed bodies
//! (`RootItem`, `ChunkHeader`+`Stripe`, `FileExtent`, ...). This module is
//! the dispatch table that turns `(item_type, bytes)` into one of them,
//! following spec.md's closed-sum framing: `Error` is the sink for both
//! decode failures and item types this engine has no typed body for, and is
//! never fatal to the caller.

use crate::addr::{Key, ObjID};
use crate::binstruct::BinStruct;
use crate::fingerprint::{ChecksumKind, Fingerprint};
use crate::structures::*;

/// One fingerprint per block in an `EXTENT_CSUM` run, starting at the item
/// key's offset (a logical address) and advancing by `sectorsize` per entry
/// (spec.md §4.2 "ExtentCSum").
#[derive(Clone)]
pub struct ExtentCsumRun {
    pub start_logical: u64,
    pub sectorsize: u64,
    pub sums: Vec<Fingerprint>,
}

/// Decoded leaf item body. Unknown item types and any decode failure both
/// land in `Error` — per spec.md §7, a bad leaf item must never abort the
/// read of the rest of the tree.
#[derive(Clone)]
pub enum ItemBody {
    Inode(InodeItem),
    InodeRefList(Vec<InodeRefEntry>),
    DirList(Vec<DirEntry>),
    Root(RootItem),
    Extent(ExtentItem),
    Metadata(MetadataItem),
    ExtentDataRef(ExtentDataRef),
    SharedDataRef(SharedDataRef),
    Chunk {
        header: ChunkHeader,
        stripes: Vec<Stripe>,
    },
    Dev(DevItem),
    DevExtent(DevExtent),
    ExtentCsum(ExtentCsumRun),
    BlockGroup(BlockGroupItem),
    FreeSpaceHeader { num_entries: u64, num_bitmaps: u64 },
    FreeSpaceInfo(FreeSpaceInfo),
    UuidMap(UuidMapItem),
    DevStats(DevStats),
    FileExtent(FileExtent),
    Empty,
    Error { cause: String },
}

impl ItemBody {
    pub fn is_error(&self) -> bool {
        matches!(self, ItemBody::Error { .. })
    }
}

/// Context a decoder needs beyond the raw bytes: `EXTENT_CSUM` bodies carry
/// no self-describing fingerprint width, so the caller (who already knows
/// the filesystem's checksum kind from the superblock) must supply it
/// (spec.md §4.2).
#[derive(Clone, Copy)]
pub struct DecodeCtx {
    pub checksum_kind: ChecksumKind,
    pub sectorsize: u64,
}

/// Decodes one leaf item's body. `key` is already-parsed (post `DiskKey`);
/// `body` is the raw byte range the item header points at within the node.
/// Never returns `Err`: every failure mode becomes `ItemBody::Error`.
pub fn decode_item(key: Key, body: &[u8], ctx: DecodeCtx) -> ItemBody {
    let item_type = ItemType::from_u8(key.item_type);
    let result = decode_inner(item_type, key, body, ctx);
    match result {
        Ok(b) => b,
        Err(e) => ItemBody::Error { cause: e },
    }
}

fn decode_inner(item_type: ItemType, key: Key, body: &[u8], ctx: DecodeCtx) -> Result<ItemBody, String> {
    match item_type {
        ItemType::InodeItem => InodeItem::unpack_bytes(body)
            .map(ItemBody::Inode)
            .map_err(|e| e.to_string()),
        ItemType::InodeRef | ItemType::InodeExtref => InodeRefEntry::decode_list(body)
            .map(ItemBody::InodeRefList)
            .map_err(|e| e.to_string()),
        ItemType::DirItem | ItemType::DirIndex | ItemType::XattrItem => DirEntry::decode_list(body)
            .map(ItemBody::DirList)
            .map_err(|e| e.to_string()),
        ItemType::RootItem => RootItem::unpack_bytes(body)
            .map(ItemBody::Root)
            .map_err(|e| e.to_string()),
        ItemType::ExtentItem => ExtentItem::unpack_bytes(body)
            .map(ItemBody::Extent)
            .map_err(|e| e.to_string()),
        ItemType::MetadataItem => ExtentItem::unpack_bytes(body)
            .map(ItemBody::Metadata)
            .map_err(|e| e.to_string()),
        ItemType::ExtentDataRef => ExtentDataRef::unpack_bytes(body)
            .map(ItemBody::ExtentDataRef)
            .map_err(|e| e.to_string()),
        ItemType::SharedDataRef => SharedDataRef::unpack_bytes(body)
            .map(ItemBody::SharedDataRef)
            .map_err(|e| e.to_string()),
        ItemType::ChunkItem => decode_chunk(body).map_err(|e| e.to_string()),
        ItemType::DevItem => DevItem::unpack_bytes(body)
            .map(ItemBody::Dev)
            .map_err(|e| e.to_string()),
        ItemType::DevExtent => DevExtent::unpack_bytes(body)
            .map(ItemBody::DevExtent)
            .map_err(|e| e.to_string()),
        ItemType::ExtentCsum => decode_extent_csum(key, body, ctx),
        ItemType::BlockGroupItem => BlockGroupItem::unpack_bytes(body)
            .map(ItemBody::BlockGroup)
            .map_err(|e| e.to_string()),
        ItemType::FreeSpaceInfo => {
            // The free-space-tree FREE_SPACE_INFO item and the legacy v1
            // free-space-cache header item share the type byte in this
            // engine's closed sum; distinguish by size the way
            // `btrfs-progs`' `free-space-cache.c` does (the v1 header is a
            // fixed 24-byte `struct btrfs_free_space_header` wrapping a
            // disk key plus two counters).
            if body.len() == 8 {
                FreeSpaceInfo::unpack_bytes(body)
                    .map(ItemBody::FreeSpaceInfo)
                    .map_err(|e| e.to_string())
            } else if body.len() >= DiskKey::SIZE + 16 {
                let mut r = crate::binstruct::Reader::new(body);
                let _location = DiskKey::unpack(&mut r).map_err(|e| e.to_string())?;
                let num_entries = r.u64().map_err(|e| e.to_string())?;
                let num_bitmaps = r.u64().map_err(|e| e.to_string())?;
                Ok(ItemBody::FreeSpaceHeader {
                    num_entries,
                    num_bitmaps,
                })
            } else {
                Err(format!("free space item of unexpected size {}", body.len()))
            }
        }
        ItemType::FreeSpaceExtent | ItemType::FreeSpaceBitmap => Ok(ItemBody::Empty),
        ItemType::UuidKeySubvol | ItemType::UuidKeyReceivedSubvol => UuidMapItem::decode(body)
            .map(ItemBody::UuidMap)
            .map_err(|e| e.to_string()),
        ItemType::PersistentItem if key.objectid == ObjID::DEV_STATS => DevStats::decode(body)
            .map(ItemBody::DevStats)
            .map_err(|e| e.to_string()),
        ItemType::ExtentData => FileExtent::decode(body)
            .map(ItemBody::FileExtent)
            .map_err(|e| e.to_string()),
        ItemType::OrphanItem
        | ItemType::DirLogItem
        | ItemType::DirLogIndex
        | ItemType::RootBackref
        | ItemType::RootRef
        | ItemType::TreeBlockRef
        | ItemType::SharedBlockRef
        | ItemType::QgroupStatus
        | ItemType::QgroupInfo
        | ItemType::QgroupLimit
        | ItemType::QgroupRelation
        | ItemType::TemporaryItem
        | ItemType::PersistentItem
        | ItemType::DevReplace
        | ItemType::StringItem
        | ItemType::CsumItem
        | ItemType::Min
        | ItemType::Max => Ok(ItemBody::Empty),
        ItemType::Unknown(other) => Err(format!("unknown item type {:#04x}", other)),
    }
}

fn decode_chunk(body: &[u8]) -> Result<ItemBody, crate::error::NodeError> {
    let mut r = crate::binstruct::Reader::new(body);
    let header = ChunkHeader::unpack(&mut r)?;
    let mut stripes = Vec::with_capacity(header.num_stripes as usize);
    for _ in 0..header.num_stripes {
        stripes.push(Stripe::unpack(&mut r)?);
    }
    Ok(ItemBody::Chunk { header, stripes })
}

/// `EXTENT_CSUM` decodes fingerprints back-to-back until the body is
/// exhausted; a leftover tail shorter than one fingerprint is
/// `TruncatedChecksum` (spec.md §4.2).
fn decode_extent_csum(key: Key, body: &[u8], ctx: DecodeCtx) -> Result<ItemBody, String> {
    let width = ctx.checksum_kind.size();
    if width == 0 {
        return Err("zero-width checksum kind".to_string());
    }
    let mut sums = Vec::with_capacity(body.len() / width);
    let mut pos = 0;
    while pos + width <= body.len() {
        sums.push(Fingerprint::from_bytes(&body[pos..pos + width]));
        pos += width;
    }
    if pos != body.len() {
        return Err(format!(
            "truncated checksum item: {} bytes remain, checksum size is {}",
            body.len() - pos,
            width
        ));
    }
    Ok(ItemBody::ExtentCsum(ExtentCsumRun {
        start_logical: key.offset,
        sectorsize: ctx.sectorsize,
        sums,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::ObjID;

    fn ctx() -> DecodeCtx {
        DecodeCtx {
            checksum_kind: ChecksumKind::Crc32c,
            sectorsize: 4096,
        }
    }

    #[test]
    fn unknown_item_type_decodes_to_error_not_panic() {
        let key = Key::new(ObjID(1), 0xee, 0);
        let body = decode_item(key, &[1, 2, 3], ctx());
        assert!(body.is_error());
    }

    #[test]
    fn extent_csum_decodes_whole_fingerprints() {
        let key = Key::new(ObjID::EXTENT_CSUM, 0x80, 0x1000);
        let body = vec![0xaau8; 4 * 3];
        let decoded = decode_item(key, &body, ctx());
        match decoded {
            ItemBody::ExtentCsum(run) => {
                assert_eq!(run.sums.len(), 3);
                assert_eq!(run.start_logical, 0x1000);
            }
            _ => panic!("expected ExtentCsum"),
        }
    }

    #[test]
    fn extent_csum_truncated_tail_is_an_error_not_a_panic() {
        let key = Key::new(ObjID::EXTENT_CSUM, 0x80, 0x1000);
        let body = vec![0xaau8; 4 * 3 + 2];
        let decoded = decode_item(key, &body, ctx());
        assert!(decoded.is_error());
    }

    #[test]
    fn chunk_item_decodes_header_and_stripes() {
        use crate::binstruct::Writer;
        let mut w = Writer::new();
        ChunkHeader {
            length: 0x10000,
            owner: 2,
            stripe_len: 65536,
            chunk_type: 1,
            io_align: 4096,
            io_width: 4096,
            sector_size: 4096,
            num_stripes: 2,
            sub_stripes: 1,
        }
        .pack(&mut w);
        for devid in [1u64, 2] {
            Stripe {
                devid,
                offset: 0,
                dev_uuid: [0u8; 16],
            }
            .pack(&mut w);
        }
        let body = w.into_vec();
        let key = Key::new(ObjID::FIRST_CHUNK_TREE, 0xe4, 0);
        match decode_item(key, &body, ctx()) {
            ItemBody::Chunk { header, stripes } => {
                assert_eq!(header.num_stripes, 2);
                assert_eq!(stripes.len(), 2);
            }
            _ => panic!("expected Chunk"),
        }
    }
}
