//! Superblock layer (spec.md §2 "Superblock layer", §3 "Superblock").
//!
//! The teacher's `btrfs.rs::load_sb` reads a single superblock copy at the
//! primary offset, checks the magic, and verifies the checksum — raising
//! `panic!`/`anyhow!` on any mismatch. This module generalizes that into
//! locating all three fixed-offset copies (spec.md §6) and picking the one
//! with the highest valid `generation`, the way `btrfs-progs` itself
//! recovers from a stale primary copy.

use crate::binstruct::BinStruct;
use crate::device::DeviceFile;
use crate::error::NodeError;
use crate::fingerprint::Fingerprint;
use crate::structures::{
    ChunkHeader, DiskKey, Stripe, SuperBlock, BTRFS_MAGIC, BTRFS_SUPER_INFO_SIZE,
    BTRFS_SUPER_MIRROR_OFFSETS,
};

/// A `CHUNK_ITEM` read out of the superblock's embedded system chunk array,
/// used to bootstrap the volume mapper before the real chunk tree is
/// reachable (spec.md §4.1).
#[derive(Clone)]
pub struct BootstrapChunk {
    pub key: DiskKey,
    pub header: ChunkHeader,
    pub stripes: Vec<Stripe>,
}

/// Validates a superblock's magic and (when the checksum kind is
/// implemented) its checksum. Magic mismatches are always an error; an
/// unimplemented checksum algorithm is not treated as invalid, matching the
/// "checksums are a pluggable contract" stance in spec.md §7.
pub fn validate(buf: &[u8]) -> Result<SuperBlock, NodeError> {
    let sb = SuperBlock::unpack_bytes(buf)?;
    if sb.magic != BTRFS_MAGIC {
        return Err(NodeError::Expectation {
            field: "superblock.magic",
            expected: format!("{:#x}", BTRFS_MAGIC),
            actual: format!("{:#x}", sb.magic),
        });
    }
    if let Some(kind) = sb.checksum_kind() {
        if let Ok(computed) = Fingerprint::sum(kind, &buf[32..BTRFS_SUPER_INFO_SIZE]) {
            let expected = Fingerprint::from_bytes(&sb.csum);
            if computed.as_slice(kind) != expected.as_slice(kind) {
                return Err(NodeError::Expectation {
                    field: "superblock.csum",
                    expected: format!("{:?}", expected),
                    actual: format!("{:?}", computed),
                });
            }
        }
    }
    Ok(sb)
}

/// Reads and validates the superblock at each of the three fixed mirror
/// offsets that fit on `dev`, returning the ones that parsed and validated
/// cleanly, highest generation first.
pub fn read_all_copies(dev: &DeviceFile) -> Vec<SuperBlock> {
    let mut out = Vec::new();
    for &offset in BTRFS_SUPER_MIRROR_OFFSETS.iter() {
        if offset + BTRFS_SUPER_INFO_SIZE as u64 > dev.len() {
            continue;
        }
        let Ok(buf) = dev.slice(offset, BTRFS_SUPER_INFO_SIZE) else {
            continue;
        };
        if let Ok(sb) = validate(buf) {
            out.push(sb);
        }
    }
    out.sort_by(|a, b| b.generation.cmp(&a.generation));
    out
}

/// Picks the highest-generation valid superblock copy on `dev`.
pub fn read_best(dev: &DeviceFile) -> Option<SuperBlock> {
    read_all_copies(dev).into_iter().next()
}

/// Walks the embedded system chunk array (spec.md §3, §4.1 bootstrap),
/// mirroring `btrfs.rs::SysChunkIter` but bounds-checked via `Reader`
/// instead of raw `Cursor`+`transmute`.
pub fn system_chunks(sb: &SuperBlock) -> Result<Vec<BootstrapChunk>, NodeError> {
    let mut r = crate::binstruct::Reader::new(&sb.sys_chunk_array[..sb.sys_chunk_array_size as usize]);
    let mut out = Vec::new();
    while r.remaining() > 0 {
        let key = DiskKey::unpack(&mut r)?;
        let header = ChunkHeader::unpack(&mut r)?;
        let mut stripes = Vec::with_capacity(header.num_stripes as usize);
        for _ in 0..header.num_stripes {
            stripes.push(Stripe::unpack(&mut r)?);
        }
        out.push(BootstrapChunk {
            key,
            header,
            stripes,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binstruct::Writer;
    use crate::structures::{DevItem, RootBackup, BTRFS_LABEL_SIZE, BTRFS_SYSTEM_CHUNK_ARRAY_SIZE};

    fn fixture_sb() -> SuperBlock {
        SuperBlock {
            csum: [0u8; 32],
            fsid: [1u8; 16],
            bytenr: BTRFS_SUPER_MIRROR_OFFSETS[0],
            flags: 0,
            magic: BTRFS_MAGIC,
            generation: 10,
            root: 0x4000,
            chunk_root: 0x2000,
            log_root: 0,
            total_bytes: 1 << 30,
            bytes_used: 1 << 20,
            root_dir_objectid: 6,
            num_devices: 1,
            sectorsize: 4096,
            nodesize: 16384,
            stripesize: 4096,
            sys_chunk_array_size: 0,
            chunk_root_generation: 10,
            compat_flags: 0,
            compat_ro_flags: 0,
            incompat_flags: 0,
            csum_type: 0,
            root_level: 0,
            chunk_root_level: 0,
            log_root_level: 0,
            dev_item: DevItem {
                devid: 1,
                total_bytes: 1 << 30,
                bytes_used: 1 << 20,
                io_align: 4096,
                io_width: 4096,
                sector_size: 4096,
                dev_type: 0,
                generation: 0,
                start_offset: 0,
                dev_group: 0,
                seek_speed: 0,
                bandwidth: 0,
                uuid: [2u8; 16],
                fsid: [1u8; 16],
            },
            label: [0u8; BTRFS_LABEL_SIZE],
            cache_generation: 0,
            uuid_tree_generation: 0,
            metadata_uuid: [1u8; 16],
            nr_global_roots: 0,
            block_group_root: 0,
            block_group_root_generation: 0,
            block_group_root_level: 0,
            sys_chunk_array: [0u8; BTRFS_SYSTEM_CHUNK_ARRAY_SIZE],
            super_roots: [RootBackup::default(); 4],
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let mut sb = fixture_sb();
        sb.magic = 0;
        let bytes = sb.pack_bytes();
        assert!(validate(&bytes).is_err());
    }

    #[test]
    fn accepts_plausible_superblock_with_unimplemented_checksum() {
        // csum_type Blake2 (3) means Fingerprint::sum errors internally and
        // validate() must not treat that as a validation failure.
        let mut sb = fixture_sb();
        sb.csum_type = 3;
        let bytes = sb.pack_bytes();
        assert!(validate(&bytes).is_ok());
    }

    #[test]
    fn system_chunks_decodes_empty_array() {
        let sb = fixture_sb();
        let chunks = system_chunks(&sb).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn system_chunks_decodes_one_entry() {
        let mut sb = fixture_sb();
        let mut w = Writer::new();
        DiskKey {
            objectid: 256,
            item_type: 0xe4,
            offset: 0,
        }
        .pack(&mut w);
        ChunkHeader {
            length: 1 << 20,
            owner: 2,
            stripe_len: 65536,
            chunk_type: 1,
            io_align: 4096,
            io_width: 4096,
            sector_size: 4096,
            num_stripes: 1,
            sub_stripes: 1,
        }
        .pack(&mut w);
        Stripe {
            devid: 1,
            offset: 0,
            dev_uuid: [2u8; 16],
        }
        .pack(&mut w);
        let bytes = w.into_vec();
        sb.sys_chunk_array[..bytes.len()].copy_from_slice(&bytes);
        sb.sys_chunk_array_size = bytes.len() as u32;
        let chunks = system_chunks(&sb).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].stripes.len(), 1);
    }
}
