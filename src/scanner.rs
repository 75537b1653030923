//! Device scanner (spec.md §4.3): sector-by-sector walk of every device,
//! probing each aligned node-size window with [`read_node`] and no
//! expectations, accumulating whatever classifications the caller wants.
//!
//! Grounded on `btrfs.rs::dump`'s manual offset arithmetic (`key_ptr_start +
//! i * size_of::<btrfs_key_ptr>()`) generalized into the
//! hook-driven `DeviceScanner` state machine spec.md describes, and on
//! `address.rs`'s device-present-or-skip handling for "one worker per
//! device" (§5).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::addr::{DeviceID, Generation, LogicalAddr, ObjID, PhysicalAddr};
use crate::device::DeviceFile;
use crate::error::RecoverError;
use crate::fingerprint::ChecksumKind;
use crate::items::ItemBody;
use crate::node::{read_node, NodeExpectations};
use crate::structures::{BTRFS_SUPER_INFO_SIZE, BTRFS_SUPER_MIRROR_OFFSETS};
use crate::uuid::Uuid;

/// Cooperative cancellation token (spec.md §5): checked once per sector and
/// once per discovered node.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Coarse progress counters a scan reports while it runs (spec.md §5, "a
/// coarse ~1s schedule").
#[derive(Default)]
pub struct ScanStats {
    pub bytes_scanned: AtomicU64,
    pub nodes_found: AtomicU64,
}

/// One found node's classification, as recorded by a scan (spec.md §3
/// "Scan results").
#[derive(Clone, Copy)]
pub struct FoundNode {
    pub addr: LogicalAddr,
    pub level: u8,
    pub generation: Generation,
    pub owner: ObjID,
}

#[derive(Clone)]
pub struct FoundExtentCsum {
    pub start_logical: u64,
    pub sectorsize: u64,
    pub sums: Vec<crate::fingerprint::Fingerprint>,
}

#[derive(Clone, Copy)]
pub struct FoundChunkStripe {
    pub devid: u64,
    pub offset: u64,
    pub dev_uuid: [u8; 16],
}

#[derive(Clone)]
pub struct FoundChunk {
    pub logical: u64,
    pub length: u64,
    pub chunk_type: u64,
    pub stripes: Vec<FoundChunkStripe>,
}

#[derive(Clone, Copy)]
pub struct FoundDevExtent {
    pub devid: u64,
    pub physical: u64,
    pub chunk_objectid: u64,
    pub chunk_offset: u64,
    pub length: u64,
}

#[derive(Clone, Copy)]
pub struct FoundDevItem {
    pub devid: u64,
    pub total_bytes: u64,
    pub uuid: [u8; 16],
}

#[derive(Clone, Copy)]
pub struct FoundBlockGroup {
    pub logical: u64,
    pub length: u64,
    pub used: u64,
    pub flags: u64,
}

/// Per-device scan output (spec.md §3 "Scan results", §6 "Scan results
/// JSON"). Used as immutable input to the reconstructor and the graph.
#[derive(Default, Clone)]
pub struct ScanResult {
    pub found_nodes: Vec<FoundNode>,
    pub checksum_size: usize,
    pub extent_csums: Vec<FoundExtentCsum>,
    pub chunks: Vec<FoundChunk>,
    pub dev_extents: Vec<FoundDevExtent>,
    pub devs: Vec<FoundDevItem>,
    pub block_groups: Vec<FoundBlockGroup>,
}

/// Fixed parameters shared by every scan of one filesystem.
pub struct ScanConfig {
    pub fs_uuid: Uuid,
    pub checksum_kind: ChecksumKind,
    pub sector_size: u64,
    pub node_size: u64,
}

/// Sector-enumeration driver (spec.md §4.3 "Design"). `dev` is scanned from
/// offset 0 in `sector_size` steps; every aligned, non-superblock,
/// in-bounds `node_size` window is probed with [`read_node`]. On a
/// successful decode, `found` records it and the minimum next-node offset
/// jumps past it (nodes never overlap).
pub fn scan_device(
    dev: &DeviceFile,
    dev_id: DeviceID,
    cfg: &ScanConfig,
    cancel: &CancelToken,
    stats: &ScanStats,
) -> Result<ScanResult, RecoverError> {
    let mut result = ScanResult {
        checksum_size: cfg.checksum_kind.size(),
        ..Default::default()
    };
    let dev_len = dev.len();
    let mut paddr = 0u64;
    let mut min_next_node = 0u64;
    log::debug!("scanning device {:?}: {} bytes", dev_id, dev_len);

    while paddr < dev_len {
        if cancel.is_canceled() {
            return Err(RecoverError::Canceled);
        }
        stats.bytes_scanned.fetch_add(cfg.sector_size, Ordering::Relaxed);

        let in_superblock = BTRFS_SUPER_MIRROR_OFFSETS.iter().any(|&sb| {
            let sb_end = sb + BTRFS_SUPER_INFO_SIZE as u64;
            paddr < sb_end && paddr + cfg.node_size > sb
        });

        if paddr >= min_next_node && !in_superblock && paddr + cfg.node_size <= dev_len {
            if let Ok(buf) = dev.slice(paddr, cfg.node_size as usize) {
                let expectations = NodeExpectations::none();
                if let Ok(node) = read_node(
                    buf,
                    cfg.fs_uuid,
                    cfg.checksum_kind,
                    cfg.sector_size,
                    LogicalAddr::new(paddr as i64),
                    &expectations,
                ) {
                    stats.nodes_found.fetch_add(1, Ordering::Relaxed);
                    record_node(&mut result, &node);
                    min_next_node = paddr + cfg.node_size;
                }
            }
        }

        paddr += cfg.sector_size;
    }
    Ok(result)
}

fn record_node(result: &mut ScanResult, node: &crate::node::Node) {
    result.found_nodes.push(FoundNode {
        addr: node.addr,
        level: node.level,
        generation: node.generation,
        owner: node.owner,
    });

    if let crate::node::NodeBody::Leaf(items) = &node.body {
        for item in items {
            match &item.body {
                ItemBody::ExtentCsum(run) => result.extent_csums.push(FoundExtentCsum {
                    start_logical: run.start_logical,
                    sectorsize: run.sectorsize,
                    sums: run.sums.clone(),
                }),
                ItemBody::Chunk { header, stripes } => result.chunks.push(FoundChunk {
                    logical: item.key.offset,
                    length: header.length,
                    chunk_type: header.chunk_type,
                    stripes: stripes
                        .iter()
                        .map(|s| FoundChunkStripe {
                            devid: s.devid,
                            offset: s.offset,
                            dev_uuid: s.dev_uuid,
                        })
                        .collect(),
                }),
                ItemBody::DevExtent(de) => result.dev_extents.push(FoundDevExtent {
                    devid: item.key.objectid.as_u64(),
                    physical: item.key.offset,
                    chunk_objectid: de.chunk_objectid,
                    chunk_offset: de.chunk_offset,
                    length: de.length,
                }),
                ItemBody::Dev(di) => result.devs.push(FoundDevItem {
                    devid: di.devid,
                    total_bytes: di.total_bytes,
                    uuid: di.uuid,
                }),
                ItemBody::BlockGroup(bg) => result.block_groups.push(FoundBlockGroup {
                    logical: item.key.objectid.as_u64(),
                    length: item.key.offset,
                    used: bg.used,
                    flags: bg.flags,
                }),
                _ => {}
            }
        }
    }
}

/// Node-lister scanner (spec.md §4.3 "node-lister that collects node
/// addresses"): a thin wrapper over `scan_device` that keeps only the
/// address list, for `rebuild-trees --node-list`.
pub fn list_nodes(
    dev: &DeviceFile,
    dev_id: DeviceID,
    cfg: &ScanConfig,
    cancel: &CancelToken,
) -> Result<Vec<LogicalAddr>, RecoverError> {
    let stats = ScanStats::default();
    let result = scan_device(dev, dev_id, cfg, cancel, &stats)?;
    Ok(result.found_nodes.into_iter().map(|n| n.addr).collect())
}

/// Runs `scan_device` against every device in parallel, one thread per
/// device (spec.md §5 "one worker per physical device"), joining into a
/// `DeviceID -> ScanResult` map. Per-device ordering is preserved; relative
/// ordering across devices is not defined (and not meaningful: each
/// device's scan is independent).
pub fn scan_all_devices(
    devices: &crate::device::DeviceSet,
    cfg: &ScanConfig,
    cancel: &CancelToken,
) -> Vec<(DeviceID, Result<ScanResult, RecoverError>)> {
    std::thread::scope(|scope| {
        let handles: Vec<_> = devices
            .ids()
            .map(|id| {
                let stats = ScanStats::default();
                let cancel = cancel.clone();
                scope.spawn(move || {
                    let dev = devices.get(id).expect("id came from devices.ids()");
                    (id, scan_device(dev, id, cfg, &cancel, &stats))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("scan worker panicked")).collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binstruct::{BinStruct, Writer};
    use crate::structures::{Header, ItemHeader, DiskKey, BTRFS_HEADER_SIZE};
    use std::io::Write;

    fn fs_uuid() -> Uuid {
        Uuid::from_bytes([7u8; 16])
    }

    fn build_node_image(node_size: usize, sector_size: u64, node_addr: u64, total_len: usize) -> Vec<u8> {
        let mut image = vec![0u8; total_len];
        let mut node = vec![0u8; node_size];

        let key = DiskKey {
            objectid: ObjID::FS_TREE.0,
            item_type: 0x01,
            offset: 0,
        };
        let data = vec![0x11u8; 8];
        let mut headers = Writer::new();
        ItemHeader {
            key,
            offset: 0,
            size: data.len() as u32,
        }
        .pack(&mut headers);
        let headers_bytes = headers.into_vec();
        node[BTRFS_HEADER_SIZE..BTRFS_HEADER_SIZE + headers_bytes.len()].copy_from_slice(&headers_bytes);
        let data_start = BTRFS_HEADER_SIZE + headers_bytes.len();
        node[data_start..data_start + data.len()].copy_from_slice(&data);

        let mut header_buf = Writer::new();
        Header {
            csum: [0u8; 32],
            fsid: fs_uuid().as_bytes(),
            bytenr: node_addr,
            flags: 0,
            chunk_tree_uuid: [0u8; 16],
            generation: 3,
            owner: ObjID::FS_TREE.as_u64(),
            nritems: 1,
            level: 0,
        }
        .pack(&mut header_buf);
        let header_bytes = header_buf.into_vec();
        node[..header_bytes.len()].copy_from_slice(&header_bytes);

        let csum = crate::node::checksum_over(ChecksumKind::Crc32c, &node).unwrap();
        node[..32].copy_from_slice(&csum.0);

        let pos = node_addr as usize;
        image[pos..pos + node_size].copy_from_slice(&node);
        let _ = sector_size;
        image
    }

    #[test]
    fn finds_a_node_placed_past_the_superblock_regions() {
        let node_size = 4096usize;
        let sector_size = 512u64;
        let node_addr = 0x0500_0000u64; // past the first two superblock mirrors
        let total_len = (node_addr as usize) + node_size + 4096;
        let image = build_node_image(node_size, sector_size, node_addr, total_len);

        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&image).unwrap();
        let dev = DeviceFile::open(f.path()).unwrap();

        let cfg = ScanConfig {
            fs_uuid: fs_uuid(),
            checksum_kind: ChecksumKind::Crc32c,
            sector_size,
            node_size: node_size as u64,
        };
        let cancel = CancelToken::new();
        let stats = ScanStats::default();
        let result = scan_device(&dev, DeviceID::new(1), &cfg, &cancel, &stats).unwrap();
        assert_eq!(result.found_nodes.len(), 1);
        assert_eq!(result.found_nodes[0].addr, LogicalAddr::new(node_addr as i64));
    }

    #[test]
    fn cancellation_is_observed_mid_scan() {
        let node_size = 4096usize;
        let sector_size = 512u64;
        let total_len = 1 << 20;
        let image = vec![0u8; total_len];
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&image).unwrap();
        let dev = DeviceFile::open(f.path()).unwrap();
        let cfg = ScanConfig {
            fs_uuid: fs_uuid(),
            checksum_kind: ChecksumKind::Crc32c,
            sector_size,
            node_size: node_size as u64,
        };
        let cancel = CancelToken::new();
        cancel.cancel();
        let stats = ScanStats::default();
        let err = scan_device(&dev, DeviceID::new(1), &cfg, &cancel, &stats).unwrap_err();
        assert!(matches!(err, RecoverError::Canceled));
    }
}
