//! Volume mapper (spec.md §4.1): logical-to-physical chunk mapping.
//!
//! Grounded on `address.rs::load_virt_block`, which walks a chunk's stripe
//! list looking for a device that is actually present, returning the first
//! one it finds. We generalize that lookup into a proper sorted mapping
//! table that can be populated incrementally as `CHUNK_ITEM`/`DEV_EXTENT`
//! records are recovered (spec.md §4.4), rather than only from the
//! superblock's system chunk array.

use std::collections::HashMap;

use crate::addr::{DeviceID, LogicalAddr, PhysicalAddr};
use crate::device::DeviceSet;
use crate::error::{RecoverError, VolumeError};

/// One physical copy of a chunk's data, on a specific device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StripeMapping {
    pub device: DeviceID,
    pub physical: PhysicalAddr,
}

/// A logical byte range and where its copies live.
#[derive(Clone, Debug)]
pub struct Mapping {
    pub logical_start: LogicalAddr,
    pub length: u64,
    pub stripes: Vec<StripeMapping>,
    pub chunk_type: u64,
}

impl Mapping {
    fn end(&self) -> LogicalAddr {
        self.logical_start + self.length
    }

    fn contains(&self, addr: LogicalAddr) -> bool {
        addr >= self.logical_start && addr < self.end()
    }

    fn same_stripes(&self, other: &Mapping) -> bool {
        self.logical_start == other.logical_start
            && self.length == other.length
            && self.stripes == other.stripes
    }
}

/// Sorted table of logical->physical chunk mappings plus the device set
/// they resolve against. Mappings are kept sorted by `logical_start` so
/// `resolve` can binary-search instead of scanning linearly, the way a real
/// chunk tree lookup would.
pub struct Volume<'d> {
    mappings: Vec<Mapping>,
    devices: &'d DeviceSet,
}

impl<'d> Volume<'d> {
    pub fn new(devices: &'d DeviceSet) -> Volume<'d> {
        Volume {
            mappings: Vec::new(),
            devices,
        }
    }

    /// Inserts a mapping, keeping the table sorted by `logical_start`.
    ///
    /// Two mappings that describe the exact same range with the exact same
    /// stripes are treated as idempotent (multiple sources — the
    /// superblock's bootstrap array and the recovered chunk tree — commonly
    /// agree on the same chunk). Anything else that overlaps an existing
    /// mapping is a [`VolumeError::MappingConflict`] (spec.md's Open
    /// Question on mapping-coalescing determinism: conflicts are surfaced,
    /// never silently resolved by picking one side).
    pub fn add_mapping(&mut self, m: Mapping) -> Result<(), VolumeError> {
        let pos = self
            .mappings
            .partition_point(|existing| existing.logical_start < m.logical_start);

        for existing in self.mappings.iter() {
            let overlaps = m.logical_start < existing.end() && existing.logical_start < m.end();
            if !overlaps {
                continue;
            }
            if existing.same_stripes(&m) {
                return Ok(());
            }
            return Err(VolumeError::MappingConflict {
                new_start: m.logical_start,
                new_len: m.length,
                with_start: existing.logical_start,
                with_len: existing.length,
            });
        }

        self.mappings.insert(pos, m);
        Ok(())
    }

    /// Every mapping currently known, in `logical_start` order — the table
    /// the mappings JSON contract (spec.md §6) serializes.
    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    /// Resolves a logical address to every stripe copy covering it, plus
    /// `maxlen`: the number of bytes from `addr` that stay within this
    /// mapping (spec.md §4.1 `Resolve`). Callers must truncate any read at
    /// `maxlen` rather than assume the mapping extends further.
    pub fn resolve(&self, addr: LogicalAddr) -> Result<(&[StripeMapping], u64), VolumeError> {
        let idx = self
            .mappings
            .partition_point(|m| m.logical_start <= addr)
            .checked_sub(1);
        match idx.and_then(|i| self.mappings.get(i)) {
            Some(m) if m.contains(addr) => Ok((&m.stripes, (m.end() - addr).0 as u64)),
            _ => Err(VolumeError::UnmappedLogical(addr)),
        }
    }

    /// Logical ranges within `[0, fs_size)` that no mapping covers —
    /// evidence of chunks the reconstructor hasn't found yet.
    pub fn logical_gaps(&self, fs_size: u64) -> Vec<(LogicalAddr, u64)> {
        let mut gaps = Vec::new();
        let mut cursor = LogicalAddr::new(0);
        for m in &self.mappings {
            if m.logical_start > cursor {
                gaps.push((cursor, (m.logical_start - cursor).0 as u64));
            }
            if m.end() > cursor {
                cursor = m.end();
            }
        }
        let total_end = LogicalAddr::new(fs_size as i64);
        if cursor < total_end {
            gaps.push((cursor, (total_end - cursor).0 as u64));
        }
        gaps
    }

    /// Per-device complement of every stripe's physical byte range,
    /// bounded by each device's own size (spec.md §4.1 `PhysicalGaps`).
    /// This is what the matchsum pass scans for content it can fingerprint
    /// and match back to an unmapped logical address — `logical_gaps`
    /// alone can't drive that scan since it says nothing about where on
    /// disk to actually look.
    pub fn physical_gaps(&self) -> HashMap<DeviceID, Vec<(PhysicalAddr, u64)>> {
        let mut by_device: HashMap<DeviceID, Vec<(PhysicalAddr, u64)>> = HashMap::new();
        for dev in self.devices.ids() {
            let mut ranges: Vec<(PhysicalAddr, u64)> = Vec::new();
            for m in &self.mappings {
                for s in &m.stripes {
                    if s.device == dev {
                        ranges.push((s.physical, m.length));
                    }
                }
            }
            ranges.sort_by_key(|(start, _)| *start);

            let dev_len = self.devices.get(dev).map(|d| d.len()).unwrap_or(0);
            let mut gaps = Vec::new();
            let mut cursor = PhysicalAddr::new(0);
            for (start, len) in &ranges {
                if *start > cursor {
                    gaps.push((cursor, (*start - cursor).0 as u64));
                }
                let end = PhysicalAddr::new(start.0 + *len as i64);
                if end > cursor {
                    cursor = end;
                }
            }
            let total_end = PhysicalAddr::new(dev_len as i64);
            if cursor < total_end {
                gaps.push((cursor, (total_end - cursor).0 as u64));
            }
            by_device.insert(dev, gaps);
        }
        by_device
    }

    /// Reads `len` raw bytes at a physical address on a specific device,
    /// bypassing the logical mapping entirely. Used by the matchsum pass
    /// (spec.md §4.4), which is scanning for content *before* it knows what,
    /// if anything, maps there.
    pub fn read_physical(&self, dev: DeviceID, addr: PhysicalAddr, len: usize) -> std::io::Result<Vec<u8>> {
        self.devices.read_physical(dev, addr, len).map(|s| s.to_vec())
    }

    /// Reads `len` bytes starting at logical address `addr`, reading every
    /// stripe copy and comparing them (spec.md §4.1 `ReadAt`: "reads from
    /// every stripe into scratch buffers, returns the common bytes; if
    /// stripes disagree, fails with `StripeMismatch`"). Reads are truncated
    /// at the mapping boundary (`resolve`'s `maxlen`) rather than erroring —
    /// a short read is a contract, not an error.
    pub fn read_at(&self, addr: LogicalAddr, len: usize) -> Result<Vec<u8>, RecoverError> {
        let (stripes, maxlen) = self.resolve(addr)?;
        let mapping = self
            .mappings
            .iter()
            .find(|m| m.contains(addr))
            .expect("resolve() succeeded so a containing mapping exists");
        let delta = (addr - mapping.logical_start).0 as u64;
        let read_len = (len as u64).min(maxlen) as usize;

        let mut consensus: Option<Vec<u8>> = None;
        for stripe in stripes {
            let device = self
                .devices
                .get(stripe.device)
                .ok_or(VolumeError::UnknownDevice(stripe.device))?;
            let phys = PhysicalAddr::new(stripe.physical.0 + delta as i64);
            let bytes = device.slice(phys.as_u64(), read_len).map_err(RecoverError::Io)?;
            match &consensus {
                None => consensus = Some(bytes.to_vec()),
                Some(first) if first.as_slice() == bytes => {}
                Some(_) => {
                    return Err(RecoverError::Volume(VolumeError::StripeMismatch {
                        laddr: addr,
                        len: read_len as u64,
                    }));
                }
            }
        }
        consensus.ok_or(RecoverError::Volume(VolumeError::UnmappedLogical(addr)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(start: i64, len: u64, dev: i64, phys: i64) -> Mapping {
        Mapping {
            logical_start: LogicalAddr::new(start),
            length: len,
            stripes: vec![StripeMapping {
                device: DeviceID::new(dev),
                physical: PhysicalAddr::new(phys),
            }],
            chunk_type: 0,
        }
    }

    #[test]
    fn resolve_finds_containing_mapping() {
        let devices = DeviceSet::new();
        let mut vol = Volume::new(&devices);
        vol.add_mapping(mapping(0x1000, 0x1000, 1, 0x2000)).unwrap();
        vol.add_mapping(mapping(0x5000, 0x1000, 1, 0x9000)).unwrap();

        let (stripes, maxlen) = vol.resolve(LogicalAddr::new(0x1500)).unwrap();
        assert_eq!(stripes[0].physical, PhysicalAddr::new(0x2500));
        assert_eq!(maxlen, 0xb00);
    }

    #[test]
    fn resolve_errors_on_unmapped_address() {
        let devices = DeviceSet::new();
        let mut vol = Volume::new(&devices);
        vol.add_mapping(mapping(0x1000, 0x1000, 1, 0x2000)).unwrap();
        assert!(vol.resolve(LogicalAddr::new(0x9000)).is_err());
    }

    #[test]
    fn identical_mapping_is_idempotent() {
        let devices = DeviceSet::new();
        let mut vol = Volume::new(&devices);
        vol.add_mapping(mapping(0x1000, 0x1000, 1, 0x2000)).unwrap();
        vol.add_mapping(mapping(0x1000, 0x1000, 1, 0x2000)).unwrap();
        assert_eq!(vol.mappings.len(), 1);
    }

    #[test]
    fn conflicting_mapping_is_rejected() {
        let devices = DeviceSet::new();
        let mut vol = Volume::new(&devices);
        vol.add_mapping(mapping(0x1000, 0x1000, 1, 0x2000)).unwrap();
        let err = vol.add_mapping(mapping(0x1000, 0x1000, 1, 0x4000)).unwrap_err();
        assert!(matches!(err, VolumeError::MappingConflict { .. }));
    }

    #[test]
    fn logical_gaps_reports_uncovered_ranges() {
        let devices = DeviceSet::new();
        let mut vol = Volume::new(&devices);
        vol.add_mapping(mapping(0x1000, 0x1000, 1, 0x2000)).unwrap();
        let gaps = vol.logical_gaps(0x4000);
        assert_eq!(gaps, vec![(LogicalAddr::new(0), 0x1000), (LogicalAddr::new(0x2000), 0x2000)]);
    }

    #[test]
    fn physical_gaps_are_per_device_and_bounded_by_device_size() {
        let mut devices = DeviceSet::new();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut tmp.as_file(), &vec![0u8; 0x4000]).unwrap();
        let dev = crate::device::DeviceFile::open(tmp.path()).unwrap();
        devices.insert(DeviceID::new(1), dev);

        let mut vol = Volume::new(&devices);
        vol.add_mapping(mapping(0x1000, 0x1000, 1, 0x2000)).unwrap();
        let gaps = vol.physical_gaps();
        let dev_gaps = gaps.get(&DeviceID::new(1)).unwrap();
        assert_eq!(
            dev_gaps,
            &vec![(PhysicalAddr::new(0), 0x2000), (PhysicalAddr::new(0x3000), 0x1000)]
        );
    }

    fn dup_mapping(start: i64, len: u64, stripes: Vec<(i64, i64)>) -> Mapping {
        Mapping {
            logical_start: LogicalAddr::new(start),
            length: len,
            stripes: stripes
                .into_iter()
                .map(|(dev, phys)| StripeMapping {
                    device: DeviceID::new(dev),
                    physical: PhysicalAddr::new(phys),
                })
                .collect(),
            chunk_type: 0,
        }
    }

    #[test]
    fn read_at_returns_common_bytes_when_stripes_agree() {
        let mut devices = DeviceSet::new();
        let tmp1 = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut tmp1.as_file(), &[0xABu8; 0x2000]).unwrap();
        let tmp2 = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut tmp2.as_file(), &[0xABu8; 0x2000]).unwrap();
        devices.insert(DeviceID::new(1), crate::device::DeviceFile::open(tmp1.path()).unwrap());
        devices.insert(DeviceID::new(2), crate::device::DeviceFile::open(tmp2.path()).unwrap());

        let mut vol = Volume::new(&devices);
        vol.add_mapping(dup_mapping(0x1000, 0x1000, vec![(1, 0x1000), (2, 0x1000)])).unwrap();

        let bytes = vol.read_at(LogicalAddr::new(0x1000), 16).unwrap();
        assert_eq!(bytes, vec![0xABu8; 16]);
    }

    #[test]
    fn read_at_detects_stripe_mismatch() {
        let mut devices = DeviceSet::new();
        let tmp1 = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut tmp1.as_file(), &[0xAAu8; 0x2000]).unwrap();
        let tmp2 = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut tmp2.as_file(), &[0xBBu8; 0x2000]).unwrap();
        devices.insert(DeviceID::new(1), crate::device::DeviceFile::open(tmp1.path()).unwrap());
        devices.insert(DeviceID::new(2), crate::device::DeviceFile::open(tmp2.path()).unwrap());

        let mut vol = Volume::new(&devices);
        vol.add_mapping(dup_mapping(0x1000, 0x1000, vec![(1, 0x1000), (2, 0x1000)])).unwrap();

        let err = vol.read_at(LogicalAddr::new(0x1000), 16).unwrap_err();
        assert!(matches!(
            err,
            RecoverError::Volume(VolumeError::StripeMismatch { .. })
        ));
    }

    #[test]
    fn read_at_truncates_at_mapping_boundary() {
        let mut devices = DeviceSet::new();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut tmp.as_file(), &[0xCDu8; 0x3000]).unwrap();
        devices.insert(DeviceID::new(1), crate::device::DeviceFile::open(tmp.path()).unwrap());

        let mut vol = Volume::new(&devices);
        vol.add_mapping(mapping(0x1000, 0x1000, 1, 0x1000)).unwrap();

        // Requested length runs past this mapping's end; read_at must
        // truncate at `maxlen` rather than read into whatever follows.
        let bytes = vol.read_at(LogicalAddr::new(0x1c00), 0x1000).unwrap();
        assert_eq!(bytes.len(), 0x400);
    }
}
