//! Read-only FUSE mount (spec.md §6 `inspect mount`), feature-gated behind
//! `mount` since `fuser` needs `libfuse` on the host.
//!
//! The forest already answers every question a filesystem driver needs to
//! ask ("what's in this directory", "what are this inode's attributes",
//! "where are this file's bytes") via [`Forest::tree`] and friends; this
//! module is just the adapter translating FUSE's callback trait into those
//! calls, the way `pegasusheavy-btrf-mount-windows/src/fuse` adapts the same
//! kind of core onto Dokan. Everything here is read-only: every mutating
//! FUSE callback this driver doesn't implement falls back to `fuser`'s
//! default `ENOSYS` response.

use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory, ReplyEntry, Request};

use crate::addr::{Key, ObjID};
use crate::error::RecoverError;
use crate::fingerprint::{ChecksumKind, Fingerprint};
use crate::forest::Forest;
use crate::items::ItemBody;
use crate::structures::{FileExtent, InodeItem, Timespec};
use crate::volume::Volume;

const DIR_ITEM: u8 = 0x54;
const DIR_INDEX: u8 = 0x60;
const INODE_ITEM: u8 = 0x01;
const INODE_REF: u8 = 0x0c;
const EXTENT_DATA: u8 = 0x6c;
const EXTENT_CSUM: u8 = 0x80;

const S_IFMT: u32 = 0o170_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFLNK: u32 = 0o120_000;

/// btrfs `DirEntry::file_type` values (`struct btrfs_dir_item.type`), used
/// to pick a `FileType` without needing the target inode's own mode bits.
const FT_SYMLINK: u8 = 7;
const FT_DIR: u8 = 2;

const TTL: Duration = Duration::from_secs(1);

/// Mounts the rebuilt filesystem tree read-only at `mountpoint`, blocking
/// until the filesystem is unmounted.
///
/// `skip_filesums` disables per-block `EXTENT_CSUM` verification on reads
/// (spec.md §6 `--skip-filesums`): useful when recovering data whose
/// checksums didn't survive, at the cost of silently returning bit-rotted
/// bytes instead of an I/O error.
pub fn mount_readonly<'a>(
    forest: &'a Forest<'a, 'a>,
    volume: &'a Volume<'a>,
    sector_size: u64,
    checksum_kind: ChecksumKind,
    mountpoint: &Path,
    skip_filesums: bool,
) -> anyhow::Result<()> {
    let fs = RebuiltFs::new(forest, volume, sector_size, checksum_kind, skip_filesums)?;
    let options = [MountOption::RO, MountOption::FSName("btrfs-rebuild".to_string())];
    fuser::mount2(fs, mountpoint, &options)?;
    Ok(())
}

type TreeHandle = std::sync::Arc<parking_lot::RwLock<crate::forest::RebuiltTree>>;

struct RebuiltFs<'a> {
    forest: &'a Forest<'a, 'a>,
    volume: &'a Volume<'a>,
    tree: TreeHandle,
    root_ino: u64,
    sector_size: u64,
    checksum_kind: ChecksumKind,
    skip_filesums: bool,
}

impl<'a> RebuiltFs<'a> {
    fn new(
        forest: &'a Forest<'a, 'a>,
        volume: &'a Volume<'a>,
        sector_size: u64,
        checksum_kind: ChecksumKind,
        skip_filesums: bool,
    ) -> anyhow::Result<RebuiltFs<'a>> {
        let tree = forest.tree(ObjID::FS_TREE).map_err(RecoverError::from)?;
        let root_ino = root_dirid(forest).unwrap_or(256);
        Ok(RebuiltFs {
            forest,
            volume,
            tree,
            root_ino,
            sector_size,
            checksum_kind,
            skip_filesums,
        })
    }

    /// Maps a FUSE inode number onto an `ObjID` in the fs tree: FUSE
    /// reserves `1` for the mountpoint itself, which this tree calls
    /// whatever `root_dirid` the subvolume's `ROOT_ITEM` names (usually
    /// `256`, `BTRFS_FIRST_FREE_OBJECTID`).
    fn objid(&self, ino: u64) -> ObjID {
        if ino == fuser::FUSE_ROOT_ID {
            ObjID::from(self.root_ino as i64)
        } else {
            ObjID::from(ino as i64)
        }
    }

    fn ino(&self, objid: ObjID) -> u64 {
        if objid.as_u64() == self.root_ino {
            fuser::FUSE_ROOT_ID
        } else {
            objid.as_u64()
        }
    }

    fn lookup_inode(&self, objid: ObjID) -> Option<InodeItem> {
        let key = Key::new(objid, INODE_ITEM, 0);
        match self.forest.tree_lookup(&self.tree, key)?.body {
            ItemBody::Inode(i) => Some(i),
            _ => None,
        }
    }

    fn attr_of(&self, objid: ObjID, inode: &InodeItem) -> FileAttr {
        let kind = mode_to_kind(inode.mode);
        FileAttr {
            ino: self.ino(objid),
            size: inode.size,
            blocks: inode.nbytes.div_ceil(512),
            atime: timespec_to_systime(inode.atime),
            mtime: timespec_to_systime(inode.mtime),
            ctime: timespec_to_systime(inode.ctime),
            crtime: timespec_to_systime(inode.ctime),
            kind,
            perm: (inode.mode & 0o7777) as u16,
            nlink: inode.nlink,
            uid: inode.uid,
            gid: inode.gid,
            rdev: inode.rdev as u32,
            blksize: 4096,
            flags: 0,
        }
    }

    /// Reassembles a file's contents by walking `EXTENT_DATA` items in
    /// offset order and resolving each one's payload: inline bytes stored
    /// directly in the item, or a `(disk_bytenr, num_bytes)` pointer the
    /// volume mapper turns into a read off the backing device (spec.md §4.1
    /// `ReadAt`).
    fn read_file(&self, objid: ObjID, offset: u64, size: u32) -> Result<Vec<u8>, RecoverError> {
        let want_end = offset + size as u64;
        let mut out = Vec::new();
        let mut cursor = offset;
        let mut bad_checksum = false;
        self.forest.tree_subrange(
            &self.tree,
            |k| k.objectid == objid && k.item_type == EXTENT_DATA,
            |key, item| {
                if cursor >= want_end {
                    return;
                }
                let ItemBody::FileExtent(fe) = &item.body else { return };
                let extent_start = key.offset;
                match fe {
                    FileExtent::Inline { data, .. } => {
                        let extent_end = extent_start + data.len() as u64;
                        if extent_end <= cursor || extent_start >= want_end {
                            return;
                        }
                        let lo = cursor.saturating_sub(extent_start) as usize;
                        let hi = (want_end.min(extent_end) - extent_start) as usize;
                        out.extend_from_slice(&data[lo..hi]);
                        cursor = extent_start + hi as u64;
                    }
                    FileExtent::Reg { header: _, descriptor } | FileExtent::Prealloc { header: _, descriptor } => {
                        let extent_end = extent_start + descriptor.num_bytes;
                        if extent_end <= cursor || extent_start >= want_end {
                            return;
                        }
                        if descriptor.disk_bytenr == 0 {
                            // A hole: sparse region, no backing extent.
                            let lo = cursor.max(extent_start);
                            let hi = want_end.min(extent_end);
                            out.resize(out.len() + (hi - lo) as usize, 0);
                            cursor = hi;
                            return;
                        }
                        let read_from = cursor.max(extent_start);
                        let read_to = want_end.min(extent_end);
                        let laddr = crate::addr::LogicalAddr::from(
                            descriptor.disk_bytenr + (read_from - extent_start) + descriptor.offset,
                        );
                        match self.volume.read_at(laddr, (read_to - read_from) as usize) {
                            Ok(bytes) => {
                                if !self.verify_checksums(laddr, &bytes) {
                                    bad_checksum = true;
                                }
                                out.extend_from_slice(&bytes);
                            }
                            Err(_) => out.resize(out.len() + (read_to - read_from) as usize, 0),
                        }
                        cursor = read_to;
                    }
                }
            },
        );
        out.truncate((want_end.saturating_sub(offset)) as usize);
        if bad_checksum {
            return Err(RecoverError::Corrupt {
                subsystem: "mount",
                details: format!("checksum mismatch reading ino {} at offset {}", objid.as_u64(), offset),
            });
        }
        Ok(out)
    }

    /// Verifies `data` (read starting at logical `laddr`) against whatever
    /// `EXTENT_CSUM` entries the csum tree has over that range. Returns
    /// `false` only when a covering checksum exists and disagrees; missing
    /// coverage is not itself a failure (plenty of recovered trees have
    /// gaps in their csum tree).
    fn verify_checksums(&self, laddr: crate::addr::LogicalAddr, data: &[u8]) -> bool {
        if self.skip_filesums {
            return true;
        }
        let Ok(csum_tree) = self.forest.tree(ObjID::CSUM_TREE) else {
            return true;
        };
        let mut ok = true;
        self.forest.tree_subrange(
            &csum_tree,
            |k| k.item_type == EXTENT_CSUM && k.objectid == ObjID::EXTENT_CSUM,
            |_, item| {
                let ItemBody::ExtentCsum(run) = &item.body else { return };
                for (i, want) in run.sums.iter().enumerate() {
                    let block_laddr = run.start_logical + i as u64 * run.sectorsize;
                    if block_laddr < laddr.as_u64() || block_laddr >= laddr.as_u64() + data.len() as u64 {
                        continue;
                    }
                    let off = (block_laddr - laddr.as_u64()) as usize;
                    let end = (off + self.sector_size as usize).min(data.len());
                    if let Ok(got) = Fingerprint::sum(self.checksum_kind, &data[off..end]) {
                        if got.as_slice(self.checksum_kind) != want.as_slice(self.checksum_kind) {
                            ok = false;
                        }
                    }
                }
            },
        );
        ok
    }
}

fn root_dirid(forest: &Forest) -> Option<u64> {
    let root_tree = forest.tree(ObjID::ROOT_TREE).ok()?;
    let (_, item) = forest.tree_search(&root_tree, |k| k.objectid == ObjID::FS_TREE && k.item_type == 0x84)?;
    let ItemBody::Root(r) = item.body else { return None };
    Some(r.root_dirid)
}

fn mode_to_kind(mode: u32) -> FileType {
    match mode & S_IFMT {
        S_IFDIR => FileType::Directory,
        S_IFLNK => FileType::Symlink,
        _ => FileType::RegularFile,
    }
}

fn timespec_to_systime(t: Timespec) -> SystemTime {
    UNIX_EPOCH + Duration::new(t.sec, t.nsec)
}

impl<'a> Filesystem for RebuiltFs<'a> {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let parent_obj = self.objid(parent);
        let name_bytes = name.as_encoded_bytes();
        let mut child = None;
        self.forest.tree_subrange(
            &self.tree,
            |k| k.objectid == parent_obj && k.item_type == DIR_ITEM,
            |_, item| {
                if child.is_some() {
                    return;
                }
                if let ItemBody::DirList(entries) = item.body {
                    if let Some(e) = entries.iter().find(|e| e.name == name_bytes) {
                        child = Some(ObjID::from(e.location.objectid));
                    }
                }
            },
        );
        let Some(child) = child else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.lookup_inode(child) {
            Some(inode) => reply.entry(&TTL, &self.attr_of(child, &inode), 0),
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let objid = self.objid(ino);
        match self.lookup_inode(objid) {
            Some(inode) => reply.attr(&TTL, &self.attr_of(objid, &inode)),
            None => reply.error(libc::ENOENT),
        }
    }

    fn readdir(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let objid = self.objid(ino);
        let parent_ino = self
            .forest
            .tree_search(&self.tree, |k| k.objectid == objid && k.item_type == INODE_REF)
            .map(|(k, _)| self.ino(ObjID::from(k.offset as i64)))
            .unwrap_or(fuser::FUSE_ROOT_ID);
        let mut entries: Vec<(u64, FileType, String)> = vec![
            (self.ino(objid), FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];

        self.forest.tree_subrange(
            &self.tree,
            |k| k.objectid == objid && k.item_type == DIR_INDEX,
            |_, item| {
                if let ItemBody::DirList(list) = item.body {
                    for e in list {
                        let kind = if e.file_type == FT_DIR {
                            FileType::Directory
                        } else if e.file_type == FT_SYMLINK {
                            FileType::Symlink
                        } else {
                            FileType::RegularFile
                        };
                        entries.push((
                            self.ino(ObjID::from(e.location.objectid)),
                            kind,
                            String::from_utf8_lossy(&e.name).into_owned(),
                        ));
                    }
                }
            },
        );

        for (i, (child_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(child_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn read(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, size: u32, _flags: i32, _lock_owner: Option<u64>, reply: ReplyData) {
        let objid = self.objid(ino);
        match self.read_file(objid, offset as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                log::warn!("read ino={} offset={} size={}: {}", ino, offset, size, e);
                reply.error(libc::EIO);
            }
        }
    }
}
