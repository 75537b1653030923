//! Read-only recovery engine for damaged BTRFS-family filesystem images.
//!
//! Modules are ordered leaf-first, matching the dependency order laid out
//! in SPEC_FULL.md §2: primitives, then device I/O, then the superblock and
//! volume layers, then the node/item decoders, then the scanners and
//! reconstruction passes, then the rebuilt forest built on top of all of it.

pub mod addr;
pub mod binstruct;
pub mod error;
pub mod fingerprint;
pub mod structures;
pub mod uuid;

pub mod device;
pub mod superblock;
pub mod volume;

pub mod items;
pub mod node;

pub mod scanner;

pub mod reconstruct;

pub mod graph;

pub mod forest;

pub mod json;

#[cfg(feature = "mount")]
pub mod mount;

pub use error::{RecoverError, Result};
