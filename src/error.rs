//! Structured error types.
//!
//! Mirrors the layering in `pegasusheavy-btrf-mount-windows/src/core/mod.rs`:
//! one `thiserror` enum per subsystem, all convertible into the crate-wide
//! [`RecoverError`]. The thin CLI boundary converts that into `anyhow::Error`
//! the way the teacher's `main.rs` already does by returning
//! `anyhow::Result<()>` from `main`.

use thiserror::Error;

use crate::addr::{DeviceID, LogicalAddr};

/// Errors raised while decoding or validating a single on-disk node.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("not a node: magic or filesystem UUID mismatch at {0:?}")]
    NotANode(LogicalAddr),

    #[error("bad checksum at {addr:?}: expected {expected}, computed {actual}")]
    BadChecksum {
        addr: LogicalAddr,
        expected: String,
        actual: String,
    },

    #[error("node expectation failed: {field} expected {expected}, got {actual}")]
    Expectation {
        field: &'static str,
        expected: String,
        actual: String,
    },

    #[error("unknown file extent type {0}")]
    UnknownFileExtentType(u8),

    #[error("truncated checksum item: {have} bytes remain, checksum size is {need}")]
    TruncatedChecksum { have: usize, need: usize },

    #[error("short read of node at {addr:?}: wanted {want}, got {got}")]
    ShortRead {
        addr: LogicalAddr,
        want: usize,
        got: usize,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised by the volume mapper (§4.1).
#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("logical address {0:?} is not covered by any chunk mapping")]
    UnmappedLogical(LogicalAddr),

    #[error("unknown device {0:?}")]
    UnknownDevice(DeviceID),

    #[error("stripes of mapping covering {laddr:?} disagree over {len} bytes")]
    StripeMismatch { laddr: LogicalAddr, len: u64 },

    #[error("mapping [{new_start:?}, +{new_len}) conflicts with existing mapping [{with_start:?}, +{with_len})")]
    MappingConflict {
        new_start: LogicalAddr,
        new_len: u64,
        with_start: LogicalAddr,
        with_len: u64,
    },
}

/// Errors raised while synthesizing or reading the rebuilt forest (§4.6).
#[derive(Error, Debug)]
pub enum ForestError {
    #[error("no such tree: {0}")]
    NoTree(u64),

    #[error("parent-uuid loop while resolving tree roots: {chain:?}")]
    TreeRootLoop { chain: Vec<u64> },

    #[error("failed to rebuild parent tree: {0}")]
    ParentLookup(u64),

    #[error("no item matches the search predicate")]
    NoItem,

    #[error("operation canceled")]
    Canceled,

    #[error("{0}")]
    Cached(String),
}

/// Errors raised by graph construction and its final consistency check (§4.5).
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("cycle detected in node graph: {path:?}")]
    TreeLoop { path: Vec<LogicalAddr> },

    #[error("edge target {addr:?} reads back successfully but was not found by the scan")]
    UnscannedNode { addr: LogicalAddr },
}

/// Errors raised computing or verifying a fingerprint.
#[derive(Error, Debug)]
pub enum ChecksumError {
    #[error("checksum kind {0:?} is not implemented")]
    Unsupported(crate::fingerprint::ChecksumKind),
}

/// Crate-wide error, aggregating every subsystem error plus the catch-all
/// consistency-check failure from spec.md §7.
#[derive(Error, Debug)]
pub enum RecoverError {
    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error(transparent)]
    Forest(#[from] ForestError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Checksum(#[from] ChecksumError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("corrupt {subsystem}: {details}")]
    Corrupt {
        subsystem: &'static str,
        details: String,
    },

    #[error("operation canceled")]
    Canceled,
}

pub type Result<T> = std::result::Result<T, RecoverError>;
