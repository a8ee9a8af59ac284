#![forbid(unsafe_code)]
//! Error types for PackFS.
//!
//! Defines `PfsError` and a `Result<T>` alias used throughout the
//! workspace. All operations surface errors to the caller; none of them
//! abort the process on bad external input.

use thiserror::Error;

/// Unified error type for all PackFS operations.
#[derive(Debug, Error)]
pub enum PfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad superblock: {0}")]
    BadSuperblock(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("bad group id {0}")]
    BadGroupId(u32),

    #[error("bad file uid")]
    BadUid,

    #[error("file not found")]
    FileNotFound,

    #[error("file metadata over limit: {size} bytes (max {limit})")]
    MetaOverlimit { size: usize, limit: usize },

    #[error("not enough free blocks: need {needed}, have {free}")]
    NotEnoughFreeBlocks { needed: u64, free: u64 },

    #[error("no free inodes")]
    NoFreeInodes,

    #[error("file exceeds addressable capacity")]
    CapacityExceeded,

    #[error("bad offset {offset} in region of {limit} bytes")]
    BadOffset { offset: usize, limit: usize },

    #[error("corrupt filesystem state: {0}")]
    Corrupt(String),
}

/// Result alias using `PfsError`.
pub type Result<T> = std::result::Result<T, PfsError>;
