#![forbid(unsafe_code)]
//! PackFS core: the filesystem facade and the Vfile stream.
//!
//! A [`Filesystem`] owns the volume set, every group's bitmaps, the
//! indirect-pointer cache, and the rotating allocation cursor. It is a
//! single exclusive owner: all state lives behind the handle and every
//! operation takes it explicitly. The core is single-threaded
//! cooperative; callers needing concurrency must serialize mutating
//! calls through one owner.
//!
//! A [`Vfile`] is a read/write cursor over the data addressed by one
//! inode. Files are named by opaque 28-hex UIDs that die with the inode
//! generation they were minted for.

mod cache;
mod fs;
pub mod stream;
mod vfile;

pub use cache::PointerCache;
pub use fs::{BlockGroup, FileSnap, FsOptions, Filesystem};
pub use vfile::{Vfile, VfileOffset};

pub use pfs_error::{PfsError, Result};
pub use pfs_ondisk::{FileKey, FileMeta, Inode, Superblock};
pub use pfs_types::EntAddr;
pub use pfs_volume::Volume;
