#![forbid(unsafe_code)]
//! Delete must be the exact reverse of creation: after removing a file,
//! the free block and inode counts return to their values before it was
//! written, stale UIDs stop resolving, and slot reuse invalidates the
//! previous generation's identifier.

use pfs_core::stream::{write_stream, RandomDataSource};
use pfs_core::{FsOptions, Filesystem, PfsError};
use std::path::Path;

const BLOCK: u64 = 8192;

fn open_fs(dir: &Path, big_alloc: bool) -> Filesystem {
    Filesystem::open(FsOptions {
        group_num: 8,
        blocks_in_group: 8192,
        root: dir.to_path_buf(),
        pattern: None,
        tpl: None,
        shard_id: 0,
        enable_big_alloc: big_alloc,
    })
    .expect("open filesystem")
}

fn write_then_delete(fs: &mut Filesystem, total_size: u64, batch: usize) {
    let (_, free_blocks_before) = fs.stat_blocks(None);
    let (_, free_inodes_before) = fs.stat_inodes(None);

    let mut source = RandomDataSource::new(batch, total_size, true, false);
    let (key, written, _, _) = write_stream(fs, &mut source, "victim.bin", &[]).unwrap();
    assert_eq!(written, total_size);

    fs.delete_file(&key).unwrap();

    let (_, free_blocks_after) = fs.stat_blocks(None);
    let (_, free_inodes_after) = fs.stat_inodes(None);
    assert_eq!(
        free_blocks_before, free_blocks_after,
        "blocks leaked for size {total_size}"
    );
    assert_eq!(
        free_inodes_before, free_inodes_after,
        "inodes leaked for size {total_size}"
    );
}

#[test]
fn delete_restores_counts_across_file_shapes() {
    let dir = tempfile::tempdir().unwrap();
    let mut fs = open_fs(dir.path(), true);

    let cases: &[(u64, usize)] = &[
        (4, 1024),
        (4000, 1024),
        (BLOCK, 1000),
        (BLOCK, 8192),
        (BLOCK + 1, 8192),
        (9000, 1024),
        (BLOCK * 8, 4096),
        (BLOCK * 28 + 100, 8000),
        (BLOCK * 18, 8192 * 64),
        (BLOCK * 180, 8192 * 64),
        (BLOCK * 500, 8192 * 100),
        (BLOCK * 500 + 50, 5000),
    ];
    for &(size, batch) in cases {
        write_then_delete(&mut fs, size, batch);
    }
}

#[test]
fn delete_restores_counts_without_big_alloc() {
    let dir = tempfile::tempdir().unwrap();
    let mut fs = open_fs(dir.path(), false);

    for &(size, batch) in &[
        (BLOCK * 18, 8192usize),
        (BLOCK * 500, 8192 * 64),
        // Deep enough to thread a double-indirect subtree.
        (BLOCK * 2100, 64 * 1024),
    ] {
        write_then_delete(&mut fs, size, batch);
    }
}

#[test]
fn deleted_uid_stops_resolving() {
    let dir = tempfile::tempdir().unwrap();
    let mut fs = open_fs(dir.path(), true);

    let mut source = RandomDataSource::new(1024, 4000, true, false);
    let (key, _, _, _) = write_stream(&mut fs, &mut source, "gone.bin", &[]).unwrap();
    fs.delete_file(&key).unwrap();

    assert!(matches!(fs.open_file(&key), Err(PfsError::FileNotFound)));
    assert!(matches!(fs.delete_file(&key), Err(PfsError::FileNotFound)));
}

#[test]
fn slot_reuse_invalidates_the_old_uid() {
    let dir = tempfile::tempdir().unwrap();
    let mut fs = open_fs(dir.path(), true);

    let mut source = RandomDataSource::new(1024, 4000, true, false);
    let (old_key, _, _, _) = write_stream(&mut fs, &mut source, "first.bin", &[]).unwrap();
    fs.delete_file(&old_key).unwrap();

    // The slot comes back with a bumped sequence number.
    let mut source = RandomDataSource::new(1024, 4000, true, false);
    let (new_key, _, _, _) = write_stream(&mut fs, &mut source, "second.bin", &[]).unwrap();
    assert_ne!(old_key, new_key);
    assert!(matches!(fs.open_file(&old_key), Err(PfsError::FileNotFound)));
    assert_eq!(fs.open_file(&new_key).unwrap().meta.name, "second.bin");
}

#[test]
fn malformed_uids_are_rejected_without_panicking() {
    let dir = tempfile::tempdir().unwrap();
    let mut fs = open_fs(dir.path(), true);

    for uid in [
        "",
        "short",
        "zzzzzzzzzzzzzzzzzzzzzzzzzzzz",
        "00a70010000f0000002a654321ff00",
    ] {
        assert!(matches!(fs.open_file(uid), Err(PfsError::BadUid)));
        assert!(matches!(fs.delete_file(uid), Err(PfsError::BadUid)));
    }

    // Well-formed but naming a slot far outside the inode bitmap.
    let phantom = "0000001fffff0000002a654321ff";
    assert!(matches!(fs.open_file(phantom), Err(PfsError::FileNotFound)));
}
