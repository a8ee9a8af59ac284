#![forbid(unsafe_code)]
//! File-metadata boundary behavior: empty metadata, the 2048-byte
//! extended-metadata ceiling, and encodings that would fill a whole
//! block (which must be refused, since user bytes start after the
//! metadata inside block 0).

use pfs_core::stream::{read_stream, write_stream, NullDataSink, RandomDataSource};
use pfs_core::{FsOptions, Filesystem, PfsError};
use std::path::Path;

fn open_fs(dir: &Path) -> Filesystem {
    Filesystem::open(FsOptions {
        group_num: 4,
        blocks_in_group: 8192,
        root: dir.to_path_buf(),
        pattern: None,
        tpl: None,
        shard_id: 3,
        enable_big_alloc: false,
    })
    .expect("open filesystem")
}

#[test]
fn empty_name_and_meta_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut fs = open_fs(dir.path());

    let mut source = RandomDataSource::new(512, 3000, true, true);
    let (key, _, crc_w, vf) = write_stream(&mut fs, &mut source, "", &[]).unwrap();
    // Two empty length prefixes pad up to one 16-byte unit.
    assert_eq!(vf.inode.meta_size, 16);

    let mut sink = NullDataSink::new(true);
    let (read, crc_r, _) = read_stream(&mut fs, &key, &mut sink, 512).unwrap();
    assert_eq!(read, 3000);
    assert_eq!(crc_w, crc_r);
    assert_eq!(sink.name, "");
    assert!(sink.meta.is_empty());
}

#[test]
fn ext_meta_at_the_limit_is_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let mut fs = open_fs(dir.path());

    let meta = vec![0x5Au8; 2048];
    let (mut vf, key) = fs.create_file("limit.bin", &meta).unwrap();
    vf.write(&mut fs, b"payload").unwrap();

    let vf2 = fs.open_file(&key).unwrap();
    assert_eq!(vf2.meta.ext, meta);
}

#[test]
fn ext_meta_over_the_limit_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut fs = open_fs(dir.path());

    let meta = vec![0u8; 2049];
    assert!(matches!(
        fs.create_file("over.bin", &meta),
        Err(PfsError::MetaOverlimit { .. })
    ));
}

#[test]
fn meta_filling_a_whole_block_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut fs = open_fs(dir.path());

    // 8 bytes of length prefixes + 6136 name + 2048 ext encode to
    // exactly one 8192-byte block, which leaves no room for data.
    let name = "n".repeat(6136);
    let ext = vec![1u8; 2048];
    assert!(matches!(
        fs.create_file(&name, &ext),
        Err(PfsError::MetaOverlimit { .. })
    ));

    // Sixteen bytes shorter fits.
    let name = "n".repeat(6120);
    let (_, key) = fs.create_file(&name, &ext).unwrap();
    assert_eq!(fs.open_file(&key).unwrap().meta.name.len(), 6120);
}

#[test]
fn shard_id_is_embedded_in_uids() {
    let dir = tempfile::tempdir().unwrap();
    let mut fs = open_fs(dir.path());

    let (_, key) = fs.create_file("sharded", &[]).unwrap();
    assert_eq!(key.len(), 28);
    assert_eq!(&key[0..4], "0003");
}
