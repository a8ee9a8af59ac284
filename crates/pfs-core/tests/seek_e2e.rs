#![forbid(unsafe_code)]
//! Seek behavior: `seek_pos` must land on exactly the state a plain
//! sequential read reaches, rewrites must splice bytes without moving
//! the file end, and seeking at the end of file must read back as EOF.

use pfs_core::stream::{write_stream, RandomDataSource};
use pfs_core::{FsOptions, Filesystem, Vfile};
use std::path::Path;

const BLOCK: u64 = 8192;

fn open_fs(dir: &Path) -> Filesystem {
    Filesystem::open(FsOptions {
        group_num: 8,
        blocks_in_group: 8192,
        root: dir.to_path_buf(),
        pattern: None,
        tpl: None,
        shard_id: 0,
        enable_big_alloc: true,
    })
    .expect("open filesystem")
}

/// Write a random file, read forward to `pos`, and require `seek_pos`
/// to reproduce the reader's cursor exactly.
fn check_seek_matches_read(fs: &mut Filesystem, total_size: u64, batch: usize, pos: u64) {
    let mut source = RandomDataSource::new(batch, total_size, true, false);
    let (key, _, _, _) = write_stream(fs, &mut source, "test.io", &[0u8; 10]).unwrap();

    let mut vf = fs.open_file(&key).unwrap();
    let pos = pos.min(vf.inode.file_size);
    let mut data = vec![0u8; batch];
    let mut offset = 0u64;
    while offset < pos {
        let want = batch.min((pos - offset) as usize);
        let read = vf.read(fs, &mut data[..want]).unwrap();
        assert!(read > 0, "read stalled at {offset} of {pos}");
        offset += read as u64;
    }

    let by_read = vf.offset();
    let by_seek = vf.seek_pos(fs, pos).unwrap();
    assert_eq!(
        by_read, by_seek,
        "cursor mismatch: size {total_size}, pos {pos}"
    );
}

#[test]
fn seek_matches_sequential_read() {
    let dir = tempfile::tempdir().unwrap();
    let mut fs = open_fs(dir.path());

    let cases: &[(u64, usize, u64)] = &[
        (4, 1024, 4),
        (4, 1024, 3),
        (256, 1024, 256),
        (256, 1024, 250),
        (4000, 1024, 400),
        (4000, 1024, 4000),
        (4090, 1024, 4080),
        (BLOCK, 1024, BLOCK),
        (BLOCK, 2048, BLOCK - 2),
        (BLOCK, 8192, 9000),
        (BLOCK + 1, 8192, 0),
        (BLOCK + 1, 8192, BLOCK),
        (BLOCK + 1, 8192, BLOCK + 1),
        (BLOCK * 2 - 32, 8192, BLOCK * 2 - 32),
        (BLOCK * 28 + 100, 8000, BLOCK * 28),
        (BLOCK * 29 + 200, 3000, 81_900),
        (BLOCK * 18, 8192 * 64, 9000),
        (BLOCK * 180, 8192 * 64, BLOCK * 180 - 1),
        (BLOCK * 500, 8192 * 100, BLOCK * 499 + 1),
        (BLOCK * 500 - 32, 8192 * 100, BLOCK * 500 - 32),
        (BLOCK * 500 + 50, 8192 * 100, BLOCK * 500),
        (BLOCK * 500 + 50, 5000, BLOCK * 500 + 50),
    ];
    for &(size, batch, pos) in cases {
        check_seek_matches_read(&mut fs, size, batch, pos);
    }
}

/// Create a file holding the byte pattern `i % 256`.
fn init_patterned_file(fs: &mut Filesystem, file_size: u64) -> (Vfile, String) {
    let (mut vf, key) = fs.create_file("test.io", &[0u8; 10]).unwrap();
    let buffer: Vec<u8> = (0..file_size).map(|i| (i % 256) as u8).collect();
    let written = vf.write(fs, &buffer).unwrap();
    assert_eq!(written as u64, file_size);
    (vf, key)
}

/// Seek to `pos`, overwrite with a shifted pattern, and verify the
/// spliced image byte for byte.
fn check_seek_and_rewrite(fs: &mut Filesystem, file_size: u64, pos: u64, write_len: u64) {
    let (mut vf, key) = init_patterned_file(fs, file_size);

    vf.seek_pos(fs, pos).unwrap();
    let patch: Vec<u8> = (0..write_len).map(|i| ((i % 256) as u8).wrapping_add(20)).collect();
    let written = vf.write(fs, &patch).unwrap();
    assert_eq!(written as u64, write_len);

    let expected_size = file_size.max(pos + write_len);
    let mut vf2 = fs.open_file(&key).unwrap();
    assert_eq!(vf2.inode.file_size, expected_size);
    let mut image = vec![0u8; expected_size as usize];
    let mut offset = 0usize;
    while offset < image.len() {
        let read = vf2.read(fs, &mut image[offset..]).unwrap();
        assert!(read > 0, "read stalled at {offset}");
        offset += read;
    }
    for (i, &byte) in image.iter().enumerate() {
        let expected = if (i as u64) < pos || (i as u64) >= pos + write_len {
            (i % 256) as u8
        } else {
            (((i as u64 - pos) % 256) as u8).wrapping_add(20)
        };
        assert_eq!(
            byte, expected,
            "byte {i} wrong: size {file_size}, pos {pos}, len {write_len}"
        );
    }
}

#[test]
fn seek_and_rewrite_splices_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let mut fs = open_fs(dir.path());

    let cases: &[(u64, u64, u64)] = &[
        (BLOCK, 1024, BLOCK),
        (BLOCK, 1024, 5000),
        (BLOCK * 20, BLOCK * 10, BLOCK * 50 + 10),
        (BLOCK * 2 - 32, BLOCK - 32, 5000),
        (BLOCK * 500 - 32, BLOCK * 200 - 32, BLOCK * 500),
    ];
    for &(size, pos, len) in cases {
        check_seek_and_rewrite(&mut fs, size, pos, len);
    }
}

#[test]
fn overwrite_inside_the_file_keeps_its_size() {
    let dir = tempfile::tempdir().unwrap();
    let mut fs = open_fs(dir.path());

    let (mut vf, key) = init_patterned_file(&mut fs, BLOCK);
    vf.seek_pos(&mut fs, 1024).unwrap();
    let patch = vec![7u8; 5000];
    vf.write(&mut fs, &patch).unwrap();
    assert_eq!(vf.inode.file_size, BLOCK);

    let vf2 = fs.open_file(&key).unwrap();
    assert_eq!(vf2.inode.file_size, BLOCK);
}

#[test]
fn seek_lands_on_block_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let mut fs = open_fs(dir.path());

    // Metadata is 32 bytes, so this size ends exactly on block 2's edge.
    let size = BLOCK * 2 - 32;
    let (mut vf, _) = init_patterned_file(&mut fs, size);
    let offset = vf.seek_pos(&mut fs, size).unwrap();
    assert_eq!(offset.block_index(), 2);
    assert_eq!(offset.position(), size);
}

#[test]
fn reads_at_end_of_file_return_zero() {
    let dir = tempfile::tempdir().unwrap();
    let mut fs = open_fs(dir.path());

    let (mut vf, _) = init_patterned_file(&mut fs, 4000);
    for _ in 0..3 {
        vf.seek_pos(&mut fs, u64::MAX).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(vf.read(&mut fs, &mut buf).unwrap(), 0);
    }
}

#[test]
fn saved_offset_resumes_the_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let mut fs = open_fs(dir.path());

    let (mut vf, _) = init_patterned_file(&mut fs, BLOCK * 3);
    let mut first = vec![0u8; 10_000];
    read_fully(&mut vf, &mut fs, &mut first);
    let saved = vf.offset();

    let mut tail_a = vec![0u8; 5000];
    read_fully(&mut vf, &mut fs, &mut tail_a);

    vf.seek(saved);
    let mut tail_b = vec![0u8; 5000];
    read_fully(&mut vf, &mut fs, &mut tail_b);
    assert_eq!(tail_a, tail_b);
}

fn read_fully(vf: &mut Vfile, fs: &mut Filesystem, buf: &mut [u8]) {
    let mut offset = 0usize;
    while offset < buf.len() {
        let read = vf.read(fs, &mut buf[offset..]).unwrap();
        assert!(read > 0);
        offset += read;
    }
}
