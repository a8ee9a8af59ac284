#![forbid(unsafe_code)]
//! Volume management for PackFS.
//!
//! Each block group is backed by exactly one file laid out as
//! `superblock | group descriptor | inode bitmap | block bitmap | inode
//! table | data blocks`. Section offsets are derived from the superblock
//! and are identical in every group's file. Volume files are lazy: a
//! group's file is created the first time a block or inode in it is
//! touched.
//!
//! All file access is positional (`pread`/`pwrite` via
//! `std::os::unix::fs::FileExt`); no shared file offset is relied upon.

use pfs_error::{PfsError, Result};
use pfs_ondisk::{GroupDescriptor, Inode, Superblock};
use regex::Regex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info};

pub const DEFAULT_VOLUME_PATTERN: &str = r"^vol\.\d{6}$";
pub const DEFAULT_VOLUME_TEMPLATE: &str = "vol.%06d";

// ── Section layout ──────────────────────────────────────────────────────────

/// Byte offsets of the sections inside every group's backing file.
///
/// Derived from the superblock once per filesystem instance; there is no
/// process-wide layout state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub inode_bitmap_offset: u64,
    pub block_bitmap_offset: u64,
    pub inode_offset: u64,
    pub block_offset: u64,
    /// Entity addresses held by one pointer page (`block_size / 4`).
    pub block_pointers: usize,
    /// Inode bitmap length in bytes.
    pub inode_bitmap_len: usize,
    /// Block bitmap length in bytes.
    pub block_bitmap_len: usize,
}

impl Layout {
    #[must_use]
    pub fn from_superblock(sb: &Superblock) -> Self {
        let inode_bitmap_offset = (Superblock::ENCODED_LEN + GroupDescriptor::ENCODED_LEN) as u64;
        let inode_bitmap_len = (sb.inodes_per_group() / 8) as usize;
        let block_bitmap_len = (sb.blocks_in_group / 8) as usize;
        let block_bitmap_offset = inode_bitmap_offset + inode_bitmap_len as u64;
        let inode_offset = block_bitmap_offset + block_bitmap_len as u64;
        let inode_table_len = Inode::ENCODED_LEN as u64 * u64::from(sb.inodes_per_group());
        let block_offset = inode_offset + inode_table_len;
        Self {
            inode_bitmap_offset,
            block_bitmap_offset,
            inode_offset,
            block_offset,
            block_pointers: (sb.block_size / 4) as usize,
            inode_bitmap_len,
            block_bitmap_len,
        }
    }
}

// ── Volumes ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VolumeState {
    /// Backing file does not exist yet.
    Absent,
    /// Backing file exists on disk.
    Ready,
}

/// One group's backing file.
#[derive(Debug)]
pub struct Volume {
    /// 1-based group id this volume backs.
    pub id: u32,
    pub file_name: String,
    state: VolumeState,
    file: Option<File>,
}

impl Volume {
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == VolumeState::Ready
    }

    /// Current byte length of the backing file, or 0 if absent.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.file
            .as_ref()
            .and_then(|f| f.metadata().ok())
            .map_or(0, |m| m.len())
    }
}

/// Bitmap contents loaded from an existing volume file.
#[derive(Debug, Clone)]
pub struct GroupImage {
    pub group_id: u32,
    pub inode_bitmap: Vec<u8>,
    pub block_bitmap: Vec<u8>,
}

/// The set of backing files for every block group.
#[derive(Debug)]
pub struct VolumeSet {
    root: PathBuf,
    tpl: String,
    pub smeta: Superblock,
    pub layout: Layout,
    volumes: Vec<Volume>,
}

impl VolumeSet {
    /// Scan `root` for volume files and assemble the set.
    ///
    /// The first file whose superblock verifies becomes authoritative and
    /// overrides `default_smeta`; every other candidate must carry the
    /// same CRC or the whole set is rejected. Groups without a file stay
    /// unmaterialized until first touched.
    pub fn open(
        root: impl AsRef<Path>,
        pattern: &str,
        tpl: &str,
        default_smeta: Superblock,
    ) -> Result<(Self, Vec<GroupImage>)> {
        let root = root.as_ref().to_path_buf();
        let pattern = Regex::new(pattern)
            .map_err(|e| PfsError::Config(format!("bad volume pattern: {e}")))?;

        let mut candidates = Vec::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_file() && pattern.is_match(&name) {
                candidates.push(name);
            }
        }
        candidates.sort();

        let smeta = Self::elect_superblock(&root, &candidates, default_smeta)?;
        let layout = Layout::from_superblock(&smeta);

        let mut volumes = Vec::with_capacity(smeta.total_groups as usize);
        for id in 1..=smeta.total_groups {
            volumes.push(Volume {
                id,
                file_name: format_volume_name(tpl, id),
                state: VolumeState::Absent,
                file: None,
            });
        }

        let mut set = Self {
            root,
            tpl: tpl.to_owned(),
            smeta,
            layout,
            volumes,
        };

        let start = Instant::now();
        let mut images = Vec::new();
        for name in &candidates {
            images.push(set.load_volume(name)?);
        }
        if !candidates.is_empty() {
            info!(
                volumes = candidates.len(),
                elapsed = ?start.elapsed(),
                "loaded volume files"
            );
        }
        Ok((set, images))
    }

    /// Find the authoritative superblock among the candidate files.
    fn elect_superblock(
        root: &Path,
        candidates: &[String],
        default_smeta: Superblock,
    ) -> Result<Superblock> {
        if candidates.is_empty() {
            return Ok(default_smeta);
        }
        for name in candidates {
            let file = File::open(root.join(name))?;
            let mut buf = [0u8; Superblock::ENCODED_LEN];
            if file.read_exact_at(&mut buf, 0).is_err() {
                continue;
            }
            let Ok(smeta) = Superblock::decode(&buf) else {
                continue;
            };
            match smeta.verify() {
                Ok(()) => return Ok(smeta),
                Err(e) => error!(file = %name, error = %e, "superblock failed verification"),
            }
        }
        Err(PfsError::BadSuperblock(
            "no candidate file carries a valid superblock".to_owned(),
        ))
    }

    /// Load one existing volume file: verify its superblock agrees with
    /// the authoritative one, then pull the descriptor and both bitmaps.
    fn load_volume(&mut self, name: &str) -> Result<GroupImage> {
        let path = self.root.join(name);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut sb_buf = [0u8; Superblock::ENCODED_LEN];
        file.read_exact_at(&mut sb_buf, 0)?;
        let smeta = Superblock::decode(&sb_buf)
            .map_err(|e| PfsError::BadSuperblock(e.to_string()))?;
        if smeta.crc != self.smeta.crc {
            error!(file = %name, "superblock disagrees with the authoritative one");
            return Err(PfsError::BadSuperblock(format!(
                "volume file {name} carries a foreign superblock"
            )));
        }

        let mut desc_buf = [0u8; GroupDescriptor::ENCODED_LEN];
        file.read_exact_at(&mut desc_buf, Superblock::ENCODED_LEN as u64)?;
        let desc = GroupDescriptor::decode(&desc_buf)
            .map_err(|e| PfsError::BadSuperblock(e.to_string()))?;
        if desc.group_id == 0 || desc.group_id > self.smeta.total_groups {
            return Err(PfsError::BadGroupId(desc.group_id));
        }

        let mut inode_bitmap = vec![0u8; self.layout.inode_bitmap_len];
        file.read_exact_at(&mut inode_bitmap, self.layout.inode_bitmap_offset)?;
        let mut block_bitmap = vec![0u8; self.layout.block_bitmap_len];
        file.read_exact_at(&mut block_bitmap, self.layout.block_bitmap_offset)?;

        debug!(
            group = desc.group_id,
            file = %name,
            "loaded group file"
        );

        let vol = &mut self.volumes[(desc.group_id - 1) as usize];
        vol.file_name = name.to_owned();
        vol.state = VolumeState::Ready;
        vol.file = Some(file);

        Ok(GroupImage {
            group_id: desc.group_id,
            inode_bitmap,
            block_bitmap,
        })
    }

    /// Ensure group `idx` (0-based) has an open backing file, creating
    /// and formatting it on first touch.
    ///
    /// `inode_bitmap` and `block_bitmap` are the group's current in-memory
    /// bitmap bytes, written out verbatim when the file is materialized.
    pub fn check_ready(
        &mut self,
        idx: usize,
        inode_bitmap: &[u8],
        block_bitmap: &[u8],
    ) -> Result<()> {
        let Some(vol) = self.volumes.get_mut(idx) else {
            return Err(PfsError::BadGroupId(idx as u32 + 1));
        };
        match vol.state {
            VolumeState::Absent => {
                let path = self.root.join(&vol.file_name);
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)?;

                self.smeta.sign();
                file.write_all_at(&self.smeta.encode(), 0)?;
                let desc = GroupDescriptor { group_id: vol.id };
                file.write_all_at(&desc.encode(), Superblock::ENCODED_LEN as u64)?;
                file.write_all_at(inode_bitmap, self.layout.inode_bitmap_offset)?;
                file.write_all_at(block_bitmap, self.layout.block_bitmap_offset)?;
                let table = vec![0u8; Inode::ENCODED_LEN * inode_bitmap.len() * 8];
                file.write_all_at(&table, self.layout.inode_offset)?;
                file.sync_all()?;

                debug!(group = vol.id, file = %vol.file_name, "materialized volume file");
                vol.state = VolumeState::Ready;
                vol.file = Some(file);
            }
            VolumeState::Ready => {
                if vol.file.is_none() {
                    let path = self.root.join(&vol.file_name);
                    vol.file = Some(OpenOptions::new().read(true).write(true).open(&path)?);
                }
            }
        }
        Ok(())
    }

    fn file(&self, idx: usize) -> Result<&File> {
        self.volumes
            .get(idx)
            .and_then(|v| v.file.as_ref())
            .ok_or_else(|| {
                PfsError::Corrupt(format!("volume {} accessed before materialization", idx + 1))
            })
    }

    /// Positional read from group `idx`'s backing file.
    pub fn read_exact_at(&self, idx: usize, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file(idx)?.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Positional write to group `idx`'s backing file.
    pub fn write_all_at(&self, idx: usize, offset: u64, buf: &[u8]) -> Result<()> {
        self.file(idx)?.write_all_at(buf, offset)?;
        Ok(())
    }

    /// Flush group `idx`'s backing file to stable storage.
    pub fn sync(&self, idx: usize) -> Result<()> {
        self.file(idx)?.sync_all()?;
        Ok(())
    }

    #[must_use]
    pub fn volume(&self, idx: usize) -> Option<&Volume> {
        self.volumes.get(idx)
    }

    #[must_use]
    pub fn is_ready(&self, idx: usize) -> bool {
        self.volumes.get(idx).is_some_and(Volume::is_ready)
    }

    #[must_use]
    pub fn template(&self) -> &str {
        &self.tpl
    }
}

/// Expand a `printf`-style `%0Nd` (or `%d`) volume name template.
#[must_use]
pub fn format_volume_name(tpl: &str, id: u32) -> String {
    if let Some(start) = tpl.find('%') {
        let rest = &tpl[start + 1..];
        if let Some(dpos) = rest.find('d') {
            let spec = &rest[..dpos];
            let width = if spec.is_empty() {
                Some(0)
            } else if let Some(stripped) = spec.strip_prefix('0') {
                stripped.parse::<usize>().ok()
            } else {
                None
            };
            if let Some(width) = width {
                return format!(
                    "{}{:0width$}{}",
                    &tpl[..start],
                    id,
                    &rest[dpos + 1..],
                    width = width
                );
            }
        }
    }
    format!("{tpl}{id}")
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn small_superblock() -> Superblock {
        let mut sb = Superblock {
            block_size: 8192,
            total_groups: 4,
            blocks_in_group: 1024,
            inodes_ratio: 4,
            shard_id: 0,
            attr: 0,
            magic: 0,
            crc: 0,
        };
        sb.sign();
        sb
    }

    #[test]
    fn layout_offsets() {
        let sb = small_superblock();
        let layout = Layout::from_superblock(&sb);
        // 256 inodes per group -> 32 bitmap bytes; 1024 blocks -> 128.
        assert_eq!(layout.inode_bitmap_offset, 36);
        assert_eq!(layout.block_bitmap_offset, 36 + 32);
        assert_eq!(layout.inode_offset, 36 + 32 + 128);
        assert_eq!(layout.block_offset, 196 + 112 * 256);
        assert_eq!(layout.block_pointers, 2048);
        assert_eq!(layout.inode_bitmap_len, 32);
        assert_eq!(layout.block_bitmap_len, 128);
    }

    #[test]
    fn volume_name_formatting() {
        assert_eq!(format_volume_name("vol.%06d", 3), "vol.000003");
        assert_eq!(format_volume_name("vol.%06d", 123_456), "vol.123456");
        assert_eq!(format_volume_name("data-%d.bin", 7), "data-7.bin");
        assert_eq!(format_volume_name("plain", 2), "plain2");
    }

    #[test]
    fn open_empty_root_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let sb = small_superblock();
        let (set, images) = VolumeSet::open(
            dir.path(),
            DEFAULT_VOLUME_PATTERN,
            DEFAULT_VOLUME_TEMPLATE,
            sb,
        )
        .unwrap();
        assert!(images.is_empty());
        assert_eq!(set.smeta, sb);
        assert!(!set.is_ready(0));
        assert_eq!(set.volume(0).unwrap().file_name, "vol.000001");
    }

    #[test]
    fn check_ready_materializes_and_formats() {
        let dir = tempfile::tempdir().unwrap();
        let sb = small_superblock();
        let (mut set, _) = VolumeSet::open(
            dir.path(),
            DEFAULT_VOLUME_PATTERN,
            DEFAULT_VOLUME_TEMPLATE,
            sb,
        )
        .unwrap();

        let mut inode_bm = vec![0u8; set.layout.inode_bitmap_len];
        inode_bm[0] = 0b0000_0011;
        let block_bm = vec![0u8; set.layout.block_bitmap_len];
        set.check_ready(1, &inode_bm, &block_bm).unwrap();
        assert!(set.is_ready(1));

        let path = dir.path().join("vol.000002");
        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, set.layout.block_offset);

        let raw = std::fs::read(&path).unwrap();
        let stored = Superblock::decode(&raw).unwrap();
        stored.verify().unwrap();
        let desc = GroupDescriptor::decode(&raw[32..]).unwrap();
        assert_eq!(desc.group_id, 2);
        assert_eq!(raw[set.layout.inode_bitmap_offset as usize], 0b0000_0011);
    }

    #[test]
    fn reopen_loads_persisted_bitmaps() {
        let dir = tempfile::tempdir().unwrap();
        let sb = small_superblock();
        let (mut set, _) = VolumeSet::open(
            dir.path(),
            DEFAULT_VOLUME_PATTERN,
            DEFAULT_VOLUME_TEMPLATE,
            sb,
        )
        .unwrap();

        let mut inode_bm = vec![0u8; set.layout.inode_bitmap_len];
        inode_bm[3] = 0xF0;
        let mut block_bm = vec![0u8; set.layout.block_bitmap_len];
        block_bm[10] = 0xAA;
        set.check_ready(0, &inode_bm, &block_bm).unwrap();
        drop(set);

        let (set2, images) = VolumeSet::open(
            dir.path(),
            DEFAULT_VOLUME_PATTERN,
            DEFAULT_VOLUME_TEMPLATE,
            small_superblock(),
        )
        .unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].group_id, 1);
        assert_eq!(images[0].inode_bitmap, inode_bm);
        assert_eq!(images[0].block_bitmap, block_bm);
        assert!(set2.is_ready(0));
    }

    #[test]
    fn foreign_superblock_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sb = small_superblock();
        let (mut set, _) = VolumeSet::open(
            dir.path(),
            DEFAULT_VOLUME_PATTERN,
            DEFAULT_VOLUME_TEMPLATE,
            sb,
        )
        .unwrap();
        let bm_i = vec![0u8; set.layout.inode_bitmap_len];
        let bm_b = vec![0u8; set.layout.block_bitmap_len];
        set.check_ready(0, &bm_i, &bm_b).unwrap();
        drop(set);

        // A second volume written with different geometry cannot coexist.
        let mut other = Superblock {
            blocks_in_group: 2048,
            ..small_superblock()
        };
        other.sign();
        let mut raw = vec![0u8; 64];
        raw[..32].copy_from_slice(&other.encode());
        std::fs::write(dir.path().join("vol.000002"), &raw).unwrap();

        let result = VolumeSet::open(
            dir.path(),
            DEFAULT_VOLUME_PATTERN,
            DEFAULT_VOLUME_TEMPLATE,
            small_superblock(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn positional_io_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sb = small_superblock();
        let (mut set, _) = VolumeSet::open(
            dir.path(),
            DEFAULT_VOLUME_PATTERN,
            DEFAULT_VOLUME_TEMPLATE,
            sb,
        )
        .unwrap();
        let bm_i = vec![0u8; set.layout.inode_bitmap_len];
        let bm_b = vec![0u8; set.layout.block_bitmap_len];
        set.check_ready(0, &bm_i, &bm_b).unwrap();

        let payload = b"positional payload";
        let offset = set.layout.block_offset + 512;
        set.write_all_at(0, offset, payload).unwrap();
        let mut back = vec![0u8; payload.len()];
        set.read_exact_at(0, offset, &mut back).unwrap();
        assert_eq!(&back, payload);
    }

    #[test]
    fn io_on_unmaterialized_volume_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (set, _) = VolumeSet::open(
            dir.path(),
            DEFAULT_VOLUME_PATTERN,
            DEFAULT_VOLUME_TEMPLATE,
            small_superblock(),
        )
        .unwrap();
        let mut buf = [0u8; 4];
        assert!(set.read_exact_at(0, 0, &mut buf).is_err());
    }
}
