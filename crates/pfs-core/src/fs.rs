//! The filesystem facade.
//!
//! Owns the superblock, the per-group bitmaps, the volume set, the
//! indirect-pointer cache, and the rotating current-group cursor. The
//! cursor is a locality hint, not a correctness requirement: successive
//! allocations tend to land in the same group until it is exhausted.
//!
//! In-memory bitmap state is updated before the corresponding disk
//! write. On a write failure the bits stay marked used (pessimistic)
//! until restart; there is no automatic rollback and no crash
//! consistency guarantee.

use crate::cache::PointerCache;
use crate::vfile::Vfile;
use pfs_alloc::{merge_spans, Bitmap, WordBitmap};
use pfs_error::{PfsError, Result};
use pfs_ondisk::{
    FileKey, FileMeta, GroupDescriptor, Inode, Superblock, DEFAULT_BLOCKS_IN_GROUP,
    DEFAULT_BLOCK_SIZE, DEFAULT_INODES_RATIO,
};
use pfs_types::{EntAddr, BIG_ALLOC_BLOCKS, DIRECT_BLOCKS, MAX_ENT_INDEX, MAX_FILE_META_SIZE};
use pfs_volume::{Volume, VolumeSet, DEFAULT_VOLUME_PATTERN, DEFAULT_VOLUME_TEMPLATE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info};

/// Construction options for [`Filesystem::open`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsOptions {
    /// Number of block groups, one backing file each (1..=1024).
    pub group_num: u32,
    /// Blocks per group; 0 selects the default of 1,048,576.
    pub blocks_in_group: u32,
    /// Directory holding the backing files.
    pub root: PathBuf,
    /// Regex matching backing files at load; `None` for the default.
    pub pattern: Option<String>,
    /// printf-style template for new backing files; `None` for the default.
    pub tpl: Option<String>,
    /// Shard id embedded into every UID.
    pub shard_id: u16,
    /// Enable atomic 64-block allocation.
    pub enable_big_alloc: bool,
}

impl FsOptions {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            group_num: 32,
            blocks_in_group: 0,
            root: root.into(),
            pattern: None,
            tpl: None,
            shard_id: 0,
            enable_big_alloc: false,
        }
    }
}

/// One block group: descriptor plus its two bitmaps.
#[derive(Debug)]
pub struct BlockGroup {
    pub desc: GroupDescriptor,
    pub inode_bitmap: WordBitmap,
    pub block_bitmap: WordBitmap,
}

/// A point-in-time view of one live file, as reported by listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSnap {
    pub key: String,
    pub inode: u32,
    pub name: String,
    pub meta: Vec<u8>,
    pub size: u64,
    pub ctime: u64,
    pub mtime: u64,
}

/// The embedded object store.
#[derive(Debug)]
pub struct Filesystem {
    smeta: Superblock,
    cur_group: u32,
    groups: Vec<BlockGroup>,
    volumes: VolumeSet,
    ptr_cache: PointerCache,
}

impl Filesystem {
    /// Open (and on first use, format) a store rooted at `opts.root`.
    ///
    /// If volume files already exist there, the authoritative superblock
    /// loaded from them overrides the geometry options.
    pub fn open(opts: FsOptions) -> Result<Self> {
        let blocks_in_group = if opts.blocks_in_group == 0 {
            DEFAULT_BLOCKS_IN_GROUP
        } else {
            opts.blocks_in_group
        };
        let mut smeta = Superblock {
            block_size: DEFAULT_BLOCK_SIZE,
            total_groups: opts.group_num,
            blocks_in_group,
            inodes_ratio: DEFAULT_INODES_RATIO,
            shard_id: opts.shard_id,
            attr: 0,
            magic: 0,
            crc: 0,
        };
        if opts.enable_big_alloc {
            smeta.enable_big_alloc();
        }
        smeta.sign();
        smeta
            .verify()
            .map_err(|e| PfsError::BadSuperblock(e.to_string()))?;
        if smeta.blocks_in_group > MAX_ENT_INDEX + 1 {
            return Err(PfsError::Config(
                "blocks_in_group exceeds the 20-bit entity index space".to_owned(),
            ));
        }

        let pattern = opts.pattern.as_deref().unwrap_or(DEFAULT_VOLUME_PATTERN);
        let tpl = opts.tpl.as_deref().unwrap_or(DEFAULT_VOLUME_TEMPLATE);
        let (volumes, images) = VolumeSet::open(&opts.root, pattern, tpl, smeta)?;
        let smeta = volumes.smeta;
        if smeta.blocks_in_group > MAX_ENT_INDEX + 1 {
            return Err(PfsError::BadSuperblock(
                "on-disk blocks_in_group exceeds the entity index space".to_owned(),
            ));
        }

        let layout = volumes.layout;
        let mut groups: Vec<BlockGroup> = (1..=smeta.total_groups)
            .map(|id| BlockGroup {
                desc: GroupDescriptor { group_id: id },
                inode_bitmap: WordBitmap::new(id, vec![0; layout.inode_bitmap_len]),
                block_bitmap: WordBitmap::new(id, vec![0; layout.block_bitmap_len]),
            })
            .collect();
        for img in images {
            let group = &mut groups[(img.group_id - 1) as usize];
            group.inode_bitmap = WordBitmap::new(img.group_id, img.inode_bitmap);
            group.block_bitmap = WordBitmap::new(img.group_id, img.block_bitmap);
        }

        info!(
            total_space_gb = smeta.total_space() / (1024 * 1024 * 1024),
            total_blocks = smeta.total_blocks(),
            block_size = smeta.block_size,
            groups = smeta.total_groups,
            inode_size = Inode::ENCODED_LEN,
            total_inodes = smeta.total_inodes(),
            "initialized filesystem"
        );

        Ok(Self {
            smeta,
            cur_group: 0,
            groups,
            volumes,
            ptr_cache: PointerCache::new(),
        })
    }

    // ── Accessors ───────────────────────────────────────────────────────

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.smeta
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.smeta.block_size as usize
    }

    /// Entity addresses per pointer page.
    #[must_use]
    pub fn block_pointers(&self) -> usize {
        self.volumes.layout.block_pointers
    }

    #[must_use]
    pub fn volume(&self, idx: usize) -> Option<&Volume> {
        self.volumes.volume(idx)
    }

    #[must_use]
    pub fn block_bitmap_bytes(&self, idx: usize) -> Option<&[u8]> {
        self.groups.get(idx).map(|g| g.block_bitmap.as_bytes())
    }

    #[must_use]
    pub fn inode_bitmap_bytes(&self, idx: usize) -> Option<&[u8]> {
        self.groups.get(idx).map(|g| g.inode_bitmap.as_bytes())
    }

    /// `(total, free)` blocks for one group, or the whole store.
    #[must_use]
    pub fn stat_blocks(&self, idx: Option<usize>) -> (u64, u64) {
        if let Some(i) = idx {
            if let Some(group) = self.groups.get(i) {
                return (
                    u64::from(self.smeta.blocks_in_group),
                    group.block_bitmap.free_bits() as u64,
                );
            }
        }
        (self.smeta.total_blocks(), self.free_block_total())
    }

    /// `(total, free)` inodes for one group, or the whole store.
    #[must_use]
    pub fn stat_inodes(&self, idx: Option<usize>) -> (u64, u64) {
        if let Some(i) = idx {
            if let Some(group) = self.groups.get(i) {
                return (
                    u64::from(self.smeta.inodes_per_group()),
                    group.inode_bitmap.free_bits() as u64,
                );
            }
        }
        let free = self
            .groups
            .iter()
            .map(|g| g.inode_bitmap.free_bits() as u64)
            .sum();
        (self.smeta.total_inodes(), free)
    }

    /// Flush every materialized volume file.
    pub fn sync_all(&self) -> Result<()> {
        for idx in 0..self.groups.len() {
            if self.volumes.is_ready(idx) {
                self.volumes.sync(idx)?;
            }
        }
        Ok(())
    }

    pub(crate) fn sync_group_of(&self, addr: EntAddr) -> Result<()> {
        let gidx = self.group_index(addr)?;
        self.volumes.sync(gidx)
    }

    // ── Internal plumbing ───────────────────────────────────────────────

    fn group_index(&self, addr: EntAddr) -> Result<usize> {
        let group = addr.group();
        if group == 0 || group > self.smeta.total_groups {
            return Err(PfsError::BadGroupId(group));
        }
        Ok((group - 1) as usize)
    }

    /// Make sure the group's backing file exists and is open before any
    /// positional I/O or bitmap-delta persistence touches it.
    fn check_ready_group(&mut self, gidx: usize) -> Result<()> {
        let group = self
            .groups
            .get(gidx)
            .ok_or(PfsError::BadGroupId(gidx as u32 + 1))?;
        self.volumes.check_ready(
            gidx,
            group.inode_bitmap.as_bytes(),
            group.block_bitmap.as_bytes(),
        )
    }

    fn free_block_total(&self) -> u64 {
        self.groups
            .iter()
            .map(|g| g.block_bitmap.free_bits() as u64)
            .sum()
    }

    /// Whether the store can produce `need` more blocks, scanning from
    /// the cursor.
    fn have_free_blocks(&self, mut need: usize) -> bool {
        let total = self.groups.len();
        let mut idx = self.cur_group as usize;
        for _ in 0..total {
            let free = self.groups[idx].block_bitmap.free_bits();
            if free >= need {
                return true;
            }
            need -= free;
            idx = (idx + 1) % total;
        }
        false
    }

    // ── Inode operations ────────────────────────────────────────────────

    pub(crate) fn is_valid_inode(&self, addr: EntAddr) -> bool {
        let (idx, group, _) = addr.parts();
        if group == 0 || group > self.smeta.total_groups {
            return false;
        }
        let bitmap = &self.groups[(group - 1) as usize].inode_bitmap;
        if idx as usize >= bitmap.total_bits() {
            return false;
        }
        bitmap.check_bit(addr)
    }

    /// Allocate one inode slot, rotating through groups from the cursor.
    pub(crate) fn alloc_inode(&mut self) -> Result<EntAddr> {
        let total = self.groups.len();
        let mut cur = self.cur_group as usize;
        for _ in 0..total {
            if self.groups[cur].inode_bitmap.free_bits() > 0 {
                let (list, _) = self.groups[cur].inode_bitmap.alloc_bits(1, 1, false);
                if let Some(&addr) = list.first() {
                    self.check_ready_group(cur)?;
                    let byte_idx = (addr.index() / 8) as usize;
                    self.volumes.write_all_at(
                        cur,
                        self.volumes.layout.inode_bitmap_offset + byte_idx as u64,
                        self.groups[cur].inode_bitmap.byte_range(byte_idx, 1),
                    )?;
                    return Ok(addr);
                }
            }
            cur = (cur + 1) % total;
        }
        Err(PfsError::NoFreeInodes)
    }

    pub(crate) fn free_inode(&mut self, addr: EntAddr) -> Result<()> {
        let gidx = self.group_index(addr).map_err(|_| PfsError::BadUid)?;
        self.check_ready_group(gidx)?;
        self.groups[gidx].inode_bitmap.clear_bits(&[addr]);
        let byte_idx = (addr.index() / 8) as usize;
        self.volumes.write_all_at(
            gidx,
            self.volumes.layout.inode_bitmap_offset + byte_idx as u64,
            self.groups[gidx].inode_bitmap.byte_range(byte_idx, 1),
        )
    }

    pub(crate) fn read_inode(&mut self, addr: EntAddr) -> Result<Inode> {
        let gidx = self.group_index(addr)?;
        self.check_ready_group(gidx)?;
        let offset = self.volumes.layout.inode_offset
            + u64::from(addr.index()) * Inode::ENCODED_LEN as u64;
        let mut raw = [0u8; Inode::ENCODED_LEN];
        self.volumes.read_exact_at(gidx, offset, &mut raw)?;
        Inode::decode(&raw).map_err(|e| PfsError::Corrupt(format!("undecodable inode: {e}")))
    }

    pub(crate) fn sync_inode(&mut self, addr: EntAddr, inode: &Inode) -> Result<()> {
        let gidx = self.group_index(addr)?;
        self.check_ready_group(gidx)?;
        let offset = self.volumes.layout.inode_offset
            + u64::from(addr.index()) * Inode::ENCODED_LEN as u64;
        debug!(inode = %addr, offset, "sync inode");
        self.volumes.write_all_at(gidx, offset, &inode.encode())
    }

    // ── Block operations ────────────────────────────────────────────────

    /// Persist the bitmap bytes touched by a batch of allocations.
    fn sync_block_alloc(&mut self, gidx: usize, addrs: &[EntAddr]) -> Result<()> {
        self.check_ready_group(gidx)?;
        let (spans, _) = merge_spans(addrs);
        for span in spans {
            self.volumes.write_all_at(
                gidx,
                self.volumes.layout.block_bitmap_offset + span.offset as u64,
                self.groups[gidx].block_bitmap.byte_range(span.offset, span.length),
            )?;
        }
        Ok(())
    }

    pub(crate) fn alloc_one_block(&mut self) -> Result<EntAddr> {
        let (blocks, _) = self.alloc_blocks(1, 1, false)?;
        blocks
            .first()
            .copied()
            .ok_or_else(|| PfsError::Corrupt("allocator returned no block".to_owned()))
    }

    /// Allocate up to `n_wanted` blocks across groups, emitting at most
    /// `handle_limit` addresses. Returns the addresses and total bits.
    ///
    /// If big allocation is disabled in the superblock, `big_alloc` is
    /// forced off. The cursor advances with each group visited so the
    /// next call continues where this one left off.
    pub(crate) fn alloc_blocks(
        &mut self,
        n_wanted: usize,
        handle_limit: usize,
        big_alloc: bool,
    ) -> Result<(Vec<EntAddr>, usize)> {
        let big_alloc = big_alloc && self.smeta.is_big_alloc_enabled();
        if !self.have_free_blocks(n_wanted) {
            return Err(PfsError::NotEnoughFreeBlocks {
                needed: n_wanted as u64,
                free: self.free_block_total(),
            });
        }

        let total = self.groups.len();
        let mut out: Vec<EntAddr> = Vec::new();
        let mut need = n_wanted;
        let mut idx = self.cur_group as usize;
        let mut visited = 0;
        loop {
            let limit = handle_limit - out.len();
            if limit == 0 {
                break;
            }
            if self.groups[idx].block_bitmap.free_bits() > 0 {
                let (blocks, got) = self.groups[idx]
                    .block_bitmap
                    .alloc_bits(need, limit, big_alloc);
                need = need.saturating_sub(got);
                self.sync_block_alloc(idx, &blocks)?;
                out.extend(blocks);
                if need == 0 || out.len() == handle_limit {
                    break;
                }
            }
            visited += 1;
            idx = (idx + 1) % total;
            self.cur_group = idx as u32;
            if visited >= total {
                break;
            }
        }
        if need > 0 && out.len() < handle_limit {
            return Err(PfsError::NotEnoughFreeBlocks {
                needed: n_wanted as u64,
                free: self.free_block_total(),
            });
        }
        Ok((out, n_wanted - need))
    }

    /// Return data blocks to their groups' bitmaps and persist the
    /// merged byte spans.
    pub(crate) fn release_data_blocks(&mut self, mut addrs: Vec<EntAddr>) -> Result<()> {
        addrs.sort_by_key(|a| a.position_key());
        let mut by_group: Vec<(u32, Vec<EntAddr>)> = Vec::new();
        for addr in addrs {
            let group = addr.group();
            match by_group.last_mut() {
                Some((g, list)) if *g == group => list.push(addr),
                _ => by_group.push((group, vec![addr])),
            }
        }
        for (group, list) in by_group {
            if group == 0 || group > self.smeta.total_groups {
                return Err(PfsError::BadGroupId(group));
            }
            let gidx = (group - 1) as usize;
            self.check_ready_group(gidx)?;
            self.groups[gidx].block_bitmap.clear_bits(&list);
            let (spans, _) = merge_spans(&list);
            for span in spans {
                self.volumes.write_all_at(
                    gidx,
                    self.volumes.layout.block_bitmap_offset + span.offset as u64,
                    self.groups[gidx].block_bitmap.byte_range(span.offset, span.length),
                )?;
            }
        }
        Ok(())
    }

    /// Read from a data block at `offset_in_block`. A big address spans
    /// `64 * block_size` bytes from its index. Returns `(bytes_read,
    /// bytes_left_in_block)`.
    pub(crate) fn read_block(
        &mut self,
        addr: EntAddr,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<(usize, usize)> {
        let gidx = self.group_index(addr)?;
        if addr.index() >= self.smeta.blocks_in_group {
            return Err(PfsError::Corrupt(format!(
                "block address {addr} outside its group"
            )));
        }
        let block_size = self.block_size();
        let span = if addr.is_big() {
            BIG_ALLOC_BLOCKS * block_size
        } else {
            block_size
        };
        if offset >= span {
            return Err(PfsError::BadOffset { offset, limit: span });
        }
        let size = (span - offset).min(buf.len());
        let left = span - size - offset;
        self.check_ready_group(gidx)?;
        let pos = self.volumes.layout.block_offset
            + u64::from(addr.index()) * block_size as u64
            + offset as u64;
        self.volumes.read_exact_at(gidx, pos, &mut buf[..size])?;
        Ok((size, left))
    }

    /// Write into a data block at `offset_in_block`. Returns
    /// `(bytes_written, new_offset_in_block)`, the latter 0 when the
    /// block was filled to its end.
    pub(crate) fn write_block(
        &mut self,
        addr: EntAddr,
        data: &[u8],
        offset: usize,
    ) -> Result<(usize, usize)> {
        let gidx = self.group_index(addr)?;
        if addr.index() >= self.smeta.blocks_in_group {
            return Err(PfsError::Corrupt(format!(
                "block address {addr} outside its group"
            )));
        }
        let block_size = self.block_size();
        let span = if addr.is_big() {
            BIG_ALLOC_BLOCKS * block_size
        } else {
            block_size
        };
        if offset >= span {
            return Err(PfsError::BadOffset { offset, limit: span });
        }
        let (size, broff) = if data.len() >= span - offset {
            (span - offset, 0)
        } else {
            (data.len(), offset + data.len())
        };
        self.check_ready_group(gidx)?;
        let pos = self.volumes.layout.block_offset
            + u64::from(addr.index()) * block_size as u64
            + offset as u64;
        self.volumes.write_all_at(gidx, pos, &data[..size])?;
        Ok((size, broff))
    }

    // ── Pointer-page I/O ────────────────────────────────────────────────

    pub(crate) fn read_pointer(
        &mut self,
        addr: EntAddr,
        out: &mut [u32],
        entry_offset: usize,
    ) -> Result<()> {
        let mut data = vec![0u8; 4 * out.len()];
        let (read, _) = self.read_block(addr, 4 * entry_offset, &mut data)?;
        if read != data.len() {
            return Err(PfsError::Corrupt("short pointer-page read".to_owned()));
        }
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = u32::from_le_bytes([
                data[i * 4],
                data[i * 4 + 1],
                data[i * 4 + 2],
                data[i * 4 + 3],
            ]);
        }
        Ok(())
    }

    /// Pointer read through the per-level LRU. Only reads covering a
    /// whole page populate the cache.
    pub(crate) fn read_pointer_cached(
        &mut self,
        addr: EntAddr,
        out: &mut [u32],
        entry_offset: usize,
        level: usize,
    ) -> Result<()> {
        if let Some(page) = self.ptr_cache.lookup(level, addr.raw()) {
            if entry_offset + out.len() <= page.len() {
                out.copy_from_slice(&page[entry_offset..entry_offset + out.len()]);
                return Ok(());
            }
            tracing::warn!(
                block = %addr,
                level,
                entry_offset,
                page_len = page.len(),
                "cached pointer page cannot satisfy offset"
            );
            return Err(PfsError::BadOffset {
                offset: entry_offset,
                limit: page.len(),
            });
        }
        self.read_pointer(addr, out, entry_offset)?;
        if entry_offset == 0 && out.len() == self.block_pointers() {
            self.ptr_cache.insert(level, addr.raw(), out.to_vec());
        }
        Ok(())
    }

    pub(crate) fn write_pointer(
        &mut self,
        addr: EntAddr,
        entries: &[u32],
        entry_offset: usize,
    ) -> Result<()> {
        let mut data = Vec::with_capacity(4 * entries.len());
        for entry in entries {
            data.extend_from_slice(&entry.to_le_bytes());
        }
        self.write_block(addr, &data, 4 * entry_offset).map(|_| ())
    }

    /// Pointer write with write-through into the level's LRU.
    pub(crate) fn write_pointer_cached(
        &mut self,
        addr: EntAddr,
        entries: &[u32],
        entry_offset: usize,
        level: usize,
    ) -> Result<()> {
        self.write_pointer(addr, entries, entry_offset)?;
        let full_page = self.block_pointers();
        self.ptr_cache
            .patch_or_fill(level, addr.raw(), entries, entry_offset, full_page);
        Ok(())
    }

    // ── File lifecycle ──────────────────────────────────────────────────

    pub(crate) fn uid_for(&self, addr: EntAddr, inode: &Inode) -> String {
        FileKey {
            shard: self.smeta.shard_id,
            inodeptr: addr.raw(),
            seq: inode.seq,
            stamp: inode.ctime as u32,
        }
        .to_uid()
    }

    /// Create a file, returning its stream handle and UID.
    ///
    /// The encoded metadata (name plus `ext_meta`) must fit in one block;
    /// `ext_meta` itself may not exceed 2048 bytes.
    pub fn create_file(&mut self, name: &str, ext_meta: &[u8]) -> Result<(Vfile, String)> {
        if ext_meta.len() > MAX_FILE_META_SIZE {
            return Err(PfsError::MetaOverlimit {
                size: ext_meta.len(),
                limit: MAX_FILE_META_SIZE,
            });
        }
        let meta = FileMeta {
            name: name.to_owned(),
            ext: ext_meta.to_vec(),
        };
        let encoded_meta = meta.to_bytes();
        if encoded_meta.len() >= self.block_size() {
            return Err(PfsError::MetaOverlimit {
                size: encoded_meta.len(),
                limit: self.block_size(),
            });
        }

        let inode_addr = self.alloc_inode()?;
        let previous = self.read_inode(inode_addr)?;
        let mut inode = Inode {
            seq: previous.seq.wrapping_add(1),
            ctime: now_unix(),
            ..Inode::default()
        };
        inode.mtime = inode.ctime;
        let uid = self.uid_for(inode_addr, &inode);

        inode.meta_size = encoded_meta.len() as u16;
        inode.blocks = 1;
        let first = self.alloc_one_block()?;
        self.write_block(first, &encoded_meta, 0)?;
        inode.direct[0] = first.raw();
        self.sync_inode(inode_addr, &inode)?;

        Ok((Vfile::new(inode_addr, inode, meta), uid))
    }

    pub(crate) fn load_meta(&mut self, inode: &Inode) -> Result<FileMeta> {
        let mut data = vec![0u8; usize::from(inode.meta_size)];
        self.read_block(EntAddr::from_raw(inode.direct[0]), 0, &mut data)?;
        FileMeta::from_bytes(&data)
            .map_err(|e| PfsError::Corrupt(format!("undecodable file metadata: {e}")))
    }

    /// Open a live file by UID.
    ///
    /// The UID must reconstruct exactly from the stored inode; stale
    /// identifiers from a previous generation of the slot are rejected.
    pub fn open_file(&mut self, uid: &str) -> Result<Vfile> {
        let key = FileKey::parse(uid).map_err(|_| PfsError::BadUid)?;
        let addr = EntAddr::from_raw(key.inodeptr);
        if !self.is_valid_inode(addr) {
            return Err(PfsError::FileNotFound);
        }
        let inode = self.read_inode(addr).map_err(|_| PfsError::FileNotFound)?;
        if self.uid_for(addr, &inode) != uid {
            return Err(PfsError::FileNotFound);
        }
        if u32::from(inode.meta_size) > self.smeta.block_size {
            return Err(PfsError::Corrupt(
                "stored metadata larger than a block".to_owned(),
            ));
        }
        let meta = self.load_meta(&inode)?;
        debug!(
            inode = %addr,
            size = inode.file_size,
            name = %meta.name,
            blocks = inode.blocks,
            "open file"
        );
        Ok(Vfile::new(addr, inode, meta))
    }

    /// Release a whole indirect subtree bottom-up: data blocks at the
    /// leaves first, then the pointer blocks themselves. `blocks` bounds
    /// how many leaf addresses are still live under this subtree, so
    /// dead branches are never visited.
    fn release_indirect(&mut self, ptr_raw: u32, depth: usize, blocks: usize) -> Result<()> {
        if ptr_raw == 0 {
            return Ok(());
        }
        let bp = self.block_pointers();
        let child_cap = bp.pow(depth as u32 - 1);
        let entries = if depth == 1 {
            blocks
        } else {
            blocks.div_ceil(child_cap)
        }
        .min(bp);
        debug!(
            block = ptr_raw,
            depth, blocks, entries, "release indirect subtree"
        );
        let addr = EntAddr::from_raw(ptr_raw);
        let mut ptrs = vec![0u32; entries];
        self.read_pointer(addr, &mut ptrs, 0)?;

        if depth == 1 {
            self.release_data_blocks(ptrs.iter().map(|&p| EntAddr::from_raw(p)).collect())?;
        } else {
            let mut remaining = blocks;
            for &child in &ptrs {
                self.release_indirect(child, depth - 1, remaining)?;
                remaining = remaining.saturating_sub(child_cap);
            }
        }
        self.release_data_blocks(vec![addr])
    }

    /// Delete a file by UID, returning every block to the bitmaps and
    /// clearing the inode bit. The reverse of creation.
    pub fn delete_file(&mut self, uid: &str) -> Result<()> {
        let key = FileKey::parse(uid).map_err(|_| PfsError::BadUid)?;
        let addr = EntAddr::from_raw(key.inodeptr);
        if !self.is_valid_inode(addr) {
            return Err(PfsError::FileNotFound);
        }
        let inode = self.read_inode(addr).map_err(|_| PfsError::FileNotFound)?;
        if self.uid_for(addr, &inode) != uid {
            return Err(PfsError::FileNotFound);
        }
        debug!(
            uid,
            inode = %addr,
            size = inode.file_size,
            blocks = inode.blocks,
            "delete file"
        );

        for i in 0..DIRECT_BLOCKS.min(inode.blocks as usize) {
            if inode.direct[i] != 0 {
                self.release_data_blocks(vec![EntAddr::from_raw(inode.direct[i])])?;
            }
        }
        let mut blocks = (inode.blocks as usize).saturating_sub(DIRECT_BLOCKS);
        let bp = self.block_pointers();
        let levels = [
            (inode.single_indirect, 1usize),
            (inode.double_indirect, 2),
            (inode.triple_indirect, 3),
        ];
        for (root, depth) in levels {
            if root != 0 && blocks > 0 {
                let batch = blocks.min(bp.pow(depth as u32));
                self.release_indirect(root, depth, batch)?;
                blocks -= batch;
            }
        }
        self.free_inode(addr)
    }

    // ── Listing ─────────────────────────────────────────────────────────

    fn inode_to_snap(&mut self, addr: EntAddr) -> Result<FileSnap> {
        let inode = self.read_inode(addr).map_err(|e| {
            error!(inode = %addr, error = %e, "read inode for listing");
            e
        })?;
        let meta = self.load_meta(&inode)?;
        Ok(FileSnap {
            key: self.uid_for(addr, &inode),
            inode: addr.raw(),
            name: meta.name,
            meta: meta.ext,
            size: inode.file_size,
            ctime: inode.ctime,
            mtime: inode.mtime,
        })
    }

    /// Snapshot every live file in every materialized group.
    pub fn file_list(&mut self) -> Result<Vec<FileSnap>> {
        let mut list = Vec::new();
        for gidx in 0..self.groups.len() {
            if !self.volumes.is_ready(gidx) {
                continue;
            }
            let bitmap = self.groups[gidx].inode_bitmap.as_bytes().to_vec();
            for (byte_idx, &byte) in bitmap.iter().enumerate() {
                if byte == 0 {
                    continue;
                }
                for bit in 0..8 {
                    if byte & (1 << bit) != 0 {
                        let addr = EntAddr::new(
                            (byte_idx * 8 + bit) as u32,
                            gidx as u32 + 1,
                            false,
                        )
                        .map_err(|e| PfsError::Corrupt(e.to_string()))?;
                        list.push(self.inode_to_snap(addr)?);
                    }
                }
            }
        }
        Ok(list)
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
