//! The Vfile stream: a read/write cursor over one inode's data.
//!
//! Logical block indexes count from the first direct pointer; block 0
//! also carries the encoded file metadata, so the cursor's in-block
//! offset starts at `meta_size` there. `byte_offset` is the user-visible
//! position and never includes metadata bytes.
//!
//! Writes overwrite in place inside the recorded block range and
//! allocate-and-append beyond it. Extending past the end grows
//! `file_size`; overwriting inside it never changes it, and nothing ever
//! shrinks it.

use crate::fs::Filesystem;
use pfs_error::{PfsError, Result};
use pfs_ondisk::{FileMeta, Inode};
use pfs_types::{EntAddr, BIG_ALLOC_BLOCKS, DIRECT_BLOCKS};
use tracing::{debug, error};

/// Saved cursor state.
///
/// Opaque to callers: obtain one from [`Vfile::offset`] after a seek and
/// hand it back to [`Vfile::seek`] to resume at the same position
/// without re-walking the pointer tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VfileOffset {
    byte_offset: u64,
    block_idx: u32,
    rem_in_block: usize,
}

impl VfileOffset {
    /// User-visible byte position.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.byte_offset
    }

    /// Logical block index the cursor sits in.
    #[must_use]
    pub fn block_index(&self) -> u32 {
        self.block_idx
    }
}

/// A byte-stream handle over one live inode.
#[derive(Debug)]
pub struct Vfile {
    pub inode_addr: EntAddr,
    pub inode: Inode,
    pub meta: FileMeta,
    offset: VfileOffset,
}

impl Vfile {
    pub(crate) fn new(inode_addr: EntAddr, inode: Inode, meta: FileMeta) -> Self {
        Self {
            inode_addr,
            inode,
            meta,
            offset: VfileOffset {
                byte_offset: 0,
                block_idx: 0,
                rem_in_block: usize::from(inode.meta_size),
            },
        }
    }

    /// Current cursor state, cheap to save.
    #[must_use]
    pub fn offset(&self) -> VfileOffset {
        self.offset
    }

    /// Restore a cursor previously returned by [`Vfile::offset`].
    pub fn seek(&mut self, offset: VfileOffset) {
        self.offset = offset;
    }

    /// Flush this file's group to stable storage.
    pub fn sync(&self, fs: &Filesystem) -> Result<()> {
        fs.sync_group_of(self.inode_addr)
    }

    fn block_capacity(fs: &Filesystem, addr: EntAddr) -> usize {
        if addr.is_big() {
            BIG_ALLOC_BLOCKS * fs.block_size()
        } else {
            fs.block_size()
        }
    }

    fn align_blocks(len: usize, block_size: usize) -> usize {
        len.div_ceil(block_size)
    }

    /// Move the cursor past `wtn` just-written bytes, growing the file
    /// when the position runs past its recorded end.
    fn advance_write(&mut self, wtn: usize, broff: usize) {
        self.offset.byte_offset += wtn as u64;
        if self.offset.byte_offset > self.inode.file_size {
            self.inode.file_size = self.offset.byte_offset;
        }
        self.offset.rem_in_block = broff;
        if broff == 0 {
            self.offset.block_idx += 1;
        }
    }

    fn indirect_root(&self, depth: usize) -> u32 {
        match depth {
            1 => self.inode.single_indirect,
            2 => self.inode.double_indirect,
            _ => self.inode.triple_indirect,
        }
    }

    fn set_indirect_root(&mut self, depth: usize, raw: u32) {
        match depth {
            1 => self.inode.single_indirect = raw,
            2 => self.inode.double_indirect = raw,
            _ => self.inode.triple_indirect = raw,
        }
    }

    // ── Read ────────────────────────────────────────────────────────────

    /// Read up to `buf.len()` bytes at the cursor. Returns 0 at end of
    /// file.
    pub fn read(&mut self, fs: &mut Filesystem, buf: &mut [u8]) -> Result<usize> {
        if self.offset.byte_offset >= self.inode.file_size {
            return Ok(0);
        }
        let remaining = (self.inode.file_size - self.offset.byte_offset) as usize;
        let want = buf.len().min(remaining);
        let buf = &mut buf[..want];

        let mut done = 0usize;
        while (self.offset.block_idx as usize) < DIRECT_BLOCKS && done < want {
            let raw = self.inode.direct[self.offset.block_idx as usize];
            if raw == 0 {
                break;
            }
            let (read, left) =
                fs.read_block(EntAddr::from_raw(raw), self.offset.rem_in_block, &mut buf[done..])?;
            if left == 0 {
                self.offset.block_idx += 1;
                self.offset.rem_in_block = 0;
            } else {
                self.offset.rem_in_block += read;
            }
            done += read;
        }
        while done < want {
            if (self.offset.block_idx as usize) < DIRECT_BLOCKS {
                return Err(PfsError::Corrupt(
                    "file body shorter than its recorded size".to_owned(),
                ));
            }
            let block_index = self.offset.block_idx - DIRECT_BLOCKS as u32;
            let read = self.read_indirect(fs, block_index, &mut buf[done..])?;
            if read == 0 {
                error!("indirect read made no progress");
                break;
            }
            done += read;
            debug!(read, total = done, "read from indirect blocks");
        }
        self.offset.byte_offset += done as u64;
        Ok(done)
    }

    /// Route a logical block index (past the direct region) to the
    /// shallowest indirect level whose capacity covers it.
    fn read_indirect(
        &mut self,
        fs: &mut Filesystem,
        block_index: u32,
        buf: &mut [u8],
    ) -> Result<usize> {
        let bp = fs.block_pointers() as u64;
        let mut index = u64::from(block_index);
        for depth in 1..=3usize {
            let capacity = bp.pow(depth as u32);
            if index < capacity {
                let root = self.indirect_root(depth);
                if root == 0 {
                    return Err(PfsError::Corrupt(
                        "missing indirect root for recorded block".to_owned(),
                    ));
                }
                return self.read_from_indirect(fs, EntAddr::from_raw(root), index, buf, depth);
            }
            if depth != 3 {
                index -= capacity;
            }
        }
        Err(PfsError::Corrupt(
            "logical block beyond addressable capacity".to_owned(),
        ))
    }

    fn read_from_indirect(
        &mut self,
        fs: &mut Filesystem,
        ptr: EntAddr,
        block_index: u64,
        buf: &mut [u8],
        depth: usize,
    ) -> Result<usize> {
        let bp = fs.block_pointers();
        let child_cap = (bp as u64).pow(depth as u32 - 1);
        let start = (block_index / child_cap) as usize;
        let mut ptrs = vec![0u32; bp];
        fs.read_pointer_cached(ptr, &mut ptrs, 0, depth)?;

        let mut done = 0usize;
        if depth == 1 {
            for &raw in &ptrs[start..] {
                let (read, left) = fs.read_block(
                    EntAddr::from_raw(raw),
                    self.offset.rem_in_block,
                    &mut buf[done..],
                )?;
                if left == 0 {
                    self.offset.block_idx += 1;
                    self.offset.rem_in_block = 0;
                } else {
                    self.offset.rem_in_block += read;
                }
                done += read;
                if done >= buf.len() {
                    break;
                }
            }
            return Ok(done);
        }
        for (i, &raw) in ptrs.iter().enumerate().skip(start) {
            if raw == 0 {
                return Err(PfsError::Corrupt(
                    "read descended into an unallocated subtree".to_owned(),
                ));
            }
            let child_index = if i == start { block_index % child_cap } else { 0 };
            let read =
                self.read_from_indirect(fs, EntAddr::from_raw(raw), child_index, &mut buf[done..], depth - 1)?;
            done += read;
            if done >= buf.len() {
                break;
            }
        }
        Ok(done)
    }

    // ── Write ───────────────────────────────────────────────────────────

    /// Write `data` at the cursor: overwrite in place inside the
    /// recorded block range, allocate and append beyond it.
    pub fn write(&mut self, fs: &mut Filesystem, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut data = data;
        let mut total = 0usize;

        while (self.offset.block_idx as usize) < DIRECT_BLOCKS {
            let slot = self.offset.block_idx as usize;
            if self.inode.direct[slot] != 0 {
                let addr = EntAddr::from_raw(self.inode.direct[slot]);
                let (wtn, broff) = fs.write_block(addr, data, self.offset.rem_in_block)?;
                data = &data[wtn..];
                total += wtn;
                self.advance_write(wtn, broff);
                fs.sync_inode(self.inode_addr, &self.inode)?;
            } else {
                let need = Self::align_blocks(data.len(), fs.block_size());
                let limit = DIRECT_BLOCKS - slot;
                let (blocks, _) = fs.alloc_blocks(need, limit, true)?;
                for addr in &blocks {
                    self.inode.direct[self.offset.block_idx as usize] = addr.raw();
                    let (wtn, broff) = fs.write_block(*addr, data, 0)?;
                    data = &data[wtn..];
                    total += wtn;
                    self.inode.blocks += 1;
                    self.advance_write(wtn, broff);
                }
                fs.sync_inode(self.inode_addr, &self.inode)?;
            }
            if data.is_empty() {
                return Ok(total);
            }
        }

        while !data.is_empty() {
            let block_index = self.offset.block_idx - DIRECT_BLOCKS as u32;
            let wtn = self.write_indirect(fs, block_index, data)?;
            if wtn == 0 {
                error!("indirect write made no progress");
                break;
            }
            total += wtn;
            data = &data[wtn..];
            debug!(written = wtn, left = data.len(), total, "write to indirect blocks");
        }

        if data.is_empty() {
            Ok(total)
        } else {
            Err(PfsError::NotEnoughFreeBlocks {
                needed: Self::align_blocks(data.len(), fs.block_size()) as u64,
                free: fs.stat_blocks(None).1,
            })
        }
    }

    /// Route an indirect-region write, allocating the level root on
    /// first use.
    fn write_indirect(
        &mut self,
        fs: &mut Filesystem,
        block_index: u32,
        data: &[u8],
    ) -> Result<usize> {
        let bp = fs.block_pointers() as u64;
        let mut index = u64::from(block_index);
        for depth in 1..=3usize {
            let capacity = bp.pow(depth as u32);
            if index < capacity {
                if self.indirect_root(depth) == 0 {
                    let page = fs.alloc_one_block()?;
                    fs.write_pointer_cached(page, &vec![0u32; bp as usize], 0, depth)?;
                    self.set_indirect_root(depth, page.raw());
                    fs.sync_inode(self.inode_addr, &self.inode)?;
                }
                let root = EntAddr::from_raw(self.indirect_root(depth));
                return self.write_to_indirect(fs, root, index, data, depth);
            }
            if depth != 3 {
                index -= capacity;
            }
        }
        Err(PfsError::CapacityExceeded)
    }

    fn write_to_indirect(
        &mut self,
        fs: &mut Filesystem,
        ptr: EntAddr,
        block_index: u64,
        data: &[u8],
        depth: usize,
    ) -> Result<usize> {
        if depth == 1 && self.offset.block_idx >= self.inode.blocks {
            return self.batch_write_new(fs, ptr, block_index, data);
        }
        if depth == 0 {
            // `ptr` is the data block itself; overwrite at the cursor.
            let (wtn, broff) = fs.write_block(ptr, data, self.offset.rem_in_block)?;
            self.advance_write(wtn, broff);
            fs.sync_inode(self.inode_addr, &self.inode)?;
            return Ok(wtn);
        }

        let bp = fs.block_pointers();
        let child_cap = (bp as u64).pow(depth as u32 - 1);
        let entry = (block_index / child_cap) as usize;
        let mut slot = [0u32; 1];
        fs.read_pointer_cached(ptr, &mut slot, entry, depth)?;
        if slot[0] == 0 {
            let page = fs.alloc_one_block()?;
            fs.write_pointer_cached(page, &vec![0u32; bp], 0, depth - 1)?;
            slot[0] = page.raw();
            fs.write_pointer_cached(ptr, &slot, entry, depth)?;
            if depth == 1 {
                // The fresh entry is a data block, not a pointer page.
                self.inode.blocks += 1;
            }
        }
        self.write_to_indirect(
            fs,
            EntAddr::from_raw(slot[0]),
            block_index % child_cap,
            data,
            depth - 1,
        )
    }

    /// Append fresh blocks through a depth-1 pointer page: allocate a
    /// batch (big allowed), thread the addresses into the page, fill
    /// them with data.
    fn batch_write_new(
        &mut self,
        fs: &mut Filesystem,
        ptr: EntAddr,
        block_index: u64,
        data: &[u8],
    ) -> Result<usize> {
        let bp = fs.block_pointers();
        let batch_limit = bp - block_index as usize;
        let need = Self::align_blocks(data.len(), fs.block_size());
        let (blocks, _) = fs.alloc_blocks(need, batch_limit, true)?;
        debug!(
            from = block_index,
            page = %ptr,
            batch_limit,
            allocated = blocks.len(),
            "batch fill of pointer page"
        );
        let raw: Vec<u32> = blocks.iter().map(|a| a.raw()).collect();
        fs.write_pointer_cached(ptr, &raw, block_index as usize, 1)?;

        let mut total = 0usize;
        for addr in &blocks {
            let (wtn, broff) = fs.write_block(*addr, &data[total..], 0)?;
            total += wtn;
            self.inode.blocks += 1;
            self.advance_write(wtn, broff);
        }
        fs.sync_inode(self.inode_addr, &self.inode)?;
        Ok(total)
    }

    // ── Seek ────────────────────────────────────────────────────────────

    /// Position the cursor at byte `pos`, clamped to the file size.
    ///
    /// Walks direct blocks, then each indirect level in order,
    /// accumulating each encountered block's capacity (64 blocks for a
    /// big address; block 0's capacity is reduced by the metadata
    /// prefix) until the target falls inside or exactly on a boundary.
    pub fn seek_pos(&mut self, fs: &mut Filesystem, pos: u64) -> Result<VfileOffset> {
        let pos = pos.min(self.inode.file_size);
        self.offset = VfileOffset {
            byte_offset: 0,
            block_idx: 0,
            rem_in_block: usize::from(self.inode.meta_size),
        };

        for i in 0..DIRECT_BLOCKS {
            let raw = self.inode.direct[i];
            if raw == 0 {
                return Ok(self.offset);
            }
            self.offset.block_idx = i as u32;
            let mut capacity = Self::block_capacity(fs, EntAddr::from_raw(raw)) as u64;
            if self.offset.rem_in_block != 0 {
                capacity -= self.offset.rem_in_block as u64;
            }
            if self.offset.byte_offset + capacity > pos {
                self.offset.rem_in_block += (pos - self.offset.byte_offset) as usize;
                self.offset.byte_offset = pos;
                return Ok(self.offset);
            } else if self.offset.byte_offset + capacity == pos {
                self.offset.rem_in_block = 0;
                self.offset.block_idx += 1;
                self.offset.byte_offset = pos;
                return Ok(self.offset);
            }
            self.offset.byte_offset += capacity;
            self.offset.rem_in_block = 0;
        }

        for depth in 1..=3usize {
            if self.escape_block(fs, self.indirect_root(depth), depth, pos)? {
                return Ok(self.offset);
            }
        }
        Err(PfsError::Corrupt(
            "seek position beyond the pointer tree".to_owned(),
        ))
    }

    /// Advance the cursor through one indirect subtree until the target
    /// position falls inside a data block. Returns whether it did.
    fn escape_block(
        &mut self,
        fs: &mut Filesystem,
        ptr_raw: u32,
        depth: usize,
        pos: u64,
    ) -> Result<bool> {
        if ptr_raw == 0 {
            return Ok(false);
        }
        let bp = fs.block_pointers();
        let mut ptrs = vec![0u32; bp];
        fs.read_pointer(EntAddr::from_raw(ptr_raw), &mut ptrs, 0)?;

        if depth == 1 {
            for &raw in &ptrs {
                if raw == 0 {
                    return Err(PfsError::Corrupt(
                        "seek ran past the allocated chain".to_owned(),
                    ));
                }
                let capacity = Self::block_capacity(fs, EntAddr::from_raw(raw)) as u64;
                self.offset.block_idx += 1;
                if self.offset.byte_offset + capacity > pos {
                    self.offset.rem_in_block = (pos - self.offset.byte_offset) as usize;
                    self.offset.byte_offset = pos;
                    return Ok(true);
                } else if self.offset.byte_offset + capacity == pos {
                    self.offset.block_idx += 1;
                    self.offset.byte_offset = pos;
                    return Ok(true);
                }
                self.offset.byte_offset += capacity;
            }
            return Ok(false);
        }
        for &raw in &ptrs {
            if raw == 0 {
                break;
            }
            if self.escape_block(fs, raw, depth - 1, pos)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
