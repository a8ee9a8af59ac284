#![forbid(unsafe_code)]
//! Bitmap allocation for PackFS.
//!
//! One bitmap tracks the free/used state of every allocatable unit
//! (inode slot or data block) in a block group. Two implementations of
//! the same [`Bitmap`] capability set exist: [`ByteBitmap`] scans a byte
//! at a time, [`WordBitmap`] scans 64-bit words over the identical byte
//! buffer. Both must emit bit-for-bit identical bitmaps and identical
//! address sequences for any starting state; the property tests hold them
//! to that.
//!
//! Allocation scans forward from a rotating cursor so consecutive
//! allocations land near each other on disk, wrapping to bit 0 at most
//! once per call. When big allocation is enabled and at least 64 bits are
//! still wanted, a contiguous 64-bit run is flipped atomically and
//! reported as a single address carrying the big flag.

mod seg;

pub use seg::{merge_spans, Span};

use pfs_types::{EntAddr, BIG_ALLOC_BLOCKS};

/// Capability set shared by both bitmap implementations.
pub trait Bitmap {
    /// 1-based group this bitmap belongs to.
    fn group_id(&self) -> u32;

    /// Number of tracked bits.
    fn total_bits(&self) -> usize;

    /// Number of clear (allocatable) bits.
    fn free_bits(&self) -> usize;

    /// The backing byte array, as persisted on disk.
    fn as_bytes(&self) -> &[u8];

    /// A byte subrange of the backing array, for persisting deltas.
    fn byte_range(&self, offset: usize, len: usize) -> &[u8];

    /// Allocate up to `n_wanted` bits, emitting at most `handle_limit`
    /// addresses. Returns the addresses and the total bits obtained; a
    /// big address accounts for 64 bits, so the bit total can exceed the
    /// address count.
    fn alloc_bits(
        &mut self,
        n_wanted: usize,
        handle_limit: usize,
        big_alloc: bool,
    ) -> (Vec<EntAddr>, usize);

    /// Flip the indicated bits back to free. A big address clears its
    /// whole 64-bit run.
    fn clear_bits(&mut self, addrs: &[EntAddr]);

    /// Whether the addressed bit is currently set.
    fn check_bit(&self, addr: EntAddr) -> bool;
}

/// Count clear bits in a bitmap byte array.
#[must_use]
pub fn count_free_bits(bytes: &[u8]) -> usize {
    let used: u32 = bytes.iter().map(|b| b.count_ones()).sum();
    bytes.len() * 8 - used as usize
}

/// Whether bit `idx` is set in a bitmap byte array.
#[must_use]
pub fn bit_is_set(bytes: &[u8], idx: u32) -> bool {
    bytes[(idx / 8) as usize] & (1 << (idx % 8)) != 0
}

fn check_bit_for_group(group_id: u32, bytes: &[u8], addr: EntAddr) -> bool {
    let (idx, group, _) = addr.parts();
    assert_eq!(group, group_id, "entity address names the wrong group");
    bit_is_set(bytes, idx)
}

/// Clear bits `[from, to)`.
fn clear_range(bytes: &mut [u8], from: u32, to: u32) {
    let start_byte = (from / 8) as usize;
    let start_bit = from % 8;
    let end_byte = (to / 8) as usize;
    let end_bit = to % 8;

    if start_byte == end_byte {
        let mask = (((1u16 << (end_bit - start_bit)) - 1) as u8) << start_bit;
        bytes[start_byte] &= !mask;
    } else {
        bytes[start_byte] &= !(0xFFu8 << start_bit);
        bytes[end_byte] &= !(((1u16 << end_bit) - 1) as u8);
        for b in &mut bytes[start_byte + 1..end_byte] {
            *b = 0;
        }
    }
}

/// Clear every addressed bit, returning how many bits were flipped.
fn batch_clear(group_id: u32, bytes: &mut [u8], addrs: &[EntAddr]) -> usize {
    let mut cleared = 0;
    for addr in addrs {
        let (idx, group, big) = addr.parts();
        assert_eq!(group, group_id, "entity address names the wrong group");
        if big {
            clear_range(bytes, idx, idx + BIG_ALLOC_BLOCKS as u32);
            cleared += BIG_ALLOC_BLOCKS;
        } else {
            bytes[(idx / 8) as usize] &= !(1 << (idx % 8));
            cleared += 1;
        }
    }
    cleared
}

#[allow(clippy::cast_possible_truncation)] // bitmap sizes are bounded at 2^20 bits
fn make_addr(idx: usize, group: u32, big: bool) -> EntAddr {
    EntAddr::new(idx as u32, group, big).expect("bitmap index within address range")
}

// ── Byte-stride implementation ──────────────────────────────────────────────

/// Bitmap scanning one byte at a time.
#[derive(Debug, Clone)]
pub struct ByteBitmap {
    bits: Vec<u8>,
    free_bits: usize,
    group_id: u32,
    last_pos: usize,
}

impl ByteBitmap {
    /// Wrap an existing bitmap byte array (all-zero for a fresh group).
    #[must_use]
    pub fn new(group_id: u32, data: Vec<u8>) -> Self {
        let free_bits = count_free_bits(&data);
        Self {
            bits: data,
            free_bits,
            group_id,
            last_pos: 0,
        }
    }

    /// Set 64 bits starting at `pos * 8 + of` if they are all free.
    ///
    /// The run spans the upper `8 - of` bits of byte `pos`, seven full
    /// bytes, and the low `of` bits of byte `pos + 8`; a run that would
    /// touch past the end of the array is refused.
    fn try_set_64(&mut self, pos: usize, of: usize) -> bool {
        if pos + 8 >= self.bits.len() {
            return false;
        }
        let mask = (1u8 << of).wrapping_sub(1);
        for i in 0..=8 {
            let byte = self.bits[pos + i];
            let free = match i {
                0 => byte >> of == 0,
                8 => byte & mask == 0,
                _ => byte == 0,
            };
            if !free {
                return false;
            }
        }
        self.bits[pos] |= !mask;
        for i in 1..8 {
            self.bits[pos + i] = 0xFF;
        }
        self.bits[pos + 8] |= mask;
        true
    }
}

impl Bitmap for ByteBitmap {
    fn group_id(&self) -> u32 {
        self.group_id
    }

    fn total_bits(&self) -> usize {
        self.bits.len() * 8
    }

    fn free_bits(&self) -> usize {
        self.free_bits
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    fn byte_range(&self, offset: usize, len: usize) -> &[u8] {
        &self.bits[offset..offset + len]
    }

    fn alloc_bits(
        &mut self,
        n_wanted: usize,
        handle_limit: usize,
        big_alloc: bool,
    ) -> (Vec<EntAddr>, usize) {
        let mut out = Vec::new();
        let mut cnt = 0usize;
        if n_wanted == 0 || handle_limit == 0 {
            return (out, 0);
        }
        let len = self.bits.len();
        let start = self.last_pos;
        let mut pos = start;
        while pos < len {
            self.last_pos = pos;
            loop {
                let of = (!self.bits[pos]).trailing_zeros() as usize;
                if of == 8 {
                    break; // byte full, try the next one
                }
                if big_alloc && n_wanted - cnt >= BIG_ALLOC_BLOCKS && self.try_set_64(pos, of) {
                    cnt += BIG_ALLOC_BLOCKS;
                    self.free_bits -= BIG_ALLOC_BLOCKS;
                    out.push(make_addr(pos * 8 + of, self.group_id, true));
                    if cnt >= n_wanted || out.len() >= handle_limit {
                        return (out, cnt);
                    }
                    break;
                }
                self.bits[pos] |= 1 << of;
                cnt += 1;
                self.free_bits -= 1;
                out.push(make_addr(pos * 8 + of, self.group_id, false));
                if cnt >= n_wanted || out.len() >= handle_limit {
                    return (out, cnt);
                }
            }
            pos += 1;
        }
        if start != 0 && self.free_bits > 0 {
            self.last_pos = 0;
            let (rest, n) = self.alloc_bits(n_wanted - cnt, handle_limit - out.len(), big_alloc);
            cnt += n;
            out.extend(rest);
        }
        (out, cnt)
    }

    fn clear_bits(&mut self, addrs: &[EntAddr]) {
        self.free_bits += batch_clear(self.group_id, &mut self.bits, addrs);
    }

    fn check_bit(&self, addr: EntAddr) -> bool {
        check_bit_for_group(self.group_id, &self.bits, addr)
    }
}

// ── 64-bit-stride implementation ────────────────────────────────────────────

#[inline]
fn word_at(bytes: &[u8], i: usize) -> u64 {
    let o = i * 8;
    u64::from_le_bytes([
        bytes[o],
        bytes[o + 1],
        bytes[o + 2],
        bytes[o + 3],
        bytes[o + 4],
        bytes[o + 5],
        bytes[o + 6],
        bytes[o + 7],
    ])
}

#[inline]
fn set_word(bytes: &mut [u8], i: usize, word: u64) {
    bytes[i * 8..i * 8 + 8].copy_from_slice(&word.to_le_bytes());
}

/// Bitmap scanning 64 bits at a time.
///
/// Words are read and written little-endian over the same byte buffer the
/// byte-stride variant uses, so the two stay bit-identical on any host.
#[derive(Debug, Clone)]
pub struct WordBitmap {
    bytes: Vec<u8>,
    free_bits: usize,
    group_id: u32,
    last_pos: usize,
}

impl WordBitmap {
    /// Wrap an existing bitmap byte array. The length must be a multiple
    /// of 8 so the 64-bit view covers it exactly.
    #[must_use]
    pub fn new(group_id: u32, data: Vec<u8>) -> Self {
        assert!(
            data.len() % 8 == 0,
            "bitmap length must be a multiple of 8"
        );
        let free_bits = count_free_bits(&data);
        Self {
            bytes: data,
            free_bits,
            group_id,
            last_pos: 0,
        }
    }

    fn words(&self) -> usize {
        self.bytes.len() / 8
    }
}

impl Bitmap for WordBitmap {
    fn group_id(&self) -> u32 {
        self.group_id
    }

    fn total_bits(&self) -> usize {
        self.bytes.len() * 8
    }

    fn free_bits(&self) -> usize {
        self.free_bits
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn byte_range(&self, offset: usize, len: usize) -> &[u8] {
        &self.bytes[offset..offset + len]
    }

    fn alloc_bits(
        &mut self,
        n_wanted: usize,
        handle_limit: usize,
        big_alloc: bool,
    ) -> (Vec<EntAddr>, usize) {
        let mut out = Vec::new();
        let mut cnt = 0usize;
        if n_wanted == 0 || handle_limit == 0 {
            return (out, 0);
        }
        let words = self.words();
        let start = self.last_pos;
        let mut pos = start;
        while pos < words {
            self.last_pos = pos;
            loop {
                let word = word_at(&self.bytes, pos);
                let of = (!word).trailing_zeros() as usize;
                if of == 64 {
                    break; // word full, try the next one
                }
                // A 64-bit run is possible iff the bits from `of` to the
                // end of this word are free and the low `of` bits of the
                // next word are free. Runs never straddle the array end.
                if big_alloc
                    && n_wanted - cnt >= BIG_ALLOC_BLOCKS
                    && word >> of == 0
                    && pos + 1 < words
                {
                    let mask = (1u64 << of).wrapping_sub(1);
                    let next = word_at(&self.bytes, pos + 1);
                    if next & mask == 0 {
                        set_word(&mut self.bytes, pos, word | !mask);
                        set_word(&mut self.bytes, pos + 1, next | mask);
                        cnt += BIG_ALLOC_BLOCKS;
                        self.free_bits -= BIG_ALLOC_BLOCKS;
                        out.push(make_addr(pos * 64 + of, self.group_id, true));
                        if cnt >= n_wanted || out.len() >= handle_limit {
                            return (out, cnt);
                        }
                        break;
                    }
                }
                set_word(&mut self.bytes, pos, word | (1u64 << of));
                cnt += 1;
                self.free_bits -= 1;
                out.push(make_addr(pos * 64 + of, self.group_id, false));
                if cnt >= n_wanted || out.len() >= handle_limit {
                    return (out, cnt);
                }
            }
            pos += 1;
        }
        if start != 0 && self.free_bits > 0 {
            self.last_pos = 0;
            let (rest, n) = self.alloc_bits(n_wanted - cnt, handle_limit - out.len(), big_alloc);
            cnt += n;
            out.extend(rest);
        }
        (out, cnt)
    }

    fn clear_bits(&mut self, addrs: &[EntAddr]) {
        self.free_bits += batch_clear(self.group_id, &mut self.bytes, addrs);
    }

    fn check_bit(&self, addr: EntAddr) -> bool {
        check_bit_for_group(self.group_id, &self.bytes, addr)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
