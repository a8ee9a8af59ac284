#![forbid(unsafe_code)]
//! On-disk binary records for PackFS.
//!
//! Everything here is a fixed little-endian encoding: the superblock
//! replicated at offset 0 of every volume file, the group descriptor, the
//! 112-byte inode, the metadata block stored at the head of a file's
//! first data block, and the 28-hex UID that names a live inode snapshot.

use pfs_types::{
    read_le_u16, read_le_u32, read_le_u64, ParseError, DIRECT_BLOCKS, FILE_META_ALIGN,
    MAX_FILE_META_SIZE,
};
use serde::{Deserialize, Serialize};

/// CRC-64/ECMA, the Go `crc64.ECMA` parameter set.
const CRC64: crc::Crc<u64> = crc::Crc::<u64>::new(&crc::CRC_64_XZ);

pub const SUPERBLOCK_MAGIC: u32 = 0x55AA;
pub const DEFAULT_BLOCK_SIZE: u32 = 8192;
pub const MAX_BLOCK_SIZE: u32 = 128 * 4096;
pub const MAX_BLOCK_GROUPS: u32 = 1024;
pub const DEFAULT_INODES_RATIO: u32 = 4;
pub const DEFAULT_BLOCKS_IN_GROUP: u32 = 1024 * 1024;

/// Superblock attr bit 0: big allocation enabled.
const ATTR_BIG_ALLOC: u16 = 1 << 0;

// ── Superblock ──────────────────────────────────────────────────────────────

/// Filesystem-wide metadata, immutable after creation.
///
/// Encoded as `block_size u32 | total_groups u32 | blocks_in_group u32 |
/// inodes_ratio u32 | shard_id u16 | attr u16 | magic u32 | crc u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub block_size: u32,
    pub total_groups: u32,
    pub blocks_in_group: u32,
    pub inodes_ratio: u32,
    pub shard_id: u16,
    pub attr: u16,
    pub magic: u32,
    pub crc: u64,
}

impl Superblock {
    pub const ENCODED_LEN: usize = 32;

    /// Byte count covered by the checksum (everything before `crc`).
    const CRC_COVERED_LEN: usize = 24;

    pub fn enable_big_alloc(&mut self) {
        self.attr |= ATTR_BIG_ALLOC;
    }

    #[must_use]
    pub fn is_big_alloc_enabled(&self) -> bool {
        self.attr & ATTR_BIG_ALLOC != 0
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[0..4].copy_from_slice(&self.block_size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.total_groups.to_le_bytes());
        buf[8..12].copy_from_slice(&self.blocks_in_group.to_le_bytes());
        buf[12..16].copy_from_slice(&self.inodes_ratio.to_le_bytes());
        buf[16..18].copy_from_slice(&self.shard_id.to_le_bytes());
        buf[18..20].copy_from_slice(&self.attr.to_le_bytes());
        buf[20..24].copy_from_slice(&self.magic.to_le_bytes());
        buf[24..32].copy_from_slice(&self.crc.to_le_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            block_size: read_le_u32(data, 0)?,
            total_groups: read_le_u32(data, 4)?,
            blocks_in_group: read_le_u32(data, 8)?,
            inodes_ratio: read_le_u32(data, 12)?,
            shard_id: read_le_u16(data, 16)?,
            attr: read_le_u16(data, 18)?,
            magic: read_le_u32(data, 20)?,
            crc: read_le_u64(data, 24)?,
        })
    }

    /// CRC-64/ECMA over the canonical encoding of every field before `crc`.
    #[must_use]
    pub fn checksum(&self) -> u64 {
        let encoded = self.encode();
        CRC64.checksum(&encoded[..Self::CRC_COVERED_LEN])
    }

    /// Stamp the magic and checksum prior to persisting.
    pub fn sign(&mut self) {
        self.magic = SUPERBLOCK_MAGIC;
        self.crc = self.checksum();
    }

    /// Validate magic, geometry invariants, and the checksum.
    pub fn verify(&self) -> Result<(), ParseError> {
        if self.magic != SUPERBLOCK_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(SUPERBLOCK_MAGIC),
                actual: u64::from(self.magic),
            });
        }
        if self.block_size == 0 || self.block_size % 4096 != 0 || self.block_size > MAX_BLOCK_SIZE
        {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be a non-zero multiple of 4096 up to 512 KiB",
            });
        }
        if self.total_groups == 0 || self.total_groups > MAX_BLOCK_GROUPS {
            return Err(ParseError::InvalidField {
                field: "total_groups",
                reason: "must be in 1..=1024",
            });
        }
        if self.blocks_in_group == 0 || self.blocks_in_group % 1024 != 0 {
            return Err(ParseError::InvalidField {
                field: "blocks_in_group",
                reason: "must be a non-zero multiple of 1024",
            });
        }
        if self.inodes_ratio == 0 || self.inodes_ratio % DEFAULT_INODES_RATIO != 0 {
            return Err(ParseError::InvalidField {
                field: "inodes_ratio",
                reason: "must be a non-zero multiple of 4",
            });
        }
        if (self.blocks_in_group / self.inodes_ratio) % 64 != 0 {
            return Err(ParseError::InvalidField {
                field: "inodes_ratio",
                reason: "blocks_in_group / inodes_ratio must be a multiple of 64",
            });
        }
        if self.crc != self.checksum() {
            return Err(ParseError::InvalidField {
                field: "crc",
                reason: "checksum mismatch",
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn inodes_per_group(&self) -> u32 {
        self.blocks_in_group / self.inodes_ratio
    }

    #[must_use]
    pub fn total_blocks(&self) -> u64 {
        u64::from(self.total_groups) * u64::from(self.blocks_in_group)
    }

    #[must_use]
    pub fn total_inodes(&self) -> u64 {
        u64::from(self.total_groups) * u64::from(self.inodes_per_group())
    }

    #[must_use]
    pub fn total_space(&self) -> u64 {
        self.total_blocks() * u64::from(self.block_size)
    }
}

// ── Group descriptor ────────────────────────────────────────────────────────

/// Per-group header following the superblock in each volume file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDescriptor {
    /// 1-based group number.
    pub group_id: u32,
}

impl GroupDescriptor {
    pub const ENCODED_LEN: usize = 4;

    #[must_use]
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        self.group_id.to_le_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            group_id: read_le_u32(data, 0)?,
        })
    }
}

// ── Inode ───────────────────────────────────────────────────────────────────

/// Fixed 112-byte inode record.
///
/// `blocks` counts allocated address slots: a big address occupies one
/// slot. `file_size` counts user bytes and excludes the metadata stored
/// at the head of direct block 0. Pointer value 0 means "none"; the
/// trailing 32 bytes of the record are reserved and zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Inode {
    /// Slot reuse counter; bumped on every allocation of this slot.
    pub seq: u32,
    pub attr: u16,
    /// Encoded metadata length at the start of direct block 0.
    pub meta_size: u16,
    pub blocks: u32,
    pub file_size: u64,
    pub ctime: u64,
    pub mtime: u64,
    pub direct: [u32; DIRECT_BLOCKS],
    pub single_indirect: u32,
    pub double_indirect: u32,
    pub triple_indirect: u32,
}

impl Inode {
    pub const ENCODED_LEN: usize = 112;

    #[must_use]
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[0..4].copy_from_slice(&self.seq.to_le_bytes());
        buf[4..6].copy_from_slice(&self.attr.to_le_bytes());
        buf[6..8].copy_from_slice(&self.meta_size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.blocks.to_le_bytes());
        buf[12..20].copy_from_slice(&self.file_size.to_le_bytes());
        buf[20..28].copy_from_slice(&self.ctime.to_le_bytes());
        buf[28..36].copy_from_slice(&self.mtime.to_le_bytes());
        for (i, ptr) in self.direct.iter().enumerate() {
            buf[36 + i * 4..40 + i * 4].copy_from_slice(&ptr.to_le_bytes());
        }
        buf[68..72].copy_from_slice(&self.single_indirect.to_le_bytes());
        buf[72..76].copy_from_slice(&self.double_indirect.to_le_bytes());
        buf[76..80].copy_from_slice(&self.triple_indirect.to_le_bytes());
        // Bytes 80..112 are reserved.
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        let mut direct = [0u32; DIRECT_BLOCKS];
        for (i, slot) in direct.iter_mut().enumerate() {
            *slot = read_le_u32(data, 36 + i * 4)?;
        }
        Ok(Self {
            seq: read_le_u32(data, 0)?,
            attr: read_le_u16(data, 4)?,
            meta_size: read_le_u16(data, 6)?,
            blocks: read_le_u32(data, 8)?,
            file_size: read_le_u64(data, 12)?,
            ctime: read_le_u64(data, 20)?,
            mtime: read_le_u64(data, 28)?,
            direct,
            single_indirect: read_le_u32(data, 68)?,
            double_indirect: read_le_u32(data, 72)?,
            triple_indirect: read_le_u32(data, 76)?,
        })
    }

    /// Bytes stored in the data area: metadata plus user content.
    #[must_use]
    pub fn data_size(&self) -> u64 {
        u64::from(self.meta_size) + self.file_size
    }
}

// ── File metadata ───────────────────────────────────────────────────────────

/// Name and opaque extended metadata stored at the head of a file's first
/// data block.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    pub ext: Vec<u8>,
}

impl FileMeta {
    /// Encode as `name_len u32 | name | ext_len u32 | ext`, zero-padded
    /// to a multiple of 16 bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.name.len() + self.ext.len() + FILE_META_ALIGN);
        buf.extend_from_slice(&(self.name.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        buf.extend_from_slice(&(self.ext.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.ext);
        let padding = FILE_META_ALIGN - buf.len() % FILE_META_ALIGN;
        if padding != FILE_META_ALIGN {
            buf.resize(buf.len() + padding, 0);
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        let name_len = read_le_u32(data, 0)? as usize;
        if name_len >= MAX_FILE_META_SIZE {
            return Err(ParseError::InvalidField {
                field: "name_len",
                reason: "exceeds metadata limit",
            });
        }
        let name_bytes = pfs_types::ensure_slice(data, 4, name_len)?;
        let name = String::from_utf8_lossy(name_bytes).into_owned();

        let ext_off = 4 + name_len;
        let ext_len = read_le_u32(data, ext_off)? as usize;
        if ext_len > MAX_FILE_META_SIZE {
            return Err(ParseError::InvalidField {
                field: "ext_len",
                reason: "exceeds metadata limit",
            });
        }
        let ext = pfs_types::ensure_slice(data, ext_off + 4, ext_len)?.to_vec();

        Ok(Self { name, ext })
    }
}

// ── UID codec ───────────────────────────────────────────────────────────────

/// Decoded form of the 28-hex-character file UID.
///
/// `shard(4) | inodeptr(8) | seq(8) | stamp(8)`, big-endian field order.
/// A UID survives only as long as the inode keeps its `seq`: slot reuse
/// after delete bumps `seq` and invalidates prior UIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileKey {
    pub shard: u16,
    pub inodeptr: u32,
    pub seq: u32,
    pub stamp: u32,
}

pub const UID_LEN: usize = 28;

impl FileKey {
    #[must_use]
    pub fn to_uid(&self) -> String {
        format!(
            "{:04x}{:08x}{:08x}{:08x}",
            self.shard, self.inodeptr, self.seq, self.stamp
        )
    }

    pub fn parse(uid: &str) -> Result<Self, ParseError> {
        if uid.len() != UID_LEN || !uid.is_ascii() {
            return Err(ParseError::InvalidField {
                field: "uid",
                reason: "must be 28 hex characters",
            });
        }
        let field = |range: std::ops::Range<usize>| {
            u32::from_str_radix(&uid[range], 16).map_err(|_| ParseError::InvalidField {
                field: "uid",
                reason: "must be 28 hex characters",
            })
        };
        Ok(Self {
            shard: field(0..4)? as u16,
            inodeptr: field(4..12)?,
            seq: field(12..20)?,
            stamp: field(20..28)?,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
