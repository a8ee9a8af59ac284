//! Bitmap-delta segment merging.
//!
//! After a batch of bits has been flipped, the touched bytes of the
//! bitmap must be persisted. `merge_spans` collapses a list of freshly
//! changed addresses (sorted by bit index) into a minimal list of byte
//! spans so the delta goes to disk in as few positional writes as
//! possible.

use pfs_types::{EntAddr, BIG_ALLOC_BLOCKS};

/// A contiguous byte range within a bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Byte offset from the start of the bitmap.
    pub offset: usize,
    /// Length in bytes.
    pub length: usize,
}

/// Collapse sorted addresses into byte spans.
///
/// A single address contributes the one byte holding its bit; a big
/// address contributes 8 bytes starting at its bit's byte. Overlapping or
/// abutting contributions coalesce into one span. Also returns the number
/// of bits the addresses represent.
#[must_use]
pub fn merge_spans(addrs: &[EntAddr]) -> (Vec<Span>, usize) {
    let mut spans = Vec::new();
    let mut cur: Option<(usize, usize)> = None;
    let mut bits = 0usize;

    for addr in addrs {
        let (idx, _, big) = addr.parts();
        bits += if big { BIG_ALLOC_BLOCKS } else { 1 };
        let of = (idx / 8) as usize;
        match cur {
            None => {
                cur = Some((of, if big { 8 } else { 1 }));
            }
            Some((last_of, last_len)) => {
                if last_of + last_len > of {
                    if big {
                        cur = Some((last_of, last_len + 8));
                    }
                } else if last_of + last_len == of {
                    cur = Some((last_of, last_len + if big { 8 } else { 1 }));
                } else {
                    spans.push(Span {
                        offset: last_of,
                        length: last_len,
                    });
                    cur = Some((of, if big { 8 } else { 1 }));
                }
            }
        }
    }
    if let Some((offset, length)) = cur {
        spans.push(Span { offset, length });
    }
    (spans, bits)
}
