//! The block metadata codec and the boundary-tag walker.
//!
//! Every block in the heap starts with an 8-byte header word. [`Header`] is a
//! bit-packed view of that word: the low three bits carry the `A` (allocated)
//! and `P` (previous-allocated) flags, the remaining bits carry the payload
//! size. The functions below never store the flags as separate fields -
//! everything is read from and written into the same `u64`.
//!
//! Free blocks additionally carry a footer word mirroring their size at the
//! end of the payload; [`footer_offset`] and friends compute the byte offset
//! of that word (and of neighboring headers) from a header's offset alone.

/// A decoded block header: payload size plus the two status flags.
///
/// The low three bits of the backing word are reserved for flags (bit 2 is
/// currently unused); the size therefore is always a multiple of 8.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Header(u64);

const ALLOC_BIT: u64 = 1 << 0;
const PREV_ALLOC_BIT: u64 = 1 << 1;
const SIZE_MASK: u64 = !0x7;

impl Header {
    /// Build a header for a block of `size` bytes of payload with the given
    /// flags.
    pub(crate) const fn new(size: usize, alloc: bool, prev_alloc: bool) -> Self {
        let mut word = size as u64 & SIZE_MASK;
        if alloc {
            word |= ALLOC_BIT;
        }
        if prev_alloc {
            word |= PREV_ALLOC_BIT;
        }
        Self(word)
    }

    /// Decode a header from its raw in-memory representation.
    pub(crate) const fn from_raw(word: u64) -> Self {
        Self(word)
    }

    /// The raw in-memory representation of this header.
    pub(crate) const fn to_raw(self) -> u64 {
        self.0
    }

    /// The payload size in bytes (excludes the header word itself).
    pub(crate) const fn size(self) -> usize {
        (self.0 & SIZE_MASK) as usize
    }

    /// Whether this block is currently allocated (`A` flag).
    pub(crate) const fn is_alloc(self) -> bool {
        self.0 & ALLOC_BIT != 0
    }

    /// Whether the immediately preceding block is allocated (`P` flag).
    pub(crate) const fn is_prev_alloc(self) -> bool {
        self.0 & PREV_ALLOC_BIT != 0
    }

    /// Replace the payload size, preserving both flags.
    pub(crate) fn set_size(&mut self, size: usize) {
        self.0 = (self.0 & !SIZE_MASK) | (size as u64 & SIZE_MASK);
    }

    /// Set or clear the `A` flag, preserving everything else.
    pub(crate) fn set_alloc(&mut self, alloc: bool) {
        if alloc {
            self.0 |= ALLOC_BIT;
        } else {
            self.0 &= !ALLOC_BIT;
        }
    }

    /// Set or clear the `P` flag, preserving everything else.
    pub(crate) fn set_prev_alloc(&mut self, prev_alloc: bool) {
        if prev_alloc {
            self.0 |= PREV_ALLOC_BIT;
        } else {
            self.0 &= !PREV_ALLOC_BIT;
        }
    }
}

/// Offset of a header's payload, i.e. the first byte after the header word.
pub(crate) const fn payload_offset(header_offset: usize) -> usize {
    header_offset + 8
}

/// Offset of a block's footer, i.e. the last word of its payload.
///
/// Only meaningful for free blocks - allocated blocks have no footer.
pub(crate) fn footer_offset(header_offset: usize, header: Header) -> usize {
    header_offset + header.size()
}

/// Offset of the next block's header.
pub(crate) fn next_header_offset(header_offset: usize, header: Header) -> usize {
    header_offset + 8 + header.size()
}

/// Offset of the previous block's footer.
///
/// Only valid to call when `header.is_prev_alloc()` is `false`.
pub(crate) const fn prev_footer_offset(header_offset: usize) -> usize {
    header_offset - 8
}

/// Offset of the previous block's header, found via its footer.
///
/// Only valid to call when the current block's `P` flag is clear.
pub(crate) fn prev_header_offset(header_offset: usize, prev_footer: Header) -> usize {
    header_offset - 8 - prev_footer.size()
}

/// The header offset that owns a given payload offset.
pub(crate) const fn header_offset_of_payload(payload_offset: usize) -> usize {
    payload_offset - 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_size_and_flags() {
        let h = Header::new(136, true, false);
        assert_eq!(h.size(), 136);
        assert!(h.is_alloc());
        assert!(!h.is_prev_alloc());
    }

    #[test]
    fn mutators_preserve_other_fields() {
        let mut h = Header::new(40, false, true);
        h.set_alloc(true);
        assert_eq!(h.size(), 40);
        assert!(h.is_alloc());
        assert!(h.is_prev_alloc());

        h.set_size(56);
        assert_eq!(h.size(), 56);
        assert!(h.is_alloc());
        assert!(h.is_prev_alloc());

        h.set_prev_alloc(false);
        assert_eq!(h.size(), 56);
        assert!(h.is_alloc());
        assert!(!h.is_prev_alloc());
    }

    #[test]
    fn raw_round_trip() {
        let h = Header::new(264, true, true);
        assert_eq!(Header::from_raw(h.to_raw()), h);
    }

    #[test]
    fn walker_arithmetic() {
        let header_offset = 8;
        let header = Header::new(40, false, false);
        assert_eq!(payload_offset(header_offset), 16);
        assert_eq!(footer_offset(header_offset, header), 48);
        assert_eq!(next_header_offset(header_offset, header), 56);

        let next_offset = next_header_offset(header_offset, header);
        assert_eq!(prev_footer_offset(next_offset), footer_offset(header_offset, header));
        assert_eq!(prev_header_offset(next_offset, header), header_offset);
    }
}
