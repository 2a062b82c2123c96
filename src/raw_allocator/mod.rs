//! The free-space management engine: placement, coalescing, and the
//! invariants that tie them together.
//!
//! [`Heap`] is generic over a [`HeapProvider`] so it can run either against
//! [`StaticHeap`](crate::provider::StaticHeap) (the real, fixed-capacity
//! backing store used in `#[no_std]` binaries) or against a test double with
//! a deliberately tiny capacity (exhaustion tests, `spec.md` §8 scenario 6).
mod free_list;
mod header;

use crate::provider::HeapProvider;
use free_list::{index_for, FreeList, CLASSES};
use header::{
    footer_offset, header_offset_of_payload, next_header_offset, payload_offset, prev_footer_offset,
    prev_header_offset, Header,
};

/// Minimum payload size: next-pointer (8) + prev-pointer (8) + footer (8).
const MIN_PAYLOAD: usize = 24;
/// Quantization step between size classes.
const QUANTUM: usize = 16;
/// Smallest leftover (header + minimum payload) worth splitting off.
const MIN_SPLIT_LEFTOVER: usize = 32;
/// Size of a header or footer word.
const WORD: usize = 8;
/// The offset of the first real block, right after the 8-byte prologue.
const FIRST_BLOCK_OFFSET: usize = WORD;

/// The heap failed to obtain its initial prologue word from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapInitError;

/// A diagnosed invariant violation, as found by [`Heap::check`].
///
/// Mirrors `spec.md` §8's I1-I6 (plus I7, size lawfulness); each variant
/// names the offset of the offending block so a caller can correlate it with
/// the `line` passed to `check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapCorruption {
    /// Walking `next_header` from the first block did not land exactly on
    /// the tail anchor (I1).
    TilingMismatch,
    /// A block's `P` flag disagreed with its predecessor's `A` flag (I2).
    TagParity { at: usize },
    /// A free block's footer size disagreed with its header size (I3).
    FooterMismatch { at: usize },
    /// Two adjacent blocks were both free (I4).
    AdjacentFreeBlocks { at: usize },
    /// A free block was not reachable from the list selected by its size, or
    /// a reachable list node's size did not match its list (I5/I6).
    ListMembership { at: usize },
    /// A block's size violated the `(size - 8) % 16 == 0 && size >= 24` rule
    /// (I7).
    SizeUnlawful { at: usize },
}

/// The process-wide allocator state: free-list heads plus the tail anchor.
///
/// Every "pointer" the engine works with is a `usize` byte offset from the
/// provider's base address; offsets are only converted to real pointers at
/// the public boundary (`alloc`/`zero_alloc`'s return value and
/// `release`/`resize`'s input).
pub struct Heap<P> {
    provider: P,
    free_list: FreeList,
    /// Header offset of the highest-address block, or `0` (the prologue)
    /// when the heap holds no real blocks yet.
    tail: usize,
}

impl<P: HeapProvider> Heap<P> {
    /// Wrap a not-yet-initialized provider. Call [`init`](Self::init) before
    /// any other method.
    pub const fn new(provider: P) -> Self {
        Self {
            provider,
            free_list: FreeList::new(),
            tail: 0,
        }
    }

    /// Allocate the 8-byte prologue and reset all free lists.
    ///
    /// Must be called exactly once before any other method.
    pub fn init(&mut self) -> Result<(), HeapInitError> {
        let old_high = self.provider.extend(WORD).ok_or(HeapInitError)?;
        debug_assert_eq!(old_high, 0, "init must run against an empty provider");
        // The prologue is marked allocated so the first real block's `P`
        // flag can be set uniformly, with no special-cased underflow check.
        write_header(&mut self.provider, 0, Header::new(0, true, true));
        self.free_list = FreeList::new();
        self.tail = 0;
        Ok(())
    }

    /// Run [`init`](Self::init) on first use, so that `Allocator::new()` can
    /// stay a `const fn` that never touches the (non-`const`) provider.
    fn ensure_init(&mut self) -> Option<()> {
        if self.provider.high() == 0 {
            self.init().ok()?;
        }
        Some(())
    }

    /// Quantize a requested payload size to the smallest admissible block
    /// size `>= size` (`spec.md` §4.3 step 1). Returns `None` on overflow,
    /// treating an unrepresentable request the same as an unsatisfiable one.
    fn quantize(size: usize) -> Option<usize> {
        if size <= MIN_PAYLOAD {
            return Some(MIN_PAYLOAD);
        }
        let extra = size - MIN_PAYLOAD;
        let steps = extra.checked_add(QUANTUM - 1)? / QUANTUM;
        MIN_PAYLOAD.checked_add(QUANTUM.checked_mul(steps)?)
    }

    /// Find a free block of at least `q` bytes of payload, per the
    /// first-fit-within-class-then-promote search policy.
    fn find_fit(&self, q: usize) -> Option<usize> {
        for class in index_for(q)..CLASSES {
            if class <= 3 {
                // every block in these classes has exactly one admissible
                // size, so the head (if any) always fits.
                if let Some(head) = self.free_list.head(class) {
                    return Some(head);
                }
            } else {
                let mut cursor = self.free_list.head(class);
                while let Some(candidate) = cursor {
                    if read_header(&self.provider, candidate).size() >= q {
                        return Some(candidate);
                    }
                    cursor = self.free_list.next_in_class(&self.provider, candidate);
                }
            }
        }
        None
    }

    /// Allocate `size` bytes, returning the payload offset (not yet
    /// materialized to a pointer) of the selected block.
    fn alloc_offset(&mut self, size: usize) -> Option<usize> {
        self.ensure_init()?;
        if size == 0 {
            return None;
        }
        let q = Self::quantize(size)?;

        if let Some(b) = self.find_fit(q) {
            let b_header = read_header(&self.provider, b);
            let class = index_for(b_header.size());
            self.free_list.remove(&mut self.provider, b, class);

            let leftover = b_header.size() - q;
            if leftover >= MIN_SPLIT_LEFTOVER {
                let new_b_header = Header::new(q, true, b_header.is_prev_alloc());
                write_header(&mut self.provider, b, new_b_header);

                let r = next_header_offset(b, new_b_header);
                let r_size = leftover - WORD;
                let r_header = Header::new(r_size, false, true);
                write_header(&mut self.provider, r, r_header);
                write_footer(&mut self.provider, footer_offset(r, r_header), r_header);
                self.free_list.insert(&mut self.provider, r, index_for(r_size));

                if b == self.tail {
                    self.tail = r;
                }
            } else {
                let new_b_header = Header::new(b_header.size(), true, b_header.is_prev_alloc());
                write_header(&mut self.provider, b, new_b_header);

                if b != self.tail {
                    let next = next_header_offset(b, new_b_header);
                    let mut next_header = read_header(&self.provider, next);
                    next_header.set_prev_alloc(true);
                    write_header(&mut self.provider, next, next_header);
                }
            }
            return Some(payload_offset(b));
        }

        // extension fallback
        let tail_header = read_header(&self.provider, self.tail);
        let old_high = self.provider.extend(WORD + q)?;
        let new_header = Header::new(q, true, tail_header.is_alloc());
        write_header(&mut self.provider, old_high, new_header);
        self.tail = old_high;
        Some(payload_offset(old_high))
    }

    /// Allocate `size` bytes. Returns the null pointer on failure or on a
    /// zero-sized request.
    pub fn alloc(&mut self, size: usize) -> Option<*mut u8> {
        let offset = self.alloc_offset(size)?;
        #[cfg(feature = "trace")]
        log::trace!("alloc({size}) -> offset {offset}");
        // SAFETY: `offset` was just produced by a successful allocation, so
        // it is in-bounds for the provider.
        Some(unsafe { self.provider.as_mut_ptr(offset) })
    }

    /// Release a previously allocated payload. A no-op for the null pointer
    /// or any pointer outside the heap's current bounds; releasing an
    /// interior or already-released pointer is undefined behavior, per
    /// contract (`spec.md` §7).
    pub fn release(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let Some(payload) = self.provider.offset_of(ptr) else {
            return;
        };
        let h = header_offset_of_payload(payload);
        let header = read_header(&self.provider, h);
        let size = header.size();

        let next = next_header_offset(h, header);
        let next_free = h != self.tail && !read_header(&self.provider, next).is_alloc();
        let prev_free = !header.is_prev_alloc();

        match (prev_free, next_free) {
            (true, true) => {
                let prev_footer = read_header(&self.provider, prev_footer_offset(h));
                let l = prev_header_offset(h, prev_footer);
                let l_header = read_header(&self.provider, l);
                let r_header = read_header(&self.provider, next);

                self.free_list.remove(&mut self.provider, l, index_for(l_header.size()));
                self.free_list.remove(&mut self.provider, next, index_for(r_header.size()));

                let new_size = l_header.size() + size + r_header.size() + 2 * WORD;
                let new_header = Header::new(new_size, false, l_header.is_prev_alloc());
                write_header(&mut self.provider, l, new_header);
                write_footer(&mut self.provider, footer_offset(l, new_header), new_header);

                if next == self.tail {
                    self.tail = l;
                }
                self.free_list.insert(&mut self.provider, l, index_for(new_size));
            }
            (false, true) => {
                let r_header = read_header(&self.provider, next);
                self.free_list.remove(&mut self.provider, next, index_for(r_header.size()));

                let new_size = size + r_header.size() + WORD;
                let new_header = Header::new(new_size, false, header.is_prev_alloc());
                write_header(&mut self.provider, h, new_header);
                write_footer(&mut self.provider, footer_offset(h, new_header), new_header);

                if next == self.tail {
                    self.tail = h;
                }
                self.free_list.insert(&mut self.provider, h, index_for(new_size));
            }
            (true, false) => {
                let prev_footer = read_header(&self.provider, prev_footer_offset(h));
                let l = prev_header_offset(h, prev_footer);
                let l_header = read_header(&self.provider, l);
                self.free_list.remove(&mut self.provider, l, index_for(l_header.size()));

                let new_size = l_header.size() + size + WORD;
                let new_header = Header::new(new_size, false, l_header.is_prev_alloc());
                write_header(&mut self.provider, l, new_header);
                write_footer(&mut self.provider, footer_offset(l, new_header), new_header);

                if h == self.tail {
                    self.tail = l;
                } else {
                    let mut next_header = read_header(&self.provider, next);
                    next_header.set_prev_alloc(false);
                    write_header(&mut self.provider, next, next_header);
                }
                self.free_list.insert(&mut self.provider, l, index_for(new_size));
            }
            (false, false) => {
                let mut new_header = header;
                new_header.set_alloc(false);
                write_header(&mut self.provider, h, new_header);
                write_footer(&mut self.provider, footer_offset(h, new_header), new_header);

                if h != self.tail {
                    let mut next_header = read_header(&self.provider, next);
                    next_header.set_prev_alloc(false);
                    write_header(&mut self.provider, next, next_header);
                }
                self.free_list.insert(&mut self.provider, h, index_for(size));
            }
        }
        #[cfg(feature = "trace")]
        log::trace!("release(offset {payload})");
    }

    /// Resize a previously allocated payload to `new_size` bytes, preserving
    /// the first `min(new_size, old_size)` bytes. Null `old_ptr` behaves as
    /// `alloc`; `new_size == 0` behaves as `release` and returns `None`.
    pub fn resize(&mut self, old_ptr: *mut u8, new_size: usize) -> Option<*mut u8> {
        if old_ptr.is_null() {
            return self.alloc(new_size);
        }
        if new_size == 0 {
            self.release(old_ptr);
            return None;
        }
        let old_payload = self.provider.offset_of(old_ptr)?;
        let old_size = read_header(&self.provider, header_offset_of_payload(old_payload)).size();

        let new_ptr = self.alloc(new_size)?;
        let copy_len = core::cmp::min(new_size, old_size);
        // SAFETY: `old_ptr` is a live, caller-supplied payload of at least
        // `old_size` bytes; `new_ptr` was just allocated with at least
        // `new_size >= copy_len` bytes, and the two blocks never overlap
        // since `new_ptr` is either a fresh extension or an unrelated free
        // block.
        unsafe { core::ptr::copy_nonoverlapping(old_ptr, new_ptr, copy_len) };
        self.release(old_ptr);
        Some(new_ptr)
    }

    /// Allocate space for `count` elements of `size` bytes each and zero the
    /// whole allocated payload. Returns `None` on overflow or OOM.
    pub fn zero_alloc(&mut self, count: usize, size: usize) -> Option<*mut u8> {
        let total = count.checked_mul(size)?;
        let offset = self.alloc_offset(total)?;
        let n = read_header(&self.provider, header_offset_of_payload(offset)).size();
        // SAFETY: `offset` was just allocated with `n` live payload bytes.
        let ptr = unsafe { self.provider.as_mut_ptr(offset) };
        // SAFETY: `ptr` is valid for `n` bytes, as established above.
        unsafe { core::ptr::write_bytes(ptr, 0, n) };
        Some(ptr)
    }

    /// Self-audit: verify invariants I1-I7 by walking the heap and all free
    /// lists. `line` is an opaque caller-supplied tag (e.g. the call site)
    /// threaded into trace output for diagnosing *where* a check failed.
    pub fn check(&self, line: u32) -> Result<(), HeapCorruption> {
        let result = self.check_inner();
        if let Err(_err) = result {
            #[cfg(feature = "trace")]
            log::error!("heap check failed at line {line}: {_err:?}");
            #[cfg(not(feature = "trace"))]
            let _ = line;
        }
        result
    }

    fn check_inner(&self) -> Result<(), HeapCorruption> {
        let mut free_blocks_seen = 0usize;

        if self.tail == 0 {
            // no real blocks yet: either the lazily-initialized prologue
            // alone (`high() == WORD`), or a never-touched heap that hasn't
            // run `init` at all yet (`high() == 0`).
            if self.provider.high() != WORD && self.provider.high() != 0 {
                return Err(HeapCorruption::TilingMismatch);
            }
        } else {
            let mut offset = FIRST_BLOCK_OFFSET;
            let mut prev_was_free = false;
            let mut expected_prev_alloc = true; // prologue is allocated

            while offset != self.tail {
                if offset >= self.provider.high() {
                    return Err(HeapCorruption::TilingMismatch);
                }
                let header = read_header(&self.provider, offset);
                if header.size() < MIN_PAYLOAD || (header.size() - 8) % QUANTUM != 0 {
                    return Err(HeapCorruption::SizeUnlawful { at: offset });
                }
                if header.is_prev_alloc() != expected_prev_alloc {
                    return Err(HeapCorruption::TagParity { at: offset });
                }
                if !header.is_alloc() {
                    if prev_was_free {
                        return Err(HeapCorruption::AdjacentFreeBlocks { at: offset });
                    }
                    let footer = read_header(&self.provider, footer_offset(offset, header));
                    if footer.size() != header.size() {
                        return Err(HeapCorruption::FooterMismatch { at: offset });
                    }
                    free_blocks_seen += 1;
                }
                prev_was_free = !header.is_alloc();
                expected_prev_alloc = header.is_alloc();
                offset = next_header_offset(offset, header);
            }

            // the tail block itself
            let header = read_header(&self.provider, self.tail);
            if header.size() < MIN_PAYLOAD || (header.size() - 8) % QUANTUM != 0 {
                return Err(HeapCorruption::SizeUnlawful { at: self.tail });
            }
            if header.is_prev_alloc() != expected_prev_alloc {
                return Err(HeapCorruption::TagParity { at: self.tail });
            }
            if !header.is_alloc() {
                if prev_was_free {
                    return Err(HeapCorruption::AdjacentFreeBlocks { at: self.tail });
                }
                let footer = read_header(&self.provider, footer_offset(self.tail, header));
                if footer.size() != header.size() {
                    return Err(HeapCorruption::FooterMismatch { at: self.tail });
                }
                free_blocks_seen += 1;
            }
            let end = next_header_offset(self.tail, header);
            if end != self.provider.high() {
                return Err(HeapCorruption::TilingMismatch);
            }
        }

        let mut free_blocks_listed = 0usize;
        for class in 0..CLASSES {
            let mut cursor = self.free_list.head(class);
            while let Some(node) = cursor {
                let header = read_header(&self.provider, node);
                if header.is_alloc() || index_for(header.size()) != class {
                    return Err(HeapCorruption::ListMembership { at: node });
                }
                free_blocks_listed += 1;
                cursor = self.free_list.next_in_class(&self.provider, node);
            }
        }
        if free_blocks_listed != free_blocks_seen {
            return Err(HeapCorruption::ListMembership { at: self.tail });
        }

        Ok(())
    }
}

fn read_header(provider: &impl HeapProvider, offset: usize) -> Header {
    // SAFETY: callers only ever pass header offsets that were previously
    // established to lie within `[0, provider.high())` by the heap's own
    // bookkeeping.
    Header::from_raw(unsafe { provider.read_word(offset) })
}

fn write_header(provider: &mut impl HeapProvider, offset: usize, header: Header) {
    // SAFETY: see `read_header`.
    unsafe { provider.write_word(offset, header.to_raw()) };
}

fn write_footer(provider: &mut impl HeapProvider, offset: usize, header: Header) {
    // SAFETY: see `read_header`.
    unsafe { provider.write_word(offset, header.to_raw()) };
}
