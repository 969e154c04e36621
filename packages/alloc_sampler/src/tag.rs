//! In-band marking of sampled blocks.
//!
//! A sampled block is allocated with a header in front of the client-visible address. The word
//! immediately before the client address holds [`MAGIC_TAG`], which lets the free and realloc
//! hooks recognize sampled blocks without a map lookup. All pointer arithmetic on headers lives
//! in this module.

use std::alloc::Layout;
use std::ptr;

/// Written into the word immediately before the client address of every sampled block.
pub(crate) const MAGIC_TAG: usize = 0x1469_0ca5;

/// Header size used for allocations that need no more than this alignment. Keeps the client
/// address aligned to 16 bytes, like the allocations it stands in for.
pub(crate) const MIN_HEADER_SIZE: usize = 16;

const TAG_SIZE: usize = size_of::<usize>();

/// The header to put in front of a block with the given alignment.
///
/// This is the smallest multiple of `align` that also fits the tag word, so the client address
/// keeps the requested alignment.
#[must_use]
pub(crate) const fn header_size(align: usize) -> usize {
    if align > MIN_HEADER_SIZE {
        align
    } else {
        MIN_HEADER_SIZE
    }
}

/// The layout the next allocator sees for a client layout padded by `offset` bytes.
///
/// Returns `None` if the padded size is not representable, in which case the caller must not
/// sample the allocation.
#[must_use]
pub(crate) fn padded_layout(layout: Layout, offset: usize) -> Option<Layout> {
    let size = layout.size().checked_add(offset)?;
    Layout::from_size_align(size, layout.align()).ok()
}

/// A block as the next allocator sees it (`raw`) plus the header in front of the client-visible
/// address.
///
/// An unsampled block has an `offset` of zero, so its raw and client addresses coincide.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct TaggedBlock {
    raw: *mut u8,
    offset: usize,
}

impl TaggedBlock {
    #[must_use]
    pub(crate) const fn new(raw: *mut u8, offset: usize) -> Self {
        Self { raw, offset }
    }

    /// A block that carries no header.
    #[must_use]
    pub(crate) const fn untagged(address: *mut u8) -> Self {
        Self::new(address, 0)
    }

    #[must_use]
    pub(crate) const fn raw(self) -> *mut u8 {
        self.raw
    }

    #[must_use]
    pub(crate) const fn offset(self) -> usize {
        self.offset
    }

    #[must_use]
    pub(crate) const fn is_padded(self) -> bool {
        self.offset != 0
    }

    /// Writes the tag in front of the client address and returns the client address.
    ///
    /// # Safety
    ///
    /// `raw` must point to a live block of at least `offset` bytes and `offset` must be at least
    /// the size of a `usize`.
    #[must_use]
    pub(crate) unsafe fn tag(self) -> *mut u8 {
        debug_assert!(self.offset >= TAG_SIZE);

        let client = self.raw.wrapping_add(self.offset);

        // SAFETY: The tag word lies within the header, which the caller guarantees is part of
        // the live block. Client addresses of over-aligned allocations are aligned, but we do not
        // rely on it.
        unsafe {
            ptr::write_unaligned(tag_word(client), MAGIC_TAG);
        }

        client
    }

    /// Clears the tag in front of `client` and returns the block it belongs to.
    ///
    /// # Safety
    ///
    /// `client` must have been returned by [`tag()`][Self::tag] with the same `offset` and the
    /// block must still be live.
    #[must_use]
    pub(crate) unsafe fn untag(client: *mut u8, offset: usize) -> Self {
        // SAFETY: Forwarding the caller's guarantee that the header is part of the live block.
        unsafe {
            ptr::write_unaligned(tag_word(client), 0);
        }

        Self::new(client.wrapping_sub(offset), offset)
    }
}

/// Whether the word in front of `client` holds the tag.
///
/// A match is a strong hint, not a proof: an unsampled block may by coincidence be preceded by the
/// same bit pattern. The sample store has the final say.
///
/// # Safety
///
/// The `usize` immediately before `client` must be readable. This holds for blocks returned by
/// the platform allocator, which keeps bookkeeping in front of each block.
#[must_use]
pub(crate) unsafe fn is_tagged(client: *const u8) -> bool {
    if client.is_null() {
        return false;
    }

    // SAFETY: Forwarding the caller's guarantee that the word is readable.
    let word = unsafe { ptr::read_unaligned(tag_word(client.cast_mut())) };

    word == MAGIC_TAG
}

fn tag_word(client: *mut u8) -> *mut usize {
    client.wrapping_sub(TAG_SIZE).cast::<usize>()
}
