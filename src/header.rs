use std::{mem, ptr::NonNull};

/// Size in bytes of the header placed at the base of every chunk. Only the
/// `size` word survives while the chunk is allocated.
pub const HEADER_SIZE: usize = mem::size_of::<Header>();

/// Low bit of the stored size. Chunk sizes are multiples of the word size, so
/// this bit is free to mark chunks that were mapped on their own by the large
/// path.
const LARGE_TAG: usize = 1;

/// Header of an allocated chunk. Free chunks extend this with a `next`
/// pointer, see [`crate::freelist::FreeChunk`].
///
/// ```text
/// +----------------------------+ <- Chunk base.
/// | size (including header)    |
/// +----------------------------+ <- Address handed to the caller.
/// |        User content        |
/// |            ...             |
/// +----------------------------+
/// ```
#[repr(C)]
pub(crate) struct Header {
    word: usize,
}

impl Header {
    /// Writes a header for a chunk of `size` bytes carved from the free list.
    ///
    /// # Safety
    ///
    /// `chunk` must point to at least [`HEADER_SIZE`] writable, word aligned
    /// bytes.
    #[inline]
    pub unsafe fn write_small(chunk: NonNull<Self>, size: usize) {
        chunk.as_ptr().write(Self { word: size });
    }

    /// Writes a header for a chunk spanning `size` bytes of dedicated pages.
    ///
    /// # Safety
    ///
    /// Same as [`Self::write_small`].
    #[inline]
    pub unsafe fn write_large(chunk: NonNull<Self>, size: usize) {
        chunk.as_ptr().write(Self { word: size | LARGE_TAG });
    }

    /// Total chunk size in bytes, header included.
    #[inline]
    pub fn size(&self) -> usize {
        self.word & !LARGE_TAG
    }

    /// Whether this chunk bypassed the free list and owns its pages.
    #[inline]
    pub fn is_large(&self) -> bool {
        self.word & LARGE_TAG != 0
    }

    /// Returns the chunk header given the address we handed to the caller.
    ///
    /// # Safety
    ///
    /// `address` must point exactly [`HEADER_SIZE`] bytes past a chunk base,
    /// which holds for every address returned by
    /// [`crate::Allocator::allocate`]. Anything else is undefined behaviour.
    #[inline]
    pub unsafe fn from_content_address(address: NonNull<u8>) -> NonNull<Self> {
        NonNull::new_unchecked(address.as_ptr().sub(HEADER_SIZE).cast())
    }

    /// Returns the first address past the header of `chunk`.
    ///
    /// This is an associated function instead of a method so that we never
    /// create intermediate references to memory the caller owns.
    ///
    /// # Safety
    ///
    /// `chunk` must be the base of a chunk inside memory we mapped, with at
    /// least [`HEADER_SIZE`] bytes after it. Every chunk this crate creates
    /// satisfies that, since chunks are never smaller than
    /// [`crate::MIN_CHUNK_SIZE`].
    #[inline]
    pub unsafe fn content_address_of(chunk: NonNull<Self>) -> NonNull<u8> {
        NonNull::new_unchecked(chunk.as_ptr().cast::<u8>().add(HEADER_SIZE))
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn tag_does_not_leak_into_size() {
        let mut word = 0usize;
        let chunk = NonNull::from(&mut word).cast::<Header>();

        unsafe {
            Header::write_small(chunk, 24);
            assert_eq!(chunk.as_ref().size(), 24);
            assert!(!chunk.as_ref().is_large());

            Header::write_large(chunk, 8192);
            assert_eq!(chunk.as_ref().size(), 8192);
            assert!(chunk.as_ref().is_large());
        }
    }

    #[test]
    fn content_address_round_trip() {
        let mut words = [0usize; 4];
        let chunk = NonNull::from(&mut words).cast::<Header>();

        unsafe {
            let content = Header::content_address_of(chunk);
            assert_eq!(content.as_ptr() as usize - chunk.as_ptr() as usize, HEADER_SIZE);
            assert_eq!(Header::from_content_address(content), chunk);
        }
    }
}
