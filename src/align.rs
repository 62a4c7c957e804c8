use std::mem;

/// Machine word size in bytes. Chunk sizes are always a multiple of this
/// value so that every header lands on an aligned address.
pub(crate) const WORD_SIZE: usize = mem::size_of::<usize>();

/// Rounds `size` up to the next multiple of [`WORD_SIZE`], or returns `None`
/// if the result doesn't fit in a `usize`.
///
/// ```text
/// 64 bit machine: align(13) == 16, align(16) == 16, align(17) == 24
/// 32 bit machine: align(11) == 12, align(12) == 12, align(13) == 16
/// ```
#[inline]
pub(crate) fn align(size: usize) -> Option<usize> {
    Some(size.checked_add(WORD_SIZE - 1)? & !(WORD_SIZE - 1))
}
