//! When a chunk is free nobody else is using its bytes, so we store the free
//! list right inside the chunks themselves. A free chunk looks like this:
//!
//! ```text
//! +----------------------------+ <- Chunk base, also the list node address.
//! | size (including header)    | <--+
//! +----------------------------+    | FreeChunk struct.
//! | pointer to next free chunk | <--+
//! +----------------------------+
//! |     Unused content         |
//! |          ......            |
//! +----------------------------+
//! ```
//!
//! The first word is shared with [`crate::header::Header`], so switching a
//! chunk between allocated and free only means writing or ignoring `next`.
//!
//! The list is singly linked and kept sorted by address. Sorting by address is
//! what makes coalescing cheap: two chunks can only be physically adjacent if
//! they are neighbours in the list.
//!
//! ```text
//!          +-----------------------------+      +------------------+
//!          |                             |      |                  |
//! +--------|--+-------+-------+--------+-|------|--+-------+-------|--+
//! | Free (A)  | Alloc | Alloc | Free (B)  | Alloc | Free (C)  | ...   |
//! +-----------+-------+-------+-----------+-------+-----------+-------+
//!       ^
//!       +--- Head. A < B < C always holds.
//! ```

use std::{mem, ptr::NonNull};

use crate::{header::HEADER_SIZE, Pointer};

/// Smallest chunk that can live on the free list: the header plus the `next`
/// pointer.
pub const MIN_CHUNK_SIZE: usize = mem::size_of::<FreeChunk>();

const _: () = assert!(MIN_CHUNK_SIZE == HEADER_SIZE + mem::size_of::<Pointer<FreeChunk>>());

/// Free list node, overlaid on the first bytes of a free chunk.
#[repr(C)]
pub(crate) struct FreeChunk {
    /// Total chunk size in bytes, header included.
    pub size: usize,
    /// Next free chunk, always at a higher address.
    pub next: Pointer<FreeChunk>,
}

/// Address sorted list of free chunks. The list owns nothing, it only links
/// memory that belongs to pages the allocator mapped.
pub(crate) struct FreeList {
    pub head: Pointer<FreeChunk>,
}

impl FreeList {
    pub const fn new() -> Self {
        Self { head: None }
    }

    /// Writes a free chunk node of `size` bytes at `address` and links it in
    /// address order.
    ///
    /// # Safety
    ///
    /// `address` must be word aligned, point to at least `size` bytes that we
    /// own, and not overlap any chunk already on the list. `size` must be at
    /// least [`MIN_CHUNK_SIZE`].
    pub unsafe fn insert_chunk(&mut self, address: NonNull<u8>, size: usize) -> NonNull<FreeChunk> {
        let chunk = address.cast::<FreeChunk>();
        chunk.as_ptr().write(FreeChunk { size, next: None });
        self.insert(chunk);

        chunk
    }

    /// Links `chunk` in address order. There are three cases:
    ///
    /// 1. The list is empty, `chunk` becomes the head.
    /// 2. `chunk` is located before the head, so it's prepended.
    /// 3. Otherwise walk until the end or until `prev < chunk < prev.next` and
    ///    splice it in there.
    ///
    /// # Safety
    ///
    /// `chunk` must be a valid node that is not already on the list.
    pub unsafe fn insert(&mut self, mut chunk: NonNull<FreeChunk>) {
        let Some(head) = self.head else {
            chunk.as_mut().next = None;
            self.head = Some(chunk);
            return;
        };

        if chunk < head {
            chunk.as_mut().next = Some(head);
            self.head = Some(chunk);
            return;
        }

        let mut current = head;

        loop {
            match current.as_ref().next {
                Some(next) if next < chunk => current = next,
                next => {
                    chunk.as_mut().next = next;
                    current.as_mut().next = Some(chunk);
                    return;
                }
            }
        }
    }

    /// Unlinks `chunk` given its predecessor on the list, or `None` if
    /// `chunk` is the head.
    ///
    /// # Safety
    ///
    /// `previous` must be the node linked right before `chunk`.
    pub unsafe fn unlink(&mut self, previous: Pointer<FreeChunk>, chunk: NonNull<FreeChunk>) {
        let next = chunk.as_ref().next;

        match previous {
            Some(mut previous) => previous.as_mut().next = next,
            None => self.head = next,
        }
    }

    /// Best fit search. Returns the smallest chunk that can hold `size` bytes
    /// together with its predecessor, or `None` if nothing fits. When several
    /// chunks share the minimum size the one with the lowest address wins.
    pub unsafe fn best_fit(
        &self,
        size: usize,
    ) -> Option<(Pointer<FreeChunk>, NonNull<FreeChunk>)> {
        let mut best: Option<(Pointer<FreeChunk>, NonNull<FreeChunk>)> = None;
        let mut previous = None;
        let mut current = self.head;

        while let Some(chunk) = current {
            let chunk_size = chunk.as_ref().size;

            let better = match best {
                Some((_, best_chunk)) => chunk_size < best_chunk.as_ref().size,
                None => true,
            };

            if chunk_size >= size && better {
                best = Some((previous, chunk));

                if chunk_size == size {
                    break;
                }
            }

            previous = current;
            current = chunk.as_ref().next;
        }

        best
    }

    /// Merges every pair of physically adjacent chunks in one left to right
    /// pass. After a merge we stay on the same chunk because the grown chunk
    /// might now touch its new successor too.
    ///
    /// ```text
    /// +---------+---------+---------+         +-----------------------------+
    /// | Free A  | Free B  | Free C  |   -->   |           Free A            |
    /// +---------+---------+---------+         +-----------------------------+
    /// ```
    pub unsafe fn coalesce(&mut self) {
        let mut current = self.head;

        while let Some(mut chunk) = current {
            let Some(next) = chunk.as_ref().next else {
                break;
            };

            if Self::end_of(chunk) == next.as_ptr() as usize {
                let next = next.as_ref();
                chunk.as_mut().size += next.size;
                chunk.as_mut().next = next.next;
            } else {
                current = Some(next);
            }
        }
    }

    /// Whether every chunk is located strictly before its successor.
    pub unsafe fn is_sorted(&self) -> bool {
        self.iter()
            .all(|chunk| chunk.as_ref().next.map_or(true, |next| chunk < next))
    }

    /// Whether two physically adjacent chunks are both on the list. Only
    /// needed for testing, [`Self::coalesce`] never leaves any behind.
    #[cfg(test)]
    pub unsafe fn has_adjacent_chunks(&self) -> bool {
        self.iter().any(|chunk| {
            chunk
                .as_ref()
                .next
                .is_some_and(|next| Self::end_of(chunk) == next.as_ptr() as usize)
        })
    }

    /// Number of chunks on the list.
    pub unsafe fn len(&self) -> usize {
        self.iter().count()
    }

    /// Iterates over the nodes in address order.
    pub unsafe fn iter(&self) -> impl Iterator<Item = NonNull<FreeChunk>> + '_ {
        let mut current = self.head;

        std::iter::from_fn(move || {
            let chunk = current?;
            current = chunk.as_ref().next;
            Some(chunk)
        })
    }

    #[inline]
    unsafe fn end_of(chunk: NonNull<FreeChunk>) -> usize {
        chunk.as_ptr() as usize + chunk.as_ref().size
    }
}
