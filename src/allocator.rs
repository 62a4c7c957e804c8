use std::{error::Error, fmt, mem, ptr::NonNull};

use log::{debug, error};

use crate::{
    align::align,
    freelist::{FreeList, MIN_CHUNK_SIZE},
    header::{Header, HEADER_SIZE},
    platform::{map_pages, pages_for, unmap_pages, PAGE_SIZE},
    AllocResult,
};

/// Reasons why [`Allocator::allocate`] could not hand out memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Zero byte requests are rejected without doing any work.
    ZeroSize,
    /// Adding the chunk header to the requested size overflows `usize`.
    SizeOverflow { size: usize },
    /// The kernel refused to map `pages` more pages.
    MapFailed { pages: usize },
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::ZeroSize => write!(f, "cannot allocate zero bytes"),
            AllocError::SizeOverflow { size } => {
                write!(f, "allocation of {size} bytes overflows the chunk size")
            }
            AllocError::MapFailed { pages } => write!(f, "failed to map {pages} page(s)"),
        }
    }
}

impl Error for AllocError {}

/// Monotonic counters describing what the allocator has done so far. They
/// are purely observational.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    pub pages_mapped: usize,
    pub pages_unmapped: usize,
    pub chunks_allocated: usize,
    pub chunks_freed: usize,
    /// Number of chunks currently on the free list.
    pub free_length: usize,
}

/// Page backed general purpose allocator. Memory is obtained from the kernel
/// one page at a time and carved into chunks using best fit over a free list
/// sorted by address:
///
/// ```text
///                Next Free Chunk                            Next Free Chunk
///          +----------------------------+        +-------------------------------+
///          |                            |        |                               |
/// +--------|--+-------+-------+---------|--+     |  +-------+-----------+-------|---+
/// |   Free    | Alloc | Alloc |   Free    | ----+  | Alloc |   Alloc   |   Free    |
/// +-----------+-------+-------+-----------+        +-------+-----------+-----------+
///   page 1 (PAGE_SIZE bytes)                        page 2 (PAGE_SIZE bytes)
/// ```
///
/// Requests that don't fit in a single page once the header is added take the
/// large path instead: they get their own run of pages, never touch the free
/// list and are unmapped as soon as they are deallocated.
///
/// Small pages are never returned to the kernel while the allocator is alive.
/// [`Allocator::destroy`] (or dropping the allocator) unmaps every page still
/// mapped, which invalidates every address handed out so far.
///
/// This struct is not thread safe, callers that share it must provide their
/// own mutual exclusion.
pub struct Allocator {
    /// Address sorted free chunks, see [`crate::freelist`].
    free_list: FreeList,
    statistics: Statistics,
    /// Base address of every page mapped for the small path.
    pages: Vec<NonNull<u8>>,
    /// Large chunks that haven't been deallocated yet.
    large_chunks: Vec<NonNull<Header>>,
}

impl Allocator {
    /// Builds an allocator with an empty free list and zeroed statistics. No
    /// pages are mapped until memory is requested.
    pub const fn new() -> Self {
        Self {
            free_list: FreeList::new(),
            statistics: Statistics {
                pages_mapped: 0,
                pages_unmapped: 0,
                chunks_allocated: 0,
                chunks_freed: 0,
                free_length: 0,
            },
            pages: Vec::new(),
            large_chunks: Vec::new(),
        }
    }

    /// Returns an address where `size` bytes can be written, aligned to the
    /// machine word. Pages are mapped as needed.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use heapyard::Allocator;
    ///
    /// let mut allocator = Allocator::new();
    ///
    /// let address = allocator.allocate(14).unwrap();
    ///
    /// unsafe {
    ///     address.as_ptr().copy_from(b"Hello, world!\0".as_ptr(), 14);
    ///     allocator.deallocate(address);
    /// }
    ///
    /// let statistics = allocator.statistics();
    /// assert_eq!(statistics.pages_mapped, 1);
    /// assert_eq!(statistics.chunks_allocated, statistics.chunks_freed);
    /// assert_eq!(statistics.free_length, 1);
    /// ```
    pub fn allocate(&mut self, size: usize) -> AllocResult {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }

        let chunk_size = size
            .checked_add(HEADER_SIZE)
            .and_then(align)
            .ok_or(AllocError::SizeOverflow { size })?;

        let chunk = unsafe {
            if chunk_size > PAGE_SIZE {
                self.allocate_large(chunk_size)?
            } else {
                self.allocate_small(chunk_size)?
            }
        };

        self.statistics.chunks_allocated += 1;

        Ok(unsafe { Header::content_address_of(chunk) })
    }

    /// Gives the chunk at `address` back. Small chunks go back on the free
    /// list, which is then coalesced. Large chunks are unmapped right away.
    ///
    /// # Safety
    ///
    /// `address` must have been returned by [`Self::allocate`] on this same
    /// allocator and must not have been deallocated already.
    pub unsafe fn deallocate(&mut self, address: NonNull<u8>) {
        let chunk = Header::from_content_address(address);
        self.statistics.chunks_freed += 1;

        if chunk.as_ref().is_large() {
            self.deallocate_large(chunk);
            return;
        }

        let size = chunk.as_ref().size();
        self.free_list.insert_chunk(chunk.cast(), size);
        self.free_list.coalesce();

        if !self.free_list.is_sorted() {
            error!("[internal error] the free list is not sorted by address after coalescing");
        }
    }

    /// Snapshot of the allocator counters.
    pub fn statistics(&self) -> Statistics {
        Statistics {
            free_length: unsafe { self.free_list.len() },
            ..self.statistics
        }
    }

    /// Iterates over the free list in address order, yielding the base
    /// address and total size of each free chunk.
    pub fn free_chunks(&self) -> impl Iterator<Item = (NonNull<u8>, usize)> + '_ {
        unsafe { self.free_list.iter() }.map(|chunk| (chunk.cast(), unsafe { chunk.as_ref().size }))
    }

    /// Unmaps every page this allocator still holds and returns the final
    /// statistics. Every address handed out by [`Self::allocate`] becomes
    /// dangling.
    pub fn destroy(mut self) -> Statistics {
        self.release_all();
        self.statistics()
    }

    /// Best fit over the free list. If nothing fits we map another page and
    /// try again, which always succeeds because a fresh page is at least as
    /// big as any small chunk. The chosen chunk is split when the leftover is
    /// big enough to live on the free list by itself.
    ///
    /// ```text
    /// Before:
    /// +---------------------------------------------+
    /// |                 Free chunk                  |
    /// +---------------------------------------------+
    ///
    /// After:
    /// +-------------------+-------------------------+
    /// | Chunk (size) used | Free chunk (remainder)  |
    /// +-------------------+-------------------------+
    /// ```
    unsafe fn allocate_small(&mut self, size: usize) -> Result<NonNull<Header>, AllocError> {
        let (previous, chunk) = loop {
            if let Some(found) = self.free_list.best_fit(size) {
                break found;
            }

            self.add_page()?;
        };

        self.free_list.unlink(previous, chunk);

        let mut chunk_size = chunk.as_ref().size;
        let excess = chunk_size - size;

        if excess > MIN_CHUNK_SIZE {
            let remainder = NonNull::new_unchecked(chunk.as_ptr().cast::<u8>().add(size));
            self.free_list.insert_chunk(remainder, excess);
            chunk_size = size;

            debug!("split chunk at {chunk:p}: {size} bytes used, {excess} bytes back on the free list");
        }

        let header = chunk.cast::<Header>();
        Header::write_small(header, chunk_size);

        Ok(header)
    }

    /// Maps one page and puts it on the free list as a single chunk. The
    /// kernel often maps pages right next to each other, so the new chunk is
    /// coalesced with whatever free chunk touches it.
    unsafe fn add_page(&mut self) -> Result<(), AllocError> {
        let page = match map_pages(1) {
            Ok(page) => page,
            Err(err) => {
                error!("[internal error] failed to map a page: {err}");
                return Err(AllocError::MapFailed { pages: 1 });
            }
        };

        self.pages.push(page);
        self.free_list.insert_chunk(page, PAGE_SIZE);
        self.free_list.coalesce();
        self.statistics.pages_mapped += 1;

        debug!("mapped page at {page:p}");

        Ok(())
    }

    /// Maps enough contiguous pages for `size` bytes. The whole run becomes
    /// one chunk whose header is the only bookkeeping we keep in it.
    unsafe fn allocate_large(&mut self, size: usize) -> Result<NonNull<Header>, AllocError> {
        let pages = pages_for(size);

        let base = match map_pages(pages) {
            Ok(base) => base,
            Err(err) => {
                error!("[internal error] failed to map {pages} large page(s): {err}");
                return Err(AllocError::MapFailed { pages });
            }
        };

        let chunk = base.cast::<Header>();
        Header::write_large(chunk, pages * PAGE_SIZE);

        self.large_chunks.push(chunk);
        self.statistics.pages_mapped += pages;

        debug!("mapped {pages} large page(s) at {base:p}");

        Ok(chunk)
    }

    unsafe fn deallocate_large(&mut self, chunk: NonNull<Header>) {
        let pages = chunk.as_ref().size() / PAGE_SIZE;

        if self.unmap(chunk.cast(), pages) {
            if let Some(index) = self.large_chunks.iter().position(|large| *large == chunk) {
                self.large_chunks.swap_remove(index);
            }
        }
    }

    /// Unmaps `pages` pages at `base` and records it. Failures are only
    /// logged, the pages stay mapped.
    unsafe fn unmap(&mut self, base: NonNull<u8>, pages: usize) -> bool {
        match unmap_pages(base, pages) {
            Ok(()) => {
                self.statistics.pages_unmapped += pages;
                debug!("unmapped {pages} page(s) at {base:p}");
                true
            }
            Err(err) => {
                error!("[internal error] failed to unmap {pages} page(s) at {base:p}: {err}");
                false
            }
        }
    }

    /// Returns every page we still hold to the kernel. The free list points
    /// into those pages, so it's emptied first.
    fn release_all(&mut self) {
        self.free_list = FreeList::new();

        unsafe {
            for chunk in mem::take(&mut self.large_chunks) {
                let pages = chunk.as_ref().size() / PAGE_SIZE;
                self.unmap(chunk.cast(), pages);
            }

            for page in mem::take(&mut self.pages) {
                self.unmap(page, 1);
            }
        }
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{ptr, slice};

    use test_log::test;

    use super::*;

    /// Checks every free list invariant the allocator promises.
    fn verify_free_list(allocator: &Allocator) {
        unsafe {
            assert!(allocator.free_list.is_sorted());
            assert!(!allocator.free_list.has_adjacent_chunks());
        }

        for (_, size) in allocator.free_chunks() {
            assert!(size >= MIN_CHUNK_SIZE);
            assert_eq!(size % mem::size_of::<usize>(), 0);
        }

        let statistics = allocator.statistics();
        assert!(statistics.pages_unmapped <= statistics.pages_mapped);
    }

    fn free_sizes(allocator: &Allocator) -> Vec<usize> {
        allocator.free_chunks().map(|(_, size)| size).collect()
    }

    #[test]
    fn split_and_coalesce_round_trip() {
        let mut allocator = Allocator::new();
        let message = b"Hello, world!\0";

        let address = allocator.allocate(message.len()).unwrap();
        let chunk_size = align(message.len() + HEADER_SIZE).unwrap();

        unsafe {
            address.as_ptr().copy_from(message.as_ptr(), message.len());
        }

        // The page was split: the first chunk is ours, the rest is free.
        let page = unsafe { address.as_ptr().sub(HEADER_SIZE) };
        let free: Vec<(usize, usize)> = allocator
            .free_chunks()
            .map(|(base, size)| (base.as_ptr() as usize, size))
            .collect();
        assert_eq!(free, [(page as usize + chunk_size, PAGE_SIZE - chunk_size)]);

        unsafe {
            let written = slice::from_raw_parts(address.as_ptr(), message.len());
            assert_eq!(written, message);
            allocator.deallocate(address);
        }

        // Coalescing restores the whole page.
        let free: Vec<(*mut u8, usize)> = allocator
            .free_chunks()
            .map(|(base, size)| (base.as_ptr(), size))
            .collect();
        assert_eq!(free, [(page, PAGE_SIZE)]);

        assert_eq!(
            allocator.statistics(),
            Statistics {
                pages_mapped: 1,
                pages_unmapped: 0,
                chunks_allocated: 1,
                chunks_freed: 1,
                free_length: 1,
            }
        );
    }

    #[test]
    fn best_fit_reuses_smallest_hole() {
        let mut allocator = Allocator::new();
        let mut holes = Vec::new();
        let mut separators = Vec::new();

        // Chunk sizes (header included) of the holes we are going to punch,
        // each one followed by a used chunk so that they can't be coalesced.
        for size in [104, 200, 152] {
            holes.push(allocator.allocate(size - HEADER_SIZE).unwrap());
            separators.push(allocator.allocate(1).unwrap());
        }

        unsafe {
            for address in &holes {
                allocator.deallocate(*address);
            }
        }

        let rest = PAGE_SIZE - (104 + 200 + 152) - 3 * align(1 + HEADER_SIZE).unwrap();
        assert_eq!(free_sizes(&allocator), [104, 200, 152, rest]);

        // 120 bytes including the header fits in 200 and 152, best fit is 152.
        let address = allocator.allocate(120 - HEADER_SIZE).unwrap();
        assert_eq!(address, holes[2]);

        // The 32 byte leftover is big enough to go back on the free list.
        assert_eq!(free_sizes(&allocator), [104, 200, 32, rest]);
        assert_eq!(allocator.statistics().pages_mapped, 1);
        verify_free_list(&allocator);
    }

    #[test]
    fn small_leftovers_stay_in_the_chunk() {
        let mut allocator = Allocator::new();

        let hole = allocator.allocate(64 - HEADER_SIZE).unwrap();
        let _separator = allocator.allocate(1).unwrap();

        unsafe { allocator.deallocate(hole) };

        // 64 - 48 = 16 bytes left, not more than the minimum chunk size, so
        // the caller gets the whole 64 byte chunk.
        let address = allocator.allocate(48 - HEADER_SIZE).unwrap();
        assert_eq!(address, hole);

        let header = unsafe { Header::from_content_address(address).as_ref() };
        assert_eq!(header.size(), 64);
        assert!(!free_sizes(&allocator).contains(&16));
    }

    #[test]
    fn full_page_chunk_and_new_page() {
        let mut allocator = Allocator::new();

        let first = allocator.allocate(PAGE_SIZE - HEADER_SIZE).unwrap();
        assert_eq!(allocator.statistics().pages_mapped, 1);
        assert_eq!(allocator.statistics().free_length, 0);

        let second = allocator.allocate(1).unwrap();
        assert_eq!(allocator.statistics().pages_mapped, 2);

        unsafe {
            ptr::write_bytes(first.as_ptr(), 7, PAGE_SIZE - HEADER_SIZE);
            *second.as_ptr() = 9;

            allocator.deallocate(second);
            assert!(slice::from_raw_parts(first.as_ptr(), PAGE_SIZE - HEADER_SIZE)
                .iter()
                .all(|byte| *byte == 7));
            allocator.deallocate(first);
        }

        verify_free_list(&allocator);
        let free: usize = free_sizes(&allocator).iter().sum();
        assert_eq!(free, 2 * PAGE_SIZE);
    }

    #[test]
    fn new_pages_are_coalesced_with_free_neighbours() {
        let mut allocator = Allocator::new();

        // Fill the first page completely.
        let _first = allocator.allocate(PAGE_SIZE - HEADER_SIZE).unwrap();

        // Carve the second page in two and free the chunk at its base.
        let head = allocator.allocate(800 - HEADER_SIZE).unwrap();
        let _tail = allocator.allocate(PAGE_SIZE - 800 - HEADER_SIZE).unwrap();
        unsafe { allocator.deallocate(head) };
        assert_eq!(free_sizes(&allocator), [800]);

        // Doesn't fit in the hole, so a third page is mapped. If the kernel
        // places it right before the second page it must merge with the hole.
        let address = allocator.allocate(3000).unwrap();
        assert_eq!(allocator.statistics().pages_mapped, 3);
        verify_free_list(&allocator);

        unsafe { ptr::write_bytes(address.as_ptr(), 1, 3000) };
        verify_free_list(&allocator);
    }

    #[test]
    fn small_chunks_spanning_two_pages_stay_on_the_free_list() {
        let mut allocator = Allocator::new();

        // First page: [4064 | 32].
        let low_head = allocator.allocate(4064 - HEADER_SIZE).unwrap();
        let low_tail = allocator.allocate(32 - HEADER_SIZE).unwrap();

        // Map the second page as a whole to learn where it landed.
        let whole = allocator.allocate(PAGE_SIZE - HEADER_SIZE).unwrap();
        let first_page = low_head.as_ptr() as usize - HEADER_SIZE;
        let second_page = whole.as_ptr() as usize - HEADER_SIZE;
        unsafe { allocator.deallocate(whole) };

        // Carve the second page so that the two chunks touching the page
        // boundary add up to PAGE_SIZE + 8 bytes.
        let (left, right) = if second_page == first_page + PAGE_SIZE {
            // [4064 | 32][4072 | 24]
            let head = allocator.allocate(4072 - HEADER_SIZE).unwrap();
            let _tail = allocator.allocate(24 - HEADER_SIZE).unwrap();
            (low_tail, head)
        } else if second_page + PAGE_SIZE == first_page {
            // [4056 | 40][4064 | 32]
            let _head = allocator.allocate(4056 - HEADER_SIZE).unwrap();
            let tail = allocator.allocate(40 - HEADER_SIZE).unwrap();
            (tail, low_head)
        } else {
            // Pages are not adjacent, no chunk can span both.
            return;
        };

        unsafe {
            allocator.deallocate(left);
            allocator.deallocate(right);
        }
        assert_eq!(free_sizes(&allocator), [PAGE_SIZE + 8]);

        // The 8 byte leftover is too small to split, so the caller gets a
        // small chunk bigger than a page.
        let spanning = allocator.allocate(PAGE_SIZE - HEADER_SIZE).unwrap();
        let header = unsafe { Header::from_content_address(spanning).as_ref() };
        assert_eq!(header.size(), PAGE_SIZE + 8);
        assert!(!header.is_large());
        assert_eq!(allocator.statistics().free_length, 0);

        unsafe {
            ptr::write_bytes(spanning.as_ptr(), 3, PAGE_SIZE - HEADER_SIZE);
            allocator.deallocate(spanning);
        }

        // Back on the free list, never unmapped.
        let statistics = allocator.statistics();
        assert_eq!(statistics.pages_mapped, 2);
        assert_eq!(statistics.pages_unmapped, 0);
        assert_eq!(free_sizes(&allocator), [PAGE_SIZE + 8]);
        verify_free_list(&allocator);
    }

    #[test]
    fn large_allocations_map_dedicated_pages() {
        let mut allocator = Allocator::new();

        // PAGE_SIZE plus the header doesn't fit in one page.
        let address = allocator.allocate(PAGE_SIZE).unwrap();
        let expected_pages = pages_for(PAGE_SIZE + HEADER_SIZE);
        assert_eq!(expected_pages, 2);

        let statistics = allocator.statistics();
        assert_eq!(statistics.pages_mapped, expected_pages);
        assert_eq!(statistics.free_length, 0);

        unsafe {
            ptr::write_bytes(address.as_ptr(), 42, PAGE_SIZE);
            allocator.deallocate(address);
        }

        let statistics = allocator.statistics();
        assert_eq!(statistics.pages_unmapped, expected_pages);
        assert_eq!(statistics.chunks_allocated, 1);
        assert_eq!(statistics.chunks_freed, 1);
        assert_eq!(statistics.free_length, 0);
        assert!(allocator.large_chunks.is_empty());
    }

    #[test]
    fn zero_size_does_nothing() {
        let mut allocator = Allocator::new();

        assert_eq!(allocator.allocate(0), Err(AllocError::ZeroSize));
        assert_eq!(allocator.statistics(), Statistics::default());
    }

    #[test]
    fn size_overflow() {
        let mut allocator = Allocator::new();

        assert_eq!(
            allocator.allocate(usize::MAX),
            Err(AllocError::SizeOverflow { size: usize::MAX })
        );
        assert_eq!(allocator.statistics(), Statistics::default());
    }

    #[test]
    fn map_failure_is_reported() {
        let mut allocator = Allocator::new();

        let result = allocator.allocate(usize::MAX / 2);
        assert!(matches!(result, Err(AllocError::MapFailed { .. })));
        assert_eq!(allocator.statistics(), Statistics::default());
    }

    #[test]
    fn destroy_unmaps_everything() {
        let mut allocator = Allocator::new();

        allocator.allocate(100).unwrap();
        allocator.allocate(PAGE_SIZE - HEADER_SIZE).unwrap();
        allocator.allocate(3 * PAGE_SIZE).unwrap();

        let statistics = allocator.destroy();
        assert_eq!(statistics.pages_mapped, 2 + 4);
        assert_eq!(statistics.pages_unmapped, statistics.pages_mapped);
        assert_eq!(statistics.free_length, 0);
    }

    /// Tiny xorshift generator so that the sequence is reproducible.
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }

        fn below(&mut self, bound: usize) -> usize {
            (self.next() % bound as u64) as usize
        }
    }

    #[test]
    fn random_allocations_keep_invariants() {
        let mut allocator = Allocator::new();
        let mut random = XorShift(0x2545_F491_4F6C_DD1D);
        let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

        let num_operations = if cfg!(miri) { 100 } else { 3000 };

        for i in 0..num_operations {
            if live.is_empty() || random.below(3) != 0 {
                // Mostly small requests, with the occasional large one.
                let size = if random.below(20) == 0 {
                    PAGE_SIZE + random.below(3 * PAGE_SIZE)
                } else {
                    1 + random.below(600)
                };
                let address = allocator.allocate(size).unwrap();
                let value = (i % 251) as u8;

                unsafe { ptr::write_bytes(address.as_ptr(), value, size) };
                live.push((address, size, value));
            } else {
                let (address, size, value) = live.swap_remove(random.below(live.len()));

                unsafe {
                    let content = slice::from_raw_parts(address.as_ptr(), size);
                    assert!(content.iter().all(|byte| *byte == value));
                    allocator.deallocate(address);
                }
            }

            verify_free_list(&allocator);
        }

        // Nothing we still hold was corrupted.
        for (address, size, value) in live.drain(..) {
            unsafe {
                let content = slice::from_raw_parts(address.as_ptr(), size);
                assert!(content.iter().all(|byte| *byte == value));
                allocator.deallocate(address);
            }
        }

        verify_free_list(&allocator);

        // Everything was freed: only small pages remain mapped and the free
        // list covers all of them.
        let statistics = allocator.statistics();
        assert_eq!(statistics.chunks_allocated, statistics.chunks_freed);
        assert!(allocator.large_chunks.is_empty());
        assert_eq!(
            statistics.pages_mapped - statistics.pages_unmapped,
            allocator.pages.len()
        );

        let free: usize = free_sizes(&allocator).iter().sum();
        assert_eq!(free, allocator.pages.len() * PAGE_SIZE);
    }
}
