//! Two independent memory management engines:
//!
//! - [`Allocator`]: a page backed general purpose allocator. Chunks are carved
//!   out of pages mapped from the kernel using best fit over a free list that
//!   is kept sorted by address and fully coalesced. Requests bigger than a
//!   page get dedicated pages that are unmapped on deallocation.
//!
//! - [`Context`]: a mark and sweep garbage collector for integers and pairs,
//!   rooted at a bounded stack. Objects live on the host heap.
//!
//! The two don't depend on each other. Neither is thread safe.
//!
//! Diagnostics are emitted through the [`log`] facade: map and unmap failures,
//! free list corruption and one line per collection.

use std::ptr::NonNull;

mod align;
mod allocator;
mod collector;
mod freelist;
mod header;
mod object;
mod platform;

/// Nullable link between free chunks or between objects. Same size as a raw
/// pointer, but every end of a list shows up as an explicit `None`.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

/// Shorter syntax for allocation return types.
pub type AllocResult = Result<NonNull<u8>, AllocError>;

pub use allocator::{AllocError, Allocator, Statistics};
pub use collector::{Collection, CollectorError, Context, INITIAL_MAX_OBJECTS, STACK_MAX};
pub use freelist::MIN_CHUNK_SIZE;
pub use header::HEADER_SIZE;
pub use object::{ObjectKind, ObjectRef};
pub use platform::PAGE_SIZE;
