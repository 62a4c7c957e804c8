use std::{error::Error, fmt, mem, ptr::NonNull};

use log::info;

use crate::{
    object::{Object, ObjectRef, Payload},
    Pointer,
};

/// Capacity of the root stack.
pub const STACK_MAX: usize = 256;

/// Number of live objects that triggers the first collection. Also the floor
/// for every threshold computed afterwards.
pub const INITIAL_MAX_OBJECTS: usize = 8;

/// Misuse of the root stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorError {
    /// The root stack already holds [`STACK_MAX`] objects.
    StackOverflow,
    /// Not enough objects on the root stack for the operation.
    StackUnderflow,
}

impl fmt::Display for CollectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectorError::StackOverflow => {
                write!(f, "root stack overflow ({STACK_MAX} objects)")
            }
            CollectorError::StackUnderflow => write!(f, "root stack underflow"),
        }
    }
}

impl Error for CollectorError {}

/// Outcome of a single [`Context::collect`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collection {
    pub collected: usize,
    pub remaining: usize,
}

/// Mark and sweep collector over integers and pairs. The root stack is the
/// only root set: anything not transitively reachable from it when
/// [`Context::collect`] runs is freed.
///
/// Collections happen explicitly through [`Context::collect`] or
/// automatically when allocating a new object would exceed the current
/// threshold. After each collection the threshold becomes twice the number of
/// surviving objects, but never less than the initial threshold.
///
/// # Examples
///
/// ```rust
/// use heapyard::Context;
///
/// let mut context = Context::new();
///
/// context.push_integer(1).unwrap();
/// context.push_integer(2).unwrap();
/// let pair = context.push_pair().unwrap();
///
/// // Nothing is collected, the pair keeps both integers alive.
/// assert_eq!(context.collect().remaining, 3);
/// assert_eq!(unsafe { pair.render() }, "(1, 2)");
///
/// context.pop().unwrap();
/// assert_eq!(context.collect().collected, 3);
/// assert_eq!(context.object_count(), 0);
/// ```
///
/// # Drop
///
/// Dropping a context that still owns objects clears the root stack and runs
/// one last collection, which frees everything. See also [`Context::delete`].
pub struct Context {
    stack: [Option<ObjectRef>; STACK_MAX],
    stack_size: usize,
    /// Head of the intrusive list of all objects.
    first_object: Pointer<Object>,
    object_count: usize,
    /// Number of objects that triggers the next collection.
    max_objects: usize,
    initial_max_objects: usize,
    /// Mark work stack, reused across collections.
    pending: Vec<NonNull<Object>>,
}

impl Context {
    /// Fresh context with an empty root stack and the default threshold.
    pub fn new() -> Self {
        Self::with_threshold(INITIAL_MAX_OBJECTS)
    }

    /// Fresh context whose first collection happens after `max_objects`
    /// allocations. Later thresholds never drop below this value either.
    pub fn with_threshold(max_objects: usize) -> Self {
        let max_objects = max_objects.max(1);

        Self {
            stack: [None; STACK_MAX],
            stack_size: 0,
            first_object: None,
            object_count: 0,
            max_objects,
            initial_max_objects: max_objects,
            pending: Vec::new(),
        }
    }

    /// Number of objects currently alive.
    pub fn object_count(&self) -> usize {
        self.object_count
    }

    /// Number of live objects that triggers the next collection.
    pub fn max_objects(&self) -> usize {
        self.max_objects
    }

    /// Number of objects on the root stack.
    pub fn stack_len(&self) -> usize {
        self.stack_size
    }

    /// Object on top of the root stack.
    pub fn peek(&self) -> Option<ObjectRef> {
        self.stack_size.checked_sub(1).and_then(|top| self.stack[top])
    }

    /// Pushes `object` on the root stack, typically one that was popped
    /// earlier and hasn't been collected yet.
    ///
    /// # Safety
    ///
    /// `object` must come from this context and must not have been collected.
    /// The next collection writes to every object on the root stack.
    ///
    /// ```compile_fail
    /// use heapyard::Context;
    ///
    /// let mut context = Context::new();
    /// let object = context.push_integer(1).unwrap();
    /// context.pop().unwrap();
    /// context.collect();
    ///
    /// // Stale handle, pushing it requires `unsafe`.
    /// context.push(object).unwrap();
    /// ```
    pub unsafe fn push(&mut self, object: ObjectRef) -> Result<(), CollectorError> {
        self.push_root(object)
    }

    /// Pops the object on top of the root stack. It stays alive until the
    /// next collection.
    pub fn pop(&mut self) -> Result<ObjectRef, CollectorError> {
        let top = self
            .stack_size
            .checked_sub(1)
            .ok_or(CollectorError::StackUnderflow)?;

        let object = self.stack[top].take().ok_or(CollectorError::StackUnderflow)?;
        self.stack_size = top;

        Ok(object)
    }

    /// Roots an object this context just allocated.
    fn push_root(&mut self, object: ObjectRef) -> Result<(), CollectorError> {
        if self.stack_size == STACK_MAX {
            return Err(CollectorError::StackOverflow);
        }

        self.stack[self.stack_size] = Some(object);
        self.stack_size += 1;

        Ok(())
    }

    /// Allocates an integer object and pushes it on the root stack.
    pub fn push_integer(&mut self, value: i32) -> Result<ObjectRef, CollectorError> {
        if self.stack_size == STACK_MAX {
            return Err(CollectorError::StackOverflow);
        }

        let object = self.new_object(Payload::Integer(value));
        self.push_root(object)?;

        Ok(object)
    }

    /// Pops the right and then the left operand, allocates a pair holding
    /// them and pushes the pair on the root stack.
    ///
    /// The operands stay on the stack while the pair is allocated, so a
    /// collection triggered by the allocation can't free them.
    pub fn push_pair(&mut self) -> Result<ObjectRef, CollectorError> {
        if self.stack_size < 2 {
            return Err(CollectorError::StackUnderflow);
        }

        let right = self.stack[self.stack_size - 1].ok_or(CollectorError::StackUnderflow)?;
        let left = self.stack[self.stack_size - 2].ok_or(CollectorError::StackUnderflow)?;

        let object = self.new_object(Payload::Pair { left, right });

        self.pop()?;
        self.pop()?;
        self.push_root(object)?;

        Ok(object)
    }

    /// Runs a full mark and sweep and retunes the threshold.
    pub fn collect(&mut self) -> Collection {
        let before = self.object_count;

        self.mark_all();
        self.sweep();

        self.max_objects = (self.object_count * 2).max(self.initial_max_objects);

        let collection = Collection {
            collected: before - self.object_count,
            remaining: self.object_count,
        };

        info!(
            "collected {} objects, {} remaining",
            collection.collected, collection.remaining
        );

        collection
    }

    /// Clears the root stack, frees every object and releases the context.
    pub fn delete(mut self) -> Collection {
        self.release()
    }

    fn release(&mut self) -> Collection {
        self.stack = [None; STACK_MAX];
        self.stack_size = 0;
        self.collect()
    }

    /// Links a fresh unmarked object at the head of the object list,
    /// collecting first if the threshold has been reached.
    fn new_object(&mut self, payload: Payload) -> ObjectRef {
        if self.object_count >= self.max_objects {
            self.collect();
        }

        let object = Box::new(Object {
            marked: false,
            next: self.first_object,
            payload,
        });

        let object = NonNull::from(Box::leak(object));
        self.first_object = Some(object);
        self.object_count += 1;

        ObjectRef(object)
    }

    fn roots(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.stack[..self.stack_size].iter().flatten().copied()
    }

    /// Marks everything reachable from the root stack. Uses an explicit work
    /// stack instead of recursion so that long chains of pairs can't overflow
    /// the native stack. Left halves are visited before right halves.
    fn mark_all(&mut self) {
        let mut pending = mem::take(&mut self.pending);

        for root in self.roots() {
            pending.push(root.0);

            while let Some(object) = pending.pop() {
                let object = unsafe { &mut *object.as_ptr() };

                // Already marked means already traced, which also stops
                // cycles.
                if object.marked {
                    continue;
                }

                object.marked = true;

                if let Payload::Pair { left, right } = object.payload {
                    pending.push(right.0);
                    pending.push(left.0);
                }
            }
        }

        self.pending = pending;
    }

    /// Frees every unmarked object and clears the mark of the survivors.
    /// `cursor` always points to the link that leads to the current object,
    /// so unlinking is just overwriting that link.
    fn sweep(&mut self) {
        let mut cursor: *mut Pointer<Object> = &mut self.first_object;

        unsafe {
            while let Some(object) = *cursor {
                if (*object.as_ptr()).marked {
                    (*object.as_ptr()).marked = false;
                    cursor = &mut (*object.as_ptr()).next;
                } else {
                    *cursor = (*object.as_ptr()).next;
                    drop(Box::from_raw(object.as_ptr()));
                    self.object_count -= 1;
                }
            }
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if self.first_object.is_some() {
            self.release();
        }
    }
}
