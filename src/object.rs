use std::{fmt::Write, ptr::NonNull};

use crate::Pointer;

/// The two shapes an object can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Integer,
    Pair,
}

#[derive(Clone, Copy)]
pub(crate) enum Payload {
    Integer(i32),
    /// Non-owning edges, the [`crate::Context`] owns every object.
    Pair { left: ObjectRef, right: ObjectRef },
}

/// Heap record for a single object. Every object is also a node of the
/// intrusive list of all objects that the collector sweeps.
///
/// ```text
/// Context.first_object
///        |
///        v
/// +--------------+      +--------------+      +--------------+
/// | marked       |      | marked       |      | marked       |
/// | next     ----+----> | next     ----+----> | next: None   |
/// | Pair(l, r)   |      | Integer(4)   |      | Integer(3)   |
/// +--------------+      +--------------+      +--------------+
/// ```
pub(crate) struct Object {
    pub marked: bool,
    pub next: Pointer<Object>,
    pub payload: Payload,
}

/// Handle to an object owned by a [`crate::Context`]. Handles are plain
/// pointers: they stay valid only while the object is reachable from the root
/// stack, because the next collection frees anything that isn't. That's why
/// every accessor is `unsafe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef(pub(crate) NonNull<Object>);

impl ObjectRef {
    #[inline]
    unsafe fn object<'a>(self) -> &'a Object {
        self.0.as_ref()
    }

    #[inline]
    unsafe fn object_mut<'a>(self) -> &'a mut Object {
        &mut *self.0.as_ptr()
    }

    /// # Safety
    ///
    /// The object must not have been collected.
    pub unsafe fn kind(self) -> ObjectKind {
        match self.object().payload {
            Payload::Integer(_) => ObjectKind::Integer,
            Payload::Pair { .. } => ObjectKind::Pair,
        }
    }

    /// Value of an integer object, `None` for pairs.
    ///
    /// # Safety
    ///
    /// The object must not have been collected.
    pub unsafe fn integer(self) -> Option<i32> {
        match self.object().payload {
            Payload::Integer(value) => Some(value),
            Payload::Pair { .. } => None,
        }
    }

    /// Left half of a pair, `None` for integers.
    ///
    /// # Safety
    ///
    /// The object must not have been collected.
    pub unsafe fn left(self) -> Option<ObjectRef> {
        match self.object().payload {
            Payload::Pair { left, .. } => Some(left),
            Payload::Integer(_) => None,
        }
    }

    /// Right half of a pair, `None` for integers.
    ///
    /// # Safety
    ///
    /// The object must not have been collected.
    pub unsafe fn right(self) -> Option<ObjectRef> {
        match self.object().payload {
            Payload::Pair { right, .. } => Some(right),
            Payload::Integer(_) => None,
        }
    }

    /// Replaces the left half of a pair and returns the previous one. Does
    /// nothing and returns `None` if this is an integer.
    ///
    /// # Safety
    ///
    /// Both objects must not have been collected and must belong to the same
    /// context.
    pub unsafe fn set_left(self, value: ObjectRef) -> Option<ObjectRef> {
        match &mut self.object_mut().payload {
            Payload::Pair { left, .. } => Some(std::mem::replace(left, value)),
            Payload::Integer(_) => None,
        }
    }

    /// Replaces the right half of a pair and returns the previous one. Does
    /// nothing and returns `None` if this is an integer.
    ///
    /// # Safety
    ///
    /// Same as [`Self::set_left`].
    pub unsafe fn set_right(self, value: ObjectRef) -> Option<ObjectRef> {
        match &mut self.object_mut().payload {
            Payload::Pair { right, .. } => Some(std::mem::replace(right, value)),
            Payload::Integer(_) => None,
        }
    }

    #[cfg(test)]
    pub(crate) unsafe fn is_marked(self) -> bool {
        self.object().marked
    }

    /// Prints integers as `1` and pairs as `(left, right)`. A pair that is
    /// already being printed further up prints as `...`, so cycles terminate.
    ///
    /// # Safety
    ///
    /// Every object reachable from this one must not have been collected.
    pub unsafe fn render(self) -> String {
        let mut output = String::new();
        self.render_into(&mut output, &mut Vec::new());

        output
    }

    unsafe fn render_into(self, output: &mut String, path: &mut Vec<ObjectRef>) {
        match self.object().payload {
            Payload::Integer(value) => {
                let _ = write!(output, "{value}");
            }
            Payload::Pair { left, right } => {
                if path.contains(&self) {
                    output.push_str("...");
                    return;
                }

                path.push(self);
                output.push('(');
                left.render_into(output, path);
                output.push_str(", ");
                right.render_into(output, path);
                output.push(')');
                path.pop();
            }
        }
    }
}
