//! Per-thread call frames.
//!
//! Each native call runs inside a [`CallFrame`]. The frame keeps every object
//! converted to an address during the call alive (native code may have stored
//! the address somewhere), records an exception raised through the `raise`
//! upcall, and tells upcalls which bridge they belong to.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::bridge::Shared;
use crate::error::NativeException;
use crate::object::ObjectRef;

struct Frame {
    shared: Arc<Shared>,
    locals: Vec<ObjectRef>,
    exception: Option<NativeException>,
}

thread_local! {
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// Scope of one native call on the current thread.
pub(crate) struct CallFrame {
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl CallFrame {
    pub(crate) fn enter(shared: &Arc<Shared>) -> Self {
        let depth = FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            frames.push(Frame {
                shared: Arc::clone(shared),
                locals: Vec::new(),
                exception: None,
            });
            frames.len()
        });
        Self {
            depth,
            _not_send: PhantomData,
        }
    }

    /// Removes the exception raised during this frame, if any.
    pub(crate) fn take_exception(&self) -> Option<NativeException> {
        FRAMES.with(|frames| {
            frames
                .borrow_mut()
                .get_mut(self.depth - 1)
                .and_then(|frame| frame.exception.take())
        })
    }
}

impl Drop for CallFrame {
    fn drop(&mut self) {
        let popped = FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            debug_assert_eq!(frames.len(), self.depth, "call frames popped out of order");
            let frame = frames.pop()?;
            if frame.locals.is_empty() {
                return Some((frame.shared, Vec::new()));
            }
            // Hand the locals to the caller's frame on the same bridge.
            match frames
                .iter_mut()
                .rev()
                .find(|outer| Arc::ptr_eq(&outer.shared, &frame.shared))
            {
                Some(outer) => {
                    outer.locals.extend(frame.locals);
                    Some((frame.shared, Vec::new()))
                }
                None => Some((frame.shared, frame.locals)),
            }
        });

        // Outside the thread-local borrow: requesting cleanup may run hooks.
        if let Some((shared, locals)) = popped {
            if !locals.is_empty() {
                shared.gc.carry_over(locals);
                shared.request_cleanup();
            }
        }
    }
}

/// Bridge of the innermost frame on this thread.
pub(crate) fn current_shared() -> Option<Arc<Shared>> {
    FRAMES.with(|frames| frames.borrow().last().map(|frame| Arc::clone(&frame.shared)))
}

/// Keeps `object` alive until the innermost frame of `shared` pops.
///
/// Returns the object back if no such frame exists.
pub(crate) fn retain_local(shared: &Shared, object: ObjectRef) -> Option<ObjectRef> {
    FRAMES.with(|frames| {
        let mut frames = frames.borrow_mut();
        match frames
            .iter_mut()
            .rev()
            .find(|frame| std::ptr::eq(Arc::as_ptr(&frame.shared), shared))
        {
            Some(frame) => {
                frame.locals.push(object);
                None
            }
            None => Some(object),
        }
    })
}

/// Records `exception` on the innermost frame. Returns `false` outside a frame.
pub(crate) fn raise(exception: NativeException) -> bool {
    FRAMES.with(|frames| match frames.borrow_mut().last_mut() {
        Some(frame) => {
            frame.exception = Some(exception);
            true
        }
        None => false,
    })
}
