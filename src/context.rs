//! Execution-scoped context propagation.
//!
//! A [`Context`] is an immutable collection of values that travels with a
//! logical operation across API boundaries. Contexts can be attached to the
//! current thread; the returned guard restores the previously attached
//! context on drop, even when guards are dropped out of order.

use crate::trace::context::SynchronizedSpan;
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasherDefault, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

thread_local! {
    static CURRENT_CONTEXT: RefCell<ContextStack> = RefCell::new(ContextStack::default());
}

/// An execution-scoped collection of values.
///
/// `Context`s are immutable; write operations return a new context holding
/// the original values plus the new one. The currently attached context is
/// managed through [`Context::attach`] and the returned [`ContextGuard`].
///
/// # Examples
///
/// ```
/// use traceline::Context;
///
/// #[derive(Debug, PartialEq)]
/// struct ValueA(&'static str);
/// #[derive(Debug, PartialEq)]
/// struct ValueB(u64);
///
/// let _outer = Context::new().with_value(ValueA("a")).attach();
///
/// let current = Context::current();
/// assert_eq!(current.get::<ValueA>(), Some(&ValueA("a")));
/// assert_eq!(current.get::<ValueB>(), None);
///
/// {
///     let _inner = Context::current_with_value(ValueB(42)).attach();
///     let current = Context::current();
///     assert_eq!(current.get::<ValueA>(), Some(&ValueA("a")));
///     assert_eq!(current.get::<ValueB>(), Some(&ValueB(42)));
/// }
///
/// // Only the `a` value remains once the inner guard is dropped.
/// assert_eq!(Context::current().get::<ValueB>(), None);
/// ```
#[derive(Clone, Default)]
pub struct Context {
    pub(crate) span: Option<Arc<SynchronizedSpan>>,
    entries: Option<Arc<EntryMap>>,
}

type EntryMap = HashMap<TypeId, Arc<dyn Any + Sync + Send>, BuildHasherDefault<IdHasher>>;

impl Context {
    /// Creates an empty `Context`.
    pub fn new() -> Self {
        Context::default()
    }

    /// Returns an immutable snapshot of the current thread's context.
    pub fn current() -> Self {
        Self::map_current(|cx| cx.clone())
    }

    /// Applies a function to the current context returning its value.
    ///
    /// This avoids cloning the current context when only a lookup is needed.
    pub fn map_current<T>(f: impl FnOnce(&Context) -> T) -> T {
        CURRENT_CONTEXT.with(|cx| cx.borrow().map_current_cx(f))
    }

    /// Returns a clone of the current thread's context with the given value.
    pub fn current_with_value<T: 'static + Send + Sync>(value: T) -> Self {
        Self::map_current(|cx| cx.with_value(value))
    }

    /// Returns a reference to the entry for the corresponding value type.
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.entries
            .as_ref()?
            .get(&TypeId::of::<T>())?
            .downcast_ref()
    }

    /// Returns a copy of the context with the new value included.
    pub fn with_value<T: 'static + Send + Sync>(&self, value: T) -> Self {
        let entries = if let Some(current_entries) = &self.entries {
            let mut inner_entries = (**current_entries).clone();
            inner_entries.insert(TypeId::of::<T>(), Arc::new(value));
            Some(Arc::new(inner_entries))
        } else {
            let mut entries = EntryMap::default();
            entries.insert(TypeId::of::<T>(), Arc::new(value));
            Some(Arc::new(entries))
        };
        Context {
            span: self.span.clone(),
            entries,
        }
    }

    /// Replaces the current context on this thread with this context.
    ///
    /// Dropping the returned [`ContextGuard`] restores the previous context.
    /// Guards may be dropped out of order; only dropping the most recently
    /// attached guard actually restores its predecessor, the rest are
    /// remembered and compacted away once uncovered.
    pub fn attach(self) -> ContextGuard {
        let cx_pos = CURRENT_CONTEXT.with(|cx| cx.borrow_mut().push(self));

        ContextGuard {
            cx_pos,
            _marker: PhantomData,
        }
    }

    pub(crate) fn with_synchronized_span(&self, value: SynchronizedSpan) -> Self {
        Context {
            span: Some(Arc::new(value)),
            entries: self.entries.clone(),
        }
    }

    pub(crate) fn current_with_synchronized_span(value: SynchronizedSpan) -> Self {
        Self::map_current(|cx| cx.with_synchronized_span(value))
    }

    /// The same context without any associated span, used when a builder
    /// forces a fresh root.
    pub(crate) fn with_cleared_span(&self) -> Self {
        Context {
            span: None,
            entries: self.entries.clone(),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Context");
        match &self.span {
            Some(span) => dbg.field("span", span.span_context()),
            None => dbg.field("span", &"None"),
        };
        dbg.field(
            "entries",
            &self.entries.as_ref().map_or(0, |entries| entries.len()),
        )
        .finish()
    }
}

/// A guard that resets the current context to the prior context when dropped.
#[must_use = "dropping the guard detaches the context immediately"]
#[derive(Debug)]
pub struct ContextGuard {
    // Position of the attached context in the thread's stack.
    cx_pos: u16,
    // !Send: positions are only meaningful on the attaching thread.
    _marker: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let pos = self.cx_pos;
        if pos > ContextStack::BASE_POS && pos < ContextStack::MAX_POS {
            CURRENT_CONTEXT.with(|stack| stack.borrow_mut().pop_id(pos));
        }
    }
}

/// With TypeIds as keys there is no need to hash them again; they already are
/// hashes produced by the compiler.
#[derive(Clone, Default, Debug)]
struct IdHasher(u64);

impl Hasher for IdHasher {
    fn write(&mut self, _: &[u8]) {
        unreachable!("TypeId calls write_u64");
    }

    #[inline]
    fn write_u64(&mut self, id: u64) {
        self.0 = id;
    }

    #[inline]
    fn finish(&self) -> u64 {
        self.0
    }
}

/// Tracks the contexts attached to this thread.
///
/// Guards pop by position, which makes out-of-order guard drops safe: a
/// non-top drop tombstones its slot, and the tombstones are compacted away
/// once the top of the stack is popped.
struct ContextStack {
    /// The context currently active on this thread, kept out of the `stack`
    /// for fast access.
    current_cx: Context,
    /// Previously attached contexts, `None` marking out-of-order pops.
    stack: Vec<Option<Context>>,
}

impl ContextStack {
    const BASE_POS: u16 = 0;
    const MAX_POS: u16 = u16::MAX;
    const INITIAL_CAPACITY: usize = 8;

    #[inline(always)]
    fn push(&mut self, cx: Context) -> u16 {
        // Next id is the stack length plus one, since the top of the stack
        // lives in `current_cx`.
        let next_pos = self.stack.len() + 1;
        if next_pos < ContextStack::MAX_POS.into() {
            let current_cx = std::mem::replace(&mut self.current_cx, cx);
            self.stack.push(Some(current_cx));
            next_pos as u16
        } else {
            tracing::warn!(
                limit = ContextStack::MAX_POS,
                "too many attached contexts; attach ignored and the returned guard will be a no-op"
            );
            ContextStack::MAX_POS
        }
    }

    #[inline(always)]
    fn pop_id(&mut self, pos: u16) {
        if pos == ContextStack::BASE_POS || pos == ContextStack::MAX_POS {
            // The base context can never be popped and the overflow position
            // is not a real slot.
            tracing::warn!(position = pos, "attempted to pop an invalid context position");
            return;
        }
        let len = self.stack.len() as u16;
        if pos == len {
            // Top of the stack: restore the previous context, compacting any
            // slots already popped out of order.
            while let Some(None) = self.stack.last() {
                _ = self.stack.pop();
            }
            if let Some(Some(next_cx)) = self.stack.pop() {
                self.current_cx = next_cx;
            }
        } else if pos < len {
            // Out-of-order drop: tombstone the slot.
            _ = self.stack[pos as usize].take();
        } else {
            tracing::warn!(
                position = pos,
                stack_length = len,
                "attempted to pop beyond the end of the context stack"
            );
        }
    }

    #[inline(always)]
    fn map_current_cx<T>(&self, f: impl FnOnce(&Context) -> T) -> T {
        f(&self.current_cx)
    }
}

impl Default for ContextStack {
    fn default() -> Self {
        ContextStack {
            current_cx: Context::default(),
            stack: Vec::with_capacity(ContextStack::INITIAL_CAPACITY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct ValueA(u64);
    #[derive(Debug, PartialEq)]
    struct ValueB(u64);

    #[test]
    fn nested_contexts() {
        #[derive(Debug, PartialEq)]
        struct ValueC(u64);

        let _outer = Context::new().with_value(ValueA(1)).attach();
        {
            let _inner = Context::current_with_value(ValueB(2)).attach();
            {
                let _innermost = Context::current_with_value(ValueC(3)).attach();
                assert_eq!(Context::current().get(), Some(&ValueA(1)));
                assert_eq!(Context::current().get(), Some(&ValueB(2)));
                assert_eq!(Context::current().get(), Some(&ValueC(3)));
            }
            assert_eq!(Context::current().get(), Some(&ValueA(1)));
            assert_eq!(Context::current().get(), Some(&ValueB(2)));
            assert_eq!(Context::current().get::<ValueC>(), None);
        }
        assert_eq!(Context::current().get(), Some(&ValueA(1)));
        assert_eq!(Context::current().get::<ValueB>(), None);
    }

    #[test]
    fn overwriting_value_type_replaces_entry() {
        let cx = Context::new().with_value(ValueA(1)).with_value(ValueA(2));
        assert_eq!(cx.get(), Some(&ValueA(2)));
    }

    #[test]
    fn out_of_order_guard_drop_restores_enclosing_scope() {
        let outer = Context::new().with_value(ValueA(1)).attach();
        let inner = Context::current_with_value(ValueA(2)).attach();
        assert_eq!(Context::current().get(), Some(&ValueA(2)));

        // Drop the outer guard first: the inner context must remain current.
        drop(outer);
        assert_eq!(Context::current().get(), Some(&ValueA(2)));

        // Dropping the inner guard restores the empty base context, skipping
        // the tombstoned outer slot.
        drop(inner);
        assert_eq!(Context::current().get::<ValueA>(), None);
    }

    #[test]
    fn attached_context_does_not_leak_to_other_threads() {
        let _guard = Context::new().with_value(ValueA(7)).attach();
        std::thread::spawn(|| {
            assert_eq!(Context::current().get::<ValueA>(), None);
        })
        .join()
        .expect("thread panicked");
    }
}
