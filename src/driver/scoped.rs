//! Scoped context activation

use super::{Context, logged};
use crate::error::{Error, Result};
use crate::runtime::{Backend, RawContext};
use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    /// Number of live activation guards on this thread.
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Makes a context current for the lifetime of the guard.
///
/// On construction the target context is activated unless it is already
/// current, and whatever was current before (possibly nothing) is recorded. On
/// drop the recorded context is restored. Guards nest: an inner guard for the
/// same context is free, an inner guard for another context switches and
/// switches back.
///
/// The guard is bound to the thread that created it; the current context is
/// per-thread state.
///
/// # Example
///
/// ```ignore
/// let _scope = ScopedActivateContext::new(&ctx)?;
/// // `ctx` is current until `_scope` goes out of scope
/// ```
#[must_use = "the context is only active while the guard is alive"]
pub struct ScopedActivateContext<'a, B: Backend> {
    context: &'a Context<B>,
    previous: RawContext,
    switched: bool,
    _not_send: PhantomData<*const ()>,
}

impl<'a, B: Backend> ScopedActivateContext<'a, B> {
    /// Activate `context` on the calling thread.
    pub fn new(context: &'a Context<B>) -> Result<Self> {
        let previous = logged::<B, _>("context_activate", B::ctx_get_current())
            .map_err(|status| Error::Context {
                op: "context_activate",
                status,
            })?;

        let switched = previous != context.raw();
        if switched {
            logged::<B, _>("context_activate", B::ctx_set_current(context.raw())).map_err(
                |status| Error::Context {
                    op: "context_activate",
                    status,
                },
            )?;
        }

        DEPTH.set(DEPTH.get() + 1);
        Ok(Self {
            context,
            previous,
            switched,
            _not_send: PhantomData,
        })
    }

    /// The context this guard activated
    #[inline]
    pub fn context(&self) -> &'a Context<B> {
        self.context
    }

    /// Context that was current before this guard, null if none.
    #[inline]
    pub fn previous(&self) -> RawContext {
        self.previous
    }

    /// Number of live guards on the calling thread
    pub fn depth() -> usize {
        DEPTH.get()
    }
}

impl<B: Backend> Drop for ScopedActivateContext<'_, B> {
    fn drop(&mut self) {
        DEPTH.set(DEPTH.get().saturating_sub(1));

        // Inner guards must have restored our context before we unwind.
        if let Ok(current) = B::ctx_get_current() {
            if current != self.context.raw() {
                tracing::error!(
                    backend = B::NAME,
                    context = self.context.id(),
                    "scoped activation ended with {:?} current instead of {:?}",
                    current,
                    self.context.raw()
                );
                if !std::thread::panicking() {
                    debug_assert_eq!(current, self.context.raw(), "context switched under a guard");
                }
            }
        }

        if self.switched {
            // Restoring null unbinds the thread, which is what "none" means.
            let _ = logged::<B, _>("context_restore", B::ctx_set_current(self.previous));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Device, Driver};
    use crate::runtime::ContextOptions;
    use crate::runtime::host::HostBackend;

    fn context() -> std::sync::Arc<Context<HostBackend>> {
        Driver::<HostBackend>::init().unwrap();
        let device = Device::get(0).unwrap();
        Context::create(&device, ContextOptions::default()).unwrap()
    }

    #[test]
    fn test_restores_none() {
        let ctx = context();
        HostBackend::ctx_set_current(RawContext::NULL).unwrap();
        {
            let scope = ScopedActivateContext::new(&ctx).unwrap();
            assert!(scope.previous().is_null());
            assert_eq!(Driver::<HostBackend>::current_context(), ctx.raw());
            assert_eq!(ScopedActivateContext::<HostBackend>::depth(), 1);
        }
        assert!(Driver::<HostBackend>::current_context().is_null());
        assert_eq!(ScopedActivateContext::<HostBackend>::depth(), 0);
        ctx.destroy().unwrap();
    }

    #[test]
    fn test_same_context_reentry() {
        let ctx = context();
        HostBackend::ctx_set_current(RawContext::NULL).unwrap();
        let outer = ScopedActivateContext::new(&ctx).unwrap();
        {
            let inner = ScopedActivateContext::new(&ctx).unwrap();
            assert_eq!(inner.previous(), ctx.raw());
            assert_eq!(ScopedActivateContext::<HostBackend>::depth(), 2);
        }
        assert_eq!(Driver::<HostBackend>::current_context(), ctx.raw());
        drop(outer);
        assert!(Driver::<HostBackend>::current_context().is_null());
        ctx.destroy().unwrap();
    }
}
