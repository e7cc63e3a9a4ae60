//! Driver contexts
//!
//! A `Context` binds a driver context to the device it was created on and gives
//! it a process-wide id. Ids start at 1, increase monotonically and are never
//! reused, so they remain meaningful in logs after the context is gone.
//!
//! Every live context is recorded in a registry keyed by its raw handle, which
//! is how pointer queries map a raw owning context back to a `Context`.

use super::{Device, Driver, ScopedActivateContext, logged, module};
use crate::error::{Error, Result};
use crate::runtime::kernel::LaunchLimits;
use crate::runtime::{
    Backend, CacheConfig, ContextOptions, DeviceAttribute, RawContext, SharedMemConfig, Status,
};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Next context id. Zero is never handed out.
static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

type Registry = Mutex<HashMap<(&'static str, RawContext), Weak<dyn Any + Send + Sync>>>;

/// Live contexts of every backend, keyed by (backend name, raw handle)
static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A driver context bound to one device.
///
/// Created through [`Context::create`] and shared as `Arc<Context<B>>`.
/// Destruction is explicit and caller-synchronized: no other thread may use the
/// context while [`Context::destroy`] runs.
pub struct Context<B: Backend> {
    raw: RawContext,
    device: Device<B>,
    id: u64,
    options: ContextOptions,
    limits: OnceLock<LaunchLimits>,
    destroyed: AtomicBool,
}

impl<B: Backend> fmt::Debug for Context<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("backend", &B::NAME)
            .field("id", &self.id)
            .field("raw", &self.raw)
            .field("device", &self.device.ordinal())
            .finish()
    }
}

impl<B: Backend> Context<B> {
    /// Create a context on `device`.
    ///
    /// The context is not left current: whatever was current on the calling
    /// thread before (possibly nothing) is current again when this returns.
    pub fn create(device: &Device<B>, options: ContextOptions) -> Result<Arc<Self>> {
        let previous = logged::<B, _>("context_create", B::ctx_get_current())
            .map_err(|status| Error::Context {
                op: "context_create",
                status,
            })?;

        let raw = logged::<B, _>("context_create", B::ctx_create(device.raw(), options.flags()))
            .map_err(|status| Error::Context {
                op: "context_create",
                status,
            })?;

        // Creation pushed the new context; put back what the caller had.
        if let Err(status) = logged::<B, _>("context_create", B::ctx_set_current(previous)) {
            let _ = logged::<B, _>("context_destroy", B::ctx_destroy(raw));
            return Err(Error::Context {
                op: "context_create",
                status,
            });
        }

        let context = Arc::new(Self {
            raw,
            device: *device,
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            options,
            limits: OnceLock::new(),
            destroyed: AtomicBool::new(false),
        });

        if let Err(e) = context.apply_options() {
            let _ = context.destroy();
            return Err(e);
        }

        let entry: Arc<dyn Any + Send + Sync> = context.clone();
        registry()
            .lock()
            .insert((B::NAME, raw), Arc::downgrade(&entry));

        tracing::debug!(
            backend = B::NAME,
            id = context.id,
            device = device.ordinal(),
            "created context {:?}",
            raw
        );
        Ok(context)
    }

    fn apply_options(&self) -> Result<()> {
        if self.options.cache_config == CacheConfig::default()
            && self.options.shared_mem_config == SharedMemConfig::default()
        {
            return Ok(());
        }
        let _scope = ScopedActivateContext::new(self)?;
        if self.options.cache_config != CacheConfig::default() {
            logged::<B, _>(
                "context_set_cache_config",
                B::ctx_set_cache_config(self.options.cache_config),
            )
            .map_err(|status| Error::Context {
                op: "context_set_cache_config",
                status,
            })?;
        }
        if self.options.shared_mem_config != SharedMemConfig::default() {
            logged::<B, _>(
                "context_set_shared_mem_config",
                B::ctx_set_shared_mem_config(self.options.shared_mem_config),
            )
            .map_err(|status| Error::Context {
                op: "context_set_shared_mem_config",
                status,
            })?;
        }
        Ok(())
    }

    /// Look up the live context behind a raw driver handle.
    pub fn from_raw(raw: RawContext) -> Option<Arc<Self>> {
        let entry = registry().lock().get(&(B::NAME, raw))?.upgrade()?;
        entry.downcast::<Self>().ok()
    }

    /// Destroy the context.
    ///
    /// Releases every resource the driver still holds for it. Calling this
    /// again is a no-op.
    pub fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        registry().lock().remove(&(B::NAME, self.raw));
        module::evict_context::<B>(self.id);

        logged::<B, _>("context_destroy", B::ctx_destroy(self.raw)).map_err(|status| {
            Error::Context {
                op: "context_destroy",
                status,
            }
        })?;
        tracing::debug!(backend = B::NAME, id = self.id, "destroyed context {:?}", self.raw);
        Ok(())
    }

    /// Raw driver handle
    #[inline]
    pub fn raw(&self) -> RawContext {
        self.raw
    }

    /// Process-wide unique id, never zero
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Device this context was created on
    #[inline]
    pub fn device(&self) -> &Device<B> {
        &self.device
    }

    /// Options the context was created with
    #[inline]
    pub fn options(&self) -> &ContextOptions {
        &self.options
    }

    /// Whether [`Context::destroy`] has run
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Launch limits of the device, queried once and cached.
    pub fn launch_limits(&self) -> Result<LaunchLimits> {
        if let Some(limits) = self.limits.get() {
            return Ok(*limits);
        }
        let limits = LaunchLimits {
            max_threads_per_block: self.device.attribute(DeviceAttribute::MaxThreadsPerBlock)?
                as u32,
            multiprocessor_count: self.device.attribute(DeviceAttribute::MultiprocessorCount)?
                as u32,
            max_threads_per_multiprocessor: self
                .device
                .attribute(DeviceAttribute::MaxThreadsPerMultiprocessor)?
                as u32,
        };
        Ok(*self.limits.get_or_init(|| limits))
    }
}

impl<B: Backend> Drop for Context<B> {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::Acquire) {
            tracing::warn!(
                backend = B::NAME,
                id = self.id,
                "context {:?} dropped without destroy(); driver resources are leaked",
                self.raw
            );
            registry().lock().remove(&(B::NAME, self.raw));
        }
    }
}

// ============================================================================
// Context-scoped facade operations
// ============================================================================

impl<B: Backend> Driver<B> {
    /// Create a context on `device`. See [`Context::create`].
    pub fn create_context(device: &Device<B>, options: ContextOptions) -> Result<Arc<Context<B>>> {
        Context::create(device, options)
    }

    /// Destroy `context`. See [`Context::destroy`].
    pub fn destroy_context(context: &Context<B>) -> Result<()> {
        context.destroy()
    }

    /// Device the driver reports for `context`.
    pub fn device_from_context(context: &Context<B>) -> Result<Device<B>> {
        let _scope = ScopedActivateContext::new(context)?;
        let raw = logged::<B, _>("context_get_device", B::ctx_get_device()).map_err(|status| {
            Error::Query {
                op: "context_get_device",
                status,
            }
        })?;
        Ok(Device::from_raw(raw))
    }

    /// Block until all work in `context` has completed.
    ///
    /// Execution errors of earlier asynchronous work are reported here.
    pub fn synchronize_context(context: &Context<B>) -> Result<()> {
        let _scope = ScopedActivateContext::new(context)?;
        logged::<B, _>("context_synchronize", B::ctx_synchronize()).map_err(|status| {
            Error::Synchronization {
                op: "context_synchronize",
                status,
            }
        })
    }

    /// Set the L1 / shared memory preference of `context`.
    pub fn set_context_cache_config(context: &Context<B>, config: CacheConfig) -> Result<()> {
        let _scope = ScopedActivateContext::new(context)?;
        logged::<B, _>("context_set_cache_config", B::ctx_set_cache_config(config)).map_err(
            |status| Error::Context {
                op: "context_set_cache_config",
                status,
            },
        )
    }

    /// Shared memory bank configuration of `context`.
    pub fn context_shared_mem_config(context: &Context<B>) -> Result<SharedMemConfig> {
        let _scope = ScopedActivateContext::new(context)?;
        logged::<B, _>("context_get_shared_mem_config", B::ctx_get_shared_mem_config()).map_err(
            |status| Error::Query {
                op: "context_get_shared_mem_config",
                status,
            },
        )
    }

    /// Set the shared memory bank configuration of `context`.
    pub fn set_context_shared_mem_config(
        context: &Context<B>,
        config: SharedMemConfig,
    ) -> Result<()> {
        let _scope = ScopedActivateContext::new(context)?;
        logged::<B, _>(
            "context_set_shared_mem_config",
            B::ctx_set_shared_mem_config(config),
        )
        .map_err(|status| Error::Context {
            op: "context_set_shared_mem_config",
            status,
        })
    }

    /// `(free, total)` memory of the device behind `context`, in bytes.
    pub fn device_memory_info(context: &Context<B>) -> Result<(u64, u64)> {
        let _scope = ScopedActivateContext::new(context)?;
        logged::<B, _>("mem_get_info", B::mem_get_info()).map_err(|status| Error::Query {
            op: "mem_get_info",
            status,
        })
    }

    /// Whether `from` can be allowed to access memory owned by `to`.
    pub fn can_enable_peer_access(from: &Context<B>, to: &Context<B>) -> bool {
        match from.device().can_access_peer(to.device()) {
            Ok(can_access) => can_access,
            Err(_) => false,
        }
    }

    /// Allow `from` to access memory owned by `to`.
    ///
    /// Enabling an already enabled pair succeeds.
    pub fn enable_peer_access(from: &Context<B>, to: &Context<B>) -> Result<()> {
        if from.raw() == to.raw() {
            return Ok(());
        }
        let _scope = ScopedActivateContext::new(from)?;
        match B::ctx_enable_peer_access(to.raw()) {
            Ok(()) => Ok(()),
            Err(Status::PEER_ACCESS_ALREADY_ENABLED) => Ok(()),
            Err(status) => {
                super::log_failure(B::NAME, "context_enable_peer_access", status);
                if status == Status::PEER_ACCESS_UNSUPPORTED {
                    Err(Error::UnsupportedOperation {
                        op: "context_enable_peer_access",
                        status,
                    })
                } else {
                    Err(Error::Context {
                        op: "context_enable_peer_access",
                        status,
                    })
                }
            }
        }
    }
}
