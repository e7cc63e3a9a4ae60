//! Kernel modules, functions and launches
//!
//! Modules are loaded from a [`KernelImage`] on first use and cached per
//! context, keyed by `(backend, context id, image name)`. Function handles are
//! cached the same way by kernel name. Entries are evicted when their context is
//! destroyed, since the driver unloads the modules with it.

use super::{Context, Driver, ScopedActivateContext, Stream, logged};
use crate::error::{Error, Result};
use crate::runtime::kernel::LaunchConfig;
use crate::runtime::{
    Backend, CacheConfig, DevicePtr, Dim3, FunctionAttribute, KernelImage, RawFunction, RawModule,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::sync::OnceLock;

// ============================================================================
// Module Cache
// ============================================================================

type CacheKey = (&'static str, u64, String);

/// Cached module handles, keyed by (backend, context id, image name)
static MODULE_CACHE: OnceLock<Mutex<HashMap<CacheKey, RawModule>>> = OnceLock::new();

/// Cached function handles, keyed by (backend, context id, kernel name)
static FUNCTION_CACHE: OnceLock<Mutex<HashMap<CacheKey, RawFunction>>> = OnceLock::new();

fn module_cache() -> &'static Mutex<HashMap<CacheKey, RawModule>> {
    MODULE_CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn function_cache() -> &'static Mutex<HashMap<CacheKey, RawFunction>> {
    FUNCTION_CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Forget every cached handle of context `id`.
pub(crate) fn evict_context<B: Backend>(id: u64) {
    module_cache()
        .lock()
        .retain(|(backend, ctx, _), _| !(*backend == B::NAME && *ctx == id));
    function_cache()
        .lock()
        .retain(|(backend, ctx, _), _| !(*backend == B::NAME && *ctx == id));
}

// ============================================================================
// Handles
// ============================================================================

/// A loaded kernel image. Release with [`Driver::unload_module`].
pub struct Module<B: Backend> {
    raw: RawModule,
    name: &'static str,
    _backend: PhantomData<B>,
}

impl<B: Backend> Module<B> {
    /// Raw driver handle, null once unloaded
    #[inline]
    pub fn raw(&self) -> RawModule {
        self.raw
    }

    /// Image name
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<B: Backend> fmt::Debug for Module<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("raw", &self.raw)
            .finish()
    }
}

impl<B: Backend> Drop for Module<B> {
    fn drop(&mut self) {
        if !self.raw.is_null() {
            tracing::warn!(
                backend = B::NAME,
                "module '{}' dropped without unload; it stays loaded until its context is destroyed",
                self.name
            );
        }
    }
}

/// A kernel entry point inside a loaded module.
///
/// Function handles are owned by their module and need no release.
#[derive(Clone)]
pub struct Function<B: Backend> {
    raw: RawFunction,
    name: String,
    _backend: PhantomData<B>,
}

impl<B: Backend> Function<B> {
    /// Raw driver handle
    #[inline]
    pub fn raw(&self) -> RawFunction {
        self.raw
    }

    /// Kernel name
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<B: Backend> fmt::Debug for Function<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("raw", &self.raw)
            .finish()
    }
}

// ============================================================================
// Facade operations
// ============================================================================

impl<B: Backend> Driver<B> {
    /// Load `image` into `context`. The caller owns the returned module.
    pub fn load_module(context: &Context<B>, image: &'static KernelImage) -> Result<Module<B>> {
        let _scope = ScopedActivateContext::new(context)?;
        let raw = logged::<B, _>("module_load", B::module_load(image)).map_err(|status| {
            Error::Module {
                op: "module_load",
                name: image.name.to_string(),
                status,
            }
        })?;
        tracing::debug!(
            backend = B::NAME,
            context = context.id(),
            "loaded module '{}'",
            image.name
        );
        Ok(Module {
            raw,
            name: image.name,
            _backend: PhantomData,
        })
    }

    /// Unload `module` and null its handle.
    pub fn unload_module(context: &Context<B>, module: &mut Module<B>) -> Result<()> {
        if module.raw.is_null() {
            return Ok(());
        }
        let raw = std::mem::replace(&mut module.raw, RawModule::NULL);
        let _scope = ScopedActivateContext::new(context)?;
        logged::<B, _>("module_unload", B::module_unload(raw)).map_err(|status| Error::Module {
            op: "module_unload",
            name: module.name.to_string(),
            status,
        })
    }

    /// Look up the kernel `name` in `module`.
    pub fn get_function(context: &Context<B>, module: &Module<B>, name: &str) -> Result<Function<B>> {
        Self::function_in(context, module.raw, name)
    }

    /// Device address and size in bytes of the module-scope global `name`.
    ///
    /// The address stays valid until the module is unloaded or its context is
    /// destroyed.
    pub fn get_module_symbol(
        context: &Context<B>,
        module: &Module<B>,
        name: &str,
    ) -> Result<(DevicePtr, usize)> {
        let _scope = ScopedActivateContext::new(context)?;
        logged::<B, _>("module_get_global", B::module_get_global(module.raw, name)).map_err(
            |status| Error::Module {
                op: "module_get_global",
                name: name.to_string(),
                status,
            },
        )
    }

    fn function_in(context: &Context<B>, module: RawModule, name: &str) -> Result<Function<B>> {
        let _scope = ScopedActivateContext::new(context)?;
        let raw = logged::<B, _>("module_get_function", B::module_get_function(module, name))
            .map_err(|status| Error::Module {
                op: "module_get_function",
                name: name.to_string(),
                status,
            })?;
        Ok(Function {
            raw,
            name: name.to_string(),
            _backend: PhantomData,
        })
    }

    /// Kernel `name` from `image`, loading the image into `context` on first use.
    ///
    /// The module stays loaded for the life of the context.
    pub fn get_or_load_function(
        context: &Context<B>,
        image: &'static KernelImage,
        name: &str,
    ) -> Result<Function<B>> {
        let function_key = (B::NAME, context.id(), name.to_string());
        if let Some(&raw) = function_cache().lock().get(&function_key) {
            return Ok(Function {
                raw,
                name: name.to_string(),
                _backend: PhantomData,
            });
        }

        let module_key = (B::NAME, context.id(), image.name.to_string());
        let mut modules = module_cache().lock();
        let module_raw = match modules.get(&module_key) {
            Some(&raw) => raw,
            None => {
                let mut module = Self::load_module(context, image)?;
                // Ownership moves to the cache; the context releases it.
                let raw = std::mem::replace(&mut module.raw, RawModule::NULL);
                modules.insert(module_key, raw);
                raw
            }
        };
        drop(modules);

        let function = Self::function_in(context, module_raw, name)?;

        function_cache().lock().insert(function_key, function.raw);
        Ok(function)
    }

    /// Integer attribute of a kernel function.
    pub fn function_attribute(
        context: &Context<B>,
        function: &Function<B>,
        attr: FunctionAttribute,
    ) -> Result<i32> {
        let _scope = ScopedActivateContext::new(context)?;
        logged::<B, _>("func_get_attribute", B::func_get_attribute(function.raw, attr)).map_err(
            |status| Error::Query {
                op: "func_get_attribute",
                status,
            },
        )
    }

    /// Set the L1 / shared memory preference of one kernel function.
    pub fn set_function_cache_config(
        context: &Context<B>,
        function: &Function<B>,
        config: CacheConfig,
    ) -> Result<()> {
        let _scope = ScopedActivateContext::new(context)?;
        logged::<B, _>(
            "func_set_cache_config",
            B::func_set_cache_config(function.raw, config),
        )
        .map_err(|status| Error::Context {
            op: "func_set_cache_config",
            status,
        })
    }

    /// Maximum number of resident blocks per multiprocessor for `function`
    /// launched with `block_size` threads and `dynamic_shared_mem` bytes.
    pub fn max_active_blocks_per_multiprocessor(
        context: &Context<B>,
        function: &Function<B>,
        block_size: u32,
        dynamic_shared_mem: usize,
    ) -> Result<i32> {
        let _scope = ScopedActivateContext::new(context)?;
        logged::<B, _>(
            "occupancy_max_active_blocks",
            B::occupancy_max_active_blocks(function.raw, block_size, dynamic_shared_mem),
        )
        .map_err(|status| Error::Query {
            op: "occupancy_max_active_blocks",
            status,
        })
    }

    /// Enqueue `function` on `stream`.
    ///
    /// Returns as soon as the launch is queued. Errors detected at launch time
    /// are returned as [`Error::Launch`]; errors raised while the kernel runs
    /// surface at the next synchronization or poll.
    ///
    /// # Safety
    ///
    /// `params` must hold one pointer per kernel parameter, each pointing at a
    /// value of exactly the type the kernel declares, and every device address
    /// passed must stay valid until the kernel has finished.
    pub unsafe fn launch_kernel(
        context: &Context<B>,
        function: &Function<B>,
        grid: Dim3,
        block: Dim3,
        shared_mem_bytes: u32,
        stream: &Stream<B>,
        params: &[*mut c_void],
    ) -> Result<()> {
        let _scope = ScopedActivateContext::new(context)?;
        let result = unsafe {
            B::launch_kernel(
                function.raw,
                grid,
                block,
                shared_mem_bytes,
                stream.raw(),
                params,
            )
        };
        logged::<B, _>("launch_kernel", result).map_err(|status| Error::Launch {
            kernel: function.name.clone(),
            status,
        })
    }

    /// [`Driver::launch_kernel`] with a precomputed launch configuration.
    ///
    /// # Safety
    ///
    /// Same contract as [`Driver::launch_kernel`].
    pub unsafe fn launch_with_config(
        context: &Context<B>,
        function: &Function<B>,
        config: LaunchConfig,
        stream: &Stream<B>,
        params: &[*mut c_void],
    ) -> Result<()> {
        unsafe {
            Self::launch_kernel(
                context,
                function,
                config.grid,
                config.block,
                config.shared_mem_bytes,
                stream,
                params,
            )
        }
    }
}
