//! Compute context
//!
//! A [`NattenContext`] bundles one device with the resources every forward
//! call shares: the kernel cache and the scratch-buffer pool. It is `Sync`;
//! any number of threads may issue forward calls against the same context.
//!
//! [`host_context`] returns a process-wide context over a [`HostDevice`],
//! created on first use from `NATTEN_*` environment variables. Callers that
//! want explicit lifetime control build their own with
//! [`NattenContext::new`].

use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::backend::{ComputeDevice, HostDevice};
use crate::config::NattenConfig;
use crate::error::NattenResult;
use crate::kernels::KernelCache;
use crate::memory::BufferPool;

pub struct NattenContext<D: ComputeDevice> {
    device: Arc<D>,
    kernels: KernelCache<D>,
    pool: BufferPool<D>,
    config: NattenConfig,
}

pub type HostContext = NattenContext<HostDevice>;

impl<D: ComputeDevice> NattenContext<D> {
    /// # Errors
    /// `InvalidConfiguration` when `config` fails validation.
    pub fn new(device: Arc<D>, config: &NattenConfig) -> NattenResult<Self> {
        config.validate()?;
        let kernels = KernelCache::new(Arc::clone(&device), config.kernel_cache_capacity);
        let pool = BufferPool::new(Arc::clone(&device), config.pool_min_size_class)?;
        tracing::debug!(
            device = device.name(),
            kernel_cache_capacity = config.kernel_cache_capacity,
            pool_min_size_class = config.pool_min_size_class,
            "created compute context"
        );
        Ok(NattenContext {
            device,
            kernels,
            pool,
            config: config.clone(),
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_arc(&self) -> Arc<D> {
        Arc::clone(&self.device)
    }

    pub fn kernels(&self) -> &KernelCache<D> {
        &self.kernels
    }

    pub fn pool(&self) -> &BufferPool<D> {
        &self.pool
    }

    pub fn config(&self) -> &NattenConfig {
        &self.config
    }
}

impl NattenContext<HostDevice> {
    /// Context over a fresh host device configured by `config`.
    pub fn host(config: &NattenConfig) -> NattenResult<Self> {
        config.validate()?;
        let device = Arc::new(HostDevice::from_config(config)?);
        Self::new(device, config)
    }
}

static HOST_CONTEXT: OnceCell<HostContext> = OnceCell::new();

/// The process-wide host context.
///
/// Built once, from [`NattenConfig::from_env`]; a failed build is not cached
/// and the next call tries again.
pub fn host_context() -> NattenResult<&'static HostContext> {
    HOST_CONTEXT.get_or_try_init(|| {
        let config = NattenConfig::from_env()?;
        NattenContext::host(&config)
    })
}
