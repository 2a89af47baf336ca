//! Engine configuration
//!
//! [`NattenConfig`] sizes the per-context resources: the buffer pool's
//! smallest size class, the kernel cache arena and the host device limits.
//! It can be built in code, read from `NATTEN_*` environment variables or
//! loaded from JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{NattenError, NattenResult};

const POOL_MIN_SIZE_CLASS_ENV: &str = "NATTEN_POOL_MIN_SIZE_CLASS";
const KERNEL_CACHE_CAPACITY_ENV: &str = "NATTEN_KERNEL_CACHE_CAPACITY";
const DEVICE_MEMORY_LIMIT_ENV: &str = "NATTEN_DEVICE_MEMORY_LIMIT";
const HOST_WORKER_THREADS_ENV: &str = "NATTEN_HOST_WORKER_THREADS";

/// Configuration for a compute context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NattenConfig {
    /// Smallest pooled buffer size in bytes; must be a power of two
    pub pool_min_size_class: usize,

    /// Number of program slots in the kernel cache arena
    pub kernel_cache_capacity: usize,

    /// Cap on bytes the host device may hold at once (`None` = unbounded)
    pub device_memory_limit: Option<usize>,

    /// Worker threads for the host device (`None` = rayon default)
    pub host_worker_threads: Option<usize>,
}

impl Default for NattenConfig {
    fn default() -> Self {
        NattenConfig {
            pool_min_size_class: 256,
            kernel_cache_capacity: 32,
            device_memory_limit: None,
            host_worker_threads: None,
        }
    }
}

impl NattenConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool_min_size_class(mut self, bytes: usize) -> Self {
        self.pool_min_size_class = bytes;
        self
    }

    pub fn with_kernel_cache_capacity(mut self, slots: usize) -> Self {
        self.kernel_cache_capacity = slots;
        self
    }

    pub fn with_device_memory_limit(mut self, bytes: usize) -> Self {
        self.device_memory_limit = Some(bytes);
        self
    }

    pub fn with_host_worker_threads(mut self, threads: usize) -> Self {
        self.host_worker_threads = Some(threads);
        self
    }

    /// Defaults overridden by any `NATTEN_*` variable that is set.
    ///
    /// A variable that is set but does not parse is an error rather than
    /// silently ignored.
    pub fn from_env() -> NattenResult<Self> {
        let mut config = NattenConfig::default();

        if let Some(bytes) = read_env_usize(POOL_MIN_SIZE_CLASS_ENV)? {
            config.pool_min_size_class = bytes;
        }
        if let Some(slots) = read_env_usize(KERNEL_CACHE_CAPACITY_ENV)? {
            config.kernel_cache_capacity = slots;
        }
        if let Some(bytes) = read_env_usize(DEVICE_MEMORY_LIMIT_ENV)? {
            config.device_memory_limit = Some(bytes);
        }
        if let Some(threads) = read_env_usize(HOST_WORKER_THREADS_ENV)? {
            config.host_worker_threads = Some(threads);
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> NattenResult<Self> {
        let config: NattenConfig = serde_json::from_str(json)
            .map_err(|e| NattenError::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> NattenResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> NattenResult<()> {
        if !self.pool_min_size_class.is_power_of_two() {
            return Err(NattenError::InvalidConfiguration(format!(
                "pool_min_size_class must be a power of two, got {}",
                self.pool_min_size_class
            )));
        }
        if self.kernel_cache_capacity == 0 {
            return Err(NattenError::InvalidConfiguration(
                "kernel_cache_capacity must be > 0".to_string(),
            ));
        }
        if self.host_worker_threads == Some(0) {
            return Err(NattenError::InvalidConfiguration(
                "host_worker_threads must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn read_env_usize(name: &str) -> NattenResult<Option<usize>> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse::<usize>().map(Some).map_err(|e| {
            NattenError::InvalidConfiguration(format!("{}={:?}: {}", name, raw, e))
        }),
        Err(_) => Ok(None),
    }
}
