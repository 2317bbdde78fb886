//! Tunables shared by the region sets of a [`crate::ScopeController`].

use serde::{Deserialize, Serialize};

use crate::Error;

/// Cache line size used when the host cannot tell us.
pub const DEFAULT_CACHE_LINE_SIZE: usize = 64;

/// Largest access size with its own histogram bucket.
/// Vector instructions on current x86 top out at 64 bytes (AVX-512).
pub const DEFAULT_MAX_ACCESS_SIZE: usize = 64;

/// Configuration of the region tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilerConfig {
    /// Granularity for the `cache_line_increments` / `cache_line_decrements` counters
    pub cache_line_size: usize,
    /// Accesses bigger than this are counted in the overflow bucket
    pub max_access_size: usize,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            cache_line_size: host_cache_line_size(),
            max_access_size: DEFAULT_MAX_ACCESS_SIZE,
        }
    }
}

impl ProfilerConfig {
    /// Create a config with explicit values
    pub fn new(cache_line_size: usize, max_access_size: usize) -> Result<Self, Error> {
        Self::default()
            .with_cache_line_size(cache_line_size)?
            .with_max_access_size(max_access_size)
    }

    /// Override the cache line size. Must be non-zero.
    pub fn with_cache_line_size(mut self, cache_line_size: usize) -> Result<Self, Error> {
        if cache_line_size == 0 {
            return Err(Error::illegal_argument("cache line size must be non-zero"));
        }
        self.cache_line_size = cache_line_size;
        Ok(self)
    }

    /// Override the largest access size that gets its own histogram bucket. Must be non-zero.
    pub fn with_max_access_size(mut self, max_access_size: usize) -> Result<Self, Error> {
        if max_access_size == 0 {
            return Err(Error::illegal_argument("max access size must be non-zero"));
        }
        self.max_access_size = max_access_size;
        Ok(self)
    }
}

/// Level 1 data cache line size of the machine we run on.
#[cfg(all(feature = "std", target_os = "linux"))]
#[must_use]
pub fn host_cache_line_size() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_LEVEL1_DCACHE_LINESIZE) };
    if ret <= 0 {
        log::debug!("sysconf did not report a cache line size, using {DEFAULT_CACHE_LINE_SIZE}");
        DEFAULT_CACHE_LINE_SIZE
    } else {
        #[allow(clippy::cast_sign_loss)]
        let size = ret as usize;
        size
    }
}

/// Level 1 data cache line size of the machine we run on.
#[cfg(not(all(feature = "std", target_os = "linux")))]
#[must_use]
pub fn host_cache_line_size() -> usize {
    DEFAULT_CACHE_LINE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_usable() {
        let config = ProfilerConfig::default();
        assert!(config.cache_line_size > 0);
        assert_eq!(config.max_access_size, DEFAULT_MAX_ACCESS_SIZE);
    }

    #[test]
    fn test_rejects_zero() {
        assert!(ProfilerConfig::new(0, 64).is_err());
        assert!(ProfilerConfig::new(64, 0).is_err());
        let config = ProfilerConfig::new(128, 32).unwrap();
        assert_eq!(config.cache_line_size, 128);
        assert_eq!(config.max_access_size, 32);
    }
}
