//! Coroutine configuration.
//!
//! Library defaults can be overridden per process with environment variables,
//! or per thread with [`crate::runtime::configure`].
//!
//! # Example
//!
//! ```
//! use spool::Config;
//!
//! let config = Config::from_env()
//!     .stack_size(128 * 1024)
//!     .large_alloc_threshold(1024);
//!
//! spool::runtime::configure(config);
//! ```

use std::str::FromStr;

/// Library defaults.
pub mod defaults {
    /// Usable stack bytes per coroutine.
    pub const STACK_SIZE: usize = 64 * 1024;

    /// Smallest stack handed out, smaller requests are rounded up.
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Inaccessible pages below every stack.
    pub const GUARD_PAGES: usize = 1;

    /// Scratch bytes carved from the stack mapping itself.
    pub const ARENA_HEAD_SIZE: usize = 2048;

    /// Size of every additional scratch block.
    pub const ARENA_BLOCK_SIZE: usize = 2048;

    /// Scratch requests above this get a dedicated heap block.
    pub const LARGE_ALLOC_THRESHOLD: usize = 512;

    /// Stacks kept per thread for reuse.
    pub const STACK_POOL_CAPACITY: usize = 64;
}

/// Coroutine configuration with builder pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Usable stack bytes for coroutines created without an explicit size
    pub stack_size: usize,
    /// Guard pages below every stack, 0 disables overflow protection
    pub guard_pages: usize,
    /// Scratch bytes sharing the stack's mapping
    pub arena_head_size: usize,
    /// Size of additional scratch blocks
    pub arena_block_size: usize,
    /// Scratch requests larger than this get their own block
    pub large_alloc_threshold: usize,
    /// Maximum number of stacks kept for reuse
    pub stack_pool_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

impl Config {
    /// Create config from library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `SPOOL_STACK_SIZE` - Usable stack bytes
    /// - `SPOOL_GUARD_PAGES` - Guard pages per stack
    /// - `SPOOL_ARENA_HEAD_SIZE` - Scratch bytes inside the stack mapping
    /// - `SPOOL_ARENA_BLOCK_SIZE` - Size of additional scratch blocks
    /// - `SPOOL_LARGE_ALLOC_THRESHOLD` - Dedicated block threshold
    /// - `SPOOL_STACK_POOL_CAPACITY` - Stacks kept for reuse
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get("SPOOL_STACK_SIZE", defaults::STACK_SIZE),
            guard_pages: env_get("SPOOL_GUARD_PAGES", defaults::GUARD_PAGES),
            arena_head_size: env_get("SPOOL_ARENA_HEAD_SIZE", defaults::ARENA_HEAD_SIZE),
            arena_block_size: env_get("SPOOL_ARENA_BLOCK_SIZE", defaults::ARENA_BLOCK_SIZE),
            large_alloc_threshold: env_get(
                "SPOOL_LARGE_ALLOC_THRESHOLD",
                defaults::LARGE_ALLOC_THRESHOLD,
            ),
            stack_pool_capacity: env_get(
                "SPOOL_STACK_POOL_CAPACITY",
                defaults::STACK_POOL_CAPACITY,
            ),
        }
    }

    /// Create config with library defaults (no env override).
    pub fn new() -> Self {
        Self {
            stack_size: defaults::STACK_SIZE,
            guard_pages: defaults::GUARD_PAGES,
            arena_head_size: defaults::ARENA_HEAD_SIZE,
            arena_block_size: defaults::ARENA_BLOCK_SIZE,
            large_alloc_threshold: defaults::LARGE_ALLOC_THRESHOLD,
            stack_pool_capacity: defaults::STACK_POOL_CAPACITY,
        }
    }

    /// Set the default stack size.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Set the number of guard pages.
    pub fn guard_pages(mut self, pages: usize) -> Self {
        self.guard_pages = pages;
        self
    }

    /// Set the scratch bytes shared with the stack mapping.
    pub fn arena_head_size(mut self, bytes: usize) -> Self {
        self.arena_head_size = bytes;
        self
    }

    /// Set the size of additional scratch blocks.
    pub fn arena_block_size(mut self, bytes: usize) -> Self {
        self.arena_block_size = bytes;
        self
    }

    /// Set the dedicated block threshold.
    pub fn large_alloc_threshold(mut self, bytes: usize) -> Self {
        self.large_alloc_threshold = bytes;
        self
    }

    /// Set how many stacks are kept for reuse.
    pub fn stack_pool_capacity(mut self, stacks: usize) -> Self {
        self.stack_pool_capacity = stacks;
        self
    }

    /// Stack size actually reserved for a request of [requested] bytes.
    pub(crate) fn effective_stack_size(requested: usize) -> usize {
        // 64 byte granularity, the mapping itself is rounded to pages
        let rounded = requested.checked_add(63).map_or(usize::MAX & !63, |n| n & !63);
        rounded.max(defaults::MIN_STACK_SIZE)
    }
}

/// Get environment variable parsed as type T, or return default.
fn env_get<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_uses_defaults() {
        let config = Config::new();

        assert_eq!(config.stack_size, defaults::STACK_SIZE);
        assert_eq!(config.guard_pages, defaults::GUARD_PAGES);
        assert_eq!(config.large_alloc_threshold, 512);
    }

    #[test]
    fn builder_overrides() {
        let config = Config::new()
            .stack_size(1 << 20)
            .guard_pages(0)
            .arena_head_size(0)
            .arena_block_size(4096)
            .large_alloc_threshold(64)
            .stack_pool_capacity(0);

        assert_eq!(config.stack_size, 1 << 20);
        assert_eq!(config.guard_pages, 0);
        assert_eq!(config.arena_head_size, 0);
        assert_eq!(config.arena_block_size, 4096);
        assert_eq!(config.large_alloc_threshold, 64);
        assert_eq!(config.stack_pool_capacity, 0);
    }

    #[test]
    fn env_get_falls_back() {
        assert_eq!(env_get("SPOOL_TEST_UNSET_VARIABLE", 7usize), 7);
    }

    #[test]
    fn env_get_parses() {
        std::env::set_var("SPOOL_TEST_PARSED_VARIABLE", "4096");

        assert_eq!(env_get("SPOOL_TEST_PARSED_VARIABLE", 7usize), 4096);
    }

    #[test]
    fn stack_size_rounding() {
        assert_eq!(Config::effective_stack_size(0), defaults::MIN_STACK_SIZE);
        assert_eq!(Config::effective_stack_size(100_001), 100_032);
        assert_eq!(Config::effective_stack_size(128 * 1024), 128 * 1024);
    }
}
