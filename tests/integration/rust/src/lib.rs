//! Integration test suite for the application cache
//!
//! This crate provides end-to-end tests that drive the update engine
//! through real storage backends and a real HTTP stack.

/// Re-export components for test convenience
pub mod components {
    pub use appcache;
    pub use appcache_cli;
    pub use async_runtime;
    pub use core_types;
    pub use resource_fetcher;
    pub use response_storage;
}
