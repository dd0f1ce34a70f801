//! Shared test utilities for pipeline, chaos and integration tests.
//!
//! This module provides:
//! - An in-process cluster (store + change feed + version clock)
//! - Fault-injecting store and transport wrappers
//! - Redis testcontainer setup

#![allow(dead_code, unused_imports, unused_macros)] // Each test binary uses a different subset

pub mod cluster;
pub mod containers;
pub mod faults;

pub use cluster::*;
pub use containers::*;
pub use faults::*;

/// Re-evaluate `$cond` every 10ms until it holds or `$timeout` elapses.
/// Yields whether it held.
macro_rules! eventually {
    ($timeout:expr, $cond:expr) => {{
        let deadline = tokio::time::Instant::now() + $timeout;
        loop {
            if $cond {
                break true;
            }
            if tokio::time::Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }};
}
