//! Client-side manager for remotely running profiler processes.
//!
//! Talks to the profiler service over HTTP, keeps an in-memory list of
//! running profilers reconciled against a periodic poll, and notifies
//! subscribers whenever that list changes.

pub mod api;
pub mod config;
pub mod error;
pub mod manager;
pub mod profiler;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use config::ServerSettings;
pub use error::{Error, Result};
pub use manager::{ManagerOptions, ProfilerManager, DEFAULT_REFRESH_INTERVAL};
pub use profiler::{HandleCache, ProfilerHandle, ProfilerModel};
