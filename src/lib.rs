#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod config;
mod core;
mod error;
pub mod executor;
pub mod func;
pub mod graph;
pub mod scheduler;
pub mod sync;
pub mod wire;

pub use crate::config::{RemoteConfig, ServiceConfig};
pub use crate::core::*;
pub use crate::error::*;
pub use crate::executor::{
    Outcome, QueueFunc, QueueFuncRegistry, StartParam, TaskExecutor, TaskQueueExecutor,
    ThreadedTaskExecutor,
};
#[cfg(feature = "remote")]
pub use crate::executor::{RemoteExecutorService, RemoteTaskExecutor, ServiceHandle};
pub use crate::func::{Capability, TaskFunc, TaskFuncRegistry, TaskState};
pub use crate::graph::{Fingerprint, TaskGraph, TaskGraphBuilder};
pub use crate::scheduler::{Cache, ParallelTaskScheduler, Run, TaskGraphExecutor, Ticket};
pub use crate::sync::{CancelController, Canceller, Checker, Resumer, ThreadNotifier};
pub use crate::wire::{Codec, CodecRegistry};

/// Installs a global `fmt` subscriber filtered by `RUST_LOG`, defaulting to
/// `info`. Does nothing if a subscriber is already installed.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        tracing::debug!("global subscriber already installed");
    }
}
