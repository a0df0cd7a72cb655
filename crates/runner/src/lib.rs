//! Host runner for cpulink core models.
//!
//! Supplies the host half of the protocol: a bounds-checked, page-protected
//! [`MemoryRegion`], the [`RunnerEnv`] environment bound to it, and a
//! [`Scheduler`] that drives core models on one thread each with
//! quantum/overshoot accounting. The `cpulink-run` binary wires these to a
//! command line and the in-process factory registry.

/// The memory transaction engine.
pub mod memory;
pub use memory::{MemoryError, MemoryRegion};

/// The runner's environment implementation.
pub mod env;
pub use env::{CoreMailbox, RunnerEnv};

/// Thread-per-core scheduling.
pub mod sched;
pub use sched::{CoreRunReport, Scheduler, PS_PER_INSN};

use cpulink_minicore::MiniCoreFactory;
use cpulink_protocol::FactoryRegistry;
use std::sync::Arc;

/// Builds the registry of core providers compiled into this runner.
#[must_use]
pub fn default_registry() -> FactoryRegistry {
    let mut registry = FactoryRegistry::new();
    registry
        .register(Arc::new(MiniCoreFactory::new()))
        .unwrap_or_else(|_| unreachable!("empty registry accepts the first provider"));
    registry
}

#[cfg(test)]
use proptest as _;
#[cfg(test)]
use rstest as _;
