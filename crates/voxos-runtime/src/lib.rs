//! voxos application runtime.
//!
//! This crate decides which voice application runs, in which lifecycle
//! state, and how its process talks to the host:
//!
//! - **[`scheduler`]** -- Per-app status machine, de-duplicated creation and
//!   suspension, ANR sentinel and daemon relaunch.
//! - **[`bridge`]** -- Host-side proxy of one application instance:
//!   subscriptions, capability invocation, readiness and liveness.
//! - **[`event_bus`]** / **[`protocol`]** -- The host/application message
//!   protocol of externally hosted apps.
//! - **[`lifecycle`]** -- Foreground stack, background set and the
//!   scene/cut preemption policy.
//! - **[`launcher`]** -- Launch strategies (in-process, spawned executable).
//! - **[`runtime`]** -- The context object tying everything together.
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod bridge;
pub mod capability;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod launcher;
pub mod lifecycle;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod signal;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export the most commonly used types at the crate root for convenience.
pub use bridge::{AppBridge, BridgeImplementation, BridgeStatus};
pub use capability::{CapabilityRegistry, InvocationContext};
pub use config::{RuntimeConfig, RuntimeFile};
pub use error::{Result, RuntimeError};
pub use launcher::{Launcher, LauncherSet, LightApp, LightLauncher, ProcessHandle, ProcessLauncher};
pub use lifecycle::{Domain, LifecycleManager, StackEntry};
pub use registry::AppRegistry;
pub use runtime::Runtime;
pub use scheduler::AppScheduler;
pub use signal::{RuntimeSignal, SignalBus};
pub use types::{
    AppId, AppMetadata, AppStatus, ExitStatus, Form, LaunchOptions, LaunchType, LifecycleEvent,
    Nlu, SuspendOptions,
};

/// Lock a std mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
