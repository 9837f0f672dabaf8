//! Launcher contract.
//!
//! A [`Launcher`] starts an application by whatever means it implements and
//! wires the bridge to the concrete process: it must call
//! [`AppBridge::implement`] with a termination routine and report process
//! exit through [`AppBridge::did_exit`].  The scheduler is agnostic to which
//! launcher serves which [`LaunchType`]; [`LauncherSet`] holds the mapping.
//!
//! - [`LightLauncher`] -- in-process applications, no heartbeat.
//! - [`ProcessLauncher`] -- spawned executables speaking the wire protocol
//!   over stdio.

pub mod light;
pub mod process;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::bridge::AppBridge;
use crate::error::{Result, RuntimeError};
use crate::types::{AppMetadata, LaunchType, ResolvedLaunch};

pub use light::{LightApp, LightLauncher};
pub use process::ProcessLauncher;

/// Handle to a launched application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessHandle {
    /// OS process id, `None` for in-process applications.
    pub pid: Option<u32>,
}

/// Strategy for starting an application.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start `metadata.id` in `mode`.
    ///
    /// Resolves once the launch itself completed.  Readiness is reported
    /// separately through the bridge.
    async fn launch(
        &self,
        metadata: &AppMetadata,
        bridge: Arc<AppBridge>,
        mode: &str,
        options: &ResolvedLaunch,
    ) -> Result<ProcessHandle>;
}

/// Launchers keyed by launch type.
#[derive(Clone, Default)]
pub struct LauncherSet {
    launchers: HashMap<LaunchType, Arc<dyn Launcher>>,
}

impl LauncherSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `launcher` for `launch_type`, replacing any previous one.
    pub fn with(mut self, launch_type: LaunchType, launcher: Arc<dyn Launcher>) -> Self {
        self.launchers.insert(launch_type, launcher);
        self
    }

    pub fn get(&self, app_id: &str, launch_type: LaunchType) -> Result<Arc<dyn Launcher>> {
        self.launchers
            .get(&launch_type)
            .cloned()
            .ok_or_else(|| RuntimeError::NoLauncher {
                app_id: app_id.to_string(),
                launch_type: launch_type.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_launcher_is_an_error() {
        let set = LauncherSet::new().with(LaunchType::Light, Arc::new(LightLauncher::new()));
        assert!(set.get("clock", LaunchType::Light).is_ok());
        assert!(matches!(
            set.get("weather", LaunchType::Exe),
            Err(RuntimeError::NoLauncher { .. })
        ));
    }
}
