//! In-process launcher.
//!
//! Light applications are Rust objects living inside the host.  Launching
//! one attaches it to its bridge (typically subscribing to lifecycle
//! events) and reports ready immediately.  They send no heartbeat, so the
//! bridge is implemented with `anr_enabled = false`.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;

use crate::bridge::{AppBridge, BridgeImplementation, BridgeStatus};
use crate::error::{Result, RuntimeError};
use crate::launcher::{Launcher, ProcessHandle};
use crate::types::{AppId, AppMetadata, ExitStatus, ResolvedLaunch, SuspendOptions};

/// An application hosted in-process.
pub trait LightApp: Send + Sync {
    /// Bind to a freshly created bridge.
    fn attach(&self, bridge: &Arc<AppBridge>, mode: &str) -> Result<()>;
}

/// Launcher for [`LightApp`]s registered by app id.
#[derive(Default)]
pub struct LightLauncher {
    apps: DashMap<AppId, Arc<dyn LightApp>>,
}

impl LightLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, app_id: impl Into<AppId>, app: Arc<dyn LightApp>) {
        self.apps.insert(app_id.into(), app);
    }
}

#[async_trait]
impl Launcher for LightLauncher {
    async fn launch(
        &self,
        metadata: &AppMetadata,
        bridge: Arc<AppBridge>,
        mode: &str,
        _options: &ResolvedLaunch,
    ) -> Result<ProcessHandle> {
        let app = self
            .apps
            .get(&metadata.id)
            .map(|a| Arc::clone(a.value()))
            .ok_or_else(|| RuntimeError::LaunchFailed {
                app_id: metadata.id.clone(),
                reason: "no in-process implementation registered".to_string(),
            })?;

        let weak: Weak<AppBridge> = Arc::downgrade(&bridge);
        bridge.implement(BridgeImplementation {
            anr_enabled: false,
            exit: Arc::new(move |_options: SuspendOptions| {
                if let Some(bridge) = weak.upgrade() {
                    bridge.did_exit(ExitStatus::default());
                }
                async {}.boxed()
            }),
        });

        app.attach(&bridge, mode)?;
        bridge.status_report(BridgeStatus::Ready);
        tracing::debug!(app_id = %metadata.id, mode, "light app attached");

        Ok(ProcessHandle { pid: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityRegistry;
    use crate::types::LaunchType;
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counter {
        creates: Arc<AtomicU32>,
    }

    impl LightApp for Counter {
        fn attach(&self, bridge: &Arc<AppBridge>, _mode: &str) -> Result<()> {
            let creates = Arc::clone(&self.creates);
            bridge.subscribe(
                "activity",
                "create",
                Arc::new(move |_| {
                    creates.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            );
            Ok(())
        }
    }

    fn options() -> ResolvedLaunch {
        ResolvedLaunch {
            launch_type: LaunchType::Light,
            mode: "default".into(),
            args: Vec::new(),
            environs: Default::default(),
            daemon: false,
        }
    }

    #[tokio::test]
    async fn launch_attaches_and_reports_ready() {
        let launcher = LightLauncher::new();
        let creates = Arc::new(AtomicU32::new(0));
        launcher.register(
            "clock",
            Arc::new(Counter {
                creates: Arc::clone(&creates),
            }),
        );

        let metadata = AppMetadata::new("clock", LaunchType::Light);
        let bridge = Arc::new(AppBridge::new(metadata.clone(), CapabilityRegistry::new()));
        let handle = launcher
            .launch(&metadata, Arc::clone(&bridge), "default", &options())
            .await
            .expect("launch");

        assert_eq!(handle.pid, None);
        assert!(bridge.is_ready());
        // No heartbeat: exempt from ANR.
        assert!(bridge.last_alive().is_none());

        bridge.emit("activity", "create", &Value::Null).unwrap();
        assert_eq!(creates.load(Ordering::SeqCst), 1);

        bridge.suspend(SuspendOptions::force()).await;
        assert!(bridge.is_exited());
    }

    #[tokio::test]
    async fn unknown_light_app_fails() {
        let launcher = LightLauncher::new();
        let metadata = AppMetadata::new("ghost", LaunchType::Light);
        let bridge = Arc::new(AppBridge::new(metadata.clone(), CapabilityRegistry::new()));
        let err = launcher
            .launch(&metadata, bridge, "default", &options())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::LaunchFailed { .. }));
    }
}
