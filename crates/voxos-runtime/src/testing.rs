//! Scripted launcher and recording app shared by unit tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;

use crate::bridge::{AppBridge, BridgeImplementation, BridgeStatus};
use crate::capability::CapabilityRegistry;
use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::launcher::{LightApp, Launcher, LauncherSet, ProcessHandle};
use crate::registry::AppRegistry;
use crate::scheduler::AppScheduler;
use crate::signal::SignalBus;
use crate::types::{
    AppMetadata, DESTROYED_NOTICE, ExitStatus, LIFECYCLE_NAMESPACE, LaunchType, ResolvedLaunch,
    SuspendOptions,
};

/// Launcher whose apps behave according to a few switches.
#[derive(Clone)]
pub struct TestLauncher {
    launches: Arc<AtomicU32>,
    exits: Arc<Mutex<Vec<SuspendOptions>>>,
    report_ready: bool,
    heartbeat: bool,
    stubborn: bool,
    ignore_graceful: bool,
    delay: Duration,
}

impl TestLauncher {
    /// Apps report ready during launch and exit when asked.
    pub fn ready() -> Self {
        Self {
            launches: Arc::new(AtomicU32::new(0)),
            exits: Arc::new(Mutex::new(Vec::new())),
            report_ready: true,
            heartbeat: false,
            stubborn: false,
            ignore_graceful: false,
            delay: Duration::ZERO,
        }
    }

    /// Apps never report ready.
    pub fn silent() -> Self {
        Self {
            report_ready: false,
            ..Self::ready()
        }
    }

    /// Apps ignore exit requests.
    pub fn stubborn(mut self) -> Self {
        self.stubborn = true;
        self
    }

    /// Apps only exit when the request is forced.
    pub fn ignores_graceful(mut self) -> Self {
        self.ignore_graceful = true;
        self
    }

    /// Apps are subject to liveness checks.
    pub fn with_heartbeat(mut self) -> Self {
        self.heartbeat = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn launch_count(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn exit_requests(&self) -> Vec<SuspendOptions> {
        self.exits.lock().unwrap().clone()
    }
}

#[async_trait]
impl Launcher for TestLauncher {
    async fn launch(
        &self,
        _metadata: &AppMetadata,
        bridge: Arc<AppBridge>,
        _mode: &str,
        _options: &ResolvedLaunch,
    ) -> Result<ProcessHandle> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let exits = Arc::clone(&self.exits);
        let stubborn = self.stubborn;
        let ignore_graceful = self.ignore_graceful;
        let weak = Arc::downgrade(&bridge);
        bridge.implement(BridgeImplementation {
            anr_enabled: self.heartbeat,
            exit: Arc::new(move |options: SuspendOptions| {
                exits.lock().unwrap().push(options);
                if !stubborn && (options.force || !ignore_graceful) {
                    if let Some(bridge) = weak.upgrade() {
                        bridge.did_exit(ExitStatus {
                            code: None,
                            signal: Some(if options.force { 9 } else { 15 }),
                        });
                    }
                }
                async {}.boxed()
            }),
        });

        if self.report_ready {
            bridge.status_report(BridgeStatus::Ready);
        }
        Ok(ProcessHandle { pid: Some(4242) })
    }
}

/// A scheduler serving both launch types through `launcher`.
pub fn scheduler_with(launcher: &TestLauncher, apps: Vec<AppMetadata>) -> AppScheduler {
    let launcher: Arc<dyn Launcher> = Arc::new(launcher.clone());
    AppScheduler::new(
        RuntimeConfig::default(),
        AppRegistry::from_apps(apps),
        CapabilityRegistry::new(),
        LauncherSet::new()
            .with(LaunchType::Exe, Arc::clone(&launcher))
            .with(LaunchType::Light, launcher),
        SignalBus::new(64),
    )
}

/// In-process app appending `app:event` to a shared log for every lifecycle
/// event it receives.
pub struct Recorder {
    log: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new(log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            log: Arc::clone(log),
        })
    }
}

impl LightApp for Recorder {
    fn attach(&self, bridge: &Arc<AppBridge>, _mode: &str) -> Result<()> {
        for event in ["create", "request", "pause", "resume", "destroy", DESTROYED_NOTICE] {
            let log = Arc::clone(&self.log);
            let entry = format!("{}:{event}", bridge.app_id());
            bridge.subscribe(
                LIFECYCLE_NAMESPACE,
                event,
                Arc::new(move |_: &Value| {
                    log.lock().unwrap().push(entry.clone());
                    Ok(())
                }),
            );
        }
        Ok(())
    }
}
