//! Runtime context.
//!
//! [`Runtime`] is constructed once and owns the signal bus, the scheduler
//! and the lifecycle manager.  Its lifecycle is explicit: [`Runtime::new`],
//! [`Runtime::start`], [`Runtime::shutdown`].  The speech pipeline hands NLU
//! results to [`Runtime::handle_nlu`].

use std::sync::Mutex;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::capability::CapabilityRegistry;
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::launcher::LauncherSet;
use crate::lifecycle::LifecycleManager;
use crate::lock;
use crate::registry::AppRegistry;
use crate::scheduler::AppScheduler;
use crate::signal::{RuntimeSignal, SignalBus};
use crate::types::{CLOUD_APP_ID, LaunchOptions, LifecycleEvent, Nlu, SuspendOptions};

/// The application runtime.
pub struct Runtime {
    apps: AppRegistry,
    signals: SignalBus,
    scheduler: AppScheduler,
    lifecycle: LifecycleManager,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    pub fn new(
        config: RuntimeConfig,
        apps: AppRegistry,
        capabilities: CapabilityRegistry,
        launchers: LauncherSet,
    ) -> Self {
        tracing::debug!(
            namespaces = capabilities.namespace_count(),
            "capability namespaces registered"
        );
        let signals = SignalBus::new(config.signal_capacity);
        let scheduler = AppScheduler::new(
            config,
            apps.clone(),
            capabilities,
            launchers,
            signals.clone(),
        );
        let lifecycle = LifecycleManager::new(scheduler.clone(), signals.clone());
        Self {
            apps,
            signals,
            scheduler,
            lifecycle,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start the ANR sentinel and the lifecycle exit watcher, and launch
    /// every installed daemon app.
    pub fn start(&self) {
        let mut tasks = lock(&self.tasks);
        tasks.push(self.scheduler.start());
        tasks.push(self.lifecycle.start());

        for app_id in self.apps.daemons() {
            let scheduler = self.scheduler.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(err) = scheduler.create_app(&app_id, LaunchOptions::default()).await {
                    tracing::error!(app_id = %app_id, error = %err, "daemon app failed to start");
                }
            }));
        }
        tracing::info!(apps = self.apps.count(), "runtime started");
    }

    /// Dispatch an NLU result: activate the target app preemptively, then
    /// deliver the result as a `request` event.
    pub async fn handle_nlu(&self, nlu: Nlu) -> Result<()> {
        let app_id = if nlu.cloud {
            CLOUD_APP_ID
        } else {
            nlu.app_id.as_str()
        };
        let form = match nlu.form {
            Some(form) => form,
            None => self.apps.get(app_id)?.form,
        };
        tracing::info!(app_id, intent = %nlu.intent, form = %form, "nlu received");

        self.lifecycle.create_or_resume_app(app_id, form, true).await?;

        let params = serde_json::to_value(&nlu).map_err(|e| RuntimeError::Internal(e.to_string()))?;
        self.lifecycle
            .on_lifecycle(app_id, form, LifecycleEvent::Request, params)
            .await
    }

    /// Tear everything down: destroy the stacks, stop relaunching daemons,
    /// force-suspend every app and stop background tasks.
    pub async fn shutdown(&self) {
        tracing::info!("runtime shutting down");
        self.lifecycle.destroy_all().await;
        self.scheduler.shutdown();

        for (app_id, result) in self.scheduler.suspend_all_apps(SuspendOptions::force()).await {
            if let Err(err) = result {
                tracing::warn!(app_id = %app_id, error = %err, "app did not shut down cleanly");
            }
        }
        self.lifecycle.stop();

        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            if !task.is_finished() {
                task.abort();
            }
            let _ = task.await;
        }
        tracing::info!("runtime stopped");
    }

    pub fn scheduler(&self) -> &AppScheduler {
        &self.scheduler
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn apps(&self) -> &AppRegistry {
        &self.apps
    }

    pub fn subscribe(&self) -> broadcast::Receiver<std::sync::Arc<RuntimeSignal>> {
        self.signals.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::LightLauncher;
    use crate::testing::{Recorder, TestLauncher};
    use crate::types::{AppMetadata, AppStatus, Form, LaunchType};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn runtime(log: &Arc<Mutex<Vec<String>>>, launcher: &TestLauncher) -> Runtime {
        let light = LightLauncher::new();
        light.register("weather", Recorder::new(log));
        light.register(CLOUD_APP_ID, Recorder::new(log));

        let apps = AppRegistry::from_apps(vec![
            AppMetadata::new("weather", LaunchType::Light).with_form(Form::Scene),
            AppMetadata::new(CLOUD_APP_ID, LaunchType::Light),
            AppMetadata::new("keeper", LaunchType::Exe).with_daemon(true),
        ]);
        Runtime::new(
            RuntimeConfig::default(),
            apps,
            CapabilityRegistry::new(),
            LauncherSet::new()
                .with(LaunchType::Light, Arc::new(light))
                .with(LaunchType::Exe, Arc::new(launcher.clone())),
        )
    }

    fn nlu(app_id: &str, cloud: bool) -> Nlu {
        Nlu {
            app_id: app_id.to_string(),
            intent: "ask_weather".into(),
            slots: json!({ "city": "Hangzhou" }),
            form: None,
            cloud,
        }
    }

    #[tokio::test]
    async fn nlu_creates_then_requests() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let rt = runtime(&log, &TestLauncher::ready());

        rt.handle_nlu(nlu("weather", false)).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["weather:create", "weather:request"]);

        let top = rt.lifecycle().top().unwrap();
        assert_eq!(top.app_id, "weather");
        assert_eq!(top.form, Form::Scene);
    }

    #[tokio::test]
    async fn cloud_results_go_to_cloud_app() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let rt = runtime(&log, &TestLauncher::ready());

        rt.handle_nlu(nlu("some-remote-skill", true)).await.unwrap();
        let top = rt.lifecycle().top().unwrap();
        assert_eq!(top.app_id, CLOUD_APP_ID);
        assert!(top.cloud);
    }

    #[tokio::test]
    async fn unknown_app_is_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let rt = runtime(&log, &TestLauncher::ready());

        let err = rt.handle_nlu(nlu("ghost", false)).await.unwrap_err();
        assert!(matches!(err, RuntimeError::AppNotInstalled { .. }));
    }

    #[tokio::test]
    async fn start_launches_daemons_and_shutdown_stops_them() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let launcher = TestLauncher::ready();
        let rt = runtime(&log, &launcher);

        rt.start();
        tokio::time::timeout(Duration::from_secs(1), async {
            while rt.scheduler().status("keeper") != AppStatus::Running {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("daemon running");

        rt.handle_nlu(nlu("weather", false)).await.unwrap();
        rt.shutdown().await;

        assert!(log.lock().unwrap().contains(&"weather:destroy".to_string()));
        assert_eq!(rt.scheduler().status("keeper"), AppStatus::Exited);
        assert!(launcher.exit_requests()[0].force);
        assert!(rt.lifecycle().foreground().is_empty());
    }
}
