//! Application scheduler.
//!
//! The scheduler owns every live [`AppBridge`], tracks one [`AppStatus`]
//! per app id and launches applications through the [`LauncherSet`].
//!
//! # Status machine
//!
//! ```text
//! NotRunning --create--> Creating --ready--> Running --suspend--> Suspending
//!     ^                     |                                      |    |
//!     |                     +--failure: force suspend--------------+    |
//!     |                                                     exit ack    timeout
//!     +------------------------------- Exited <-------------+           |
//!                                                                   Error
//! ```
//!
//! From `Error` the next creation force-suspends first.
//!
//! # De-duplication
//!
//! Concurrent `create_app` calls for one app share a single in-flight
//! creation future; concurrent suspensions share a single suspension future.
//! Operations on different apps never wait on each other.
//!
//! # Liveness
//!
//! The ANR sentinel started by [`AppScheduler::start`] checks every live
//! bridge on a fixed interval.  A bridge silent for at least the threshold is
//! force-suspended with a core dump.  Bridges that never reported liveness
//! are exempt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::bridge::AppBridge;
use crate::capability::CapabilityRegistry;
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::launcher::LauncherSet;
use crate::lock;
use crate::registry::AppRegistry;
use crate::signal::{RuntimeSignal, SignalBus};
use crate::types::{
    AppId, AppStatus, DESTROYED_NOTICE, ExitStatus, LIFECYCLE_NAMESPACE, LaunchOptions,
    LaunchType, ResolvedLaunch, SuspendOptions,
};

type SharedCreation = Shared<BoxFuture<'static, Result<Arc<AppBridge>>>>;
type SharedSuspension = Shared<BoxFuture<'static, Result<()>>>;

/// Per-app bookkeeping.  Guarded by one mutex so multi-map transitions are
/// atomic; never held across an await.
#[derive(Default)]
struct SchedulerState {
    bridges: HashMap<AppId, Arc<AppBridge>>,
    status: HashMap<AppId, AppStatus>,
    creations: HashMap<AppId, (u64, SharedCreation)>,
    suspensions: HashMap<AppId, (u64, SharedSuspension)>,
    launches: HashMap<AppId, ResolvedLaunch>,
}

impl SchedulerState {
    fn status_of(&self, app_id: &str) -> AppStatus {
        self.status.get(app_id).copied().unwrap_or_default()
    }

    fn is_current(&self, app_id: &str, bridge: &Arc<AppBridge>) -> bool {
        self.bridges
            .get(app_id)
            .is_some_and(|b| Arc::ptr_eq(b, bridge))
    }
}

/// Scheduler of application processes.
///
/// Cheaply cloneable (`Arc`-backed) and safe to share across tasks.
#[derive(Clone)]
pub struct AppScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    config: RuntimeConfig,
    apps: AppRegistry,
    capabilities: CapabilityRegistry,
    launchers: LauncherSet,
    signals: SignalBus,
    state: Mutex<SchedulerState>,
    tokens: AtomicU64,
    anr_count: AtomicU64,
    notify: Notify,
    shutdown: AtomicBool,
}

/// What `create_app` does after inspecting the status under the lock.
enum CreateStep {
    Done(Arc<AppBridge>),
    Join(SharedCreation),
    AwaitSuspension(SharedSuspension),
    ForceSuspend,
}

impl AppScheduler {
    /// Create a scheduler.  Call [`AppScheduler::start`] to run the ANR
    /// sentinel.
    #[must_use]
    pub fn new(
        config: RuntimeConfig,
        apps: AppRegistry,
        capabilities: CapabilityRegistry,
        launchers: LauncherSet,
        signals: SignalBus,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                apps,
                capabilities,
                launchers,
                signals,
                state: Mutex::new(SchedulerState::default()),
                tokens: AtomicU64::new(1),
                anr_count: AtomicU64::new(0),
                notify: Notify::new(),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn apps(&self) -> &AppRegistry {
        &self.inner.apps
    }

    // -- Creation -----------------------------------------------------------

    /// Create `app_id`, or return the live instance.
    ///
    /// - `Running`: the existing bridge.
    /// - `Creating`: the in-flight creation, shared.
    /// - `Suspending`: waits for the suspension, then creates.
    /// - `Error`: force-suspends, then creates.
    pub async fn create_app(&self, app_id: &str, options: LaunchOptions) -> Result<Arc<AppBridge>> {
        let mut forced = false;
        loop {
            let step = {
                let mut state = lock(&self.inner.state);
                match state.status_of(app_id) {
                    AppStatus::Running if state.bridges.contains_key(app_id) => {
                        CreateStep::Done(Arc::clone(&state.bridges[app_id]))
                    }
                    AppStatus::Creating if state.creations.contains_key(app_id) => {
                        tracing::debug!(app_id, "joining in-flight creation");
                        CreateStep::Join(state.creations[app_id].1.clone())
                    }
                    AppStatus::Suspending if state.suspensions.contains_key(app_id) => {
                        CreateStep::AwaitSuspension(state.suspensions[app_id].1.clone())
                    }
                    AppStatus::Error if !forced => CreateStep::ForceSuspend,
                    _ => {
                        let token = self.next_token();
                        let creation = self
                            .clone()
                            .run_creation(app_id.to_string(), options.clone(), token)
                            .boxed()
                            .shared();
                        state
                            .creations
                            .insert(app_id.to_string(), (token, creation.clone()));
                        self.set_status(&mut state, app_id, AppStatus::Creating);
                        CreateStep::Join(creation)
                    }
                }
            };

            match step {
                CreateStep::Done(bridge) => return Ok(bridge),
                CreateStep::Join(creation) => return creation.await,
                CreateStep::AwaitSuspension(suspension) => {
                    if let Err(err) = suspension.await {
                        tracing::debug!(app_id, error = %err, "pending suspension failed");
                    }
                }
                CreateStep::ForceSuspend => {
                    tracing::info!(app_id, "app in error state, force suspending before create");
                    forced = true;
                    self.suspend_app(app_id, SuspendOptions::force()).await?;
                    let mut state = lock(&self.inner.state);
                    if state.status_of(app_id) == AppStatus::Error {
                        // Nothing left to suspend.
                        state.status.remove(app_id);
                    }
                }
            }
        }
    }

    /// Body of the shared creation future.
    async fn run_creation(self, app_id: AppId, options: LaunchOptions, token: u64) -> Result<Arc<AppBridge>> {
        let started = Instant::now();
        let outcome = self.launch_app(&app_id, options).await;

        match outcome {
            Ok(bridge) => {
                let mut state = lock(&self.inner.state);
                remove_if_token(&mut state.creations, &app_id, token);
                if bridge.is_exited() || !state.is_current(&app_id, &bridge) {
                    return Err(RuntimeError::ExitedBeforeReady { app_id });
                }
                self.set_status(&mut state, &app_id, AppStatus::Running);
                drop(state);
                tracing::info!(
                    app_id = %app_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "app running"
                );
                Ok(bridge)
            }
            Err(err) => {
                tracing::error!(
                    app_id = %app_id,
                    error = %err,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "app creation failed"
                );
                if let Err(suspend_err) = self.suspend_app(&app_id, SuspendOptions::force()).await {
                    tracing::warn!(app_id = %app_id, error = %suspend_err, "cleanup after failed creation");
                }
                let mut state = lock(&self.inner.state);
                remove_if_token(&mut state.creations, &app_id, token);
                if state.status_of(&app_id) == AppStatus::Creating && !state.bridges.contains_key(&app_id) {
                    self.set_status(&mut state, &app_id, AppStatus::NotRunning);
                }
                Err(err)
            }
        }
    }

    /// Resolve options, build the bridge and launch.  Resolves once the app
    /// is ready and the launcher has returned.
    async fn launch_app(&self, app_id: &str, options: LaunchOptions) -> Result<Arc<AppBridge>> {
        let metadata = self.inner.apps.get(app_id)?;
        let resolved = ResolvedLaunch {
            launch_type: options.launch_type.unwrap_or(metadata.launch_type),
            mode: options
                .mode
                .or_else(|| metadata.default_mode.clone())
                .unwrap_or_else(|| self.inner.config.default_mode.clone()),
            args: options.args,
            environs: options.environs,
            daemon: options.daemon || metadata.daemon,
        };
        let launcher = self.inner.launchers.get(app_id, resolved.launch_type)?;

        let bridge = Arc::new(AppBridge::new(
            metadata.clone(),
            self.inner.capabilities.clone(),
        ));
        let ready = bridge
            .take_ready()
            .ok_or_else(|| RuntimeError::Internal("fresh bridge without ready receiver".into()))?;

        let scheduler: Weak<SchedulerInner> = Arc::downgrade(&self.inner);
        let weak_bridge = Arc::downgrade(&bridge);
        let id = app_id.to_string();
        bridge.on_exit(move |status| {
            if let (Some(inner), Some(bridge)) = (scheduler.upgrade(), weak_bridge.upgrade()) {
                AppScheduler { inner }.on_bridge_exit(&id, &bridge, status);
            }
        });

        {
            let mut state = lock(&self.inner.state);
            state.bridges.insert(app_id.to_string(), Arc::clone(&bridge));
            state.launches.insert(app_id.to_string(), resolved.clone());
        }

        tracing::info!(
            app_id,
            launch_type = %resolved.launch_type,
            mode = %resolved.mode,
            daemon = resolved.daemon,
            "launching app"
        );

        let ready_timeout = self.inner.config.ready_timeout;
        let wait_ready = async {
            match tokio::time::timeout(ready_timeout, ready).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(RuntimeError::ExitedBeforeReady {
                    app_id: app_id.to_string(),
                }),
                Err(_) => Err(RuntimeError::CreationTimeout {
                    app_id: app_id.to_string(),
                    timeout: ready_timeout,
                }),
            }
        };
        let launch = launcher.launch(&metadata, Arc::clone(&bridge), &resolved.mode, &resolved);

        let ((), handle) = futures::try_join!(wait_ready, launch)?;
        tracing::debug!(app_id, pid = ?handle.pid, "launch completed");
        Ok(bridge)
    }

    // -- Exit ---------------------------------------------------------------

    /// Exit hook of a bridge; ignores exits of bridges already replaced.
    fn on_bridge_exit(&self, app_id: &str, bridge: &Arc<AppBridge>, status: ExitStatus) {
        let current = lock(&self.inner.state).is_current(app_id, bridge);
        if current {
            self.handle_app_exit(app_id, status);
        } else {
            tracing::debug!(app_id, "exit of a stale bridge ignored");
        }
    }

    /// Release an exited application.  Daemons are relaunched after the
    /// configured delay.
    pub fn handle_app_exit(&self, app_id: &str, status: ExitStatus) {
        let launch = {
            let mut state = lock(&self.inner.state);
            if let Some(bridge) = state.bridges.remove(app_id) {
                bridge.mark_suspended();
            }
            self.set_status(&mut state, app_id, AppStatus::Exited);
            state.launches.remove(app_id)
        };

        tracing::info!(
            app_id,
            code = ?status.code,
            signal = ?status.signal,
            "app exit handled"
        );
        self.inner.signals.publish(RuntimeSignal::AppExited {
            app_id: app_id.to_string(),
            status,
            timestamp: Utc::now(),
        });

        if let Some(launch) = launch.filter(|l| l.daemon) {
            self.schedule_restart(app_id.to_string(), launch.to_options());
        }
    }

    /// Relaunch a daemon after the restart delay.
    ///
    /// TODO: crash-loop detection; a daemon that dies on start restarts
    /// every `daemon_restart_delay` forever.
    fn schedule_restart(&self, app_id: AppId, options: LaunchOptions) {
        if self.is_shut_down() {
            return;
        }
        let delay = self.inner.config.daemon_restart_delay;
        tracing::info!(app_id = %app_id, delay_ms = delay.as_millis() as u64, "daemon exited, relaunch scheduled");

        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if scheduler.is_shut_down() {
                return;
            }
            if let Err(err) = scheduler.create_app(&app_id, options).await {
                tracing::error!(app_id = %app_id, error = %err, "daemon relaunch failed");
            }
        });
    }

    // -- Suspension ---------------------------------------------------------

    /// Terminate `app_id` and wait for its exit.
    ///
    /// No-op for in-process apps, apps without a bridge, and daemons unless
    /// `force` is set; joins the pending suspension if one is in flight.  Fails with
    /// [`RuntimeError::SuspensionTimeout`] (status `Error`) if the app does
    /// not exit in time.
    pub async fn suspend_app(&self, app_id: &str, options: SuspendOptions) -> Result<()> {
        match self.begin_suspension(app_id, options) {
            Some(suspension) => suspension.await,
            None => Ok(()),
        }
    }

    /// Synchronous half of [`AppScheduler::suspend_app`]: status becomes
    /// `Suspending` before this returns.
    pub(crate) fn begin_suspension(&self, app_id: &str, options: SuspendOptions) -> Option<SharedSuspension> {
        let (bridge, suspension) = {
            let mut state = lock(&self.inner.state);
            let bridge = Arc::clone(state.bridges.get(app_id)?);

            if let Some(launch) = state.launches.get(app_id) {
                if launch.launch_type == LaunchType::Light {
                    tracing::debug!(app_id, "in-process app, nothing to suspend");
                    return None;
                }
                if launch.daemon && !options.force {
                    tracing::debug!(app_id, "daemon app only suspends when forced");
                    return None;
                }
            }
            if let Some((_, pending)) = state.suspensions.get(app_id) {
                tracing::debug!(app_id, "already suspending");
                return Some(pending.clone());
            }

            self.set_status(&mut state, app_id, AppStatus::Suspending);
            let token = self.next_token();
            let suspension = self
                .clone()
                .run_suspension(app_id.to_string(), Arc::clone(&bridge), options, token)
                .boxed()
                .shared();
            state
                .suspensions
                .insert(app_id.to_string(), (token, suspension.clone()));
            (bridge, suspension)
        };

        if let Err(err) = bridge.emit(LIFECYCLE_NAMESPACE, DESTROYED_NOTICE, &Value::Null) {
            tracing::debug!(app_id, error = %err, "destroyed notice not delivered");
        }
        Some(suspension)
    }

    /// Body of the shared suspension future.
    async fn run_suspension(
        self,
        app_id: AppId,
        bridge: Arc<AppBridge>,
        options: SuspendOptions,
        token: u64,
    ) -> Result<()> {
        let timeout = self.inner.config.suspend_timeout;
        bridge.suspend(options).await;
        let acknowledged = tokio::time::timeout(timeout, bridge.wait_exited())
            .await
            .is_ok();

        let mut state = lock(&self.inner.state);
        remove_if_token(&mut state.suspensions, &app_id, token);
        if acknowledged {
            return Ok(());
        }

        tracing::warn!(
            app_id = %app_id,
            timeout_ms = timeout.as_millis() as u64,
            "app did not exit after suspension"
        );
        if state.is_current(&app_id, &bridge) {
            self.set_status(&mut state, &app_id, AppStatus::Error);
        }
        Err(RuntimeError::SuspensionTimeout { app_id, timeout })
    }

    /// Suspend every live app concurrently; resolves when all settle.
    pub async fn suspend_all_apps(&self, options: SuspendOptions) -> Vec<(AppId, Result<()>)> {
        let app_ids: Vec<AppId> = lock(&self.inner.state).bridges.keys().cloned().collect();
        let results = futures::future::join_all(
            app_ids.iter().map(|app_id| self.suspend_app(app_id, options)),
        )
        .await;
        app_ids.into_iter().zip(results).collect()
    }

    // -- ANR sentinel -------------------------------------------------------

    /// Spawn the ANR sentinel.  Resolves when the scheduler is shut down.
    pub fn start(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let period = scheduler.inner.config.anr_check_interval;
            if period.is_zero() {
                tracing::error!("anr check interval is zero, sentinel not started");
                return;
            }
            tracing::info!(interval_ms = period.as_millis() as u64, "anr sentinel started");
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        scheduler.check_liveness();
                    }
                    _ = scheduler.inner.notify.notified() => {}
                }
                if scheduler.is_shut_down() {
                    break;
                }
            }
            tracing::info!("anr sentinel stopped");
        })
    }

    /// One sentinel pass.  Returns the apps that were force-suspended.
    pub fn check_liveness(&self) -> Vec<AppId> {
        let now = Instant::now();
        let threshold = self.inner.config.anr_threshold;

        let stale: Vec<(AppId, std::time::Duration)> = {
            let state = lock(&self.inner.state);
            state
                .bridges
                .iter()
                .filter(|(app_id, _)| state.status_of(app_id) != AppStatus::Suspending)
                .filter_map(|(app_id, bridge)| {
                    let elapsed = now.saturating_duration_since(bridge.last_alive()?);
                    (elapsed >= threshold).then(|| (app_id.clone(), elapsed))
                })
                .collect()
        };

        let mut suspended = Vec::with_capacity(stale.len());
        for (app_id, elapsed) in stale {
            let count = self.inner.anr_count.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                app_id = %app_id,
                elapsed_ms = elapsed.as_millis() as u64,
                anr_count = count,
                "application not responding, force suspending"
            );
            self.inner.signals.publish(RuntimeSignal::AppNotResponding {
                app_id: app_id.clone(),
                elapsed_ms: elapsed.as_millis() as u64,
                timestamp: Utc::now(),
            });

            if let Some(suspension) = self.begin_suspension(&app_id, SuspendOptions::force_with_core()) {
                let id = app_id.clone();
                tokio::spawn(async move {
                    if let Err(err) = suspension.await {
                        tracing::error!(app_id = %id, error = %err, "anr suspension failed");
                    }
                });
            }
            suspended.push(app_id);
        }
        suspended
    }

    /// Number of ANR detections since startup.
    pub fn anr_count(&self) -> u64 {
        self.inner.anr_count.load(Ordering::Relaxed)
    }

    /// Stop the sentinel and refuse daemon relaunches.
    pub fn shutdown(&self) {
        tracing::info!("scheduler shutdown requested");
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    // -- Introspection ------------------------------------------------------

    pub fn status(&self, app_id: &str) -> AppStatus {
        lock(&self.inner.state).status_of(app_id)
    }

    /// Snapshot of every known app's status.
    pub fn statuses(&self) -> HashMap<AppId, AppStatus> {
        lock(&self.inner.state).status.clone()
    }

    pub fn bridge(&self, app_id: &str) -> Option<Arc<AppBridge>> {
        lock(&self.inner.state).bridges.get(app_id).cloned()
    }

    /// Resolved launch options of a live app.
    pub fn launch_options(&self, app_id: &str) -> Option<ResolvedLaunch> {
        lock(&self.inner.state).launches.get(app_id).cloned()
    }

    // -- Helpers ------------------------------------------------------------

    fn next_token(&self) -> u64 {
        self.inner.tokens.fetch_add(1, Ordering::Relaxed)
    }

    fn set_status(&self, state: &mut SchedulerState, app_id: &str, status: AppStatus) {
        let previous = state.status_of(app_id);
        if status == AppStatus::NotRunning {
            state.status.remove(app_id);
        } else {
            state.status.insert(app_id.to_string(), status);
        }
        if previous != status {
            tracing::debug!(app_id, from = %previous, to = %status, "app status changed");
            self.inner.signals.publish(RuntimeSignal::AppStatusChanged {
                app_id: app_id.to_string(),
                status,
                timestamp: Utc::now(),
            });
        }
    }
}

fn remove_if_token<F>(map: &mut HashMap<AppId, (u64, F)>, app_id: &str, token: u64) {
    if map.get(app_id).is_some_and(|(t, _)| *t == token) {
        map.remove(app_id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestLauncher, scheduler_with};
    use crate::types::{AppMetadata, LaunchType};
    use std::time::Duration;

    #[tokio::test]
    async fn create_runs_app() {
        let launcher = TestLauncher::ready();
        let scheduler = scheduler_with(&launcher, vec![AppMetadata::new("weather", LaunchType::Exe)]);

        let bridge = scheduler
            .create_app("weather", LaunchOptions::default())
            .await
            .expect("create");
        assert_eq!(bridge.app_id(), "weather");
        assert_eq!(scheduler.status("weather"), AppStatus::Running);
        assert_eq!(
            scheduler.launch_options("weather").unwrap().mode,
            "default"
        );

        // Idempotent while running.
        let again = scheduler
            .create_app("weather", LaunchOptions::default())
            .await
            .expect("create again");
        assert!(Arc::ptr_eq(&bridge, &again));
        assert_eq!(launcher.launch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_creates_launch_once() {
        let launcher = TestLauncher::ready().with_delay(Duration::from_millis(500));
        let scheduler = scheduler_with(&launcher, vec![AppMetadata::new("music", LaunchType::Exe)]);

        let (a, b, c) = tokio::join!(
            scheduler.create_app("music", LaunchOptions::default()),
            scheduler.create_app("music", LaunchOptions::default()),
            scheduler.create_app("music", LaunchOptions::default()),
        );
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&b, &c));
        assert_eq!(launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn uninstalled_app_fails_and_resets() {
        let launcher = TestLauncher::ready();
        let scheduler = scheduler_with(&launcher, Vec::new());

        let err = scheduler
            .create_app("ghost", LaunchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::AppNotInstalled { .. }));
        assert_eq!(scheduler.status("ghost"), AppStatus::NotRunning);
        assert_eq!(launcher.launch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn creation_timeout_kills_app() {
        let launcher = TestLauncher::silent();
        let scheduler = scheduler_with(&launcher, vec![AppMetadata::new("slow", LaunchType::Exe)]);

        let err = scheduler
            .create_app("slow", LaunchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::CreationTimeout { .. }));

        let exits = launcher.exit_requests();
        assert_eq!(exits.len(), 1);
        assert!(exits[0].force);
        assert_eq!(scheduler.status("slow"), AppStatus::Exited);
        assert!(scheduler.bridge("slow").is_none());
    }

    #[tokio::test]
    async fn light_apps_are_not_suspended() {
        let launcher = TestLauncher::ready();
        let scheduler = scheduler_with(&launcher, vec![AppMetadata::new("clock", LaunchType::Light)]);

        scheduler
            .create_app("clock", LaunchOptions::default())
            .await
            .expect("create");
        scheduler
            .suspend_app("clock", SuspendOptions::force())
            .await
            .expect("suspend");

        assert!(launcher.exit_requests().is_empty());
        assert_eq!(scheduler.status("clock"), AppStatus::Running);
    }

    #[tokio::test]
    async fn suspend_waits_for_exit() {
        let launcher = TestLauncher::ready();
        let scheduler = scheduler_with(&launcher, vec![AppMetadata::new("weather", LaunchType::Exe)]);
        let bridge = scheduler
            .create_app("weather", LaunchOptions::default())
            .await
            .unwrap();

        scheduler
            .suspend_app("weather", SuspendOptions::default())
            .await
            .expect("suspend");

        assert!(bridge.is_exited());
        assert_eq!(scheduler.status("weather"), AppStatus::Exited);
        assert!(scheduler.bridge("weather").is_none());
        assert_eq!(launcher.exit_requests(), vec![SuspendOptions::default()]);
    }

    #[tokio::test(start_paused = true)]
    async fn suspend_timeout_sets_error_then_create_forces_suspend() {
        let launcher = TestLauncher::ready().stubborn();
        let scheduler = scheduler_with(&launcher, vec![AppMetadata::new("hung", LaunchType::Exe)]);
        scheduler
            .create_app("hung", LaunchOptions::default())
            .await
            .unwrap();

        let err = scheduler
            .suspend_app("hung", SuspendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::SuspensionTimeout { .. }));
        assert_eq!(scheduler.status("hung"), AppStatus::Error);

        // Next creation force-suspends first; the app still refuses to die.
        let err = scheduler
            .create_app("hung", LaunchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::SuspensionTimeout { .. }));
        let exits = launcher.exit_requests();
        assert_eq!(exits.len(), 2);
        assert!(exits[1].force);
    }

    #[tokio::test(start_paused = true)]
    async fn error_state_recovers_when_forced_kill_succeeds() {
        let launcher = TestLauncher::ready().ignores_graceful();
        let scheduler = scheduler_with(&launcher, vec![AppMetadata::new("sticky", LaunchType::Exe)]);
        let first = scheduler
            .create_app("sticky", LaunchOptions::default())
            .await
            .unwrap();

        let err = scheduler
            .suspend_app("sticky", SuspendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::SuspensionTimeout { .. }));
        assert_eq!(scheduler.status("sticky"), AppStatus::Error);
        assert!(!first.is_exited());

        let second = scheduler
            .create_app("sticky", LaunchOptions::default())
            .await
            .expect("relaunched after forced kill");

        assert_eq!(launcher.launch_count(), 2);
        assert_eq!(
            launcher.exit_requests(),
            vec![SuspendOptions::default(), SuspendOptions::force()]
        );
        assert!(first.is_exited());
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(scheduler.status("sticky"), AppStatus::Running);
        assert!(Arc::ptr_eq(&second, &scheduler.bridge("sticky").unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn anr_threshold() {
        let launcher = TestLauncher::ready().with_heartbeat();
        let scheduler = scheduler_with(
            &launcher,
            vec![
                AppMetadata::new("quiet", LaunchType::Exe),
                AppMetadata::new("chatty", LaunchType::Exe),
            ],
        );
        scheduler.create_app("quiet", LaunchOptions::default()).await.unwrap();
        let chatty = scheduler.create_app("chatty", LaunchOptions::default()).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        chatty.status_report(crate::bridge::BridgeStatus::Alive);
        tokio::time::advance(Duration::from_secs(10)).await;

        // quiet: 16s of silence; chatty: 10s.
        assert_eq!(scheduler.check_liveness(), vec!["quiet".to_string()]);
        assert_eq!(scheduler.anr_count(), 1);
        assert_eq!(scheduler.status("quiet"), AppStatus::Suspending);

        // Let the spawned suspension run.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(launcher.exit_requests(), vec![SuspendOptions::force_with_core()]);

        assert_eq!(scheduler.status("quiet"), AppStatus::Exited);
        assert!(scheduler.check_liveness().is_empty());
        assert_eq!(scheduler.anr_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn apps_without_heartbeat_are_exempt() {
        let launcher = TestLauncher::ready();
        let scheduler = scheduler_with(&launcher, vec![AppMetadata::new("mute", LaunchType::Exe)]);
        scheduler.create_app("mute", LaunchOptions::default()).await.unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(scheduler.check_liveness().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn daemon_relaunches_after_delay() {
        let launcher = TestLauncher::ready();
        let scheduler = scheduler_with(
            &launcher,
            vec![AppMetadata::new("keeper", LaunchType::Exe).with_daemon(true)],
        );
        let bridge = scheduler.create_app("keeper", LaunchOptions::default()).await.unwrap();

        bridge.did_exit(ExitStatus {
            code: Some(1),
            signal: None,
        });
        assert_eq!(scheduler.status("keeper"), AppStatus::Exited);

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert_eq!(launcher.launch_count(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(launcher.launch_count(), 2);
        assert_eq!(scheduler.status("keeper"), AppStatus::Running);
    }

    #[tokio::test]
    async fn daemons_resist_unforced_suspension() {
        let launcher = TestLauncher::ready();
        let scheduler = scheduler_with(
            &launcher,
            vec![AppMetadata::new("keeper", LaunchType::Exe).with_daemon(true)],
        );
        scheduler.create_app("keeper", LaunchOptions::default()).await.unwrap();

        scheduler
            .suspend_app("keeper", SuspendOptions::default())
            .await
            .unwrap();
        assert_eq!(scheduler.status("keeper"), AppStatus::Running);
        assert!(launcher.exit_requests().is_empty());

        scheduler.shutdown();
        scheduler
            .suspend_app("keeper", SuspendOptions::force())
            .await
            .unwrap();
        assert_eq!(scheduler.status("keeper"), AppStatus::Exited);
    }

    #[tokio::test(start_paused = true)]
    async fn no_relaunch_after_shutdown() {
        let launcher = TestLauncher::ready();
        let scheduler = scheduler_with(
            &launcher,
            vec![AppMetadata::new("keeper", LaunchType::Exe).with_daemon(true)],
        );
        let bridge = scheduler.create_app("keeper", LaunchOptions::default()).await.unwrap();

        scheduler.shutdown();
        bridge.did_exit(ExitStatus::default());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn suspend_all_settles_every_app() {
        let launcher = TestLauncher::ready();
        let scheduler = scheduler_with(
            &launcher,
            vec![
                AppMetadata::new("a", LaunchType::Exe),
                AppMetadata::new("b", LaunchType::Exe),
            ],
        );
        scheduler.create_app("a", LaunchOptions::default()).await.unwrap();
        scheduler.create_app("b", LaunchOptions::default()).await.unwrap();

        let results = scheduler.suspend_all_apps(SuspendOptions::default()).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert!(scheduler.bridge("a").is_none());
        assert!(scheduler.bridge("b").is_none());
    }

    #[tokio::test]
    async fn exit_publishes_signal() {
        let launcher = TestLauncher::ready();
        let scheduler = scheduler_with(&launcher, vec![AppMetadata::new("weather", LaunchType::Exe)]);
        let mut signals = scheduler.inner.signals.subscribe();
        let bridge = scheduler.create_app("weather", LaunchOptions::default()).await.unwrap();

        bridge.did_exit(ExitStatus::default());

        loop {
            let signal = signals.recv().await.expect("signal");
            if let RuntimeSignal::AppExited { app_id, .. } = signal.as_ref() {
                assert_eq!(app_id, "weather");
                break;
            }
        }
    }

    #[tokio::test]
    async fn zero_check_interval_does_not_start_sentinel() {
        let scheduler = AppScheduler::new(
            RuntimeConfig::default().with_anr_check_interval(Duration::ZERO),
            AppRegistry::new(),
            CapabilityRegistry::new(),
            LauncherSet::new(),
            SignalBus::new(4),
        );
        scheduler.start().await.expect("sentinel exits without panicking");
    }

    #[tokio::test(start_paused = true)]
    async fn sentinel_runs_on_interval() {
        let launcher = TestLauncher::ready().with_heartbeat();
        let scheduler = scheduler_with(&launcher, vec![AppMetadata::new("quiet", LaunchType::Exe)]);
        scheduler.create_app("quiet", LaunchOptions::default()).await.unwrap();

        let handle = scheduler.start();
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(scheduler.anr_count(), 1);

        scheduler.shutdown();
        handle.await.expect("sentinel exits");
    }
}
