//! Application bridge.
//!
//! An [`AppBridge`] is the host-side proxy of one application instance.  It
//! is independent of how the application is hosted: launchers wire the
//! concrete termination routine through [`AppBridge::implement`] and report
//! process exit through [`AppBridge::did_exit`]; the event bus (or an
//! in-process app) drives [`AppBridge::status_report`],
//! [`AppBridge::subscribe`] and [`AppBridge::invoke`].
//!
//! # State flags
//!
//! | flag        | set by                              | cleared |
//! |-------------|-------------------------------------|---------|
//! | `ready`     | first `status_report(Ready)`        | never   |
//! | `suspended` | `suspend`, `did_exit`               | never   |
//! | `exited`    | `did_exit`                          | never   |
//!
//! A bridge is single-use: once exited, the scheduler drops it and a later
//! creation builds a fresh one.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

use crate::capability::{CapabilityRegistry, InvocationContext};
use crate::error::{Result, RuntimeError};
use crate::lock;
use crate::types::{AppId, AppMetadata, ExitStatus, SuspendOptions};

/// Receives an emitted event's parameters.
pub type Listener = Arc<dyn Fn(&Value) -> Result<()> + Send + Sync>;

/// Launcher-supplied termination routine.
pub type ExitFn = Arc<dyn Fn(SuspendOptions) -> BoxFuture<'static, ()> + Send + Sync>;

/// Called once when the application exits.
pub type ExitHook = Box<dyn FnOnce(ExitStatus) + Send>;

/// Status reported by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStatus {
    Ready,
    Alive,
}

/// Hosting details supplied by the launcher.
#[derive(Clone)]
pub struct BridgeImplementation {
    /// Whether the application sends liveness heartbeats.  Bridges without a
    /// heartbeat never record a liveness timestamp and are exempt from ANR.
    pub anr_enabled: bool,
    pub exit: ExitFn,
}

#[derive(Debug)]
struct BridgeState {
    ready: bool,
    suspended: bool,
    exited: bool,
    last_alive: Option<Instant>,
    idle_at: Instant,
}

/// Host-side proxy for one application instance.
pub struct AppBridge {
    app_id: AppId,
    metadata: AppMetadata,
    capabilities: CapabilityRegistry,
    state: Mutex<BridgeState>,
    subscriptions: DashMap<String, Listener>,
    implementation: Mutex<Option<BridgeImplementation>>,
    ready_tx: Mutex<Option<oneshot::Sender<Result<()>>>>,
    ready_rx: Mutex<Option<oneshot::Receiver<Result<()>>>>,
    exited_tx: watch::Sender<bool>,
    on_exit: Mutex<Option<ExitHook>>,
}

impl AppBridge {
    pub fn new(metadata: AppMetadata, capabilities: CapabilityRegistry) -> Self {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (exited_tx, _) = watch::channel(false);
        Self {
            app_id: metadata.id.clone(),
            metadata,
            capabilities,
            state: Mutex::new(BridgeState {
                ready: false,
                suspended: false,
                exited: false,
                last_alive: None,
                idle_at: Instant::now(),
            }),
            subscriptions: DashMap::new(),
            implementation: Mutex::new(None),
            ready_tx: Mutex::new(Some(ready_tx)),
            ready_rx: Mutex::new(Some(ready_rx)),
            exited_tx,
            on_exit: Mutex::new(None),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn metadata(&self) -> &AppMetadata {
        &self.metadata
    }

    // -- Wiring -------------------------------------------------------------

    /// Install the launcher's hosting details.  Every launcher calls this.
    pub fn implement(&self, implementation: BridgeImplementation) {
        tracing::debug!(
            app_id = %self.app_id,
            anr_enabled = implementation.anr_enabled,
            "bridge implemented"
        );
        *lock(&self.implementation) = Some(implementation);
    }

    /// Register the owner's exit hook.  Replaces any earlier hook.
    pub fn on_exit(&self, hook: impl FnOnce(ExitStatus) + Send + 'static) {
        *lock(&self.on_exit) = Some(Box::new(hook));
    }

    /// Take the ready receiver.  Resolves `Ok` on the first ready report, or
    /// `Err(ExitedBeforeReady)` if the app exits first.  Only one consumer.
    pub fn take_ready(&self) -> Option<oneshot::Receiver<Result<()>>> {
        lock(&self.ready_rx).take()
    }

    fn anr_enabled(&self) -> bool {
        lock(&self.implementation)
            .as_ref()
            .map(|i| i.anr_enabled)
            .unwrap_or(false)
    }

    // -- Events -------------------------------------------------------------

    /// Deliver `namespace.name` to the application if it subscribed.
    ///
    /// Returns `Ok(false)` when nobody listens; delivery is at most once.
    pub fn emit(&self, namespace: &str, name: &str, params: &Value) -> Result<bool> {
        let key = event_key(namespace, name);
        // Clone out so the listener runs without holding the shard lock.
        let Some(listener) = self.subscriptions.get(&key).map(|l| Arc::clone(l.value())) else {
            tracing::trace!(app_id = %self.app_id, event = %key, "no listener, event dropped");
            return Ok(false);
        };
        lock(&self.state).idle_at = Instant::now();
        listener(params)?;
        Ok(true)
    }

    /// Register interest in `namespace.name`.  First registration wins;
    /// returns `false` for a duplicate.
    pub fn subscribe(&self, namespace: &str, name: &str, listener: Listener) -> bool {
        match self.subscriptions.entry(event_key(namespace, name)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                tracing::debug!(app_id = %self.app_id, event = %slot.key(), "subscribed");
                slot.insert(listener);
                true
            }
        }
    }

    /// Capability descriptor the application binds against.
    pub fn descriptor(&self) -> Value {
        self.capabilities.descriptor()
    }

    /// Call a host capability on behalf of the application.
    pub async fn invoke(&self, namespace: &str, method: &str, params: Value) -> Result<Value> {
        let ctx = InvocationContext {
            app_id: self.app_id.clone(),
            args: params,
        };
        match self.capabilities.invoke(namespace, method, ctx).await {
            Ok(value) => Ok(value),
            Err(err) => {
                tracing::warn!(
                    app_id = %self.app_id,
                    namespace,
                    method,
                    error = %err,
                    "invocation failed"
                );
                Err(err)
            }
        }
    }

    // -- Status -------------------------------------------------------------

    /// Record a status report from the application.
    pub fn status_report(&self, status: BridgeStatus) {
        let anr_enabled = self.anr_enabled();
        let mut state = lock(&self.state);
        match status {
            BridgeStatus::Ready => {
                if state.ready {
                    tracing::warn!(app_id = %self.app_id, "duplicate ready report ignored");
                    return;
                }
                state.ready = true;
                if anr_enabled {
                    state.last_alive = Some(Instant::now());
                }
                drop(state);
                tracing::info!(app_id = %self.app_id, "app ready");
                self.settle_ready(Ok(()));
            }
            BridgeStatus::Alive => {
                if anr_enabled {
                    state.last_alive = Some(Instant::now());
                }
            }
        }
    }

    fn settle_ready(&self, outcome: Result<()>) {
        if let Some(tx) = lock(&self.ready_tx).take() {
            // The receiver may already be gone (creation abandoned).
            let _ = tx.send(outcome);
        }
    }

    pub fn is_ready(&self) -> bool {
        lock(&self.state).ready
    }

    pub fn is_suspended(&self) -> bool {
        lock(&self.state).suspended
    }

    pub fn is_exited(&self) -> bool {
        lock(&self.state).exited
    }

    /// Last liveness report, `None` if the app never reported one.
    pub fn last_alive(&self) -> Option<Instant> {
        lock(&self.state).last_alive
    }

    /// Last time an event was delivered to the app.
    pub fn idle_at(&self) -> Instant {
        lock(&self.state).idle_at
    }

    // -- Termination --------------------------------------------------------

    /// Mark suspended without running the exit routine.
    pub(crate) fn mark_suspended(&self) {
        lock(&self.state).suspended = true;
    }

    /// Ask the application to terminate.
    ///
    /// A second call is a no-op unless `force` is set.  Returns immediately
    /// if the process has already exited.
    pub async fn suspend(&self, options: SuspendOptions) {
        let exit = {
            let mut state = lock(&self.state);
            if state.suspended && !options.force {
                return;
            }
            state.suspended = true;
            if state.exited {
                return;
            }
            lock(&self.implementation).as_ref().map(|i| Arc::clone(&i.exit))
        };

        match exit {
            Some(exit) => {
                tracing::info!(
                    app_id = %self.app_id,
                    force = options.force,
                    gcore = options.gcore,
                    "suspending app"
                );
                exit(options).await;
            }
            None => {
                tracing::warn!(app_id = %self.app_id, "suspend requested on unimplemented bridge");
            }
        }
    }

    /// Report that the application process terminated.  Idempotent.
    pub fn did_exit(&self, status: ExitStatus) {
        let was_ready = {
            let mut state = lock(&self.state);
            if state.exited {
                return;
            }
            state.exited = true;
            state.suspended = true;
            state.ready
        };

        tracing::info!(
            app_id = %self.app_id,
            code = ?status.code,
            signal = ?status.signal,
            "app exited"
        );

        if !was_ready {
            self.settle_ready(Err(RuntimeError::ExitedBeforeReady {
                app_id: self.app_id.clone(),
            }));
        }
        self.exited_tx.send_replace(true);

        let hook = lock(&self.on_exit).take();
        if let Some(hook) = hook {
            hook(status);
        }
    }

    /// Resolve once the application has exited.
    pub async fn wait_exited(&self) {
        let mut rx = self.exited_tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|exited| *exited).await;
    }
}

impl std::fmt::Debug for AppBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppBridge")
            .field("app_id", &self.app_id)
            .field("state", &*lock(&self.state))
            .finish()
    }
}

fn event_key(namespace: &str, name: &str) -> String {
    format!("{namespace}.{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LaunchType;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn bridge() -> Arc<AppBridge> {
        Arc::new(AppBridge::new(
            AppMetadata::new("weather", LaunchType::Exe),
            CapabilityRegistry::new(),
        ))
    }

    fn counting_exit(counter: Arc<AtomicU32>) -> ExitFn {
        Arc::new(move |_opts: SuspendOptions| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {}.boxed()
        })
    }

    #[test]
    fn emit_without_listener_is_dropped() {
        let bridge = bridge();
        let delivered = bridge.emit("activity", "create", &Value::Null).unwrap();
        assert!(!delivered);
    }

    #[test]
    fn first_subscription_wins() {
        let bridge = bridge();
        let hits = Arc::new(AtomicU32::new(0));

        let h1 = Arc::clone(&hits);
        assert!(bridge.subscribe(
            "tts",
            "end",
            Arc::new(move |_| {
                h1.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        ));
        let h2 = Arc::clone(&hits);
        assert!(!bridge.subscribe(
            "tts",
            "end",
            Arc::new(move |_| {
                h2.fetch_add(100, Ordering::SeqCst);
                Ok(())
            })
        ));

        assert!(bridge.emit("tts", "end", &json!({})).unwrap());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_failure_surfaces() {
        let bridge = bridge();
        bridge.subscribe(
            "media",
            "end",
            Arc::new(|_| {
                Err(RuntimeError::ChannelDisconnected {
                    app_id: "weather".into(),
                })
            }),
        );
        let err = bridge.emit("media", "end", &Value::Null).unwrap_err();
        assert!(matches!(err, RuntimeError::ChannelDisconnected { .. }));
    }

    #[tokio::test]
    async fn ready_settles_once() {
        let bridge = bridge();
        let rx = bridge.take_ready().expect("receiver");
        assert!(bridge.take_ready().is_none());

        bridge.status_report(BridgeStatus::Ready);
        bridge.status_report(BridgeStatus::Ready);

        assert!(rx.await.expect("settled").is_ok());
        assert!(bridge.is_ready());
    }

    #[tokio::test]
    async fn exit_before_ready_rejects_ready() {
        let bridge = bridge();
        let rx = bridge.take_ready().expect("receiver");

        bridge.did_exit(ExitStatus {
            code: Some(1),
            signal: None,
        });

        let outcome = rx.await.expect("settled");
        assert!(matches!(outcome, Err(RuntimeError::ExitedBeforeReady { .. })));
        assert!(bridge.is_exited());
        assert!(bridge.is_suspended());
    }

    #[tokio::test]
    async fn did_exit_is_idempotent() {
        let bridge = bridge();
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        bridge.on_exit(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bridge.did_exit(ExitStatus::default());
        bridge.did_exit(ExitStatus::default());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Already exited: resolves immediately.
        tokio::time::timeout(Duration::from_millis(50), bridge.wait_exited())
            .await
            .expect("wait_exited should resolve");
    }

    #[tokio::test]
    async fn suspend_is_noop_when_already_suspended_unless_forced() {
        let bridge = bridge();
        let kills = Arc::new(AtomicU32::new(0));
        bridge.implement(BridgeImplementation {
            anr_enabled: true,
            exit: counting_exit(Arc::clone(&kills)),
        });

        bridge.suspend(SuspendOptions::default()).await;
        bridge.suspend(SuspendOptions::default()).await;
        assert_eq!(kills.load(Ordering::SeqCst), 1);

        bridge.suspend(SuspendOptions::force()).await;
        assert_eq!(kills.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn suspend_after_exit_skips_exit_routine() {
        let bridge = bridge();
        let kills = Arc::new(AtomicU32::new(0));
        bridge.implement(BridgeImplementation {
            anr_enabled: true,
            exit: counting_exit(Arc::clone(&kills)),
        });

        bridge.did_exit(ExitStatus::default());
        bridge.suspend(SuspendOptions::force()).await;
        assert_eq!(kills.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn liveness_only_tracked_with_anr_enabled() {
        let bridge = bridge();
        bridge.status_report(BridgeStatus::Alive);
        assert!(bridge.last_alive().is_none());

        bridge.implement(BridgeImplementation {
            anr_enabled: true,
            exit: Arc::new(|_: SuspendOptions| async {}.boxed()),
        });
        bridge.status_report(BridgeStatus::Alive);
        assert!(bridge.last_alive().is_some());
    }

    #[tokio::test]
    async fn invoke_unknown_capability() {
        let bridge = bridge();
        let err = bridge.invoke("tts", "speak", json!({})).await.unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownNamespace { .. }));
    }
}
