//! Lifecycle and stack manager.
//!
//! Keeps the foreground stack (top = active app), the background set of
//! paused-but-alive apps and the derived [`Domain`].  Activation requests
//! decide between create, resume, pause and destroy from the presentation
//! [`Form`] of the incoming and current apps:
//!
//! - An incoming `scene` destroys every other foreground app.
//! - An incoming `cut` pauses a `scene` on top, or replaces a `cut` on top.
//!
//! Stack operations are serialized: one activation completes (including the
//! creation it awaits) before the next one starts.  An app id lives in at
//! most one of the two collections.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::error::{Result, RuntimeError};
use crate::lock;
use crate::scheduler::AppScheduler;
use crate::signal::{RuntimeSignal, SignalBus};
use crate::types::{
    AppId, CLOUD_APP_ID, Form, LIFECYCLE_NAMESPACE, LaunchOptions, LifecycleEvent, SuspendOptions,
};

/// One entry of the foreground stack or background set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackEntry {
    pub app_id: AppId,
    pub form: Form,
    /// Whether the entry fronts cloud-hosted skills.
    pub cloud: bool,
}

impl StackEntry {
    pub fn new(app_id: impl Into<AppId>, form: Form) -> Self {
        let app_id = app_id.into();
        let cloud = app_id == CLOUD_APP_ID;
        Self { app_id, form, cloud }
    }
}

/// Topmost `scene` and topmost `cut` app of the foreground stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Domain {
    pub scene: Option<AppId>,
    pub cut: Option<AppId>,
}

impl Domain {
    /// `scene:cut`, empty strings for absent sides.
    pub fn payload(&self) -> String {
        format!(
            "{}:{}",
            self.scene.as_deref().unwrap_or_default(),
            self.cut.as_deref().unwrap_or_default()
        )
    }
}

#[derive(Debug, Default)]
struct StackState {
    foreground: Vec<StackEntry>,
    background: Vec<StackEntry>,
    domain: Domain,
}

impl StackState {
    fn top(&self) -> Option<&StackEntry> {
        self.foreground.last()
    }

    fn is_top(&self, app_id: &str) -> bool {
        self.top().is_some_and(|e| e.app_id == app_id)
    }

    /// Remove `app_id` from whichever collection holds it.
    fn remove(&mut self, app_id: &str) -> Option<StackEntry> {
        if let Some(pos) = self.foreground.iter().position(|e| e.app_id == app_id) {
            return Some(self.foreground.remove(pos));
        }
        let pos = self.background.iter().position(|e| e.app_id == app_id)?;
        Some(self.background.remove(pos))
    }

    fn compute_domain(&self) -> Domain {
        let mut domain = Domain::default();
        for entry in self.foreground.iter().rev() {
            let slot = match entry.form {
                Form::Scene => &mut domain.scene,
                Form::Cut => &mut domain.cut,
            };
            if slot.is_none() {
                *slot = Some(entry.app_id.clone());
            }
            if domain.scene.is_some() && domain.cut.is_some() {
                break;
            }
        }
        domain
    }
}

/// Foreground/background stack of applications.
///
/// Cheaply cloneable (`Arc`-backed).
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<LifecycleInner>,
}

struct LifecycleInner {
    scheduler: AppScheduler,
    signals: SignalBus,
    state: Mutex<StackState>,
    /// Serializes stack operations across awaits.
    serial: tokio::sync::Mutex<()>,
    notify: Notify,
    shutdown: AtomicBool,
}

impl LifecycleManager {
    pub fn new(scheduler: AppScheduler, signals: SignalBus) -> Self {
        Self {
            inner: Arc::new(LifecycleInner {
                scheduler,
                signals,
                state: Mutex::new(StackState::default()),
                serial: tokio::sync::Mutex::new(()),
                notify: Notify::new(),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    // -- Activation ---------------------------------------------------------

    /// Bring `app_id` to the top of the foreground stack.
    ///
    /// With `preemptive` unset the current apps are left alone and an app in
    /// the background stays there.
    pub async fn create_or_resume_app(&self, app_id: &str, form: Form, preemptive: bool) -> Result<()> {
        let _serial = self.inner.serial.lock().await;

        {
            let mut state = lock(&self.inner.state);
            if state.is_top(app_id) {
                tracing::debug!(app_id, "already on top");
                return Ok(());
            }
            if let Some(pos) = state.background.iter().position(|e| e.app_id == app_id) {
                let mut previous = None;
                if preemptive {
                    previous = state.top().map(|e| e.app_id.clone());
                    let entry = state.background.remove(pos);
                    state.foreground.push(entry);
                }
                drop(state);
                if let Some(previous) = previous {
                    self.deliver(&previous, LifecycleEvent::Pause, &Value::Null);
                }
                tracing::info!(app_id, preemptive, "activated from background");
                self.update_domain();
                return Ok(());
            }
        }

        if preemptive {
            self.preempt(app_id, form);
        }

        let raised = {
            let mut state = lock(&self.inner.state);
            match state.foreground.iter().position(|e| e.app_id == app_id) {
                Some(pos) => {
                    let entry = state.foreground.remove(pos);
                    state.foreground.push(entry);
                    true
                }
                None => false,
            }
        };
        if raised {
            self.deliver(app_id, LifecycleEvent::Resume, &Value::Null);
            self.update_domain();
            return Ok(());
        }

        // Off both stacks: never created, or destroyed since.  A surviving
        // bridge (light app, daemon) is reused by the scheduler but the app
        // still has to see `create` again.
        self.apply_and_refresh(app_id, form, LifecycleEvent::Create, json!({ "form": form }))
            .await
    }

    /// Make room for an incoming `app_id` of `form`.
    fn preempt(&self, app_id: &str, form: Form) {
        let (pause, destroy): (Option<AppId>, Vec<AppId>) = {
            let state = lock(&self.inner.state);
            match (form, state.top()) {
                (Form::Scene, _) => (
                    None,
                    state
                        .foreground
                        .iter()
                        .rev()
                        .filter(|e| e.app_id != app_id)
                        .map(|e| e.app_id.clone())
                        .collect(),
                ),
                (Form::Cut, Some(top)) if top.form == Form::Scene => (Some(top.app_id.clone()), Vec::new()),
                (Form::Cut, Some(top)) => (None, vec![top.app_id.clone()]),
                (Form::Cut, None) => (None, Vec::new()),
            }
        };

        if let Some(paused) = pause {
            tracing::debug!(app_id = %paused, incoming = app_id, "pausing scene under cut");
            self.deliver(&paused, LifecycleEvent::Pause, &Value::Null);
        }
        for destroyed in destroy {
            tracing::debug!(app_id = %destroyed, incoming = app_id, "preempted");
            self.deliver(&destroyed, LifecycleEvent::Destroy, &Value::Null);
            self.release(&destroyed);
        }
    }

    // -- Lifecycle events ---------------------------------------------------

    /// Deliver a lifecycle event.
    ///
    /// `Create` launches the app through the scheduler and pushes it on the
    /// foreground stack.  Other events need a live bridge and fail with
    /// [`RuntimeError::AppInstanceNotFound`] otherwise; `Destroy` also drops
    /// the app from the stacks and suspends it.
    pub async fn on_lifecycle(
        &self,
        app_id: &str,
        form: Form,
        event: LifecycleEvent,
        params: Value,
    ) -> Result<()> {
        let _serial = self.inner.serial.lock().await;
        self.apply_and_refresh(app_id, form, event, params).await
    }

    async fn apply_and_refresh(
        &self,
        app_id: &str,
        form: Form,
        event: LifecycleEvent,
        params: Value,
    ) -> Result<()> {
        let outcome = self.apply(app_id, form, event, params).await;
        self.update_domain();
        outcome
    }

    async fn apply(&self, app_id: &str, form: Form, event: LifecycleEvent, params: Value) -> Result<()> {
        if event == LifecycleEvent::Create {
            let bridge = self
                .inner
                .scheduler
                .create_app(app_id, LaunchOptions::default())
                .await?;
            {
                let mut state = lock(&self.inner.state);
                state.remove(app_id);
                state.foreground.push(StackEntry::new(app_id, form));
            }
            tracing::info!(app_id, form = %form, "app created on foreground");
            bridge.emit(LIFECYCLE_NAMESPACE, event.as_str(), &params)?;
            return Ok(());
        }

        let bridge = self
            .inner
            .scheduler
            .bridge(app_id)
            .ok_or_else(|| RuntimeError::AppInstanceNotFound {
                app_id: app_id.to_string(),
            })?;
        let delivered = bridge.emit(LIFECYCLE_NAMESPACE, event.as_str(), &params);
        if event == LifecycleEvent::Destroy {
            self.release(app_id);
        }
        delivered.map(|_| ())
    }

    /// Emit to a live app, logging failures.
    fn deliver(&self, app_id: &str, event: LifecycleEvent, params: &Value) {
        let Some(bridge) = self.inner.scheduler.bridge(app_id) else {
            tracing::debug!(app_id, event = %event, "no bridge, event dropped");
            return;
        };
        if let Err(err) = bridge.emit(LIFECYCLE_NAMESPACE, event.as_str(), params) {
            tracing::warn!(app_id, event = %event, error = %err, "lifecycle event not delivered");
        }
    }

    /// Drop `app_id` from the stacks and suspend it in the background.
    ///
    /// The suspension is registered before this returns, so a creation
    /// requested right after waits for it instead of reusing the bridge.
    fn release(&self, app_id: &str) {
        lock(&self.inner.state).remove(app_id);

        let Some(suspension) = self
            .inner
            .scheduler
            .begin_suspension(app_id, SuspendOptions::default())
        else {
            return;
        };
        let app_id = app_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = suspension.await {
                tracing::warn!(app_id = %app_id, error = %err, "suspend after destroy failed");
            }
        });
    }

    // -- Background / foreground --------------------------------------------

    /// Move `app_id` into the background set.  The app beneath it, if any,
    /// is resumed.
    pub async fn set_background(&self, app_id: &str) -> Result<()> {
        let _serial = self.inner.serial.lock().await;
        if self.inner.scheduler.bridge(app_id).is_none() {
            return Err(RuntimeError::AppInstanceNotFound {
                app_id: app_id.to_string(),
            });
        }

        let resume = {
            let mut state = lock(&self.inner.state);
            let was_top = state.is_top(app_id);
            let entry = state.remove(app_id).unwrap_or_else(|| {
                let form = self.metadata_form(app_id);
                StackEntry::new(app_id, form)
            });
            state.background.push(entry);
            if was_top {
                state.top().map(|e| e.app_id.clone())
            } else {
                None
            }
        };

        tracing::info!(app_id, "moved to background");
        if let Some(resumed) = resume {
            self.deliver(&resumed, LifecycleEvent::Resume, &Value::Null);
        }
        self.update_domain();
        Ok(())
    }

    /// Push `app_id` on the foreground stack, pausing the current top.
    pub async fn set_foreground(&self, app_id: &str) -> Result<()> {
        let _serial = self.inner.serial.lock().await;
        if self.inner.scheduler.bridge(app_id).is_none() {
            return Err(RuntimeError::AppInstanceNotFound {
                app_id: app_id.to_string(),
            });
        }

        let pause = {
            let mut state = lock(&self.inner.state);
            if state.is_top(app_id) {
                return Ok(());
            }
            let pause = state.top().map(|e| e.app_id.clone());
            let entry = state.remove(app_id).unwrap_or_else(|| {
                let form = self.metadata_form(app_id);
                StackEntry::new(app_id, form)
            });
            state.foreground.push(entry);
            pause
        };

        tracing::info!(app_id, "moved to foreground");
        if let Some(paused) = pause {
            self.deliver(&paused, LifecycleEvent::Pause, &Value::Null);
        }
        self.update_domain();
        Ok(())
    }

    fn metadata_form(&self, app_id: &str) -> Form {
        self.inner
            .scheduler
            .apps()
            .get(app_id)
            .map(|m| m.form)
            .unwrap_or_default()
    }

    /// Destroy every app on both collections and reset the domain.
    ///
    /// Always publishes an empty stack change, even if nothing changed.
    pub async fn destroy_all(&self) {
        let _serial = self.inner.serial.lock().await;
        let entries: Vec<StackEntry> = {
            let mut state = lock(&self.inner.state);
            let mut entries = std::mem::take(&mut state.foreground);
            entries.reverse();
            entries.append(&mut state.background);
            state.domain = Domain::default();
            entries
        };

        for entry in &entries {
            self.deliver(&entry.app_id, LifecycleEvent::Destroy, &Value::Null);
        }
        tracing::info!(count = entries.len(), "stack reset");
        self.inner.signals.publish(RuntimeSignal::StackChanged {
            scene: String::new(),
            cut: String::new(),
        });
    }

    // -- Domain ---------------------------------------------------------------

    /// Recompute the domain; publishes a stack change only if it differs
    /// from the cached one.  Returns whether it changed.
    pub fn update_domain(&self) -> bool {
        let changed = {
            let mut state = lock(&self.inner.state);
            let domain = state.compute_domain();
            if domain == state.domain {
                None
            } else {
                state.domain = domain.clone();
                Some(domain)
            }
        };

        let Some(domain) = changed else {
            return false;
        };
        tracing::debug!(domain = %domain.payload(), "stack changed");
        self.inner.signals.publish(RuntimeSignal::StackChanged {
            scene: domain.scene.unwrap_or_default(),
            cut: domain.cut.unwrap_or_default(),
        });
        true
    }

    // -- Exit watcher ---------------------------------------------------------

    /// Spawn the task that drops exited apps from the stacks.
    pub fn start(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let mut signals = self.inner.signals.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = signals.recv() => match received {
                        Ok(signal) => {
                            if let RuntimeSignal::AppExited { app_id, .. } = signal.as_ref() {
                                manager.forget(app_id);
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "lifecycle watcher lagged behind signals");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = manager.inner.notify.notified() => {}
                }
                if manager.inner.shutdown.load(Ordering::Acquire) {
                    break;
                }
            }
            tracing::debug!("lifecycle watcher stopped");
        })
    }

    fn forget(&self, app_id: &str) {
        // A bridge here belongs to a newer instance already on the stack.
        if self.inner.scheduler.bridge(app_id).is_some() {
            return;
        }
        let removed = lock(&self.inner.state).remove(app_id).is_some();
        if removed {
            tracing::debug!(app_id, "exited app removed from stack");
            self.update_domain();
        }
    }

    /// Stop the exit watcher.
    pub fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }

    // -- Introspection --------------------------------------------------------

    /// Foreground stack, bottom first.
    pub fn foreground(&self) -> Vec<StackEntry> {
        lock(&self.inner.state).foreground.clone()
    }

    pub fn background(&self) -> Vec<StackEntry> {
        lock(&self.inner.state).background.clone()
    }

    pub fn domain(&self) -> Domain {
        lock(&self.inner.state).domain.clone()
    }

    pub fn top(&self) -> Option<StackEntry> {
        lock(&self.inner.state).top().cloned()
    }
}
