//! Event bus: the host side of the application wire protocol.
//!
//! One [`EventBus`] runs per externally hosted application.  It consumes
//! decoded [`AppMessage`]s from the application's channel and turns them
//! into [`AppBridge`] operations, and sends [`HostMessage`]s back.
//!
//! | message                     | effect                                              |
//! |-----------------------------|-----------------------------------------------------|
//! | `status-report: initiating` | reply with the capability descriptor                |
//! | `status-report: ready`      | bridge ready, [`BusSignal::Ready`]                  |
//! | `status-report: error`      | [`BusSignal::Error`]                                |
//! | `alive` / `ping`            | refresh liveness and restart the silence timer      |
//! | `subscribe`                 | forward the host event to the app when it fires     |
//! | `invoke`                    | call the capability, reply `resolve` / `reject`     |
//! | `test`                      | nothing                                             |
//!
//! Signals are delivered over a single-consumer channel so a launcher
//! waiting for readiness observes each one exactly once.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bridge::{AppBridge, BridgeStatus, Listener};
use crate::error::{Result, RuntimeError};
use crate::lock;
use crate::protocol::{AppMessage, HostMessage, ReportedStatus};

/// Out-of-band signals raised by the bus for the owning launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusSignal {
    /// The app reported `ready`.
    Ready,
    /// The app reported `error`.
    Error(String),
    /// No `alive` arrived within the silence threshold.
    NotResponding { elapsed: Duration },
}

/// Host side of one application's message channel.
pub struct EventBus {
    bridge: Arc<AppBridge>,
    outbound: mpsc::UnboundedSender<HostMessage>,
    signals: mpsc::UnboundedSender<BusSignal>,
    anr_threshold: Duration,
    alive_timer: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    /// Create a bus for `bridge` writing to `outbound`.
    ///
    /// Returns the bus and the receiver of its [`BusSignal`]s.  The signal
    /// channel closes once the bus has stopped.
    pub fn new(
        bridge: Arc<AppBridge>,
        outbound: mpsc::UnboundedSender<HostMessage>,
        anr_threshold: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<BusSignal>) {
        let (signals, signals_rx) = mpsc::unbounded_channel();
        let bus = Arc::new(Self {
            bridge,
            outbound,
            signals,
            anr_threshold,
            alive_timer: Mutex::new(None),
        });
        (bus, signals_rx)
    }

    /// Process messages until the inbound channel closes.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<AppMessage>) {
        let app_id = self.bridge.app_id().to_string();
        tracing::debug!(app_id = %app_id, "event bus started");
        while let Some(message) = inbound.recv().await {
            self.handle(message);
        }
        self.stop();
        tracing::debug!(app_id = %app_id, "event bus stopped");
    }

    /// Handle one message.  Invocations run on their own task so a slow
    /// capability never blocks the channel.
    pub fn handle(self: &Arc<Self>, message: AppMessage) {
        let app_id = self.bridge.app_id();
        match message {
            AppMessage::StatusReport { status, error } => match status {
                ReportedStatus::Initiating => {
                    let descriptor = self.bridge.descriptor();
                    if let Err(err) = self.send(HostMessage::Descriptor { result: descriptor }) {
                        tracing::warn!(app_id = %app_id, error = %err, "descriptor not delivered");
                    }
                }
                ReportedStatus::Ready => {
                    self.bridge.status_report(BridgeStatus::Ready);
                    self.raise(BusSignal::Ready);
                }
                ReportedStatus::Error => {
                    let message = error.unwrap_or_else(|| "unspecified error".to_string());
                    tracing::error!(app_id = %app_id, error = %message, "app reported error");
                    self.raise(BusSignal::Error(message));
                }
            },
            AppMessage::Alive => {
                self.bridge.status_report(BridgeStatus::Alive);
                self.refresh_alive();
            }
            AppMessage::Subscribe { namespace, event } => {
                let listener = self.forwarder(&namespace, &event);
                if !self.bridge.subscribe(&namespace, &event, listener) {
                    tracing::debug!(
                        app_id = %app_id,
                        namespace = %namespace,
                        event = %event,
                        "duplicate subscription ignored"
                    );
                }
            }
            AppMessage::Invoke {
                invocation_id,
                namespace,
                method,
                params,
            } => {
                let bus = Arc::clone(self);
                tokio::spawn(async move {
                    let id = invocation_id.to_string();
                    let reply = match bus.bridge.invoke(&namespace, &method, params).await {
                        Ok(result) => HostMessage::resolve(invocation_id, result),
                        Err(err) => HostMessage::reject(invocation_id, &err),
                    };
                    if let Err(err) = bus.send(reply) {
                        tracing::warn!(
                            app_id = %bus.bridge.app_id(),
                            invocation_id = %id,
                            error = %err,
                            "invocation reply not delivered"
                        );
                    }
                });
            }
            AppMessage::Test => {
                tracing::trace!(app_id = %app_id, "test message");
            }
        }
    }

    /// Stop the silence timer.  Called when the channel closes.
    pub fn stop(&self) {
        if let Some(timer) = lock(&self.alive_timer).take() {
            timer.abort();
        }
    }

    fn send(&self, message: HostMessage) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| RuntimeError::ChannelDisconnected {
                app_id: self.bridge.app_id().to_string(),
            })
    }

    fn raise(&self, signal: BusSignal) {
        // Nobody waiting is fine: the launcher stops listening after ready.
        let _ = self.signals.send(signal);
    }

    /// Listener that serializes a fired host event onto the channel.
    fn forwarder(&self, namespace: &str, event: &str) -> Listener {
        let outbound = self.outbound.clone();
        let app_id = self.bridge.app_id().to_string();
        let namespace = namespace.to_string();
        let event = event.to_string();
        Arc::new(move |params: &Value| {
            outbound
                .send(HostMessage::Event {
                    namespace: namespace.clone(),
                    event: event.clone(),
                    params: params.clone(),
                })
                .map_err(|_| RuntimeError::ChannelDisconnected {
                    app_id: app_id.clone(),
                })
        })
    }

    fn refresh_alive(&self) {
        let signals = self.signals.clone();
        let threshold = self.anr_threshold;
        let app_id = self.bridge.app_id().to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(threshold).await;
            tracing::warn!(
                app_id = %app_id,
                silence_ms = threshold.as_millis() as u64,
                "application not responding"
            );
            let _ = signals.send(BusSignal::NotResponding { elapsed: threshold });
        });
        if let Some(previous) = lock(&self.alive_timer).replace(timer) {
            previous.abort();
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.stop();
    }
}
