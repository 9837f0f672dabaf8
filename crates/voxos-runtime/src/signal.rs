//! Runtime signal bus.
//!
//! A publish/subscribe channel built on [`tokio::sync::broadcast`] that
//! carries runtime-wide notifications: application status transitions,
//! exits, ANR detections and foreground stack changes.  The scheduler and
//! the lifecycle manager publish; the lifecycle manager and external
//! consumers (the speech pipeline, the CLI) subscribe.
//!
//! Signals are wrapped in [`Arc`] so broadcasting to several subscribers
//! does not clone the payload.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::types::{AppId, AppStatus, ExitStatus};

/// A notification flowing through the [`SignalBus`].
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeSignal {
    /// The scheduler moved an application to a new status.
    AppStatusChanged {
        app_id: AppId,
        status: AppStatus,
        timestamp: DateTime<Utc>,
    },

    /// An application process exited and its bridge was released.
    AppExited {
        app_id: AppId,
        status: ExitStatus,
        timestamp: DateTime<Utc>,
    },

    /// The ANR sentinel found an application silent past the threshold.
    AppNotResponding {
        app_id: AppId,
        elapsed_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// The derived `{scene, cut}` pair of the foreground stack changed.
    StackChanged { scene: String, cut: String },
}

impl RuntimeSignal {
    /// The compact `scene:cut` form consumed by the speech pipeline.
    pub fn stack_payload(&self) -> Option<String> {
        match self {
            Self::StackChanged { scene, cut } => Some(format!("{scene}:{cut}")),
            _ => None,
        }
    }
}

/// Publish/subscribe bus for [`RuntimeSignal`]s.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct SignalBus {
    inner: Arc<SignalBusInner>,
}

struct SignalBusInner {
    sender: broadcast::Sender<Arc<RuntimeSignal>>,
}

impl SignalBus {
    /// Create a bus with the given channel capacity.
    ///
    /// A subscriber lagging more than `capacity` signals behind receives
    /// [`broadcast::error::RecvError::Lagged`].
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(SignalBusInner { sender }),
        }
    }

    /// Publish a signal to every current subscriber.
    ///
    /// Returns the number of receivers.  Publishing with nobody listening is
    /// not an error.
    pub fn publish(&self, signal: RuntimeSignal) -> usize {
        match self.inner.sender.send(Arc::new(signal)) {
            Ok(n) => {
                tracing::trace!(receivers = n, "signal published");
                n
            }
            Err(_) => {
                tracing::trace!("signal published but no active receivers");
                0
            }
        }
    }

    /// Subscribe to all future signals.  Earlier signals are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RuntimeSignal>> {
        self.inner.sender.subscribe()
    }
}
