//! Runtime error types.
//!
//! Every subsystem of the runtime surfaces errors through [`RuntimeError`].
//! The type is `Clone` because creation and suspension futures are shared
//! between every caller waiting on the same application, and each waiter
//! receives its own copy of the outcome.

use std::time::Duration;

/// Unified error type for the voxos application runtime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    // -- Capability dispatch ------------------------------------------------
    /// An application invoked a capability namespace the host does not expose.
    #[error("unknown namespace: {namespace}")]
    UnknownNamespace { namespace: String },

    /// The namespace exists but has no method with this name.
    #[error("unknown method: {namespace}.{method}")]
    UnknownMethod { namespace: String, method: String },

    /// A capability handler ran and failed.
    #[error("capability {namespace}.{method} failed: {reason}")]
    CapabilityFailed {
        namespace: String,
        method: String,
        reason: String,
    },

    // -- Scheduling ---------------------------------------------------------
    /// A lifecycle event targeted an application that has no live bridge.
    #[error("app instance not found: {app_id}")]
    AppInstanceNotFound { app_id: String },

    /// The application is not installed in the app registry.
    #[error("app not installed: {app_id}")]
    AppNotInstalled { app_id: String },

    /// No launcher is registered for the resolved launch type.
    #[error("no launcher for type `{launch_type}` (app {app_id})")]
    NoLauncher { app_id: String, launch_type: String },

    /// The launcher could not start the application.
    #[error("launch of {app_id} failed: {reason}")]
    LaunchFailed { app_id: String, reason: String },

    /// The application did not report ready in time.
    #[error("app {app_id} did not report ready within {}ms", .timeout.as_millis())]
    CreationTimeout { app_id: String, timeout: Duration },

    /// The application process terminated before it reported ready.
    #[error("app {app_id} exited before ready")]
    ExitedBeforeReady { app_id: String },

    /// The application did not acknowledge suspension in time.
    #[error("app {app_id} did not exit within {}ms of suspension", .timeout.as_millis())]
    SuspensionTimeout { app_id: String, timeout: Duration },

    /// The application stopped sending liveness messages.
    #[error("app {app_id} not responding for {}ms", .elapsed.as_millis())]
    ApplicationNotResponding { app_id: String, elapsed: Duration },

    /// The application reported an error over the event bus.
    #[error("app {app_id} reported error: {message}")]
    ApplicationError { app_id: String, message: String },

    // -- IPC ----------------------------------------------------------------
    /// The message channel to the application is closed.
    #[error("channel to app {app_id} disconnected")]
    ChannelDisconnected { app_id: String },

    /// A wire message could not be decoded.
    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    // -- Configuration ------------------------------------------------------
    /// The configuration file is unreadable or malformed.
    #[error("config error: {reason}")]
    Config { reason: String },

    // -- Generic ------------------------------------------------------------
    /// Catch-all for unexpected internal errors.  Prefer a typed variant.
    #[error("internal runtime error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Short machine-readable name of the variant, used as the `name` field
    /// of structured errors sent back to applications.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UnknownNamespace { .. } => "UnknownNamespace",
            Self::UnknownMethod { .. } => "UnknownMethod",
            Self::CapabilityFailed { .. } => "CapabilityFailed",
            Self::AppInstanceNotFound { .. } => "AppInstanceNotFound",
            Self::AppNotInstalled { .. } => "AppNotInstalled",
            Self::NoLauncher { .. } => "NoLauncher",
            Self::LaunchFailed { .. } => "LaunchFailed",
            Self::CreationTimeout { .. } => "CreationTimeout",
            Self::ExitedBeforeReady { .. } => "ExitedBeforeReady",
            Self::SuspensionTimeout { .. } => "SuspensionTimeout",
            Self::ApplicationNotResponding { .. } => "ApplicationNotResponding",
            Self::ApplicationError { .. } => "ApplicationError",
            Self::ChannelDisconnected { .. } => "ChannelDisconnected",
            Self::Protocol { .. } => "ProtocolError",
            Self::Config { .. } => "ConfigError",
            Self::Internal(_) => "InternalError",
        }
    }
}

/// Convenience alias used throughout the runtime crate.
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_method_display() {
        let err = RuntimeError::UnknownMethod {
            namespace: "tts".into(),
            method: "shout".into(),
        };
        assert_eq!(err.to_string(), "unknown method: tts.shout");
        assert_eq!(err.name(), "UnknownMethod");
    }

    #[test]
    fn creation_timeout_display() {
        let err = RuntimeError::CreationTimeout {
            app_id: "weather".into(),
            timeout: Duration::from_secs(15),
        };
        assert_eq!(
            err.to_string(),
            "app weather did not report ready within 15000ms"
        );
    }

    #[test]
    fn suspension_timeout_display() {
        let err = RuntimeError::SuspensionTimeout {
            app_id: "music".into(),
            timeout: Duration::from_secs(5),
        };
        assert!(err.to_string().contains("5000ms"));
    }

    #[test]
    fn errors_are_cloneable() {
        let err = RuntimeError::ExitedBeforeReady {
            app_id: "alarm".into(),
        };
        assert_eq!(err.clone(), err);
    }
}
