//! Shared data model: identifiers, statuses, presentation forms, launch
//! descriptors.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;

/// Opaque application identifier.
pub type AppId = String;

/// Reserved app id of the cloud skill host, a single local bridge fronting
/// every remote skill.
pub const CLOUD_APP_ID: &str = "@cloud";

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Scheduler-side status of an application.
///
/// ```text
/// NotRunning --> Creating --> Running --> Suspending --> Exited
///                                                   \--> Error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AppStatus {
    #[default]
    NotRunning,
    Creating,
    Running,
    Suspending,
    Exited,
    /// Suspension timed out; the next creation force-suspends first.
    Error,
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotRunning => "not-running",
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Suspending => "suspending",
            Self::Exited => "exited",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Form
// ---------------------------------------------------------------------------

/// Presentation form of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Form {
    /// Exclusive, owns the whole screen/voice surface.
    Scene,
    /// Transient, stackable above a scene.
    #[default]
    Cut,
}

impl Form {
    /// Parse a form name.  Anything other than `scene` (e.g. `service`)
    /// is treated as `cut`.
    pub fn parse_lossy(s: &str) -> Self {
        if s.eq_ignore_ascii_case("scene") {
            Self::Scene
        } else {
            Self::Cut
        }
    }
}

impl<'de> Deserialize<'de> for Form {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse_lossy(&raw))
    }
}

impl fmt::Display for Form {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scene => f.write_str("scene"),
            Self::Cut => f.write_str("cut"),
        }
    }
}

// ---------------------------------------------------------------------------
// Launch descriptors
// ---------------------------------------------------------------------------

/// How an application process is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LaunchType {
    /// Runs inside the host process; nothing to kill on suspension.
    Light,
    /// Spawned executable talking the wire protocol over stdio.
    #[default]
    Exe,
}

impl LaunchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Exe => "exe",
        }
    }
}

impl fmt::Display for LaunchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LaunchType {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "light" => Ok(Self::Light),
            "exe" => Ok(Self::Exe),
            other => Err(RuntimeError::Config {
                reason: format!("unknown launch type `{other}`"),
            }),
        }
    }
}

/// Immutable launch descriptor of an installed application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetadata {
    pub id: AppId,
    #[serde(rename = "type", default)]
    pub launch_type: LaunchType,
    /// Executable path, required for [`LaunchType::Exe`].
    #[serde(default)]
    pub exec: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Relaunch automatically whenever the process exits.
    #[serde(default)]
    pub daemon: bool,
    #[serde(default)]
    pub default_mode: Option<String>,
    /// Form used when an activation does not specify one.
    #[serde(default)]
    pub form: Form,
}

impl AppMetadata {
    /// Metadata with defaults for everything but the id and launch type.
    pub fn new(id: impl Into<AppId>, launch_type: LaunchType) -> Self {
        Self {
            id: id.into(),
            launch_type,
            exec: None,
            args: Vec::new(),
            env: HashMap::new(),
            daemon: false,
            default_mode: None,
            form: Form::Cut,
        }
    }

    pub fn with_exec(mut self, exec: impl Into<String>) -> Self {
        self.exec = Some(exec.into());
        self
    }

    pub fn with_daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    pub fn with_form(mut self, form: Form) -> Self {
        self.form = form;
        self
    }
}

/// Per-request launch options.  Unset fields fall back to the app's
/// [`AppMetadata`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    pub launch_type: Option<LaunchType>,
    pub mode: Option<String>,
    pub args: Vec<String>,
    pub environs: HashMap<String, String>,
    pub daemon: bool,
}

/// Launch options after resolution against metadata; recorded per app while
/// its bridge is alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLaunch {
    pub launch_type: LaunchType,
    pub mode: String,
    pub args: Vec<String>,
    pub environs: HashMap<String, String>,
    pub daemon: bool,
}

impl ResolvedLaunch {
    /// Turn back into request options, used by the daemon relaunch path.
    pub fn to_options(&self) -> LaunchOptions {
        LaunchOptions {
            launch_type: Some(self.launch_type),
            mode: Some(self.mode.clone()),
            args: self.args.clone(),
            environs: self.environs.clone(),
            daemon: self.daemon,
        }
    }
}

/// Options for suspending (terminating) an application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuspendOptions {
    /// Suspend even if already suspended, and kill rather than ask.
    pub force: bool,
    /// Capture a core dump before killing.
    pub gcore: bool,
}

impl SuspendOptions {
    pub fn force() -> Self {
        Self {
            force: true,
            gcore: false,
        }
    }

    pub fn force_with_core() -> Self {
        Self {
            force: true,
            gcore: true,
        }
    }
}

/// How an application process terminated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

// ---------------------------------------------------------------------------
// Lifecycle events and NLU
// ---------------------------------------------------------------------------

/// Lifecycle events delivered to an application bridge under the
/// [`LIFECYCLE_NAMESPACE`] namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleEvent {
    Create,
    Request,
    Pause,
    Resume,
    Destroy,
}

/// Namespace of lifecycle events emitted to applications.
pub const LIFECYCLE_NAMESPACE: &str = "activity";

/// Name of the notice emitted when the scheduler begins tearing an app down.
pub const DESTROYED_NOTICE: &str = "destroyed";

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Request => "request",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Destroy => "destroy",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleEvent {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "request" => Ok(Self::Request),
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "destroy" => Ok(Self::Destroy),
            other => Err(RuntimeError::Protocol {
                reason: format!("unknown lifecycle event `{other}`"),
            }),
        }
    }
}

/// A natural-language-understanding result produced by the speech pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Nlu {
    /// Target application (for cloud results, the remote skill id).
    #[serde(rename = "appId")]
    pub app_id: AppId,
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub slots: serde_json::Value,
    /// Requested presentation form; falls back to the app's metadata.
    #[serde(default)]
    pub form: Option<Form>,
    /// Delegate to the cloud skill host.
    #[serde(default)]
    pub cloud: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exotic_forms_are_cut() {
        assert_eq!(Form::parse_lossy("scene"), Form::Scene);
        assert_eq!(Form::parse_lossy("SCENE"), Form::Scene);
        assert_eq!(Form::parse_lossy("cut"), Form::Cut);
        assert_eq!(Form::parse_lossy("service"), Form::Cut);

        let form: Form = serde_json::from_str("\"service\"").unwrap();
        assert_eq!(form, Form::Cut);
    }

    #[test]
    fn launch_type_parse() {
        assert_eq!("light".parse::<LaunchType>().unwrap(), LaunchType::Light);
        assert_eq!("exe".parse::<LaunchType>().unwrap(), LaunchType::Exe);
        assert!("fork".parse::<LaunchType>().is_err());
    }

    #[test]
    fn nlu_from_json() {
        let nlu: Nlu = serde_json::from_str(
            r#"{"appId":"weather","intent":"forecast","slots":{"city":"Paris"},"form":"scene"}"#,
        )
        .unwrap();
        assert_eq!(nlu.app_id, "weather");
        assert_eq!(nlu.form, Some(Form::Scene));
        assert!(!nlu.cloud);
    }

    #[test]
    fn status_display_is_kebab_case() {
        assert_eq!(AppStatus::NotRunning.to_string(), "not-running");
        assert_eq!(AppStatus::Suspending.to_string(), "suspending");
    }
}
