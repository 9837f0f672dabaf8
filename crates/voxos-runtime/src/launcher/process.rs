//! Executable launcher.
//!
//! Spawns the application's executable with piped stdio and speaks the
//! line-delimited wire protocol over it.  Four tasks serve each process:
//!
//! - reader: stdout lines -> [`protocol::decode`] -> event bus
//! - event bus: messages -> bridge operations
//! - writer: host messages -> [`protocol::encode`] -> stdin
//! - supervisor: waits for exit, executes termination requests
//!
//! Launch resolves once the app reports `ready`.  If it does not within the
//! configured ready timeout the process is killed and the launch fails with
//! [`RuntimeError::CreationTimeout`]; if it exits first the launch fails with
//! [`RuntimeError::ExitedBeforeReady`].
//!
//! Termination: a graceful suspend closes the app's stdin; a forced one
//! kills it; `gcore` runs `gcore <pid>` first to keep a core dump.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};

use crate::bridge::{AppBridge, BridgeImplementation};
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::event_bus::{BusSignal, EventBus};
use crate::launcher::{Launcher, ProcessHandle};
use crate::protocol::{self, AppMessage, HostMessage};
use crate::types::{AppId, AppMetadata, ExitStatus, ResolvedLaunch, SuspendOptions};

/// Environment variable carrying the app id into the child.
pub const ENV_APP_ID: &str = "VOXOS_APP_ID";
/// Environment variable carrying the launch mode into the child.
pub const ENV_APP_MODE: &str = "VOXOS_APP_MODE";

/// Launcher for [`crate::types::LaunchType::Exe`] applications.
pub struct ProcessLauncher {
    config: RuntimeConfig,
}

impl ProcessLauncher {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(
        &self,
        metadata: &AppMetadata,
        bridge: Arc<AppBridge>,
        mode: &str,
        options: &ResolvedLaunch,
    ) -> Result<ProcessHandle> {
        let app_id = metadata.id.clone();
        let launch_failed = |reason: String| RuntimeError::LaunchFailed {
            app_id: app_id.clone(),
            reason,
        };

        let exec = metadata
            .exec
            .as_deref()
            .ok_or_else(|| launch_failed("no exec path".to_string()))?;

        let mut child = Command::new(exec)
            .args(&metadata.args)
            .args(&options.args)
            .envs(&metadata.env)
            .envs(&options.environs)
            .env(ENV_APP_ID, &app_id)
            .env(ENV_APP_MODE, mode)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| launch_failed(format!("spawn {exec}: {e}")))?;

        let pid = child.id();
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.start_kill();
            return Err(launch_failed("stdio is not piped".to_string()));
        };

        tracing::info!(app_id = %app_id, pid = ?pid, exec, mode, "process spawned");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let (close_tx, close_rx) = oneshot::channel();
        tokio::spawn(write_loop(app_id.clone(), stdin, outbound_rx, close_rx));
        tokio::spawn(read_loop(app_id.clone(), stdout, inbound_tx));

        let (bus, mut signals) =
            EventBus::new(Arc::clone(&bridge), outbound_tx, self.config.anr_threshold);
        tokio::spawn(bus.run(inbound_rx));

        let (control_tx, control_rx) = mpsc::unbounded_channel::<SuspendOptions>();
        let control = control_tx.clone();
        bridge.implement(BridgeImplementation {
            anr_enabled: true,
            exit: Arc::new(move |options: SuspendOptions| {
                // The supervisor may already be gone if the process exited.
                let _ = control.send(options);
                async {}.boxed()
            }),
        });
        tokio::spawn(supervise(
            app_id.clone(),
            child,
            pid,
            Arc::clone(&bridge),
            control_rx,
            close_tx,
        ));

        let timeout = self.config.ready_timeout;
        let outcome = tokio::time::timeout(timeout, wait_ready(&app_id, &mut signals)).await;

        match outcome {
            Ok(Ok(())) => {
                tokio::spawn(watch_signals(app_id, signals, control_tx));
                Ok(ProcessHandle { pid })
            }
            Ok(Err(err)) => {
                let _ = control_tx.send(SuspendOptions::force());
                Err(err)
            }
            Err(_) => {
                tracing::warn!(
                    app_id = %app_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "app did not report ready, killing"
                );
                let _ = control_tx.send(SuspendOptions::force());
                Err(RuntimeError::CreationTimeout { app_id, timeout })
            }
        }
    }
}

/// Wait for the first `ready`.  The signal channel closing means the bus
/// stopped, i.e. the process closed stdout before becoming ready.
async fn wait_ready(app_id: &str, signals: &mut mpsc::UnboundedReceiver<BusSignal>) -> Result<()> {
    loop {
        match signals.recv().await {
            Some(BusSignal::Ready) => return Ok(()),
            Some(BusSignal::Error(message)) => {
                return Err(RuntimeError::ApplicationError {
                    app_id: app_id.to_string(),
                    message,
                });
            }
            Some(BusSignal::NotResponding { .. }) => continue,
            None => {
                return Err(RuntimeError::ExitedBeforeReady {
                    app_id: app_id.to_string(),
                });
            }
        }
    }
}

/// Post-ready signal handling: ANR escalates to a kill with core dump.
async fn watch_signals(
    app_id: AppId,
    mut signals: mpsc::UnboundedReceiver<BusSignal>,
    control: mpsc::UnboundedSender<SuspendOptions>,
) {
    while let Some(signal) = signals.recv().await {
        match signal {
            BusSignal::NotResponding { elapsed } => {
                tracing::warn!(
                    app_id = %app_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "killing unresponsive app"
                );
                let _ = control.send(SuspendOptions::force_with_core());
            }
            BusSignal::Error(message) => {
                tracing::error!(app_id = %app_id, error = %message, "app reported error after ready");
            }
            BusSignal::Ready => {}
        }
    }
}

async fn supervise(
    app_id: AppId,
    mut child: Child,
    pid: Option<u32>,
    bridge: Arc<AppBridge>,
    mut control: mpsc::UnboundedReceiver<SuspendOptions>,
    close_stdin: oneshot::Sender<()>,
) {
    let mut close_stdin = Some(close_stdin);
    let waited = loop {
        tokio::select! {
            waited = child.wait() => break waited,
            Some(options) = control.recv() => {
                if options.gcore {
                    if let Some(pid) = pid {
                        dump_core(&app_id, pid).await;
                    }
                }
                if options.force || options.gcore {
                    if let Err(err) = child.start_kill() {
                        tracing::warn!(app_id = %app_id, error = %err, "kill failed");
                    }
                } else if let Some(close) = close_stdin.take() {
                    let _ = close.send(());
                }
            }
        }
    };

    if let Some(close) = close_stdin.take() {
        let _ = close.send(());
    }

    let status = match waited {
        Ok(status) => exit_status(status),
        Err(err) => {
            tracing::warn!(app_id = %app_id, error = %err, "wait on app process failed");
            ExitStatus::default()
        }
    };
    bridge.did_exit(status);
}

fn exit_status(status: std::process::ExitStatus) -> ExitStatus {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ExitStatus {
        code: status.code(),
        signal,
    }
}

async fn dump_core(app_id: &str, pid: u32) {
    let prefix = std::env::temp_dir().join(format!("voxos-core-{app_id}"));
    let result = Command::new("gcore")
        .arg("-o")
        .arg(&prefix)
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match result {
        Ok(status) if status.success() => {
            tracing::info!(app_id, pid, path = %prefix.display(), "core dump captured");
        }
        Ok(status) => tracing::warn!(app_id, pid, ?status, "gcore failed"),
        Err(err) => tracing::warn!(app_id, pid, error = %err, "gcore unavailable"),
    }
}

async fn read_loop(app_id: AppId, stdout: ChildStdout, inbound: mpsc::Sender<AppMessage>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match protocol::decode(trimmed) {
                    Ok(Some(message)) => {
                        if inbound.send(message).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => tracing::warn!(app_id = %app_id, error = %err, "bad message dropped"),
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(app_id = %app_id, error = %err, "read from app failed");
                break;
            }
        }
    }
    tracing::debug!(app_id = %app_id, "app stdout closed");
}

async fn write_loop(
    app_id: AppId,
    mut stdin: ChildStdin,
    mut outbound: mpsc::UnboundedReceiver<HostMessage>,
    mut close: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut close => break,
            message = outbound.recv() => {
                let Some(message) = message else { break };
                let line = match protocol::encode(&message) {
                    Ok(line) => line,
                    Err(err) => {
                        tracing::warn!(app_id = %app_id, error = %err, "message not encodable");
                        continue;
                    }
                };
                if let Err(err) = write_line(&mut stdin, &line).await {
                    tracing::warn!(app_id = %app_id, error = %err, "write to app failed");
                    break;
                }
            }
        }
    }
    // Dropping stdin delivers EOF to the app.
    drop(stdin);
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}
