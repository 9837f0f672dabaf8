//! CLI entry point for voxos.
//!
//! This binary provides the `voxos` command with subcommands for running the
//! application runtime and inspecting its configuration.

mod cli;
mod device;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use voxos_runtime::types::CLOUD_APP_ID;
use voxos_runtime::{
    AppMetadata, AppRegistry, LaunchType, LauncherSet, LightLauncher, Nlu, ProcessLauncher,
    Runtime, RuntimeFile, RuntimeSignal,
};

use crate::cli::{Cli, Commands};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => cmd_run(&config).await,
        Commands::Apps { config } => cmd_apps(&config),
        Commands::Check { config } => cmd_check(&config),
    }
}

// ---------------------------------------------------------------------------
// Subcommand: run
// ---------------------------------------------------------------------------

async fn cmd_run(path: &Path) -> Result<()> {
    // 1. Initialize tracing subscriber.
    init_tracing("info");

    // 2. Load config.
    let file = load_config(path)?;
    let apps = AppRegistry::from_apps(file.apps);
    if !apps.contains(CLOUD_APP_ID) {
        apps.register(AppMetadata::new(CLOUD_APP_ID, LaunchType::Light));
    }

    // 3. Wire launchers and device services.
    let light = LightLauncher::new();
    light.register(CLOUD_APP_ID, Arc::new(device::CloudHost));
    let launchers = LauncherSet::new()
        .with(LaunchType::Light, Arc::new(light))
        .with(
            LaunchType::Exe,
            Arc::new(ProcessLauncher::new(file.config.clone())),
        );

    let runtime = Runtime::new(file.config, apps, device::capabilities(), launchers);
    runtime.start();

    let mut signals = runtime.subscribe();
    let reporter = tokio::spawn(async move {
        loop {
            match signals.recv().await {
                Ok(signal) => report_signal(&signal),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "signal reporter lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // 4. Read NLU results.
    println!();
    println!("  voxos v{}", env!("CARGO_PKG_VERSION"));
    println!("  One NLU JSON object per line, or 'quit' to exit.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read input")?,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                None
            }
        };
        let Some(line) = line else {
            break;
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "quit" || trimmed == "exit" {
            info!("user requested exit");
            break;
        }

        match serde_json::from_str::<Nlu>(trimmed) {
            Ok(nlu) => {
                if let Err(e) = runtime.handle_nlu(nlu).await {
                    error!(error = %e, "nlu dispatch failed");
                }
            }
            Err(e) => error!(error = %e, "input is not an NLU object"),
        }
    }

    runtime.shutdown().await;
    reporter.abort();
    Ok(())
}

fn report_signal(signal: &RuntimeSignal) {
    match signal {
        RuntimeSignal::AppStatusChanged { app_id, status, .. } => {
            info!(app_id = %app_id, status = %status, "app status");
        }
        RuntimeSignal::AppExited { app_id, status, .. } => {
            info!(app_id = %app_id, code = ?status.code, signal = ?status.signal, "app exited");
        }
        RuntimeSignal::AppNotResponding {
            app_id, elapsed_ms, ..
        } => {
            warn!(app_id = %app_id, elapsed_ms, "app not responding");
        }
        RuntimeSignal::StackChanged { .. } => {
            if let Some(stack) = signal.stack_payload() {
                info!(stack = %stack, "stack changed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Subcommands: apps, check
// ---------------------------------------------------------------------------

fn cmd_apps(path: &Path) -> Result<()> {
    init_tracing("warn");
    let file = load_config(path)?;

    if file.apps.is_empty() {
        println!("No apps installed.");
        return Ok(());
    }

    println!("{:<24} {:<6} {:<6} {:<7} EXEC", "ID", "TYPE", "FORM", "DAEMON");
    for app in &file.apps {
        println!(
            "{:<24} {:<6} {:<6} {:<7} {}",
            app.id,
            app.launch_type.to_string(),
            app.form.to_string(),
            if app.daemon { "yes" } else { "no" },
            app.exec.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

fn cmd_check(path: &Path) -> Result<()> {
    init_tracing("warn");
    let file = load_config(path)?;
    println!(
        "{}: ok ({} apps, ready timeout {:?}, anr threshold {:?})",
        path.display(),
        file.apps.len(),
        file.config.ready_timeout,
        file.config.anr_threshold,
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<RuntimeFile> {
    RuntimeFile::load(path).with_context(|| format!("failed to load {}", path.display()))
}

/// Initialize the tracing subscriber with the given default level, honoring
/// `RUST_LOG` when set.
fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
