//! berthd — the Berth daemon.
//!
//! Single binary that assembles the deployment platform:
//! - State store (redb)
//! - Strategy factory (docker / process supervisor)
//! - Orchestrator + per-deployment lifecycle
//! - Health & metrics monitor
//! - Auto-scaling engine
//! - Command channel (JSON lines over a unix socket)
//!
//! # Usage
//!
//! ```text
//! berthd standalone --socket /run/berth.sock --data-dir /var/lib/berth
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use berth_autoscale::{Engine, ScaleFn};
use berth_monitor::{Monitor, MonitorEvent};
use berth_orchestrator::{Command as DeployCommand, CommandReport, Orchestrator};
use berth_strategy::{
    ArtifactFactory, HostCapacity, Pm2Supervisor, StrategyFactory, WorkspaceLayout,
};

#[derive(Parser)]
#[command(name = "berthd", about = "Berth deployment daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run in standalone mode (single node, all subsystems in one process).
    Standalone {
        /// Unix socket path for the command channel.
        #[arg(long, default_value = "/run/berth.sock")]
        socket: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/berth")]
        data_dir: PathBuf,

        /// Root directory for deployment workspaces.
        #[arg(long, default_value = "/var/lib/berth/workspaces")]
        workspace_dir: PathBuf,

        /// Health/metrics polling interval in seconds.
        #[arg(long, default_value = "10")]
        poll_interval: u64,

        /// Auto-scaling evaluation interval in seconds.
        #[arg(long, default_value = "30")]
        autoscale_interval: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,berthd=debug,berth=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Standalone {
            socket,
            data_dir,
            workspace_dir,
            poll_interval,
            autoscale_interval,
        } => {
            run_standalone(
                socket,
                data_dir,
                workspace_dir,
                Duration::from_secs(poll_interval),
                Duration::from_secs(autoscale_interval),
            )
            .await
        }
    }
}

async fn run_standalone(
    socket: PathBuf,
    data_dir: PathBuf,
    workspace_dir: PathBuf,
    poll_interval: Duration,
    autoscale_interval: Duration,
) -> anyhow::Result<()> {
    info!("berth daemon starting in standalone mode");

    std::fs::create_dir_all(&data_dir)?;
    std::fs::create_dir_all(&workspace_dir)?;

    // ── Subsystems ─────────────────────────────────────────────────

    let state = berth_state::StateStore::open(&data_dir.join("berth.redb"))?;
    info!(path = ?data_dir, "state store opened");

    let capacity = HostCapacity::detect();
    info!(
        memory_bytes = capacity.memory_bytes,
        cpu_cores = capacity.cpu_cores,
        "host capacity detected"
    );

    let factory = Arc::new(ArtifactFactory::new(
        WorkspaceLayout::new(&workspace_dir),
        capacity,
        Arc::new(Pm2Supervisor::new()),
    ));

    let (monitor, mut monitor_events) = Monitor::new(state.clone(), poll_interval);
    let monitor = Arc::new(monitor);

    let orchestrator = Arc::new(Orchestrator::new(
        state.clone(),
        factory.clone(),
        monitor.clone(),
    ));

    // Resume monitoring for deployments that were active when the
    // daemon last stopped.
    for deployment in state.list_deployments()? {
        if !deployment.status.is_active() {
            continue;
        }
        let Some(project) = state.get_project(&deployment.project_id)? else {
            warn!(deployment_id = %deployment.id, "active deployment without project");
            continue;
        };
        match factory.create(&deployment, &project).await {
            Ok(strategy) => monitor.start(&deployment.id, strategy).await,
            Err(e) => {
                warn!(deployment_id = %deployment.id, error = %e, "could not resume monitoring")
            }
        }
    }

    let scale_fn: ScaleFn = {
        let orchestrator = orchestrator.clone();
        Arc::new(move |deployment_id, target| {
            let orchestrator = orchestrator.clone();
            Box::pin(async move {
                orchestrator.scale(&deployment_id, target).await?;
                Ok(())
            })
        })
    };
    let (engine, mut scale_events) = Engine::new(state.clone(), poll_interval, scale_fn);
    let engine = Arc::new(engine);
    let restored = engine.load_persisted().await?;
    info!(rule_sets = restored, "auto-scaling engine initialized");

    // ── Background tasks ───────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let engine_handle = {
        let engine = engine.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { engine.run(autoscale_interval, shutdown).await })
    };

    // Alert consumer: a runtime that is gone marks the deployment
    // unhealthy; a recovery moves it back.
    let alerts_handle = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            while let Some(event) = monitor_events.recv().await {
                match event {
                    MonitorEvent::HealthAlert {
                        deployment_id,
                        state,
                        running,
                        ..
                    } => {
                        warn!(%deployment_id, ?state, running, "health alert");
                        if !running {
                            if let Err(e) = orchestrator.mark_unhealthy(&deployment_id).await {
                                warn!(%deployment_id, error = %e, "could not mark unhealthy");
                            }
                        }
                    }
                    MonitorEvent::Recovered { deployment_id, .. } => {
                        if let Err(e) = orchestrator.mark_recovered(&deployment_id).await {
                            warn!(%deployment_id, error = %e, "could not mark recovered");
                        }
                    }
                }
            }
        })
    };

    // Audit sink for scaling events.
    let scaled_handle = tokio::spawn(async move {
        while let Some(event) = scale_events.recv().await {
            info!(
                deployment_id = %event.deployment_id,
                previous = event.previous,
                new = event.new,
                reason = %event.reason,
                "scaled"
            );
        }
    });

    // ── Command channel ────────────────────────────────────────────

    let (command_tx, command_rx) = mpsc::channel(16);
    let serve_handle = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.serve(command_rx).await })
    };

    if socket.exists() {
        std::fs::remove_file(&socket)?;
    }
    let listener = UnixListener::bind(&socket)?;
    info!(socket = ?socket, "command channel listening");

    let mut shutdown = shutdown_rx.clone();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let command_tx = command_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, command_tx).await {
                                warn!(error = %e, "command connection failed");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            _ = shutdown.changed() => break,
        }
    }

    // ── Graceful shutdown ──────────────────────────────────────────

    let _ = shutdown_tx.send(true);
    monitor.stop_all().await;
    drop(command_tx);
    let _ = serve_handle.await;
    engine_handle.abort();
    alerts_handle.abort();
    scaled_handle.abort();
    let _ = std::fs::remove_file(&socket);
    info!("berth daemon stopped");
    Ok(())
}

/// One command-channel connection: JSON command per line, JSON report
/// per line back.
async fn handle_connection(
    stream: UnixStream,
    commands: mpsc::Sender<berth_orchestrator::CommandEnvelope>,
) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let report = match serde_json::from_str::<DeployCommand>(&line) {
            Ok(command) => {
                let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
                commands
                    .send(berth_orchestrator::CommandEnvelope {
                        command,
                        reply: Some(reply_tx),
                    })
                    .await?;
                reply_rx.await?
            }
            Err(e) => CommandReport {
                deployment_id: None,
                status: None,
                error: Some(format!("invalid command: {e}")),
            },
        };

        let mut rendered = serde_json::to_vec(&report)?;
        rendered.push(b'\n');
        writer.write_all(&rendered).await?;
    }
    Ok(())
}
