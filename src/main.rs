mod cli;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{split_compose_args, Cli, Commands};
use portshift::ports::PortRange;
use portshift::{compose, server, Supervisor};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.parse()?),
        )
        .init();

    if cli.min >= cli.max {
        bail!("--min must be below --max");
    }
    let range = PortRange::new(cli.min, cli.max);
    let supervisor = Supervisor::new(range);

    match cli.command {
        Some(Commands::Compose { args }) => run_compose(&supervisor, &args).await,
        None => run_supervisor(supervisor, cli.port).await,
    }
}

async fn run_compose(supervisor: &Supervisor, args: &[String]) -> Result<()> {
    let Some((file, passthrough)) = split_compose_args(args) else {
        bail!("missing compose file; usage: portshift compose [-f] <file> [args...]");
    };

    supervisor
        .bootstrap()
        .await
        .context("cannot read current container state")?;

    let plan = supervisor.pre_planner().plan(&file).await?;

    if plan.remappings.is_empty() {
        info!("no port conflicts detected, running docker-compose directly");
    } else {
        info!("applying {} port remappings:", plan.remappings.len());
        for (key, new_port) in &plan.remappings {
            if let Some((service, old_port)) = key.split_once(':') {
                info!("  {}: {} -> {}", service, old_port, new_port);
            }
        }
    }

    let launch_file = plan.rewritten_file.clone().unwrap_or(file);
    let status = compose::exec_compose(&launch_file, &passthrough).await;
    if let Some(temp) = plan.rewritten_file {
        let _ = std::fs::remove_file(temp);
    }

    std::process::exit(status?.code().unwrap_or(1));
}

async fn run_supervisor(supervisor: Supervisor, port: u16) -> Result<()> {
    info!("starting portshift");
    info!("dynamic allocation range: {}", supervisor.range());

    supervisor
        .bootstrap()
        .await
        .context("cannot reach the container runtime")?;

    let reconciler = supervisor.spawn_reconciler();

    info!(
        "open http://localhost:{} to view tracked containers",
        port
    );
    server::serve(supervisor.store(), port, shutdown_signal()).await;

    // In-flight workers are detached and run to completion on their own;
    // only the event loop is torn down here.
    reconciler.abort();
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
    info!("received shutdown signal, stopping");
}
