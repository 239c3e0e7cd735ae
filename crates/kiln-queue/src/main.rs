//! The kiln queue monitor daemon.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kiln_core::BuildId;
use kiln_queue::machine::parse_machines;
use kiln_queue::{ChannelDispatcher, Config, Machine, State};
use kiln_store::CliStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kiln-queue", about = "kiln queue monitor", long_about = None)]
struct Cli {
    /// PostgreSQL connection string.
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "postgres://kiln@127.0.0.1:5432/kiln"
    )]
    database_url: String,

    /// Machines file listing remote builders.
    #[arg(long, env = "KILN_MACHINES")]
    machines_file: Option<PathBuf>,

    /// Platforms buildable on this machine.
    #[arg(long, value_delimiter = ',', default_value = "x86_64-linux")]
    local_platforms: Vec<String>,

    /// Process only the given build id (debugging aid).
    #[arg(long)]
    build_one: Option<i32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    info!("connecting to database...");
    let pool = kiln_db::create_pool(&cli.database_url).await?;
    info!("database connected");

    let config = Config {
        local_platforms: cli.local_platforms.iter().cloned().collect::<BTreeSet<_>>(),
        build_one: cli.build_one.map(BuildId::from),
    };

    let (dispatcher, mut runnable) = ChannelDispatcher::new();
    let state = State::new(config, Arc::new(dispatcher));

    let mut machines = vec![Machine::local(state.config.local_platforms.iter().cloned())];
    if let Some(path) = &cli.machines_file {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading machines file {}", path.display()))?;
        machines.extend(parse_machines(&contents)?);
    }
    info!(machines = machines.len(), "machine registry loaded");
    state.set_machines(machines);

    // No in-process workers in this daemon; surface runnable steps on the
    // log for the dispatcher process consuming this channel.
    tokio::spawn(async move {
        while let Some(step) = runnable.recv().await {
            info!(drv = %step.drv_path(), "runnable step");
        }
    });

    state.run(pool, Arc::new(CliStore::new())).await;
    Ok(())
}
