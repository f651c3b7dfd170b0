// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Lifecycle driver. A user program registers its remote functions and
//! hands [`run_program`] a cluster computation; the same executable then
//! serves as master (dispatching work) or worker (executing it), selected
//! by subcommand.

use crate::config::{make_config_loader, ConfigLoader, MasterConfig};
use crate::db::{ProgramDb, SqliteProgramDb};
use crate::hold::{HoldApi, HoldMap};
use crate::launcher::{ProcessLauncher, WorkerLauncher};
use crate::model::{NodeId, ProgramId, ServiceId};
use crate::registry::ClosureRegistry;
use crate::transport::{Node, Transport};
use crate::worker::{run_worker, WorkerOptions};
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "gridrun", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the master: dispatch the program's computation to workers.
    Master(MasterArgs),
    /// Run a worker; normally invoked only by a launcher.
    Worker(WorkerArgs),
}

#[derive(Args, Debug)]
pub struct MasterArgs {
    /// Configuration file; defaults to config/gridrun.toml.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Service id this worker registers under.
    #[arg(long)]
    pub service: ServiceId,
    /// Address of the master node.
    #[arg(long)]
    pub master_address: NodeId,
    /// Where this worker writes its log.
    #[arg(long)]
    pub log_file: PathBuf,
    /// Host the master can dial this worker's node on.
    #[arg(long, default_value = "127.0.0.1")]
    pub advertise_host: String,
}

/// Everything a cluster computation needs: the master node, the launcher
/// to provision workers through, the hold map for operator-gated retries
/// and the program database.
pub struct ClusterCtx {
    pub program_id: ProgramId,
    pub node: Node,
    pub launcher: Arc<dyn WorkerLauncher>,
    pub hold_map: Arc<HoldMap>,
    pub db: Arc<dyn ProgramDb>,
    pub config: MasterConfig,
}

/// Entry point for user programs. Call from `main` with the registry built
/// at startup; both roles use the identical registry, which is what makes
/// closures-by-identifier sound.
pub fn run_program<F, Fut>(registry: ClosureRegistry, computation: F) -> anyhow::Result<()>
where
    F: FnOnce(ClusterCtx) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let cli = Cli::parse();
    let registry = Arc::new(registry);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    match cli.command {
        Command::Master(args) => runtime.block_on(run_master(args, registry, computation)),
        Command::Worker(args) => runtime.block_on(run_worker_role(args, registry)),
    }
}

async fn run_worker_role(args: WorkerArgs, registry: Arc<ClosureRegistry>) -> anyhow::Result<()> {
    crate::tracing::init_file_tracing(&crate::tracing::TracingConfig::default(), &args.log_file)
        .with_context(|| format!("failed to open worker log file {}", args.log_file.display()))?;

    info!(service = %args.service, master = %args.master_address, pid = std::process::id(), "worker starting");
    for (key, value) in std::env::vars() {
        debug!(%key, %value, "worker environment");
    }

    let options = WorkerOptions::new(args.master_address, args.service, args.advertise_host);
    match run_worker(options, registry).await {
        Ok(()) => {
            info!("worker finished");
            Ok(())
        }
        Err(err) => {
            error!(%err, "worker failed");
            Err(err.into())
        }
    }
}

async fn run_master<F, Fut>(
    args: MasterArgs,
    registry: Arc<ClosureRegistry>,
    computation: F,
) -> anyhow::Result<()>
where
    F: FnOnce(ClusterCtx) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let config: MasterConfig = match &args.config {
        Some(path) => ConfigLoader::new(path).load(),
        None => make_config_loader().load(),
    }
    .map_err(|err| anyhow::anyhow!("failed to load configuration: {err}"))?;

    let program_id = ProgramId::new();
    let log_dir = config.work_dir.join("logs");
    tokio::fs::create_dir_all(&log_dir)
        .await
        .with_context(|| format!("failed to create work dir {}", config.work_dir.display()))?;

    let master_log = log_dir.join(format!("master-{program_id}.log"));
    crate::tracing::init_file_tracing(&config.tracing, &master_log)
        .with_context(|| format!("failed to open master log file {}", master_log.display()))?;
    info!(program = %program_id, pid = std::process::id(), "master starting");

    if let Some(parent) = config.database_file.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let db = Arc::new(
        SqliteProgramDb::connect(&config.database_file, config.max_db_connections)
            .await
            .with_context(|| {
                format!(
                    "failed to open program database {}",
                    config.database_file.display()
                )
            })?,
    );

    let transport = Transport::bind(&config.listen_host, &config.node_ports)
        .await
        .context("failed to bind the master node")?;
    let node = Node::start(transport, &config.advertised_host, registry);
    info!(node = %node.id(), "master node bound");

    let (executable, staged) = stage_executable(&config, &program_id).await?;
    db.record_run(&program_id, &executable.display().to_string())
        .await
        .context("failed to record program run")?;

    let hold_map = Arc::new(HoldMap::new());
    let hold_api = HoldApi::start_from(hold_map.clone(), config.hold_port_start)
        .await
        .context("failed to start the hold api")?;
    info!(port = hold_api.port(), "hold api listening");

    let launcher = ProcessLauncher::new(executable.clone(), log_dir)
        .with_advertise_host(config.advertised_host.clone())
        .with_connect_timeout(config.worker_connect_timeout)
        .with_hold_map(hold_map.clone());

    let ctx = ClusterCtx {
        program_id,
        node,
        launcher: Arc::new(launcher),
        hold_map,
        db: db.clone(),
        config,
    };

    let result = computation(ctx).await;

    if staged {
        if let Err(err) = tokio::fs::remove_file(&executable).await {
            warn!(executable = %executable.display(), %err, "failed to remove staged executable");
        }
    }
    hold_api.stop().await;
    if let Err(err) = db.finish_run(&program_id).await {
        warn!(%err, "failed to mark program run finished");
    }

    match result {
        Ok(()) => {
            info!(program = %program_id, "master computation finished");
            Ok(())
        }
        Err(err) => {
            error!(program = %program_id, error = %format!("{err:#}"), "master computation failed");
            Err(err)
        }
    }
}

/// Launchers need a path that stays valid for the whole run, so unless an
/// explicit worker executable is configured the current one is copied into
/// the work dir and removed again at the end of the run.
async fn stage_executable(
    config: &MasterConfig,
    program_id: &ProgramId,
) -> anyhow::Result<(PathBuf, bool)> {
    if let Some(executable) = &config.worker_executable {
        return Ok((executable.clone(), false));
    }

    let current = std::env::current_exe().context("failed to resolve the current executable")?;
    let name = current
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "program".to_string());
    let bin_dir = config.work_dir.join("bin");
    tokio::fs::create_dir_all(&bin_dir).await?;
    let staged = bin_dir.join(format!("{name}-{program_id}"));
    tokio::fs::copy(&current, &staged)
        .await
        .with_context(|| format!("failed to stage executable at {}", staged.display()))?;
    debug!(from = %current.display(), to = %staged.display(), "staged program executable");
    Ok((staged, true))
}
