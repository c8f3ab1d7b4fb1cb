//! Thin binary front door: parses flags, loads configuration, and wires the
//! library crates together (spec §1 lists CLI parsing, config file loading,
//! logging setup and leader election as external collaborators — this is
//! that wiring, not the core it fronts).

mod leader;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use nla_k8s::{ClusterClient, KubeClusterClient};

#[derive(Parser)]
#[command(name = "node-lifecycle-agent", version, about = "Drains unhealthy or replacement-slated cluster nodes")]
struct Cli {
	#[command(subcommand)]
	command: Command,

	/// Path to one or more config files; later paths override earlier ones
	/// and both are layered over the built-in defaults.
	#[clap(long, global = true)]
	config: Vec<PathBuf>,

	/// Overrides the auto-detected log output format.
	#[clap(long, global = true, value_enum)]
	log_format: Option<LogFormatArg>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormatArg {
	Logfmt,
	Json,
}

#[derive(Subcommand)]
enum Command {
	/// Runs the drain coordination engine until leadership is lost or the
	/// process receives a shutdown signal.
	Run,
	/// Loads and validates configuration, then exits. Does not touch the
	/// cluster; useful for config-map admission checks in CI.
	ValidateConfig,
}

fn main() -> Result<()> {
	nla_runtime::run(main_inner())?
}

async fn main_inner() -> Result<()> {
	let cli = Cli::parse();

	let log_format = match cli.log_format {
		Some(LogFormatArg::Logfmt) => nla_runtime::LogFormat::Logfmt,
		Some(LogFormatArg::Json) => nla_runtime::LogFormat::Json,
		None => nla_runtime::LogFormat::detect(),
	};
	nla_runtime::init_tracing(log_format);

	let config = nla_config::Config::load(&cli.config)
		.await
		.map_err(|err| anyhow::anyhow!("{err}"))
		.context("failed to load configuration")?;
	tracing::info!(
		config_name = %config.config_name,
		dry_run = config.dry_run,
		"loaded configuration"
	);

	match cli.command {
		Command::ValidateConfig => {
			tracing::info!("configuration is valid");
			Ok(())
		}
		Command::Run => run_controller(config).await,
	}
}

/// Builds every component in dependency order (spec §2) and hands them all
/// to `nla-service-manager` under one shutdown token: the leader election
/// watchdog, the group registry's node poll loop plus its support loops
/// (drain buffer persistence, simulator cache cleanup, global blocker
/// polling), and the scope observer's tick and queue-worker loops.
async fn run_controller(config: nla_config::Config) -> Result<()> {
	let client = kube::Client::try_default()
		.await
		.context("failed to build cluster client")?;
	let namespace =
		std::env::var("NLA_NAMESPACE").unwrap_or_else(|_| "kube-system".to_string());

	let shutdown = nla_runtime::shutdown_token();

	let election = leader::LeaderElection::spawn(
		client.clone(),
		namespace,
		config.leader_election.clone(),
		shutdown.clone(),
	);

	tracing::info!("waiting to acquire leadership");
	tokio::select! {
		_ = election.wait_until_leader(config.leader_election.retry_period) => {}
		_ = shutdown.cancelled() => {
			tracing::info!("shutdown requested before leadership was acquired");
			return Ok(());
		}
	}
	tracing::info!("acquired leadership; starting drain coordination engine");

	let cluster_client = Arc::new(KubeClusterClient::new(client));
	// Confirm cluster connectivity before marking the client "synced" --
	// the group registry requeues every node until this flips (spec §4.1).
	cluster_client
		.list_nodes()
		.await
		.context("failed initial node list; cannot confirm cluster connectivity")?;
	cluster_client.mark_synced();

	let registry = Arc::new(nla_core::GroupRegistry::new(
		cluster_client.clone(),
		config.clone(),
	));
	registry
		.initialize()
		.await
		.context("failed to load persisted drain buffer state")?;

	let scope_observer = Arc::new(nla_scope_observer::ScopeObserver::new(
		cluster_client.clone(),
		config.clone(),
		registry.metrics(),
	));

	let mut services = registry.services(config.timing.group_runner_period);

	let tick_observer = scope_observer.clone();
	services.push(nla_service_manager::Service::new(
		"scope-observer-tick",
		nla_service_manager::ServiceKind::Service,
		move |shutdown| {
			let tick_observer = tick_observer.clone();
			async move {
				tick_observer.run_tick_loop(shutdown).await;
				Ok(())
			}
		},
	));

	let queue_observer = scope_observer.clone();
	services.push(nla_service_manager::Service::new(
		"scope-observer-queue-worker",
		nla_service_manager::ServiceKind::Service,
		move |shutdown| {
			let queue_observer = queue_observer.clone();
			async move {
				queue_observer.run_queue_worker(shutdown).await;
				Ok(())
			}
		},
	));

	nla_service_manager::start(shutdown, services).await?;
	tracing::info!("clean shutdown after leadership loss");
	Ok(())
}
