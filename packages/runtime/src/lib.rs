//! Process bootstrap: builds the tokio runtime, installs a `tracing`
//! subscriber, and maps the result of the top-level future to the exit
//! codes spec §6 reserves ("0 on clean shutdown after leadership loss;
//! non-zero for configuration-validation failure, cluster client
//! construction failure, leader lock acquisition failure, and any panic").

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Log output format, selected by `NLA_LOG_FORMAT` / `--log-format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
	/// Human-readable, colorized logfmt — the default for an interactive
	/// terminal.
	Logfmt,
	/// Structured JSON — the default when stdout is not a TTY (containers,
	/// CI).
	Json,
}

impl LogFormat {
	pub fn detect() -> Self {
		if atty_stdout_is_terminal() {
			LogFormat::Logfmt
		} else {
			LogFormat::Json
		}
	}
}

fn atty_stdout_is_terminal() -> bool {
	use std::io::IsTerminal;
	std::io::stdout().is_terminal()
}

/// Installs the global `tracing` subscriber. Must be called exactly once,
/// before any other part of the process emits a tracing event.
pub fn init_tracing(format: LogFormat) {
	let env_filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

	match format {
		LogFormat::Logfmt => {
			tracing_subscriber::registry()
				.with(env_filter)
				.with(tracing_logfmt::layer())
				.init();
		}
		LogFormat::Json => {
			tracing_subscriber::fmt()
				.json()
				.with_env_filter(env_filter)
				.init();
		}
	}
}

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Builds the tokio multi-thread runtime and drives `fut` to completion,
/// converting a panic anywhere in the task tree into `Err` instead of
/// aborting the process silently — the spec mandates a non-zero exit code
/// on panic, not a core dump.
pub fn run<F, T>(fut: F) -> anyhow::Result<T>
where
	F: Future<Output = T> + Send + 'static,
	T: Send + 'static,
{
	let runtime = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?;

	runtime.block_on(async move {
		let handle = tokio::spawn(fut);
		match handle.await {
			Ok(value) => Ok(value),
			Err(join_err) if join_err.is_panic() => {
				anyhow::bail!("task panicked: {join_err}");
			}
			Err(join_err) => anyhow::bail!("task cancelled: {join_err}"),
		}
	})
}

/// A shutdown token cancelled on `SIGTERM`/`SIGINT` or on loss of
/// leadership (spec §5 "a top-level context cancels on leadership loss and
/// propagates to every runner"). Cloned and threaded through every runner.
pub fn shutdown_token() -> CancellationToken {
	let token = CancellationToken::new();
	let watcher = token.clone();
	tokio::spawn(async move {
		let ctrl_c = tokio::signal::ctrl_c();
		#[cfg(unix)]
		{
			let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
				.expect("failed to install SIGTERM handler");
			tokio::select! {
				_ = ctrl_c => {}
				_ = term.recv() => {}
			}
		}
		#[cfg(not(unix))]
		{
			let _ = ctrl_c.await;
		}
		tracing::info!("received shutdown signal");
		watcher.cancel();
	});
	token
}
