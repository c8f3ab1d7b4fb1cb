//! Supervises the agent's long-running and one-shot tasks: restarts a
//! service that exits or errors, and lets a single `CancellationToken` fan
//! out a coordinated shutdown to every one of them (spec §4.1: the group
//! poll loop, the per-group runner pairs, the scope observer, and the
//! global blocker poller are all independent supervised tasks).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct Service {
	pub name: &'static str,
	pub kind: ServiceKind,
	pub run: Arc<
		dyn Fn(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync,
	>,
}

impl Service {
	pub fn new<F, Fut>(name: &'static str, kind: ServiceKind, run: F) -> Self
	where
		F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
	{
		Service {
			name,
			kind,
			run: Arc::new(move |shutdown| Box::pin(run(shutdown))),
		}
	}
}

/// How a service is expected to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
	/// Runs indefinitely; any exit (clean or errored) is unexpected and
	/// triggers a restart, unless shutdown has already been requested.
	Service,
	/// Runs to completion once; only an error triggers a retry.
	Oneshot,
}

/// Spawns every service and waits for them all to finish. `Service`-kind
/// entries only finish once `shutdown` has been cancelled.
pub async fn start(shutdown: CancellationToken, services: Vec<Service>) -> anyhow::Result<()> {
	tracing::info!(services = services.len(), "starting services");
	let mut join_set = tokio::task::JoinSet::new();

	for service in services {
		let shutdown = shutdown.clone();
		join_set
			.build_task()
			.name(&format!("nla::service::{}", service.name))
			.spawn(run_supervised(service, shutdown))
			.context("failed to spawn service")?;
	}

	join_set.join_all().await;
	tracing::info!("all services finished");
	Ok(())
}

async fn run_supervised(service: Service, shutdown: CancellationToken) {
	loop {
		tracing::debug!(service = %service.name, kind = ?service.kind, "starting service");
		let outcome = (service.run)(shutdown.clone()).await;
		let finished_cleanly = outcome.is_ok();

		match outcome {
			Ok(()) if service.kind == ServiceKind::Service => {
				tracing::error!(service = %service.name, "service exited unexpectedly");
			}
			Ok(()) => {
				tracing::debug!(service = %service.name, "service finished");
			}
			Err(err) => {
				tracing::error!(service = %service.name, %err, "service crashed");
			}
		}

		if shutdown.is_cancelled() {
			return;
		}
		if service.kind == ServiceKind::Oneshot && finished_cleanly {
			return;
		}

		tokio::time::sleep(Duration::from_secs(1)).await;
		tracing::info!(service = %service.name, "restarting service");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	#[tokio::test]
	async fn oneshot_runs_once_on_success() {
		let runs = Arc::new(AtomicU32::new(0));
		let shutdown = CancellationToken::new();
		let counter = runs.clone();
		let service = Service::new("oneshot", ServiceKind::Oneshot, move |_shutdown| {
			let counter = counter.clone();
			async move {
				counter.fetch_add(1, Ordering::SeqCst);
				Ok(())
			}
		});
		start(shutdown, vec![service]).await.unwrap();
		assert_eq!(runs.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn service_stops_restarting_once_shutdown_is_cancelled() {
		let runs = Arc::new(AtomicU32::new(0));
		let shutdown = CancellationToken::new();
		let counter = runs.clone();
		let service_shutdown = shutdown.clone();
		let service = Service::new("looper", ServiceKind::Service, move |_shutdown| {
			let counter = counter.clone();
			let shutdown = service_shutdown.clone();
			async move {
				let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
				if n >= 3 {
					shutdown.cancel();
				}
				Ok(())
			}
		});

		tokio::time::pause();
		let handle = tokio::spawn(start(shutdown, vec![service]));
		for _ in 0..3 {
			tokio::time::advance(Duration::from_secs(1)).await;
		}
		handle.await.unwrap().unwrap();
		assert!(runs.load(Ordering::SeqCst) >= 3);
	}
}
