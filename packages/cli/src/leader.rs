//! Leader election gate (spec §5 "A single leader election gate fronts the
//! entire controller"). The protocol itself is an external collaborator per
//! spec §1 — this module only consumes `kube-leader-election`'s lease lock
//! and turns its result into the fatal-on-loss behavior the spec mandates:
//! "loss of leadership is fatal (process terminates and restarts)".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use nla_config::LeaderElectionConfig;
use tokio_util::sync::CancellationToken;

pub struct LeaderElection {
	is_leader: Arc<AtomicBool>,
}

fn holder_id() -> String {
	let host = std::env::var("HOSTNAME")
		.or_else(|_| std::env::var("NLA_POD_NAME"))
		.unwrap_or_else(|_| "unknown-host".to_string());
	format!("{host}-{}", std::process::id())
}

impl LeaderElection {
	/// Spawns the background acquire/renew loop. Cancels `shutdown` the
	/// moment a held lease is lost, which the binary's top-level service
	/// supervisor treats as a request to wind everything down (exit code 0,
	/// per spec §6 — the orchestrator is expected to restart the process).
	pub fn spawn(
		client: Client,
		namespace: String,
		config: LeaderElectionConfig,
		shutdown: CancellationToken,
	) -> Self {
		let is_leader = Arc::new(AtomicBool::new(false));
		let flag = is_leader.clone();

		tokio::spawn(async move {
			loop {
				if shutdown.is_cancelled() {
					return;
				}

				let params = LeaseLockParams {
					holder_id: holder_id(),
					lease_name: config.lease_name.clone(),
					lease_ttl: config.lease_duration,
				};
				let lock = LeaseLock::new(client.clone(), &namespace, params);

				match lock.try_acquire_or_renew().await {
					Ok(lease) => {
						let was_leader = flag.swap(lease.acquired_lease, Ordering::SeqCst);
						if was_leader && !lease.acquired_lease {
							tracing::error!("lost leadership; shutting down for restart");
							shutdown.cancel();
							return;
						}
						if !was_leader && lease.acquired_lease {
							tracing::info!("acquired leadership");
						}
					}
					Err(err) => {
						tracing::warn!(%err, "leader election renew failed");
					}
				}

				tokio::select! {
					_ = tokio::time::sleep(config.retry_period) => {}
					_ = shutdown.cancelled() => return,
				}
			}
		});

		LeaderElection { is_leader }
	}

	pub fn is_leader(&self) -> bool {
		self.is_leader.load(Ordering::SeqCst)
	}

	/// Polls `is_leader` until it turns true. The caller races this against
	/// the shutdown token so a shutdown signal received while still waiting
	/// to be elected does not hang the process.
	pub async fn wait_until_leader(&self, poll_period: Duration) {
		while !self.is_leader() {
			tokio::time::sleep(poll_period).await;
		}
	}
}
