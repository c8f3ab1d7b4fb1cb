//! The Drainer (spec §4.5): cordons a node, evicts its pods concurrently
//! under an overall deadline, cleans up PVCs eligible for deletion, and
//! records the drain-completed condition on success.
//!
//! Orchestration (taint transitions, retry wall bookkeeping, per-condition
//! overrides) belongs to the Drain Runner in `nla-core`; this crate only
//! owns the mechanical "make the node empty" operation, a narrow client
//! wrapper the runner loop above it drives.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nla_config::Config;
use nla_filters::pod_filter::{PodDrainDecision, drain_pod_filter};
use nla_k8s::ClusterClient;
use nla_k8s::annotations::{DELETE_PVC_STORAGE_CLASS, EVICTION_API_URL};
use nla_k8s::client::EvictOutcome;
use nla_k8s::node::NodeView;
use nla_k8s::pod::PodView;
use nla_limiter::CordonLimiter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(thiserror::Error, Debug)]
pub enum DrainError {
	#[error("cordon limiter denied drain: {0}")]
	CordonLimitReached(String),

	#[error("drain timed out")]
	Timeout,

	#[error("eviction failed for one or more pods: {0:?}")]
	EvictionFailed(Vec<String>),

	#[error(transparent)]
	Cluster(#[from] nla_error::Error),
}

impl DrainError {
	/// Spec §4.4 step 7: an inherently non-retryable failure should fail the
	/// drain immediately rather than burn through `max_drain_attempts_before_fail`
	/// retries that can never succeed. Cordon/timeout/eviction failures are
	/// all transient by nature; a cluster error defers to its own classification.
	pub fn is_terminal(&self) -> bool {
		match self {
			DrainError::CordonLimitReached(_) | DrainError::Timeout | DrainError::EvictionFailed(_) => false,
			DrainError::Cluster(err) => err.is_terminal(),
		}
	}
}

/// Drains a single node: cordon, evict, clean up storage, record completion.
/// Generic over `ClusterClient` so it can run against the in-memory fake in
/// tests as well as the live API client.
pub struct Drainer<C: ClusterClient + 'static> {
	client: Arc<C>,
	cordon_limiter: Arc<CordonLimiter<C>>,
	config: Config,
}

impl<C: ClusterClient + 'static> Drainer<C> {
	pub fn new(client: Arc<C>, cordon_limiter: Arc<CordonLimiter<C>>, config: Config) -> Self {
		Drainer { client, cordon_limiter, config }
	}

	/// Normal drain path: the cordon limiter gets a say (spec §4.5 step 1).
	pub async fn drain(&self, node: &NodeView, all_nodes: &[NodeView]) -> Result<(), DrainError> {
		self.run(node, all_nodes, false).await
	}

	/// `drain-asap` / force-draining path: bypasses the cordon limiter
	/// entirely (spec §4.6 "force drain").
	pub async fn force_drain(&self, node: &NodeView) -> Result<(), DrainError> {
		self.run(node, &[], true).await
	}

	async fn run(&self, node: &NodeView, all_nodes: &[NodeView], force: bool) -> Result<(), DrainError> {
		let started_at = Utc::now();

		if !force {
			self.cordon_limiter
				.evaluate(node, all_nodes)
				.map_err(DrainError::CordonLimitReached)?;
		}
		if !node.unschedulable {
			self.client.set_unschedulable(&node.name, true).await?;
		}

		let pods = self.client.list_pods_on_node(&node.name).await?;
		let to_evict: Vec<PodView> = pods
			.into_iter()
			.filter(|pod| matches!(drain_pod_filter(pod), PodDrainDecision::Evict))
			.collect();

		self.evict_all(&to_evict).await?;

		for pod in &to_evict {
			if let Err(err) = self.cleanup_pvcs(&pod.clone()).await {
				tracing::warn!(
					pod = %format!("{}/{}", pod.namespace, pod.name),
					%err,
					"pvc cleanup failed after eviction"
				);
			}
		}

		self.client
			.record_drain_condition(&node.name, started_at, Utc::now())
			.await?;
		Ok(())
	}

	/// Evicts every pod concurrently, each under its own grace period, all
	/// bounded by the overall `max-grace-period + eviction-headroom`
	/// deadline (spec §4.5 step 3). A timeout or unrecoverable per-pod error
	/// cancels the remaining in-flight evictions via a shared token.
	async fn evict_all(&self, pods: &[PodView]) -> Result<(), DrainError> {
		if pods.is_empty() {
			return Ok(());
		}

		let overall_deadline = self.config.eviction.max_grace_period + self.config.timing.eviction_headroom;
		let poll_interval = self.config.eviction.poll_interval;
		let max_grace = self.config.eviction.max_grace_period.as_secs() as i64;
		let abort = CancellationToken::new();

		let (tx, mut rx) = mpsc::channel::<Result<(), String>>(pods.len());
		for pod in pods {
			let tx = tx.clone();
			let abort = abort.clone();
			let client = self.client.clone();
			let pod = pod.clone();
			let grace = pod
				.termination_grace_period_seconds
				.unwrap_or(max_grace)
				.min(max_grace)
				.max(0);
			tokio::spawn(async move {
				let result = evict_one(client, pod, grace, poll_interval, abort).await;
				let _ = tx.send(result).await;
			});
		}
		drop(tx);

		let collect = async {
			let mut failures = Vec::new();
			let mut remaining = pods.len();
			while remaining > 0 {
				match rx.recv().await {
					Some(Ok(())) => {}
					Some(Err(reason)) => failures.push(reason),
					None => break,
				}
				remaining -= 1;
			}
			failures
		};

		match tokio::time::timeout(overall_deadline, collect).await {
			Ok(failures) if failures.is_empty() => Ok(()),
			Ok(failures) => Err(DrainError::EvictionFailed(failures)),
			Err(_) => {
				abort.cancel();
				Err(DrainError::Timeout)
			}
		}
	}

	/// Deletes a pod's PVCs (and their backing PVs) when the pod carries the
	/// `delete-pvc-and-pv-with-storage-class` annotation matching the
	/// claim's storage class, or when the global allowlist toggle is set
	/// (spec §4.5 step 4). Pods with a custom eviction URL are left alone:
	/// their storage lifecycle is owned by whatever backs that URL.
	async fn cleanup_pvcs(&self, pod: &PodView) -> nla_error::Result<()> {
		if pod.annotations.contains_key(EVICTION_API_URL) {
			return Ok(());
		}

		for claim_name in &pod.volume_claims {
			let Some(pvc) = self.client.get_pvc(&pod.namespace, claim_name).await? else {
				continue;
			};

			let annotation_match = pod
				.annotations
				.get(DELETE_PVC_STORAGE_CLASS)
				.map(|wanted| Some(wanted.as_str()) == pvc.storage_class.as_deref())
				.unwrap_or(false);
			let allowlisted = self.config.pvc_cleanup.enable_without_custom_eviction_url
				&& pvc
					.storage_class
					.as_deref()
					.map(|sc| self.config.pvc_cleanup.allowlisted_storage_classes.iter().any(|a| a == sc))
					.unwrap_or(false);

			if !annotation_match && !allowlisted {
				continue;
			}

			let original_uid = pvc.uid.clone();
			self.client.delete_pvc(&pod.namespace, &pvc.name).await?;
			self.poll_pvc_gone(&pod.namespace, &pvc.name, original_uid).await?;

			if let Some(volume_name) = &pvc.volume_name {
				if let Some(pv) = self.client.get_pv(volume_name).await? {
					let pv_uid = pv.uid.clone();
					self.client.delete_pv(volume_name).await?;
					self.poll_pv_gone(volume_name, pv_uid).await?;
				}
			}

			if pod.is_stateful_set_controlled() {
				self.redelete_until_claim_recreated(pod, claim_name).await?;
			}
		}
		Ok(())
	}

	async fn poll_pvc_gone(
		&self,
		namespace: &str,
		name: &str,
		original_uid: Option<String>,
	) -> nla_error::Result<()> {
		let deadline = self.config.pvc_cleanup.poll_timeout;
		let interval = self.config.pvc_cleanup.poll_interval;
		let client = self.client.clone();
		let namespace = namespace.to_string();
		let name = name.to_string();
		let poll = async move {
			loop {
				match client.get_pvc(&namespace, &name).await? {
					None => return Ok(()),
					Some(current) if current.uid != original_uid => return Ok(()),
					Some(_) => tokio::time::sleep(interval).await,
				}
			}
		};
		match tokio::time::timeout(deadline, poll).await {
			Ok(result) => result,
			Err(_) => Err(nla_error::Error::Timeout(deadline)),
		}
	}

	async fn poll_pv_gone(&self, name: &str, original_uid: Option<String>) -> nla_error::Result<()> {
		let deadline = self.config.pvc_cleanup.poll_timeout;
		let interval = self.config.pvc_cleanup.poll_interval;
		let client = self.client.clone();
		let name = name.to_string();
		let poll = async move {
			loop {
				match client.get_pv(&name).await? {
					None => return Ok(()),
					Some(current) if current.uid != original_uid => return Ok(()),
					Some(_) => tokio::time::sleep(interval).await,
				}
			}
		};
		match tokio::time::timeout(deadline, poll).await {
			Ok(result) => result,
			Err(_) => Err(nla_error::Error::Timeout(deadline)),
		}
	}

	/// Stateful-set pods are re-created by their controller with a fresh
	/// claim once the old one is gone; the replacement pod inherits the
	/// drained node's PVC binding unless we keep deleting it until a new
	/// claim shows up (spec §4.5 step 4's "stateful set re-creation cadence").
	async fn redelete_until_claim_recreated(&self, pod: &PodView, claim_name: &str) -> nla_error::Result<()> {
		let deadline = self.config.pvc_cleanup.pod_recreate_timeout;
		let interval = self.config.pvc_cleanup.pod_recreate_poll_interval;
		let client = self.client.clone();
		let namespace = pod.namespace.clone();
		let name = pod.name.clone();
		let claim_name = claim_name.to_string();
		let poll = async move {
			loop {
				client.delete_pod(&namespace, &name).await?;
				tokio::time::sleep(interval).await;
				if client.get_pvc(&namespace, &claim_name).await?.is_some() {
					return Ok(());
				}
			}
		};
		match tokio::time::timeout(deadline, poll).await {
			Ok(result) => result,
			Err(_) => Err(nla_error::Error::Timeout(deadline)),
		}
	}
}

async fn evict_one<C: ClusterClient + 'static>(
	client: Arc<C>,
	pod: PodView,
	grace_period_seconds: i64,
	poll_interval: Duration,
	abort: CancellationToken,
) -> Result<(), String> {
	let pod_ref = format!("{}/{}", pod.namespace, pod.name);

	loop {
		if abort.is_cancelled() {
			return Err(format!("{pod_ref}: aborted before eviction accepted"));
		}
		match client.evict_pod(&pod.namespace, &pod.name, grace_period_seconds, false).await {
			Ok(EvictOutcome::Accepted) | Ok(EvictOutcome::NotFound) => break,
			Ok(EvictOutcome::TooManyRequests) => {
				tokio::select! {
					_ = tokio::time::sleep(Duration::from_secs(5)) => continue,
					_ = abort.cancelled() => return Err(format!("{pod_ref}: aborted while budget-blocked")),
				}
			}
			Err(err) => return Err(format!("{pod_ref}: eviction call failed: {err}")),
		}
	}

	let original_uid = pod.uid.clone();
	loop {
		if abort.is_cancelled() {
			return Err(format!("{pod_ref}: aborted awaiting deletion"));
		}
		match client.get_pod(&pod.namespace, &pod.name).await {
			Ok(None) => return Ok(()),
			Ok(Some(current)) if current.uid != original_uid => return Ok(()),
			Ok(Some(_)) => {}
			Err(err) => return Err(format!("{pod_ref}: error polling for deletion: {err}")),
		}
		tokio::select! {
			_ = tokio::time::sleep(poll_interval) => {}
			_ = abort.cancelled() => return Err(format!("{pod_ref}: aborted awaiting deletion")),
		}
	}
}
