//! Drain Simulator (spec §4.7): predicts whether a live drain would succeed
//! without mutating cluster state (other than an explicit dry-run eviction
//! call), caching per-pod outcomes for 3 minutes.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use nla_error::Result;
use nla_k8s::ClusterClient;
use nla_k8s::annotations::EVICTION_API_URL;
use nla_k8s::pod::PodView;

const CACHE_TTL: Duration = Duration::from_secs(3 * 60);
const CLEANUP_PERIOD: Duration = Duration::from_secs(10);
const SIMULATION_GRACE_SECONDS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimOutcome {
	Pass,
	Fail(String),
}

impl SimOutcome {
	pub fn is_pass(&self) -> bool {
		matches!(self, SimOutcome::Pass)
	}
}

pub struct DrainSimulator<C: ClusterClient> {
	client: Arc<C>,
	cache: Cache<String, SimOutcome>,
}

impl<C: ClusterClient> DrainSimulator<C> {
	pub fn new(client: Arc<C>) -> Self {
		DrainSimulator {
			client,
			cache: Cache::builder().time_to_live(CACHE_TTL).build(),
		}
	}

	/// Simulates draining `node`: the node passes iff every pod in `pods`
	/// (already filtered by the drainer's skip predicate) passes.
	/// Rejection reasons from every failing pod are joined.
	pub async fn simulate_node(&self, pods: &[PodView]) -> Result<SimOutcome> {
		let mut reasons = Vec::new();
		for pod in pods {
			match self.simulate_pod(pod).await? {
				SimOutcome::Pass => {}
				SimOutcome::Fail(reason) => reasons.push(format!("{}/{}: {reason}", pod.namespace, pod.name)),
			}
		}
		if reasons.is_empty() {
			Ok(SimOutcome::Pass)
		} else {
			Ok(SimOutcome::Fail(reasons.join("; ")))
		}
	}

	async fn simulate_pod(&self, pod: &PodView) -> Result<SimOutcome> {
		let cache_key = pod.uid.clone().unwrap_or_else(|| format!("{}/{}", pod.namespace, pod.name));

		if let Some(cached) = self.cache.get(&cache_key).await {
			return Ok(cached);
		}

		let outcome = self.simulate_pod_uncached(pod).await?;
		self.cache.insert(cache_key, outcome.clone()).await;
		Ok(outcome)
	}

	async fn simulate_pod_uncached(&self, pod: &PodView) -> Result<SimOutcome> {
		// A custom eviction URL means the actual drain is delegated to an
		// external system; we cannot simulate it, so assume success (spec
		// §4.7 step 1, §8 invariant 8).
		if pod.annotations.contains_key(EVICTION_API_URL) {
			return Ok(SimOutcome::Pass);
		}
		if let Some(controller) = &pod.controller {
			if let Some(annotations) = self
				.client
				.controller_annotations(&pod.namespace, &controller.kind, &controller.name)
				.await?
			{
				if annotations.contains_key(EVICTION_API_URL) {
					return Ok(SimOutcome::Pass);
				}
			}
		}

		let budgets = self.client.disruption_budgets_for_pod(pod).await?;
		if budgets.len() > 1 {
			return Ok(SimOutcome::Fail("multiple-PDBs".to_string()));
		}
		if let Some(budget) = budgets.first() {
			if !budget.disruption_allowed {
				return Ok(SimOutcome::Fail("disruption-not-allowed".to_string()));
			}
			if budget.desired_healthy > 0 && budget.current_healthy <= budget.desired_healthy {
				return Ok(SimOutcome::Fail("min-available-would-be-violated".to_string()));
			}
		}

		match self
			.client
			.evict_pod(&pod.namespace, &pod.name, SIMULATION_GRACE_SECONDS, true)
			.await?
		{
			nla_k8s::EvictOutcome::Accepted | nla_k8s::EvictOutcome::NotFound => Ok(SimOutcome::Pass),
			nla_k8s::EvictOutcome::TooManyRequests => {
				Ok(SimOutcome::Fail("eviction-budget-exhausted".to_string()))
			}
		}
	}

	/// Background sweep: drops cache entries older than the TTL. `moka`
	/// expires lazily on access, but other code paths (diagnostics,
	/// `cached_outcome`) iterate the cache directly, so a cleanup loop is
	/// needed to actually evict rather than merely mask stale entries
	/// (spec §9 "Cache cleanup").
	pub async fn run_cleanup_loop(&self, shutdown: tokio_util::sync::CancellationToken) {
		let mut ticker = tokio::time::interval(CLEANUP_PERIOD);
		loop {
			tokio::select! {
				_ = shutdown.cancelled() => return,
				_ = ticker.tick() => {
					self.cache.run_pending_tasks().await;
				}
			}
		}
	}

	pub fn cached_entry_count(&self) -> u64 {
		self.cache.entry_count()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use nla_k8s::budget::DisruptionBudgetView;
	use nla_k8s::test_support::FakeClient;
	use std::collections::BTreeMap;

	fn pod(name: &str, uid: &str) -> PodView {
		PodView {
			name: name.to_string(),
			namespace: "default".to_string(),
			node_name: Some("n1".to_string()),
			labels: BTreeMap::from([("app".to_string(), "a".to_string())]),
			annotations: BTreeMap::new(),
			controller: None,
			volume_claims: Vec::new(),
			phase: nla_k8s::pod::PodPhase::Running,
			deletion_timestamp: None,
			uid: Some(uid.to_string()),
			termination_grace_period_seconds: Some(30),
		}
	}

	fn budget(allowed: bool) -> DisruptionBudgetView {
		DisruptionBudgetView {
			name: "b".into(),
			namespace: "default".into(),
			selector: BTreeMap::from([("app".to_string(), "a".to_string())]),
			disruption_allowed: allowed,
			disruption_allowed_transition: chrono::Utc::now(),
			creation_timestamp: chrono::Utc::now(),
			current_healthy: 3,
			desired_healthy: 1,
		}
	}

	#[tokio::test]
	async fn pod_with_no_budget_passes() {
		let p = pod("p1", "u1");
		let client = Arc::new(FakeClient::new().with_pod(p.clone()));
		let sim = DrainSimulator::new(client);
		assert_eq!(sim.simulate_pod(&p).await.unwrap(), SimOutcome::Pass);
	}

	#[tokio::test]
	async fn disruption_not_allowed_fails_the_pod() {
		let p = pod("p1", "u1");
		let client = Arc::new(
			FakeClient::new()
				.with_pod(p.clone())
				.with_budget(budget(false)),
		);
		let sim = DrainSimulator::new(client);
		assert!(!sim.simulate_pod(&p).await.unwrap().is_pass());
	}

	#[tokio::test]
	async fn custom_eviction_url_always_passes() {
		let mut p = pod("p1", "u1");
		p.annotations.insert(EVICTION_API_URL.to_string(), "https://x".to_string());
		let client = Arc::new(FakeClient::new().with_pod(p.clone()));
		let sim = DrainSimulator::new(client);
		assert_eq!(sim.simulate_pod(&p).await.unwrap(), SimOutcome::Pass);
	}

	#[tokio::test]
	async fn node_simulation_fails_if_any_pod_fails() {
		let p1 = pod("p1", "u1");
		let p2 = pod("p2", "u2");
		let client = Arc::new(
			FakeClient::new()
				.with_pod(p1.clone())
				.with_pod(p2.clone())
				.with_budget(budget(false)),
		);
		let sim = DrainSimulator::new(client);
		let outcome = sim.simulate_node(&[p1, p2]).await.unwrap();
		assert!(!outcome.is_pass());
	}

	#[tokio::test]
	async fn result_is_cached_by_pod_uid() {
		let p = pod("p1", "u1");
		let client = Arc::new(FakeClient::new().with_pod(p.clone()));
		let sim = DrainSimulator::new(client);
		sim.simulate_pod(&p).await.unwrap();
		assert_eq!(sim.cached_entry_count(), 0); // moka inserts lazily; force sync.
		sim.cache.run_pending_tasks().await;
		assert_eq!(sim.cached_entry_count(), 1);
	}
}
