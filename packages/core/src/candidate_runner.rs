//! Candidate Runner (spec §4.2): per-group tick that promotes untainted
//! nodes to `drain-candidate` up to the configured simultaneous-candidate
//! ceiling.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nla_config::Config;
use nla_drain_buffer::DrainBuffer;
use nla_filters::{CompositeFilter, FilterContext, LabelExpr};
use nla_k8s::ClusterClient;
use nla_k8s::budget::DisruptionBudgetView;
use nla_k8s::node::NodeView;
use nla_k8s::pod::PodView;
use nla_k8s::taint::NlaTaintValue;
use nla_limiter::GlobalBlocker;
use nla_metrics::Metrics;
use nla_retry_wall::RetryWall;
use nla_simulator::{DrainSimulator, SimOutcome};
use tokio_util::sync::CancellationToken;

use crate::node_iterator::NodeIterator;

/// Per-group diagnostics mirrored from spec §3 "Candidate Data", readable
/// without awaiting the next tick.
#[derive(Debug, Clone, Default)]
pub struct CandidateSnapshot {
	pub node_count: u32,
	pub tainted_count: u32,
	pub slots_remaining: u32,
	pub filtered_out: u32,
	pub last_run_at: Option<DateTime<Utc>>,
	pub last_run_duration: Option<Duration>,
}

pub struct CandidateRunner<C: ClusterClient + 'static> {
	client: Arc<C>,
	group_key: String,
	config: Config,
	metrics: Arc<Metrics>,
	label_expr: LabelExpr,
	filter_chain: Arc<CompositeFilter<C>>,
	retry_wall: Arc<RetryWall<C>>,
	drain_buffer: Arc<DrainBuffer<C>>,
	global_blocker: Arc<GlobalBlocker<C>>,
	simulator: Arc<DrainSimulator<C>>,
	snapshot: RwLock<CandidateSnapshot>,
}

impl<C: ClusterClient + 'static> CandidateRunner<C> {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		client: Arc<C>,
		group_key: String,
		config: Config,
		metrics: Arc<Metrics>,
		label_expr: LabelExpr,
		filter_chain: Arc<CompositeFilter<C>>,
		retry_wall: Arc<RetryWall<C>>,
		drain_buffer: Arc<DrainBuffer<C>>,
		global_blocker: Arc<GlobalBlocker<C>>,
		simulator: Arc<DrainSimulator<C>>,
	) -> Self {
		CandidateRunner {
			client,
			group_key,
			config,
			metrics,
			label_expr,
			filter_chain,
			retry_wall,
			drain_buffer,
			global_blocker,
			simulator,
			snapshot: RwLock::new(CandidateSnapshot::default()),
		}
	}

	pub fn snapshot(&self) -> CandidateSnapshot {
		self.snapshot.read().unwrap().clone()
	}

	/// Runs one tick. Returns `Ok(false)` once the group has no nodes left,
	/// the signal the Group Registry uses to let this runner's task exit.
	pub async fn tick(&self) -> nla_error::Result<bool> {
		let started = Instant::now();
		let now = Utc::now();

		let group_nodes: Vec<NodeView> = self
			.client
			.list_nodes()
			.await?
			.into_iter()
			.filter(|n| n.group_key_label() == Some(self.group_key.as_str()))
			.collect();

		if group_nodes.is_empty() {
			return Ok(false);
		}

		let (tainted, untainted): (Vec<NodeView>, Vec<NodeView>) =
			group_nodes.into_iter().partition(|n| n.nla_taint.is_some());

		self.metrics
			.candidate_group_node_count
			.with_label_values(&[&self.group_key])
			.set((tainted.len() + untainted.len()) as i64);

		let slots = self
			.config
			.limits
			.max_simultaneous_candidates
			.saturating_sub(tainted.len() as u32);

		if slots == 0 {
			self.record_snapshot(0, 0, 0, now, started.elapsed());
			return Ok(true);
		}

		let mut nodes_with_pods = Vec::with_capacity(untainted.len());
		let mut budgets_by_key: HashMap<(String, String), DisruptionBudgetView> = HashMap::new();
		for node in untainted {
			let pods = self.client.list_pods_on_node(&node.name).await?;
			for pod in &pods {
				for budget in self.client.disruption_budgets_for_pod(pod).await? {
					budgets_by_key
						.entry((budget.namespace.clone(), budget.name.clone()))
						.or_insert(budget);
				}
			}
			nodes_with_pods.push((node, pods));
		}
		let all_budgets: Vec<DisruptionBudgetView> = budgets_by_key.into_values().collect();
		let input_len = nodes_with_pods.len();

		let ctx = FilterContext {
			now,
			group_key: &self.group_key,
			config: &self.config,
			label_expr: &self.label_expr,
			retry_wall: &self.retry_wall,
			drain_buffer: &self.drain_buffer,
			global_blocker: &self.global_blocker,
			all_budgets: &all_budgets,
		};
		let kept = self.filter_chain.filter(&ctx, nodes_with_pods, &self.metrics);
		let filtered_out = input_len.saturating_sub(kept.len());

		let mut kept_with_pods = Vec::with_capacity(kept.len());
		for node in kept {
			let pods = self.client.list_pods_on_node(&node.name).await?;
			kept_with_pods.push((node, pods));
		}

		NodeIterator::standard(self.config.node_conditions.clone(), now).sort(&mut kept_with_pods);

		let mut remaining_slots = slots;
		for (node, pods) in kept_with_pods {
			if remaining_slots == 0 {
				break;
			}

			match self.simulator.simulate_node(&pods).await {
				Ok(SimOutcome::Pass) => {}
				Ok(SimOutcome::Fail(reason)) => {
					tracing::debug!(node = %node.name, group = %self.group_key, %reason, "drain simulation failed, skipping candidate");
					continue;
				}
				Err(err) => {
					tracing::warn!(node = %node.name, group = %self.group_key, %err, "drain simulation errored, skipping candidate");
					continue;
				}
			}

			match self.client.has_pending_pod_bound_to_node_volume(&node.name).await {
				Ok(true) => {
					tracing::debug!(node = %node.name, group = %self.group_key, "pv-protector rejected candidate");
					continue;
				}
				Ok(false) => {}
				Err(err) => {
					tracing::warn!(node = %node.name, group = %self.group_key, %err, "pv-protector check errored, skipping candidate");
					continue;
				}
			}

			if self.config.dry_run {
				tracing::info!(node = %node.name, group = %self.group_key, "dry-run: would mark as drain-candidate");
				remaining_slots -= 1;
				continue;
			}

			match self
				.client
				.set_nla_taint(&node.name, Some(NlaTaintValue::DrainCandidate), now)
				.await
			{
				Ok(true) => {
					tracing::info!(node = %node.name, group = %self.group_key, "marked node as drain-candidate");
					remaining_slots -= 1;
				}
				Ok(false) => {
					tracing::debug!(node = %node.name, group = %self.group_key, "taint update conflict, retrying next tick");
				}
				Err(err) => {
					tracing::warn!(node = %node.name, group = %self.group_key, %err, "failed to set drain-candidate taint");
				}
			}
		}

		self.record_snapshot(slots, remaining_slots, filtered_out as u32, now, started.elapsed());
		Ok(true)
	}

	fn record_snapshot(
		&self,
		slots: u32,
		remaining_slots: u32,
		filtered_out: u32,
		now: DateTime<Utc>,
		elapsed: Duration,
	) {
		self.metrics
			.candidate_slots_remaining
			.with_label_values(&[&self.group_key])
			.set(remaining_slots as i64);
		self.metrics
			.candidate_filtered_out
			.with_label_values(&[&self.group_key])
			.set(filtered_out as i64);
		self.metrics
			.candidate_run_duration
			.with_label_values(&[&self.group_key])
			.observe(elapsed.as_secs_f64());

		let mut snapshot = self.snapshot.write().unwrap();
		snapshot.slots_remaining = if slots == 0 { 0 } else { remaining_slots };
		snapshot.filtered_out = filtered_out;
		snapshot.last_run_at = Some(now);
		snapshot.last_run_duration = Some(elapsed);
	}

	/// Ticks on `group-runner-period` until the group empties or `shutdown`
	/// fires.
	pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
		let mut ticker = tokio::time::interval(self.config.timing.group_runner_period);
		loop {
			tokio::select! {
				_ = shutdown.cancelled() => return,
				_ = ticker.tick() => {
					match self.tick().await {
						Ok(true) => {}
						Ok(false) => {
							tracing::info!(group = %self.group_key, "candidate runner stopping: group is empty");
							return;
						}
						Err(err) => {
							tracing::warn!(group = %self.group_key, %err, "candidate runner tick failed");
						}
					}
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use nla_config::LimitsConfig;
	use nla_k8s::annotations::LABEL_GROUP_KEY;
	use nla_k8s::test_support::FakeClient;
	use nla_retry_wall::RetryStrategy;
	use std::collections::BTreeMap;

	fn node(name: &str, group: &str) -> NodeView {
		let mut labels = BTreeMap::new();
		labels.insert(LABEL_GROUP_KEY.to_string(), group.to_string());
		NodeView {
			name: name.to_string(),
			labels,
			annotations: BTreeMap::new(),
			creation_timestamp: Utc::now(),
			deletion_timestamp: None,
			unschedulable: false,
			nla_taint: None,
			conditions: Vec::new(),
			allocatable_cpu_millis: 0,
		}
	}

	fn runner(client: Arc<FakeClient>, config: Config) -> CandidateRunner<FakeClient> {
		let metrics = Arc::new(Metrics::new());
		let global_blocker = Arc::new(GlobalBlocker::new(client.clone(), config.global_blocker.clone()));
		let retry_wall = Arc::new(RetryWall::new(
			client.clone(),
			RetryStrategy::Exponential { base_delay_secs: 60, alert_threshold: 5 },
		));
		let drain_buffer = Arc::new(DrainBuffer::new(client.clone()));
		let simulator = Arc::new(DrainSimulator::new(client.clone()));
		CandidateRunner::new(
			client,
			"group-a".to_string(),
			config,
			metrics,
			LabelExpr::parse(""),
			Arc::new(CompositeFilter::standard()),
			retry_wall,
			drain_buffer,
			global_blocker,
			simulator,
		)
	}

	#[tokio::test]
	async fn empty_group_signals_shutdown() {
		let client = Arc::new(FakeClient::new());
		let mut config = Config::default();
		config.limits = LimitsConfig { max_simultaneous_candidates: 1, max_drain_attempts_before_fail: 8 };
		let runner = runner(client, config);
		assert_eq!(runner.tick().await.unwrap(), false);
	}

	fn offending_node(name: &str, group: &str) -> NodeView {
		let mut n = node(name, group);
		n.conditions.push(nla_k8s::node::NodeCondition {
			condition_type: "DiskPressure".to_string(),
			status: nla_k8s::node::ConditionStatus::True,
			last_transition_time: Utc::now() - chrono::Duration::hours(1),
			message: String::new(),
		});
		n
	}

	fn condition_config() -> nla_config::ConditionConfig {
		nla_config::ConditionConfig {
			condition_type: "DiskPressure".to_string(),
			priority: 0,
			delay: None,
			expected_resolution_time: None,
			rate_limit_qps: None,
			force_drain: false,
			max_attempts: None,
		}
	}

	#[tokio::test]
	async fn promotes_an_eligible_node_to_drain_candidate() {
		let client = Arc::new(FakeClient::new().with_node(offending_node("n1", "group-a")));
		let mut config = Config::default();
		config.limits = LimitsConfig { max_simultaneous_candidates: 1, max_drain_attempts_before_fail: 8 };
		config.node_conditions = vec![condition_config()];
		let runner = runner(client.clone(), config);
		assert_eq!(runner.tick().await.unwrap(), true);
		let updated = client.get_node("n1").await.unwrap().unwrap();
		assert_eq!(updated.nla_taint.map(|t| t.value), Some(NlaTaintValue::DrainCandidate));
		assert_eq!(runner.snapshot().slots_remaining, 0);
	}

	#[tokio::test]
	async fn dry_run_does_not_mutate_the_taint() {
		let client = Arc::new(FakeClient::new().with_node(offending_node("n1", "group-a")));
		let mut config = Config::default();
		config.dry_run = true;
		config.limits = LimitsConfig { max_simultaneous_candidates: 1, max_drain_attempts_before_fail: 8 };
		config.node_conditions = vec![condition_config()];
		let runner = runner(client.clone(), config);
		assert_eq!(runner.tick().await.unwrap(), true);
		let updated = client.get_node("n1").await.unwrap().unwrap();
		assert_eq!(updated.nla_taint, None);
	}

	#[tokio::test]
	async fn already_full_ceiling_leaves_untainted_nodes_alone() {
		let mut tainted = node("n1", "group-a");
		tainted.nla_taint = Some(nla_k8s::taint::NlaTaint {
			value: NlaTaintValue::DrainCandidate,
			time_added: Utc::now(),
		});
		let client = Arc::new(
			FakeClient::new()
				.with_node(tainted)
				.with_node(node("n2", "group-a")),
		);
		let mut config = Config::default();
		config.limits = LimitsConfig { max_simultaneous_candidates: 1, max_drain_attempts_before_fail: 8 };
		let runner = runner(client.clone(), config);
		assert_eq!(runner.tick().await.unwrap(), true);
		let n2 = client.get_node("n2").await.unwrap().unwrap();
		assert_eq!(n2.nla_taint, None);
	}
}
