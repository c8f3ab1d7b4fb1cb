//! Drain Runner (spec §4.4): advances `drain-candidate`/`force-draining`
//! nodes through the drain state machine and tracks post-drain replacement.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nla_config::{Config, ConditionConfig};
use nla_drain_buffer::DrainBuffer;
use nla_drainer::Drainer;
use nla_filters::offending_conditions;
use nla_k8s::annotations::LABEL_REPLACE_REQUEST;
use nla_k8s::annotations::ReplaceRequestState;
use nla_k8s::client::{EventType, ObjectRef};
use nla_k8s::node::NodeView;
use nla_k8s::taint::NlaTaintValue;
use nla_k8s::ClusterClient;
use nla_metrics::Metrics;
use nla_retry_wall::RetryWall;
use tokio_util::sync::CancellationToken;

type Governor = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub struct DrainRunner<C: ClusterClient + 'static> {
	client: Arc<C>,
	group_key: String,
	config: Config,
	metrics: Arc<Metrics>,
	retry_wall: Arc<RetryWall<C>>,
	drain_buffer: Arc<DrainBuffer<C>>,
	drainer: Arc<Drainer<C>>,
	condition_limiters: Mutex<HashMap<String, Arc<Governor>>>,
}

impl<C: ClusterClient + 'static> DrainRunner<C> {
	pub fn new(
		client: Arc<C>,
		group_key: String,
		config: Config,
		metrics: Arc<Metrics>,
		retry_wall: Arc<RetryWall<C>>,
		drain_buffer: Arc<DrainBuffer<C>>,
		drainer: Arc<Drainer<C>>,
	) -> Self {
		DrainRunner {
			client,
			group_key,
			config,
			metrics,
			retry_wall,
			drain_buffer,
			drainer,
			condition_limiters: Mutex::new(HashMap::new()),
		}
	}

	/// Runs one tick over every node currently in this group. Returns
	/// `Ok(false)` once the group has no nodes left.
	pub async fn tick(&self) -> nla_error::Result<bool> {
		let now = Utc::now();
		let all_nodes = self.client.list_nodes().await?;
		let group_nodes: Vec<NodeView> = all_nodes
			.iter()
			.filter(|n| n.group_key_label() == Some(self.group_key.as_str()))
			.cloned()
			.collect();

		if group_nodes.is_empty() {
			return Ok(false);
		}

		self.apply_replace_request_labels(&group_nodes, now).await?;

		for node in &group_nodes {
			let Some(taint) = node.nla_taint else { continue };
			let outcome = match taint.value {
				NlaTaintValue::DrainCandidate => self.process_candidate(node, &all_nodes, now).await,
				NlaTaintValue::ForceDraining => self.process_force_drain(node, now).await,
				_ => Ok(()),
			};
			if let Err(err) = outcome {
				tracing::warn!(node = %node.name, group = %self.group_key, %err, "drain runner failed to process node");
			}
		}

		Ok(true)
	}

	async fn process_candidate(
		&self,
		node: &NodeView,
		all_nodes: &[NodeView],
		now: DateTime<Utc>,
	) -> nla_error::Result<()> {
		let Some(taint) = &node.nla_taint else { return Ok(()) };

		let wait = chrono::Duration::from_std(self.config.timing.wait_before_draining).unwrap_or_default();
		if now < taint.time_added + wait {
			return Ok(());
		}

		let offending = offending_conditions(node, &self.config.node_conditions, now);
		if offending.is_empty() {
			tracing::info!(node = %node.name, group = %self.group_key, "node no longer offends; releasing candidacy");
			self.client.set_nla_taint(&node.name, None, now).await?;
			return Ok(());
		}
		let winning = highest_priority_condition(&offending);

		if !self.allow(winning) {
			return Ok(());
		}

		if !self
			.client
			.set_nla_taint(&node.name, Some(NlaTaintValue::Draining), now)
			.await?
		{
			return Ok(());
		}

		self.metrics.drain_attempts_total.with_label_values(&[&self.group_key]).inc();
		let started = now;
		let result = if winning.force_drain {
			self.drainer.force_drain(node).await
		} else {
			self.drainer.drain(node, all_nodes).await
		};
		self.finish_drain(node, winning.max_attempts, started, result).await
	}

	async fn process_force_drain(&self, node: &NodeView, now: DateTime<Utc>) -> nla_error::Result<()> {
		self.metrics.drain_attempts_total.with_label_values(&[&self.group_key]).inc();
		let result = self.drainer.force_drain(node).await;
		self.finish_drain(node, None, now, result).await
	}

	async fn finish_drain(
		&self,
		node: &NodeView,
		max_attempts_override: Option<u32>,
		started: DateTime<Utc>,
		result: Result<(), nla_drainer::DrainError>,
	) -> nla_error::Result<()> {
		let ended = Utc::now();
		self.metrics
			.drain_duration
			.with_label_values(&[&self.group_key])
			.observe((ended - started).num_milliseconds().max(0) as f64 / 1000.0);

		match result {
			Ok(()) => {
				self.client.set_nla_taint(&node.name, Some(NlaTaintValue::Drained), ended).await?;
				self.drain_buffer
					.note_successful_drain(&self.group_key, self.config.timing.drain_buffer, ended);
				self.client.record_drain_condition(&node.name, started, ended).await?;
				self.metrics.drain_success_total.with_label_values(&[&self.group_key]).inc();
				self.client
					.emit_event(
						&ObjectRef::node(&node.name),
						EventType::Normal,
						"DrainSucceeded",
						"node drained successfully",
					)
					.await?;
			}
			Err(err) => {
				let terminal_error = err.is_terminal();
				let reason = err.to_string();
				self.metrics
					.drain_failure_total
					.with_label_values(&[&self.group_key, &reason])
					.inc();
				let max_attempts = max_attempts_override.unwrap_or(self.config.limits.max_drain_attempts_before_fail);
				let attempts = self.retry_wall.retry_count(node) + 1;
				if attempts >= max_attempts || terminal_error {
					self.client.set_nla_taint(&node.name, Some(NlaTaintValue::Drained), ended).await?;
					let message = if terminal_error {
						format!("drain failed with a non-retryable error after {attempts} attempts: {reason}")
					} else {
						format!("drain failed terminally after {attempts} attempts: {reason}")
					};
					self.client
						.emit_event(
							&ObjectRef::node(&node.name),
							EventType::Warning,
							"DrainFailedTerminal",
							&message,
						)
						.await?;
				} else {
					self.retry_wall.record_failure(node, &reason, ended).await?;
					self.client.set_nla_taint(&node.name, None, ended).await?;
					self.client
						.emit_event(
							&ObjectRef::node(&node.name),
							EventType::Warning,
							"DrainFailed",
							&format!("drain attempt {attempts} failed: {reason}"),
						)
						.await?;
				}
			}
		}
		Ok(())
	}

	/// Applies the `replace-request` label once a `drained` node has sat
	/// that way longer than `durationWithCompletedStatusBeforeReplacement`.
	async fn apply_replace_request_labels(&self, nodes: &[NodeView], now: DateTime<Utc>) -> nla_error::Result<()> {
		let threshold = chrono::Duration::from_std(self.config.timing.duration_with_completed_status_before_replacement)
			.unwrap_or_default();
		for node in nodes {
			let Some(taint) = &node.nla_taint else { continue };
			if taint.value != NlaTaintValue::Drained {
				continue;
			}
			if node.replace_request().is_some() {
				continue;
			}
			if now - taint.time_added >= threshold {
				self.client
					.set_node_label(&node.name, LABEL_REPLACE_REQUEST, ReplaceRequestState::Requested.as_str())
					.await?;
			}
		}
		Ok(())
	}

	fn allow(&self, condition: &ConditionConfig) -> bool {
		let qps = condition.rate_limit_qps.unwrap_or(self.config.rate_limit.drain_qps).max(0.0001);
		let burst = self.config.rate_limit.drain_burst.max(1);
		let limiter = self.limiter_for(&condition.condition_type, qps, burst);
		limiter.check().is_ok()
	}

	fn limiter_for(&self, condition_type: &str, qps: f64, burst: u32) -> Arc<Governor> {
		let mut limiters = self.condition_limiters.lock().unwrap();
		limiters
			.entry(condition_type.to_string())
			.or_insert_with(|| {
				let period = Duration::from_secs_f64((1.0 / qps).max(0.001));
				let quota = Quota::with_period(period)
					.unwrap_or_else(|| Quota::per_second(NonZeroU32::new(1).unwrap()))
					.allow_burst(NonZeroU32::new(burst).unwrap_or(NonZeroU32::new(1).unwrap()));
				Arc::new(RateLimiter::direct(quota))
			})
			.clone()
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
							tracing::info!(group = %self.group_key, "drain runner stopping: group is empty");
							return;
						}
						Err(err) => {
							tracing::warn!(group = %self.group_key, %err, "drain runner tick failed");
						}
					}
				}
			}
		}
	}
}

/// The highest-priority offending condition wins; ties broken by the
/// lexicographically smaller condition name for a deterministic result.
fn highest_priority_condition<'a>(offending: &[&'a ConditionConfig]) -> &'a ConditionConfig {
	offending
		.iter()
		.copied()
		.max_by(|a, b| a.priority.cmp(&b.priority).then_with(|| b.condition_type.cmp(&a.condition_type)))
		.expect("offending is non-empty")
}

#[cfg(test)]
mod tests {
	use super::*;
	use nla_k8s::node::{ConditionStatus, NodeCondition};
	use nla_k8s::taint::NlaTaint;
	use nla_k8s::test_support::FakeClient;
	use nla_limiter::{CordonLimiter, GlobalBlocker};
	use nla_retry_wall::RetryStrategy;
	use std::collections::BTreeMap;

	fn candidate_node(name: &str, group: &str, time_added: DateTime<Utc>) -> NodeView {
		let mut labels = BTreeMap::new();
		labels.insert(nla_k8s::annotations::LABEL_GROUP_KEY.to_string(), group.to_string());
		NodeView {
			name: name.to_string(),
			labels,
			annotations: BTreeMap::new(),
			creation_timestamp: Utc::now() - chrono::Duration::hours(1),
			deletion_timestamp: None,
			unschedulable: false,
			nla_taint: Some(NlaTaint { value: NlaTaintValue::DrainCandidate, time_added }),
			conditions: vec![NodeCondition {
				condition_type: "DiskPressure".to_string(),
				status: ConditionStatus::True,
				last_transition_time: Utc::now() - chrono::Duration::hours(1),
				message: String::new(),
			}],
			allocatable_cpu_millis: 0,
		}
	}

	fn runner(client: Arc<FakeClient>, config: Config) -> DrainRunner<FakeClient> {
		let metrics = Arc::new(Metrics::new());
		let global_blocker = Arc::new(GlobalBlocker::new(client.clone(), config.global_blocker.clone()));
		let cordon_limiter = Arc::new(CordonLimiter::new(&config.cordon_limiter, global_blocker));
		let retry_wall = Arc::new(RetryWall::new(
			client.clone(),
			RetryStrategy::Exponential { base_delay_secs: 60, alert_threshold: 5 },
		));
		let drain_buffer = Arc::new(DrainBuffer::new(client.clone()));
		let drainer = Arc::new(Drainer::new(client.clone(), cordon_limiter, config.clone()));
		DrainRunner::new(client, "group-a".to_string(), config, metrics, retry_wall, drain_buffer, drainer)
	}

	fn condition_config() -> ConditionConfig {
		ConditionConfig {
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
	async fn waits_before_draining_a_fresh_candidate() {
		let client = Arc::new(FakeClient::new().with_node(candidate_node("n1", "group-a", Utc::now())));
		let mut config = Config::default();
		config.node_conditions = vec![condition_config()];
		let runner = runner(client.clone(), config);
		runner.tick().await.unwrap();
		let node = client.get_node("n1").await.unwrap().unwrap();
		assert_eq!(node.nla_taint.map(|t| t.value), Some(NlaTaintValue::DrainCandidate));
	}

	#[tokio::test]
	async fn drains_a_candidate_past_its_wait_period() {
		let old_enough = Utc::now() - chrono::Duration::minutes(5);
		let client = Arc::new(FakeClient::new().with_node(candidate_node("n1", "group-a", old_enough)));
		let mut config = Config::default();
		config.node_conditions = vec![condition_config()];
		config.timing.wait_before_draining = Duration::from_secs(1);
		let runner = runner(client.clone(), config);
		runner.tick().await.unwrap();
		let node = client.get_node("n1").await.unwrap().unwrap();
		assert_eq!(node.nla_taint.map(|t| t.value), Some(NlaTaintValue::Drained));
	}

	#[tokio::test]
	async fn releases_candidacy_once_no_longer_offending() {
		let old_enough = Utc::now() - chrono::Duration::minutes(5);
		let client = Arc::new(FakeClient::new().with_node(candidate_node("n1", "group-a", old_enough)));
		let mut config = Config::default();
		config.timing.wait_before_draining = Duration::from_secs(1);
		// No configured conditions at all -> nothing offends any more.
		let runner = runner(client.clone(), config);
		runner.tick().await.unwrap();
		let node = client.get_node("n1").await.unwrap().unwrap();
		assert_eq!(node.nla_taint, None);
	}

	#[tokio::test]
	async fn empty_group_signals_shutdown() {
		let client = Arc::new(FakeClient::new());
		let config = Config::default();
		let runner = runner(client, config);
		assert_eq!(runner.tick().await.unwrap(), false);
	}
}
