//! Scope Observer (spec §4.10): keeps the `draino-configuration` and
//! `overdue` node labels synchronized with this configuration's view of
//! scope membership, via a rate-limited work queue, and publishes the two
//! dynamic gauge families dimensioned by scope/drain-status tags.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nla_config::Config;
use nla_filters::LabelExpr;
use nla_filters::offending_conditions;
use nla_filters::pod_filter::all_pods_pass_cordon_filter;
use nla_k8s::ClusterClient;
use nla_k8s::annotations::{
	self, DELETE_PVC_STORAGE_CLASS, EVICTION_API_URL, LABEL_CONFIGURATION, LABEL_OVERDUE, OPT_IN, OPT_OUT,
	OUT_OF_SCOPE_SENTINEL, PRE_ACTIVITY_STATE, PreActivityState,
};
use nla_k8s::node::{ConditionStatus, NodeView};
use nla_k8s::pod::PodView;
use nla_metrics::Metrics;
use tokio_util::sync::CancellationToken;

/// Conventional team-ownership label. Not one of spec §6's reserved keys --
/// teams are free to apply it for cost attribution -- but spec §4.10 step 4
/// still wants it as a gauge dimension when present.
const TEAM_LABEL: &str = "team";

type Governor = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Spec §6 lookup order (node, then pod) for the gauge dimensions that only
/// need a yes/no signal; we don't have the controlling object's annotations
/// at hand here, so the chain stops at the pod.
fn annotation_present(node: &NodeView, pods: &[PodView], key: &str) -> bool {
	if annotations::lookup(key, &node.annotations, None, None).is_some() {
		return true;
	}
	pods.iter().any(|pod| pod.annotations.contains_key(key))
}

fn node_opted_in(node: &NodeView) -> bool {
	node.annotations.get(OPT_IN).map(|v| v == "true").unwrap_or(false)
}

fn node_opted_out(node: &NodeView) -> bool {
	node.annotations.get(OPT_OUT).map(|v| v == "true").unwrap_or(false)
}

const MAX_RETRIES: u32 = 10;
const MIN_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 20_000;

#[derive(Debug, Clone)]
struct QueueEntry {
	retries: u32,
	not_before: DateTime<Utc>,
	desired_config_label: String,
	overdue: bool,
}

pub struct ScopeObserver<C: ClusterClient> {
	client: Arc<C>,
	config: Config,
	label_expr: LabelExpr,
	metrics: Arc<Metrics>,
	queue: Mutex<HashMap<String, QueueEntry>>,
	limiter: Governor,
}

impl<C: ClusterClient> ScopeObserver<C> {
	pub fn new(client: Arc<C>, config: Config, metrics: Arc<Metrics>) -> Self {
		let label_expr = LabelExpr::parse(&config.node_label_expr);
		// Client-side token bucket protecting the cluster API from relabel
		// bursts: burst 50, refill 10/s (spec §5 "50/10").
		let limiter = RateLimiter::direct(
			Quota::per_second(NonZeroU32::new(10).unwrap()).allow_burst(NonZeroU32::new(50).unwrap()),
		);
		ScopeObserver { client, config, label_expr, metrics, queue: Mutex::new(HashMap::new()), limiter }
	}

	/// A node is in scope for this configuration iff it matches the label
	/// expression and every pod on it passes the cordon admission chain
	/// (spec §4.10 step 1's "scope membership").
	fn desired_configuration_label(current: &str, config_name: &str, in_scope: bool) -> String {
		let mut names: Vec<String> = if current.is_empty() || current == OUT_OF_SCOPE_SENTINEL {
			Vec::new()
		} else {
			current.split('.').map(|s| s.to_string()).collect()
		};
		names.retain(|n| n != config_name);
		if in_scope {
			names.push(config_name.to_string());
		}
		names.sort();
		names.dedup();
		if names.is_empty() { OUT_OF_SCOPE_SENTINEL.to_string() } else { names.join(".") }
	}

	fn highest_offending_condition_name(&self, node: &NodeView, now: DateTime<Utc>) -> String {
		offending_conditions(node, &self.config.node_conditions, now)
			.into_iter()
			.max_by_key(|c| c.priority)
			.map(|c| c.condition_type.clone())
			.unwrap_or_default()
	}

	fn is_overdue(&self, node: &NodeView, now: DateTime<Utc>) -> bool {
		self.config.node_conditions.iter().any(|cond| {
			node.condition(&cond.condition_type).is_some_and(|c| {
				c.status == ConditionStatus::True
					&& cond.expected_resolution_time.is_some_and(|threshold| {
						(now - c.last_transition_time) > chrono::Duration::from_std(threshold).unwrap_or_default()
					})
			})
		})
	}

	fn stage(&self, name: &str, desired_config_label: String, overdue: bool, now: DateTime<Utc>) {
		let mut queue = self.queue.lock().unwrap();
		match queue.get_mut(name) {
			Some(entry) => {
				entry.desired_config_label = desired_config_label;
				entry.overdue = overdue;
			}
			None => {
				queue.insert(
					name.to_string(),
					QueueEntry { retries: 0, not_before: now, desired_config_label, overdue },
				);
			}
		}
	}

	/// One pass over every node: compute desired label state, enqueue nodes
	/// whose labels need a patch, and publish the dynamic gauges (spec §4.10
	/// steps 1, 2 and 4). Runs on `scope-analysis-period` via
	/// [`Self::run_tick_loop`].
	pub async fn tick(&self, now: DateTime<Utc>) -> nla_error::Result<()> {
		let nodes = self.client.list_nodes().await?;

		let mut node_series: HashMap<Vec<String>, f64> = HashMap::new();
		let mut cpu_series: HashMap<Vec<String>, f64> = HashMap::new();

		for node in &nodes {
			let pods = self.client.list_pods_on_node(&node.name).await?;
			let in_scope = self.label_expr.matches(&node.labels) && all_pods_pass_cordon_filter(&pods).is_ok();
			let overdue = self.is_overdue(node, now);

			let current_config_label = node.labels.get(LABEL_CONFIGURATION).map(|s| s.as_str()).unwrap_or("");
			let desired_config_label =
				Self::desired_configuration_label(current_config_label, &self.config.config_name, in_scope);
			let current_overdue = node.labels.get(LABEL_OVERDUE).map(|s| s.as_str()) == Some("true");

			if desired_config_label != current_config_label || overdue != current_overdue {
				self.stage(&node.name, desired_config_label, overdue, now);
			}

			let drain_status = node.nla_taint.as_ref().map(|t| t.value.as_str()).unwrap_or("none");
			let group = node.group_key_label().unwrap_or("").to_string();
			let team = node.labels.get(TEAM_LABEL).cloned().unwrap_or_default();
			let condition = self.highest_offending_condition_name(node, now);
			let pvc_management = annotation_present(node, &pods, DELETE_PVC_STORAGE_CLASS).to_string();
			let preprovisioning = node
				.annotations
				.get(PRE_ACTIVITY_STATE)
				.and_then(|s| PreActivityState::parse(s))
				.is_some_and(|s| matches!(s, PreActivityState::Waiting | PreActivityState::Processing))
				.to_string();
			let custom_eviction_url = annotation_present(node, &pods, EVICTION_API_URL).to_string();
			let opt_in_out = if node_opted_in(node) {
				"in"
			} else if node_opted_out(node) {
				"out"
			} else {
				"unset"
			}
			.to_string();

			let tags = vec![
				self.config.config_name.clone(),
				group,
				team,
				drain_status.to_string(),
				condition,
				in_scope.to_string(),
				overdue.to_string(),
				pvc_management,
				preprovisioning,
				custom_eviction_url,
				opt_in_out,
			];
			*node_series.entry(tags.clone()).or_insert(0.0) += 1.0;
			*cpu_series.entry(tags).or_insert(0.0) += node.allocatable_cpu_millis as f64 / 1000.0;
		}

		let label_names = [
			"config",
			"group",
			"team",
			"drain_status",
			"condition",
			"in_scope",
			"overdue",
			"pvc_management",
			"preprovisioning",
			"custom_eviction_url",
			"opt_in_out",
		];
		self.metrics.node_options_nodes_total.publish(&label_names, &node_series.into_iter().collect::<Vec<_>>());
		self.metrics.node_options_cpu_total.publish(&label_names, &cpu_series.into_iter().collect::<Vec<_>>());

		let depth = self.queue.lock().unwrap().len() as i64;
		self.metrics.scope_queue_depth.with_label_values(&[&self.config.config_name]).set(depth);

		Ok(())
	}

	fn next_ready(&self, now: DateTime<Utc>) -> Option<(String, QueueEntry)> {
		let queue = self.queue.lock().unwrap();
		queue.iter().find(|(_, entry)| entry.not_before <= now).map(|(name, entry)| (name.clone(), entry.clone()))
	}

	async fn apply(&self, name: &str, entry: &QueueEntry) -> nla_error::Result<()> {
		self.client.set_node_label(name, LABEL_CONFIGURATION, &entry.desired_config_label).await?;
		if entry.overdue {
			self.client.set_node_label(name, LABEL_OVERDUE, "true").await?;
		} else {
			self.client.remove_node_label(name, LABEL_OVERDUE).await?;
		}
		Ok(())
	}

	/// Drains one ready queue item, applying the label patch under the
	/// client-side rate limiter. On failure the item is rescheduled with
	/// exponential backoff (500ms -> 20s); past [`MAX_RETRIES`] it is
	/// dropped with an error metric (spec §4.10 step 3).
	async fn drain_one(&self, now: DateTime<Utc>) -> bool {
		let Some((name, entry)) = self.next_ready(now) else {
			return false;
		};

		self.limiter.until_ready().await;

		match self.apply(&name, &entry).await {
			Ok(()) => {
				self.queue.lock().unwrap().remove(&name);
			}
			Err(err) => {
				let retries = entry.retries + 1;
				if retries > MAX_RETRIES {
					tracing::error!(node = %name, %err, "dropping scope label patch after exceeding retry budget");
					self.metrics
						.scope_label_errors_total
						.with_label_values(&[&self.config.config_name])
						.inc();
					self.queue.lock().unwrap().remove(&name);
				} else {
					let backoff_ms = (MIN_BACKOFF_MS * 2u64.pow(retries.min(10))).min(MAX_BACKOFF_MS);
					let mut queue = self.queue.lock().unwrap();
					if let Some(slot) = queue.get_mut(&name) {
						slot.retries = retries;
						slot.not_before = Utc::now() + chrono::Duration::milliseconds(backoff_ms as i64);
					}
				}
			}
		}
		true
	}

	/// Runs `tick` on `scope-analysis-period` until `shutdown` fires — the
	/// "metrics ticker" half of the spec's concurrency split.
	pub async fn run_tick_loop(&self, shutdown: CancellationToken) {
		let mut ticker = tokio::time::interval(self.config.timing.scope_analysis_period);
		loop {
			tokio::select! {
				_ = shutdown.cancelled() => return,
				_ = ticker.tick() => {
					if let Err(err) = self.tick(Utc::now()).await {
						tracing::error!(%err, "scope observer tick failed");
					}
				}
			}
		}
	}

	/// The single queue-draining worker: repeatedly pulls ready items until
	/// the queue is empty, then idles briefly before checking again.
	pub async fn run_queue_worker(&self, shutdown: CancellationToken) {
		loop {
			if shutdown.is_cancelled() {
				return;
			}
			let drained_any = self.drain_one(Utc::now()).await;
			if !drained_any {
				tokio::select! {
					_ = shutdown.cancelled() => return,
					_ = tokio::time::sleep(Duration::from_millis(200)) => {}
				}
			}
		}
	}

	/// Walks every node and removes this configuration's name from the
	/// `draino-configuration` label — used when the controller's configured
	/// name changes (spec §4.10 "A `Reset()` operation").
	pub async fn reset(&self) -> nla_error::Result<()> {
		let nodes = self.client.list_nodes().await?;
		for node in nodes {
			let Some(current) = node.labels.get(LABEL_CONFIGURATION) else {
				continue;
			};
			let desired = Self::desired_configuration_label(current, &self.config.config_name, false);
			if &desired != current {
				self.client.set_node_label(&node.name, LABEL_CONFIGURATION, &desired).await?;
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use nla_k8s::node::NodeCondition;
	use nla_k8s::test_support::FakeClient;
	use std::collections::BTreeMap;

	fn node(name: &str, labels: &[(&str, &str)]) -> NodeView {
		NodeView {
			name: name.to_string(),
			labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
			annotations: BTreeMap::new(),
			creation_timestamp: Utc::now(),
			deletion_timestamp: None,
			unschedulable: false,
			nla_taint: None,
			conditions: Vec::new(),
			allocatable_cpu_millis: 1000,
		}
	}

	fn observer(client: Arc<FakeClient>, config_name: &str) -> ScopeObserver<FakeClient> {
		let mut cfg = Config::default();
		cfg.config_name = config_name.to_string();
		ScopeObserver::new(client, cfg, Arc::new(Metrics::new()))
	}

	#[test]
	fn desired_configuration_label_adds_and_removes_own_name() {
		assert_eq!(
			ScopeObserver::<FakeClient>::desired_configuration_label("", "prod", true),
			"prod"
		);
		assert_eq!(
			ScopeObserver::<FakeClient>::desired_configuration_label("prod.staging", "prod", false),
			"staging"
		);
		assert_eq!(
			ScopeObserver::<FakeClient>::desired_configuration_label("staging", "prod", false),
			"staging"
		);
	}

	#[test]
	fn desired_configuration_label_falls_back_to_sentinel_when_empty() {
		assert_eq!(
			ScopeObserver::<FakeClient>::desired_configuration_label("prod", "prod", false),
			OUT_OF_SCOPE_SENTINEL
		);
	}

	#[tokio::test]
	async fn tick_stages_a_node_whose_label_is_stale() {
		let client = Arc::new(FakeClient::new().with_node(node("n1", &[])));
		let obs = observer(client.clone(), "prod");

		obs.tick(Utc::now()).await.unwrap();
		assert_eq!(obs.queue.lock().unwrap().len(), 1);

		obs.drain_one(Utc::now()).await;
		let n = client.get_node("n1").await.unwrap().unwrap();
		assert_eq!(n.labels.get(LABEL_CONFIGURATION).map(|s| s.as_str()), Some("prod"));
		assert!(obs.queue.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn out_of_scope_node_is_labeled_with_the_sentinel() {
		let mut cfg = Config::default();
		cfg.config_name = "prod".to_string();
		cfg.node_label_expr = "tier=gpu".to_string();

		let client = Arc::new(FakeClient::new().with_node(node("n1", &[])));
		let obs = ScopeObserver::new(client.clone(), cfg, Arc::new(Metrics::new()));

		obs.tick(Utc::now()).await.unwrap();
		obs.drain_one(Utc::now()).await;

		let n = client.get_node("n1").await.unwrap().unwrap();
		assert_eq!(n.labels.get(LABEL_CONFIGURATION).map(|s| s.as_str()), Some(OUT_OF_SCOPE_SENTINEL));
	}

	#[tokio::test]
	async fn overdue_condition_past_resolution_time_sets_the_label() {
		let mut cfg = Config::default();
		cfg.config_name = "prod".to_string();
		cfg.node_conditions = vec![nla_config::ConditionConfig {
			condition_type: "DiskPressure".to_string(),
			priority: 0,
			delay: None,
			expected_resolution_time: Some(Duration::from_secs(60)),
			rate_limit_qps: None,
			force_drain: false,
			max_attempts: None,
		}];

		let now = Utc::now();
		let mut n = node("n1", &[]);
		n.conditions.push(NodeCondition {
			condition_type: "DiskPressure".to_string(),
			status: ConditionStatus::True,
			last_transition_time: now - chrono::Duration::seconds(120),
			message: String::new(),
		});

		let client = Arc::new(FakeClient::new().with_node(n));
		let obs = ScopeObserver::new(client.clone(), cfg, Arc::new(Metrics::new()));

		obs.tick(now).await.unwrap();
		obs.drain_one(now).await;

		let updated = client.get_node("n1").await.unwrap().unwrap();
		assert_eq!(updated.labels.get(LABEL_OVERDUE).map(|s| s.as_str()), Some("true"));
	}

	#[tokio::test]
	async fn reset_strips_only_this_configurations_name() {
		let client = Arc::new(FakeClient::new().with_node(node("n1", &[(LABEL_CONFIGURATION, "prod.staging")])));
		let obs = observer(client.clone(), "prod");

		obs.reset().await.unwrap();

		let n = client.get_node("n1").await.unwrap().unwrap();
		assert_eq!(n.labels.get(LABEL_CONFIGURATION).map(|s| s.as_str()), Some("staging"));
	}
}
