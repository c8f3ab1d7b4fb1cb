//! The Composite Filter (spec §4.3): nine named predicates applied in the
//! table's order, short-circuiting as soon as the kept set is empty.
//!
//! Per-group context (the label expression, the retry wall, the drain
//! buffer, the global blocker, the disruption budgets in play) is passed
//! through call parameters rather than stored on the filters themselves
//! (spec §9 "Cyclic graphs / back references"), so a single [`CompositeFilter`]
//! instance can be shared across every group's candidate runner.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use nla_config::{Config, ConditionConfig};
use nla_drain_buffer::DrainBuffer;
use nla_k8s::ClusterClient;
use nla_k8s::annotations::{OPT_IN, OPT_OUT};
use nla_k8s::budget::DisruptionBudgetView;
use nla_k8s::node::{ConditionStatus, NodeView};
use nla_k8s::pod::PodView;
use nla_limiter::GlobalBlocker;
use nla_metrics::Metrics;
use nla_retry_wall::RetryWall;

use crate::label_expr::LabelExpr;
use crate::pod_filter::all_pods_pass_cordon_filter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
	Kept,
	Rejected(String),
}

impl FilterDecision {
	pub fn is_kept(&self) -> bool {
		matches!(self, FilterDecision::Kept)
	}
}

/// Per-tick, per-group context threaded through every filter call. Borrowed,
/// never stored: a fresh one is built by the candidate runner each tick.
pub struct FilterContext<'a, C: ClusterClient> {
	pub now: DateTime<Utc>,
	pub group_key: &'a str,
	pub config: &'a Config,
	pub label_expr: &'a LabelExpr,
	pub retry_wall: &'a RetryWall<C>,
	pub drain_buffer: &'a DrainBuffer<C>,
	pub global_blocker: &'a GlobalBlocker<C>,
	/// Every disruption budget in the cluster; filters narrow it down to the
	/// ones selecting a given pod via [`DisruptionBudgetView::selects`],
	/// mirroring `ClusterClient::disruption_budgets_for_pod`'s own logic
	/// without requiring an async call inside a sync filter.
	pub all_budgets: &'a [DisruptionBudgetView],
}

fn budgets_for_pod<'a>(budgets: &'a [DisruptionBudgetView], pod: &PodView) -> Vec<&'a DisruptionBudgetView> {
	budgets
		.iter()
		.filter(|b| b.namespace == pod.namespace && b.selects(&pod.labels))
		.collect()
}

/// Conditions configured on this instance whose type+status+age currently
/// match (spec GLOSSARY "Offending condition").
pub fn offending_conditions<'a>(
	node: &NodeView,
	configured: &'a [ConditionConfig],
	now: DateTime<Utc>,
) -> Vec<&'a ConditionConfig> {
	configured
		.iter()
		.filter(|cfg| {
			node.conditions.iter().any(|c| {
				c.condition_type == cfg.condition_type
					&& c.status == ConditionStatus::True
					&& cfg
						.delay
						.map(|d| now - c.last_transition_time >= chrono::Duration::from_std(d).unwrap_or_default())
						.unwrap_or(true)
			})
		})
		.collect()
}

fn node_opted_in(node: &NodeView) -> bool {
	node.annotations.get(OPT_IN).map(|v| v == "true").unwrap_or(false)
}

fn node_opted_out(node: &NodeView) -> bool {
	node.annotations.get(OPT_OUT).map(|v| v == "true").unwrap_or(false)
}

/// A single named predicate from spec §4.3's table. Generic over the
/// cluster client so the stateful filters (`retry`, `drain_buffer`,
/// `global_blocker`) can hold a reference to their collaborator's concrete
/// type without boxing it behind a second layer of dynamic dispatch.
pub trait CandidateFilter<C: ClusterClient>: Send + Sync {
	fn name(&self) -> &'static str;
	fn evaluate(&self, ctx: &FilterContext<'_, C>, node: &NodeView, pods: &[PodView]) -> FilterDecision;
}

pub struct NodeTerminatingFilter;
impl<C: ClusterClient> CandidateFilter<C> for NodeTerminatingFilter {
	fn name(&self) -> &'static str {
		"node_terminating"
	}
	fn evaluate(&self, _ctx: &FilterContext<'_, C>, node: &NodeView, _pods: &[PodView]) -> FilterDecision {
		if node.is_terminating() {
			FilterDecision::Rejected("node is being deleted".to_string())
		} else {
			FilterDecision::Kept
		}
	}
}

pub struct NodeReplacementFailedFilter;
impl<C: ClusterClient> CandidateFilter<C> for NodeReplacementFailedFilter {
	fn name(&self) -> &'static str {
		"node_replacement_failed"
	}
	fn evaluate(&self, _ctx: &FilterContext<'_, C>, node: &NodeView, _pods: &[PodView]) -> FilterDecision {
		use nla_k8s::annotations::ReplaceRequestState;
		if node.replace_request() == Some(ReplaceRequestState::Failed) {
			FilterDecision::Rejected("node carries a prior replacement-failure marker".to_string())
		} else {
			FilterDecision::Kept
		}
	}
}

pub struct LabelsFilter;
impl<C: ClusterClient> CandidateFilter<C> for LabelsFilter {
	fn name(&self) -> &'static str {
		"labels"
	}
	fn evaluate(&self, ctx: &FilterContext<'_, C>, node: &NodeView, _pods: &[PodView]) -> FilterDecision {
		if ctx.label_expr.matches(&node.labels) {
			FilterDecision::Kept
		} else {
			FilterDecision::Rejected("node does not match the configured label expression".to_string())
		}
	}
}

pub struct ConditionsFilter;
impl<C: ClusterClient> CandidateFilter<C> for ConditionsFilter {
	fn name(&self) -> &'static str {
		"conditions"
	}
	fn evaluate(&self, ctx: &FilterContext<'_, C>, node: &NodeView, _pods: &[PodView]) -> FilterDecision {
		let offending = offending_conditions(node, &ctx.config.node_conditions, ctx.now);
		if offending.is_empty() {
			return FilterDecision::Rejected("no offending condition is currently true".to_string());
		}
		if node_opted_out(node) && !node_opted_in(node) {
			return FilterDecision::Rejected("node opted out of all offending conditions".to_string());
		}
		FilterDecision::Kept
	}
}

pub struct PodFilter;
impl<C: ClusterClient> CandidateFilter<C> for PodFilter {
	fn name(&self) -> &'static str {
		"pod_filter"
	}
	fn evaluate(&self, _ctx: &FilterContext<'_, C>, _node: &NodeView, pods: &[PodView]) -> FilterDecision {
		match all_pods_pass_cordon_filter(pods) {
			Ok(()) => FilterDecision::Kept,
			Err(rejection) => {
				FilterDecision::Rejected(format!("pod {} rejected: {}", rejection.pod, rejection.reason))
			}
		}
	}
}

pub struct RetryFilter;
impl<C: ClusterClient> CandidateFilter<C> for RetryFilter {
	fn name(&self) -> &'static str {
		"retry"
	}
	fn evaluate(&self, ctx: &FilterContext<'_, C>, node: &NodeView, _pods: &[PodView]) -> FilterDecision {
		if ctx.retry_wall.next_retry_timestamp(node) <= ctx.now {
			FilterDecision::Kept
		} else {
			FilterDecision::Rejected("node is still within its retry backoff window".to_string())
		}
	}
}

pub struct DrainBufferFilter;
impl<C: ClusterClient> CandidateFilter<C> for DrainBufferFilter {
	fn name(&self) -> &'static str {
		"drain_buffer"
	}
	fn evaluate(&self, ctx: &FilterContext<'_, C>, _node: &NodeView, _pods: &[PodView]) -> FilterDecision {
		if ctx.drain_buffer.next_drain(ctx.group_key) <= ctx.now {
			FilterDecision::Kept
		} else {
			FilterDecision::Rejected("group is still within its drain buffer window".to_string())
		}
	}
}

pub struct StabilityPeriodFilter;
impl<C: ClusterClient> CandidateFilter<C> for StabilityPeriodFilter {
	fn name(&self) -> &'static str {
		"stability_period"
	}
	fn evaluate(&self, ctx: &FilterContext<'_, C>, _node: &NodeView, pods: &[PodView]) -> FilterDecision {
		for pod in pods {
			for budget in budgets_for_pod(ctx.all_budgets, pod) {
				if !budget.disruption_allowed {
					return FilterDecision::Rejected(format!(
						"budget {} currently reports DisruptionAllowed=False",
						budget.name
					));
				}
				let stable_since = budget.stable_since();
				let drain_buffer = chrono::Duration::from_std(ctx.config.timing.drain_buffer).unwrap_or_default();
				if ctx.now < stable_since + drain_buffer {
					return FilterDecision::Rejected(format!(
						"budget {} transitioned too recently to be considered stable",
						budget.name
					));
				}
			}
		}
		FilterDecision::Kept
	}
}

pub struct GlobalBlockerFilter;
impl<C: ClusterClient> CandidateFilter<C> for GlobalBlockerFilter {
	fn name(&self) -> &'static str {
		"global_blocker"
	}
	fn evaluate(&self, ctx: &FilterContext<'_, C>, _node: &NodeView, _pods: &[PodView]) -> FilterDecision {
		let (blocked, reason) = ctx.global_blocker.state();
		if blocked {
			FilterDecision::Rejected(format!(
				"global blocker active: {}",
				reason.unwrap_or_else(|| "unknown".to_string())
			))
		} else {
			FilterDecision::Kept
		}
	}
}

/// Exponential-moving-average kept-ratio per `(group, filter)`, used to
/// pre-size each filter's output `Vec` instead of growing it node-by-node
/// (spec §4.3 "a capacity-efficiency estimator ... used to pre-size the
/// output slice").
#[derive(Default)]
pub struct CapacityEstimator {
	ratios: RwLock<HashMap<(String, &'static str), f64>>,
}

const EMA_ALPHA: f64 = 0.3;

impl CapacityEstimator {
	pub fn new() -> Self {
		CapacityEstimator::default()
	}

	fn predict(&self, group: &str, filter: &'static str, input_len: usize) -> usize {
		let ratio = self
			.ratios
			.read()
			.unwrap()
			.get(&(group.to_string(), filter))
			.copied()
			.unwrap_or(1.0);
		((input_len as f64) * ratio).ceil() as usize
	}

	fn observe(&self, group: &str, filter: &'static str, input_len: usize, kept_len: usize) {
		let sample = if input_len == 0 { 1.0 } else { kept_len as f64 / input_len as f64 };
		let mut ratios = self.ratios.write().unwrap();
		let entry = ratios.entry((group.to_string(), filter)).or_insert(1.0);
		*entry = *entry * (1.0 - EMA_ALPHA) + sample * EMA_ALPHA;
	}
}

/// The full composite chain, applied in spec §4.3's table order.
pub struct CompositeFilter<C: ClusterClient> {
	filters: Vec<Box<dyn CandidateFilter<C>>>,
	estimator: CapacityEstimator,
}

impl<C: ClusterClient> CompositeFilter<C> {
	/// Builds the standard nine-filter chain in the spec's documented order.
	pub fn standard() -> Self {
		CompositeFilter {
			filters: vec![
				Box::new(NodeTerminatingFilter),
				Box::new(NodeReplacementFailedFilter),
				Box::new(LabelsFilter),
				Box::new(ConditionsFilter),
				Box::new(PodFilter),
				Box::new(RetryFilter),
				Box::new(DrainBufferFilter),
				Box::new(StabilityPeriodFilter),
				Box::new(GlobalBlockerFilter),
			],
			estimator: CapacityEstimator::new(),
		}
	}

	/// `Filter(nodes) -> kept` (spec §4.3): applies every filter in order,
	/// short-circuiting as soon as the kept set is empty.
	pub fn filter(
		&self,
		ctx: &FilterContext<'_, C>,
		nodes: Vec<(NodeView, Vec<PodView>)>,
		metrics: &Metrics,
	) -> Vec<NodeView> {
		let mut remaining = nodes;
		for filter in &self.filters {
			if remaining.is_empty() {
				break;
			}
			let input_len = remaining.len();
			let predicted = self.estimator.predict(ctx.group_key, filter.name(), input_len);
			let mut kept = Vec::with_capacity(predicted.min(input_len));
			let mut filtered_out = 0u64;

			for (node, pods) in remaining {
				match filter.evaluate(ctx, &node, &pods) {
					FilterDecision::Kept => kept.push((node, pods)),
					FilterDecision::Rejected(_) => filtered_out += 1,
				}
			}

			metrics
				.filter_input_total
				.with_label_values(&[ctx.group_key, filter.name()])
				.inc_by(input_len as u64);
			metrics
				.filter_filtered_total
				.with_label_values(&[ctx.group_key, filter.name()])
				.inc_by(filtered_out);
			self.estimator.observe(ctx.group_key, filter.name(), input_len, kept.len());

			remaining = kept;
		}
		remaining.into_iter().map(|(node, _)| node).collect()
	}

	/// `FilterNode(node) -> (kept, name, group, reason)` (spec §4.3), used
	/// for auditing a single node outside the bulk `filter` path.
	pub fn filter_node(
		&self,
		ctx: &FilterContext<'_, C>,
		node: &NodeView,
		pods: &[PodView],
	) -> (bool, Option<&'static str>, String, Option<String>) {
		for filter in &self.filters {
			if let FilterDecision::Rejected(reason) = filter.evaluate(ctx, node, pods) {
				return (false, Some(filter.name()), ctx.group_key.to_string(), Some(reason));
			}
		}
		(true, None, ctx.group_key.to_string(), None)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use nla_config::LimitsConfig;
	use nla_k8s::test_support::FakeClient;
	use std::collections::BTreeMap;
	use std::sync::Arc;

	fn node(name: &str) -> NodeView {
		NodeView {
			name: name.to_string(),
			labels: BTreeMap::new(),
			annotations: BTreeMap::new(),
			creation_timestamp: Utc::now(),
			deletion_timestamp: None,
			unschedulable: false,
			nla_taint: None,
			conditions: Vec::new(),
			allocatable_cpu_millis: 0,
		}
	}

	fn context<'a, C: ClusterClient>(
		config: &'a Config,
		label_expr: &'a LabelExpr,
		retry_wall: &'a RetryWall<C>,
		drain_buffer: &'a DrainBuffer<C>,
		global_blocker: &'a GlobalBlocker<C>,
		budgets: &'a [DisruptionBudgetView],
	) -> FilterContext<'a, C> {
		FilterContext {
			now: Utc::now(),
			group_key: "group-a",
			config,
			label_expr,
			retry_wall,
			drain_buffer,
			global_blocker,
			all_budgets: budgets,
		}
	}

	#[tokio::test]
	async fn composite_short_circuits_once_empty() {
		let client = Arc::new(FakeClient::new());
		let config = Config {
			limits: LimitsConfig::default(),
			..Config::default()
		};
		let label_expr = LabelExpr::parse("app=a");
		let retry_wall = RetryWall::new(client.clone(), nla_retry_wall::RetryStrategy::Static {
			delay_secs: 0,
			alert_threshold: 99,
		});
		let drain_buffer = DrainBuffer::new(client.clone());
		let global_blocker = GlobalBlocker::new(client.clone(), config.global_blocker.clone());

		let ctx = context(&config, &label_expr, &retry_wall, &drain_buffer, &global_blocker, &[]);
		let chain = CompositeFilter::standard();
		let metrics = Metrics::new();

		// Node doesn't match the label expr: rejected at the `labels` stage,
		// well before `pod_filter`/`retry`/etc ever run.
		let nodes = vec![(node("n1"), vec![])];
		let kept = chain.filter(&ctx, nodes, &metrics);
		assert!(kept.is_empty());
	}

	#[tokio::test]
	async fn matching_node_with_no_offending_condition_is_rejected_by_conditions_filter() {
		let client = Arc::new(FakeClient::new());
		let mut config = Config::default();
		config.node_conditions.push(ConditionConfig {
			condition_type: "disk-issue".to_string(),
			priority: 0,
			delay: None,
			expected_resolution_time: None,
			rate_limit_qps: None,
			force_drain: false,
			max_attempts: None,
		});
		let label_expr = LabelExpr::parse("");
		let retry_wall = RetryWall::new(client.clone(), nla_retry_wall::RetryStrategy::Static {
			delay_secs: 0,
			alert_threshold: 99,
		});
		let drain_buffer = DrainBuffer::new(client.clone());
		let global_blocker = GlobalBlocker::new(client.clone(), config.global_blocker.clone());

		let ctx = context(&config, &label_expr, &retry_wall, &drain_buffer, &global_blocker, &[]);
		let chain = CompositeFilter::standard();
		let (kept, name, _group, _reason) = chain.filter_node(&ctx, &node("n1"), &[]);
		assert!(!kept);
		assert_eq!(name, Some("conditions"));
	}
}
