//! Retry Wall (spec §4.6): a per-node failure counter that injects delays
//! between drain attempts, backed by the `DrainFailure` status condition
//! (spec §3 "Retry Record").

use std::time::Duration;

use chrono::{DateTime, Utc};
use nla_error::{Error, Result};
use nla_k8s::ClusterClient;
use nla_k8s::node::NodeView;
use serde::{Deserialize, Serialize};

/// A far-past sentinel returned when a node has no recorded failures —
/// "eligible right now" without a special-cased `Option`.
pub fn far_past_sentinel() -> DateTime<Utc> {
	DateTime::<Utc>::MIN_UTC
}

/// Strategy selection + parameters, either the configured default or an
/// annotation override (spec §4.6 "Strategies").
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RetryStrategy {
	Static {
		delay_secs: u64,
		alert_threshold: u32,
	},
	Exponential {
		base_delay_secs: u64,
		alert_threshold: u32,
	},
}

impl RetryStrategy {
	pub fn alert_threshold(&self) -> u32 {
		match self {
			RetryStrategy::Static { alert_threshold, .. } => *alert_threshold,
			RetryStrategy::Exponential { alert_threshold, .. } => *alert_threshold,
		}
	}

	/// `delay(retries)` per spec §4.6: static returns a constant `D`;
	/// exponential returns `2^(retries-1) * D` for `retries >= 1`, `0`
	/// otherwise.
	pub fn delay(&self, retries: u32) -> Duration {
		match self {
			RetryStrategy::Static { delay_secs, .. } => Duration::from_secs(*delay_secs),
			RetryStrategy::Exponential { base_delay_secs, .. } => {
				if retries == 0 {
					Duration::from_secs(0)
				} else {
					let factor = 1u64.checked_shl(retries - 1).unwrap_or(u64::MAX);
					Duration::from_secs(base_delay_secs.saturating_mul(factor))
				}
			}
		}
	}

	/// Parses the annotation-override JSON payload (spec §6 "retry strategy
	/// override"). Invalid payloads are the caller's responsibility to
	/// detect and log — this returns `Err` so the caller can fall back to
	/// the configured default.
	pub fn parse_override(raw: &str) -> Result<Self> {
		serde_json::from_str(raw)
			.map_err(|err| Error::config(format!("invalid retry strategy override: {err}")))
	}
}

/// Resolves the effective strategy for a node: its annotation override if
/// present and valid, otherwise `default`. Invalid overrides log an error
/// (via `tracing`) and fall back to `default`, per spec §4.6.
pub fn resolve_strategy(node: &NodeView, default: RetryStrategy) -> RetryStrategy {
	match node.annotations.get(nla_k8s::annotations::RETRY_STRATEGY_OVERRIDE) {
		None => default,
		Some(raw) => match RetryStrategy::parse_override(raw) {
			Ok(strategy) => strategy,
			Err(err) => {
				tracing::error!(node = %node.name, %err, "invalid retry strategy override, using default");
				default
			}
		},
	}
}

pub struct RetryWall<C: ClusterClient> {
	client: std::sync::Arc<C>,
	default_strategy: RetryStrategy,
}

impl<C: ClusterClient> RetryWall<C> {
	pub fn new(client: std::sync::Arc<C>, default_strategy: RetryStrategy) -> Self {
		RetryWall {
			client,
			default_strategy,
		}
	}

	/// The next instant at which `node` is eligible for another drain
	/// attempt. Far-past sentinel when there is no recorded failure.
	pub fn next_retry_timestamp(&self, node: &NodeView) -> DateTime<Utc> {
		let Some(record) = node.drain_failure() else {
			return far_past_sentinel();
		};
		let strategy = resolve_strategy(node, self.default_strategy);
		if record.count >= strategy.alert_threshold() {
			tracing::warn!(
				node = %node.name,
				retries = record.count,
				threshold = strategy.alert_threshold(),
				"node has exceeded the retry alert threshold; still retrying"
			);
		}
		record.last_heartbeat
			+ chrono::Duration::from_std(strategy.delay(record.count)).unwrap_or_default()
	}

	pub fn retry_count(&self, node: &NodeView) -> u32 {
		node.drain_failure().map(|r| r.count).unwrap_or(0)
	}

	/// Increments the counter and stamps the heartbeat with `now` (spec
	/// §4.6 `SetNewRetryWallTimestamp`).
	pub async fn record_failure(&self, node: &NodeView, reason: &str, now: DateTime<Utc>) -> Result<()> {
		let count = self.retry_count(node) + 1;
		self.client.set_drain_failure(&node.name, count, reason, now).await
	}

	/// Removes the `DrainFailure` condition entirely (spec §4.6
	/// `ResetRetryCount`), returning the node to the far-past sentinel.
	pub async fn reset(&self, node: &NodeView) -> Result<()> {
		self.client.clear_drain_failure(&node.name).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use nla_k8s::test_support::FakeClient;
	use std::collections::BTreeMap;
	use std::sync::Arc;

	fn node_with_failure(count: u32, reason: &str, heartbeat: DateTime<Utc>) -> NodeView {
		NodeView {
			name: "n1".into(),
			labels: BTreeMap::new(),
			annotations: BTreeMap::new(),
			creation_timestamp: Utc::now(),
			deletion_timestamp: None,
			unschedulable: false,
			nla_taint: None,
			conditions: vec![nla_k8s::node::NodeCondition {
				condition_type: nla_k8s::node::DRAIN_FAILURE_CONDITION.to_string(),
				status: nla_k8s::node::ConditionStatus::True,
				last_transition_time: heartbeat,
				message: format!("{count}|{reason}"),
			}],
			allocatable_cpu_millis: 0,
		}
	}

	#[test]
	fn exponential_strategy_at_zero_retries_is_zero_delay() {
		let strategy = RetryStrategy::Exponential {
			base_delay_secs: 300,
			alert_threshold: 5,
		};
		assert_eq!(strategy.delay(0), Duration::from_secs(0));
	}

	#[test]
	fn exponential_strategy_doubles_per_retry() {
		let strategy = RetryStrategy::Exponential {
			base_delay_secs: 300,
			alert_threshold: 5,
		};
		assert_eq!(strategy.delay(1), Duration::from_secs(300));
		assert_eq!(strategy.delay(2), Duration::from_secs(600));
		assert_eq!(strategy.delay(3), Duration::from_secs(1200));
	}

	#[test]
	fn static_strategy_is_constant() {
		let strategy = RetryStrategy::Static {
			delay_secs: 60,
			alert_threshold: 3,
		};
		assert_eq!(strategy.delay(1), Duration::from_secs(60));
		assert_eq!(strategy.delay(9), Duration::from_secs(60));
	}

	#[test]
	fn node_with_no_failure_is_eligible_immediately() {
		let wall = RetryWall::new(
			Arc::new(FakeClient::new()),
			RetryStrategy::Exponential {
				base_delay_secs: 60,
				alert_threshold: 5,
			},
		);
		let node = NodeView {
			name: "n1".into(),
			labels: BTreeMap::new(),
			annotations: BTreeMap::new(),
			creation_timestamp: Utc::now(),
			deletion_timestamp: None,
			unschedulable: false,
			nla_taint: None,
			conditions: Vec::new(),
			allocatable_cpu_millis: 0,
		};
		assert_eq!(wall.next_retry_timestamp(&node), far_past_sentinel());
	}

	#[tokio::test]
	async fn record_failure_increments_through_the_client() {
		let client = Arc::new(FakeClient::new().with_node(node_with_failure(0, "", Utc::now())));
		let wall = RetryWall::new(
			client.clone(),
			RetryStrategy::Exponential {
				base_delay_secs: 60,
				alert_threshold: 5,
			},
		);
		let node = client.get_node("n1").await.unwrap().unwrap();
		wall.record_failure(&node, "timeout", Utc::now()).await.unwrap();
		let updated = client.get_node("n1").await.unwrap().unwrap();
		assert_eq!(wall.retry_count(&updated), 1);
	}

	#[test]
	fn monotone_non_decreasing_next_retry_as_count_grows() {
		let wall = RetryWall::new(
			Arc::new(FakeClient::new()),
			RetryStrategy::Exponential {
				base_delay_secs: 60,
				alert_threshold: 99,
			},
		);
		let now = Utc::now();
		let first = wall.next_retry_timestamp(&node_with_failure(1, "x", now));
		let second = wall.next_retry_timestamp(&node_with_failure(2, "x", now));
		assert!(second >= first);
	}

	#[test]
	fn invalid_override_annotation_falls_back_to_default() {
		let mut node = node_with_failure(0, "", Utc::now());
		node.annotations.insert(
			nla_k8s::annotations::RETRY_STRATEGY_OVERRIDE.to_string(),
			"not json".to_string(),
		);
		let default = RetryStrategy::Static {
			delay_secs: 10,
			alert_threshold: 2,
		};
		assert_eq!(resolve_strategy(&node, default), default);
	}
}
