//! Global Blocker & Cordon Limiter (spec §4.9): cluster-wide admission
//! control sitting in front of candidate promotion and cordon actions.
//!
//! Kept as two cooperating pieces the way the spec draws them: the
//! [`GlobalBlocker`] polls cluster-wide predicates on its own cadence and
//! caches a boolean; the [`CordonLimiter`] evaluates per-node predicates
//! against the *current* cordoned population and, per spec, has the
//! blocker's state injected as one more named predicate.

use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use nla_config::{CordonLimiterConfig, GlobalBlockerConfig, LimitValue};
use nla_error::Result;
use nla_k8s::ClusterClient;
use nla_k8s::annotations::SKIP_CORDON_LIMITER;
use nla_k8s::node::NodeView;
use nla_k8s::taint::NLA_TAINT_KEY;

/// Cached boolean result of the last poll, plus the name of the first
/// blocker that tripped (spec: "the aggregate OR is the block state with
/// the first-true blocker's name as reason").
#[derive(Debug, Clone, Default)]
struct BlockerCache {
	blocked: bool,
	reason: Option<String>,
}

pub struct GlobalBlocker<C: ClusterClient> {
	client: Arc<C>,
	config: GlobalBlockerConfig,
	cache: RwLock<BlockerCache>,
}

impl<C: ClusterClient> GlobalBlocker<C> {
	pub fn new(client: Arc<C>, config: GlobalBlockerConfig) -> Self {
		GlobalBlocker {
			client,
			config,
			cache: RwLock::new(BlockerCache::default()),
		}
	}

	/// `true` iff any standard blocker is currently tripped, with the name
	/// of the first one (spec §4.2 step 3's "global_blocker" filter reads
	/// this; it never polls the cluster API itself).
	pub fn state(&self) -> (bool, Option<String>) {
		let cache = self.cache.read().unwrap();
		(cache.blocked, cache.reason.clone())
	}

	fn set(&self, blocked: bool, reason: Option<String>) {
		let mut cache = self.cache.write().unwrap();
		cache.blocked = blocked;
		cache.reason = reason;
	}

	/// Evaluates every standard blocker once and updates the cache.
	/// Standard blockers (spec §4.9): *max-not-ready-nodes* (absolute or
	/// percent of cluster) and *max-pending-pods* (idem for pods).
	pub async fn poll_once(&self) -> Result<()> {
		let (not_ready, total) = self.client.not_ready_node_count().await?;
		let not_ready_limit = self.config.max_not_ready_nodes.resolve(total);
		if not_ready > not_ready_limit {
			tracing::warn!(
				not_ready,
				limit = not_ready_limit,
				"max-not-ready-nodes blocker tripped"
			);
			self.set(true, Some("max-not-ready-nodes".to_string()));
			return Ok(());
		}

		let pending = self.client.pending_pod_count().await?;
		// Percentage ceilings on pending pods are relative to cluster node
		// count, the only population the cluster API surfaces here.
		let pending_limit = self.config.max_pending_pods.resolve(total.max(1));
		if pending > pending_limit {
			tracing::warn!(
				pending,
				limit = pending_limit,
				"max-pending-pods blocker tripped"
			);
			self.set(true, Some("max-pending-pods".to_string()));
			return Ok(());
		}

		self.set(false, None);
		Ok(())
	}

	/// Runs `poll_once` on `poll_period` until `shutdown` fires.
	pub async fn run_poll_loop(&self, shutdown: tokio_util::sync::CancellationToken) {
		let mut ticker = tokio::time::interval(self.config.poll_period);
		loop {
			tokio::select! {
				_ = shutdown.cancelled() => return,
				_ = ticker.tick() => {
					if let Err(err) = self.poll_once().await {
						tracing::error!(%err, "global blocker poll failed");
					}
				}
			}
		}
	}
}

/// A single named cordon-admission predicate (spec §4.9 "Cordon Limiter").
/// Deliberately not generic over `ClusterClient` — predicates only ever
/// need the node views already fetched by the caller.
pub trait CordonPredicate: Send + Sync {
	fn name(&self) -> &'static str;
	fn allows(&self, candidate: &NodeView, all_nodes: &[NodeView], cordoned: &[NodeView]) -> bool;
}

struct GlobalCeiling {
	limit: LimitValue,
}

impl CordonPredicate for GlobalCeiling {
	fn name(&self) -> &'static str {
		"max-simultaneous-cordon"
	}

	fn allows(&self, _candidate: &NodeView, all_nodes: &[NodeView], cordoned: &[NodeView]) -> bool {
		(cordoned.len() as u32) < self.limit.resolve(all_nodes.len() as u32).max(1)
	}
}

struct LabelCombinationCeiling {
	label_keys: Vec<String>,
	limit: LimitValue,
	name: String,
}

impl LabelCombinationCeiling {
	fn combination<'a>(&self, node: &'a NodeView) -> Vec<&'a str> {
		self.label_keys
			.iter()
			.map(|k| node.labels.get(k).map(|v| v.as_str()).unwrap_or(""))
			.collect()
	}
}

impl CordonPredicate for LabelCombinationCeiling {
	fn name(&self) -> &'static str {
		// Leaked once per limiter instance (one per configured combination,
		// bounded by config size) so the trait can return `&'static str`.
		Box::leak(self.name.clone().into_boxed_str())
	}

	fn allows(&self, candidate: &NodeView, all_nodes: &[NodeView], cordoned: &[NodeView]) -> bool {
		let target = self.combination(candidate);
		let population = all_nodes
			.iter()
			.filter(|n| self.combination(n) == target)
			.count();
		let in_flight = cordoned
			.iter()
			.filter(|n| self.combination(n) == target)
			.count();
		(in_flight as u32) < self.limit.resolve(population as u32).max(1)
	}
}

struct TaintKeyCeiling {
	limit: LimitValue,
}

impl CordonPredicate for TaintKeyCeiling {
	fn name(&self) -> &'static str {
		"max-simultaneous-cordon-for-taints"
	}

	fn allows(&self, _candidate: &NodeView, all_nodes: &[NodeView], cordoned: &[NodeView]) -> bool {
		let in_flight = cordoned
			.iter()
			.filter(|n| n.nla_taint.is_some())
			.count();
		(in_flight as u32) < self.limit.resolve(all_nodes.len() as u32).max(1)
	}
}

/// Aggregates the configured cordon predicates plus the injected Global
/// Blocker state. A node carrying [`SKIP_CORDON_LIMITER`] bypasses every
/// predicate (spec §4.9).
pub struct CordonLimiter<C: ClusterClient> {
	predicates: Vec<Box<dyn CordonPredicate>>,
	global_blocker: Arc<GlobalBlocker<C>>,
}

impl<C: ClusterClient> CordonLimiter<C> {
	pub fn new(config: &CordonLimiterConfig, global_blocker: Arc<GlobalBlocker<C>>) -> Self {
		let mut predicates: Vec<Box<dyn CordonPredicate>> =
			vec![Box::new(GlobalCeiling { limit: config.max_simultaneous_cordon })];

		for (label_key, limit) in &config.max_simultaneous_cordon_for_labels {
			predicates.push(Box::new(LabelCombinationCeiling {
				label_keys: vec![label_key.clone()],
				limit: *limit,
				name: format!("max-simultaneous-cordon-for-labels[{label_key}]"),
			}));
		}
		for limit in config.max_simultaneous_cordon_for_taints.values() {
			predicates.push(Box::new(TaintKeyCeiling { limit: *limit }));
		}

		CordonLimiter { predicates, global_blocker }
	}

	/// `Ok(())` if cordoning `candidate` is currently permitted; otherwise
	/// the name of the first denying predicate (spec §4.5 step 1:
	/// "Consult the Cordon Limiter; reject if it denies").
	pub fn evaluate(&self, candidate: &NodeView, all_nodes: &[NodeView]) -> std::result::Result<(), String> {
		if candidate.annotations.contains_key(SKIP_CORDON_LIMITER) {
			return Ok(());
		}

		let (blocked, reason) = self.global_blocker.state();
		if blocked {
			return Err(reason.unwrap_or_else(|| "global-blocker".to_string()));
		}

		// Excludes `candidate` itself: it may already carry the `drain-candidate`
		// taint from the runner that promoted it, but it is not yet cordoned in
		// the sense this ceiling cares about — that's exactly the decision being
		// made here.
		let cordoned: Vec<NodeView> = all_nodes
			.iter()
			.filter(|n| n.name != candidate.name && (n.unschedulable || n.nla_taint.is_some()))
			.cloned()
			.collect();

		for predicate in &self.predicates {
			if !predicate.allows(candidate, all_nodes, &cordoned) {
				return Err(predicate.name().to_string());
			}
		}
		Ok(())
	}
}

/// A node carries the reserved [`NLA_TAINT_KEY`] taint; exposed for callers
/// that want to reason about "is this node already cordoned by us" without
/// importing `nla_k8s::taint` directly.
pub fn is_nla_tainted(node: &NodeView) -> bool {
	node.nla_taint.is_some()
}

#[cfg(test)]
mod tests {
	use super::*;
	use nla_k8s::test_support::FakeClient;
	use std::collections::BTreeMap;

	fn node(name: &str, labels: &[(&str, &str)]) -> NodeView {
		NodeView {
			name: name.to_string(),
			labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
			annotations: BTreeMap::new(),
			creation_timestamp: chrono::Utc::now(),
			deletion_timestamp: None,
			unschedulable: false,
			nla_taint: None,
			conditions: Vec::new(),
			allocatable_cpu_millis: 0,
		}
	}

	#[tokio::test]
	async fn global_blocker_trips_on_not_ready_ceiling() {
		let client = Arc::new(FakeClient::new());
		client.state.lock().unwrap().not_ready_nodes = 10;
		client.state.lock().unwrap().total_nodes = 20;
		let blocker = GlobalBlocker::new(
			client,
			GlobalBlockerConfig {
				max_not_ready_nodes: LimitValue::Percent(10.0),
				max_pending_pods: LimitValue::Absolute(1000),
				poll_period: Duration::from_secs(60),
			},
		);
		blocker.poll_once().await.unwrap();
		let (blocked, reason) = blocker.state();
		assert!(blocked);
		assert_eq!(reason.as_deref(), Some("max-not-ready-nodes"));
	}

	#[tokio::test]
	async fn global_blocker_clears_once_below_ceiling() {
		let client = Arc::new(FakeClient::new());
		client.state.lock().unwrap().total_nodes = 20;
		let blocker = GlobalBlocker::new(
			client,
			GlobalBlockerConfig {
				max_not_ready_nodes: LimitValue::Percent(50.0),
				max_pending_pods: LimitValue::Absolute(1000),
				poll_period: Duration::from_secs(60),
			},
		);
		blocker.poll_once().await.unwrap();
		assert!(!blocker.state().0);
	}

	#[test]
	fn skip_cordon_limiter_annotation_bypasses_every_predicate() {
		let client: Arc<FakeClient> = Arc::new(FakeClient::new());
		let blocker = Arc::new(GlobalBlocker::new(client, GlobalBlockerConfig::default()));
		let limiter: CordonLimiter<FakeClient> = CordonLimiter::new(
			&CordonLimiterConfig {
				max_simultaneous_cordon: LimitValue::Absolute(0),
				..Default::default()
			},
			blocker,
		);
		let mut candidate = node("n1", &[]);
		candidate
			.annotations
			.insert(SKIP_CORDON_LIMITER.to_string(), "true".to_string());
		assert!(limiter.evaluate(&candidate, &[candidate.clone()]).is_ok());
	}

	#[test]
	fn global_ceiling_denies_once_at_capacity() {
		let client: Arc<FakeClient> = Arc::new(FakeClient::new());
		let blocker = Arc::new(GlobalBlocker::new(client, GlobalBlockerConfig::default()));
		let limiter: CordonLimiter<FakeClient> = CordonLimiter::new(
			&CordonLimiterConfig {
				max_simultaneous_cordon: LimitValue::Absolute(1),
				..Default::default()
			},
			blocker,
		);
		let mut cordoned = node("n1", &[]);
		cordoned.unschedulable = true;
		let candidate = node("n2", &[]);
		let all = vec![cordoned, candidate.clone()];
		assert!(limiter.evaluate(&candidate, &all).is_err());
	}

	#[test]
	fn label_combination_ceiling_scopes_to_matching_nodes() {
		let client: Arc<FakeClient> = Arc::new(FakeClient::new());
		let blocker = Arc::new(GlobalBlocker::new(client, GlobalBlockerConfig::default()));
		let for_labels = std::collections::HashMap::from([("app".to_string(), LimitValue::Absolute(1))]);
		let limiter: CordonLimiter<FakeClient> = CordonLimiter::new(
			&CordonLimiterConfig {
				max_simultaneous_cordon: LimitValue::Absolute(99),
				max_simultaneous_cordon_for_labels: for_labels,
				..Default::default()
			},
			blocker,
		);

		let mut cordoned_a = node("a1", &[("app", "a")]);
		cordoned_a.unschedulable = true;
		let candidate_a = node("a2", &[("app", "a")]);
		let candidate_b = node("b1", &[("app", "b")]);

		let all = vec![cordoned_a, candidate_a.clone(), candidate_b.clone()];
		assert!(limiter.evaluate(&candidate_a, &all).is_err());
		assert!(limiter.evaluate(&candidate_b, &all).is_ok());
	}
}
