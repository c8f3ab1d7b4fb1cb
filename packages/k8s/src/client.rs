//! The cluster API client surface the core consumes (spec §6 "External
//! interfaces"). Defined as a trait so every crate above this one can be
//! exercised against `test_support::FakeClient` instead of a live API
//! server.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::budget::DisruptionBudgetView;
use crate::node::NodeView;
use crate::pod::PodView;
use crate::taint::NlaTaintValue;
use crate::volume::{PvView, PvcView};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
	Normal,
	Warning,
}

/// Outcome of a single eviction call (spec §4.5 step 3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvictOutcome {
	Accepted,
	/// The pod was already gone; treated as success.
	NotFound,
	/// The disruption budget is exhausted (`TooManyRequests`); caller sleeps
	/// and retries.
	TooManyRequests,
}

/// A reference to a cluster object, used when emitting events (spec §6:
/// "events emitted against node/pod/pvc/pv").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
	pub kind: &'static str,
	pub namespace: Option<String>,
	pub name: String,
}

impl ObjectRef {
	pub fn node(name: impl Into<String>) -> Self {
		ObjectRef {
			kind: "Node",
			namespace: None,
			name: name.into(),
		}
	}

	pub fn pod(namespace: impl Into<String>, name: impl Into<String>) -> Self {
		ObjectRef {
			kind: "Pod",
			namespace: Some(namespace.into()),
			name: name.into(),
		}
	}
}

/// Everything the drain coordination engine needs from the cluster API.
/// Patches are optimistic (get -> mutate -> patch); implementations map
/// server-side conflicts to `nla_error::Error::Transient` rather than
/// retrying internally — retry lives in the calling loop (spec §5).
#[async_trait]
pub trait ClusterClient: Send + Sync {
	async fn list_nodes(&self) -> nla_error::Result<Vec<NodeView>>;
	async fn get_node(&self, name: &str) -> nla_error::Result<Option<NodeView>>;

	/// Sets or clears the NLA taint. `None` removes it. Returns `Ok(false)`
	/// on an optimistic-concurrency conflict (caller should re-fetch and
	/// retry on the next tick rather than looping inline).
	async fn set_nla_taint(
		&self,
		node_name: &str,
		value: Option<NlaTaintValue>,
		now: DateTime<Utc>,
	) -> nla_error::Result<bool>;

	async fn set_node_label(&self, node_name: &str, key: &str, value: &str) -> nla_error::Result<()>;
	async fn remove_node_label(&self, node_name: &str, key: &str) -> nla_error::Result<()>;
	async fn set_unschedulable(&self, node_name: &str, value: bool) -> nla_error::Result<()>;

	async fn set_drain_failure(
		&self,
		node_name: &str,
		count: u32,
		reason: &str,
		now: DateTime<Utc>,
	) -> nla_error::Result<()>;
	async fn clear_drain_failure(&self, node_name: &str) -> nla_error::Result<()>;

	/// Records a stable drain-completed condition with start/end timestamps
	/// (spec §4.5 step 6).
	async fn record_drain_condition(
		&self,
		node_name: &str,
		started_at: DateTime<Utc>,
		ended_at: DateTime<Utc>,
	) -> nla_error::Result<()>;

	async fn list_pods_on_node(&self, node_name: &str) -> nla_error::Result<Vec<PodView>>;
	async fn get_pod(&self, namespace: &str, name: &str) -> nla_error::Result<Option<PodView>>;
	async fn delete_pod(&self, namespace: &str, name: &str) -> nla_error::Result<()>;

	/// Annotations of a pod's controlling object, used by the annotation
	/// lookup chain (node -> pod -> controller).
	async fn controller_annotations(
		&self,
		namespace: &str,
		controller_kind: &str,
		controller_name: &str,
	) -> nla_error::Result<Option<BTreeMap<String, String>>>;

	async fn disruption_budgets_for_pod(
		&self,
		pod: &PodView,
	) -> nla_error::Result<Vec<DisruptionBudgetView>>;

	/// Issues an eviction. `dry_run=true` asks the cluster API to run admission
	/// (disruption-budget) checks without actually deleting the pod — used by
	/// the drain simulator (spec §4.7).
	async fn evict_pod(
		&self,
		namespace: &str,
		name: &str,
		grace_period_seconds: i64,
		dry_run: bool,
	) -> nla_error::Result<EvictOutcome>;

	async fn get_pvc(&self, namespace: &str, name: &str) -> nla_error::Result<Option<PvcView>>;
	async fn delete_pvc(&self, namespace: &str, name: &str) -> nla_error::Result<()>;
	async fn get_pv(&self, name: &str) -> nla_error::Result<Option<PvView>>;
	async fn delete_pv(&self, name: &str) -> nla_error::Result<()>;

	async fn emit_event(
		&self,
		object: &ObjectRef,
		event_type: EventType,
		reason: &str,
		message: &str,
	) -> nla_error::Result<()>;

	/// Drain buffer persistence backing store (spec §4.8): a single key/value
	/// configuration object keyed by group key.
	async fn get_config_object(&self, key: &str) -> nla_error::Result<Option<String>>;
	async fn put_config_object(&self, key: &str, value: &str) -> nla_error::Result<()>;

	/// Cluster-wide counts consulted by the Global Blocker (spec §4.9).
	async fn not_ready_node_count(&self) -> nla_error::Result<(u32, u32)>;
	async fn pending_pod_count(&self) -> nla_error::Result<u32>;

	/// PV-Protector check (spec §4.2 step 6): `true` iff some unscheduled
	/// pod elsewhere in the cluster is bound, via its PVC, to a volume whose
	/// node affinity pins it to `node_name`. Draining such a node would
	/// orphan that pod's storage.
	async fn has_pending_pod_bound_to_node_volume(&self, node_name: &str) -> nla_error::Result<bool>;

	/// `true` once the watch caches backing this client have completed
	/// their initial list+watch sync (spec §4.1 "has not finished initial
	/// cache sync").
	fn has_synced(&self) -> bool;
}
