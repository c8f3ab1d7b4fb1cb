//! In-memory fake implementing [`ClusterClient`], used by every crate's
//! `#[tokio::test]` suite instead of a live API server (SPEC_FULL.md §1.4).

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::budget::DisruptionBudgetView;
use crate::client::{ClusterClient, EventType, EvictOutcome, ObjectRef};
use crate::node::{ConditionStatus, DRAIN_FAILURE_CONDITION, NodeCondition, NodeView};
use crate::pod::PodView;
use crate::taint::{NlaTaint, NlaTaintValue};
use crate::volume::{PvView, PvcView};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
	pub object: String,
	pub event_type: EventType,
	pub reason: String,
	pub message: String,
}

/// Pure in-memory state plus the fake client wrapping it behind a mutex.
/// Everything is a plain `HashMap`/`Vec`; there is no notion of resource
/// version or conflicts, since no test in this crate graph exercises that
/// path (it is covered narratively in `kube_client.rs`'s doc comments).
#[derive(Default)]
pub struct FakeState {
	pub nodes: BTreeMap<String, NodeView>,
	pub pods: BTreeMap<(String, String), PodView>,
	pub budgets: Vec<DisruptionBudgetView>,
	pub pvcs: BTreeMap<(String, String), PvcView>,
	pub pvs: BTreeMap<String, PvView>,
	pub config_objects: BTreeMap<String, String>,
	pub events: Vec<RecordedEvent>,
	pub evicted: Vec<(String, String)>,
	pub deleted_pods: Vec<(String, String)>,
	pub not_ready_nodes: u32,
	pub total_nodes: u32,
	pub pending_pods: u32,
	pub synced: bool,
	/// Eviction outcomes to return in sequence for a given (namespace, name);
	/// defaults to `Accepted` when exhausted. Lets tests script a
	/// TooManyRequests-then-success sequence.
	pub evict_script: BTreeMap<(String, String), Vec<EvictOutcome>>,
}

pub struct FakeClient {
	pub state: Mutex<FakeState>,
}

impl FakeClient {
	pub fn new() -> Self {
		FakeClient {
			state: Mutex::new(FakeState {
				synced: true,
				..Default::default()
			}),
		}
	}

	pub fn with_node(self, node: NodeView) -> Self {
		self.state.lock().unwrap().nodes.insert(node.name.clone(), node);
		self
	}

	pub fn with_pod(self, pod: PodView) -> Self {
		self.state
			.lock()
			.unwrap()
			.pods
			.insert((pod.namespace.clone(), pod.name.clone()), pod);
		self
	}

	pub fn with_budget(self, budget: DisruptionBudgetView) -> Self {
		self.state.lock().unwrap().budgets.push(budget);
		self
	}

	pub fn events(&self) -> Vec<RecordedEvent> {
		self.state.lock().unwrap().events.clone()
	}
}

impl Default for FakeClient {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl ClusterClient for FakeClient {
	async fn list_nodes(&self) -> nla_error::Result<Vec<NodeView>> {
		Ok(self.state.lock().unwrap().nodes.values().cloned().collect())
	}

	async fn get_node(&self, name: &str) -> nla_error::Result<Option<NodeView>> {
		Ok(self.state.lock().unwrap().nodes.get(name).cloned())
	}

	async fn set_nla_taint(
		&self,
		node_name: &str,
		value: Option<NlaTaintValue>,
		now: DateTime<Utc>,
	) -> nla_error::Result<bool> {
		let mut state = self.state.lock().unwrap();
		let Some(node) = state.nodes.get_mut(node_name) else {
			return Ok(false);
		};
		node.nla_taint = value.map(|value| NlaTaint {
			value,
			time_added: now,
		});
		Ok(true)
	}

	async fn set_node_label(&self, node_name: &str, key: &str, value: &str) -> nla_error::Result<()> {
		let mut state = self.state.lock().unwrap();
		if let Some(node) = state.nodes.get_mut(node_name) {
			node.labels.insert(key.to_string(), value.to_string());
		}
		Ok(())
	}

	async fn remove_node_label(&self, node_name: &str, key: &str) -> nla_error::Result<()> {
		let mut state = self.state.lock().unwrap();
		if let Some(node) = state.nodes.get_mut(node_name) {
			node.labels.remove(key);
		}
		Ok(())
	}

	async fn set_unschedulable(&self, node_name: &str, value: bool) -> nla_error::Result<()> {
		let mut state = self.state.lock().unwrap();
		if let Some(node) = state.nodes.get_mut(node_name) {
			node.unschedulable = value;
		}
		Ok(())
	}

	async fn set_drain_failure(
		&self,
		node_name: &str,
		count: u32,
		reason: &str,
		now: DateTime<Utc>,
	) -> nla_error::Result<()> {
		let mut state = self.state.lock().unwrap();
		if let Some(node) = state.nodes.get_mut(node_name) {
			node.conditions.retain(|c| c.condition_type != DRAIN_FAILURE_CONDITION);
			node.conditions.push(NodeCondition {
				condition_type: DRAIN_FAILURE_CONDITION.to_string(),
				status: ConditionStatus::True,
				last_transition_time: now,
				message: format!("{count}|{reason}"),
			});
		}
		Ok(())
	}

	async fn clear_drain_failure(&self, node_name: &str) -> nla_error::Result<()> {
		let mut state = self.state.lock().unwrap();
		if let Some(node) = state.nodes.get_mut(node_name) {
			node.conditions.retain(|c| c.condition_type != DRAIN_FAILURE_CONDITION);
		}
		Ok(())
	}

	async fn record_drain_condition(
		&self,
		node_name: &str,
		_started_at: DateTime<Utc>,
		ended_at: DateTime<Utc>,
	) -> nla_error::Result<()> {
		let mut state = self.state.lock().unwrap();
		if let Some(node) = state.nodes.get_mut(node_name) {
			node.conditions.retain(|c| c.condition_type != "NodeLifecycleAgentDrained");
			node.conditions.push(NodeCondition {
				condition_type: "NodeLifecycleAgentDrained".to_string(),
				status: ConditionStatus::True,
				last_transition_time: ended_at,
				message: "drained".to_string(),
			});
		}
		Ok(())
	}

	async fn list_pods_on_node(&self, node_name: &str) -> nla_error::Result<Vec<PodView>> {
		Ok(self
			.state
			.lock()
			.unwrap()
			.pods
			.values()
			.filter(|p| p.node_name.as_deref() == Some(node_name))
			.cloned()
			.collect())
	}

	async fn get_pod(&self, namespace: &str, name: &str) -> nla_error::Result<Option<PodView>> {
		Ok(self
			.state
			.lock()
			.unwrap()
			.pods
			.get(&(namespace.to_string(), name.to_string()))
			.cloned())
	}

	async fn delete_pod(&self, namespace: &str, name: &str) -> nla_error::Result<()> {
		let mut state = self.state.lock().unwrap();
		state.pods.remove(&(namespace.to_string(), name.to_string()));
		state.deleted_pods.push((namespace.to_string(), name.to_string()));
		Ok(())
	}

	async fn controller_annotations(
		&self,
		_namespace: &str,
		_controller_kind: &str,
		_controller_name: &str,
	) -> nla_error::Result<Option<BTreeMap<String, String>>> {
		Ok(None)
	}

	async fn disruption_budgets_for_pod(
		&self,
		pod: &PodView,
	) -> nla_error::Result<Vec<DisruptionBudgetView>> {
		Ok(self
			.state
			.lock()
			.unwrap()
			.budgets
			.iter()
			.filter(|b| b.namespace == pod.namespace && b.selects(&pod.labels))
			.cloned()
			.collect())
	}

	async fn evict_pod(
		&self,
		namespace: &str,
		name: &str,
		_grace_period_seconds: i64,
		dry_run: bool,
	) -> nla_error::Result<EvictOutcome> {
		let mut state = self.state.lock().unwrap();
		let key = (namespace.to_string(), name.to_string());

		if let Some(script) = state.evict_script.get_mut(&key) {
			if !script.is_empty() {
				return Ok(script.remove(0));
			}
		}

		if !state.pods.contains_key(&key) {
			return Ok(EvictOutcome::NotFound);
		}
		if !dry_run {
			state.evicted.push(key.clone());
			state.pods.remove(&key);
		}
		Ok(EvictOutcome::Accepted)
	}

	async fn get_pvc(&self, namespace: &str, name: &str) -> nla_error::Result<Option<PvcView>> {
		Ok(self
			.state
			.lock()
			.unwrap()
			.pvcs
			.get(&(namespace.to_string(), name.to_string()))
			.cloned())
	}

	async fn delete_pvc(&self, namespace: &str, name: &str) -> nla_error::Result<()> {
		self.state
			.lock()
			.unwrap()
			.pvcs
			.remove(&(namespace.to_string(), name.to_string()));
		Ok(())
	}

	async fn get_pv(&self, name: &str) -> nla_error::Result<Option<PvView>> {
		Ok(self.state.lock().unwrap().pvs.get(name).cloned())
	}

	async fn delete_pv(&self, name: &str) -> nla_error::Result<()> {
		self.state.lock().unwrap().pvs.remove(name);
		Ok(())
	}

	async fn emit_event(
		&self,
		object: &ObjectRef,
		event_type: EventType,
		reason: &str,
		message: &str,
	) -> nla_error::Result<()> {
		self.state.lock().unwrap().events.push(RecordedEvent {
			object: object.name.clone(),
			event_type,
			reason: reason.to_string(),
			message: message.to_string(),
		});
		Ok(())
	}

	async fn get_config_object(&self, key: &str) -> nla_error::Result<Option<String>> {
		Ok(self.state.lock().unwrap().config_objects.get(key).cloned())
	}

	async fn put_config_object(&self, key: &str, value: &str) -> nla_error::Result<()> {
		self.state
			.lock()
			.unwrap()
			.config_objects
			.insert(key.to_string(), value.to_string());
		Ok(())
	}

	async fn not_ready_node_count(&self) -> nla_error::Result<(u32, u32)> {
		let state = self.state.lock().unwrap();
		Ok((state.not_ready_nodes, state.total_nodes.max(state.nodes.len() as u32)))
	}

	async fn pending_pod_count(&self) -> nla_error::Result<u32> {
		Ok(self.state.lock().unwrap().pending_pods)
	}

	async fn has_pending_pod_bound_to_node_volume(&self, node_name: &str) -> nla_error::Result<bool> {
		let state = self.state.lock().unwrap();
		let bound = state.pods.values().any(|pod| {
			pod.phase == crate::pod::PodPhase::Pending
				&& pod.volume_claims.iter().any(|claim_name| {
					state
						.pvcs
						.get(&(pod.namespace.clone(), claim_name.clone()))
						.and_then(|pvc| pvc.volume_name.as_ref())
						.and_then(|volume_name| state.pvs.get(volume_name))
						.and_then(|pv| pv.bound_node_name.as_deref())
						== Some(node_name)
				})
		});
		Ok(bound)
	}

	fn has_synced(&self) -> bool {
		self.state.lock().unwrap().synced
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Utc;

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

	#[tokio::test]
	async fn taint_roundtrips_through_the_fake() {
		let client = FakeClient::new().with_node(node("n1"));
		client
			.set_nla_taint("n1", Some(NlaTaintValue::DrainCandidate), Utc::now())
			.await
			.unwrap();
		let n = client.get_node("n1").await.unwrap().unwrap();
		assert_eq!(n.nla_taint.unwrap().value, NlaTaintValue::DrainCandidate);
	}

	#[tokio::test]
	async fn eviction_removes_pod_and_records_it() {
		let client = FakeClient::new().with_pod(PodView {
			name: "p1".into(),
			namespace: "default".into(),
			node_name: Some("n1".into()),
			labels: BTreeMap::new(),
			annotations: BTreeMap::new(),
			controller: None,
			volume_claims: Vec::new(),
			phase: crate::pod::PodPhase::Running,
			deletion_timestamp: None,
			uid: Some("u1".into()),
			termination_grace_period_seconds: Some(30),
		});
		let outcome = client.evict_pod("default", "p1", 30, false).await.unwrap();
		assert_eq!(outcome, EvictOutcome::Accepted);
		assert!(client.get_pod("default", "p1").await.unwrap().is_none());
		assert_eq!(client.state.lock().unwrap().evicted.len(), 1);
	}

	#[tokio::test]
	async fn dry_run_eviction_does_not_remove_the_pod() {
		let client = FakeClient::new().with_pod(PodView {
			name: "p1".into(),
			namespace: "default".into(),
			node_name: Some("n1".into()),
			labels: BTreeMap::new(),
			annotations: BTreeMap::new(),
			controller: None,
			volume_claims: Vec::new(),
			phase: crate::pod::PodPhase::Running,
			deletion_timestamp: None,
			uid: Some("u1".into()),
			termination_grace_period_seconds: Some(30),
		});
		client.evict_pod("default", "p1", 30, true).await.unwrap();
		assert!(client.get_pod("default", "p1").await.unwrap().is_some());
	}
}
