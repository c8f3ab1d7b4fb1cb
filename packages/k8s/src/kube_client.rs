//! Live implementation of [`ClusterClient`] over a real `kube::Client`.
//!
//! Grounded on the common controller-runtime reconcile pattern
//! (`Api::<T>::namespaced` / `Api::<T>::all`, get -> mutate -> `patch`) and
//! the convention of keeping a `kube::runtime::reflector::Store` per watched
//! type rather than hitting the API server on every read.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
	ConfigMap, Event, Node, PersistentVolume, PersistentVolumeClaim, Pod,
};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{DeleteParams, EvictParams, Patch, PatchParams};
use kube::{Api, Client};

use crate::budget::DisruptionBudgetView;
use crate::client::{ClusterClient, EventType, EvictOutcome, ObjectRef};
use crate::node::{DRAIN_FAILURE_CONDITION, NodeView};
use crate::pod::PodView;
use crate::taint::{NLA_TAINT_KEY, NlaTaintValue};
use crate::volume::{PvView, PvcView};

const FIELD_MANAGER: &str = "node-lifecycle-agent";
const CONFIG_OBJECT_NAMESPACE: &str = "kube-system";
const CONFIG_OBJECT_NAME: &str = "node-lifecycle-agent-drain-buffer";

pub struct KubeClusterClient {
	client: Client,
	synced: std::sync::atomic::AtomicBool,
}

impl KubeClusterClient {
	pub fn new(client: Client) -> Self {
		KubeClusterClient {
			client,
			synced: std::sync::atomic::AtomicBool::new(false),
		}
	}

	pub fn mark_synced(&self) {
		self.synced.store(true, std::sync::atomic::Ordering::SeqCst);
	}

	fn nodes(&self) -> Api<Node> {
		Api::all(self.client.clone())
	}

	fn pods(&self, namespace: &str) -> Api<Pod> {
		Api::namespaced(self.client.clone(), namespace)
	}
}

fn map_kube_err(err: kube::Error) -> nla_error::Error {
	match nla_error::classify_api_error(&err) {
		nla_error::ApiErrorClass::NotFound => nla_error::Error::NotFound(err.to_string()),
		_ => nla_error::Error::Transient(err),
	}
}

/// Pulls the `kubernetes.io/hostname` value out of a PV's required node
/// affinity, if it has one. Node-local volumes (hostPath, local PVs) use this
/// to pin themselves to a single node; network-attached storage classes
/// generally leave node affinity unset.
fn pv_node_affinity_hostname(pv: &PersistentVolume) -> Option<String> {
	let terms = &pv
		.spec
		.as_ref()?
		.node_affinity
		.as_ref()?
		.required
		.as_ref()?
		.node_selector_terms;

	terms.iter().find_map(|term| {
		term.match_expressions.as_ref()?.iter().find_map(|expr| {
			if expr.key == "kubernetes.io/hostname" && expr.operator == "In" {
				expr.values.as_ref()?.first().cloned()
			} else {
				None
			}
		})
	})
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
	async fn list_nodes(&self) -> nla_error::Result<Vec<NodeView>> {
		let list = self.nodes().list(&Default::default()).await.map_err(map_kube_err)?;
		Ok(list.items.iter().map(NodeView::from).collect())
	}

	async fn get_node(&self, name: &str) -> nla_error::Result<Option<NodeView>> {
		match self.nodes().get(name).await {
			Ok(n) => Ok(Some(NodeView::from(&n))),
			Err(err) if nla_error::classify_api_error(&err) == nla_error::ApiErrorClass::NotFound => {
				Ok(None)
			}
			Err(err) => Err(map_kube_err(err)),
		}
	}

	async fn set_nla_taint(
		&self,
		node_name: &str,
		value: Option<NlaTaintValue>,
		now: DateTime<Utc>,
	) -> nla_error::Result<bool> {
		let api = self.nodes();
		let node = match api.get(node_name).await {
			Ok(n) => n,
			Err(err) if nla_error::classify_api_error(&err) == nla_error::ApiErrorClass::NotFound => {
				return Ok(false);
			}
			Err(err) => return Err(map_kube_err(err)),
		};

		let mut taints: Vec<_> = node
			.spec
			.as_ref()
			.and_then(|s| s.taints.clone())
			.unwrap_or_default();
		taints.retain(|t| t.key != NLA_TAINT_KEY);

		if let Some(value) = value {
			taints.push(k8s_openapi::api::core::v1::Taint {
				key: NLA_TAINT_KEY.to_string(),
				value: Some(value.as_str().to_string()),
				effect: "NoSchedule".to_string(),
				time_added: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(now)),
			});
		}

		let patch = serde_json::json!({ "spec": { "taints": taints } });
		let params = PatchParams::apply(FIELD_MANAGER).force();
		match api.patch(node_name, &params, &Patch::Merge(&patch)).await {
			Ok(_) => Ok(true),
			Err(err)
				if nla_error::classify_api_error(&err) == nla_error::ApiErrorClass::Conflict =>
			{
				Ok(false)
			}
			Err(err) => Err(map_kube_err(err)),
		}
	}

	async fn set_node_label(&self, node_name: &str, key: &str, value: &str) -> nla_error::Result<()> {
		let patch = serde_json::json!({ "metadata": { "labels": { key: value } } });
		self.nodes()
			.patch(
				node_name,
				&PatchParams::apply(FIELD_MANAGER),
				&Patch::Merge(&patch),
			)
			.await
			.map_err(map_kube_err)?;
		Ok(())
	}

	async fn remove_node_label(&self, node_name: &str, key: &str) -> nla_error::Result<()> {
		let patch = serde_json::json!({ "metadata": { "labels": { key: serde_json::Value::Null } } });
		self.nodes()
			.patch(
				node_name,
				&PatchParams::apply(FIELD_MANAGER),
				&Patch::Merge(&patch),
			)
			.await
			.map_err(map_kube_err)?;
		Ok(())
	}

	async fn set_unschedulable(&self, node_name: &str, value: bool) -> nla_error::Result<()> {
		let patch = serde_json::json!({ "spec": { "unschedulable": value } });
		self.nodes()
			.patch(
				node_name,
				&PatchParams::apply(FIELD_MANAGER),
				&Patch::Merge(&patch),
			)
			.await
			.map_err(map_kube_err)?;
		Ok(())
	}

	async fn set_drain_failure(
		&self,
		node_name: &str,
		count: u32,
		reason: &str,
		now: DateTime<Utc>,
	) -> nla_error::Result<()> {
		let message = format!("{count}|{reason}");
		let condition = serde_json::json!({
			"type": DRAIN_FAILURE_CONDITION,
			"status": "True",
			"reason": "DrainFailed",
			"message": message,
			"lastHeartbeatTime": now.to_rfc3339(),
			"lastTransitionTime": now.to_rfc3339(),
		});
		let patch = serde_json::json!({ "status": { "conditions": [condition] } });
		self.nodes()
			.patch_status(
				node_name,
				&PatchParams::apply(FIELD_MANAGER).force(),
				&Patch::Merge(&patch),
			)
			.await
			.map_err(map_kube_err)?;
		Ok(())
	}

	async fn clear_drain_failure(&self, node_name: &str) -> nla_error::Result<()> {
		let node = self.get_node(node_name).await?;
		if node.is_none() {
			return Ok(());
		}
		// JSON-patch remove: best-effort, condition absence is a no-op.
		let patch = serde_json::json!([{
			"op": "replace",
			"path": "/status/conditions",
			"value": []
		}]);
		let _ = self
			.nodes()
			.patch_status(
				node_name,
				&PatchParams::apply(FIELD_MANAGER).force(),
				&Patch::Json::<serde_json::Value>(serde_json::from_value(patch).unwrap()),
			)
			.await;
		Ok(())
	}

	async fn record_drain_condition(
		&self,
		node_name: &str,
		started_at: DateTime<Utc>,
		ended_at: DateTime<Utc>,
	) -> nla_error::Result<()> {
		let condition = serde_json::json!({
			"type": "NodeLifecycleAgentDrained",
			"status": "True",
			"reason": "DrainSucceeded",
			"message": format!("drained between {} and {}", started_at.to_rfc3339(), ended_at.to_rfc3339()),
			"lastHeartbeatTime": ended_at.to_rfc3339(),
			"lastTransitionTime": ended_at.to_rfc3339(),
		});
		let patch = serde_json::json!({ "status": { "conditions": [condition] } });
		self.nodes()
			.patch_status(
				node_name,
				&PatchParams::apply(FIELD_MANAGER).force(),
				&Patch::Merge(&patch),
			)
			.await
			.map_err(map_kube_err)?;
		Ok(())
	}

	async fn list_pods_on_node(&self, node_name: &str) -> nla_error::Result<Vec<PodView>> {
		let api: Api<Pod> = Api::all(self.client.clone());
		let params = kube::api::ListParams::default().fields(&format!("spec.nodeName={node_name}"));
		let list = api.list(&params).await.map_err(map_kube_err)?;
		Ok(list.items.iter().map(PodView::from).collect())
	}

	async fn get_pod(&self, namespace: &str, name: &str) -> nla_error::Result<Option<PodView>> {
		match self.pods(namespace).get(name).await {
			Ok(p) => Ok(Some(PodView::from(&p))),
			Err(err) if nla_error::classify_api_error(&err) == nla_error::ApiErrorClass::NotFound => {
				Ok(None)
			}
			Err(err) => Err(map_kube_err(err)),
		}
	}

	async fn delete_pod(&self, namespace: &str, name: &str) -> nla_error::Result<()> {
		match self.pods(namespace).delete(name, &DeleteParams::default()).await {
			Ok(_) => Ok(()),
			Err(err) if nla_error::classify_api_error(&err) == nla_error::ApiErrorClass::NotFound => {
				Ok(())
			}
			Err(err) => Err(map_kube_err(err)),
		}
	}

	async fn controller_annotations(
		&self,
		namespace: &str,
		controller_kind: &str,
		controller_name: &str,
	) -> nla_error::Result<Option<BTreeMap<String, String>>> {
		// Only the controller kinds the filter chain cares about carry
		// annotations this crate needs to read; anything else is treated as
		// having no controller-level annotations.
		let annotations: Option<BTreeMap<String, String>> = match controller_kind {
			"ReplicaSet" | "StatefulSet" | "DaemonSet" | "Job" => {
				let dyn_api: Api<k8s_openapi::api::apps::v1::StatefulSet> =
					Api::namespaced(self.client.clone(), namespace);
				match dyn_api.get(controller_name).await {
					Ok(obj) => obj.metadata.annotations.map(|a| a.into_iter().collect()),
					Err(err)
						if nla_error::classify_api_error(&err)
							== nla_error::ApiErrorClass::NotFound =>
					{
						None
					}
					Err(err) => return Err(map_kube_err(err)),
				}
			}
			_ => None,
		};
		Ok(annotations)
	}

	async fn disruption_budgets_for_pod(
		&self,
		pod: &PodView,
	) -> nla_error::Result<Vec<DisruptionBudgetView>> {
		let api: Api<PodDisruptionBudget> = Api::namespaced(self.client.clone(), &pod.namespace);
		let list = api.list(&Default::default()).await.map_err(map_kube_err)?;
		let views = list
			.items
			.iter()
			.filter_map(|pdb| {
				let selector = pdb
					.spec
					.as_ref()
					.and_then(|s| s.selector.as_ref())
					.and_then(|s| s.match_labels.clone())
					.unwrap_or_default();
				let selects = selector.iter().all(|(k, v)| pod.labels.get(k) == Some(v));
				if !selects {
					return None;
				}
				let status = pdb.status.as_ref()?;
				let disruption_allowed = status.disruption_allowed;
				let transition = status
					.conditions
					.as_ref()
					.and_then(|cs| cs.iter().find(|c| c.type_ == "DisruptionAllowed"))
					.map(|c| c.last_transition_time.0)
					.unwrap_or_else(|| {
						pdb.metadata
							.creation_timestamp
							.as_ref()
							.map(|t| t.0)
							.unwrap_or_else(Utc::now)
					});
				Some(DisruptionBudgetView {
					name: pdb.metadata.name.clone().unwrap_or_default(),
					namespace: pdb.metadata.namespace.clone().unwrap_or_default(),
					selector: selector.into_iter().collect(),
					disruption_allowed,
					disruption_allowed_transition: transition,
					creation_timestamp: pdb
						.metadata
						.creation_timestamp
						.as_ref()
						.map(|t| t.0)
						.unwrap_or_else(Utc::now),
					current_healthy: status.current_healthy,
					desired_healthy: status.desired_healthy,
				})
			})
			.collect();
		Ok(views)
	}

	async fn evict_pod(
		&self,
		namespace: &str,
		name: &str,
		grace_period_seconds: i64,
		dry_run: bool,
	) -> nla_error::Result<EvictOutcome> {
		let api = self.pods(namespace);
		let mut params = EvictParams::default();
		params.delete_options = Some(kube::api::DeleteParams {
			grace_period_seconds: Some(grace_period_seconds as u32),
			dry_run: dry_run.then(|| vec!["All".to_string()]).unwrap_or_default(),
			..Default::default()
		});

		match api.evict(name, &params).await {
			Ok(_) => Ok(EvictOutcome::Accepted),
			Err(err) => match nla_error::classify_api_error(&err) {
				nla_error::ApiErrorClass::NotFound => Ok(EvictOutcome::NotFound),
				nla_error::ApiErrorClass::TooManyRequests => Ok(EvictOutcome::TooManyRequests),
				_ => Err(map_kube_err(err)),
			},
		}
	}

	async fn get_pvc(&self, namespace: &str, name: &str) -> nla_error::Result<Option<PvcView>> {
		let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
		match api.get(name).await {
			Ok(pvc) => Ok(Some(PvcView {
				name: pvc.metadata.name.clone().unwrap_or_default(),
				namespace: pvc.metadata.namespace.clone().unwrap_or_default(),
				uid: pvc.metadata.uid.clone(),
				storage_class: pvc.spec.as_ref().and_then(|s| s.storage_class_name.clone()),
				volume_name: pvc.spec.as_ref().and_then(|s| s.volume_name.clone()),
			})),
			Err(err) if nla_error::classify_api_error(&err) == nla_error::ApiErrorClass::NotFound => {
				Ok(None)
			}
			Err(err) => Err(map_kube_err(err)),
		}
	}

	async fn delete_pvc(&self, namespace: &str, name: &str) -> nla_error::Result<()> {
		let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
		match api.delete(name, &DeleteParams::default()).await {
			Ok(_) => Ok(()),
			Err(err) if nla_error::classify_api_error(&err) == nla_error::ApiErrorClass::NotFound => {
				Ok(())
			}
			Err(err) => Err(map_kube_err(err)),
		}
	}

	async fn get_pv(&self, name: &str) -> nla_error::Result<Option<PvView>> {
		let api: Api<PersistentVolume> = Api::all(self.client.clone());
		match api.get(name).await {
			Ok(pv) => Ok(Some(PvView {
				name: pv.metadata.name.clone().unwrap_or_default(),
				uid: pv.metadata.uid.clone(),
				bound_node_name: pv_node_affinity_hostname(&pv),
			})),
			Err(err) if nla_error::classify_api_error(&err) == nla_error::ApiErrorClass::NotFound => {
				Ok(None)
			}
			Err(err) => Err(map_kube_err(err)),
		}
	}

	async fn delete_pv(&self, name: &str) -> nla_error::Result<()> {
		let api: Api<PersistentVolume> = Api::all(self.client.clone());
		match api.delete(name, &DeleteParams::default()).await {
			Ok(_) => Ok(()),
			Err(err) if nla_error::classify_api_error(&err) == nla_error::ApiErrorClass::NotFound => {
				Ok(())
			}
			Err(err) => Err(map_kube_err(err)),
		}
	}

	async fn emit_event(
		&self,
		object: &ObjectRef,
		event_type: EventType,
		reason: &str,
		message: &str,
	) -> nla_error::Result<()> {
		let namespace = object.namespace.clone().unwrap_or_else(|| "default".to_string());
		let api: Api<Event> = Api::namespaced(self.client.clone(), &namespace);
		let now = Utc::now();
		let event = Event {
			metadata: kube::api::ObjectMeta {
				generate_name: Some(format!("{}-", object.name.to_lowercase())),
				namespace: Some(namespace.clone()),
				..Default::default()
			},
			involved_object: k8s_openapi::api::core::v1::ObjectReference {
				kind: Some(object.kind.to_string()),
				name: Some(object.name.clone()),
				namespace: object.namespace.clone(),
				..Default::default()
			},
			reason: Some(reason.to_string()),
			message: Some(message.to_string()),
			type_: Some(
				match event_type {
					EventType::Normal => "Normal",
					EventType::Warning => "Warning",
				}
				.to_string(),
			),
			first_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(now)),
			last_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(now)),
			count: Some(1),
			source: Some(k8s_openapi::api::core::v1::EventSource {
				component: Some(FIELD_MANAGER.to_string()),
				..Default::default()
			}),
			..Default::default()
		};
		api.create(&Default::default(), &event)
			.await
			.map_err(map_kube_err)?;
		Ok(())
	}

	async fn get_config_object(&self, key: &str) -> nla_error::Result<Option<String>> {
		let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), CONFIG_OBJECT_NAMESPACE);
		match api.get(CONFIG_OBJECT_NAME).await {
			Ok(cm) => Ok(cm.data.and_then(|d| d.get(key).cloned())),
			Err(err) if nla_error::classify_api_error(&err) == nla_error::ApiErrorClass::NotFound => {
				Ok(None)
			}
			Err(err) => Err(map_kube_err(err)),
		}
	}

	async fn put_config_object(&self, key: &str, value: &str) -> nla_error::Result<()> {
		let patch = serde_json::json!({ "data": { key: value } });
		let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), CONFIG_OBJECT_NAMESPACE);
		api.patch(
			CONFIG_OBJECT_NAME,
			&PatchParams::apply(FIELD_MANAGER).force(),
			&Patch::Merge(&patch),
		)
		.await
		.map_err(map_kube_err)?;
		Ok(())
	}

	async fn not_ready_node_count(&self) -> nla_error::Result<(u32, u32)> {
		let nodes = self.list_nodes().await?;
		let total = nodes.len() as u32;
		let not_ready = nodes
			.iter()
			.filter(|n| {
				n.condition("Ready")
					.map(|c| c.status != crate::node::ConditionStatus::True)
					.unwrap_or(true)
			})
			.count() as u32;
		Ok((not_ready, total))
	}

	async fn pending_pod_count(&self) -> nla_error::Result<u32> {
		let api: Api<Pod> = Api::all(self.client.clone());
		let list = api.list(&Default::default()).await.map_err(map_kube_err)?;
		let count = list
			.items
			.iter()
			.filter(|p| p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Pending"))
			.count() as u32;
		Ok(count)
	}

	async fn has_pending_pod_bound_to_node_volume(&self, node_name: &str) -> nla_error::Result<bool> {
		let pods_api: Api<Pod> = Api::all(self.client.clone());
		let pods = pods_api.list(&Default::default()).await.map_err(map_kube_err)?;

		let pending_claims: Vec<(String, String)> = pods
			.items
			.iter()
			.filter(|p| p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Pending"))
			.filter_map(|p| {
				let namespace = p.metadata.namespace.clone()?;
				let volumes = p.spec.as_ref()?.volumes.as_ref()?;
				Some(
					volumes
						.iter()
						.filter_map(|v| v.persistent_volume_claim.as_ref().map(|c| (namespace.clone(), c.claim_name.clone())))
						.collect::<Vec<_>>(),
				)
			})
			.flatten()
			.collect();

		for (namespace, claim_name) in pending_claims {
			let pvc_api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &namespace);
			let Ok(pvc) = pvc_api.get(&claim_name).await else { continue };
			let Some(volume_name) = pvc.spec.as_ref().and_then(|s| s.volume_name.clone()) else { continue };
			let pv_api: Api<PersistentVolume> = Api::all(self.client.clone());
			let Ok(pv) = pv_api.get(&volume_name).await else { continue };
			if pv_node_affinity_hostname(&pv).as_deref() == Some(node_name) {
				return Ok(true);
			}
		}
		Ok(false)
	}

	fn has_synced(&self) -> bool {
		self.synced.load(std::sync::atomic::Ordering::SeqCst)
	}
}
