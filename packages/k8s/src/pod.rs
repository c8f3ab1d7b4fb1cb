//! In-process view of a cluster `Pod` (spec §3 "Pod").

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod as ApiPod;

#[derive(Debug, Clone, PartialEq)]
pub struct PodView {
	pub name: String,
	pub namespace: String,
	pub node_name: Option<String>,
	pub labels: BTreeMap<String, String>,
	pub annotations: BTreeMap<String, String>,
	pub controller: Option<ControllerRef>,
	pub volume_claims: Vec<String>,
	pub phase: PodPhase,
	pub deletion_timestamp: Option<DateTime<Utc>>,
	pub uid: Option<String>,
	pub termination_grace_period_seconds: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerRef {
	pub kind: String,
	pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
	Pending,
	Running,
	Succeeded,
	Failed,
	Unknown,
}

impl PodPhase {
	fn parse(s: Option<&str>) -> Self {
		match s {
			Some("Pending") => PodPhase::Pending,
			Some("Running") => PodPhase::Running,
			Some("Succeeded") => PodPhase::Succeeded,
			Some("Failed") => PodPhase::Failed,
			_ => PodPhase::Unknown,
		}
	}

	pub fn is_completed(&self) -> bool {
		matches!(self, PodPhase::Succeeded | PodPhase::Failed)
	}
}

impl PodView {
	pub fn is_mirror_pod(&self) -> bool {
		self.annotations
			.contains_key("kubernetes.io/config.mirror")
	}

	pub fn is_daemonset_controlled(&self) -> bool {
		self.controller
			.as_ref()
			.is_some_and(|c| c.kind == "DaemonSet")
	}

	pub fn is_stateful_set_controlled(&self) -> bool {
		self.controller
			.as_ref()
			.is_some_and(|c| c.kind == "StatefulSet")
	}

	pub fn is_terminating(&self) -> bool {
		self.deletion_timestamp.is_some()
	}
}

impl From<&ApiPod> for PodView {
	fn from(pod: &ApiPod) -> Self {
		let labels = pod
			.metadata
			.labels
			.clone()
			.unwrap_or_default()
			.into_iter()
			.collect();
		let annotations = pod
			.metadata
			.annotations
			.clone()
			.unwrap_or_default()
			.into_iter()
			.collect();
		let controller = pod
			.metadata
			.owner_references
			.as_ref()
			.and_then(|refs| refs.iter().find(|r| r.controller == Some(true)))
			.map(|r| ControllerRef {
				kind: r.kind.clone(),
				name: r.name.clone(),
			});
		let volume_claims = pod
			.spec
			.as_ref()
			.and_then(|s| s.volumes.as_ref())
			.map(|volumes| {
				volumes
					.iter()
					.filter_map(|v| {
						v.persistent_volume_claim
							.as_ref()
							.map(|pvc| pvc.claim_name.clone())
					})
					.collect()
			})
			.unwrap_or_default();

		PodView {
			name: pod.metadata.name.clone().unwrap_or_default(),
			namespace: pod.metadata.namespace.clone().unwrap_or_default(),
			node_name: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
			labels,
			annotations,
			controller,
			volume_claims,
			phase: PodPhase::parse(pod.status.as_ref().and_then(|s| s.phase.as_deref())),
			deletion_timestamp: pod.metadata.deletion_timestamp.as_ref().map(|t| t.0),
			uid: pod.metadata.uid.clone(),
			termination_grace_period_seconds: pod
				.spec
				.as_ref()
				.and_then(|s| s.termination_grace_period_seconds),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn base_pod() -> PodView {
		PodView {
			name: "p1".into(),
			namespace: "default".into(),
			node_name: Some("n1".into()),
			labels: BTreeMap::new(),
			annotations: BTreeMap::new(),
			controller: None,
			volume_claims: Vec::new(),
			phase: PodPhase::Running,
			deletion_timestamp: None,
			uid: Some("uid-1".into()),
			termination_grace_period_seconds: Some(30),
		}
	}

	#[test]
	fn daemonset_controlled_pod_is_detected() {
		let mut pod = base_pod();
		pod.controller = Some(ControllerRef {
			kind: "DaemonSet".into(),
			name: "ds".into(),
		});
		assert!(pod.is_daemonset_controlled());
		assert!(!pod.is_stateful_set_controlled());
	}

	#[test]
	fn completed_phase_detection() {
		assert!(PodPhase::Succeeded.is_completed());
		assert!(PodPhase::Failed.is_completed());
		assert!(!PodPhase::Running.is_completed());
	}
}
