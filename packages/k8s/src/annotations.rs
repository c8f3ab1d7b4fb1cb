//! Reserved annotation keys (spec §6) and the node -> pod -> controller
//! lookup order most of them share.

pub const OPT_IN: &str = "node-lifecycle.datadoghq.com/enabled";
pub const OPT_OUT: &str = "node-lifecycle.datadoghq.com/disabled";
pub const SHORT_LIVED: &str = "node-lifecycle.datadoghq.com/short-lived";
pub const PROTECTED: &str = "node-lifecycle.datadoghq.com/protected";
pub const DELETE_PVC_STORAGE_CLASS: &str =
	"node-lifecycle.datadoghq.com/delete-pvc-and-pv-with-storage-class";
pub const EVICTION_API_URL: &str = "node-lifecycle.datadoghq.com/eviction-api-url";
pub const DRAIN_GROUP_OVERRIDE: &str = "node-lifecycle.datadoghq.com/drain-group-override";
pub const DRAIN_ASAP: &str = "node-lifecycle.datadoghq.com/drain-asap";
pub const RETRY_STRATEGY_OVERRIDE: &str = "node-lifecycle.datadoghq.com/retry-strategy";
pub const PRE_ACTIVITY_STATE: &str = "node-lifecycle.datadoghq.com/pre-activity-state";
pub const SKIP_CORDON_LIMITER: &str = "node-lifecycle.datadoghq.com/skip-cordon-limiter";

/// Labels (spec §6 "Reserved labels").
pub const LABEL_CONFIGURATION: &str = "draino-configuration";
pub const LABEL_OVERDUE: &str = "overdue";
pub const LABEL_GROUP_KEY: &str = "node-lifecycle.datadoghq.com/group-key";
pub const LABEL_REPLACE_REQUEST: &str = "node-lifecycle.datadoghq.com/replace-request";

pub const OUT_OF_SCOPE_SENTINEL: &str = "out-of-scope";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceRequestState {
	Requested,
	Failed,
	Succeeded,
}

impl ReplaceRequestState {
	pub fn as_str(&self) -> &'static str {
		match self {
			ReplaceRequestState::Requested => "requested",
			ReplaceRequestState::Failed => "failed",
			ReplaceRequestState::Succeeded => "succeeded",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"requested" => Some(ReplaceRequestState::Requested),
			"failed" => Some(ReplaceRequestState::Failed),
			"succeeded" => Some(ReplaceRequestState::Succeeded),
			_ => None,
		}
	}
}

/// Pre-activity lifecycle state (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreActivityState {
	Waiting,
	Processing,
	Done,
	Failed,
}

impl PreActivityState {
	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"waiting" => Some(PreActivityState::Waiting),
			"processing" => Some(PreActivityState::Processing),
			"done" => Some(PreActivityState::Done),
			"failed" => Some(PreActivityState::Failed),
			_ => None,
		}
	}
}

/// Resolves an annotation by looking it up on the node first, then the pod,
/// then the pod's controlling object, in that order — the lookup order spec
/// §6 prescribes for most annotations.
pub fn lookup<'a>(
	key: &str,
	node_annotations: &'a std::collections::BTreeMap<String, String>,
	pod_annotations: Option<&'a std::collections::BTreeMap<String, String>>,
	controller_annotations: Option<&'a std::collections::BTreeMap<String, String>>,
) -> Option<&'a str> {
	node_annotations
		.get(key)
		.or_else(|| pod_annotations.and_then(|a| a.get(key)))
		.or_else(|| controller_annotations.and_then(|a| a.get(key)))
		.map(|s| s.as_str())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::BTreeMap;

	#[test]
	fn lookup_prefers_node_over_pod_over_controller() {
		let mut node = BTreeMap::new();
		node.insert(OPT_IN.to_string(), "node-value".to_string());
		let mut pod = BTreeMap::new();
		pod.insert(OPT_IN.to_string(), "pod-value".to_string());

		assert_eq!(
			lookup(OPT_IN, &node, Some(&pod), None),
			Some("node-value")
		);

		let empty = BTreeMap::new();
		assert_eq!(lookup(OPT_IN, &empty, Some(&pod), None), Some("pod-value"));
	}

	#[test]
	fn lookup_falls_through_to_controller() {
		let empty = BTreeMap::new();
		let mut controller = BTreeMap::new();
		controller.insert(OPT_IN.to_string(), "controller-value".to_string());
		assert_eq!(
			lookup(OPT_IN, &empty, None, Some(&controller)),
			Some("controller-value")
		);
	}
}
