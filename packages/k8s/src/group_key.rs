//! Group key derivation (spec §3 "Group Key").
//!
//! A pure function of a node's labels/annotations and (optionally) its
//! pods' annotations: identical inputs yield identical outputs, which is
//! what lets the Group Registry treat two nodes with the same computed key
//! as belonging to one runner pair.

use crate::annotations::DRAIN_GROUP_OVERRIDE;
use crate::node::NodeView;
use crate::pod::PodView;

/// Separator joining group-key components. Reserved: an empty component is
/// preserved, so `"a##b"` differs from `"a#b"`.
pub const SEPARATOR: &str = "#";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupKeyResult {
	/// The key computed from labels/annotations, or the node's own override.
	Ok(String),
	/// The node's pods disagree on an inherited override; falls back to the
	/// label-derived key. The caller should emit `GroupOverrideBadConfiguration`.
	Disagreement { fallback: String },
}

impl GroupKeyResult {
	pub fn key(&self) -> &str {
		match self {
			GroupKeyResult::Ok(k) => k,
			GroupKeyResult::Disagreement { fallback } => fallback,
		}
	}

	pub fn is_disagreement(&self) -> bool {
		matches!(self, GroupKeyResult::Disagreement { .. })
	}
}

/// Computes the group key for `node` given the `component_keys` (ordered
/// label keys, optionally label keys with an `annotation:` prefix meaning
/// "read this key from annotations instead") and the set of pods scheduled
/// on it.
///
/// Resolution order (spec §3):
/// 1. An explicit override annotation on the node, when present and
///    non-empty, replaces the computed value entirely.
/// 2. Otherwise, if absent, the key may be inherited from a pod annotation,
///    provided all pods on the node agree.
/// 3. Otherwise, the key is the ordered, separator-joined list of component
///    values (missing components are empty strings, not omitted).
pub fn compute_group_key(
	node: &NodeView,
	component_keys: &[String],
	pods: &[PodView],
) -> GroupKeyResult {
	if let Some(override_value) = node.annotations.get(DRAIN_GROUP_OVERRIDE) {
		if !override_value.trim().is_empty() {
			return GroupKeyResult::Ok(override_value.clone());
		}
	}

	let computed = compute_from_components(node, component_keys);

	let pod_overrides: Vec<&str> = pods
		.iter()
		.filter_map(|p| p.annotations.get(DRAIN_GROUP_OVERRIDE))
		.map(|s| s.as_str())
		.filter(|s| !s.trim().is_empty())
		.collect();

	if pod_overrides.is_empty() {
		return GroupKeyResult::Ok(computed);
	}

	let first = pod_overrides[0];
	if pod_overrides.iter().all(|v| *v == first) {
		GroupKeyResult::Ok(first.to_string())
	} else {
		GroupKeyResult::Disagreement { fallback: computed }
	}
}

fn compute_from_components(node: &NodeView, component_keys: &[String]) -> String {
	component_keys
		.iter()
		.map(|key| {
			if let Some(ann_key) = key.strip_prefix("annotation:") {
				node.annotations.get(ann_key).cloned().unwrap_or_default()
			} else {
				node.labels.get(key).cloned().unwrap_or_default()
			}
		})
		.collect::<Vec<_>>()
		.join(SEPARATOR)
}

/// An override is well-formed (valid) when non-empty after trimming. An
/// empty override is never used to replace the computed value — the caller
/// emits a `GroupOverrideBadConfiguration` warning in that case.
pub fn override_is_valid(node: &NodeView) -> bool {
	node.annotations
		.get(DRAIN_GROUP_OVERRIDE)
		.is_none_or(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pod::PodPhase;
	use chrono::Utc;
	use std::collections::BTreeMap;

	fn node_with(labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> NodeView {
		NodeView {
			name: "n1".into(),
			labels: labels
				.iter()
				.map(|(k, v)| (k.to_string(), v.to_string()))
				.collect(),
			annotations: annotations
				.iter()
				.map(|(k, v)| (k.to_string(), v.to_string()))
				.collect(),
			creation_timestamp: Utc::now(),
			deletion_timestamp: None,
			unschedulable: false,
			nla_taint: None,
			conditions: Vec::new(),
			allocatable_cpu_millis: 0,
		}
	}

	fn pod_with_override(value: &str) -> PodView {
		PodView {
			name: "p".into(),
			namespace: "default".into(),
			node_name: Some("n1".into()),
			labels: BTreeMap::new(),
			annotations: BTreeMap::from([(DRAIN_GROUP_OVERRIDE.to_string(), value.to_string())]),
			controller: None,
			volume_claims: Vec::new(),
			phase: PodPhase::Running,
			deletion_timestamp: None,
			uid: None,
			termination_grace_period_seconds: None,
		}
	}

	#[test]
	fn pure_function_of_inputs() {
		let node = node_with(&[("app", "a"), ("shard", "1")], &[]);
		let keys = vec!["app".to_string(), "shard".to_string()];
		let a = compute_group_key(&node, &keys, &[]);
		let b = compute_group_key(&node, &keys, &[]);
		assert_eq!(a, b);
		assert_eq!(a.key(), "a#1");
	}

	#[test]
	fn empty_component_is_preserved_not_omitted() {
		let node = node_with(&[("a", "a"), ("c", "b")], &[]);
		let keys = vec!["a".to_string(), "missing".to_string(), "c".to_string()];
		assert_eq!(compute_group_key(&node, &keys, &[]).key(), "a##b");
	}

	#[test]
	fn node_override_replaces_computed_value() {
		let node = node_with(&[("app", "a")], &[(DRAIN_GROUP_OVERRIDE, "teamA")]);
		let keys = vec!["app".to_string()];
		assert_eq!(compute_group_key(&node, &keys, &[]).key(), "teamA");
	}

	#[test]
	fn empty_node_override_falls_back_to_computed() {
		let node = node_with(&[("app", "a")], &[(DRAIN_GROUP_OVERRIDE, "")]);
		let keys = vec!["app".to_string()];
		assert!(!override_is_valid(&node));
		assert_eq!(compute_group_key(&node, &keys, &[]).key(), "a");
	}

	#[test]
	fn agreeing_pod_overrides_are_inherited() {
		let node = node_with(&[("app", "a")], &[]);
		let keys = vec!["app".to_string()];
		let pods = vec![pod_with_override("teamA"), pod_with_override("teamA")];
		let result = compute_group_key(&node, &keys, &pods);
		assert!(!result.is_disagreement());
		assert_eq!(result.key(), "teamA");
	}

	#[test]
	fn disagreeing_pod_overrides_fall_back_and_flag() {
		let node = node_with(&[("app", "a")], &[]);
		let keys = vec!["app".to_string()];
		let pods = vec![pod_with_override("teamA"), pod_with_override("teamB")];
		let result = compute_group_key(&node, &keys, &pods);
		assert!(result.is_disagreement());
		assert_eq!(result.key(), "a");
	}
}
