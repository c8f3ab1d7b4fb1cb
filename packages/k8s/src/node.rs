//! In-process view of a cluster `Node`, decoupled from `k8s_openapi` so the
//! rest of the crate graph can be exercised against the fake client in
//! `nla_k8s::test_support` without pulling in a live API server.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node as ApiNode;

use crate::taint::{NLA_TAINT_KEY, NlaTaint, NlaTaintValue};

/// Spec §3 "Retry Record": the `DrainFailure` condition's reserved type.
pub const DRAIN_FAILURE_CONDITION: &str = "DrainFailure";

#[derive(Debug, Clone, PartialEq)]
pub struct NodeView {
	pub name: String,
	pub labels: BTreeMap<String, String>,
	pub annotations: BTreeMap<String, String>,
	pub creation_timestamp: DateTime<Utc>,
	pub deletion_timestamp: Option<DateTime<Utc>>,
	pub unschedulable: bool,
	pub nla_taint: Option<NlaTaint>,
	pub conditions: Vec<NodeCondition>,
	pub allocatable_cpu_millis: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeCondition {
	pub condition_type: String,
	pub status: ConditionStatus,
	pub last_transition_time: DateTime<Utc>,
	pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionStatus {
	True,
	False,
	Unknown,
}

impl ConditionStatus {
	pub fn parse(s: &str) -> Self {
		match s {
			"True" => ConditionStatus::True,
			"False" => ConditionStatus::False,
			_ => ConditionStatus::Unknown,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			ConditionStatus::True => "True",
			ConditionStatus::False => "False",
			ConditionStatus::Unknown => "Unknown",
		}
	}
}

impl NodeView {
	pub fn is_terminating(&self) -> bool {
		self.deletion_timestamp.is_some()
	}

	pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
		now - self.creation_timestamp
	}

	pub fn condition(&self, condition_type: &str) -> Option<&NodeCondition> {
		self.conditions
			.iter()
			.find(|c| c.condition_type == condition_type)
	}

	/// Parses the `DrainFailure` condition's `"<count>|<reason>"` message
	/// (spec §3, §4.6). Malformed messages are treated as count=0, matching
	/// the Retry Wall's documented parsing fallback.
	pub fn drain_failure(&self) -> Option<DrainFailureRecord> {
		let cond = self.condition(DRAIN_FAILURE_CONDITION)?;
		Some(DrainFailureRecord::parse(
			&cond.message,
			cond.last_transition_time,
		))
	}

	pub fn group_key_label(&self) -> Option<&str> {
		self.labels
			.get(crate::annotations::LABEL_GROUP_KEY)
			.map(|s| s.as_str())
	}

	pub fn replace_request(&self) -> Option<crate::annotations::ReplaceRequestState> {
		self.labels
			.get(crate::annotations::LABEL_REPLACE_REQUEST)
			.and_then(|s| crate::annotations::ReplaceRequestState::parse(s))
	}
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrainFailureRecord {
	pub count: u32,
	pub last_heartbeat: DateTime<Utc>,
}

impl DrainFailureRecord {
	pub fn parse(message: &str, last_heartbeat: DateTime<Utc>) -> Self {
		let count = message
			.split_once('|')
			.and_then(|(count, _reason)| count.parse::<u32>().ok())
			.unwrap_or(0);
		DrainFailureRecord {
			count,
			last_heartbeat,
		}
	}
}

/// Translates a live `k8s_openapi` `Node` into our decoupled view. Lossy by
/// design: only the fields the controller ever reads are kept.
impl From<&ApiNode> for NodeView {
	fn from(node: &ApiNode) -> Self {
		let labels = node
			.metadata
			.labels
			.clone()
			.unwrap_or_default()
			.into_iter()
			.collect();
		let annotations = node
			.metadata
			.annotations
			.clone()
			.unwrap_or_default()
			.into_iter()
			.collect();
		let creation_timestamp = node
			.metadata
			.creation_timestamp
			.as_ref()
			.map(|t| t.0)
			.unwrap_or_else(Utc::now);
		let deletion_timestamp = node.metadata.deletion_timestamp.as_ref().map(|t| t.0);

		let nla_taint = node
			.spec
			.as_ref()
			.and_then(|s| s.taints.as_ref())
			.and_then(|taints| taints.iter().find(|t| t.key == NLA_TAINT_KEY))
			.and_then(|t| {
				let value = NlaTaintValue::parse(t.value.as_deref().unwrap_or_default())?;
				let time_added = t.time_added.as_ref().map(|t| t.0).unwrap_or_else(Utc::now);
				Some(NlaTaint { value, time_added })
			});

		let unschedulable = node
			.spec
			.as_ref()
			.and_then(|s| s.unschedulable)
			.unwrap_or(false);

		let conditions = node
			.status
			.as_ref()
			.and_then(|s| s.conditions.as_ref())
			.map(|cs| {
				cs.iter()
					.map(|c| NodeCondition {
						condition_type: c.type_.clone(),
						status: ConditionStatus::parse(&c.status),
						last_transition_time: c
							.last_transition_time
							.as_ref()
							.map(|t| t.0)
							.unwrap_or_else(Utc::now),
						message: c.message.clone().unwrap_or_default(),
					})
					.collect()
			})
			.unwrap_or_default();

		let allocatable_cpu_millis = node
			.status
			.as_ref()
			.and_then(|s| s.allocatable.as_ref())
			.and_then(|a| a.get("cpu"))
			.and_then(|q| q.0.parse::<f64>().ok())
			.map(|cores| (cores * 1000.0) as i64)
			.unwrap_or(0);

		NodeView {
			name: node.metadata.name.clone().unwrap_or_default(),
			labels,
			annotations,
			creation_timestamp,
			deletion_timestamp,
			unschedulable,
			nla_taint,
			conditions,
			allocatable_cpu_millis,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::TimeZone;

	#[test]
	fn drain_failure_parses_well_formed_message() {
		let ts = Utc.timestamp_opt(1000, 0).unwrap();
		let record = DrainFailureRecord::parse("3|timeout", ts);
		assert_eq!(record.count, 3);
		assert_eq!(record.last_heartbeat, ts);
	}

	#[test]
	fn drain_failure_treats_malformed_message_as_zero() {
		let ts = Utc::now();
		assert_eq!(DrainFailureRecord::parse("garbage", ts).count, 0);
		assert_eq!(DrainFailureRecord::parse("", ts).count, 0);
	}
}
