//! Disruption Budget (spec §3): read-only policy object constraining
//! concurrent evictions for a label-selected set of pods.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct DisruptionBudgetView {
	pub name: String,
	pub namespace: String,
	pub selector: BTreeMap<String, String>,
	pub disruption_allowed: bool,
	/// Most recent transition time of the `DisruptionAllowed` condition, if
	/// the budget reports one; falls back to `creation_timestamp`.
	pub disruption_allowed_transition: DateTime<Utc>,
	pub creation_timestamp: DateTime<Utc>,
	pub current_healthy: i32,
	pub desired_healthy: i32,
}

impl DisruptionBudgetView {
	/// Spec §4.3 "stability period": `stableSince` is the most recent
	/// `DisruptionAllowed=True` transition, or the budget's creation time.
	pub fn stable_since(&self) -> DateTime<Utc> {
		if self.disruption_allowed {
			self.disruption_allowed_transition
		} else {
			self.creation_timestamp
		}
	}

	pub fn selects(&self, pod_labels: &BTreeMap<String, String>) -> bool {
		self.selector
			.iter()
			.all(|(k, v)| pod_labels.get(k) == Some(v))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::TimeZone;

	fn budget(allowed: bool) -> DisruptionBudgetView {
		DisruptionBudgetView {
			name: "b".into(),
			namespace: "default".into(),
			selector: BTreeMap::from([("app".to_string(), "a".to_string())]),
			disruption_allowed: allowed,
			disruption_allowed_transition: Utc.timestamp_opt(100, 0).unwrap(),
			creation_timestamp: Utc.timestamp_opt(0, 0).unwrap(),
			current_healthy: 3,
			desired_healthy: 3,
		}
	}

	#[test]
	fn stable_since_uses_transition_time_when_allowed() {
		assert_eq!(
			budget(true).stable_since(),
			Utc.timestamp_opt(100, 0).unwrap()
		);
	}

	#[test]
	fn stable_since_uses_creation_time_when_not_allowed() {
		assert_eq!(
			budget(false).stable_since(),
			Utc.timestamp_opt(0, 0).unwrap()
		);
	}

	#[test]
	fn selects_matches_on_label_subset() {
		let b = budget(true);
		let labels = BTreeMap::from([
			("app".to_string(), "a".to_string()),
			("extra".to_string(), "x".to_string()),
		]);
		assert!(b.selects(&labels));
	}
}
