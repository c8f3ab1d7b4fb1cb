//! The single reserved "NLA taint" (spec §3, §6): one key, one of four
//! string values, mutated only by this controller.

use serde::{Deserialize, Serialize};

/// Key of the reserved taint. A node carries at most one of these.
pub const NLA_TAINT_KEY: &str = "node-lifecycle.datadoghq.com/nla";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NlaTaintValue {
	DrainCandidate,
	Draining,
	Drained,
	ForceDraining,
}

impl NlaTaintValue {
	pub fn as_str(&self) -> &'static str {
		match self {
			NlaTaintValue::DrainCandidate => "drain-candidate",
			NlaTaintValue::Draining => "draining",
			NlaTaintValue::Drained => "drained",
			NlaTaintValue::ForceDraining => "force-draining",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"drain-candidate" => Some(NlaTaintValue::DrainCandidate),
			"draining" => Some(NlaTaintValue::Draining),
			"drained" => Some(NlaTaintValue::Drained),
			"force-draining" => Some(NlaTaintValue::ForceDraining),
			_ => None,
		}
	}
}

/// A node's taint carries the value plus the instant it was last set
/// ("timeAdded" in the spec's state-machine diagrams).
#[derive(Debug, Clone, PartialEq)]
pub struct NlaTaint {
	pub value: NlaTaintValue,
	pub time_added: chrono::DateTime<chrono::Utc>,
}

/// Validates a state transition against spec §4.4's state machine: no
/// skipped states, no cycles other than `candidate -> (drop) -> absent ->
/// candidate`.
pub fn is_valid_transition(from: Option<NlaTaintValue>, to: Option<NlaTaintValue>) -> bool {
	use NlaTaintValue::*;
	match (from, to) {
		(None, None) => true,
		(None, Some(DrainCandidate)) => true,
		(None, Some(ForceDraining)) => true,
		(Some(DrainCandidate), Some(Draining)) => true,
		(Some(DrainCandidate), None) => true,
		(Some(Draining), Some(Drained)) => true,
		(Some(Draining), None) => true,
		(Some(ForceDraining), Some(Drained)) => true,
		(Some(ForceDraining), None) => true,
		(Some(Drained), Some(Drained)) => true,
		(Some(a), Some(b)) if a == b => true,
		_ => false,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_through_strings() {
		for v in [
			NlaTaintValue::DrainCandidate,
			NlaTaintValue::Draining,
			NlaTaintValue::Drained,
			NlaTaintValue::ForceDraining,
		] {
			assert_eq!(NlaTaintValue::parse(v.as_str()), Some(v));
		}
	}

	#[test]
	fn unknown_value_does_not_parse() {
		assert_eq!(NlaTaintValue::parse("bogus"), None);
	}

	#[test]
	fn candidate_to_draining_is_valid_but_not_reverse() {
		use NlaTaintValue::*;
		assert!(is_valid_transition(Some(DrainCandidate), Some(Draining)));
		assert!(!is_valid_transition(Some(Draining), Some(DrainCandidate)));
	}

	#[test]
	fn drop_and_recandidate_cycle_is_valid() {
		use NlaTaintValue::*;
		assert!(is_valid_transition(Some(DrainCandidate), None));
		assert!(is_valid_transition(None, Some(DrainCandidate)));
	}

	#[test]
	fn drained_to_absent_is_invalid() {
		// A drained node only disappears when the cluster deletes it, not via
		// a taint removal the controller would perform itself.
		assert!(!is_valid_transition(Some(NlaTaintValue::Drained), None));
	}
}
