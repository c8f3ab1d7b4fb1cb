//! The candidate ordering used before walking the simulator/taint loop
//! (spec §4.2 step 5): a small stack of comparators applied in priority
//! order, each one breaking ties left by the previous.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use nla_config::ConditionConfig;
use nla_filters::offending_conditions;
use nla_k8s::annotations::DRAIN_ASAP;
use nla_k8s::node::NodeView;
use nla_k8s::pod::PodView;

type Candidate = (NodeView, Vec<PodView>);
type Comparator = Box<dyn Fn(&Candidate, &Candidate) -> Ordering + Send + Sync>;

/// Sorts the retained candidate list before slots are handed out. Built
/// fresh each tick since the offending-condition priority comparator closes
/// over the tick's configured conditions and `now`.
pub struct NodeIterator {
	comparators: Vec<Comparator>,
}

impl NodeIterator {
	/// Order: `drain-asap`-annotated nodes first, then by the priority of
	/// the node's highest-priority currently-offending condition
	/// (descending), then oldest node first, then by name for a total
	/// order.
	pub fn standard(node_conditions: Vec<ConditionConfig>, now: DateTime<Utc>) -> Self {
		let conditions_for_priority = node_conditions;
		NodeIterator {
			comparators: vec![
				Box::new(|a: &Candidate, b: &Candidate| drain_asap_rank(&b.0).cmp(&drain_asap_rank(&a.0))),
				Box::new(move |a: &Candidate, b: &Candidate| {
					let pa = highest_offending_priority(&a.0, &conditions_for_priority, now);
					let pb = highest_offending_priority(&b.0, &conditions_for_priority, now);
					pb.cmp(&pa)
				}),
				Box::new(|a: &Candidate, b: &Candidate| a.0.creation_timestamp.cmp(&b.0.creation_timestamp)),
				Box::new(|a: &Candidate, b: &Candidate| a.0.name.cmp(&b.0.name)),
			],
		}
	}

	pub fn sort(&self, candidates: &mut [Candidate]) {
		candidates.sort_by(|a, b| {
			for comparator in &self.comparators {
				let ordering = comparator(a, b);
				if ordering != Ordering::Equal {
					return ordering;
				}
			}
			Ordering::Equal
		});
	}
}

/// `drain-asap` (spec §6): a numeric sort priority, higher value sorts
/// earlier. Absent or unparsable annotations rank below every node that
/// carries a valid one.
fn drain_asap_rank(node: &NodeView) -> i64 {
	node.annotations
		.get(DRAIN_ASAP)
		.and_then(|v| v.parse::<i64>().ok())
		.unwrap_or(i64::MIN)
}

fn highest_offending_priority(node: &NodeView, configured: &[ConditionConfig], now: DateTime<Utc>) -> i32 {
	offending_conditions(node, configured, now)
		.into_iter()
		.map(|c| c.priority)
		.max()
		.unwrap_or(i32::MIN)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::BTreeMap;

	fn node(name: &str, created_secs: i64) -> NodeView {
		NodeView {
			name: name.to_string(),
			labels: BTreeMap::new(),
			annotations: BTreeMap::new(),
			creation_timestamp: chrono::DateTime::from_timestamp(created_secs, 0).unwrap(),
			deletion_timestamp: None,
			unschedulable: false,
			nla_taint: None,
			conditions: Vec::new(),
			allocatable_cpu_millis: 0,
		}
	}

	#[test]
	fn drain_asap_nodes_sort_first() {
		let plain = node("b", 100);
		let mut asap = node("a", 200);
		asap.annotations.insert(DRAIN_ASAP.to_string(), "1".to_string());
		let mut candidates = vec![(plain, Vec::new()), (asap, Vec::new())];
		NodeIterator::standard(Vec::new(), Utc::now()).sort(&mut candidates);
		assert_eq!(candidates[0].0.name, "a");
	}

	#[test]
	fn higher_drain_asap_value_sorts_before_lower() {
		let mut low = node("low", 100);
		low.annotations.insert(DRAIN_ASAP.to_string(), "1".to_string());
		let mut high = node("high", 100);
		high.annotations.insert(DRAIN_ASAP.to_string(), "10".to_string());
		let mut candidates = vec![(low, Vec::new()), (high, Vec::new())];
		NodeIterator::standard(Vec::new(), Utc::now()).sort(&mut candidates);
		assert_eq!(candidates[0].0.name, "high");
	}

	#[test]
	fn unparsable_drain_asap_value_is_ignored() {
		let mut bogus = node("bogus", 100);
		bogus.annotations.insert(DRAIN_ASAP.to_string(), "true".to_string());
		let mut valid = node("valid", 200);
		valid.annotations.insert(DRAIN_ASAP.to_string(), "5".to_string());
		let mut candidates = vec![(bogus, Vec::new()), (valid, Vec::new())];
		NodeIterator::standard(Vec::new(), Utc::now()).sort(&mut candidates);
		assert_eq!(candidates[0].0.name, "valid");
	}

	#[test]
	fn falls_back_to_age_then_name() {
		let older = node("z", 100);
		let newer = node("a", 200);
		let mut candidates = vec![(newer.clone(), Vec::new()), (older.clone(), Vec::new())];
		NodeIterator::standard(Vec::new(), Utc::now()).sort(&mut candidates);
		assert_eq!(candidates[0].0.name, "z");
	}

	#[test]
	fn same_age_breaks_tie_by_name() {
		let a = node("b", 100);
		let b = node("a", 100);
		let mut candidates = vec![(a, Vec::new()), (b, Vec::new())];
		NodeIterator::standard(Vec::new(), Utc::now()).sort(&mut candidates);
		assert_eq!(candidates[0].0.name, "a");
	}
}
