//! Named Prometheus collectors shared across the node lifecycle agent.
//!
//! Exposition plumbing itself is out of scope (an external collaborator
//! scrapes `registry()`), but the core owns and updates these collectors:
//! registered once at startup, updated inline with the reconciliation logic
//! they describe.

use std::collections::HashSet;
use std::sync::Mutex;

use prometheus::{
	GaugeVec, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
	core::{Collector, GenericGaugeVec},
};

pub struct Metrics {
	registry: Registry,

	/// Per-filter, per-group input/filtered-out counts (spec §4.3).
	pub filter_input_total: IntCounterVec,
	pub filter_filtered_total: IntCounterVec,

	/// Per-group candidate-runner telemetry (spec §3 "Candidate Data").
	pub candidate_group_node_count: IntGaugeVec,
	pub candidate_slots_remaining: IntGaugeVec,
	pub candidate_filtered_out: IntGaugeVec,
	pub candidate_run_duration: HistogramVec,

	/// Drain runner outcomes.
	pub drain_attempts_total: IntCounterVec,
	pub drain_success_total: IntCounterVec,
	pub drain_failure_total: IntCounterVec,
	pub drain_duration: HistogramVec,

	/// Drain simulator cache.
	pub simulator_cache_hits_total: IntCounterVec,
	pub simulator_cache_misses_total: IntCounterVec,

	/// Scope observer queue.
	pub scope_queue_depth: IntGaugeVec,
	pub scope_label_errors_total: IntCounterVec,

	/// The two dynamic gauge families from spec §4.10, fully unregistered
	/// and re-registered every tick so stale tag combinations stop being
	/// emitted.
	pub node_options_nodes_total: DynamicGaugeSet,
	pub node_options_cpu_total: DynamicGaugeSet,
}

impl Metrics {
	pub fn new() -> Self {
		let registry = Registry::new();

		macro_rules! register_counter_vec {
			($name:expr, $help:expr, $labels:expr) => {{
				let v = IntCounterVec::new(Opts::new($name, $help), $labels).unwrap();
				registry.register(Box::new(v.clone())).unwrap();
				v
			}};
		}
		macro_rules! register_gauge_vec {
			($name:expr, $help:expr, $labels:expr) => {{
				let v = IntGaugeVec::new(Opts::new($name, $help), $labels).unwrap();
				registry.register(Box::new(v.clone())).unwrap();
				v
			}};
		}
		macro_rules! register_histogram_vec {
			($name:expr, $help:expr, $labels:expr) => {{
				let v = HistogramVec::new(
					prometheus::HistogramOpts::new($name, $help),
					$labels,
				)
				.unwrap();
				registry.register(Box::new(v.clone())).unwrap();
				v
			}};
		}

		Metrics {
			filter_input_total: register_counter_vec!(
				"nla_filter_input_total",
				"nodes seen by a filter",
				&["group", "filter"]
			),
			filter_filtered_total: register_counter_vec!(
				"nla_filter_filtered_total",
				"nodes rejected by a filter",
				&["group", "filter"]
			),
			candidate_group_node_count: register_gauge_vec!(
				"nla_candidate_group_node_count",
				"nodes observed in a group on the last candidate tick",
				&["group"]
			),
			candidate_slots_remaining: register_gauge_vec!(
				"nla_candidate_slots_remaining",
				"candidate slots remaining on the last tick",
				&["group"]
			),
			candidate_filtered_out: register_gauge_vec!(
				"nla_candidate_filtered_out",
				"nodes filtered out on the last candidate tick",
				&["group"]
			),
			candidate_run_duration: register_histogram_vec!(
				"nla_candidate_run_duration_seconds",
				"candidate runner tick duration",
				&["group"]
			),
			drain_attempts_total: register_counter_vec!(
				"nla_drain_attempts_total",
				"drain attempts started",
				&["group"]
			),
			drain_success_total: register_counter_vec!(
				"nla_drain_success_total",
				"drains that completed successfully",
				&["group"]
			),
			drain_failure_total: register_counter_vec!(
				"nla_drain_failure_total",
				"drains that failed",
				&["group", "reason"]
			),
			drain_duration: register_histogram_vec!(
				"nla_drain_duration_seconds",
				"end-to-end drain duration",
				&["group"]
			),
			simulator_cache_hits_total: register_counter_vec!(
				"nla_simulator_cache_hits_total",
				"drain simulator cache hits",
				&["group"]
			),
			simulator_cache_misses_total: register_counter_vec!(
				"nla_simulator_cache_misses_total",
				"drain simulator cache misses",
				&["group"]
			),
			scope_queue_depth: register_gauge_vec!(
				"nla_scope_observer_queue_depth",
				"pending relabel work items",
				&["config_name"]
			),
			scope_label_errors_total: register_counter_vec!(
				"nla_scope_observer_label_errors_total",
				"nodes dropped after exceeding the relabel retry budget",
				&["config_name"]
			),
			node_options_nodes_total: DynamicGaugeSet::new(
				registry.clone(),
				"nla_node_options_nodes_total",
				"nodes dimensioned by scope/drain-status tags",
			),
			node_options_cpu_total: DynamicGaugeSet::new(
				registry.clone(),
				"nla_node_options_cpu_total",
				"allocatable cpu dimensioned by scope/drain-status tags",
			),
			registry,
		}
	}

	pub fn registry(&self) -> &Registry {
		&self.registry
	}
}

impl Default for Metrics {
	fn default() -> Self {
		Self::new()
	}
}

/// A gauge family that is fully unregistered and re-registered on every
/// `publish` call, matching spec §4.10 and the design note in §9 ("the
/// fully unregister and re-register trick exists specifically to garbage
/// collect stale label combinations").
///
/// `GaugeVec` has no API to drop a single label combination, so the only way
/// to stop emitting a stale series is to replace the whole collector.
pub struct DynamicGaugeSet {
	registry: Registry,
	name: String,
	help: String,
	inner: Mutex<Option<GenericGaugeVec<prometheus::core::AtomicF64>>>,
}

impl DynamicGaugeSet {
	fn new(registry: Registry, name: &str, help: &str) -> Self {
		DynamicGaugeSet {
			registry,
			name: name.to_string(),
			help: help.to_string(),
			inner: Mutex::new(None),
		}
	}

	/// Replaces the entire gauge family with one populated only from
	/// `series`. Each entry is `(label_values, metric_value)`; `label_names`
	/// gives the ordered label keys used to build the new collector.
	pub fn publish(&self, label_names: &[&str], series: &[(Vec<String>, f64)]) {
		let mut guard = self.inner.lock().unwrap();

		if let Some(old) = guard.take() {
			// Best-effort: the registry may already be gone in tests.
			let _ = self.registry.unregister(Box::new(old));
		}

		let vec: GaugeVec = GaugeVec::new(Opts::new(&self.name, &self.help), label_names).unwrap();

		let mut seen_label_sets = HashSet::new();
		for (labels, value) in series {
			let label_refs: Vec<&str> = labels.iter().map(|s| s.as_str()).collect();
			if !seen_label_sets.insert(labels.clone()) {
				// Duplicate tag combination in one publish call: last write
				// wins, matching GaugeVec's own semantics.
				continue;
			}
			vec.with_label_values(&label_refs).set(*value);
		}

		self.registry.register(Box::new(vec.clone())).unwrap();
		*guard = Some(vec);
	}

	pub fn series_count(&self) -> usize {
		self.inner
			.lock()
			.unwrap()
			.as_ref()
			.map(|v| v.collect().first().map(|m| m.get_metric().len()).unwrap_or(0))
			.unwrap_or(0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn dynamic_gauge_set_replaces_stale_series() {
		let registry = Registry::new();
		let set = DynamicGaugeSet::new(registry, "test_metric", "a test metric");

		set.publish(
			&["group"],
			&[
				(vec!["a".to_string()], 1.0),
				(vec!["b".to_string()], 2.0),
			],
		);
		assert_eq!(set.series_count(), 2);

		// Group "b" disappears this tick: the stale series must not survive.
		set.publish(&["group"], &[(vec!["a".to_string()], 3.0)]);
		assert_eq!(set.series_count(), 1);
	}

	#[test]
	fn metrics_registers_without_panicking() {
		let _metrics = Metrics::new();
	}
}
