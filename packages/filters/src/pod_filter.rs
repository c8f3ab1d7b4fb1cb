//! Per-pod admission predicates shared between candidacy filtering and the
//! drainer's own pod enumeration (spec §4.3 `pod_filter`, §4.5 step 2).
//!
//! Kept as two independent chains per SPEC_FULL.md's resolution of the
//! `drainerSkipPodFilter` vs `cordonPodFilteringFunc` open question: they
//! share predicates but diverge on short-lived-pod handling.

use nla_k8s::annotations::{OPT_IN, OPT_OUT, PROTECTED, SHORT_LIVED};
use nla_k8s::pod::PodView;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRejection {
	pub pod: String,
	pub reason: &'static str,
}

fn opted_in(pod: &PodView) -> bool {
	pod.annotations
		.get(OPT_IN)
		.map(|v| v == "true")
		.unwrap_or(false)
}

fn opted_out(pod: &PodView) -> bool {
	pod.annotations
		.get(OPT_OUT)
		.map(|v| v == "true")
		.unwrap_or(false)
}

fn is_protected(pod: &PodView) -> bool {
	pod.annotations.contains_key(PROTECTED)
}

fn is_short_lived(pod: &PodView) -> bool {
	pod.annotations
		.get(SHORT_LIVED)
		.map(|v| v == "true")
		.unwrap_or(false)
}

/// Used when deciding whether a node may become a drain candidate: a node
/// is admitted only if every pod on it passes this chain.
///
/// Honors the opt-in-first override: a pod opted out is still admitted if
/// it also carries opt-in (opt-in wins ties, matching spec §6's lookup
/// order intent of an explicit per-pod override beating a blanket one).
pub fn cordon_pod_filter(pod: &PodView) -> Result<(), PodRejection> {
	if pod.is_mirror_pod() {
		return Ok(());
	}
	if pod.phase.is_completed() {
		return Ok(());
	}
	if is_protected(pod) && !opted_in(pod) {
		return Err(reject(pod, "protected"));
	}
	if opted_out(pod) && !opted_in(pod) {
		return Err(reject(pod, "opted-out"));
	}
	if is_short_lived(pod) && !opted_in(pod) {
		return Err(reject(pod, "short-lived"));
	}
	Ok(())
}

/// Used by the drainer when it actually enumerates pods to evict. By the
/// time a node reaches this point candidacy already stands, so short-lived
/// pods are simply skipped (not evicted) rather than blocking the drain —
/// they do not get the opt-in-first exemption the cordon chain grants.
pub fn drain_pod_filter(pod: &PodView) -> PodDrainDecision {
	if pod.is_mirror_pod() {
		return PodDrainDecision::Skip("mirror-pod");
	}
	if pod.is_daemonset_controlled() {
		return PodDrainDecision::Skip("daemonset-controlled");
	}
	if pod.phase.is_completed() {
		return PodDrainDecision::Skip("completed");
	}
	if is_short_lived(pod) {
		return PodDrainDecision::Skip("short-lived");
	}
	if is_protected(pod) && !opted_in(pod) {
		return PodDrainDecision::Skip("protected");
	}
	if opted_out(pod) && !opted_in(pod) {
		return PodDrainDecision::Skip("opted-out");
	}
	PodDrainDecision::Evict
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodDrainDecision {
	Evict,
	Skip(&'static str),
}

fn reject(pod: &PodView, reason: &'static str) -> PodRejection {
	PodRejection {
		pod: format!("{}/{}", pod.namespace, pod.name),
		reason,
	}
}

/// Runs the cordon pod filter across every pod on a node; `Ok(())` iff all
/// pass (spec §4.3 `pod_filter`: "every pod on the node passes").
pub fn all_pods_pass_cordon_filter(pods: &[PodView]) -> Result<(), PodRejection> {
	for pod in pods {
		cordon_pod_filter(pod)?;
	}
	Ok(())
}
