//! Candidate admission filtering (spec §4.3) and the cordon/drain pod
//! filter chains (spec §4.5, §9 open question on
//! `drainerSkipPodFilter`/`cordonPodFilteringFunc`).

pub mod chain;
pub mod label_expr;
pub mod pod_filter;

pub use chain::{
	CandidateFilter, CapacityEstimator, CompositeFilter, ConditionsFilter, DrainBufferFilter,
	FilterContext, FilterDecision, GlobalBlockerFilter, LabelsFilter, NodeReplacementFailedFilter,
	NodeTerminatingFilter, PodFilter, RetryFilter, StabilityPeriodFilter, offending_conditions,
};
pub use label_expr::LabelExpr;
