//! Drain coordination engine: the Group Registry and the per-group
//! Candidate Runner / Drain Runner pair it supervises (spec §4.1-§4.4).

pub mod candidate_runner;
pub mod drain_runner;
pub mod group_registry;
pub mod node_iterator;

pub use candidate_runner::{CandidateRunner, CandidateSnapshot};
pub use drain_runner::DrainRunner;
pub use group_registry::GroupRegistry;
pub use node_iterator::NodeIterator;
