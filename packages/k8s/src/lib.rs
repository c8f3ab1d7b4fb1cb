//! Cluster API client surface for the node lifecycle agent (spec §3 data
//! model, §6 external interfaces): typed node/pod/budget/volume views, the
//! reserved taint/label/annotation/condition vocabulary, group key
//! derivation, and the [`client::ClusterClient`] trait that decouples the
//! rest of the crate graph from a live `kube::Client`.

pub mod annotations;
pub mod budget;
pub mod client;
pub mod group_key;
pub mod node;
pub mod pod;
pub mod taint;
pub mod volume;

pub mod kube_client;
pub mod test_support;

pub use client::{ClusterClient, EventType, EvictOutcome, ObjectRef};
pub use kube_client::KubeClusterClient;
