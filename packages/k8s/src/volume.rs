//! Persistent volume claim / volume views consumed by the drainer's PVC
//! cleanup step (spec §4.5).

#[derive(Debug, Clone, PartialEq)]
pub struct PvcView {
	pub name: String,
	pub namespace: String,
	pub uid: Option<String>,
	pub storage_class: Option<String>,
	pub volume_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PvView {
	pub name: String,
	pub uid: Option<String>,
	/// Node name this volume's affinity pins it to, when the volume is
	/// node-local (spec §4.2 "PV-Protector" step). `None` for volumes with
	/// no node affinity (most network-attached storage classes).
	pub bound_node_name: Option<String>,
}
