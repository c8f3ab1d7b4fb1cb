//! Typed configuration surface for the node lifecycle agent.
//!
//! Flag parsing and file loading live in `nla-cli`; this crate only owns the
//! shape of the resulting config and its validation, the same split as a
//! `clap::Parser` front door handing off into a loaded `Config` type.

use std::{collections::HashMap, path::Path, time::Duration};

use nla_error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration. Field names mirror the flags enumerated in the
/// spec's "Configuration flags" section; `serde(default)` supplies the
/// documented defaults so a near-empty config file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	/// `config-name`: identifies this controller instance in the
	/// `draino-configuration` label.
	pub config_name: String,

	/// `dry-run`: suppress all cluster mutations; still run filters and the
	/// simulator to publish diagnostics. Off by default — see
	/// SPEC_FULL.md's resolution of the dry-run-default open question.
	pub dry_run: bool,

	/// `node-label-expr`: a label selector string restricting which nodes
	/// this configuration manages.
	pub node_label_expr: String,

	/// `drain-group-labels`: ordered label keys (optionally augmented by
	/// annotation keys) used to derive the group key.
	pub drain_group_labels: Vec<String>,

	/// `node-conditions` (repeatable): offending conditions this
	/// configuration reacts to.
	pub node_conditions: Vec<ConditionConfig>,

	pub timing: TimingConfig,
	pub limits: LimitsConfig,
	pub cordon_limiter: CordonLimiterConfig,
	pub global_blocker: GlobalBlockerConfig,
	pub retry: RetryConfig,
	pub rate_limit: RateLimitConfig,
	pub leader_election: LeaderElectionConfig,
	pub eviction: EvictionConfig,
	pub pvc_cleanup: PvcCleanupConfig,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			config_name: "default".to_string(),
			dry_run: false,
			node_label_expr: String::new(),
			drain_group_labels: Vec::new(),
			node_conditions: Vec::new(),
			timing: TimingConfig::default(),
			limits: LimitsConfig::default(),
			cordon_limiter: CordonLimiterConfig::default(),
			global_blocker: GlobalBlockerConfig::default(),
			retry: RetryConfig::default(),
			rate_limit: RateLimitConfig::default(),
			leader_election: LeaderElectionConfig::default(),
			eviction: EvictionConfig::default(),
			pvc_cleanup: PvcCleanupConfig::default(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
	/// Ceiling on the grace period passed to the eviction API, further
	/// clamped down to the pod's own `terminationGracePeriodSeconds` (spec
	/// §4.5 step 3).
	pub max_grace_period: Duration,
	/// Poll cadence while awaiting pod deletion after an accepted eviction.
	pub poll_interval: Duration,
}

impl Default for EvictionConfig {
	fn default() -> Self {
		EvictionConfig {
			max_grace_period: Duration::from_secs(5 * 60),
			poll_interval: Duration::from_secs(1),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PvcCleanupConfig {
	/// Storage classes for which `delete-pvc-and-pv-with-storage-class` is
	/// honored (spec §4.5 step 4).
	pub allowlisted_storage_classes: Vec<String>,
	/// Global "enable if no custom eviction URL" toggle.
	pub enable_without_custom_eviction_url: bool,
	pub poll_interval: Duration,
	pub poll_timeout: Duration,
	/// Cadence at which a stateful-set-owned pod is re-deleted while
	/// waiting for its claim to be recreated.
	pub pod_recreate_poll_interval: Duration,
	pub pod_recreate_timeout: Duration,
}

impl Default for PvcCleanupConfig {
	fn default() -> Self {
		PvcCleanupConfig {
			allowlisted_storage_classes: Vec::new(),
			enable_without_custom_eviction_url: false,
			poll_interval: Duration::from_secs(1),
			poll_timeout: Duration::from_secs(60),
			pod_recreate_poll_interval: Duration::from_secs(10),
			pod_recreate_timeout: Duration::from_secs(3 * 60),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
	/// `group-runner-period`: candidate runner and drain runner tick cadence.
	pub group_runner_period: Duration,
	/// `scope-analysis-period`: scope observer tick cadence.
	pub scope_analysis_period: Duration,
	/// Per-node wait after becoming a candidate before the drain runner will
	/// act on it.
	pub wait_before_draining: Duration,
	/// `pod-warmup-delay-extension`: nodes younger than this are ignored by
	/// the group registry.
	pub node_warmup_delay: Duration,
	/// `preprovisioning-timeout`.
	pub preprovisioning_timeout: Duration,
	/// `drain-buffer`: default minimum interval between successful drains
	/// within a group.
	pub drain_buffer: Duration,
	/// `eviction-headroom`: additional time added to the max grace period
	/// when computing the overall eviction deadline.
	pub eviction_headroom: Duration,
	/// `min-eviction-timeout`.
	pub min_eviction_timeout: Duration,
	/// How long a node may sit in `drained` before the replace-request label
	/// is applied.
	pub duration_with_completed_status_before_replacement: Duration,
}

impl Default for TimingConfig {
	fn default() -> Self {
		TimingConfig {
			group_runner_period: Duration::from_secs(10),
			scope_analysis_period: Duration::from_secs(30),
			wait_before_draining: Duration::from_secs(30),
			node_warmup_delay: Duration::from_secs(30),
			preprovisioning_timeout: Duration::from_secs(15 * 60),
			drain_buffer: Duration::from_secs(3 * 60),
			eviction_headroom: Duration::from_secs(30),
			min_eviction_timeout: Duration::from_secs(60),
			duration_with_completed_status_before_replacement: Duration::from_secs(10 * 60),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
	/// `max-simultaneous-candidates`: default 1.
	pub max_simultaneous_candidates: u32,
	/// `max-drain-attempts-before-fail`.
	pub max_drain_attempts_before_fail: u32,
}

impl Default for LimitsConfig {
	fn default() -> Self {
		LimitsConfig {
			max_simultaneous_candidates: 1,
			max_drain_attempts_before_fail: 8,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CordonLimiterConfig {
	/// `max-simultaneous-cordon`: cluster-wide ceiling, absolute or percent.
	pub max_simultaneous_cordon: LimitValue,
	/// `max-simultaneous-cordon-for-labels`: per label-combination ceiling,
	/// e.g. `["app", "shard"]` -> ceiling.
	pub max_simultaneous_cordon_for_labels: HashMap<String, LimitValue>,
	/// `max-simultaneous-cordon-for-taints`: per-taint-key ceiling.
	pub max_simultaneous_cordon_for_taints: HashMap<String, LimitValue>,
}

impl Default for CordonLimiterConfig {
	fn default() -> Self {
		CordonLimiterConfig {
			max_simultaneous_cordon: LimitValue::Absolute(1),
			max_simultaneous_cordon_for_labels: HashMap::new(),
			max_simultaneous_cordon_for_taints: HashMap::new(),
		}
	}
}

/// A configured ceiling: either an absolute node count or a percentage of
/// the relevant population.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitValue {
	Absolute(u32),
	Percent(f64),
}

impl LimitValue {
	pub fn resolve(&self, population: u32) -> u32 {
		match self {
			LimitValue::Absolute(n) => *n,
			LimitValue::Percent(p) => ((population as f64) * p / 100.0).floor() as u32,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalBlockerConfig {
	/// `max-notready-nodes`.
	pub max_not_ready_nodes: LimitValue,
	/// `max-pending-pods`.
	pub max_pending_pods: LimitValue,
	/// Polling cadence for each standard blocker.
	pub poll_period: Duration,
}

impl Default for GlobalBlockerConfig {
	fn default() -> Self {
		GlobalBlockerConfig {
			max_not_ready_nodes: LimitValue::Percent(10.0),
			max_pending_pods: LimitValue::Absolute(100),
			poll_period: Duration::from_secs(60),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
	/// `retry-backoff-delay`: base delay `D` used by the static and
	/// exponential strategies.
	pub backoff_delay: Duration,
	/// Strategy used when a node has no annotation override.
	pub default_strategy: RetryStrategyKind,
	/// Number of retries at which the strategy logs a warning (but never
	/// stops retrying).
	pub alert_threshold: u32,
}

impl Default for RetryConfig {
	fn default() -> Self {
		RetryConfig {
			backoff_delay: Duration::from_secs(5 * 60),
			default_strategy: RetryStrategyKind::Exponential,
			alert_threshold: 5,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyKind {
	Static,
	Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
	/// `drain-rate-limit-qps` / `drain-rate-limit-burst`: default condition
	/// rate limiter, overridable per-condition.
	pub drain_qps: f64,
	pub drain_burst: u32,
	/// `drain-sim-rate-limit-ratio`: fraction of the overall client budget
	/// reserved for the drain simulator.
	pub drain_sim_rate_limit_ratio: f64,
}

impl Default for RateLimitConfig {
	fn default() -> Self {
		RateLimitConfig {
			drain_qps: 0.02,
			drain_burst: 1,
			drain_sim_rate_limit_ratio: 0.70,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderElectionConfig {
	pub lease_name: String,
	pub lease_duration: Duration,
	pub renew_deadline: Duration,
	pub retry_period: Duration,
}

impl Default for LeaderElectionConfig {
	fn default() -> Self {
		LeaderElectionConfig {
			lease_name: "node-lifecycle-agent-leader".to_string(),
			lease_duration: Duration::from_secs(15),
			renew_deadline: Duration::from_secs(10),
			retry_period: Duration::from_secs(2),
		}
	}
}

/// One entry of the `node-conditions` flag: a bare condition name, or a name
/// plus a JSON object overriding priority/delay/timeout/rate-limit/force.
///
/// Unknown keys in the JSON object are ignored with a warning (surfaced by
/// the caller after parsing, since this type has no logging dependency).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionConfig {
	pub condition_type: String,
	#[serde(default)]
	pub priority: i32,
	#[serde(default)]
	pub delay: Option<Duration>,
	#[serde(default)]
	pub expected_resolution_time: Option<Duration>,
	#[serde(default)]
	pub rate_limit_qps: Option<f64>,
	#[serde(default)]
	pub force_drain: bool,
	/// `maxAttempts`: overrides `limits.max_drain_attempts_before_fail` for
	/// nodes whose highest-priority offending condition is this one.
	#[serde(default)]
	pub max_attempts: Option<u32>,
}

impl ConditionConfig {
	/// Parses the `name` or `name{json}` syntax from the spec's "Condition
	/// syntax" section. Returns the set of unknown keys found in the JSON
	/// object, if any, so the caller can log a warning without this crate
	/// depending on `tracing`.
	pub fn parse(raw: &str) -> Result<(Self, Vec<String>)> {
		let raw = raw.trim();
		let (name, json_part) = match raw.find('{') {
			Some(idx) => (raw[..idx].trim(), Some(&raw[idx..])),
			None => (raw, None),
		};

		if name.is_empty() {
			return Err(Error::config("condition name must not be empty"));
		}

		let mut cfg = ConditionConfig {
			condition_type: name.to_string(),
			priority: 0,
			delay: None,
			expected_resolution_time: None,
			rate_limit_qps: None,
			force_drain: false,
			max_attempts: None,
		};

		let mut unknown = Vec::new();
		if let Some(json_part) = json_part {
			let value: serde_json::Value = serde_json::from_str(json_part)
				.map_err(|err| Error::config(format!("invalid condition json: {err}")))?;
			let obj = value
				.as_object()
				.ok_or_else(|| Error::config("condition override must be a json object"))?;

			for (key, val) in obj {
				match key.as_str() {
					"priority" => {
						cfg.priority = val.as_i64().unwrap_or(0) as i32;
					}
					"delay" => {
						cfg.delay = val.as_str().and_then(parse_duration_str);
					}
					"expectedResolutionTime" => {
						cfg.expected_resolution_time = val.as_str().and_then(parse_duration_str);
					}
					"rateLimitQPS" => {
						cfg.rate_limit_qps = val.as_f64();
					}
					"forceDrain" => {
						cfg.force_drain = val.as_bool().unwrap_or(false);
					}
					"maxAttempts" => {
						cfg.max_attempts = val.as_u64().map(|n| n as u32);
					}
					other => unknown.push(other.to_string()),
				}
			}
		}

		Ok((cfg, unknown))
	}
}

/// Parses durations like `30s`, `5m`, `1h` — the same shorthand `humantime`
/// would accept, kept hand-rolled here to avoid an extra dependency for a
/// single-purpose parser.
fn parse_duration_str(s: &str) -> Option<Duration> {
	let s = s.trim();
	let (num_part, unit) = s.split_at(s.find(|c: char| !c.is_ascii_digit() && c != '.')?);
	let n: f64 = num_part.parse().ok()?;
	let secs = match unit {
		"ms" => n / 1000.0,
		"s" => n,
		"m" => n * 60.0,
		"h" => n * 3600.0,
		_ => return None,
	};
	Some(Duration::from_secs_f64(secs))
}

impl Config {
	/// Loads configuration from an optional set of file paths (later paths
	/// override earlier ones) layered over the built-in defaults.
	pub async fn load(paths: &[impl AsRef<Path>]) -> Result<Self> {
		let mut builder = config::Config::builder()
			.add_source(config::Config::try_from(&Config::default()).map_err(|err| {
				Error::config(format!("failed to serialize default config: {err}"))
			})?);

		for path in paths {
			let path = path.as_ref();
			builder = builder.add_source(config::File::from(path).required(true));
		}

		let built = builder
			.build()
			.map_err(|err| Error::config(format!("failed to build config: {err}")))?;

		let cfg: Config = built
			.try_deserialize()
			.map_err(|err| Error::config(format!("failed to deserialize config: {err}")))?;

		cfg.validate()?;
		Ok(cfg)
	}

	pub fn validate(&self) -> Result<()> {
		if self.config_name.trim().is_empty() {
			return Err(Error::config("config-name must not be empty"));
		}
		if self.limits.max_simultaneous_candidates == 0 {
			return Err(Error::config(
				"max-simultaneous-candidates must be at least 1",
			));
		}
		for cond in &self.node_conditions {
			if cond.condition_type.trim().is_empty() {
				return Err(Error::config("node-conditions entry has an empty name"));
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[test]
	fn default_config_validates() {
		assert!(Config::default().validate().is_ok());
	}

	#[test]
	fn empty_config_name_is_rejected() {
		let mut cfg = Config::default();
		cfg.config_name = "".to_string();
		assert!(cfg.validate().is_err());
	}

	#[rstest]
	#[case("disk-issue", "disk-issue", 0, false)]
	#[case(
		r#"disk-issue{"priority": 5, "forceDrain": true}"#,
		"disk-issue",
		5,
		true
	)]
	fn parses_bare_and_overridden_conditions(
		#[case] raw: &str,
		#[case] expected_name: &str,
		#[case] expected_priority: i32,
		#[case] expected_force: bool,
	) {
		let (cfg, unknown) = ConditionConfig::parse(raw).unwrap();
		assert_eq!(cfg.condition_type, expected_name);
		assert_eq!(cfg.priority, expected_priority);
		assert_eq!(cfg.force_drain, expected_force);
		assert!(unknown.is_empty());
	}

	#[test]
	fn unknown_condition_keys_are_reported_not_rejected() {
		let (_, unknown) = ConditionConfig::parse(r#"disk-issue{"bogus": 1}"#).unwrap();
		assert_eq!(unknown, vec!["bogus".to_string()]);
	}

	#[test]
	fn empty_condition_name_is_rejected() {
		assert!(ConditionConfig::parse("").is_err());
		assert!(ConditionConfig::parse(r#"{"priority": 1}"#).is_err());
	}

	#[test]
	fn limit_value_resolves_percent_and_absolute() {
		assert_eq!(LimitValue::Absolute(5).resolve(100), 5);
		assert_eq!(LimitValue::Percent(10.0).resolve(100), 10);
		assert_eq!(LimitValue::Percent(5.0).resolve(19), 0);
	}
}
