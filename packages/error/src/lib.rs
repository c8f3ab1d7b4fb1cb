//! Error taxonomy for the node lifecycle agent.
//!
//! One enum, classified the way the rest of the crate graph expects: each
//! variant knows whether it is retryable, terminal, or merely structured
//! telemetry (filter/limiter rejections are not errors at all, but callers
//! that thread `Result` through still need a place to put them).

use std::time::SystemTime;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	/// Invalid flags, malformed condition JSON, an empty group key where an
	/// override was expected. Fatal at startup.
	#[error("configuration error: {0}")]
	Configuration(String),

	/// Conflict, too-many-requests, network error from the cluster API.
	/// Retried with exponential backoff at the nearest loop.
	#[error("transient cluster api error: {0}")]
	Transient(#[from] kube::Error),

	/// Treated as success or as "nothing to do", depending on context.
	#[error("object not found: {0}")]
	NotFound(String),

	/// Recorded as a drain failure; increments the retry wall.
	#[error("eviction blocked: {0}")]
	EvictionBlocked(String),

	/// The drain overran its deadline. Incremented in the retry wall; the
	/// node taint is reset to permit future re-candidacy.
	#[error("drain timed out after {0:?}")]
	Timeout(std::time::Duration),

	/// Rejection with a reason string. Never mutates cluster state.
	#[error("simulation failed: {0}")]
	SimulationFail(String),

	/// Drain attempts exceeded `max-drain-attempts-before-fail`. The node
	/// remains failed until a human clears the `DrainFailure` condition.
	#[error("drain attempts exhausted after {attempts} tries: {reason}")]
	Terminal { attempts: u32, reason: String },

	#[error("{0}")]
	Other(String),
}

impl Error {
	pub fn config(msg: impl Into<String>) -> Self {
		Error::Configuration(msg.into())
	}

	pub fn other(msg: impl Into<String>) -> Self {
		Error::Other(msg.into())
	}

	/// Any error that the nearest calling loop should retry without
	/// escalating; never propagates out of a runner loop (spec §7
	/// "Propagation").
	pub fn is_retryable(&self) -> bool {
		match self {
			Error::Transient(_) => true,
			Error::Timeout(_) => true,
			Error::EvictionBlocked(_) => true,
			_ => false,
		}
	}

	/// `NotFound` is success-or-noop depending on context; never itself a
	/// reason to increment the retry wall.
	pub fn is_not_found(&self) -> bool {
		matches!(self, Error::NotFound(_))
	}

	/// Drain attempts exceeded the configured ceiling: the node is excluded
	/// from future candidacy until a human clears `DrainFailure`.
	pub fn is_terminal(&self) -> bool {
		matches!(self, Error::Terminal { .. })
	}

	/// Only leader-level failures (lost election, fatal panic) terminate the
	/// process; configuration errors are fatal at startup.
	pub fn is_fatal(&self) -> bool {
		matches!(self, Error::Configuration(_))
	}
}

/// Classifies a raw `kube::Error` the way `nla-drainer` needs to: does it map
/// to "not found" (treat as success), "too many requests" (budget exhausted,
/// caller should back off and retry), or something else.
pub fn classify_api_error(err: &kube::Error) -> ApiErrorClass {
	if let kube::Error::Api(resp) = err {
		match resp.code {
			404 => ApiErrorClass::NotFound,
			409 => ApiErrorClass::Conflict,
			429 => ApiErrorClass::TooManyRequests,
			_ => ApiErrorClass::Other,
		}
	} else {
		ApiErrorClass::Other
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
	NotFound,
	Conflict,
	TooManyRequests,
	Other,
}

/// Milliseconds since the Unix epoch, used throughout for heartbeat
/// timestamps stored in the `DrainFailure` condition and the drain buffer.
pub fn now_millis() -> i64 {
	SystemTime::now()
		.duration_since(SystemTime::UNIX_EPOCH)
		.unwrap_or_else(|err| unreachable!("time is broken: {}", err))
		.as_millis()
		.try_into()
		.expect("timestamp does not fit in i64")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn transient_errors_are_retryable() {
		let err = Error::Timeout(std::time::Duration::from_secs(5));
		assert!(err.is_retryable());
		assert!(!err.is_terminal());
	}

	#[test]
	fn terminal_errors_are_not_retryable() {
		let err = Error::Terminal {
			attempts: 5,
			reason: "disk-issue".into(),
		};
		assert!(err.is_terminal());
		assert!(!err.is_retryable());
	}

	#[test]
	fn configuration_errors_are_fatal() {
		assert!(Error::config("empty group key").is_fatal());
		assert!(!Error::NotFound("node/foo".into()).is_fatal());
	}
}
