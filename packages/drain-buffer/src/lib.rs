//! Drain Buffer (spec §4.8): a minimum wall-clock interval between the end
//! of one successful drain and the start of the next, per group, persisted
//! across process restarts in a cluster configuration object.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nla_error::{Error, Result};
use nla_k8s::ClusterClient;
use serde::{Deserialize, Serialize};

const CONFIG_KEY: &str = "drain-buffer-state";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Entry {
	pub last_drain: DateTime<Utc>,
	pub buffer: Duration,
}

impl Entry {
	fn is_expired(&self, now: DateTime<Utc>) -> bool {
		self.next_drain() < now
	}

	fn next_drain(&self) -> DateTime<Utc> {
		self.last_drain + chrono::Duration::from_std(self.buffer).unwrap_or_default()
	}
}

#[derive(Default, Serialize, Deserialize)]
struct PersistedState {
	entries: HashMap<String, PersistedEntry>,
}

#[derive(Serialize, Deserialize, Clone)]
struct PersistedEntry {
	last_drain_millis: i64,
	buffer_secs: u64,
}

impl From<&Entry> for PersistedEntry {
	fn from(e: &Entry) -> Self {
		PersistedEntry {
			last_drain_millis: e.last_drain.timestamp_millis(),
			buffer_secs: e.buffer.as_secs(),
		}
	}
}

impl PersistedEntry {
	fn to_entry(&self) -> Option<Entry> {
		Some(Entry {
			last_drain: DateTime::from_timestamp_millis(self.last_drain_millis)?,
			buffer: Duration::from_secs(self.buffer_secs),
		})
	}
}

pub struct DrainBuffer<C: ClusterClient> {
	client: std::sync::Arc<C>,
	entries: RwLock<HashMap<String, Entry>>,
}

impl<C: ClusterClient> DrainBuffer<C> {
	pub fn new(client: std::sync::Arc<C>) -> Self {
		DrainBuffer {
			client,
			entries: RwLock::new(HashMap::new()),
		}
	}

	/// Loads state from the backing configuration object. Must run after
	/// the cache has synced; the caller retries on a 1-second cadence until
	/// this succeeds (spec §4.8 `Initialize`).
	pub async fn initialize(&self) -> Result<()> {
		let Some(raw) = self.client.get_config_object(CONFIG_KEY).await? else {
			return Ok(());
		};
		let persisted: PersistedState = serde_json::from_str(&raw)
			.map_err(|err| Error::config(format!("corrupt drain buffer state: {err}")))?;
		let mut entries = self.entries.write().unwrap();
		for (key, entry) in persisted.entries {
			if let Some(entry) = entry.to_entry() {
				entries.insert(key, entry);
			}
		}
		Ok(())
	}

	/// Records a successful drain for `group_key` (spec §4.8
	/// `NoteSuccessfulDrain`).
	pub fn note_successful_drain(&self, group_key: &str, buffer: Duration, now: DateTime<Utc>) {
		self.entries.write().unwrap().insert(
			group_key.to_string(),
			Entry {
				last_drain: now,
				buffer,
			},
		);
	}

	/// `lastDrain + bufferDuration`, or the Unix epoch if there is no
	/// record — the group is immediately eligible (spec §4.8 `NextDrain`).
	pub fn next_drain(&self, group_key: &str) -> DateTime<Utc> {
		self.entries
			.read()
			.unwrap()
			.get(group_key)
			.map(|e| e.next_drain())
			.unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap())
	}

	/// Prunes expired entries, then persists the full map — the background
	/// loop spec §4.8 runs every 20 seconds. Pruning and persisting are
	/// idempotent: re-running with the same input yields the same stored
	/// state (spec §8 round-trip law).
	pub async fn persist(&self, now: DateTime<Utc>) -> Result<()> {
		let snapshot = {
			let mut entries = self.entries.write().unwrap();
			entries.retain(|_, e| !e.is_expired(now));
			entries.clone()
		};

		let persisted = PersistedState {
			entries: snapshot
				.iter()
				.map(|(k, v)| (k.clone(), PersistedEntry::from(v)))
				.collect(),
		};
		let raw = serde_json::to_string(&persisted)
			.map_err(|err| Error::config(format!("failed to serialize drain buffer state: {err}")))?;
		self.client.put_config_object(CONFIG_KEY, &raw).await
	}

	/// Runs the persistence loop until `shutdown` is cancelled (spec §4.8
	/// "background loop every 20 seconds").
	pub async fn run_persistence_loop(&self, shutdown: tokio_util::sync::CancellationToken) {
		let mut ticker = tokio::time::interval(Duration::from_secs(20));
		loop {
			tokio::select! {
				_ = shutdown.cancelled() => return,
				_ = ticker.tick() => {
					if let Err(err) = self.persist(Utc::now()).await {
						tracing::error!(%err, "failed to persist drain buffer state");
					}
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use nla_k8s::test_support::FakeClient;
	use std::sync::Arc;

	#[test]
	fn next_drain_with_no_record_is_immediately_eligible() {
		let buffer = DrainBuffer::new(Arc::new(FakeClient::new()));
		let now = Utc::now();
		assert!(buffer.next_drain("group-a") < now);
	}

	#[test]
	fn note_success_pushes_next_drain_into_the_future() {
		let buffer = DrainBuffer::new(Arc::new(FakeClient::new()));
		let now = Utc::now();
		buffer.note_successful_drain("group-a", Duration::from_secs(180), now);
		assert!(buffer.next_drain("group-a") >= now + chrono::Duration::seconds(180));
	}

	#[tokio::test]
	async fn persist_then_initialize_round_trips() {
		let client = Arc::new(FakeClient::new());
		let now = Utc::now();
		{
			let buffer = DrainBuffer::new(client.clone());
			buffer.note_successful_drain("group-a", Duration::from_secs(600), now);
			buffer.persist(now).await.unwrap();
		}

		let reloaded = DrainBuffer::new(client.clone());
		reloaded.initialize().await.unwrap();
		let expected = now + chrono::Duration::seconds(600);
		let got = reloaded.next_drain("group-a");
		assert!((got - expected).num_seconds().abs() <= 1);
	}

	#[tokio::test]
	async fn persist_prunes_expired_entries() {
		let client = Arc::new(FakeClient::new());
		let past = Utc::now() - chrono::Duration::hours(1);
		let buffer = DrainBuffer::new(client.clone());
		buffer.note_successful_drain("group-a", Duration::from_secs(1), past);
		buffer.persist(Utc::now()).await.unwrap();

		let reloaded = DrainBuffer::new(client);
		reloaded.initialize().await.unwrap();
		assert!(reloaded.next_drain("group-a") < Utc::now());
	}
}
