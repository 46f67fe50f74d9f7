//! Content-addressed cache of execution results, keyed by the SHA-256 of the
//! submitted source. A hit replays the exact bytes a prior run produced
//! without touching the executor at all; a miss runs for real and, if it
//! completed cleanly, captures the output for the next caller with the same
//! source.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::error::ExecutionError;
use crate::executor::Executor;
use crate::sink::{CaptureSink, Sink, TeeSink};

struct CacheEntry {
	body: Vec<u8>,
	last_access: Instant,
	access_count: u64,
}

/// Only successful, un-truncated-by-error runs are cached: a `NonZeroExit`
/// or setup failure might be transient (resource pressure, a flaky runner),
/// so it is never memoized — the next identical submission gets a fresh
/// attempt. A `Timeout` is not cached either, for the same reason. Output
/// that hit the truncation cap but otherwise ran to completion is cached
/// as-is, truncation marker included, since that outcome is deterministic.
pub struct ResultCache {
	executor: Executor,
	entries: RwLock<HashMap<String, CacheEntry>>,
	max_size: usize,
	ttl: Duration,
}

impl ResultCache {
	pub fn new(executor: Executor, max_size: usize, ttl: Duration) -> Arc<Self> {
		Arc::new(ResultCache {
			executor,
			entries: RwLock::new(HashMap::new()),
			max_size,
			ttl,
		})
	}

	pub fn key_for(source: &str) -> String {
		let mut hasher = Sha256::new();
		hasher.update(source.as_bytes());
		hex::encode(hasher.finalize())
	}

	/// Serves `source` from cache if present, otherwise runs it through the
	/// executor with `sink` tee'd into a capture buffer, inserting the
	/// capture into the cache on a clean completion.
	pub async fn run(self: &Arc<Self>, source: &str, sink: &mut dyn Sink, timeout: Duration) -> Result<(), ExecutionError> {
		let key = Self::key_for(source);
		if let Some(body) = self.lookup(&key) {
			return sink.write_chunk(Bytes::from(body)).await.map_err(ExecutionError::Io);
		}

		let mut capture = CaptureSink::default();
		let result = {
			let mut tee = TeeSink {
				primary: sink,
				capture: &mut capture,
			};
			self.executor.execute(source, &mut tee, timeout).await
		};

		if result.is_ok() {
			self.insert(key, capture.0);
		}
		result
	}

	/// Clones out a hit's bytes under a short-lived read lock, then updates
	/// the entry's access bookkeeping on a spawned task (taking the write
	/// lock there instead) so the caller isn't held up waiting for stats that
	/// don't affect what gets streamed back, and so concurrent reads are
	/// never serialized against each other. An entry whose `last_access` is
	/// already past `ttl` is treated as a miss even if the background
	/// sweeper hasn't reclaimed it yet.
	fn lookup(self: &Arc<Self>, key: &str) -> Option<Vec<u8>> {
		let body = {
			let entries = self.entries.read();
			let entry = entries.get(key)?;
			if Instant::now().saturating_duration_since(entry.last_access) > self.ttl {
				return None;
			}
			entry.body.clone()
		};
		let cache = Arc::clone(self);
		let key = key.to_string();
		tokio::spawn(async move {
			let mut entries = cache.entries.write();
			if let Some(entry) = entries.get_mut(&key) {
				entry.last_access = Instant::now();
				entry.access_count += 1;
			}
		});
		Some(body)
	}

	fn insert(&self, key: String, body: Vec<u8>) {
		let mut entries = self.entries.write();
		if entries.len() >= self.max_size && !entries.contains_key(&key) {
			if let Some(victim) = entries.iter().min_by_key(|(_, e)| e.last_access).map(|(k, _)| k.clone()) {
				entries.remove(&victim);
			}
		}
		let now = Instant::now();
		entries.insert(
			key,
			CacheEntry {
				body,
				last_access: now,
				access_count: 1,
			},
		);
	}

	pub fn len(&self) -> usize {
		self.entries.read().len()
	}

	/// Expires entries whose `last_access` is already past `ttl`. `lookup`
	/// enforces the same cutoff per-access; this just reclaims the memory of
	/// entries nobody has asked for since.
	fn sweep(&self) {
		let now = Instant::now();
		let ttl = self.ttl;
		self.entries.write().retain(|_, entry| now.saturating_duration_since(entry.last_access) < ttl);
	}

	/// Spawns the background sweeper that expires entries older than `ttl`,
	/// checking at half the TTL so no entry outlives it by more than that
	/// margin. Runs until the process exits; there is no explicit shutdown
	/// handle because the sweep only ever touches its own in-memory map.
	pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
		let cache = Arc::clone(self);
		let period = cache.ttl / 2;
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(period.max(Duration::from_secs(1)));
			loop {
				interval.tick().await;
				cache.sweep();
			}
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn test_executor() -> Executor {
		Executor::new(std::path::PathBuf::from("go"), std::env::temp_dir(), 1_000_000)
	}

	#[test]
	fn key_is_stable_and_content_addressed() {
		assert_eq!(ResultCache::key_for("abc"), ResultCache::key_for("abc"));
		assert_ne!(ResultCache::key_for("abc"), ResultCache::key_for("abcd"));
	}

	#[tokio::test]
	async fn hit_replays_bytes_without_calling_the_executor() {
		let cache = ResultCache::new(test_executor(), 10, Duration::from_secs(60));
		cache.insert(ResultCache::key_for("package main"), b"cached output".to_vec());
		let mut sink = CaptureSink::default();
		let result = cache.run("package main", &mut sink, Duration::from_secs(1)).await;
		assert!(result.is_ok());
		assert_eq!(sink.0, b"cached output");
	}

	#[tokio::test]
	async fn eviction_drops_the_least_recently_used_entry() {
		let cache = ResultCache::new(test_executor(), 2, Duration::from_secs(60));
		cache.insert("a".to_string(), b"1".to_vec());
		tokio::time::sleep(Duration::from_millis(5)).await;
		cache.insert("b".to_string(), b"2".to_vec());
		assert_eq!(cache.len(), 2);
		cache.insert("c".to_string(), b"3".to_vec());
		assert_eq!(cache.len(), 2);
		let entries = cache.entries.read();
		assert!(!entries.contains_key("a"));
		assert!(entries.contains_key("c"));
	}

	#[tokio::test]
	async fn sweep_expires_entries_past_ttl() {
		let cache = ResultCache::new(test_executor(), 10, Duration::from_millis(1));
		cache.insert("a".to_string(), b"1".to_vec());
		tokio::time::sleep(Duration::from_millis(20)).await;
		cache.sweep();
		assert_eq!(cache.len(), 0);
	}

	#[test]
	fn a_fresh_insert_starts_at_access_count_one() {
		let cache = ResultCache::new(test_executor(), 10, Duration::from_secs(60));
		cache.insert("a".to_string(), b"1".to_vec());
		assert_eq!(cache.entries.read().get("a").unwrap().access_count, 1);
	}

	#[tokio::test]
	async fn lookup_treats_a_stale_entry_as_a_miss_even_before_the_sweeper_runs() {
		let cache = ResultCache::new(test_executor(), 10, Duration::from_millis(1));
		let key = ResultCache::key_for("package main");
		cache.insert(key, b"stale output".to_vec());
		tokio::time::sleep(Duration::from_millis(20)).await;
		// Entry is still present (the sweeper hasn't run), but must not be
		// served as a hit since it is past its TTL.
		assert_eq!(cache.len(), 1);
		assert!(cache.lookup(&ResultCache::key_for("package main")).is_none());
	}
}
