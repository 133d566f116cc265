//! Activity counters for the signer cache.

// std
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters for signer cache activity.
#[derive(Debug, Default)]
pub struct CacheMetrics {
	hits: AtomicU64,
	misses: AtomicU64,
	invalidations: AtomicU64,
	evictions: AtomicU64,
}
impl CacheMetrics {
	/// Returns the number of lookups served from a fresh entry.
	pub fn hits(&self) -> u64 {
		self.hits.load(Ordering::Relaxed)
	}

	/// Returns the number of creations started because no fresh entry existed.
	pub fn misses(&self) -> u64 {
		self.misses.load(Ordering::Relaxed)
	}

	/// Returns the number of entries dropped through
	/// [`invalidate`](crate::cache::SignerCache::invalidate).
	pub fn invalidations(&self) -> u64 {
		self.invalidations.load(Ordering::Relaxed)
	}

	/// Returns the number of expired entries purged.
	pub fn evictions(&self) -> u64 {
		self.evictions.load(Ordering::Relaxed)
	}

	pub(crate) fn record_hit(&self) {
		self.hits.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_miss(&self) {
		self.misses.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_invalidation(&self) {
		self.invalidations.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_evictions(&self, count: u64) {
		self.evictions.fetch_add(count, Ordering::Relaxed);
	}
}
