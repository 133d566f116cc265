//! Expiry-aware, single-flight memo of signing sessions keyed by token identifier.
//!
//! Reads of fresh entries only take a shared lock. A miss either joins the creation already in
//! flight for that key or starts one on a spawned task, so a caller giving up does not tear down
//! a creation other callers are waiting on. Everyone who joined a flight receives its outcome,
//! success or failure; failures are not memoized past the flight. Each miss also evicts expired
//! entries, so memory stays bounded by live sessions without an external sweeper.

mod metrics;

pub use metrics::CacheMetrics;

// std
use std::panic;
// crates.io
use tokio::sync::watch;
// self
use crate::{_prelude::*, auth::TokenId};

/// Values that stop being usable at a known instant.
pub trait Expiring {
	/// Instant after which the value must not be used.
	fn expires_at(&self) -> OffsetDateTime;
}

type Outcome<V> = Option<Result<Arc<V>>>;

struct CacheState<V> {
	entries: RwLock<HashMap<TokenId, Arc<V>>>,
	flights: Mutex<HashMap<TokenId, watch::Receiver<Outcome<V>>>>,
}

enum Lookup<V> {
	Cached(Arc<V>),
	Join(watch::Receiver<Outcome<V>>),
	Lead(watch::Sender<Outcome<V>>),
}

/// Removes a finished (or panicked) flight from the in-flight map.
struct Landing<V> {
	state: Arc<CacheState<V>>,
	id: TokenId,
}
impl<V> Drop for Landing<V> {
	fn drop(&mut self) {
		self.state.flights.lock().remove(&self.id);
	}
}

/// Signer cache owned by the broker and shared by reference.
pub struct SignerCache<V> {
	state: Arc<CacheState<V>>,
	refresh_window: Duration,
	metrics: Arc<CacheMetrics>,
}
impl<V> SignerCache<V>
where
	V: 'static + Expiring + Send + Sync,
{
	/// Entries closer than this to their expiry are re-created.
	pub const DEFAULT_REFRESH_WINDOW: Duration = Duration::seconds(60);
	/// Largest accepted refresh window.
	pub const MAX_REFRESH_WINDOW: Duration = Duration::days(1);

	/// Creates an empty cache with the default refresh window.
	pub fn new() -> Self {
		Self {
			state: Arc::new(CacheState {
				entries: RwLock::new(HashMap::new()),
				flights: Mutex::new(HashMap::new()),
			}),
			refresh_window: Self::DEFAULT_REFRESH_WINDOW,
			metrics: Default::default(),
		}
	}

	/// Overrides the pre-emptive refresh window, clamped to `0..=MAX_REFRESH_WINDOW`.
	pub fn with_refresh_window(mut self, window: Duration) -> Self {
		self.refresh_window = window.clamp(Duration::ZERO, Self::MAX_REFRESH_WINDOW);

		self
	}

	/// Shared counters.
	pub fn metrics(&self) -> &Arc<CacheMetrics> {
		&self.metrics
	}

	/// Configured refresh window.
	pub fn refresh_window(&self) -> Duration {
		self.refresh_window
	}

	/// Returns the entry for `id` when it is still fresh at `now`.
	pub fn get_at(&self, id: &TokenId, now: OffsetDateTime) -> Option<Arc<V>> {
		let edge = now.checked_add(self.refresh_window)?;

		self.state.entries.read().get(id).filter(|value| edge < value.expires_at()).cloned()
	}

	/// Returns the entry for `id` when it is still fresh.
	pub fn get(&self, id: &TokenId) -> Option<Arc<V>> {
		self.get_at(id, OffsetDateTime::now_utc())
	}

	/// Returns the fresh entry for `id`, or runs `create` exactly once across concurrent callers.
	///
	/// Callers arriving while a creation is in flight wait for it and receive its outcome, even
	/// when the created value already sits inside the refresh window or the creation failed.
	pub async fn get_or_create<F, Fut>(&self, id: &TokenId, create: F) -> Result<Arc<V>>
	where
		F: FnOnce() -> Fut,
		Fut: 'static + Future<Output = Result<V>> + Send,
	{
		if let Some(value) = self.get(id) {
			self.metrics.record_hit();

			return Ok(value);
		}

		match self.lookup(id) {
			Lookup::Cached(value) => {
				self.metrics.record_hit();

				Ok(value)
			},
			Lookup::Join(flight) => {
				self.metrics.record_hit();

				Self::join(flight).await
			},
			Lookup::Lead(flight) => {
				self.metrics.record_miss();
				self.purge_expired();

				self.spawn_creation(id.clone(), flight, create()).await
			},
		}
	}

	/// Drops the entry for `id`; returns `true` when one existed.
	pub fn invalidate(&self, id: &TokenId) -> bool {
		let removed = self.state.entries.write().remove(id).is_some();

		if removed {
			self.metrics.record_invalidation();

			crate::obs::event!(info, token_id = %id, "signer cache entry invalidated");
		}

		removed
	}

	/// Evicts entries expired at `now`.
	pub fn purge_expired_at(&self, now: OffsetDateTime) -> usize {
		let purged = {
			let mut entries = self.state.entries.write();
			let before = entries.len();

			entries.retain(|_, value| now < value.expires_at());

			before - entries.len()
		};

		if purged > 0 {
			self.metrics.record_evictions(purged as u64);

			crate::obs::event!(debug, purged, "expired signer cache entries purged");
		}

		purged
	}

	/// Evicts expired entries; also runs on every miss.
	pub fn purge_expired(&self) -> usize {
		self.purge_expired_at(OffsetDateTime::now_utc())
	}

	/// Number of entries currently held, fresh or not.
	pub fn len(&self) -> usize {
		self.state.entries.read().len()
	}

	/// Returns `true` when no entries are held.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Joins the flight for `id`, or registers a new one this caller leads.
	fn lookup(&self, id: &TokenId) -> Lookup<V> {
		let mut flights = self.state.flights.lock();

		if let Some(flight) = flights.get(id) {
			return Lookup::Join(flight.clone());
		}
		// A flight lands its entry before leaving the map.
		if let Some(value) = self.get(id) {
			return Lookup::Cached(value);
		}

		let (sender, receiver) = watch::channel(None);

		flights.insert(id.clone(), receiver);

		Lookup::Lead(sender)
	}

	async fn join(mut flight: watch::Receiver<Outcome<V>>) -> Result<Arc<V>> {
		let outcome = match flight.wait_for(Option::is_some).await {
			Ok(outcome) => (*outcome).clone(),
			Err(_) => None,
		};

		outcome.unwrap_or(Err(Error::Cancelled))
	}

	async fn spawn_creation<Fut>(
		&self,
		id: TokenId,
		flight: watch::Sender<Outcome<V>>,
		creation: Fut,
	) -> Result<Arc<V>>
	where
		Fut: 'static + Future<Output = Result<V>> + Send,
	{
		let landing = Landing { state: Arc::clone(&self.state), id };
		let task = tokio::spawn(async move {
			let outcome = creation.await.map(Arc::new);

			if let Ok(value) = &outcome {
				landing.state.entries.write().insert(landing.id.clone(), Arc::clone(value));
			}

			flight.send_replace(Some(outcome.clone()));
			drop(landing);

			outcome
		});

		match task.await {
			Ok(outcome) => outcome,
			Err(e) if e.is_panic() => panic::resume_unwind(e.into_panic()),
			Err(_) => Err(Error::Cancelled),
		}
	}
}
impl<V> Default for SignerCache<V>
where
	V: 'static + Expiring + Send + Sync,
{
	fn default() -> Self {
		Self::new()
	}
}
impl<V> Debug for SignerCache<V> {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("SignerCache")
			.field("entries", &self.state.entries.read().len())
			.field("in_flight", &self.state.flights.lock().len())
			.field("refresh_window", &self.refresh_window)
			.field("metrics", &self.metrics)
			.finish()
	}
}
