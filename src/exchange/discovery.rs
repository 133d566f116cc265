//! OpenID discovery document and the reusable TTL cache shared with the JWKS.

// crates.io
use time::PrimitiveDateTime;
// self
use crate::_prelude::*;

/// Subset of the OpenID discovery document the exchange needs.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct DiscoveryDocument {
	/// Issuer identifier.
	#[serde(default)]
	pub issuer: Option<String>,
	/// Token endpoint receiving the exchange POST.
	pub token_endpoint: Url,
	/// JWKS location used to verify exchanged session tokens.
	#[serde(default)]
	pub jwks_uri: Option<Url>,
}

struct Cached<T> {
	value: Arc<T>,
	expires_at: OffsetDateTime,
}

/// Time-bounded memo of a fetched document with collapsed concurrent refreshes.
pub(crate) struct CachedDocument<T> {
	slot: RwLock<Option<Cached<T>>>,
	refresh: AsyncMutex<()>,
}
impl<T> CachedDocument<T>
where
	T: Send + Sync,
{
	/// Returns the cached value while `now` is before its expiry.
	pub(crate) fn fresh(&self, now: OffsetDateTime) -> Option<Arc<T>> {
		self.slot
			.read()
			.as_ref()
			.filter(|cached| now < cached.expires_at)
			.map(|cached| Arc::clone(&cached.value))
	}

	/// Serves the cached value or runs `fetch`; `fetch` yields the value and its lifetime.
	pub(crate) async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Result<Arc<T>>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<(T, Duration)>>,
	{
		if let Some(value) = self.fresh(OffsetDateTime::now_utc()) {
			return Ok(value);
		}

		let _guard = self.refresh.lock().await;

		if let Some(value) = self.fresh(OffsetDateTime::now_utc()) {
			return Ok(value);
		}

		self.store(fetch().await?)
	}

	/// Re-fetches unless another caller already replaced `seen` while this one waited.
	pub(crate) async fn refetch_unless_replaced<F, Fut>(
		&self,
		seen: &Arc<T>,
		fetch: F,
	) -> Result<Arc<T>>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<(T, Duration)>>,
	{
		let _guard = self.refresh.lock().await;
		let replaced = self
			.slot
			.read()
			.as_ref()
			.map(|cached| Arc::clone(&cached.value))
			.filter(|current| !Arc::ptr_eq(current, seen));

		if let Some(current) = replaced {
			return Ok(current);
		}

		self.store(fetch().await?)
	}

	fn store(&self, (value, ttl): (T, Duration)) -> Result<Arc<T>> {
		let value = Arc::new(value);
		let ttl = if ttl.is_negative() { Duration::ZERO } else { ttl };
		let expires_at = expires_after(OffsetDateTime::now_utc(), ttl);

		*self.slot.write() = Some(Cached { value: Arc::clone(&value), expires_at });

		Ok(value)
	}
}
impl<T> Default for CachedDocument<T> {
	fn default() -> Self {
		Self { slot: RwLock::new(None), refresh: AsyncMutex::new(()) }
	}
}

/// `now + ttl`, saturating at the latest representable instant.
fn expires_after(now: OffsetDateTime, ttl: Duration) -> OffsetDateTime {
	now.checked_add(ttl).unwrap_or(PrimitiveDateTime::MAX.assume_utc())
}
