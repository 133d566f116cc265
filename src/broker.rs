//! Credential pipeline glue: exchange, validate, cache, and materialize per caller.

// self
use crate::{
	_prelude::*,
	auth::{Region, UpstreamToken},
	cache::SignerCache,
	exchange::{CredentialExchanger, ReqwestExchangeClient},
	keys::Keypair,
	materialize::{
		Capability, CredentialBundle, MaterializedSigner, Materializer, RequestSigner,
		SigningSession,
	},
	obs::{self, BrokerStage},
};

/// Broker specialized for the crate's default reqwest exchange client.
pub type ReqwestBroker = Broker<ReqwestExchangeClient>;

/// Owns the process keypair, the exchanger, the materializer, and the signer cache.
///
/// Sessions are cached per upstream token identifier and shared across regions; callers never
/// see another caller's session because the cache key is derived from their own token.
pub struct Broker<X = ReqwestExchangeClient>
where
	X: ?Sized + CredentialExchanger,
{
	/// Process-lifetime keypair every credential is bound to.
	pub keypair: Arc<Keypair>,
	/// Exchanger contacted on cache misses.
	pub exchanger: Arc<X>,
	/// Materializer shaping sessions for each call path.
	pub materializer: Materializer,
	cache: SignerCache<SigningSession>,
}
impl<X> Broker<X>
where
	X: ?Sized + CredentialExchanger,
{
	/// Creates a broker with an empty cache and the default refresh window.
	pub fn new(keypair: impl Into<Arc<Keypair>>, exchanger: impl Into<Arc<X>>) -> Self {
		Self {
			keypair: keypair.into(),
			exchanger: exchanger.into(),
			materializer: Materializer::default(),
			cache: SignerCache::new(),
		}
	}

	/// Replaces the materializer.
	pub fn with_materializer(mut self, materializer: Materializer) -> Self {
		self.materializer = materializer;

		self
	}

	/// Overrides the cache's pre-emptive refresh window.
	pub fn with_refresh_window(mut self, window: Duration) -> Self {
		self.cache = self.cache.with_refresh_window(window);

		self
	}

	/// Signer cache.
	pub fn cache(&self) -> &SignerCache<SigningSession> {
		&self.cache
	}

	/// Returns the caller's cached session, exchanging on a miss or near expiry.
	pub async fn session(&self, token: &UpstreamToken) -> Result<Arc<SigningSession>> {
		let id = token.id().clone();
		let exchanger = Arc::clone(&self.exchanger);
		let keypair = Arc::clone(&self.keypair);
		let materializer = self.materializer.clone();
		let token = token.clone();
		let create = move || async move {
			let credential = exchanger.exchange(&token, keypair.binding()).await?;

			materializer.session(credential, keypair)
		};

		obs::observe(BrokerStage::Cache, "session", self.cache.get_or_create(&id, create)).await
	}

	/// Returns an in-process signer for `region`.
	pub async fn signer(&self, token: &UpstreamToken, region: &Region) -> Result<RequestSigner> {
		Ok(self.session(token).await?.for_region(region.clone()))
	}

	/// Writes a credential bundle for one CLI invocation in `region`.
	pub async fn bundle(&self, token: &UpstreamToken, region: &Region) -> Result<CredentialBundle> {
		let session = self.session(token).await?;

		self.materializer.bundle_for(&session, region)
	}

	/// Materializes the caller's session in the shape `capability` asks for.
	pub async fn materialize(
		&self,
		token: &UpstreamToken,
		region: &Region,
		capability: Capability,
	) -> Result<MaterializedSigner> {
		match capability {
			Capability::InProcess =>
				self.signer(token, region).await.map(MaterializedSigner::InProcess),
			Capability::Bundle => self.bundle(token, region).await.map(MaterializedSigner::Bundle),
		}
	}

	/// Drops the caller's cached session after the downstream rejected it.
	pub fn invalidate(&self, token: &UpstreamToken) -> bool {
		self.cache.invalidate(token.id())
	}

	/// Evicts expired sessions now; every cache miss already does the same.
	pub fn purge_expired(&self) -> usize {
		self.cache.purge_expired()
	}
}
impl<X> Debug for Broker<X>
where
	X: ?Sized + CredentialExchanger,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Broker")
			.field("keypair", &self.keypair)
			.field("materializer", &self.materializer)
			.field("cache", &self.cache)
			.finish()
	}
}
