//! RFC 8693 token exchange against the upstream identity provider.
//!
//! [`TokenExchangeClient`] discovers the token endpoint, posts the exchange with the broker's
//! public-key binding, and verifies the returned session token against the provider's JWKS
//! before any claim is trusted. Discovery and JWKS documents are reused for their advertised
//! lifetime; nothing else is cached here and nothing is retried.

pub mod discovery;
pub mod jwks;

pub use discovery::DiscoveryDocument;

// crates.io
use base64::{Engine as _, engine::general_purpose::STANDARD};
use jsonwebtoken::jwk::JwkSet;
use oauth2::{
	ClientId, ClientSecret, HttpRequest, HttpResponse,
	http::{
		Method, Request,
		header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
	},
};
use url::form_urlencoded::Serializer;
// self
use crate::{
	_prelude::*,
	auth::UpstreamToken,
	credential::{ExchangedCredential, SessionClaims},
	error::ConfigError,
	exchange::{
		discovery::CachedDocument,
		jwks::KeyLookup,
	},
	http::{
		self, BrokerHttpClient, DEFAULT_HTTP_TIMEOUT, ReqwestHttpClient,
		ReqwestTransportErrorMapper, TransportErrorMapper,
	},
	keys::PublicKeyBinding,
	obs::{self, BrokerStage},
	provider::{ProviderDescriptor, TOKEN_EXCHANGE_GRANT, TokenTypes, validate_endpoint},
};

/// Longest provider body excerpt carried by [`Error::ExchangeRejected`].
pub const BODY_PREVIEW_LIMIT: usize = 512;

/// Boxed future returned by [`CredentialExchanger::exchange`].
pub type ExchangeFuture<'a> =
	Pin<Box<dyn Future<Output = Result<ExchangedCredential>> + 'a + Send>>;

/// Exchange client specialized for the crate's default reqwest transport stack.
pub type ReqwestExchangeClient =
	TokenExchangeClient<ReqwestHttpClient, ReqwestTransportErrorMapper>;

/// Converts an upstream bearer token into a key-bound downstream session credential.
pub trait CredentialExchanger
where
	Self: 'static + Send + Sync,
{
	/// Performs one exchange binding the result to `binding`; never retries.
	fn exchange<'a>(
		&'a self,
		token: &'a UpstreamToken,
		binding: &'a PublicKeyBinding,
	) -> ExchangeFuture<'a>;
}

#[derive(Deserialize)]
struct ExchangeResponse {
	token: String,
}

/// HTTP exchange client bound to one provider descriptor and client registration.
pub struct TokenExchangeClient<C = ReqwestHttpClient, M = ReqwestTransportErrorMapper>
where
	C: ?Sized + BrokerHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Provider descriptor that defines discovery, token types, and cache lifetimes.
	pub descriptor: ProviderDescriptor,
	/// HTTP client wrapper used for every outbound provider request.
	pub http_client: Arc<C>,
	/// Mapper applied to transport-layer errors before surfacing them to callers.
	pub transport_mapper: Arc<M>,
	client_id: ClientId,
	client_secret: ClientSecret,
	discovery: CachedDocument<DiscoveryDocument>,
	jwks: CachedDocument<JwkSet>,
}
impl<C, M> TokenExchangeClient<C, M>
where
	C: ?Sized + BrokerHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Creates a client that reuses the caller-provided transport + mapper pair.
	pub fn with_http_client(
		descriptor: ProviderDescriptor,
		client_id: impl Into<String>,
		client_secret: impl Into<String>,
		http_client: impl Into<Arc<C>>,
		mapper: impl Into<Arc<M>>,
	) -> Self {
		Self {
			descriptor,
			http_client: http_client.into(),
			transport_mapper: mapper.into(),
			client_id: ClientId::new(client_id.into()),
			client_secret: ClientSecret::new(client_secret.into()),
			discovery: Default::default(),
			jwks: Default::default(),
		}
	}

	/// Returns the (possibly cached) discovery document.
	pub async fn discovery(&self) -> Result<Arc<DiscoveryDocument>> {
		self.discovery
			.get_or_fetch(|| obs::observe(BrokerStage::Discovery, "fetch", self.fetch_discovery()))
			.await
	}

	async fn exchange_once(
		&self,
		token: &UpstreamToken,
		binding: &PublicKeyBinding,
	) -> Result<ExchangedCredential> {
		let discovery = self.discovery().await?;
		let request = exchange_request(
			&discovery.token_endpoint,
			&self.client_id,
			&self.client_secret,
			&self.descriptor.token_types,
			token,
			binding,
		)?;
		let response = http::send(&*self.http_client, &*self.transport_mapper, "token", request)
			.await
			.map_err(Error::unavailable)?;
		let body = ensure_success(response)?;
		let parsed: ExchangeResponse = parse_json("token exchange response", &body)?;
		let session_token = parsed.token.trim();

		if session_token.is_empty() {
			return Err(Error::malformed("token exchange response carries an empty `token`"));
		}

		let verification = self.verify(session_token, &discovery);
		let claims = obs::observe(BrokerStage::Jwks, "verify", verification).await?;

		Ok(ExchangedCredential::new(session_token, binding.clone(), claims))
	}

	async fn verify(
		&self,
		session_token: &str,
		discovery: &DiscoveryDocument,
	) -> Result<SessionClaims> {
		let (algorithm, kid) = jwks::token_header(session_token)?;
		let jwks_uri = self.jwks_uri(discovery)?;
		let fetch = || self.fetch_jwks(jwks_uri);
		let keys = self.jwks.get_or_fetch(fetch).await?;

		if let KeyLookup::Found(jwk) = jwks::find_key(&keys, kid.as_deref())? {
			return jwks::verify(session_token, algorithm, jwk, self.descriptor.leeway);
		}

		obs::event!(info, kid = kid.as_deref(), "unknown signing key, refreshing the key set");

		let rotated = self.jwks.refetch_unless_replaced(&keys, fetch).await?;

		match jwks::find_key(&rotated, kid.as_deref())? {
			KeyLookup::Found(jwk) =>
				jwks::verify(session_token, algorithm, jwk, self.descriptor.leeway),
			KeyLookup::UnknownKid(kid) => Err(Error::CredentialUnverified {
				reason: format!("no published signing key matches kid `{kid}`"),
			}),
		}
	}

	fn jwks_uri<'a>(&'a self, discovery: &'a DiscoveryDocument) -> Result<&'a Url> {
		self.descriptor.jwks_uri.as_ref().or(discovery.jwks_uri.as_ref()).ok_or_else(|| {
			Error::CredentialUnverified { reason: "the provider advertises no `jwks_uri`".into() }
		})
	}

	async fn fetch_discovery(&self) -> Result<(DiscoveryDocument, Duration)> {
		let (document, ttl) = self
			.fetch_document::<DiscoveryDocument>("discovery", &self.descriptor.discovery_url)
			.await?;

		validate_endpoint("token", &document.token_endpoint)
			.map_err(|e| Error::malformed(e.to_string()))?;

		if let Some(jwks_uri) = document.jwks_uri.as_ref() {
			validate_endpoint("jwks", jwks_uri).map_err(|e| Error::malformed(e.to_string()))?;
		}

		Ok((document, ttl))
	}

	async fn fetch_jwks(&self, jwks_uri: &Url) -> Result<(JwkSet, Duration)> {
		self.fetch_document::<JwkSet>("jwks", jwks_uri).await
	}

	async fn fetch_document<T>(&self, endpoint: &'static str, url: &Url) -> Result<(T, Duration)>
	where
		T: for<'de> Deserialize<'de>,
	{
		let request = Request::builder()
			.method(Method::GET)
			.uri(url.as_str())
			.header(ACCEPT, "application/json")
			.body(Vec::new())
			.map_err(ConfigError::from)?;
		let response = http::send(&*self.http_client, &*self.transport_mapper, endpoint, request)
			.await
			.map_err(Error::unavailable)?;
		let ttl = http::cache_max_age(response.headers()).unwrap_or(self.descriptor.metadata_ttl);
		let body = ensure_success(response)?;
		let document = parse_json(endpoint, &body)?;

		Ok((document, ttl))
	}
}
impl TokenExchangeClient<ReqwestHttpClient, ReqwestTransportErrorMapper> {
	/// Creates a client with its own reqwest transport (rustls, no redirects, default timeout).
	pub fn new(
		descriptor: ProviderDescriptor,
		client_id: impl Into<String>,
		client_secret: impl Into<String>,
	) -> Result<Self, ConfigError> {
		Ok(Self::with_http_client(
			descriptor,
			client_id,
			client_secret,
			ReqwestHttpClient::new(DEFAULT_HTTP_TIMEOUT)?,
			ReqwestTransportErrorMapper,
		))
	}
}
impl<C, M> CredentialExchanger for TokenExchangeClient<C, M>
where
	C: ?Sized + BrokerHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn exchange<'a>(
		&'a self,
		token: &'a UpstreamToken,
		binding: &'a PublicKeyBinding,
	) -> ExchangeFuture<'a> {
		Box::pin(obs::observe(
			BrokerStage::Exchange,
			"exchange",
			self.exchange_once(token, binding),
		))
	}
}
impl<C, M> Debug for TokenExchangeClient<C, M>
where
	C: ?Sized + BrokerHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TokenExchangeClient")
			.field("descriptor", &self.descriptor)
			.field("client_id", &self.client_id.as_str())
			.field("client_secret", &"<redacted>")
			.finish()
	}
}

/// Encodes the exchange form body.
pub(crate) fn exchange_form(
	token_types: &TokenTypes,
	subject_token: &str,
	binding: &PublicKeyBinding,
) -> String {
	Serializer::new(String::new())
		.append_pair("grant_type", TOKEN_EXCHANGE_GRANT)
		.append_pair("requested_token_type", &token_types.requested)
		.append_pair("public_key", binding.as_str())
		.append_pair("subject_token", subject_token)
		.append_pair("subject_token_type", &token_types.subject)
		.finish()
}

fn exchange_request(
	token_endpoint: &Url,
	client_id: &ClientId,
	client_secret: &ClientSecret,
	token_types: &TokenTypes,
	token: &UpstreamToken,
	binding: &PublicKeyBinding,
) -> Result<HttpRequest> {
	let credentials = STANDARD.encode(format!("{}:{}", client_id.as_str(), client_secret.secret()));
	let body = exchange_form(token_types, token.raw().expose(), binding);

	Ok(Request::builder()
		.method(Method::POST)
		.uri(token_endpoint.as_str())
		.header(AUTHORIZATION, format!("Basic {credentials}"))
		.header(CONTENT_TYPE, "application/x-www-form-urlencoded")
		.header(ACCEPT, "application/json")
		.body(body.into_bytes())
		.map_err(ConfigError::from)?)
}

fn ensure_success(response: HttpResponse) -> Result<Vec<u8>> {
	let status = response.status();
	let body = response.into_body();

	if status.is_success() {
		Ok(body)
	} else {
		Err(Error::ExchangeRejected { status: status.as_u16(), body: body_preview(&body) })
	}
}

fn parse_json<T>(what: &str, body: &[u8]) -> Result<T>
where
	T: for<'de> Deserialize<'de>,
{
	let mut deserializer = serde_json::Deserializer::from_slice(body);

	serde_path_to_error::deserialize(&mut deserializer).map_err(|e| Error::malformed_json(what, e))
}

/// Lossy UTF-8 excerpt of a provider body, truncated on a character boundary.
pub(crate) fn body_preview(body: &[u8]) -> String {
	let text = String::from_utf8_lossy(body);
	let text = text.trim();

	match text.char_indices().nth(BODY_PREVIEW_LIMIT) {
		Some((end, _)) => format!("{}…", &text[..end]),
		None => text.to_owned(),
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::_preludet::*;

	#[test]
	fn exchange_form_carries_every_parameter() {
		let keypair = test_keypair();
		let form = exchange_form(&TokenTypes::default(), "subject.jwt.value", keypair.binding());
		let pairs: HashMap<String, String> =
			url::form_urlencoded::parse(form.as_bytes()).into_owned().collect();

		assert_eq!(pairs["grant_type"], "urn:ietf:params:oauth:grant-type:token-exchange");
		assert_eq!(pairs["requested_token_type"], "urn:oci:token-type:oci-upst");
		assert_eq!(pairs["public_key"], keypair.public_key_der_base64());
		assert_eq!(pairs["subject_token"], "subject.jwt.value");
		assert_eq!(pairs["subject_token_type"], "jwt");
	}

	#[test]
	fn exchange_request_uses_basic_client_auth() {
		let token = upstream_token("alice", "tenantA", "jti-form");
		let endpoint =
			Url::parse("https://idcs.example.com/oauth2/v1/token").expect("URL should parse.");
		let request = exchange_request(
			&endpoint,
			&ClientId::new(CLIENT_ID.into()),
			&ClientSecret::new(CLIENT_SECRET.into()),
			&TokenTypes::default(),
			&token,
			test_keypair().binding(),
		)
		.expect("Exchange request should build.");

		assert_eq!(request.method(), Method::POST);
		assert_eq!(
			request.headers()[AUTHORIZATION],
			format!("Basic {}", STANDARD.encode("broker-client:broker-secret")).as_str()
		);
		assert_eq!(request.headers()[CONTENT_TYPE], "application/x-www-form-urlencoded");
	}

	#[test]
	fn debug_output_names_the_client_but_hides_its_secret() {
		let rendered = format!("{:?}", build_reqwest_test_exchange_client("https://127.0.0.1:9"));

		assert!(rendered.contains(CLIENT_ID));
		assert!(!rendered.contains(CLIENT_SECRET));
		assert!(rendered.contains("<redacted>"));
	}

	#[test]
	fn body_preview_truncates_long_bodies() {
		let long = "é".repeat(BODY_PREVIEW_LIMIT + 10);
		let preview = body_preview(long.as_bytes());

		assert_eq!(preview.chars().count(), BODY_PREVIEW_LIMIT + 1);
		assert_eq!(
			body_preview(b"  {\"error\":\"invalid_grant\"}\n"),
			"{\"error\":\"invalid_grant\"}"
		);
	}
}
