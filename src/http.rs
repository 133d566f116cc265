//! Transport primitives for provider and policy calls.
//!
//! The module exposes [`BrokerHttpClient`] alongside [`ResponseMetadata`] and
//! [`ResponseMetadataSlot`] so embedders can plug in custom HTTP clients without losing the
//! broker's error classification. Implementations call [`ResponseMetadataSlot::take`] before
//! dispatching a request and [`ResponseMetadataSlot::store`] once an HTTP status is known,
//! enabling [`TransportErrorMapper`] to classify failures with consistent metadata.

// std
use std::ops::Deref;
// crates.io
use oauth2::{AsyncHttpClient, HttpClientError, HttpRequest, HttpResponse};
use reqwest::redirect::Policy;
// self
use crate::{
	_prelude::*,
	error::{ConfigError, TransportError},
};

/// Longest lifetime honored from a `Cache-Control: max-age` directive.
pub const MAX_METADATA_TTL: Duration = Duration::days(1);

/// Default request timeout for provider and policy calls.
pub const DEFAULT_HTTP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Abstraction over HTTP transports used for discovery, JWKS, token exchange, and policy calls.
///
/// The trait is the broker's only dependency on an HTTP stack for those peers. Callers provide
/// an implementation (typically behind `Arc<T>`) and the broker requests short-lived
/// [`AsyncHttpClient`] handles that each carry a clone of a [`ResponseMetadataSlot`]. Handles
/// must own whatever state their request futures need so those futures stay `Send`.
pub trait BrokerHttpClient
where
	Self: 'static + Send + Sync,
{
	/// Concrete error emitted by the underlying transport.
	type TransportError: 'static + Send + Sync + StdError;

	/// [`AsyncHttpClient`] handle tied to a [`ResponseMetadataSlot`].
	type Handle: for<'c> AsyncHttpClient<
			'c,
			Error = HttpClientError<Self::TransportError>,
			Future: 'c + Send,
		>
		+ 'static
		+ Send
		+ Sync;

	/// Builds an [`AsyncHttpClient`] handle that records outcomes in `slot`.
	///
	/// # Metadata Contract
	///
	/// - Call [`ResponseMetadataSlot::take`] before submitting the HTTP request so stale
	///   information never leaks across attempts.
	/// - Once an HTTP response provides status headers, save them with
	///   [`ResponseMetadataSlot::store`].
	fn with_metadata(&self, slot: ResponseMetadataSlot) -> Self::Handle;
}

/// Maps HTTP transport failures into [`TransportError`] values.
pub trait TransportErrorMapper<E>
where
	Self: 'static + Send + Sync,
	E: 'static + Send + Sync + StdError,
{
	/// Converts an [`HttpClientError`] emitted while calling `endpoint`.
	fn map_transport_error(
		&self,
		endpoint: &'static str,
		metadata: Option<&ResponseMetadata>,
		error: HttpClientError<E>,
	) -> TransportError;
}

/// Default mapper for reqwest-backed transports.
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransportErrorMapper;
impl TransportErrorMapper<ReqwestError> for ReqwestTransportErrorMapper {
	fn map_transport_error(
		&self,
		endpoint: &'static str,
		meta: Option<&ResponseMetadata>,
		err: HttpClientError<ReqwestError>,
	) -> TransportError {
		match err {
			HttpClientError::Reqwest(inner) if inner.is_timeout() =>
				TransportError::Timeout { endpoint },
			HttpClientError::Reqwest(inner) => TransportError::network(endpoint, *inner),
			HttpClientError::Http(inner) => TransportError::Request(inner),
			HttpClientError::Io(inner) => TransportError::Io(inner),
			HttpClientError::Other(message) =>
				TransportError::Other { message: describe(meta, &message) },
			_ => TransportError::Other { message: describe(meta, "unknown transport failure") },
		}
	}
}

/// Captures metadata from the most recent HTTP response for error mapping.
#[derive(Clone, Debug, Default)]
pub struct ResponseMetadata {
	/// HTTP status code returned by the peer, if available.
	pub status: Option<u16>,
}

/// Thread-safe slot for sharing [`ResponseMetadata`] between transport and error layers.
#[derive(Clone, Debug, Default)]
pub struct ResponseMetadataSlot(Arc<Mutex<Option<ResponseMetadata>>>);
impl ResponseMetadataSlot {
	/// Stores new metadata for the current request.
	pub fn store(&self, meta: ResponseMetadata) {
		*self.0.lock() = Some(meta);
	}

	/// Returns the captured metadata, if any, consuming it from the slot.
	pub fn take(&self) -> Option<ResponseMetadata> {
		self.0.lock().take()
	}
}

/// Thin wrapper around [`ReqwestClient`] so shared HTTP behavior lives in one place.
///
/// Provider calls must not follow redirects: discovery, JWKS, and token endpoints answer
/// directly, and a redirect would forward client credentials to another origin. Configure any
/// custom [`ReqwestClient`] passed to [`with_client`](Self::with_client) the same way.
#[derive(Clone)]
pub struct ReqwestHttpClient(pub ReqwestClient);
impl ReqwestHttpClient {
	/// Builds a rustls-backed client with redirects disabled and the provided request timeout.
	pub fn new(timeout: std::time::Duration) -> Result<Self, ConfigError> {
		let client = ReqwestClient::builder().redirect(Policy::none()).timeout(timeout).build()?;

		Ok(Self(client))
	}

	/// Wraps an existing reqwest [`ReqwestClient`].
	pub fn with_client(client: ReqwestClient) -> Self {
		Self(client)
	}

	/// Builds an instrumented HTTP client that captures response metadata.
	pub(crate) fn instrumented(&self, slot: ResponseMetadataSlot) -> InstrumentedHandle {
		InstrumentedHandle::new(self.0.clone(), slot)
	}
}
impl AsRef<ReqwestClient> for ReqwestHttpClient {
	fn as_ref(&self) -> &ReqwestClient {
		&self.0
	}
}
impl Deref for ReqwestHttpClient {
	type Target = ReqwestClient;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}
impl BrokerHttpClient for ReqwestHttpClient {
	type Handle = InstrumentedHandle;
	type TransportError = ReqwestError;

	fn with_metadata(&self, slot: ResponseMetadataSlot) -> Self::Handle {
		self.instrumented(slot)
	}
}
impl Debug for ReqwestHttpClient {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("ReqwestHttpClient(..)")
	}
}

/// Instrumented adapter that implements [`AsyncHttpClient`] for reqwest.
pub(crate) struct InstrumentedHttpClient {
	client: ReqwestClient,
	slot: ResponseMetadataSlot,
}

/// Handle returned by [`ReqwestHttpClient`] that satisfies [`BrokerHttpClient`].
#[derive(Clone)]
pub struct InstrumentedHandle(Arc<InstrumentedHttpClient>);
impl InstrumentedHandle {
	fn new(client: ReqwestClient, slot: ResponseMetadataSlot) -> Self {
		Self(Arc::new(InstrumentedHttpClient { client, slot }))
	}
}
impl<'c> AsyncHttpClient<'c> for InstrumentedHandle {
	type Error = HttpClientError<ReqwestError>;
	type Future =
		Pin<Box<dyn Future<Output = Result<HttpResponse, Self::Error>> + 'c + Send + Sync>>;

	fn call(&'c self, request: HttpRequest) -> Self::Future {
		let client = Arc::clone(&self.0);

		Box::pin(async move {
			client.slot.take();

			let response = client
				.client
				.execute(request.try_into().map_err(Box::new)?)
				.await
				.map_err(Box::new)?;
			let status = response.status();
			let headers = response.headers().to_owned();

			client.slot.store(ResponseMetadata { status: Some(status.as_u16()) });

			let mut response_new =
				HttpResponse::new(response.bytes().await.map_err(Box::new)?.to_vec());

			*response_new.status_mut() = status;
			*response_new.headers_mut() = headers;

			Ok(response_new)
		})
	}
}

/// Dispatches `request` through a fresh metadata slot and maps transport failures.
pub(crate) async fn send<C, M>(
	http_client: &C,
	mapper: &M,
	endpoint: &'static str,
	request: HttpRequest,
) -> Result<HttpResponse, TransportError>
where
	C: ?Sized + BrokerHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	let slot = ResponseMetadataSlot::default();
	let handle = http_client.with_metadata(slot.clone());

	match handle.call(request).await {
		Ok(response) => Ok(response),
		Err(err) => Err(mapper.map_transport_error(endpoint, slot.take().as_ref(), err)),
	}
}

/// Reads the `max-age` directive of a `Cache-Control` header, capped at [`MAX_METADATA_TTL`].
pub(crate) fn cache_max_age(headers: &oauth2::http::HeaderMap) -> Option<Duration> {
	let value = headers.get(oauth2::http::header::CACHE_CONTROL)?.to_str().ok()?;

	value.split(',').find_map(|directive| {
		let (name, secs) = directive.trim().split_once('=')?;

		if !name.trim().eq_ignore_ascii_case("max-age") {
			return None;
		}

		let secs = secs.trim().trim_matches('"').parse::<u64>().ok()?;

		Some(Duration::seconds(secs.min(MAX_METADATA_TTL.whole_seconds() as u64) as i64))
	})
}

fn describe(meta: Option<&ResponseMetadata>, message: &str) -> String {
	match meta.and_then(|meta| meta.status) {
		Some(status) => format!("{message} (HTTP {status})"),
		None => message.to_owned(),
	}
}

#[cfg(test)]
mod tests {
	// crates.io
	use oauth2::http::{HeaderMap as HttpHeaderMap, HeaderValue, header::CACHE_CONTROL};
	// self
	use super::*;

	#[test]
	fn cache_control_max_age_is_extracted() {
		let mut headers = HttpHeaderMap::new();

		headers.insert(
			CACHE_CONTROL,
			HeaderValue::from_static("public, max-age=120, must-revalidate"),
		);

		assert_eq!(cache_max_age(&headers), Some(Duration::seconds(120)));

		headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));

		assert_eq!(cache_max_age(&headers), None);
	}

	#[test]
	fn oversized_max_age_is_capped() {
		let mut headers = HttpHeaderMap::new();

		headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=999999999999"));

		assert_eq!(cache_max_age(&headers), Some(MAX_METADATA_TTL));

		headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=-5"));

		assert_eq!(cache_max_age(&headers), None);
	}

	#[test]
	fn other_errors_include_the_observed_status() {
		let meta = ResponseMetadata { status: Some(502) };
		let err = ReqwestTransportErrorMapper.map_transport_error(
			"token",
			Some(&meta),
			HttpClientError::Other("upstream closed".into()),
		);

		assert!(matches!(
			err,
			TransportError::Other { message } if message == "upstream closed (HTTP 502)"
		));
	}
}
