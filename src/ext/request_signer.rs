//! Request signing contract that lets callers sign requests built with any HTTP client.

/// Describes how to authorize an outbound request without constraining the HTTP client type.
///
/// [`RequestSigner`](crate::materialize::RequestSigner) implements it for `reqwest` requests and
/// for the `http` crate's `Request<Vec<u8>>`; other clients can provide their own adapters.
pub trait RequestSignerExt<Request, Error>
where
	Self: Send + Sync,
{
	/// Consumes the provided request and returns it with signature headers attached.
	fn sign_request(&self, request: Request) -> Result<Request, Error>;
}
