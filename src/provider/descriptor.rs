//! Provider descriptor data structures shared by the exchange client.

/// Builder API for assembling provider descriptors.
pub mod builder;

pub use builder::*;

// self
use crate::_prelude::*;

/// Grant type sent with every exchange request.
pub const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
/// Token type requested from the provider by default.
pub const OCI_UPST_TOKEN_TYPE: &str = "urn:oci:token-type:oci-upst";
/// Type label of the inbound subject token by default.
pub const JWT_SUBJECT_TOKEN_TYPE: &str = "jwt";

/// Token types negotiated during the exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTypes {
	/// `requested_token_type` form parameter.
	pub requested: String,
	/// `subject_token_type` form parameter.
	pub subject: String,
}
impl Default for TokenTypes {
	fn default() -> Self {
		Self { requested: OCI_UPST_TOKEN_TYPE.into(), subject: JWT_SUBJECT_TOKEN_TYPE.into() }
	}
}

/// Immutable provider descriptor consumed by the exchange client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
	/// OpenID discovery document location.
	pub discovery_url: Url,
	/// Explicit JWKS location; overrides the discovered `jwks_uri` when set.
	pub jwks_uri: Option<Url>,
	/// Token types sent with the exchange.
	pub token_types: TokenTypes,
	/// Reuse window for discovery and JWKS documents that carry no `Cache-Control: max-age`.
	pub metadata_ttl: Duration,
	/// Clock skew tolerated when validating session-token timestamps.
	pub leeway: Duration,
}
impl ProviderDescriptor {
	/// Default reuse window for discovery and JWKS documents.
	pub const DEFAULT_METADATA_TTL: Duration = Duration::hours(1);
	/// Default clock-skew tolerance.
	pub const DEFAULT_LEEWAY: Duration = Duration::seconds(30);

	/// Creates a new builder.
	pub fn builder() -> ProviderDescriptorBuilder {
		ProviderDescriptorBuilder::new()
	}

	/// Shortcut for an identity domain with default settings.
	pub fn for_domain(domain: &str) -> Result<Self, ProviderDescriptorError> {
		Self::builder().domain(domain).build()
	}
}
