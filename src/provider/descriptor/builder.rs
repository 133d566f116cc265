//! Builder and validation for [`ProviderDescriptor`] values.

// self
use crate::{
	_prelude::*,
	provider::{ProviderDescriptor, TokenTypes},
};

/// Errors raised while constructing or validating descriptors.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum ProviderDescriptorError {
	/// Neither a domain nor an explicit discovery URL was supplied.
	#[error("Missing identity domain or discovery endpoint.")]
	MissingDiscoveryEndpoint,
	/// The identity domain cannot form a URL host.
	#[error("Identity domain `{domain}` is not a valid host.")]
	InvalidDomain {
		/// Domain that failed validation.
		domain: String,
	},
	/// Endpoints must use HTTPS outside loopback hosts.
	#[error("The {endpoint} endpoint must use HTTPS: {url}.")]
	InsecureEndpoint {
		/// Which endpoint failed validation.
		endpoint: &'static str,
		/// Endpoint URL that failed validation.
		url: String,
	},
	/// Token type labels must be non-empty.
	#[error("The {field} token type cannot be empty.")]
	EmptyTokenType {
		/// Which token type was empty.
		field: &'static str,
	},
	/// Durations must not be negative.
	#[error("The {field} duration cannot be negative.")]
	NegativeDuration {
		/// Which duration failed validation.
		field: &'static str,
	},
}

/// Builder for [`ProviderDescriptor`] values.
#[derive(Debug, Default)]
pub struct ProviderDescriptorBuilder {
	/// Identity domain host (for example `idcs-abc.identity.oraclecloud.com`).
	pub domain: Option<String>,
	/// Explicit discovery document location; wins over `domain`.
	pub discovery_url: Option<Url>,
	/// Optional JWKS override.
	pub jwks_uri: Option<Url>,
	/// Token types sent with the exchange.
	pub token_types: TokenTypes,
	/// Optional discovery/JWKS reuse window.
	pub metadata_ttl: Option<Duration>,
	/// Optional clock-skew tolerance.
	pub leeway: Option<Duration>,
}
impl ProviderDescriptorBuilder {
	/// Creates an empty builder.
	pub fn new() -> Self {
		Self::default()
	}

	/// Sets the identity domain; discovery resolves to
	/// `https://<domain>/.well-known/openid-configuration`.
	pub fn domain(mut self, domain: impl Into<String>) -> Self {
		self.domain = Some(domain.into());

		self
	}

	/// Sets an explicit discovery document URL.
	pub fn discovery_url(mut self, url: Url) -> Self {
		self.discovery_url = Some(url);

		self
	}

	/// Pins the JWKS location instead of trusting the discovered `jwks_uri`.
	pub fn jwks_uri(mut self, url: Url) -> Self {
		self.jwks_uri = Some(url);

		self
	}

	/// Overrides the requested token type.
	pub fn requested_token_type(mut self, token_type: impl Into<String>) -> Self {
		self.token_types.requested = token_type.into();

		self
	}

	/// Overrides the subject token type.
	pub fn subject_token_type(mut self, token_type: impl Into<String>) -> Self {
		self.token_types.subject = token_type.into();

		self
	}

	/// Overrides the discovery/JWKS reuse window.
	pub fn metadata_ttl(mut self, ttl: Duration) -> Self {
		self.metadata_ttl = Some(ttl);

		self
	}

	/// Overrides the clock-skew tolerance.
	pub fn leeway(mut self, leeway: Duration) -> Self {
		self.leeway = Some(leeway);

		self
	}

	/// Consumes the builder and validates the resulting descriptor.
	pub fn build(self) -> Result<ProviderDescriptor, ProviderDescriptorError> {
		let discovery_url = match (self.discovery_url, self.domain) {
			(Some(url), _) => url,
			(None, Some(domain)) => discovery_for_domain(&domain)?,
			(None, None) => return Err(ProviderDescriptorError::MissingDiscoveryEndpoint),
		};
		let descriptor = ProviderDescriptor {
			discovery_url,
			jwks_uri: self.jwks_uri,
			token_types: self.token_types,
			metadata_ttl: self.metadata_ttl.unwrap_or(ProviderDescriptor::DEFAULT_METADATA_TTL),
			leeway: self.leeway.unwrap_or(ProviderDescriptor::DEFAULT_LEEWAY),
		};

		descriptor.validate()?;

		Ok(descriptor)
	}
}

impl ProviderDescriptor {
	/// Validates invariants for the descriptor.
	fn validate(&self) -> Result<(), ProviderDescriptorError> {
		validate_endpoint("discovery", &self.discovery_url)?;

		if let Some(jwks) = self.jwks_uri.as_ref() {
			validate_endpoint("jwks", jwks)?;
		}
		if self.token_types.requested.trim().is_empty() {
			return Err(ProviderDescriptorError::EmptyTokenType { field: "requested" });
		}
		if self.token_types.subject.trim().is_empty() {
			return Err(ProviderDescriptorError::EmptyTokenType { field: "subject" });
		}
		if self.metadata_ttl.is_negative() {
			return Err(ProviderDescriptorError::NegativeDuration { field: "metadata_ttl" });
		}
		if self.leeway.is_negative() {
			return Err(ProviderDescriptorError::NegativeDuration { field: "leeway" });
		}

		Ok(())
	}
}

/// Accepts HTTPS everywhere and plain HTTP only for loopback hosts.
pub(crate) fn validate_endpoint(
	name: &'static str,
	url: &Url,
) -> Result<(), ProviderDescriptorError> {
	let loopback = matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"));

	match url.scheme() {
		"https" => Ok(()),
		"http" if loopback => Ok(()),
		_ =>
			Err(ProviderDescriptorError::InsecureEndpoint { endpoint: name, url: url.to_string() }),
	}
}

fn discovery_for_domain(domain: &str) -> Result<Url, ProviderDescriptorError> {
	let domain = domain.trim().trim_start_matches("https://").trim_end_matches('/');
	let invalid = || ProviderDescriptorError::InvalidDomain { domain: domain.to_owned() };

	if domain.is_empty()
		|| domain.contains(['/', '?', '#', '@'])
		|| domain.contains(char::is_whitespace)
	{
		return Err(invalid());
	}

	Url::parse(&format!("https://{domain}/.well-known/openid-configuration")).map_err(|_| invalid())
}
