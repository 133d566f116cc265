//! Broker-level error types shared by the exchange, materialization, and tool layers.

// self
use crate::_prelude::*;

/// Broker-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub(crate) type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Canonical broker error exposed by public APIs.
///
/// None of the variants carry private keys or raw session tokens; provider bodies and CLI stderr
/// are carried verbatim because callers need them for diagnosis. Sources sit behind [`Arc`] so a
/// failed credential creation can be handed to every caller waiting on it.
#[derive(Clone, Debug, ThisError)]
pub enum Error {
	/// No usable inbound bearer token accompanied the call.
	#[error("Authentication is missing: {reason}.")]
	AuthenticationMissing {
		/// Why the inbound token was not accepted.
		reason: String,
	},
	/// The identity provider could not be reached (network, TLS, timeout).
	#[error("Token exchange is unavailable.")]
	ExchangeUnavailable(#[source] Arc<TransportError>),
	/// The identity provider answered with a non-success status.
	#[error("Token exchange was rejected with HTTP {status}: {body}.")]
	ExchangeRejected {
		/// HTTP status returned by the provider.
		status: u16,
		/// Provider error body (truncated).
		body: String,
	},
	/// The identity provider answered with a body the broker cannot interpret.
	#[error("Token exchange returned a malformed response: {reason}.")]
	ExchangeMalformedResponse {
		/// Human-readable reason, including the failing JSON path when known.
		reason: String,
		/// Structured parsing failure, when available.
		#[source]
		source: Option<SharedError>,
	},
	/// The exchanged session token failed signature or claim verification.
	#[error("Exchanged credential could not be verified: {reason}.")]
	CredentialUnverified {
		/// Verification failure summary.
		reason: String,
	},
	/// The exchanged credential omits a claim required for materialization.
	#[error("Exchanged credential is missing the `{claim}` claim.")]
	CredentialIncomplete {
		/// Name of the missing claim.
		claim: &'static str,
	},
	/// Writing the on-disk credential bundle failed.
	#[error("Credential bundle could not be materialized.")]
	Bundle(#[source] Arc<std::io::Error>),
	/// Downstream API call or CLI invocation failed.
	#[error("Downstream call failed: {detail}.")]
	DownstreamCallFailed {
		/// HTTP status for SDK-style calls.
		status: Option<u16>,
		/// Process exit code for CLI-style calls.
		exit_code: Option<i32>,
		/// Provider error body or CLI stderr.
		detail: String,
	},
	/// The downstream CLI could not be started.
	#[error("Failed to spawn `{binary}`.")]
	CommandSpawn {
		/// Binary that failed to start.
		binary: String,
		/// Underlying process error.
		#[source]
		source: Arc<std::io::Error>,
	},
	/// The requested command was rejected before execution.
	#[error("Invalid command: {reason}.")]
	InvalidCommand {
		/// Validation failure summary.
		reason: String,
	},
	/// The authorization hook denied the operation.
	#[error("Policy `{package}/{rule}` denied the operation.")]
	PolicyDenied {
		/// Policy package consulted.
		package: String,
		/// Rule consulted.
		rule: String,
	},
	/// The authorization hook could not produce a decision.
	#[error("Policy evaluation failed: {reason}.")]
	PolicyEvaluationFailed {
		/// Failure summary.
		reason: String,
		/// Underlying transport or parsing failure, when available.
		#[source]
		source: Option<SharedError>,
	},
	/// Keypair generation, encoding, or signing failed.
	#[error(transparent)]
	Key(Arc<crate::keys::KeyError>),
	/// Local configuration problem.
	#[error(transparent)]
	Config(Arc<ConfigError>),
	/// A shared credential creation was torn down before it finished.
	#[error("Credential creation was cancelled.")]
	Cancelled,
}
impl Error {
	/// Stable label used by [`ToolFailure`] and observability.
	pub fn kind(&self) -> &'static str {
		match self {
			Self::AuthenticationMissing { .. } => "authentication_missing",
			Self::ExchangeUnavailable(_) => "exchange_unavailable",
			Self::ExchangeRejected { .. } => "exchange_rejected",
			Self::ExchangeMalformedResponse { .. } => "exchange_malformed_response",
			Self::CredentialUnverified { .. } => "credential_unverified",
			Self::CredentialIncomplete { .. } => "credential_incomplete",
			Self::Bundle(_) => "bundle",
			Self::DownstreamCallFailed { .. } => "downstream_call_failed",
			Self::CommandSpawn { .. } => "command_spawn",
			Self::InvalidCommand { .. } => "invalid_command",
			Self::PolicyDenied { .. } => "policy_denied",
			Self::PolicyEvaluationFailed { .. } => "policy_evaluation_failed",
			Self::Key(_) => "key",
			Self::Config(_) => "config",
			Self::Cancelled => "cancelled",
		}
	}

	/// Process exit code for hook-style callers: denial is `2`, every other failure is `1`.
	pub fn exit_code(&self) -> i32 {
		match self {
			Self::PolicyDenied { .. } => 2,
			_ => 1,
		}
	}

	/// Returns `true` when a downstream 401/403 suggests the cached credential went stale.
	pub fn is_stale_credential(&self) -> bool {
		matches!(self, Self::DownstreamCallFailed { status: Some(401 | 403), .. })
	}

	/// Converts the error into the structured payload returned to the calling agent.
	pub fn to_tool_failure(&self) -> ToolFailure {
		let (status, exit_code) = match self {
			Self::DownstreamCallFailed { status, exit_code, .. } => (*status, *exit_code),
			Self::ExchangeRejected { status, .. } => (Some(*status), None),
			_ => (None, None),
		};

		ToolFailure { kind: self.kind(), message: self.to_string(), status, exit_code }
	}

	pub(crate) fn malformed(reason: impl Into<String>) -> Self {
		Self::ExchangeMalformedResponse { reason: reason.into(), source: None }
	}

	pub(crate) fn malformed_json(
		what: &str,
		err: serde_path_to_error::Error<serde_json::Error>,
	) -> Self {
		let path = err.path().to_string();

		Self::ExchangeMalformedResponse {
			reason: format!("{what} is not valid JSON at `{path}`"),
			source: Some(Arc::new(err)),
		}
	}

	pub(crate) fn unavailable(err: TransportError) -> Self {
		Self::ExchangeUnavailable(Arc::new(err))
	}

	pub(crate) fn bundle(err: std::io::Error) -> Self {
		Self::Bundle(Arc::new(err))
	}
}
impl From<crate::keys::KeyError> for Error {
	fn from(e: crate::keys::KeyError) -> Self {
		Self::Key(Arc::new(e))
	}
}
impl From<ConfigError> for Error {
	fn from(e: ConfigError) -> Self {
		Self::Config(Arc::new(e))
	}
}

/// Secret-free, serializable error returned to the agent instead of a tool result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ToolFailure {
	/// Stable error label (see [`Error::kind`]).
	pub kind: &'static str,
	/// Human-readable message.
	pub message: String,
	/// HTTP status, when the failure came from an HTTP peer.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub status: Option<u16>,
	/// CLI exit code, when the failure came from a subprocess.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub exit_code: Option<i32>,
}

/// Configuration and startup failures.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// HTTP client could not be constructed.
	#[error("HTTP client could not be constructed.")]
	HttpClientBuild {
		/// Underlying transport builder failure.
		#[source]
		source: BoxError,
	},
	/// HTTP request construction failed.
	#[error(transparent)]
	HttpRequest(#[from] oauth2::http::Error),
	/// A required environment variable is absent or empty.
	#[error("Environment variable `{name}` is required.")]
	MissingVariable {
		/// Variable name.
		name: &'static str,
	},
	/// An environment variable holds an unusable value.
	#[error("Environment variable `{name}` is invalid: {reason}.")]
	InvalidVariable {
		/// Variable name.
		name: &'static str,
		/// Parsing failure summary.
		reason: String,
	},
	/// Provider descriptor validation failed.
	#[error(transparent)]
	Descriptor(#[from] crate::provider::ProviderDescriptorError),
	/// An endpoint template or derived URL is invalid.
	#[error("Endpoint `{endpoint}` is not a valid URL.")]
	InvalidEndpoint {
		/// Offending endpoint text.
		endpoint: String,
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
}
impl ConfigError {
	/// Wraps a transport's builder failure inside [`ConfigError`].
	pub fn http_client_build(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::HttpClientBuild { source: Box::new(src) }
	}
}
impl From<ReqwestError> for ConfigError {
	fn from(e: ReqwestError) -> Self {
		Self::http_client_build(e)
	}
}

/// Transport-level failures (network, IO) raised while talking to an HTTP peer.
#[derive(Debug, ThisError)]
pub enum TransportError {
	/// Underlying HTTP client reported a network failure.
	#[error("Network error occurred while calling {endpoint}.")]
	Network {
		/// Endpoint label (discovery, token, jwks, policy).
		endpoint: &'static str,
		/// Transport-specific network error.
		#[source]
		source: BoxError,
	},
	/// The request did not complete before the client timeout.
	#[error("Request to {endpoint} timed out.")]
	Timeout {
		/// Endpoint label.
		endpoint: &'static str,
	},
	/// Underlying IO failure surfaced during transport.
	#[error("I/O error occurred during transport.")]
	Io(#[from] std::io::Error),
	/// The request could not be built.
	#[error("Request could not be constructed.")]
	Request(#[from] oauth2::http::Error),
	/// Transport-specific failure without structured details.
	#[error("HTTP client error: {message}.")]
	Other {
		/// Transport-supplied message.
		message: String,
	},
}
impl TransportError {
	/// Wraps a transport-specific network error.
	pub fn network(
		endpoint: &'static str,
		src: impl 'static + Send + Sync + std::error::Error,
	) -> Self {
		Self::Network { endpoint, source: Box::new(src) }
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn policy_denial_and_evaluation_failure_use_distinct_exit_codes() {
		let denied = Error::PolicyDenied { package: "mcp".into(), rule: "allow".into() };
		let failed =
			Error::PolicyEvaluationFailed { reason: "connection refused".into(), source: None };

		assert_eq!(denied.exit_code(), 2);
		assert_eq!(failed.exit_code(), 1);
		assert_ne!(denied.kind(), failed.kind());
	}

	#[test]
	fn stale_credentials_are_only_downstream_auth_failures() {
		let unauthorized =
			Error::DownstreamCallFailed { status: Some(401), exit_code: None, detail: "x".into() };
		let server =
			Error::DownstreamCallFailed { status: Some(500), exit_code: None, detail: "x".into() };
		let rejected = Error::ExchangeRejected { status: 401, body: "invalid_client".into() };

		assert!(unauthorized.is_stale_credential());
		assert!(!server.is_stale_credential());
		assert!(!rejected.is_stale_credential());
	}

	#[test]
	fn clones_keep_their_kind_and_source() {
		let err = Error::unavailable(TransportError::Timeout { endpoint: "token" });
		let shared = err.clone();

		assert_eq!(shared.kind(), "exchange_unavailable");
		assert_eq!(shared.to_string(), err.to_string());
		assert!(StdError::source(&shared).is_some());
	}

	#[test]
	fn tool_failure_carries_cli_details() {
		let err = Error::DownstreamCallFailed {
			status: None,
			exit_code: Some(3),
			detail: "ServiceError: NotAuthorizedOrNotFound".into(),
		};
		let failure = err.to_tool_failure();
		let payload = serde_json::to_value(&failure).expect("Tool failure should serialize.");

		assert_eq!(payload["kind"], "downstream_call_failed");
		assert_eq!(payload["exit_code"], 3);
		assert!(payload.get("status").is_none());
		assert!(payload["message"].as_str().is_some_and(|m| m.contains("NotAuthorizedOrNotFound")));
	}
}
