//! Authorization hook consulted before commands run on a caller's behalf.
//!
//! [`OpaPolicyClient`] asks an Open Policy Agent server for a decision through its data API.
//! A `true` result (or `{"allow": true}`) allows; `false` or an undefined result denies with
//! [`Error::PolicyDenied`] (exit code `2`); anything that prevents a decision fails with
//! [`Error::PolicyEvaluationFailed`] (exit code `1`).

// crates.io
use oauth2::http::{
	Method, Request,
	header::{ACCEPT, CONTENT_TYPE},
};
use serde_json::Value;
// self
use crate::{
	_prelude::*,
	error::{ConfigError, SharedError, TransportError},
	exchange::body_preview,
	http::{
		self, BrokerHttpClient, DEFAULT_HTTP_TIMEOUT, ReqwestHttpClient,
		ReqwestTransportErrorMapper, TransportErrorMapper,
	},
	obs::{self, BrokerStage},
};

/// Boxed future returned by [`PolicyHook::authorize`].
pub type PolicyFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + 'a + Send>>;

/// Policy client specialized for the crate's default reqwest transport stack.
pub type ReqwestOpaPolicyClient = OpaPolicyClient<ReqwestHttpClient, ReqwestTransportErrorMapper>;

/// Default OPA package consulted.
pub const DEFAULT_PACKAGE: &str = "mcp";
/// Default OPA rule consulted.
pub const DEFAULT_RULE: &str = "allow";

/// Pluggable authorization hook.
pub trait PolicyHook
where
	Self: 'static + Send + Sync,
{
	/// Resolves to `Ok(())` when `input` is allowed, [`Error::PolicyDenied`] when it is denied,
	/// and [`Error::PolicyEvaluationFailed`] when no decision could be made.
	fn authorize<'a>(&'a self, input: &'a PolicyInput) -> PolicyFuture<'a>;
}

/// Decision returned by a policy engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyDecision {
	/// The operation may proceed.
	Allow,
	/// The operation must not proceed.
	Deny,
}
impl PolicyDecision {
	/// Interprets an OPA data API response body.
	pub fn from_opa_response(body: &Value) -> Result<Self> {
		let Some(object) = body.as_object() else {
			return Err(evaluation_failed("the policy response is not a JSON object", None));
		};
		let allowed = match object.get("result") {
			None | Some(Value::Null) => false,
			Some(Value::Bool(allowed)) => *allowed,
			Some(Value::Object(result)) => matches!(result.get("allow"), Some(Value::Bool(true))),
			Some(other) =>
				return Err(evaluation_failed(
					format!("the policy result has an unexpected shape: {other}"),
					None,
				)),
		};

		Ok(if allowed { Self::Allow } else { Self::Deny })
	}
}

/// Input document sent to the policy engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PolicyInput {
	/// Tool being invoked.
	pub tool: String,
	/// Upstream subject of the caller.
	pub subject: String,
	/// Upstream tenancy of the caller, when known.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tenancy: Option<String>,
	/// Literal command arguments.
	pub command: Vec<String>,
	/// Target region, when the tool has one.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub region: Option<String>,
}

/// Client for an Open Policy Agent data API.
pub struct OpaPolicyClient<C = ReqwestHttpClient, M = ReqwestTransportErrorMapper>
where
	C: ?Sized + BrokerHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// HTTP client wrapper used for every decision request.
	pub http_client: Arc<C>,
	/// Mapper applied to transport-layer errors.
	pub transport_mapper: Arc<M>,
	endpoint: Url,
	package: String,
	rule: String,
}
impl<C, M> OpaPolicyClient<C, M>
where
	C: ?Sized + BrokerHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Creates a client for `<base>/v1/data/<package>/<rule>`; dots in `package` become path
	/// segments.
	pub fn with_http_client(
		base: &Url,
		package: impl Into<String>,
		rule: impl Into<String>,
		http_client: impl Into<Arc<C>>,
		mapper: impl Into<Arc<M>>,
	) -> Result<Self, ConfigError> {
		let package = package.into();
		let rule = rule.into();
		let endpoint = format!(
			"{}/v1/data/{}/{}",
			base.as_str().trim_end_matches('/'),
			package.replace('.', "/"),
			rule
		);
		let endpoint = Url::parse(&endpoint)
			.map_err(|source| ConfigError::InvalidEndpoint { endpoint: endpoint.clone(), source })?;

		Ok(Self {
			http_client: http_client.into(),
			transport_mapper: mapper.into(),
			endpoint,
			package,
			rule,
		})
	}

	/// Decision endpoint.
	pub fn endpoint(&self) -> &Url {
		&self.endpoint
	}

	/// Asks the engine for a decision on `input`.
	pub async fn evaluate(&self, input: &PolicyInput) -> Result<PolicyDecision> {
		let body = serde_json::to_vec(&serde_json::json!({ "input": input }))
			.map_err(|e| {
				evaluation_failed("the policy input cannot be encoded", Some(Arc::new(e)))
			})?;
		let request = decision_request(self.endpoint.as_str(), body)?;
		let response = http::send(&*self.http_client, &*self.transport_mapper, "policy", request)
			.await
			.map_err(|e: TransportError| {
				evaluation_failed("the policy service is unreachable", Some(Arc::new(e)))
			})?;
		let status = response.status();

		if !status.is_success() {
			return Err(evaluation_failed(
				format!(
					"the policy service answered HTTP {}: {}",
					status.as_u16(),
					body_preview(response.body())
				),
				None,
			));
		}

		let body: Value = serde_json::from_slice(response.body()).map_err(|e| {
			evaluation_failed("the policy response is not valid JSON", Some(Arc::new(e)))
		})?;

		PolicyDecision::from_opa_response(&body)
	}
}
impl OpaPolicyClient<ReqwestHttpClient, ReqwestTransportErrorMapper> {
	/// Creates a client with its own reqwest transport.
	pub fn new(
		base: &Url,
		package: impl Into<String>,
		rule: impl Into<String>,
	) -> Result<Self, ConfigError> {
		Self::with_http_client(
			base,
			package,
			rule,
			ReqwestHttpClient::new(DEFAULT_HTTP_TIMEOUT)?,
			ReqwestTransportErrorMapper,
		)
	}
}
impl<C, M> PolicyHook for OpaPolicyClient<C, M>
where
	C: ?Sized + BrokerHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn authorize<'a>(&'a self, input: &'a PolicyInput) -> PolicyFuture<'a> {
		Box::pin(obs::observe(BrokerStage::Policy, "authorize", async move {
			match self.evaluate(input).await? {
				PolicyDecision::Allow => Ok(()),
				PolicyDecision::Deny => {
					obs::event!(info, tool = %input.tool, package = %self.package, "policy denied");

					Err(Error::PolicyDenied {
						package: self.package.clone(),
						rule: self.rule.clone(),
					})
				},
			}
		}))
	}
}
impl<C, M> Debug for OpaPolicyClient<C, M>
where
	C: ?Sized + BrokerHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("OpaPolicyClient").field("endpoint", &self.endpoint.as_str()).finish()
	}
}

fn decision_request(endpoint: &str, body: Vec<u8>) -> Result<oauth2::HttpRequest> {
	Request::builder()
		.method(Method::POST)
		.uri(endpoint)
		.header(CONTENT_TYPE, "application/json")
		.header(ACCEPT, "application/json")
		.body(body)
		.map_err(|e| evaluation_failed("the policy request cannot be built", Some(Arc::new(e))))
}

fn evaluation_failed(reason: impl Into<String>, source: Option<SharedError>) -> Error {
	Error::PolicyEvaluationFailed { reason: reason.into(), source }
}
