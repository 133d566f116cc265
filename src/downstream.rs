//! Signed SDK-style calls against the downstream platform's regional endpoints.

// crates.io
use reqwest::header::ACCEPT;
use serde_json::Value;
// self
use crate::{
	_prelude::*,
	auth::Region,
	error::ConfigError,
	exchange::body_preview,
	http::DEFAULT_HTTP_TIMEOUT,
	materialize::RequestSigner,
	obs::{self, BrokerStage},
};

/// Placeholder replaced by the target region in endpoint templates.
pub const REGION_PLACEHOLDER: &str = "{region}";

/// Regional endpoint templates; each must contain `{region}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownstreamEndpoints {
	/// Identity service template.
	pub identity: String,
	/// Object storage service template.
	pub object_storage: String,
}
impl DownstreamEndpoints {
	/// Resolves the identity endpoint for `region`.
	pub fn identity_for(&self, region: &Region) -> Result<Url, ConfigError> {
		resolve(&self.identity, region)
	}

	/// Resolves the object storage endpoint for `region`.
	pub fn object_storage_for(&self, region: &Region) -> Result<Url, ConfigError> {
		resolve(&self.object_storage, region)
	}
}
impl Default for DownstreamEndpoints {
	fn default() -> Self {
		Self {
			identity: "https://identity.{region}.oraclecloud.com".into(),
			object_storage: "https://objectstorage.{region}.oraclecloud.com".into(),
		}
	}
}

/// Client issuing signed downstream requests.
#[derive(Clone, Debug)]
pub struct DownstreamClient {
	http_client: ReqwestClient,
	endpoints: DownstreamEndpoints,
}
impl DownstreamClient {
	/// Creates a client with its own rustls transport and the default timeout.
	pub fn new(endpoints: DownstreamEndpoints) -> Result<Self, ConfigError> {
		let http_client = ReqwestClient::builder()
			.redirect(reqwest::redirect::Policy::none())
			.timeout(DEFAULT_HTTP_TIMEOUT)
			.build()?;

		Ok(Self::with_client(http_client, endpoints))
	}

	/// Wraps an existing reqwest client.
	pub fn with_client(http_client: ReqwestClient, endpoints: DownstreamEndpoints) -> Self {
		Self { http_client, endpoints }
	}

	/// Endpoint templates in use.
	pub fn endpoints(&self) -> &DownstreamEndpoints {
		&self.endpoints
	}

	/// Lists the regions visible to the signer's tenancy.
	pub async fn list_regions(&self, signer: &RequestSigner) -> Result<Value> {
		let mut url = self.endpoints.identity_for(signer.region())?;

		url.set_path("/20160918/regions");

		obs::observe(BrokerStage::Downstream, "list_regions", self.signed_get(signer, url)).await
	}

	/// Returns the object storage namespace of the signer's tenancy.
	pub async fn get_namespace(&self, signer: &RequestSigner) -> Result<Value> {
		let mut url = self.endpoints.object_storage_for(signer.region())?;

		url.set_path("/n/");

		obs::observe(BrokerStage::Downstream, "get_namespace", self.signed_get(signer, url)).await
	}

	async fn signed_get(&self, signer: &RequestSigner, url: Url) -> Result<Value> {
		let mut request = self
			.http_client
			.get(url)
			.header(ACCEPT, "application/json")
			.build()
			.map_err(unreachable_downstream)?;

		signer.sign(&mut request)?;

		let response = self.http_client.execute(request).await.map_err(unreachable_downstream)?;
		let status = response.status();
		let body = response.bytes().await.map_err(unreachable_downstream)?;

		if !status.is_success() {
			return Err(Error::DownstreamCallFailed {
				status: Some(status.as_u16()),
				exit_code: None,
				detail: body_preview(&body),
			});
		}

		Ok(serde_json::from_slice(&body)
			.unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).trim().to_owned())))
	}
}

fn resolve(template: &str, region: &Region) -> Result<Url, ConfigError> {
	let endpoint = template.replace(REGION_PLACEHOLDER, region);

	Url::parse(&endpoint).map_err(|source| ConfigError::InvalidEndpoint { endpoint, source })
}

fn unreachable_downstream(err: ReqwestError) -> Error {
	Error::DownstreamCallFailed {
		status: err.status().map(|status| status.as_u16()),
		exit_code: None,
		detail: err.to_string(),
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn templates_resolve_per_region() {
		let endpoints = DownstreamEndpoints::default();
		let region = Region::new("ap-tokyo-1").expect("Region fixture should be valid.");

		assert_eq!(
			endpoints.identity_for(&region).expect("Identity endpoint should resolve.").as_str(),
			"https://identity.ap-tokyo-1.oraclecloud.com/"
		);
		let object_storage =
			endpoints.object_storage_for(&region).expect("Object storage endpoint should resolve.");

		assert_eq!(object_storage.host_str(), Some("objectstorage.ap-tokyo-1.oraclecloud.com"));
	}

	#[test]
	fn malformed_templates_are_configuration_errors() {
		let endpoints =
			DownstreamEndpoints { identity: "not a url/{region}".into(), ..Default::default() };
		let region = Region::new("us-ashburn-1").expect("Region fixture should be valid.");

		assert!(matches!(
			endpoints.identity_for(&region),
			Err(ConfigError::InvalidEndpoint { .. })
		));
	}
}
