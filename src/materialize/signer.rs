//! OCI HTTP-signature request signing.

// crates.io
use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::header::{HeaderName, HeaderValue};
use sha2::{Digest, Sha256};
use time::{UtcOffset, macros::format_description};
// self
use crate::{
	_prelude::*,
	auth::Region,
	ext::RequestSignerExt,
	materialize::SigningSession,
};

const BODY_METHODS: [&str; 3] = ["POST", "PUT", "PATCH"];
const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// In-process signer: a cached [`SigningSession`] bound to one target region.
///
/// Cloning is cheap and every method takes `&self`, so one signer can sign concurrent requests.
#[derive(Clone, Debug)]
pub struct RequestSigner {
	session: Arc<SigningSession>,
	region: Region,
}
impl RequestSigner {
	/// Binds `session` to `region`.
	pub fn new(session: Arc<SigningSession>, region: Region) -> Self {
		Self { session, region }
	}

	/// Target region.
	pub fn region(&self) -> &Region {
		&self.region
	}

	/// Underlying session.
	pub fn session(&self) -> &Arc<SigningSession> {
		&self.session
	}

	/// Computes the headers to attach to a request, `authorization` last.
	///
	/// `GET`/`DELETE`/`HEAD` sign `date (request-target) host`; `POST`/`PUT`/`PATCH` additionally
	/// sign `content-length content-type x-content-sha256` over `body` (empty when absent).
	pub fn signing_headers(
		&self,
		method: &str,
		url: &Url,
		content_type: Option<&str>,
		body: Option<&[u8]>,
		now: OffsetDateTime,
	) -> Result<Vec<(&'static str, String)>> {
		let host = match (url.host_str(), url.port()) {
			(Some(host), Some(port)) => format!("{host}:{port}"),
			(Some(host), None) => host.to_owned(),
			(None, _) => return Err(unsignable(format!("`{url}` has no host"))),
		};
		let target = match url.query() {
			Some(query) => format!("{} {}?{query}", method.to_ascii_lowercase(), url.path()),
			None => format!("{} {}", method.to_ascii_lowercase(), url.path()),
		};
		let date = now
			.to_offset(UtcOffset::UTC)
			.format(format_description!(
				"[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
			))
			.map_err(|e| unsignable(format!("the request date cannot be formatted ({e})")))?;
		let mut signed = vec![("date", date), ("(request-target)", target), ("host", host)];

		if BODY_METHODS.iter().any(|m| m.eq_ignore_ascii_case(method)) {
			let body = body.unwrap_or_default();

			signed.push(("content-length", body.len().to_string()));
			signed.push(("content-type", content_type.unwrap_or(DEFAULT_CONTENT_TYPE).to_owned()));
			signed.push(("x-content-sha256", STANDARD.encode(Sha256::digest(body))));
		}

		let signing_string = signed
			.iter()
			.map(|(name, value)| format!("{name}: {value}"))
			.collect::<Vec<_>>()
			.join("\n");
		let signature = STANDARD.encode(self.session.keypair().sign(signing_string.as_bytes())?);
		let names = signed.iter().map(|(name, _)| *name).collect::<Vec<_>>().join(" ");
		let authorization = format!(
			concat!(
				"Signature version=\"1\",keyId=\"ST${}\",algorithm=\"rsa-sha256\",",
				"headers=\"{}\",signature=\"{}\"",
			),
			self.session.credential().session_token().expose(),
			names,
			signature,
		);
		let mut headers =
			signed.into_iter().filter(|(name, _)| *name != "(request-target)").collect::<Vec<_>>();

		headers.push(("authorization", authorization));

		Ok(headers)
	}

	/// Signs a reqwest request in place.
	pub fn sign(&self, request: &mut reqwest::Request) -> Result<()> {
		let body = match request.body() {
			Some(body) => Some(
				body.as_bytes()
					.ok_or_else(|| unsignable("streaming request bodies cannot be signed".into()))?
					.to_vec(),
			),
			None => None,
		};
		let content_type = request
			.headers()
			.get(reqwest::header::CONTENT_TYPE)
			.and_then(|value| value.to_str().ok())
			.map(str::to_owned);
		let headers = self.signing_headers(
			request.method().as_str(),
			request.url(),
			content_type.as_deref(),
			body.as_deref(),
			OffsetDateTime::now_utc(),
		)?;

		for (name, value) in headers {
			let value = HeaderValue::from_str(&value)
				.map_err(|_| unsignable(format!("the `{name}` header value is not valid")))?;

			request.headers_mut().insert(HeaderName::from_static(name), value);
		}

		Ok(())
	}
}
impl RequestSignerExt<reqwest::Request, Error> for RequestSigner {
	fn sign_request(&self, mut request: reqwest::Request) -> Result<reqwest::Request> {
		self.sign(&mut request)?;

		Ok(request)
	}
}
impl RequestSignerExt<oauth2::HttpRequest, Error> for RequestSigner {
	fn sign_request(&self, mut request: oauth2::HttpRequest) -> Result<oauth2::HttpRequest> {
		let url = Url::parse(&request.uri().to_string())
			.map_err(|e| unsignable(format!("the request URI is not absolute ({e})")))?;
		let content_type = request
			.headers()
			.get(oauth2::http::header::CONTENT_TYPE)
			.and_then(|value| value.to_str().ok())
			.map(str::to_owned);
		let headers = self.signing_headers(
			request.method().as_str(),
			&url,
			content_type.as_deref(),
			Some(request.body()),
			OffsetDateTime::now_utc(),
		)?;

		for (name, value) in headers {
			let value = oauth2::http::HeaderValue::from_str(&value)
				.map_err(|_| unsignable(format!("the `{name}` header value is not valid")))?;

			request.headers_mut().insert(oauth2::http::HeaderName::from_static(name), value);
		}

		Ok(request)
	}
}

fn unsignable(detail: String) -> Error {
	Error::DownstreamCallFailed {
		status: None,
		exit_code: None,
		detail: format!("request cannot be signed: {detail}"),
	}
}

#[cfg(test)]
mod tests {
	// crates.io
	use rsa::{
		RsaPublicKey,
		pkcs1v15::{Signature, VerifyingKey},
		pkcs8::DecodePublicKey,
		signature::Verifier,
	};
	// self
	use super::*;
	use crate::{_preludet::*, materialize::Materializer};

	fn signer() -> RequestSigner {
		let exchanger_claims = crate::credential::SessionClaims {
			sub: Some("ocid1.user.oc1..alice".into()),
			tenant: Some("ocid1.tenancy.oc1..a".into()),
			iat: None,
			exp: (OffsetDateTime::now_utc() + Duration::hours(1)).unix_timestamp(),
			jti: None,
		};
		let keypair = test_keypair();
		let credential = crate::credential::ExchangedCredential::new(
			"upst-token",
			keypair.binding().clone(),
			exchanger_claims,
		);
		let region = Region::new("us-ashburn-1").expect("Region fixture should be valid.");

		Materializer::new()
			.to_signer(&credential, &keypair, region)
			.expect("Signer should materialize.")
	}

	fn verify(headers: &[(&'static str, String)], target: &str) {
		let authorization = &headers.last().expect("Authorization header should be present.").1;
		let names = authorization
			.split("headers=\"")
			.nth(1)
			.and_then(|rest| rest.split('"').next())
			.expect("Authorization should list signed headers.");
		let signing_string = names
			.split(' ')
			.map(|name| match name {
				"(request-target)" => format!("{name}: {target}"),
				_ => {
					let value = headers
						.iter()
						.find(|(header, _)| *header == name)
						.map(|(_, value)| value.as_str())
						.expect("Every signed header should be returned.");

					format!("{name}: {value}")
				},
			})
			.collect::<Vec<_>>()
			.join("\n");
		let signature = authorization
			.split("signature=\"")
			.nth(1)
			.and_then(|rest| rest.split('"').next())
			.expect("Authorization should carry a signature.");
		let signature = STANDARD.decode(signature).expect("Signature should be base64.");
		let der = STANDARD
			.decode(test_keypair().public_key_der_base64())
			.expect("Binding should be base64.");
		let public = RsaPublicKey::from_public_key_der(&der).expect("Binding should be SPKI DER.");

		VerifyingKey::<Sha256>::new(public)
			.verify(
				signing_string.as_bytes(),
				&Signature::try_from(signature.as_slice()).expect("Signature should parse."),
			)
			.expect("Signature should verify against the signing string.");
	}

	#[test]
	fn get_requests_sign_date_target_and_host() {
		let url =
			Url::parse("https://identity.us-ashburn-1.oraclecloud.com/20160918/regions?limit=5")
				.expect("URL should parse.");
		let now =
			OffsetDateTime::from_unix_timestamp(1_389_043_900).expect("Timestamp should be valid.");
		let headers = signer()
			.signing_headers("GET", &url, None, None, now)
			.expect("Signing should succeed.");

		assert_eq!(headers[0], ("date", "Mon, 06 Jan 2014 21:31:40 GMT".to_owned()));
		assert_eq!(headers[1], ("host", "identity.us-ashburn-1.oraclecloud.com".to_owned()));
		assert!(headers[2].1.starts_with(concat!(
			"Signature version=\"1\",keyId=\"ST$upst-token\",algorithm=\"rsa-sha256\",",
			"headers=\"date (request-target) host\""
		)));

		verify(&headers, "get /20160918/regions?limit=5");
	}

	#[test]
	fn body_requests_sign_content_headers() {
		let url = Url::parse("http://127.0.0.1:8443/n/").expect("URL should parse.");
		let headers = signer()
			.signing_headers("POST", &url, None, Some(b"{}"), OffsetDateTime::now_utc())
			.expect("Signing should succeed.");
		let names = headers.iter().map(|(name, _)| *name).collect::<Vec<_>>();

		assert_eq!(
			names,
			["date", "host", "content-length", "content-type", "x-content-sha256", "authorization"]
		);
		assert_eq!(headers[1].1, "127.0.0.1:8443");
		assert_eq!(headers[2].1, "2");
		assert_eq!(headers[3].1, "application/json");
		assert_eq!(headers[4].1, "RBNvo1WzZ4oRRq0W9+hknpT7T8If536DEMBg9hyq/4o=");

		verify(&headers, "post /n/");
	}

	#[test]
	fn reqwest_requests_receive_headers() {
		let url = Url::parse("https://objectstorage.us-ashburn-1.oraclecloud.com/n/")
			.expect("URL should parse.");
		let request = reqwest::Request::new(reqwest::Method::GET, url);
		let signed = signer().sign_request(request).expect("Signing should succeed.");

		assert!(signed.headers().contains_key("date"));
		assert_eq!(signed.headers()["host"], "objectstorage.us-ashburn-1.oraclecloud.com");
		assert!(
			signed.headers()["authorization"]
				.to_str()
				.is_ok_and(|value| value.starts_with("Signature version=\"1\""))
		);
	}
}
