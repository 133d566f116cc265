//! Inbound bearer token handed over by the tool gateway.
//!
//! The gateway authenticates the caller before dispatching a tool call, so the broker only
//! decodes the token's claims here. Nothing decoded from this token is used to authorize a
//! downstream call: the exchanged session credential is verified separately.

// crates.io
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
// self
use crate::{
	_prelude::*,
	auth::{TokenId, TokenSecret},
};

/// Claims the broker reads from the inbound token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamClaims {
	/// Subject (user) identifier.
	pub sub: String,
	/// Issuer URL.
	#[serde(default)]
	pub iss: Option<String>,
	/// Expiry (seconds since epoch).
	#[serde(default)]
	pub exp: Option<i64>,
	/// Unique token identifier.
	#[serde(default)]
	pub jti: Option<String>,
	/// Tenancy or identity-domain identifier.
	#[serde(default)]
	pub tenant: Option<String>,
	/// Home region of the identity domain, when advertised.
	#[serde(default)]
	pub domain_home: Option<String>,
}

/// Bearer credential attached to one inbound call; never persisted.
#[derive(Clone)]
pub struct UpstreamToken {
	raw: TokenSecret,
	id: TokenId,
	claims: UpstreamClaims,
	claim_set: Map<String, Value>,
}
impl UpstreamToken {
	/// Decodes a raw bearer token (an optional `Bearer ` prefix is stripped).
	pub fn from_bearer(raw: &str) -> Result<Self> {
		Self::from_bearer_at(raw, OffsetDateTime::now_utc())
	}

	/// Decodes the value of an `Authorization` header, treating absence as missing auth.
	pub fn from_authorization_header(header: Option<&str>) -> Result<Self> {
		match header {
			Some(value) => Self::from_bearer(value),
			None => Err(missing("no bearer token accompanied the call")),
		}
	}

	/// Same as [`from_bearer`](Self::from_bearer) with an explicit clock.
	pub fn from_bearer_at(raw: &str, now: OffsetDateTime) -> Result<Self> {
		let raw = raw.trim();
		let raw = raw
			.strip_prefix("Bearer ")
			.or_else(|| raw.strip_prefix("bearer "))
			.unwrap_or(raw)
			.trim();

		if raw.is_empty() {
			return Err(missing("the bearer token is empty"));
		}

		let claim_set = decode_payload(raw)?;
		let claims: UpstreamClaims = serde_json::from_value(Value::Object(claim_set.clone()))
			.map_err(|_| missing("the bearer token lacks a subject"))?;

		if claims.sub.is_empty() {
			return Err(missing("the bearer token has an empty subject"));
		}
		if claims.exp.is_some_and(|exp| exp <= now.unix_timestamp()) {
			return Err(missing("the bearer token has expired"));
		}

		let id = claims
			.jti
			.as_deref()
			.and_then(|jti| TokenId::new(jti).ok())
			.map_or_else(|| digest_id(raw), Ok)?;

		Ok(Self { raw: TokenSecret::new(raw), id, claims, claim_set })
	}

	/// Stable identifier used to key cached signers.
	pub fn id(&self) -> &TokenId {
		&self.id
	}

	/// Authenticated subject.
	pub fn subject(&self) -> &str {
		&self.claims.sub
	}

	/// Tenancy or identity-domain identifier, when present.
	pub fn tenancy(&self) -> Option<&str> {
		self.claims.tenant.as_deref()
	}

	/// Issuer, when present.
	pub fn issuer(&self) -> Option<&str> {
		self.claims.iss.as_deref()
	}

	/// Expiry instant, when present.
	pub fn expires_at(&self) -> Option<OffsetDateTime> {
		self.claims.exp.and_then(|exp| OffsetDateTime::from_unix_timestamp(exp).ok())
	}

	/// Typed claims.
	pub fn claims(&self) -> &UpstreamClaims {
		&self.claims
	}

	/// Every claim carried by the token, for diagnostics.
	pub fn claim_set(&self) -> &Map<String, Value> {
		&self.claim_set
	}

	/// Raw bearer token. Callers must avoid logging it.
	pub fn raw(&self) -> &TokenSecret {
		&self.raw
	}
}
impl Debug for UpstreamToken {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("UpstreamToken")
			.field("id", &self.id)
			.field("subject", &self.claims.sub)
			.field("tenancy", &self.claims.tenant)
			.field("raw", &"<redacted>")
			.finish()
	}
}

fn missing(reason: &str) -> Error {
	Error::AuthenticationMissing { reason: reason.into() }
}

fn decode_payload(raw: &str) -> Result<Map<String, Value>> {
	let mut parts = raw.split('.');
	let (Some(_), Some(payload), Some(_), None) =
		(parts.next(), parts.next(), parts.next(), parts.next())
	else {
		return Err(missing("the bearer token is not a JWT"));
	};
	let bytes = URL_SAFE_NO_PAD
		.decode(payload.trim_end_matches('='))
		.map_err(|_| missing("the bearer token payload is not base64url"))?;

	serde_json::from_slice(&bytes).map_err(|_| missing("the bearer token payload is not JSON"))
}

fn digest_id(raw: &str) -> Result<TokenId> {
	let digest = Sha256::digest(raw.as_bytes());
	let hex = digest.iter().map(|byte| format!("{byte:02x}")).collect::<String>();

	TokenId::new(format!("sha256:{hex}"))
		.map_err(|_| missing("the bearer token identifier could not be derived"))
}
