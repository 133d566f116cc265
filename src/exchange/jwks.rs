//! Session-token verification against the provider's published signing keys.

// crates.io
use jsonwebtoken::{
	Algorithm, DecodingKey, Validation,
	errors::ErrorKind,
	jwk::{Jwk, JwkSet},
};
// self
use crate::{_prelude::*, credential::SessionClaims};

const SUPPORTED_ALGORITHMS: [Algorithm; 3] = [Algorithm::RS256, Algorithm::RS384, Algorithm::RS512];

/// Result of looking up a token's signing key.
pub(crate) enum KeyLookup<'a> {
	/// The key was found.
	Found(&'a Jwk),
	/// The token names a `kid` that the set does not publish (yet).
	UnknownKid(String),
}

/// Reads the algorithm and `kid` from a token header.
pub(crate) fn token_header(token: &str) -> Result<(Algorithm, Option<String>)> {
	let header = jsonwebtoken::decode_header(token)
		.map_err(|e| unverified(format!("the session token header is unreadable ({e})")))?;

	if !SUPPORTED_ALGORITHMS.contains(&header.alg) {
		return Err(unverified(format!(
			"the session token uses unsupported algorithm {:?}",
			header.alg
		)));
	}

	Ok((header.alg, header.kid))
}

/// Finds the key for `kid`; a `kid`-less token is accepted only against a single-key set.
pub(crate) fn find_key<'a>(jwks: &'a JwkSet, kid: Option<&str>) -> Result<KeyLookup<'a>> {
	match kid {
		Some(kid) => Ok(jwks
			.find(kid)
			.map_or_else(|| KeyLookup::UnknownKid(kid.to_owned()), KeyLookup::Found)),
		None => match jwks.keys.as_slice() {
			[only] => Ok(KeyLookup::Found(only)),
			_ => Err(unverified("the session token has no `kid` and the key set is ambiguous")),
		},
	}
}

/// Verifies the signature and timestamps of `token` and decodes its claims.
pub(crate) fn verify(
	token: &str,
	algorithm: Algorithm,
	jwk: &Jwk,
	leeway: Duration,
) -> Result<SessionClaims> {
	let key = DecodingKey::from_jwk(jwk)
		.map_err(|e| unverified(format!("the published signing key is unusable ({e})")))?;
	let mut validation = Validation::new(algorithm);

	validation.validate_aud = false;
	validation.leeway = leeway.whole_seconds().max(0) as u64;
	validation.set_required_spec_claims(&["exp"]);

	jsonwebtoken::decode::<SessionClaims>(token, &key, &validation)
		.map(|data| data.claims)
		.map_err(|e| {
			let reason = match e.kind() {
				ErrorKind::InvalidSignature =>
					"the signature does not match the published key".to_owned(),
				ErrorKind::ExpiredSignature => "the session token is already expired".to_owned(),
				ErrorKind::ImmatureSignature => "the session token is not valid yet".to_owned(),
				ErrorKind::MissingRequiredClaim(claim) => format!("the `{claim}` claim is missing"),
				_ => format!("the session token is invalid ({e})"),
			};

			unverified(reason)
		})
}

fn unverified(reason: impl Into<String>) -> Error {
	Error::CredentialUnverified { reason: reason.into() }
}
