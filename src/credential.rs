//! Downstream session credential produced by the token exchange.

// self
use crate::{_prelude::*, auth::TokenSecret, keys::PublicKeyBinding};

/// Verified claims of an exchanged session token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
	/// Downstream user identifier (OCID).
	#[serde(default)]
	pub sub: Option<String>,
	/// Downstream tenancy identifier (OCID).
	#[serde(default)]
	pub tenant: Option<String>,
	/// Issued-at (seconds since epoch).
	#[serde(default)]
	pub iat: Option<i64>,
	/// Expiry (seconds since epoch).
	pub exp: i64,
	/// Unique session identifier.
	#[serde(default)]
	pub jti: Option<String>,
}

/// Session credential bound to the broker's public key.
///
/// Treated as secret: [`Debug`] redacts the token and the value is never returned to the agent.
#[derive(Clone)]
pub struct ExchangedCredential {
	session_token: TokenSecret,
	bound_public_key: PublicKeyBinding,
	claims: SessionClaims,
}
impl ExchangedCredential {
	/// Assembles a credential from an already verified token and its claims.
	pub fn new(
		session_token: impl Into<String>,
		bound_public_key: PublicKeyBinding,
		claims: SessionClaims,
	) -> Self {
		Self { session_token: TokenSecret::new(session_token), bound_public_key, claims }
	}

	/// Opaque session token (UPST).
	pub fn session_token(&self) -> &TokenSecret {
		&self.session_token
	}

	/// Public key the credential was bound to during the exchange.
	pub fn bound_public_key(&self) -> &PublicKeyBinding {
		&self.bound_public_key
	}

	/// Verified claims.
	pub fn claims(&self) -> &SessionClaims {
		&self.claims
	}

	/// Expiry instant; an out-of-range `exp` is treated as already expired.
	pub fn expires_at(&self) -> OffsetDateTime {
		OffsetDateTime::from_unix_timestamp(self.claims.exp).unwrap_or(OffsetDateTime::UNIX_EPOCH)
	}

	/// Downstream subject, when present.
	pub fn subject(&self) -> Option<&str> {
		self.claims.sub.as_deref().filter(|sub| !sub.is_empty())
	}

	/// Downstream tenancy, when present.
	pub fn tenancy(&self) -> Option<&str> {
		self.claims.tenant.as_deref().filter(|tenant| !tenant.is_empty())
	}
}
impl Debug for ExchangedCredential {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ExchangedCredential")
			.field("session_token", &self.session_token)
			.field("claims", &self.claims)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::_preludet::test_keypair;

	#[test]
	fn empty_identity_claims_count_as_missing() {
		let credential = ExchangedCredential::new(
			"upst-secret",
			test_keypair().binding().clone(),
			SessionClaims { sub: Some(String::new()), tenant: None, iat: None, exp: 10, jti: None },
		);

		assert_eq!(credential.subject(), None);
		assert_eq!(credential.tenancy(), None);
		assert_eq!(credential.expires_at().unix_timestamp(), 10);
		assert!(!format!("{credential:?}").contains("upst-secret"));
	}
}
