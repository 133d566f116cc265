//! Turns an exchanged credential into the shape a downstream call path needs.
//!
//! [`SigningSession`] is the region-independent product the signer cache stores. Binding it to a
//! region yields a [`RequestSigner`] for in-process calls, or a [`CredentialBundle`] for one CLI
//! invocation.

pub mod bundle;
pub mod signer;

pub use bundle::*;
pub use signer::*;

// std
use std::path::PathBuf;
// self
use crate::{
	_prelude::*,
	auth::Region,
	cache::Expiring,
	credential::ExchangedCredential,
	keys::Keypair,
	obs::{self, BrokerStage},
};

/// How a downstream call consumes the credential.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
	/// In-process SDK-style signing.
	InProcess,
	/// Files plus environment for a subprocess.
	Bundle,
}

/// Materialized credential in the requested shape.
#[derive(Debug)]
pub enum MaterializedSigner {
	/// In-process signer.
	InProcess(RequestSigner),
	/// On-disk bundle for one subprocess invocation.
	Bundle(CredentialBundle),
}

/// Validated credential plus the keypair it is bound to.
pub struct SigningSession {
	credential: ExchangedCredential,
	keypair: Arc<Keypair>,
	user: String,
	tenancy: String,
}
impl SigningSession {
	/// Downstream user identifier (`sub`).
	pub fn user(&self) -> &str {
		&self.user
	}

	/// Downstream tenancy identifier (`tenant`).
	pub fn tenancy(&self) -> &str {
		&self.tenancy
	}

	/// Exchanged credential.
	pub fn credential(&self) -> &ExchangedCredential {
		&self.credential
	}

	/// Keypair the credential is bound to.
	pub fn keypair(&self) -> &Arc<Keypair> {
		&self.keypair
	}

	/// Binds a shared session to `region`.
	pub fn for_region(self: &Arc<Self>, region: Region) -> RequestSigner {
		RequestSigner::new(Arc::clone(self), region)
	}
}
impl Expiring for SigningSession {
	fn expires_at(&self) -> OffsetDateTime {
		self.credential.expires_at()
	}
}
impl Debug for SigningSession {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("SigningSession")
			.field("user", &self.user)
			.field("tenancy", &self.tenancy)
			.field("expires_at", &self.credential.expires_at())
			.field("fingerprint", &self.keypair.fingerprint())
			.finish()
	}
}

/// Credential materializer; stateless apart from where bundles are written.
#[derive(Clone, Debug, Default)]
pub struct Materializer {
	bundle_root: Option<PathBuf>,
}
impl Materializer {
	/// Creates a materializer that writes bundles under the system temporary directory.
	pub fn new() -> Self {
		Self::default()
	}

	/// Writes bundles under `root` instead of the system temporary directory.
	pub fn with_bundle_root(mut self, root: impl Into<PathBuf>) -> Self {
		self.bundle_root = Some(root.into());

		self
	}

	/// Validates `credential` against `keypair` and builds the region-independent session.
	pub fn session(
		&self,
		credential: ExchangedCredential,
		keypair: Arc<Keypair>,
	) -> Result<SigningSession> {
		if credential.bound_public_key() != keypair.binding() {
			return Err(Error::CredentialUnverified {
				reason: "the credential is bound to a different public key".into(),
			});
		}

		let user =
			credential.subject().ok_or(Error::CredentialIncomplete { claim: "sub" })?.to_owned();
		let tenancy =
			credential.tenancy().ok_or(Error::CredentialIncomplete { claim: "tenant" })?.to_owned();

		Ok(SigningSession { credential, keypair, user, tenancy })
	}

	/// Builds an in-process signer for `region`.
	pub fn to_signer(
		&self,
		credential: &ExchangedCredential,
		keypair: &Arc<Keypair>,
		region: Region,
	) -> Result<RequestSigner> {
		obs::observe_sync(BrokerStage::Materialize, "to_signer", || {
			let session = self.session(credential.clone(), Arc::clone(keypair))?;

			Ok(Arc::new(session).for_region(region))
		})
	}

	/// Writes a credential bundle for `region`.
	pub fn to_bundle(
		&self,
		credential: &ExchangedCredential,
		keypair: &Arc<Keypair>,
		region: &Region,
	) -> Result<CredentialBundle> {
		obs::observe_sync(BrokerStage::Materialize, "to_bundle", || {
			let session = self.session(credential.clone(), Arc::clone(keypair))?;

			CredentialBundle::write(self.bundle_root.as_deref(), &session, region)
		})
	}

	/// Writes a credential bundle for an already validated session.
	pub fn bundle_for(
		&self,
		session: &SigningSession,
		region: &Region,
	) -> Result<CredentialBundle> {
		obs::observe_sync(BrokerStage::Materialize, "bundle_for", || {
			CredentialBundle::write(self.bundle_root.as_deref(), session, region)
		})
	}

	/// Materializes `credential` in the shape `capability` asks for.
	pub fn materialize(
		&self,
		credential: &ExchangedCredential,
		keypair: &Arc<Keypair>,
		region: Region,
		capability: Capability,
	) -> Result<MaterializedSigner> {
		match capability {
			Capability::InProcess =>
				self.to_signer(credential, keypair, region).map(MaterializedSigner::InProcess),
			Capability::Bundle =>
				self.to_bundle(credential, keypair, &region).map(MaterializedSigner::Bundle),
		}
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::{_preludet::*, credential::SessionClaims};

	fn credential(sub: Option<&str>, tenant: Option<&str>) -> ExchangedCredential {
		ExchangedCredential::new(
			"upst-token",
			test_keypair().binding().clone(),
			SessionClaims {
				sub: sub.map(str::to_owned),
				tenant: tenant.map(str::to_owned),
				iat: None,
				exp: (OffsetDateTime::now_utc() + Duration::hours(1)).unix_timestamp(),
				jti: None,
			},
		)
	}

	fn region() -> Region {
		Region::new("us-phoenix-1").expect("Region fixture should be valid.")
	}

	#[test]
	fn missing_identity_claims_are_incomplete() {
		let materializer = Materializer::new();
		let keypair = test_keypair();

		assert!(matches!(
			materializer.to_signer(&credential(None, Some("tenantA")), &keypair, region()),
			Err(Error::CredentialIncomplete { claim: "sub" })
		));
		assert!(matches!(
			materializer.to_bundle(&credential(Some("alice"), None), &keypair, &region()),
			Err(Error::CredentialIncomplete { claim: "tenant" })
		));
	}

	#[test]
	fn capability_selects_the_materialized_shape() {
		let materializer = Materializer::new();
		let keypair = test_keypair();
		let cred = credential(Some("alice"), Some("tenantA"));

		assert!(matches!(
			materializer.materialize(&cred, &keypair, region(), Capability::InProcess),
			Ok(MaterializedSigner::InProcess(signer)) if signer.region().as_ref() == "us-phoenix-1"
		));
		assert!(matches!(
			materializer.materialize(&cred, &keypair, region(), Capability::Bundle),
			Ok(MaterializedSigner::Bundle(bundle)) if bundle.env()["OCI_CLI_USER"] == "alice"
		));
	}

	#[test]
	fn credentials_bound_to_other_keys_are_rejected() {
		let foreign = ExchangedCredential::new(
			"upst-token",
			serde_json::from_str("\"MIIBforeign\"").expect("Binding should deserialize."),
			credential(Some("alice"), Some("tenantA")).claims().clone(),
		);

		assert!(matches!(
			Materializer::new().session(foreign, test_keypair()),
			Err(Error::CredentialUnverified { .. })
		));
	}
}
