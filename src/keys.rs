//! Process-lifetime RSA keypair that binds exchanged session credentials to this broker.
//!
//! The public half travels to the identity provider during the exchange; the private half signs
//! downstream requests and is handed to the CLI through a transient key file. Nothing here ever
//! touches persistent storage.

// crates.io
use base64::{Engine as _, engine::general_purpose::STANDARD};
use md5::{Digest as _, Md5};
use rsa::{
	RsaPrivateKey,
	pkcs1v15::SigningKey,
	pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding},
	rand_core::OsRng,
	signature::{SignatureEncoding, Signer},
};
use sha2::Sha256;
use zeroize::Zeroizing;
// self
use crate::_prelude::*;

/// Modulus size used for broker keypairs.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Keypair generation, encoding, and signing failures.
#[derive(Debug, ThisError)]
pub enum KeyError {
	/// The RNG or RSA key generation failed.
	#[error("RSA key generation failed.")]
	Generation(#[source] rsa::Error),
	/// The key could not be encoded to DER/PEM.
	#[error("Key encoding failed: {reason}.")]
	Encoding {
		/// Encoder failure summary.
		reason: String,
	},
	/// Producing a signature failed.
	#[error("Signing failed.")]
	Signing(#[source] rsa::signature::Error),
}

/// Public-key binding parameter sent with every token exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyBinding(String);
impl PublicKeyBinding {
	/// Base64 (standard alphabet) encoding of the SubjectPublicKeyInfo DER.
	pub fn as_str(&self) -> &str {
		&self.0
	}
}
impl Display for PublicKeyBinding {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(&self.0)
	}
}

/// Asymmetric keypair created once per broker process and shared read-only.
pub struct Keypair {
	signing_key: SigningKey<Sha256>,
	binding: PublicKeyBinding,
	private_key_pem: Zeroizing<String>,
	fingerprint: String,
}
impl Keypair {
	/// Generates a fresh [`DEFAULT_KEY_BITS`]-bit keypair.
	pub fn generate() -> Result<Self, KeyError> {
		Self::generate_with_bits(DEFAULT_KEY_BITS)
	}

	/// Generates a fresh keypair with the provided modulus size.
	pub fn generate_with_bits(bits: usize) -> Result<Self, KeyError> {
		let private = RsaPrivateKey::new(&mut OsRng, bits).map_err(KeyError::Generation)?;

		Self::from_private_key(private)
	}

	/// Wraps an existing private key.
	pub fn from_private_key(private: RsaPrivateKey) -> Result<Self, KeyError> {
		let public_der = private
			.to_public_key()
			.to_public_key_der()
			.map_err(|e| KeyError::Encoding { reason: e.to_string() })?;
		let private_key_pem = private
			.to_pkcs8_pem(LineEnding::LF)
			.map_err(|e| KeyError::Encoding { reason: e.to_string() })?;
		let fingerprint = Md5::digest(public_der.as_bytes())
			.iter()
			.map(|byte| format!("{byte:02x}"))
			.collect::<Vec<_>>()
			.join(":");

		Ok(Self {
			signing_key: SigningKey::new(private),
			binding: PublicKeyBinding(STANDARD.encode(public_der.as_bytes())),
			private_key_pem,
			fingerprint,
		})
	}

	/// Binding parameter (base64 DER public key) presented to the identity provider.
	pub fn binding(&self) -> &PublicKeyBinding {
		&self.binding
	}

	/// Base64 DER public key.
	pub fn public_key_der_base64(&self) -> &str {
		self.binding.as_str()
	}

	/// PKCS#8 PEM private key. Callers must only write it to owner-only files.
	pub fn private_key_pem(&self) -> &str {
		&self.private_key_pem
	}

	/// MD5 fingerprint of the public key DER, colon-separated lowercase hex.
	pub fn fingerprint(&self) -> &str {
		&self.fingerprint
	}

	/// Signs `message` with RSASSA-PKCS1-v1_5 over SHA-256.
	pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeyError> {
		self.signing_key.try_sign(message).map(|sig| sig.to_vec()).map_err(KeyError::Signing)
	}
}
impl Debug for Keypair {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Keypair")
			.field("fingerprint", &self.fingerprint)
			.field("private_key", &"<redacted>")
			.finish()
	}
}
