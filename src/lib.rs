//! Token-exchange broker that turns upstream OIDC bearer tokens into key-bound OCI session
//! credentials (UPSTs), caches them per caller, and materializes them for in-process request
//! signing or for CLI invocations.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod auth;
pub mod broker;
pub mod cache;
pub mod config;
pub mod credential;
pub mod downstream;
pub mod error;
pub mod exchange;
pub mod executor;
pub mod ext;
pub mod http;
pub mod keys;
pub mod materialize;
pub mod obs;
pub mod policy;
pub mod provider;
pub mod tools;
#[cfg(any(test, feature = "test"))]
pub mod _preludet {
	//! Convenience re-exports and fixtures for integration tests; enabled via `cfg(test)` or the
	//! `test` crate feature.

	pub use crate::_prelude::*;

	// std
	use std::sync::{
		OnceLock,
		atomic::{AtomicUsize, Ordering},
	};
	// crates.io
	use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
	use jsonwebtoken::{Algorithm, EncodingKey, Header};
	use rsa::{
		RsaPrivateKey, pkcs1::DecodeRsaPrivateKey, pkcs8::DecodePrivateKey, traits::PublicKeyParts,
	};
	use serde_json::{Value, json};
	// self
	use crate::{
		auth::UpstreamToken,
		credential::{ExchangedCredential, SessionClaims},
		exchange::{CredentialExchanger, ExchangeFuture, ReqwestExchangeClient, TokenExchangeClient},
		http::{ReqwestHttpClient, ReqwestTransportErrorMapper},
		keys::{Keypair, PublicKeyBinding},
		provider::ProviderDescriptor,
	};

	/// Key identifier advertised by the fixture identity provider.
	pub const IDP_KEY_ID: &str = "idp-test-key";
	/// Client identifier used by fixture exchange clients.
	pub const CLIENT_ID: &str = "broker-client";
	/// Client secret used by fixture exchange clients.
	pub const CLIENT_SECRET: &str = "broker-secret";

	const IDP_SIGNING_KEY_PEM: &str = include_str!("../tests/fixtures/idp_signing_key.pem");
	const BROKER_KEY_PEM: &str = include_str!("../tests/fixtures/broker_key.pem");

	/// Returns the process-wide fixture broker keypair (PKCS#8 fixture, no key generation).
	pub fn test_keypair() -> Arc<Keypair> {
		static KEYPAIR: OnceLock<Arc<Keypair>> = OnceLock::new();

		KEYPAIR
			.get_or_init(|| {
				let private = RsaPrivateKey::from_pkcs8_pem(BROKER_KEY_PEM)
					.expect("Broker key fixture should parse as PKCS#8.");

				Arc::new(
					Keypair::from_private_key(private)
						.expect("Broker key fixture should produce a keypair."),
				)
			})
			.clone()
	}

	/// JWKS document publishing the fixture identity provider's signing key.
	pub fn idp_jwks() -> Value {
		let private = RsaPrivateKey::from_pkcs1_pem(IDP_SIGNING_KEY_PEM)
			.expect("Identity provider key fixture should parse as PKCS#1.");

		json!({
			"keys": [{
				"kty": "RSA",
				"kid": IDP_KEY_ID,
				"use": "sig",
				"alg": "RS256",
				"n": URL_SAFE_NO_PAD.encode(private.n().to_bytes_be()),
				"e": URL_SAFE_NO_PAD.encode(private.e().to_bytes_be()),
			}]
		})
	}

	/// Signs arbitrary claims with the fixture identity provider key (RS256).
	pub fn sign_jwt(claims: &Value) -> String {
		sign_jwt_with_kid(claims, Some(IDP_KEY_ID))
	}

	/// Signs claims with the fixture key but advertises the provided `kid` header.
	pub fn sign_jwt_with_kid(claims: &Value, kid: Option<&str>) -> String {
		let key = EncodingKey::from_rsa_pem(IDP_SIGNING_KEY_PEM.as_bytes())
			.expect("Identity provider key fixture should load as an encoding key.");
		let mut header = Header::new(Algorithm::RS256);

		header.kid = kid.map(str::to_owned);

		jsonwebtoken::encode(&header, claims, &key).expect("Fixture JWT should encode.")
	}

	/// Session-token claims for the provided subject/tenancy that expire after `ttl`.
	pub fn session_claims(subject: &str, tenancy: &str, ttl: Duration) -> Value {
		let now = OffsetDateTime::now_utc().unix_timestamp();

		json!({
			"sub": subject,
			"tenant": tenancy,
			"iat": now,
			"exp": now + ttl.whole_seconds(),
			"jti": format!("upst-{subject}-{now}"),
		})
	}

	/// Builds an inbound bearer token for the provided subject/tenancy/token id.
	pub fn upstream_token(subject: &str, tenancy: &str, jti: &str) -> UpstreamToken {
		let now = OffsetDateTime::now_utc().unix_timestamp();
		let raw = sign_jwt(&json!({
			"sub": subject,
			"tenant": tenancy,
			"iss": "https://idcs.example.com",
			"jti": jti,
			"iat": now,
			"exp": now + 3_600,
			"scope": "openid",
		}));

		UpstreamToken::from_bearer(&raw).expect("Fixture upstream token should decode.")
	}

	/// Builds a reqwest client that accepts the self-signed certificates produced by `httpmock`.
	pub fn test_reqwest_client() -> ReqwestClient {
		ReqwestClient::builder()
			.danger_accept_invalid_certs(true)
			.danger_accept_invalid_hostnames(true)
			.redirect(reqwest::redirect::Policy::none())
			.build()
			.expect("Failed to build insecure Reqwest client for tests.")
	}

	/// Wraps [`test_reqwest_client`] in the broker's transport type.
	pub fn test_reqwest_http_client() -> ReqwestHttpClient {
		ReqwestHttpClient::with_client(test_reqwest_client())
	}

	/// Constructs an exchange client whose discovery document lives at
	/// `<base_url>/.well-known/openid-configuration`.
	pub fn build_reqwest_test_exchange_client(base_url: &str) -> ReqwestExchangeClient {
		let discovery = Url::parse(base_url)
			.and_then(|base| base.join("/.well-known/openid-configuration"))
			.expect("Mock discovery URL should parse.");
		let descriptor = ProviderDescriptor::builder()
			.discovery_url(discovery)
			.build()
			.expect("Mock provider descriptor should build.");

		TokenExchangeClient::with_http_client(
			descriptor,
			CLIENT_ID,
			CLIENT_SECRET,
			test_reqwest_http_client(),
			ReqwestTransportErrorMapper,
		)
	}

	/// Fake exchanger that mints credentials locally and counts invocations.
	#[derive(Debug)]
	pub struct CountingExchanger {
		calls: AtomicUsize,
		ttl: Duration,
		delay: std::time::Duration,
		tenancy: Option<String>,
	}
	impl CountingExchanger {
		/// Creates an exchanger issuing credentials valid for `ttl`.
		pub fn new(ttl: Duration) -> Self {
			Self {
				calls: AtomicUsize::new(0),
				ttl,
				delay: std::time::Duration::ZERO,
				tenancy: Some("tenantA".into()),
			}
		}

		/// Sleeps before answering so concurrent callers overlap.
		pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
			self.delay = delay;

			self
		}

		/// Omits the tenancy claim from minted credentials.
		pub fn without_tenancy(mut self) -> Self {
			self.tenancy = None;

			self
		}

		/// Number of exchanges performed so far.
		pub fn calls(&self) -> usize {
			self.calls.load(Ordering::SeqCst)
		}
	}
	impl CredentialExchanger for CountingExchanger {
		fn exchange<'a>(
			&'a self,
			token: &'a UpstreamToken,
			binding: &'a PublicKeyBinding,
		) -> ExchangeFuture<'a> {
			Box::pin(async move {
				let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

				if !self.delay.is_zero() {
					tokio::time::sleep(self.delay).await;
				}

				let now = OffsetDateTime::now_utc();
				let claims = SessionClaims {
					sub: Some(token.subject().to_owned()),
					tenant: self.tenancy.clone(),
					iat: Some(now.unix_timestamp()),
					exp: (now + self.ttl).unix_timestamp(),
					jti: Some(format!("upst-{call}")),
				};

				Ok(ExchangedCredential::new(
					format!("session-token-{call}"),
					binding.clone(),
					claims,
				))
			})
		}
	}
}

mod _prelude {
	pub use std::{
		collections::{BTreeMap, HashMap},
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		pin::Pin,
		str::FromStr,
		sync::Arc,
	};

	pub use async_lock::Mutex as AsyncMutex;
	pub use parking_lot::{Mutex, RwLock};
	pub use reqwest::{Client as ReqwestClient, Error as ReqwestError};
	pub use serde::{Deserialize, Serialize};
	pub use thiserror::Error as ThisError;
	pub use time::{Duration, OffsetDateTime};
	pub use url::Url;

	pub use crate::error::{Error, Result};
}

pub use reqwest;
pub use url;
#[cfg(test)] use httpmock as _;
