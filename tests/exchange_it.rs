// crates.io
use httpmock::prelude::*;
use serde_json::json;
// self
use upst_broker::{
	_preludet::*,
	exchange::{CredentialExchanger, ReqwestExchangeClient},
	keys::Keypair,
	provider::{OCI_UPST_TOKEN_TYPE, TOKEN_EXCHANGE_GRANT},
};

async fn mock_discovery(server: &MockServer) -> httpmock::Mock<'_> {
	server
		.mock_async(|when, then| {
			when.method(GET).path("/.well-known/openid-configuration");
			then.status(200).header("content-type", "application/json").json_body(json!({
				"issuer": server.base_url(),
				"token_endpoint": server.url("/oauth2/v1/token"),
				"jwks_uri": server.url("/admin/v1/SigningCert/jwk"),
			}));
		})
		.await
}

async fn mock_jwks(server: &MockServer) -> httpmock::Mock<'_> {
	server
		.mock_async(|when, then| {
			when.method(GET).path("/admin/v1/SigningCert/jwk");
			then.status(200).header("content-type", "application/json").json_body(idp_jwks());
		})
		.await
}

fn client(server: &MockServer) -> ReqwestExchangeClient {
	build_reqwest_test_exchange_client(&server.base_url())
}

fn keypair() -> Arc<Keypair> {
	test_keypair()
}

#[tokio::test]
async fn exchange_returns_a_verified_bound_credential() {
	let server = MockServer::start_async().await;
	let discovery = mock_discovery(&server).await;
	let jwks = mock_jwks(&server).await;
	let session = sign_jwt(&session_claims("alice", "tenantA", Duration::hours(1)));
	let keypair = keypair();
	let token = upstream_token("alice", "tenantA", "jti-exchange-ok");
	let exchange = server
		.mock_async(|when, then| {
			when.method(POST)
				.path("/oauth2/v1/token")
				.header("content-type", "application/x-www-form-urlencoded")
				.header_exists("authorization")
				.form_urlencoded_tuple("grant_type", TOKEN_EXCHANGE_GRANT)
				.form_urlencoded_tuple("requested_token_type", OCI_UPST_TOKEN_TYPE)
				.form_urlencoded_tuple("public_key", keypair.public_key_der_base64())
				.form_urlencoded_tuple("subject_token", token.raw().expose())
				.form_urlencoded_tuple("subject_token_type", "jwt");
			then.status(200)
				.header("content-type", "application/json")
				.json_body(json!({ "token": session }));
		})
		.await;
	let client = client(&server);
	let credential = client
		.exchange(&token, keypair.binding())
		.await
		.expect("Exchange against the mock provider should succeed.");

	assert_eq!(credential.session_token().expose(), session);
	assert_eq!(credential.subject(), Some("alice"));
	assert_eq!(credential.tenancy(), Some("tenantA"));
	assert_eq!(credential.bound_public_key(), keypair.binding());
	assert!(credential.expires_at() > OffsetDateTime::now_utc());

	exchange.assert_async().await;
	discovery.assert_async().await;
	jwks.assert_async().await;
}

#[tokio::test]
async fn discovery_and_jwks_are_reused_across_exchanges() {
	let server = MockServer::start_async().await;
	let discovery = mock_discovery(&server).await;
	let jwks = mock_jwks(&server).await;
	let session = sign_jwt(&session_claims("bob", "tenantB", Duration::hours(1)));
	let exchange = server
		.mock_async(|when, then| {
			when.method(POST).path("/oauth2/v1/token");
			then.status(200)
				.header("content-type", "application/json")
				.json_body(json!({ "token": session }));
		})
		.await;
	let client = client(&server);
	let keypair = keypair();

	for jti in ["jti-reuse-1", "jti-reuse-2", "jti-reuse-3"] {
		client
			.exchange(&upstream_token("bob", "tenantB", jti), keypair.binding())
			.await
			.expect("Repeated exchanges should succeed.");
	}

	exchange.assert_calls_async(3).await;
	discovery.assert_calls_async(1).await;
	jwks.assert_calls_async(1).await;
}

#[tokio::test]
async fn provider_rejection_surfaces_status_and_body() {
	let server = MockServer::start_async().await;
	let _discovery = mock_discovery(&server).await;
	let exchange = server
		.mock_async(|when, then| {
			when.method(POST).path("/oauth2/v1/token");
			then.status(400)
				.header("content-type", "application/json")
				.body(r#"{"error":"invalid_grant","error_description":"subject token expired"}"#);
		})
		.await;
	let err = client(&server)
		.exchange(&upstream_token("carol", "tenantC", "jti-rejected"), keypair().binding())
		.await
		.expect_err("A 400 from the provider must fail the exchange.");

	match err {
		Error::ExchangeRejected { status, body } => {
			assert_eq!(status, 400);
			assert!(body.contains("invalid_grant"));
		},
		other => panic!("Unexpected error: {other:?}."),
	}

	exchange.assert_async().await;
}

#[tokio::test]
async fn malformed_exchange_responses_report_the_failing_path() {
	let server = MockServer::start_async().await;
	let _discovery = mock_discovery(&server).await;
	let _exchange = server
		.mock_async(|when, then| {
			when.method(POST).path("/oauth2/v1/token");
			then.status(200).header("content-type", "application/json").body(r#"{"token":42}"#);
		})
		.await;
	let err = client(&server)
		.exchange(&upstream_token("dave", "tenantD", "jti-malformed"), keypair().binding())
		.await
		.expect_err("A non-string token must be rejected.");

	match err {
		Error::ExchangeMalformedResponse { reason, .. } => assert!(reason.contains("`token`")),
		other => panic!("Unexpected error: {other:?}."),
	}
}

#[tokio::test]
async fn unreachable_provider_is_unavailable() {
	let err = build_reqwest_test_exchange_client("http://127.0.0.1:1")
		.exchange(&upstream_token("erin", "tenantE", "jti-unreachable"), keypair().binding())
		.await
		.expect_err("A closed port must fail the exchange.");

	assert!(matches!(err, Error::ExchangeUnavailable(_)), "Unexpected error: {err:?}.");
}

#[tokio::test]
async fn forged_session_tokens_are_unverified() {
	let server = MockServer::start_async().await;
	let _discovery = mock_discovery(&server).await;
	let jwks = mock_jwks(&server).await;
	let genuine = sign_jwt(&session_claims("frank", "tenantF", Duration::hours(1)));
	let (head, rest) = genuine.split_once('.').expect("JWT should contain a header.");
	let (_, signature) = rest.split_once('.').expect("JWT should contain a signature.");
	let forged_payload = sign_jwt(&session_claims("mallory", "tenantF", Duration::hours(1)));
	let forged_payload = forged_payload.split('.').nth(1).expect("JWT should contain a payload.");
	let forged = format!("{head}.{forged_payload}.{signature}");
	let _exchange = server
		.mock_async(|when, then| {
			when.method(POST).path("/oauth2/v1/token");
			then.status(200)
				.header("content-type", "application/json")
				.json_body(json!({ "token": forged }));
		})
		.await;
	let err = client(&server)
		.exchange(&upstream_token("frank", "tenantF", "jti-forged"), keypair().binding())
		.await
		.expect_err("A token with a mismatched signature must be rejected.");

	assert!(matches!(err, Error::CredentialUnverified { .. }), "Unexpected error: {err:?}.");

	jwks.assert_async().await;
}

#[tokio::test]
async fn unknown_kid_refreshes_the_key_set_once() {
	let server = MockServer::start_async().await;
	let _discovery = mock_discovery(&server).await;
	let jwks = mock_jwks(&server).await;
	let session = sign_jwt_with_kid(
		&session_claims("grace", "tenantG", Duration::hours(1)),
		Some("rotated-key"),
	);
	let _exchange = server
		.mock_async(|when, then| {
			when.method(POST).path("/oauth2/v1/token");
			then.status(200)
				.header("content-type", "application/json")
				.json_body(json!({ "token": session }));
		})
		.await;
	let err = client(&server)
		.exchange(&upstream_token("grace", "tenantG", "jti-rotated"), keypair().binding())
		.await
		.expect_err("A token signed by an unpublished key must be rejected.");

	assert!(matches!(err, Error::CredentialUnverified { .. }), "Unexpected error: {err:?}.");

	jwks.assert_calls_async(2).await;
}
