// crates.io
use httpmock::prelude::*;
use serde_json::{Value, json};
// self
use upst_broker::{
	_preludet::*,
	auth::Region,
	broker::Broker,
	downstream::{DownstreamClient, DownstreamEndpoints},
	executor::CommandExecutor,
	http::ReqwestTransportErrorMapper,
	policy::{OpaPolicyClient, PolicyHook, PolicyInput, ReqwestOpaPolicyClient},
	tools::ToolSurface,
};

fn input() -> PolicyInput {
	PolicyInput {
		tool: "run_command".into(),
		subject: "alice".into(),
		tenancy: Some("tenantA".into()),
		command: vec!["os".into(), "ns".into(), "get".into()],
		region: Some("us-ashburn-1".into()),
	}
}

fn client(base: &str, package: &str) -> ReqwestOpaPolicyClient {
	let base = Url::parse(base).expect("Policy base URL should parse.");

	OpaPolicyClient::with_http_client(
		&base,
		package,
		"allow",
		test_reqwest_http_client(),
		ReqwestTransportErrorMapper,
	)
	.expect("Policy client should build.")
}

async fn mock_decision<'a>(
	server: &'a MockServer,
	path: &str,
	result: Value,
) -> httpmock::Mock<'a> {
	server
		.mock_async(|when, then| {
			when.method(POST)
				.path(path)
				.header("content-type", "application/json")
				.json_body(json!({ "input": input() }));
			then.status(200).header("content-type", "application/json").json_body(result);
		})
		.await
}

#[tokio::test]
async fn explicit_denial_exits_with_code_two() {
	let server = MockServer::start_async().await;
	let denied = json!({ "result": { "allow": false } });
	let decision = mock_decision(&server, "/v1/data/mcp/allow", denied).await;
	let err = client(&server.base_url(), "mcp")
		.authorize(&input())
		.await
		.expect_err("An explicit denial must fail authorization.");

	assert!(matches!(
		&err,
		Error::PolicyDenied { package, rule } if package == "mcp" && rule == "allow"
	));
	assert_eq!(err.exit_code(), 2);

	decision.assert_async().await;
}

#[tokio::test]
async fn allow_results_in_either_shape_pass() {
	let server = MockServer::start_async().await;
	let boolean =
		mock_decision(&server, "/v1/data/mcp/tools/allow", json!({ "result": true })).await;

	client(&server.base_url(), "mcp.tools")
		.authorize(&input())
		.await
		.expect("A `true` result should allow.");

	let allowed = json!({ "result": { "allow": true } });
	let nested = mock_decision(&server, "/v1/data/mcp/allow", allowed).await;

	client(&server.base_url(), "mcp")
		.authorize(&input())
		.await
		.expect("An `allow: true` result should allow.");

	boolean.assert_async().await;
	nested.assert_async().await;
}

#[tokio::test]
async fn undefined_results_deny() {
	let server = MockServer::start_async().await;
	let _decision = mock_decision(&server, "/v1/data/mcp/allow", json!({})).await;
	let err = client(&server.base_url(), "mcp")
		.authorize(&input())
		.await
		.expect_err("An undefined decision must deny.");

	assert!(matches!(err, Error::PolicyDenied { .. }), "Unexpected error: {err:?}.");
}

#[tokio::test]
async fn unreachable_policy_service_fails_with_code_one() {
	let err = client("http://127.0.0.1:1", "mcp")
		.authorize(&input())
		.await
		.expect_err("A refused connection must fail evaluation.");

	assert!(matches!(err, Error::PolicyEvaluationFailed { .. }), "Unexpected error: {err:?}.");
	assert_eq!(err.exit_code(), 1);
}

#[tokio::test]
async fn policy_server_errors_fail_evaluation() {
	let server = MockServer::start_async().await;
	let _decision = server
		.mock_async(|when, then| {
			when.method(POST).path("/v1/data/mcp/allow");
			then.status(500).body("internal error");
		})
		.await;
	let err = client(&server.base_url(), "mcp")
		.authorize(&input())
		.await
		.expect_err("A 500 from the policy service must fail evaluation.");

	assert!(matches!(err, Error::PolicyEvaluationFailed { .. }), "Unexpected error: {err:?}.");
	assert_eq!(err.exit_code(), 1);
}

#[tokio::test]
async fn denied_commands_never_reach_the_exchange() {
	let server = MockServer::start_async().await;
	let decision = mock_decision(&server, "/v1/data/mcp/allow", json!({ "result": false })).await;
	let broker = Broker::new(test_keypair(), CountingExchanger::new(Duration::hours(1)));
	let downstream =
		DownstreamClient::with_client(test_reqwest_client(), DownstreamEndpoints::default());
	let surface = ToolSurface::new(broker, CommandExecutor::new("sh"), downstream)
		.with_policy(Arc::new(client(&server.base_url(), "mcp")));
	let token = upstream_token("alice", "tenantA", "jti-policy");
	let region = Region::new("us-ashburn-1").expect("Region fixture should be valid.");
	let err = surface
		.run_command(&token, "os ns get", &region)
		.await
		.expect_err("A denied command must not run.");

	assert!(matches!(err, Error::PolicyDenied { .. }), "Unexpected error: {err:?}.");
	assert_eq!(surface.broker().exchanger.calls(), 0);

	decision.assert_async().await;
}
