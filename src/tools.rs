//! Operations exposed to the agent gateway.
//!
//! Every authenticated tool takes the caller's [`UpstreamToken`]; sessions are resolved through
//! the broker's cache, so consecutive calls from one caller share a single exchange. A downstream
//! 401/403 invalidates the caller's session and the call is retried once with a fresh one.

// std
use std::path::Path;
// crates.io
use serde_json::{Value, json};
// self
use crate::{
	_prelude::*,
	auth::{Region, UpstreamToken},
	broker::Broker,
	config::BrokerConfig,
	downstream::DownstreamClient,
	exchange::{CredentialExchanger, ReqwestExchangeClient, TokenExchangeClient},
	executor::{CommandExecutor, CommandResult},
	keys::Keypair,
	obs,
	policy::{OpaPolicyClient, PolicyHook, PolicyInput},
};

/// Tool surface backed by a [`Broker`], a CLI executor, and a signed HTTP client.
pub struct ToolSurface<X = ReqwestExchangeClient>
where
	X: ?Sized + CredentialExchanger,
{
	broker: Broker<X>,
	executor: CommandExecutor,
	downstream: DownstreamClient,
	policy: Option<Arc<dyn PolicyHook>>,
}
impl<X> ToolSurface<X>
where
	X: ?Sized + CredentialExchanger,
{
	/// Creates a surface without an authorization hook.
	pub fn new(broker: Broker<X>, executor: CommandExecutor, downstream: DownstreamClient) -> Self {
		Self { broker, executor, downstream, policy: None }
	}

	/// Consults `policy` before every `run_command`.
	pub fn with_policy(mut self, policy: Arc<dyn PolicyHook>) -> Self {
		self.policy = Some(policy);

		self
	}

	/// Underlying broker.
	pub fn broker(&self) -> &Broker<X> {
		&self.broker
	}

	/// CLI executor.
	pub fn executor(&self) -> &CommandExecutor {
		&self.executor
	}

	/// Runs a CLI command (without the leading binary name) against `region` as the caller.
	///
	/// The command is split on whitespace into literal arguments. JSON stdout is parsed; other
	/// text is returned as a string.
	pub async fn run_command(
		&self,
		token: &UpstreamToken,
		command: &str,
		region: &Region,
	) -> Result<Value> {
		let args = self.parse_command(command)?;

		if let Some(policy) = &self.policy {
			let input = PolicyInput {
				tool: "run_command".into(),
				subject: token.subject().to_owned(),
				tenancy: token.tenancy().map(str::to_owned),
				command: args.clone(),
				region: Some(region.to_string()),
			};

			policy.authorize(&input).await?;
		}

		let result = self.run_bundled(token, &args, region).await?;

		if result.auth_failure() {
			self.broker.invalidate(token);

			obs::event!(info, tool = "run_command", "stale session credential, retrying once");

			return self.run_bundled(token, &args, region).await?.into_output();
		}

		result.into_output()
	}

	/// Returns the CLI help text for `command`; no credentials are involved.
	pub async fn command_help(&self, command: &str) -> Result<String> {
		let mut args = self.parse_command(command)?;

		args.push("--help".into());

		let result = self.executor.run_unauthenticated(&args).await?;

		if !result.success() {
			return Err(Error::DownstreamCallFailed {
				status: None,
				exit_code: Some(result.exit_code),
				detail: result.stderr.trim().to_owned(),
			});
		}

		Ok(result.stdout)
	}

	/// Lists the regions visible to the caller's tenancy, signing in-process for `region`.
	pub async fn list_regions(&self, token: &UpstreamToken, region: &Region) -> Result<Value> {
		self.signed_call(token, region, SignedCall::ListRegions).await
	}

	/// Returns the caller's object storage namespace in `region`.
	pub async fn get_namespace(&self, token: &UpstreamToken, region: &Region) -> Result<Value> {
		self.signed_call(token, region, SignedCall::GetNamespace).await
	}

	/// Describes the caller from the inbound token alone; never performs an exchange.
	pub fn whoami(&self, token: &UpstreamToken) -> Value {
		json!({
			"subject": token.subject(),
			"tenancy": token.tenancy(),
			"issuer": token.issuer(),
			"token_id": token.id().as_ref(),
			"expires_at": token.expires_at().map(OffsetDateTime::unix_timestamp),
		})
	}

	/// Raw inbound bearer token, for diagnostics.
	pub fn access_token(&self, token: &UpstreamToken) -> String {
		token.raw().expose().to_owned()
	}

	/// Every claim of the inbound bearer token, for diagnostics.
	pub fn access_token_claims(&self, token: &UpstreamToken) -> Value {
		Value::Object(token.claim_set().clone())
	}

	/// Liveness probe; requires no authentication.
	pub fn health(&self) -> &'static str {
		"OK"
	}

	/// Evicts expired cached sessions.
	pub fn purge_expired(&self) -> usize {
		self.broker.purge_expired()
	}

	fn parse_command(&self, command: &str) -> Result<Vec<String>> {
		let args = command.split_whitespace().map(str::to_owned).collect::<Vec<_>>();
		let Some(first) = args.first() else {
			return Err(Error::InvalidCommand { reason: "the command is empty".into() });
		};
		let binary_name = Path::new(self.executor.binary())
			.file_name()
			.and_then(|name| name.to_str())
			.unwrap_or(CommandExecutor::DEFAULT_BINARY);

		if first == binary_name || first == CommandExecutor::DEFAULT_BINARY {
			return Err(Error::InvalidCommand {
				reason: format!("omit the leading `{first}`; pass only its arguments"),
			});
		}

		Ok(args)
	}

	async fn run_bundled(
		&self,
		token: &UpstreamToken,
		args: &[String],
		region: &Region,
	) -> Result<CommandResult> {
		let bundle = self.broker.bundle(token, region).await?;
		let result = self.executor.run(args, &bundle).await;
		let released = bundle.release();
		let result = result?;

		released?;

		Ok(result)
	}

	async fn signed_call(
		&self,
		token: &UpstreamToken,
		region: &Region,
		call: SignedCall,
	) -> Result<Value> {
		let mut retried = false;

		loop {
			let signer = self.broker.signer(token, region).await?;
			let result = match call {
				SignedCall::ListRegions => self.downstream.list_regions(&signer).await,
				SignedCall::GetNamespace => self.downstream.get_namespace(&signer).await,
			};

			match result {
				Err(e) if e.is_stale_credential() && !retried => {
					retried = true;

					self.broker.invalidate(token);

					obs::event!(
						info,
						tool = call.as_str(),
						"stale session credential, retrying once"
					);
				},
				result => return result,
			}
		}
	}
}
impl ToolSurface<ReqwestExchangeClient> {
	/// Performs startup: generates the keypair and builds every HTTP client.
	///
	/// Fails fast on keypair generation or client construction errors.
	pub fn from_config(config: &BrokerConfig) -> Result<Self> {
		let keypair = Keypair::generate()?;
		let exchanger = TokenExchangeClient::new(
			config.descriptor.clone(),
			config.client_id.as_str(),
			config.client_secret.expose(),
		)?;
		let broker = Broker::new(keypair, exchanger).with_refresh_window(config.refresh_window);
		let downstream = DownstreamClient::new(config.endpoints.clone())?;
		let surface = Self::new(broker, config.cli.executor(), downstream);

		match &config.policy {
			Some(policy) => {
				let client = OpaPolicyClient::new(&policy.url, &policy.package, &policy.rule)?;

				Ok(surface.with_policy(Arc::new(client)))
			},
			None => Ok(surface),
		}
	}
}
impl<X> Debug for ToolSurface<X>
where
	X: ?Sized + CredentialExchanger,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ToolSurface")
			.field("broker", &self.broker)
			.field("executor", &self.executor)
			.field("downstream", &self.downstream)
			.field("policy", &self.policy.is_some())
			.finish()
	}
}

#[derive(Clone, Copy, Debug)]
enum SignedCall {
	ListRegions,
	GetNamespace,
}
impl SignedCall {
	#[cfg_attr(not(feature = "tracing"), allow(dead_code))]
	fn as_str(self) -> &'static str {
		match self {
			Self::ListRegions => "list_regions",
			Self::GetNamespace => "get_namespace",
		}
	}
}
