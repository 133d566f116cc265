//! Startup configuration gathered from the process environment.
//!
//! Required: `IDCS_DOMAIN`, `IDCS_CLIENT_ID`, `IDCS_CLIENT_SECRET`. Optional: `OCI_CLI_BINARY`,
//! `OCI_CLI_TIMEOUT_SECS`, `UPST_REFRESH_WINDOW_SECS`, `OPA_URL`, `OPA_PACKAGE`, `OPA_RULE`.

// self
use crate::{
	_prelude::*,
	auth::TokenSecret,
	cache::SignerCache,
	downstream::DownstreamEndpoints,
	error::ConfigError,
	executor::CommandExecutor,
	materialize::SigningSession,
	policy::{DEFAULT_PACKAGE, DEFAULT_RULE},
	provider::ProviderDescriptor,
};

/// CLI invocation settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CliConfig {
	/// Binary name or path.
	pub binary: String,
	/// Arguments prepended to every invocation.
	pub base_args: Vec<String>,
	/// Per-invocation timeout.
	pub timeout: Option<std::time::Duration>,
}
impl CliConfig {
	/// Builds the executor described by this configuration.
	pub fn executor(&self) -> CommandExecutor {
		let executor =
			CommandExecutor::new(&self.binary).with_base_args(self.base_args.iter().cloned());

		match self.timeout {
			Some(timeout) => executor.with_timeout(timeout),
			None => executor,
		}
	}
}
impl Default for CliConfig {
	fn default() -> Self {
		Self {
			binary: CommandExecutor::DEFAULT_BINARY.into(),
			base_args: Vec::new(),
			timeout: None,
		}
	}
}

/// Authorization hook location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyConfig {
	/// OPA server base URL.
	pub url: Url,
	/// Package consulted (dot or slash separated).
	pub package: String,
	/// Rule consulted.
	pub rule: String,
}

/// Everything [`ToolSurface::from_config`](crate::tools::ToolSurface::from_config) needs.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
	/// Upstream provider descriptor.
	pub descriptor: ProviderDescriptor,
	/// Client identifier registered with the provider.
	pub client_id: String,
	/// Client secret registered with the provider.
	pub client_secret: TokenSecret,
	/// CLI settings.
	pub cli: CliConfig,
	/// Downstream endpoint templates.
	pub endpoints: DownstreamEndpoints,
	/// Signer cache pre-emptive refresh window.
	pub refresh_window: Duration,
	/// Optional authorization hook.
	pub policy: Option<PolicyConfig>,
}
impl BrokerConfig {
	/// Reads the configuration from the process environment.
	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_lookup(|name| std::env::var(name).ok())
	}

	/// Reads the configuration through `lookup`; empty values count as absent.
	pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		let get = |name: &str| {
			lookup(name).map(|value| value.trim().to_owned()).filter(|value| !value.is_empty())
		};
		let require = |name: &'static str| get(name).ok_or(ConfigError::MissingVariable { name });
		let descriptor = ProviderDescriptor::for_domain(&require("IDCS_DOMAIN")?)?;
		let client_id = require("IDCS_CLIENT_ID")?;
		let client_secret = TokenSecret::new(require("IDCS_CLIENT_SECRET")?);
		let mut cli = CliConfig::default();

		if let Some(binary) = get("OCI_CLI_BINARY") {
			cli.binary = binary;
		}
		if let Some(secs) = get("OCI_CLI_TIMEOUT_SECS") {
			let secs = parse_number::<u64>("OCI_CLI_TIMEOUT_SECS", &secs)?;

			if secs == 0 {
				return Err(invalid("OCI_CLI_TIMEOUT_SECS", "must be greater than zero"));
			}

			cli.timeout = Some(std::time::Duration::from_secs(secs));
		}

		let refresh_window = match get("UPST_REFRESH_WINDOW_SECS") {
			Some(secs) => {
				let secs = parse_number::<i64>("UPST_REFRESH_WINDOW_SECS", &secs)?;

				let window = Duration::seconds(secs);

				if window.is_negative() {
					return Err(invalid("UPST_REFRESH_WINDOW_SECS", "cannot be negative"));
				}
				if window > SignerCache::<SigningSession>::MAX_REFRESH_WINDOW {
					return Err(invalid("UPST_REFRESH_WINDOW_SECS", "cannot exceed one day"));
				}

				window
			},
			None => SignerCache::<SigningSession>::DEFAULT_REFRESH_WINDOW,
		};
		let policy = match get("OPA_URL") {
			Some(url) => Some(PolicyConfig {
				url: Url::parse(&url).map_err(|e| invalid("OPA_URL", &e.to_string()))?,
				package: get("OPA_PACKAGE").unwrap_or_else(|| DEFAULT_PACKAGE.into()),
				rule: get("OPA_RULE").unwrap_or_else(|| DEFAULT_RULE.into()),
			}),
			None => None,
		};

		Ok(Self {
			descriptor,
			client_id,
			client_secret,
			cli,
			endpoints: DownstreamEndpoints::default(),
			refresh_window,
			policy,
		})
	}
}

fn parse_number<T>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
	T: FromStr,
	T::Err: Display,
{
	raw.parse().map_err(|e: T::Err| invalid(name, &e.to_string()))
}

fn invalid(name: &'static str, reason: &str) -> ConfigError {
	ConfigError::InvalidVariable { name, reason: reason.into() }
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
		let vars = vars
			.iter()
			.map(|(name, value)| (name.to_string(), value.to_string()))
			.collect::<HashMap<_, _>>();

		move |name| vars.get(name).cloned()
	}

	const REQUIRED: [(&str, &str); 3] = [
		("IDCS_DOMAIN", "idcs-abc.identity.oraclecloud.com"),
		("IDCS_CLIENT_ID", "client"),
		("IDCS_CLIENT_SECRET", "secret"),
	];

	#[test]
	fn required_variables_with_defaults() {
		let config =
			BrokerConfig::from_lookup(lookup(&REQUIRED)).expect("Minimal config should load.");

		assert_eq!(
			config.descriptor.discovery_url.as_str(),
			"https://idcs-abc.identity.oraclecloud.com/.well-known/openid-configuration"
		);
		assert_eq!(config.client_id, "client");
		assert_eq!(config.client_secret.expose(), "secret");
		assert_eq!(config.cli, CliConfig::default());
		assert_eq!(config.refresh_window, Duration::seconds(60));
		assert!(config.policy.is_none());
		assert!(!format!("{config:?}").contains("secret\""));
	}

	#[test]
	fn missing_required_variables_fail_fast() {
		for missing in ["IDCS_DOMAIN", "IDCS_CLIENT_ID", "IDCS_CLIENT_SECRET"] {
			let vars =
				REQUIRED.iter().copied().filter(|(name, _)| *name != missing).collect::<Vec<_>>();
			let err =
				BrokerConfig::from_lookup(lookup(&vars)).expect_err("Missing variable must fail.");

			assert!(matches!(err, ConfigError::MissingVariable { name } if name == missing));
		}

		let blank = [("IDCS_DOMAIN", "  "), REQUIRED[1], REQUIRED[2]];

		assert!(matches!(
			BrokerConfig::from_lookup(lookup(&blank)),
			Err(ConfigError::MissingVariable { name: "IDCS_DOMAIN" })
		));
	}

	#[test]
	fn optional_variables_override_defaults() {
		let mut vars = REQUIRED.to_vec();

		vars.extend([
			("OCI_CLI_BINARY", "/opt/oci/bin/oci"),
			("OCI_CLI_TIMEOUT_SECS", "45"),
			("UPST_REFRESH_WINDOW_SECS", "120"),
			("OPA_URL", "http://localhost:8181"),
			("OPA_RULE", "permit"),
		]);

		let config = BrokerConfig::from_lookup(lookup(&vars)).expect("Full config should load.");
		let policy = config.policy.expect("Policy should be configured.");

		assert_eq!(config.cli.binary, "/opt/oci/bin/oci");
		assert_eq!(config.cli.timeout, Some(std::time::Duration::from_secs(45)));
		assert_eq!(config.refresh_window, Duration::seconds(120));
		assert_eq!(policy.package, "mcp");
		assert_eq!(policy.rule, "permit");
	}

	#[test]
	fn invalid_numbers_are_reported_by_name() {
		let mut vars = REQUIRED.to_vec();

		vars.push(("OCI_CLI_TIMEOUT_SECS", "soon"));

		assert!(matches!(
			BrokerConfig::from_lookup(lookup(&vars)),
			Err(ConfigError::InvalidVariable { name: "OCI_CLI_TIMEOUT_SECS", .. })
		));
	}

	#[test]
	fn refresh_windows_outside_zero_to_one_day_are_rejected() {
		for window in ["-1", "86401", "9223372036854775807"] {
			let mut vars = REQUIRED.to_vec();

			vars.push(("UPST_REFRESH_WINDOW_SECS", window));

			assert!(
				matches!(
					BrokerConfig::from_lookup(lookup(&vars)),
					Err(ConfigError::InvalidVariable { name: "UPST_REFRESH_WINDOW_SECS", .. })
				),
				"Window `{window}` must be rejected."
			);
		}
	}
}
