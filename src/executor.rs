//! Downstream CLI invocation with a per-call credential bundle.
//!
//! Arguments are handed to the binary as a literal vector; no shell ever parses them. The child
//! inherits the broker's environment with the bundle's mapping overlaid on the child only, and
//! it is killed when the call is cancelled or times out.

// std
use std::process::Stdio;
// crates.io
use serde_json::Value;
use tokio::process::Command;
// self
use crate::{
	_prelude::*,
	materialize::CredentialBundle,
	obs::{self, BrokerStage},
};

/// Captured outcome of one CLI invocation; a non-zero exit is data, not an error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CommandResult {
	/// Captured standard output.
	pub stdout: String,
	/// Captured standard error.
	pub stderr: String,
	/// Exit code (`-1` when the child was terminated by a signal).
	pub exit_code: i32,
}
impl CommandResult {
	/// Returns `true` on a zero exit code.
	pub fn success(&self) -> bool {
		self.exit_code == 0
	}

	/// HTTP status reported in a CLI `ServiceError` on stderr, if any.
	pub fn service_status(&self) -> Option<u16> {
		let start = self.stderr.find('{')?;
		let mut stream =
			serde_json::Deserializer::from_str(&self.stderr[start..]).into_iter::<Value>();
		let status = stream.next()?.ok()?.get("status")?.as_u64()?;

		u16::try_from(status).ok()
	}

	/// Returns `true` when the CLI reports that the presented credential was not accepted.
	pub fn auth_failure(&self) -> bool {
		!self.success()
			&& (matches!(self.service_status(), Some(401 | 403))
				|| self.stderr.contains("NotAuthenticated"))
	}

	/// Parses stdout as JSON, passing non-JSON text through as a string.
	///
	/// A non-zero exit or empty stdout becomes [`Error::DownstreamCallFailed`] carrying stderr.
	pub fn into_output(self) -> Result<Value> {
		if !self.success() {
			let status = if self.auth_failure() {
				self.service_status().or(Some(401))
			} else {
				self.service_status()
			};

			return Err(Error::DownstreamCallFailed {
				status,
				exit_code: Some(self.exit_code),
				detail: failure_detail(&self.stderr, &self.stdout),
			});
		}

		let stdout = self.stdout.trim();

		if stdout.is_empty() {
			return Err(Error::DownstreamCallFailed {
				status: None,
				exit_code: Some(self.exit_code),
				detail: failure_detail(&self.stderr, "the command produced no output"),
			});
		}

		Ok(serde_json::from_str(stdout).unwrap_or_else(|_| Value::String(stdout.to_owned())))
	}
}

/// Runs the downstream CLI.
#[derive(Clone, Debug)]
pub struct CommandExecutor {
	binary: String,
	base_args: Vec<String>,
	timeout: Option<std::time::Duration>,
}
impl CommandExecutor {
	/// Binary used when none is configured.
	pub const DEFAULT_BINARY: &str = "oci";

	/// Creates an executor for `binary` (resolved through `PATH` when not absolute).
	pub fn new(binary: impl Into<String>) -> Self {
		Self { binary: binary.into(), base_args: Vec::new(), timeout: None }
	}

	/// Prepends `args` to every invocation.
	pub fn with_base_args<I, S>(mut self, args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.base_args = args.into_iter().map(Into::into).collect();

		self
	}

	/// Kills the child and fails the call after `timeout`.
	pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
		self.timeout = Some(timeout);

		self
	}

	/// Configured binary.
	pub fn binary(&self) -> &str {
		&self.binary
	}

	/// Runs `args` with the bundle's environment overlaid on the child.
	pub async fn run(&self, args: &[String], bundle: &CredentialBundle) -> Result<CommandResult> {
		obs::observe(BrokerStage::Execute, "run", self.execute(args, Some(bundle))).await
	}

	/// Runs `args` without credentials (help text and other offline commands).
	pub async fn run_unauthenticated(&self, args: &[String]) -> Result<CommandResult> {
		obs::observe(BrokerStage::Execute, "run_unauthenticated", self.execute(args, None)).await
	}

	async fn execute(
		&self,
		args: &[String],
		bundle: Option<&CredentialBundle>,
	) -> Result<CommandResult> {
		let mut command = Command::new(&self.binary);

		command
			.args(&self.base_args)
			.args(args)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true);

		if let Some(bundle) = bundle {
			command.envs(bundle.env().iter().map(|(key, value)| (*key, value.as_str())));
		}

		let spawn_error = |source: std::io::Error| Error::CommandSpawn {
			binary: self.binary.clone(),
			source: Arc::new(source),
		};
		let output = match self.timeout {
			Some(timeout) => tokio::time::timeout(timeout, command.output()).await.map_err(|_| {
				Error::DownstreamCallFailed {
					status: None,
					exit_code: None,
					detail: format!("`{}` timed out after {}s", self.binary, timeout.as_secs_f32()),
				}
			})?,
			None => command.output().await,
		}
		.map_err(spawn_error)?;

		Ok(CommandResult {
			stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
			stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
			exit_code: output.status.code().unwrap_or(-1),
		})
	}
}
impl Default for CommandExecutor {
	fn default() -> Self {
		Self::new(Self::DEFAULT_BINARY)
	}
}

fn failure_detail(stderr: &str, fallback: &str) -> String {
	match stderr.trim() {
		"" => fallback.trim().to_owned(),
		stderr => stderr.to_owned(),
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn result(stdout: &str, stderr: &str, exit_code: i32) -> CommandResult {
		CommandResult { stdout: stdout.into(), stderr: stderr.into(), exit_code }
	}

	#[test]
	fn json_stdout_is_parsed_and_text_passes_through() {
		let json = result("{\"data\":\"tenantA-namespace\"}\n", "", 0).into_output();
		let text = result("Usage: oci os ns get\n", "", 0).into_output();

		assert_eq!(json.expect("JSON stdout should parse.")["data"], "tenantA-namespace");
		assert_eq!(text.expect("Text stdout should pass through."), "Usage: oci os ns get");
	}

	#[test]
	fn empty_stdout_carries_stderr() {
		let err = result("  \n", "WARNING: deprecated flag", 0)
			.into_output()
			.expect_err("Empty stdout must fail.");

		assert!(matches!(
			err,
			Error::DownstreamCallFailed { exit_code: Some(0), detail, .. }
				if detail == "WARNING: deprecated flag"
		));
	}

	#[test]
	fn service_errors_surface_status_and_stderr() {
		let stderr = concat!(
			"ServiceError:\n{\n",
			"    \"code\": \"NotAuthenticated\",\n",
			"    \"message\": \"The required information was not provided.\",\n",
			"    \"status\": 401\n}\n",
		);
		let failed = result("", stderr, 1);

		assert_eq!(failed.service_status(), Some(401));
		assert!(failed.auth_failure());

		let err = failed.into_output().expect_err("Non-zero exit must fail.");

		assert!(err.is_stale_credential());
		assert!(matches!(
			err,
			Error::DownstreamCallFailed { status: Some(401), exit_code: Some(1), ref detail }
				if detail.contains("NotAuthenticated")
		));
	}

	#[test]
	fn ordinary_failures_are_not_auth_failures() {
		let stderr = "ServiceError: {\"code\": \"NotAuthorizedOrNotFound\", \"status\": 404}";
		let missing = result("", stderr, 1);

		assert!(!missing.auth_failure());

		let err = missing.into_output().expect_err("Non-zero exit must fail.");

		assert!(!err.is_stale_credential());
	}
}
