//! Optional observability helpers for broker stages.
//!
//! # Feature Flags
//!
//! - Enable `tracing` to emit structured spans named `upst_broker.stage` with the `stage`
//!   (pipeline component) and `op` (call site) fields, plus a handful of structured events.
//! - Enable `metrics` to increment the `upst_broker_stage_total` counter for every
//!   attempt/success/failure, labeled by `stage` + `outcome`.
//!
//! Secret values (bearer tokens, session tokens, keys) are never recorded as fields.

mod metrics;
mod tracing;

pub use metrics::*;
pub use tracing::*;

// self
use crate::_prelude::*;

/// Emits a structured `tracing` event when the `tracing` feature is enabled.
macro_rules! event {
	($level:ident, $($arg:tt)+) => {{
		#[cfg(feature = "tracing")]
		{
			::tracing::$level!($($arg)+);
		}
	}};
}
pub(crate) use event;

/// Pipeline stages observed by the broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BrokerStage {
	/// Discovery document fetch.
	Discovery,
	/// JWKS fetch and session-token verification.
	Jwks,
	/// Token exchange POST.
	Exchange,
	/// Signer cache lookup or creation.
	Cache,
	/// Credential materialization (signer or bundle).
	Materialize,
	/// CLI subprocess execution.
	Execute,
	/// Signed downstream API call.
	Downstream,
	/// Authorization hook evaluation.
	Policy,
}
impl BrokerStage {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			BrokerStage::Discovery => "discovery",
			BrokerStage::Jwks => "jwks",
			BrokerStage::Exchange => "exchange",
			BrokerStage::Cache => "cache",
			BrokerStage::Materialize => "materialize",
			BrokerStage::Execute => "execute",
			BrokerStage::Downstream => "downstream",
			BrokerStage::Policy => "policy",
		}
	}
}
impl Display for BrokerStage {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Outcome labels recorded for each attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlowOutcome {
	/// Entry to a broker stage.
	Attempt,
	/// Successful completion.
	Success,
	/// Failure propagated back to the caller.
	Failure,
}
impl FlowOutcome {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			FlowOutcome::Attempt => "attempt",
			FlowOutcome::Success => "success",
			FlowOutcome::Failure => "failure",
		}
	}
}
impl Display for FlowOutcome {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Runs `fut` inside a stage span and records attempt plus success/failure outcomes.
pub(crate) async fn observe<T, Fut>(stage: BrokerStage, op: &'static str, fut: Fut) -> Result<T>
where
	Fut: Future<Output = Result<T>>,
{
	let span = StageSpan::new(stage, op);

	record_stage_outcome(stage, FlowOutcome::Attempt);

	let result = span.instrument(fut).await;

	match &result {
		Ok(_) => record_stage_outcome(stage, FlowOutcome::Success),
		Err(_err) => {
			event!(debug, stage = stage.as_str(), op, error = _err.kind(), "stage failed");

			record_stage_outcome(stage, FlowOutcome::Failure);
		},
	}

	result
}

/// Synchronous counterpart of [`observe`].
pub(crate) fn observe_sync<T>(
	stage: BrokerStage,
	op: &'static str,
	f: impl FnOnce() -> Result<T>,
) -> Result<T> {
	let _guard = StageSpan::new(stage, op).entered();

	record_stage_outcome(stage, FlowOutcome::Attempt);

	let result = f();

	let outcome = if result.is_ok() { FlowOutcome::Success } else { FlowOutcome::Failure };

	record_stage_outcome(stage, outcome);

	result
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[tokio::test]
	async fn observe_passes_results_through() {
		let ok = observe(BrokerStage::Cache, "test", async { Ok(7) }).await;
		let err =
			observe::<(), _>(BrokerStage::Policy, "test", async { Err(Error::Cancelled) }).await;

		assert_eq!(ok.expect("Successful stage should pass its value through."), 7);
		assert!(matches!(err, Err(Error::Cancelled)));
	}
}
