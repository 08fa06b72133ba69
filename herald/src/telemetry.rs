//! Tracing and telemetry instrumentation for herald.
//!
//! Helpers for creating tracing spans and recording outcomes across the
//! claim / materialize / dispatch path. Every `record_*` function logs through
//! `tracing` and, with the `metrics` feature enabled, also updates the
//! Prometheus collectors in [`crate::metrics`].
//!
//! # Example
//!
//! ```ignore
//! use herald::telemetry::{cycle_span, record_claim_outcome};
//!
//! let span = cycle_span("worker-1", 10);
//! let _enter = span.enter();
//! record_claim_outcome("job-1", ClaimOutcome::Orphaned);
//! ```

use std::future::Future;
use tracing::{info_span, Instrument, Span};

use crate::dispatch::DispatchOutcome;
use crate::job::ClaimOutcome;

/// Create a tracing span covering one claim cycle.
#[must_use]
pub fn cycle_span(worker_id: impl AsRef<str>, batch_size: usize) -> Span {
    info_span!(
        "herald.cycle",
        worker_id = %worker_id.as_ref(),
        batch_size = batch_size,
    )
}

/// Create a tracing span for claiming and materializing one job.
#[must_use]
pub fn claim_span(job_id: impl AsRef<str>) -> Span {
    info_span!("herald.claim", job_id = %job_id.as_ref())
}

/// Create a tracing span for one job's gateway call.
#[must_use]
pub fn dispatch_span(job_id: impl AsRef<str>, token_count: usize) -> Span {
    info_span!(
        "herald.dispatch",
        job_id = %job_id.as_ref(),
        token_count = token_count,
    )
}

/// Instrument a future with a dispatch span.
pub fn instrument_dispatch<F>(
    job_id: impl AsRef<str>,
    token_count: usize,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let span = dispatch_span(job_id, token_count);
    future.instrument(span)
}

/// Record the final claim-side outcome of a job.
///
/// Races lost to other claimers are routine and logged at `debug`; jobs that
/// were owned but never dispatched are logged at `warn`.
pub fn record_claim_outcome(job_id: impl AsRef<str>, outcome: ClaimOutcome) {
    match outcome {
        ClaimOutcome::AlreadyClaimed => tracing::debug!(
            job_id = %job_id.as_ref(),
            outcome = %outcome,
            "job already claimed elsewhere"
        ),
        ClaimOutcome::Claimed | ClaimOutcome::Dispatched => tracing::debug!(
            job_id = %job_id.as_ref(),
            outcome = %outcome,
            "job claimed"
        ),
        ClaimOutcome::Orphaned
        | ClaimOutcome::Malformed
        | ClaimOutcome::Transient
        | ClaimOutcome::Requeued => tracing::warn!(
            job_id = %job_id.as_ref(),
            outcome = %outcome,
            "job not dispatched"
        ),
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_claim_outcome(outcome.as_str());
}

/// Record the result of a job's gateway call.
pub fn record_dispatch_outcome(
    job_id: impl AsRef<str>,
    outcome: &DispatchOutcome,
) {
    match outcome {
        DispatchOutcome::Delivered { success } => tracing::info!(
            job_id = %job_id.as_ref(),
            success = success,
            "sent to {} devices",
            success
        ),
        DispatchOutcome::PartiallyDelivered { success, failure } => {
            tracing::warn!(
                job_id = %job_id.as_ref(),
                success = success,
                failure = failure,
                "{} sent, {} failed",
                success,
                failure
            )
        }
        DispatchOutcome::Failed { failure } => tracing::warn!(
            job_id = %job_id.as_ref(),
            failure = failure,
            "delivery failed for all {} devices",
            failure
        ),
        DispatchOutcome::GatewayError { error } => tracing::error!(
            job_id = %job_id.as_ref(),
            error = %error,
            "gateway call failed"
        ),
        DispatchOutcome::TimedOut { after } => tracing::error!(
            job_id = %job_id.as_ref(),
            after_ms = after.as_millis() as u64,
            "gateway call timed out"
        ),
        DispatchOutcome::Skipped => tracing::debug!(
            job_id = %job_id.as_ref(),
            "no tokens, nothing to send"
        ),
    }

    #[cfg(feature = "metrics")]
    {
        crate::metrics::record_dispatch_outcome(outcome.as_str());
        let (success, failure) = outcome.token_counts();
        crate::metrics::record_tokens(success, failure);
    }
}

/// Update the in-flight dispatch gauge.
pub fn set_in_flight(in_flight: usize) {
    tracing::trace!(in_flight = in_flight, "in-flight dispatches updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_in_flight(in_flight as f64);
}

/// Record the start of a gateway call for latency tracking.
pub fn record_dispatch_start(job_id: impl AsRef<str>) -> DispatchTimingHandle {
    DispatchTimingHandle {
        job_id: job_id.as_ref().to_string(),
        start: std::time::Instant::now(),
    }
}

/// Record the end of a gateway call and observe its latency.
pub fn record_dispatch_end(handle: DispatchTimingHandle, status: impl AsRef<str>) {
    let duration_secs = handle.start.elapsed().as_secs_f64();

    tracing::debug!(
        job_id = %handle.job_id,
        status = %status.as_ref(),
        duration_secs = duration_secs,
        "gateway latency observed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_gateway_latency(status.as_ref(), duration_secs);
}

/// Handle for tracking gateway call duration.
#[derive(Debug)]
pub struct DispatchTimingHandle {
    job_id: String,
    start: std::time::Instant,
}

impl DispatchTimingHandle {
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
