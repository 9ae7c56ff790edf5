//! Structured observability hooks for agent run lifecycle events.
//!
//! This module provides:
//! - Run- and tier-scoped spans to attach to flow futures via
//!   [`tracing::Instrument`]
//! - Emission functions for key lifecycle events: run start/finish, tier
//!   start/finish, session state transitions, probe resolution, artifact
//!   normalization
//!
//! Events are emitted at `info!` level with a stable `event` field so they
//! can be filtered or aggregated. For JSON output, initialise tracing with
//! `json = true` (see [`crate::telemetry::init_tracing`]).

use tracing::{info, info_span, Span};

/// Span covering one whole agent run.
pub fn run_span(run_id: &str) -> Span {
    info_span!("plcops.run", run_id = %run_id)
}

/// Span covering one tier's flow.
pub fn tier_span(tier: &str, branch: &str) -> Span {
    info_span!("plcops.tier", tier = %tier, branch = %branch)
}

/// Emit event: run started.
///
/// # Example
///
/// ```ignore
/// emit_run_started("0b6f...", 3);
/// // logs: event=run.started run_id=0b6f... tiers=3
/// ```
pub fn emit_run_started(run_id: &str, tiers: usize) {
    info!(event = "run.started", run_id = %run_id, tiers = tiers);
}

/// Emit event: run finished with duration and overall status.
pub fn emit_run_finished(run_id: &str, duration_ms: u64, overall_ok: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        overall_ok = overall_ok,
    );
}

pub fn emit_tier_started(tier: &str, flow: &str) {
    info!(event = "tier.started", tier = %tier, flow = %flow);
}

/// Emit event: tier finished. Failures are logged at `warn!`.
pub fn emit_tier_finished(tier: &str, ok: bool, note: &str) {
    if ok {
        info!(event = "tier.finished", tier = %tier, ok = ok, note = %note);
    } else {
        tracing::warn!(event = "tier.finished", tier = %tier, ok = ok, note = %note);
    }
}

/// Emit event: runtime session changed state.
pub fn emit_session_transition(from: &str, to: &str) {
    info!(event = "session.transition", from = %from, to = %to);
}

pub fn emit_probe_resolved(descriptor: &str) {
    info!(event = "probe.resolved", operation = %descriptor);
}

/// Emit event: artifact normalized and hashed.
pub fn emit_artifact_normalized(path: &str, digest: &str, rewritten: bool) {
    info!(
        event = "artifact.normalized",
        path = %path,
        digest = %digest,
        rewritten = rewritten,
    );
}
