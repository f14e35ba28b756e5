//! Structured observability hooks for sandbox run lifecycle events.
//!
//! Events are emitted at `info!` level (configurable via `WAYMARK_LOG`).
//! For JSON output, set `WAYMARK_LOG_FORMAT=json`.

use tracing::{info, warn};

use crate::sandbox::Capability;
use crate::search::SearchStats;

/// The span used for a run, for callers that need to carry it across
/// threads with `Span::in_scope`.
pub fn span(run_id: &str) -> tracing::Span {
    tracing::info_span!("waymark.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, digest: &str, capabilities: &[Capability]) {
    let caps: Vec<&str> = capabilities.iter().map(Capability::as_str).collect();
    info!(
        event = "run.started",
        run_id = %run_id,
        digest = %digest,
        capabilities = %caps.join(","),
    );
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, success: bool, error_kind: Option<&str>) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        success = success,
        error_kind = error_kind.unwrap_or("none"),
    );
}

/// A gated call was refused before reaching the agent.
pub fn emit_gate_rejected(capability: Capability, operation: &str, reason: &str) {
    warn!(
        event = "gate.rejected",
        capability = %capability,
        operation = operation,
        reason = reason,
    );
}

pub fn emit_search_finished(strategy: &str, found: bool, stats: &SearchStats) {
    info!(
        event = "search.finished",
        strategy = strategy,
        found = found,
        visited = stats.positions_visited,
        skipped = stats.skipped,
        ring = stats.ring,
        distance = stats.distance,
        elapsed_ms = stats.elapsed_ms,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let _span = span("test-run-id").entered();
        emit_run_started("test-run-id", "abc", &[Capability::Move]);
        emit_run_finished("test-run-id", 5, true, None);
    }
}
