//! Run orchestration: one program in, one [`ExecutionResult`] out.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

use super::bindings;
use super::budget::OperationBudget;
use super::context::RunRuntime;
use super::control::RunControl;
use super::error::{ErrorKind, ErrorRecord, SandboxError, SandboxResult};
use super::gate::{CapabilityGate, GatedAgent};
use super::log::RunLog;
use super::program::{Completion, ExecutionResult, ProgramDescriptor};
use crate::agent::AgentControl;
use crate::config::SandboxConfig;
use crate::metrics::METRICS;
use crate::obs;

/// Runs scripts against one agent.
///
/// Every run gets its own gate, budget, log, deadline and seeded generator;
/// nothing is shared between runs except the agent itself.
pub struct SandboxExecutor {
    agent: Arc<dyn AgentControl>,
    config: Arc<SandboxConfig>,
}

impl SandboxExecutor {
    pub fn new(agent: Arc<dyn AgentControl>, config: SandboxConfig) -> SandboxResult<Self> {
        config.validate()?;
        Ok(Self {
            agent,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Compile `source` without running it.
    pub fn check(&self, source: &str) -> SandboxResult<()> {
        bindings::compile_check(source, &self.config.engine)
    }

    /// Execute `program`. Never fails: every outcome, including timeouts
    /// and script bugs, is folded into the returned result.
    pub async fn run(&self, program: ProgramDescriptor) -> ExecutionResult {
        let run_id = Uuid::new_v4().to_string();
        let span = obs::span(&run_id);
        self.run_inner(run_id, program).instrument(span).await
    }

    async fn run_inner(&self, run_id: String, program: ProgramDescriptor) -> ExecutionResult {
        let started = Instant::now();
        let digest = program.digest();
        let capabilities: Vec<_> = program.capabilities.iter().copied().collect();
        METRICS.inc_runs_started();
        obs::emit_run_started(&run_id, &digest, &capabilities);

        let limit = self.config.effective_timeout(program.timeout_ms);
        let control = Arc::new(RunControl::new(limit));
        let log = Arc::new(RunLog::new(self.config.max_log_entries));
        let budgets = self.config.budgets.tightened(&program.budgets);
        let gate = Arc::new(CapabilityGate::new(
            program.capabilities.clone(),
            OperationBudget::new(&budgets),
        ));
        let agent = GatedAgent::new(self.agent.clone(), gate.clone(), control.clone());
        let runtime = Arc::new(RunRuntime::new(
            agent,
            control.clone(),
            log.clone(),
            self.config.clone(),
            program.args.clone(),
            program.seed,
        ));

        let worker = {
            let runtime = runtime.clone();
            let source = program.source;
            let limits = self.config.engine.clone();
            let span = tracing::Span::current();
            tokio::task::spawn_blocking(move || {
                span.in_scope(|| bindings::run_script(&runtime, &source, &limits))
            })
        };

        let outcome = match tokio::time::timeout(limit, worker).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join)) => Err(SandboxError::ScriptError(format!("script worker failed: {join}"))),
            Err(_elapsed) => {
                // The worker keeps running until its next progress check;
                // nothing it does from here on is observable.
                warn!(limit_ms = control.limit_ms(), "run deadline reached, abandoning script");
                control.abort();
                log.seal();
                Err(SandboxError::Timeout {
                    limit_ms: control.limit_ms(),
                })
            }
        };
        // Whatever the worker produced past the run deadline is dropped.
        let outcome = match outcome {
            Err(err @ SandboxError::Timeout { .. }) => Err(err),
            late if control.run_expired() => {
                debug!(completed = late.is_ok(), "outcome arrived after the run deadline, reporting timeout");
                Err(SandboxError::Timeout {
                    limit_ms: control.limit_ms(),
                })
            }
            other => other,
        };

        log.seal();
        runtime.close_watchers();

        let (success, result, error) = match outcome {
            Ok(Completion::Success(value)) => (true, value, None),
            Ok(Completion::Failure { message, payload }) => (
                false,
                payload,
                Some(ErrorRecord {
                    kind: ErrorKind::Failed,
                    message,
                }),
            ),
            Err(err) => (false, Value::Null, Some(err.to_record())),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        if !success {
            METRICS.inc_runs_failed();
        }
        obs::emit_run_finished(
            &run_id,
            duration_ms,
            success,
            error.as_ref().map(|e| e.kind.as_str()),
        );
        METRICS.flush();

        ExecutionResult {
            success,
            result,
            error,
            logs: log.snapshot(),
            duration_ms,
            operations: gate.budget().usage(gate.declared()),
            program_digest: digest,
        }
    }
}
