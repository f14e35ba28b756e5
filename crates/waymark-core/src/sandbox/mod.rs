//! Sandbox: capability-scoped script runs against an avatar.
//!
//! A run declares its capabilities up front. The script sees a context
//! whose gated namespaces exist only for declared capabilities, and every
//! gated call is counted against a per-run budget and bounded by the run
//! deadline.
//!
//! # Modules
//!
//! - [`capability`] — `Capability` enum (Move, Dig, …)
//! - [`budget`]     — per-capability quotas
//! - [`gate`]       — `CapabilityGate` + the `GatedAgent` wrapper
//! - [`control`]    — run deadline, scoped deadlines, abort
//! - [`log`]        — the capped, sequenced run log
//! - [`program`]    — `ProgramDescriptor`, `Completion`, `ExecutionResult`
//! - [`context`]    — the per-run API surface handed to scripts
//! - [`bindings`]   — script engine registration
//! - [`executor`]   — `SandboxExecutor::run()`
//! - [`error`]      — `SandboxError` / `SandboxResult`

pub mod bindings;
pub mod budget;
pub mod capability;
pub mod context;
pub mod control;
pub mod error;
pub mod executor;
pub mod gate;
pub mod log;
pub mod program;

pub use budget::{BudgetLimits, OperationBudget};
pub use capability::Capability;
pub use context::{RunRuntime, ScriptContext};
pub use control::RunControl;
pub use error::{ErrorKind, ErrorRecord, SandboxError, SandboxResult};
pub use executor::SandboxExecutor;
pub use gate::{CapabilityGate, GatedAgent};
pub use log::{LogEntry, LogLevel, RunLog};
pub use program::{Completion, ExecutionResult, ProgramDescriptor};
