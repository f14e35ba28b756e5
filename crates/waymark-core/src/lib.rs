//! Waymark Core Library
//!
//! Capability-scoped script runs against a remote game avatar, plus the
//! deterministic search and flow-control toolkit those scripts use.

pub mod agent;
pub mod config;
pub mod flow;
pub mod geometry;
pub mod metrics;
pub mod obs;
pub mod rng;
pub mod sandbox;
pub mod search;
pub mod telemetry;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use agent::{AgentControl, AgentEvent, AgentState, SimulatedAgent, WorldSpec};
pub use config::SandboxConfig;
pub use geometry::{BlockPos, Position};
pub use rng::SeededRandom;
pub use sandbox::{
    Capability, Completion, ErrorKind, ErrorRecord, ExecutionResult, ProgramDescriptor,
    SandboxError, SandboxExecutor, SandboxResult,
};
pub use search::{SearchReport, SearchStats};
