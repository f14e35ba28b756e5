//! Program descriptors and execution results.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::capability::Capability;
use super::error::{ErrorKind, ErrorRecord};
use super::log::LogEntry;

/// An immutable description of one script run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramDescriptor {
    pub source: String,
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
    #[serde(default)]
    pub args: Map<String, Value>,
    /// `0` means the configured default.
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub seed: u64,
    /// Per-program quotas; can only lower the configured ones.
    #[serde(default)]
    pub budgets: BTreeMap<Capability, u32>,
}

impl ProgramDescriptor {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            capabilities: BTreeSet::new(),
            args: Map::new(),
            timeout_ms: 0,
            seed: 0,
            budgets: BTreeMap::new(),
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities.extend(capabilities);
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }

    pub fn with_args(mut self, args: Map<String, Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_budget(mut self, capability: Capability, max: u32) -> Self {
        self.budgets.insert(capability, max);
        self
    }

    /// Hex SHA-256 over source, capabilities, args and seed.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source.as_bytes());
        hasher.update([0u8]);
        for cap in &self.capabilities {
            hasher.update(cap.as_str().as_bytes());
            hasher.update([b',']);
        }
        hasher.update([0u8]);
        // serde_json::Map is ordered by key, so this is canonical.
        hasher.update(Value::Object(self.args.clone()).to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.seed.to_le_bytes());
        hex::encode(hasher.finalize())
    }
}

/// How a script ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Success(Value),
    Failure { message: String, payload: Value },
}

/// The single normalized outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// Success payload, or the payload passed to `fail`.
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    pub logs: Vec<LogEntry>,
    pub duration_ms: u64,
    /// Gated calls made per declared capability.
    #[serde(default)]
    pub operations: BTreeMap<Capability, u32>,
    pub program_digest: String,
}

impl ExecutionResult {
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}
