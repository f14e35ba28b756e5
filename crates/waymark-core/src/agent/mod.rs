//! Agent Control Interface — the contract with the remote avatar.
//!
//! Everything the sandbox does to the world goes through [`AgentControl`].
//! The core never implements the real connection; it consumes this trait.
//! [`sim::SimulatedAgent`] is an in-memory implementation for tests and the
//! CLI.

pub mod sim;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::geometry::{BlockPos, Position};
use crate::sandbox::error::SandboxResult;

pub use sim::{SimulatedAgent, WorldSpec};

/// Facing of the avatar, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Orientation {
    pub yaw: f64,
    pub pitch: f64,
}

/// Snapshot of the avatar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub position: Position,
    pub orientation: Orientation,
    pub health: f64,
    pub food: f64,
    pub game_mode: String,
}

/// A block reported by a world query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub position: BlockPos,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStack {
    pub name: String,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigateOptions {
    /// Arrival radius around the target.
    pub tolerance: f64,
    /// Per-call budget the agent should honour, if any.
    pub timeout_ms: Option<u64>,
}

impl Default for NavigateOptions {
    fn default() -> Self {
        Self {
            tolerance: 1.0,
            timeout_ms: None,
        }
    }
}

/// Result of a navigation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavOutcome {
    pub arrived: bool,
    pub position: Position,
}

/// Well-known event kinds pushed by the agent connection.
pub mod event_kind {
    pub const DEATH: &str = "death";
    pub const RESPAWN_ATTEMPT: &str = "respawn_attempt";
    pub const SPAWN: &str = "spawn";
    pub const RECONNECT: &str = "reconnect";
    pub const CHAT: &str = "chat";
    pub const HEALTH: &str = "health";
}

/// An asynchronous notification from the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub seq: u64,
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// Lower-level operations on the remote avatar.
///
/// Implementations return `Disconnected` when the agent is unreachable,
/// `Precondition` when the world does not match the request, and
/// `OperationFailed` for anything else that went wrong remotely.
#[async_trait]
pub trait AgentControl: Send + Sync {
    async fn get_state(&self) -> SandboxResult<AgentState>;

    /// Blocks of the given kinds within `radius` of the avatar, nearest
    /// first, at most `max` entries.
    async fn scan_blocks(
        &self,
        kinds: &[String],
        radius: u32,
        max: usize,
    ) -> SandboxResult<Vec<BlockInfo>>;

    /// The solid block occupying `pos`, if any.
    async fn block_at(&self, pos: BlockPos) -> SandboxResult<Option<BlockInfo>>;

    async fn navigate_to(
        &self,
        target: Position,
        opts: &NavigateOptions,
    ) -> SandboxResult<NavOutcome>;

    async fn interact(&self, pos: BlockPos) -> SandboxResult<Value>;

    async fn mine(&self, pos: BlockPos) -> SandboxResult<Value>;

    async fn place(&self, pos: BlockPos, item: &str) -> SandboxResult<Value>;

    async fn craft(&self, item: &str, count: u32) -> SandboxResult<Value>;

    async fn equip(&self, item: &str, slot: &str) -> SandboxResult<Value>;

    async fn get_inventory(&self) -> SandboxResult<Vec<ItemStack>>;

    /// A fresh receiver for agent events. Dropping it ends the subscription.
    fn subscribe(&self) -> SandboxResult<broadcast::Receiver<AgentEvent>>;
}
