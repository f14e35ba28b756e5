//! In-memory avatar for tests and offline runs.
//!
//! `SimulatedAgent` satisfies the [`AgentControl`] contract against a small
//! voxel world: solid blocks, an inventory, crafting recipes and an event
//! feed. Navigation teleports to any free, reachable cell. Every call is
//! appended to a journal so tests can assert what reached the agent.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};

use super::{
    event_kind, AgentControl, AgentEvent, AgentState, BlockInfo, ItemStack, NavOutcome,
    NavigateOptions, Orientation,
};
use crate::geometry::{euclidean, BlockPos, Position};
use crate::sandbox::error::{SandboxError, SandboxResult};

/// Maximum distance at which the avatar can touch a block.
pub const REACH: f64 = 6.0;

const EVENT_CAPACITY: usize = 256;

/// Serializable description of a simulated world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldSpec {
    pub spawn: Position,
    pub health: f64,
    pub food: f64,
    pub game_mode: String,
    pub blocks: Vec<BlockInfo>,
    /// Free cells the avatar can never route to.
    pub unreachable: Vec<BlockPos>,
    pub inventory: Vec<ItemStack>,
    /// Item name -> ingredients consumed per crafted unit.
    pub recipes: BTreeMap<String, Vec<ItemStack>>,
}

impl Default for WorldSpec {
    fn default() -> Self {
        Self {
            spawn: Position::default(),
            health: 20.0,
            food: 20.0,
            game_mode: "survival".to_string(),
            blocks: Vec::new(),
            unreachable: Vec::new(),
            inventory: Vec::new(),
            recipes: BTreeMap::new(),
        }
    }
}

impl WorldSpec {
    /// Load a world description from a JSON file.
    pub fn load(path: &Path) -> SandboxResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::InvalidConfig(format!("reading world {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            SandboxError::InvalidConfig(format!("parsing world {}: {e}", path.display()))
        })
    }
}

#[derive(Debug)]
struct WorldState {
    position: Position,
    orientation: Orientation,
    health: f64,
    food: f64,
    game_mode: String,
    blocks: HashMap<BlockPos, String>,
    unreachable: HashSet<BlockPos>,
    inventory: BTreeMap<String, u32>,
    equipped: BTreeMap<String, String>,
    recipes: BTreeMap<String, Vec<ItemStack>>,
    journal: Vec<String>,
    connected: bool,
}

impl WorldState {
    fn ensure_connected(&self) -> SandboxResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(SandboxError::Disconnected("simulated agent is offline".into()))
        }
    }

    fn ensure_reach(&self, pos: BlockPos) -> SandboxResult<()> {
        let d = euclidean(&self.position, &pos.to_position());
        if d > REACH {
            return Err(SandboxError::Precondition(format!(
                "{pos} is out of reach ({d:.1} > {REACH})"
            )));
        }
        Ok(())
    }

    fn take(&mut self, item: &str, count: u32) {
        if let Some(have) = self.inventory.get_mut(item) {
            *have = have.saturating_sub(count);
            if *have == 0 {
                self.inventory.remove(item);
            }
        }
    }

    fn count(&self, item: &str) -> u32 {
        self.inventory.get(item).copied().unwrap_or(0)
    }
}

/// In-memory [`AgentControl`] implementation.
#[derive(Debug)]
pub struct SimulatedAgent {
    state: Mutex<WorldState>,
    events: broadcast::Sender<AgentEvent>,
    next_seq: AtomicU64,
    nav_delay: Option<Duration>,
}

impl Default for SimulatedAgent {
    fn default() -> Self {
        Self::new(WorldSpec::default())
    }
}

impl SimulatedAgent {
    pub fn new(spec: WorldSpec) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut inventory = BTreeMap::new();
        for stack in spec.inventory {
            *inventory.entry(stack.name).or_insert(0) += stack.count;
        }
        Self {
            state: Mutex::new(WorldState {
                position: spec.spawn,
                orientation: Orientation::default(),
                health: spec.health,
                food: spec.food,
                game_mode: spec.game_mode,
                blocks: spec
                    .blocks
                    .into_iter()
                    .map(|b| (b.position, b.kind))
                    .collect(),
                unreachable: spec.unreachable.into_iter().collect(),
                inventory,
                equipped: BTreeMap::new(),
                recipes: spec.recipes,
                journal: Vec::new(),
                connected: true,
            }),
            events,
            next_seq: AtomicU64::new(1),
            nav_delay: None,
        }
    }

    /// Make every navigation take `delay` of wall-clock time.
    pub fn with_nav_delay(mut self, delay: Duration) -> Self {
        self.nav_delay = Some(delay);
        self
    }

    pub async fn set_block(&self, pos: BlockPos, kind: &str) {
        self.state.lock().await.blocks.insert(pos, kind.to_string());
    }

    pub async fn set_unreachable(&self, pos: BlockPos) {
        self.state.lock().await.unreachable.insert(pos);
    }

    pub async fn give(&self, item: &str, count: u32) {
        *self
            .state
            .lock()
            .await
            .inventory
            .entry(item.to_string())
            .or_insert(0) += count;
    }

    pub async fn set_connected(&self, connected: bool) {
        self.state.lock().await.connected = connected;
    }

    pub async fn position(&self) -> Position {
        self.state.lock().await.position
    }

    pub async fn item_count(&self, item: &str) -> u32 {
        self.state.lock().await.count(item)
    }

    /// Every call received so far, as `"<operation> <detail>"` strings.
    pub async fn journal(&self) -> Vec<String> {
        self.state.lock().await.journal.clone()
    }

    /// Number of journal entries for `operation`.
    pub async fn calls_to(&self, operation: &str) -> usize {
        self.state
            .lock()
            .await
            .journal
            .iter()
            .filter(|entry| entry.split(' ').next() == Some(operation))
            .count()
    }

    /// Push an event to all current subscribers. Returns the receiver count.
    pub fn emit(&self, kind: &str, data: Value) -> usize {
        let event = AgentEvent {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            kind: kind.to_string(),
            data,
        };
        self.events.send(event).unwrap_or(0)
    }

    /// Change health and publish a `health` event.
    pub async fn set_health(&self, health: f64) {
        let food = {
            let mut state = self.state.lock().await;
            state.health = health;
            state.food
        };
        self.emit(event_kind::HEALTH, json!({ "health": health, "food": food }));
    }
}

#[async_trait]
impl AgentControl for SimulatedAgent {
    async fn get_state(&self) -> SandboxResult<AgentState> {
        let mut state = self.state.lock().await;
        state.ensure_connected()?;
        state.journal.push("get_state".to_string());
        Ok(AgentState {
            position: state.position,
            orientation: state.orientation,
            health: state.health,
            food: state.food,
            game_mode: state.game_mode.clone(),
        })
    }

    async fn scan_blocks(
        &self,
        kinds: &[String],
        radius: u32,
        max: usize,
    ) -> SandboxResult<Vec<BlockInfo>> {
        let mut state = self.state.lock().await;
        state.ensure_connected()?;
        state
            .journal
            .push(format!("scan_blocks {} r={radius}", kinds.join(",")));
        let origin = state.position;
        let mut found: Vec<(f64, BlockInfo)> = state
            .blocks
            .iter()
            .filter(|(_, kind)| kinds.is_empty() || kinds.iter().any(|k| k == *kind))
            .map(|(pos, kind)| {
                (
                    euclidean(&origin, &pos.to_position()),
                    BlockInfo {
                        position: *pos,
                        kind: kind.clone(),
                    },
                )
            })
            .filter(|(d, _)| *d <= radius as f64)
            .collect();
        found.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.position.cmp(&b.1.position)));
        Ok(found.into_iter().take(max).map(|(_, b)| b).collect())
    }

    async fn block_at(&self, pos: BlockPos) -> SandboxResult<Option<BlockInfo>> {
        let state = self.state.lock().await;
        state.ensure_connected()?;
        Ok(state.blocks.get(&pos).map(|kind| BlockInfo {
            position: pos,
            kind: kind.clone(),
        }))
    }

    async fn navigate_to(
        &self,
        target: Position,
        _opts: &NavigateOptions,
    ) -> SandboxResult<NavOutcome> {
        {
            let mut state = self.state.lock().await;
            state.ensure_connected()?;
            state.journal.push(format!("navigate_to {target}"));
        }
        if let Some(delay) = self.nav_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        let cell = target.floored();
        if state.blocks.contains_key(&cell) || state.unreachable.contains(&cell) {
            return Err(SandboxError::OperationFailed(format!("no route to {cell}")));
        }
        state.position = target;
        Ok(NavOutcome {
            arrived: true,
            position: target,
        })
    }

    async fn interact(&self, pos: BlockPos) -> SandboxResult<Value> {
        let mut state = self.state.lock().await;
        state.ensure_connected()?;
        state.journal.push(format!("interact {pos}"));
        state.ensure_reach(pos)?;
        let kind = state
            .blocks
            .get(&pos)
            .cloned()
            .ok_or_else(|| SandboxError::Precondition(format!("nothing to interact with at {pos}")))?;
        Ok(json!({ "interacted": kind, "position": pos }))
    }

    async fn mine(&self, pos: BlockPos) -> SandboxResult<Value> {
        let mut state = self.state.lock().await;
        state.ensure_connected()?;
        state.journal.push(format!("mine {pos}"));
        state.ensure_reach(pos)?;
        let kind = state
            .blocks
            .remove(&pos)
            .ok_or_else(|| SandboxError::Precondition(format!("no block at {pos}")))?;
        *state.inventory.entry(kind.clone()).or_insert(0) += 1;
        Ok(json!({ "mined": kind, "position": pos }))
    }

    async fn place(&self, pos: BlockPos, item: &str) -> SandboxResult<Value> {
        let mut state = self.state.lock().await;
        state.ensure_connected()?;
        state.journal.push(format!("place {pos} {item}"));
        state.ensure_reach(pos)?;
        if state.count(item) == 0 {
            return Err(SandboxError::Precondition(format!("no {item} in inventory")));
        }
        if let Some(existing) = state.blocks.get(&pos) {
            return Err(SandboxError::Precondition(format!(
                "{pos} is occupied by {existing}"
            )));
        }
        state.take(item, 1);
        state.blocks.insert(pos, item.to_string());
        Ok(json!({ "placed": item, "position": pos }))
    }

    async fn craft(&self, item: &str, count: u32) -> SandboxResult<Value> {
        let mut state = self.state.lock().await;
        state.ensure_connected()?;
        state.journal.push(format!("craft {item} x{count}"));
        let recipe = state
            .recipes
            .get(item)
            .cloned()
            .ok_or_else(|| SandboxError::OperationFailed(format!("no recipe for {item}")))?;
        for ingredient in &recipe {
            let need = ingredient.count.saturating_mul(count);
            if state.count(&ingredient.name) < need {
                return Err(SandboxError::Precondition(format!(
                    "crafting {count} {item} needs {need} {}",
                    ingredient.name
                )));
            }
        }
        for ingredient in &recipe {
            state.take(&ingredient.name, ingredient.count.saturating_mul(count));
        }
        *state.inventory.entry(item.to_string()).or_insert(0) += count;
        Ok(json!({ "crafted": item, "count": count }))
    }

    async fn equip(&self, item: &str, slot: &str) -> SandboxResult<Value> {
        let mut state = self.state.lock().await;
        state.ensure_connected()?;
        state.journal.push(format!("equip {item} {slot}"));
        if state.count(item) == 0 {
            return Err(SandboxError::Precondition(format!("no {item} to equip")));
        }
        state.equipped.insert(slot.to_string(), item.to_string());
        Ok(json!({ "equipped": item, "slot": slot }))
    }

    async fn get_inventory(&self) -> SandboxResult<Vec<ItemStack>> {
        let mut state = self.state.lock().await;
        state.ensure_connected()?;
        state.journal.push("get_inventory".to_string());
        Ok(state
            .inventory
            .iter()
            .map(|(name, count)| ItemStack {
                name: name.clone(),
                count: *count,
            })
            .collect())
    }

    fn subscribe(&self) -> SandboxResult<broadcast::Receiver<AgentEvent>> {
        Ok(self.events.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world() -> SimulatedAgent {
        let mut spec = WorldSpec::default();
        spec.blocks.push(BlockInfo {
            position: BlockPos::new(1, 0, 0),
            kind: "stone".into(),
        });
        spec.blocks.push(BlockInfo {
            position: BlockPos::new(3, 0, 0),
            kind: "iron_ore".into(),
        });
        spec.recipes.insert(
            "stone_brick".into(),
            vec![ItemStack {
                name: "stone".into(),
                count: 1,
            }],
        );
        SimulatedAgent::new(spec)
    }

    #[tokio::test]
    async fn test_navigate_refuses_solid_and_unreachable_cells() {
        let agent = world();
        let opts = NavigateOptions::default();
        assert!(agent
            .navigate_to(Position::new(1.2, 0.0, 0.4), &opts)
            .await
            .is_err());
        agent.set_unreachable(BlockPos::new(0, 0, 5)).await;
        assert!(agent
            .navigate_to(Position::new(0.0, 0.0, 5.0), &opts)
            .await
            .is_err());
        let out = agent
            .navigate_to(Position::new(2.0, 0.0, 0.0), &opts)
            .await
            .unwrap();
        assert!(out.arrived);
        assert_eq!(agent.position().await, Position::new(2.0, 0.0, 0.0));
        assert_eq!(agent.calls_to("navigate_to").await, 3);
    }

    #[tokio::test]
    async fn test_mine_then_craft_then_place() {
        let agent = world();
        agent.mine(BlockPos::new(1, 0, 0)).await.unwrap();
        assert_eq!(agent.item_count("stone").await, 1);
        agent.craft("stone_brick", 1).await.unwrap();
        assert_eq!(agent.item_count("stone").await, 0);
        agent.place(BlockPos::new(0, 0, 1), "stone_brick").await.unwrap();
        assert!(agent.block_at(BlockPos::new(0, 0, 1)).await.unwrap().is_some());
        let err = agent.craft("stone_brick", 1).await.unwrap_err();
        assert!(matches!(err, SandboxError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_scan_orders_nearest_first_and_truncates() {
        let agent = world();
        let all = agent.scan_blocks(&[], 10, 10).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].kind, "stone");
        let ore = agent
            .scan_blocks(&["iron_ore".to_string()], 10, 10)
            .await
            .unwrap();
        assert_eq!(ore.len(), 1);
        assert_eq!(agent.scan_blocks(&[], 10, 1).await.unwrap().len(), 1);
        assert!(agent.scan_blocks(&[], 2, 10).await.unwrap().len() == 1);
    }

    #[tokio::test]
    async fn test_disconnected_agent_reports_disconnected() {
        let agent = world();
        agent.set_connected(false).await;
        let err = agent.get_state().await.unwrap_err();
        assert!(matches!(err, SandboxError::Disconnected(_)));
    }

    #[tokio::test]
    async fn test_events_reach_subscribers_in_order() {
        let agent = world();
        let mut rx = agent.subscribe().unwrap();
        agent.emit(event_kind::CHAT, json!({"text": "hi"}));
        agent.set_health(4.0).await;
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.kind, "chat");
        assert_eq!(second.kind, "health");
        assert!(second.seq > first.seq);
    }
}
