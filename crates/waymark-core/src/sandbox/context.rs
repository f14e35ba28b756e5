//! The per-run API surface.
//!
//! [`RunRuntime`] owns everything a run touches: the gated agent, the run
//! control, the log sink, the seeded generator and the event
//! subscriptions. [`ScriptContext`] is the capability-shaped view over it:
//! one handle per namespace, with the gated namespaces present only when
//! their capability was declared.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, warn};

use super::capability::Capability;
use super::control::RunControl;
use super::error::{SandboxError, SandboxResult};
use super::gate::GatedAgent;
use super::log::{LogLevel, RunLog};
use crate::agent::{AgentControl, AgentEvent, AgentState, BlockInfo, ItemStack, NavOutcome, NavigateOptions};
use crate::config::SandboxConfig;
use crate::geometry::{self, horizontal_distance, BlockPos, Position};
use crate::rng::SeededRandom;
use crate::search::{
    self, Bug2Options, Bug2Result, ExpandOptions, PathResult, PathfindOptions, RandomWalkOptions,
    SearchReport, SpiralOptions,
};

/// Health at or below which the avatar is not considered safe.
pub const SAFE_HEALTH: f64 = 6.0;

struct Subscription {
    kinds: Vec<String>,
    // Taken out while a `wait` is in progress.
    rx: Option<broadcast::Receiver<AgentEvent>>,
}

impl Subscription {
    fn wants(&self, event: &AgentEvent) -> bool {
        self.kinds.is_empty() || self.kinds.iter().any(|k| *k == event.kind)
    }
}

#[derive(Default)]
struct Watchers {
    next_id: u64,
    subs: BTreeMap<u64, Subscription>,
}

/// Shared state of one run.
pub struct RunRuntime {
    agent: GatedAgent,
    control: Arc<RunControl>,
    log: Arc<RunLog>,
    rng: Mutex<SeededRandom>,
    config: Arc<SandboxConfig>,
    args: Map<String, Value>,
    watchers: Mutex<Watchers>,
}

impl RunRuntime {
    pub fn new(
        agent: GatedAgent,
        control: Arc<RunControl>,
        log: Arc<RunLog>,
        config: Arc<SandboxConfig>,
        args: Map<String, Value>,
        seed: u64,
    ) -> Self {
        Self {
            agent,
            control,
            log,
            rng: Mutex::new(SeededRandom::new(seed)),
            config,
            args,
            watchers: Mutex::new(Watchers::default()),
        }
    }

    pub fn agent(&self) -> &GatedAgent {
        &self.agent
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    /// Append to the run log. Past the run deadline the log is sealed and
    /// the entry dropped.
    pub fn record(&self, level: LogLevel, message: impl Into<String>, data: Option<Value>) {
        if self.control.run_expired() {
            self.log.seal();
            return;
        }
        self.log.push(level, message, data);
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &BTreeSet<Capability> {
        self.agent.gate().declared()
    }

    /// Drive `fut` to completion on the calling (non-async) thread, bounded
    /// by the nearest deadline.
    pub fn block_on<T, F>(&self, fut: F) -> SandboxResult<T>
    where
        F: Future<Output = SandboxResult<T>>,
    {
        pollster::block_on(self.control.bound(fut))
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut SeededRandom) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut rng)
    }

    /// Drop every event subscription of the run.
    pub fn close_watchers(&self) {
        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        if !watchers.subs.is_empty() {
            debug!(count = watchers.subs.len(), "closing run subscriptions");
        }
        watchers.subs.clear();
    }

    fn nav_options(&self) -> NavigateOptions {
        NavigateOptions {
            tolerance: self.config.search.nav_tolerance,
            timeout_ms: None,
        }
    }
}

/// The capability-shaped context handed to a script.
#[derive(Clone)]
pub struct ScriptContext {
    pub args: Map<String, Value>,
    pub world: WorldApi,
    pub log: LogApi,
    pub clock: ClockApi,
    pub geo: GeoApi,
    pub rng: RngApi,
    pub flow: FlowApi,
    pub nav: Option<NavApi>,
    pub search: Option<SearchApi>,
    pub safety: Option<SafetyApi>,
    pub dig: Option<DigApi>,
    pub build: Option<BuildApi>,
    pub craft: Option<CraftApi>,
    pub inventory: Option<InventoryApi>,
    pub watch: Option<WatchApi>,
}

impl ScriptContext {
    pub fn build(rt: &Arc<RunRuntime>) -> Self {
        let has = |cap: Capability| rt.capabilities().contains(&cap);
        let handle = || rt.clone();
        Self {
            args: rt.args.clone(),
            world: WorldApi { rt: handle() },
            log: LogApi { rt: handle() },
            clock: ClockApi { rt: handle() },
            geo: GeoApi {
                max_cells: rt.config.engine.max_array_size,
            },
            rng: RngApi { rt: handle() },
            flow: FlowApi { rt: handle() },
            nav: has(Capability::Move).then(|| NavApi { rt: handle() }),
            search: has(Capability::Move).then(|| SearchApi { rt: handle() }),
            safety: has(Capability::Move).then(|| SafetyApi { rt: handle() }),
            dig: has(Capability::Dig).then(|| DigApi { rt: handle() }),
            build: has(Capability::Place).then(|| BuildApi { rt: handle() }),
            craft: has(Capability::Craft).then(|| CraftApi { rt: handle() }),
            inventory: has(Capability::Inventory).then(|| InventoryApi { rt: handle() }),
            watch: has(Capability::Events).then(|| WatchApi { rt: handle() }),
        }
    }

    /// Names of the namespaces present, in a fixed order.
    pub fn namespaces(&self) -> Vec<&'static str> {
        let mut out = vec!["args", "world", "log", "clock", "geo", "rng", "flow"];
        let gated = [
            ("nav", self.nav.is_some()),
            ("search", self.search.is_some()),
            ("safety", self.safety.is_some()),
            ("dig", self.dig.is_some()),
            ("build", self.build.is_some()),
            ("craft", self.craft.is_some()),
            ("inventory", self.inventory.is_some()),
            ("watch", self.watch.is_some()),
        ];
        out.extend(gated.iter().filter(|(_, on)| *on).map(|(name, _)| *name));
        out
    }
}

// ---------------------------------------------------------------------------
// Always-present namespaces
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct WorldApi {
    rt: Arc<RunRuntime>,
}

impl WorldApi {
    pub fn runtime(&self) -> &Arc<RunRuntime> {
        &self.rt
    }

    pub async fn state(&self) -> SandboxResult<AgentState> {
        self.rt.agent.get_state().await
    }

    pub async fn scan(&self, kinds: &[String], radius: u32, max: usize) -> SandboxResult<Vec<BlockInfo>> {
        self.rt.agent.scan_blocks(kinds, radius, max).await
    }

    pub async fn block_at(&self, pos: BlockPos) -> SandboxResult<Option<BlockInfo>> {
        self.rt.agent.block_at(pos).await
    }
}

#[derive(Clone)]
pub struct LogApi {
    rt: Arc<RunRuntime>,
}

impl LogApi {
    pub fn write(&self, level: LogLevel, message: impl Into<String>, data: Option<Value>) {
        self.rt.record(level, message, data);
    }
}

#[derive(Clone)]
pub struct ClockApi {
    rt: Arc<RunRuntime>,
}

impl ClockApi {
    /// Milliseconds since the run started.
    pub fn now_ms(&self) -> u64 {
        self.rt.control.elapsed_ms()
    }

    pub async fn sleep(&self, ms: u64) -> SandboxResult<()> {
        self.rt.control.sleep(ms).await
    }
}

/// Geometry helpers. Carries no run state beyond the cap on how many cells
/// one call may return.
#[derive(Clone, Copy)]
pub struct GeoApi {
    max_cells: usize,
}

impl GeoApi {
    fn check_size(&self, what: &str, cells: u64) -> SandboxResult<()> {
        if cells > self.max_cells as u64 {
            return Err(SandboxError::InvalidArgument(format!(
                "{what} would produce {cells} cells, limit is {}",
                self.max_cells
            )));
        }
        Ok(())
    }

    pub fn line(&self, a: BlockPos, b: BlockPos) -> SandboxResult<Vec<BlockPos>> {
        self.check_size("line", geometry::line_len(a, b))?;
        Ok(geometry::line(a, b))
    }

    pub fn circle(&self, center: BlockPos, radius: u32) -> SandboxResult<Vec<BlockPos>> {
        self.check_size("circle", search::ring_size(radius) as u64)?;
        Ok(geometry::circle(center, radius))
    }

    pub fn ring(&self, center: BlockPos, k: u32) -> SandboxResult<Vec<BlockPos>> {
        self.check_size("ring", search::ring_size(k) as u64)?;
        Ok(search::ring(center, k))
    }
}

#[derive(Clone)]
pub struct RngApi {
    rt: Arc<RunRuntime>,
}

impl RngApi {
    pub fn next(&self) -> f64 {
        self.rt.with_rng(|r| r.next_f64())
    }

    pub fn int(&self, min: i64, max: i64) -> i64 {
        self.rt.with_rng(|r| r.range_i64(min, max))
    }

    pub fn float(&self, min: f64, max: f64) -> f64 {
        self.rt.with_rng(|r| r.range_f64(min, max))
    }

    pub fn chance(&self, p: f64) -> bool {
        self.rt.with_rng(|r| r.chance(p))
    }

    pub fn pick<T: Clone>(&self, items: &[T]) -> Option<T> {
        self.rt.with_rng(|r| r.pick(items).cloned())
    }

    pub fn shuffle<T>(&self, items: &mut [T]) {
        self.rt.with_rng(|r| r.shuffle(items))
    }
}

/// Flow combinators; the script bindings drive [`crate::flow`] directly.
#[derive(Clone)]
pub struct FlowApi {
    rt: Arc<RunRuntime>,
}

impl FlowApi {
    pub fn runtime(&self) -> &Arc<RunRuntime> {
        &self.rt
    }
}

// ---------------------------------------------------------------------------
// move
// ---------------------------------------------------------------------------

/// Planning request for [`NavApi::pathfind`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathPlan {
    pub options: PathfindOptions,
    /// Block kinds treated as obstacles. Empty means every solid block.
    pub avoid: Vec<String>,
    /// Extra cells treated as obstacles.
    pub obstacles: Vec<BlockPos>,
    /// Walk the waypoints once planned.
    pub follow: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedRoute {
    pub path: Vec<BlockPos>,
    pub iterations: usize,
    pub followed: bool,
}

#[derive(Clone)]
pub struct NavApi {
    rt: Arc<RunRuntime>,
}

impl NavApi {
    pub fn runtime(&self) -> &Arc<RunRuntime> {
        &self.rt
    }

    pub async fn go_to(&self, target: Position, tolerance: Option<f64>) -> SandboxResult<NavOutcome> {
        if !target.is_finite() {
            return Err(SandboxError::Precondition(format!("target {target} is not finite")));
        }
        let mut opts = self.rt.nav_options();
        if let Some(t) = tolerance {
            opts.tolerance = t;
        }
        self.rt.agent.navigate_to(target, &opts).await
    }

    /// Solid cells around the avatar of the given kinds, plus `extra`.
    pub async fn obstacles(&self, avoid: &[String], extra: &[BlockPos]) -> SandboxResult<HashSet<BlockPos>> {
        let search = &self.rt.config.search;
        let scanned = self
            .rt
            .agent
            .scan_blocks(avoid, search.obstacle_scan_radius, search.obstacle_scan_max)
            .await?;
        let mut set: HashSet<BlockPos> = extra.iter().copied().collect();
        set.extend(scanned.into_iter().map(|b| b.position));
        Ok(set)
    }

    pub async fn pathfind(&self, goal: Position, plan: &PathPlan) -> SandboxResult<PlannedRoute> {
        let start = self.rt.agent.get_state().await?.position.floored();
        let blocked = self.obstacles(&plan.avoid, &plan.obstacles).await?;
        let PathResult { path, iterations, .. } =
            search::pathfind(start, goal.floored(), |c| blocked.contains(&c), &plan.options)?;
        if plan.follow {
            self.follow(&path).await?;
        }
        Ok(PlannedRoute {
            path,
            iterations,
            followed: plan.follow,
        })
    }

    pub async fn bug2<F>(
        &self,
        goal: Position,
        opts: &Bug2Options,
        follow: bool,
        is_blocked: F,
    ) -> SandboxResult<PlannedRoute>
    where
        F: FnMut(BlockPos) -> SandboxResult<bool>,
    {
        let start = self.rt.agent.get_state().await?.position;
        let Bug2Result { path, iterations, .. } = search::bug2(start, goal, is_blocked, opts)?;
        if follow {
            self.follow(&path).await?;
        }
        Ok(PlannedRoute {
            path,
            iterations,
            followed: follow,
        })
    }

    /// Navigate through `path`, skipping its first (starting) cell. Returns
    /// the number of waypoints reached.
    pub async fn follow(&self, path: &[BlockPos]) -> SandboxResult<usize> {
        let opts = self.rt.nav_options();
        for cell in path.iter().skip(1) {
            let outcome = self.rt.agent.navigate_to(cell.to_position(), &opts).await?;
            if !outcome.arrived {
                return Err(SandboxError::OperationFailed(format!(
                    "stopped at {} short of waypoint {cell}",
                    outcome.position
                )));
            }
        }
        Ok(path.len().saturating_sub(1))
    }
}

#[derive(Clone)]
pub struct SearchApi {
    rt: Arc<RunRuntime>,
}

impl SearchApi {
    pub fn runtime(&self) -> &Arc<RunRuntime> {
        &self.rt
    }

    async fn center(&self, center: Option<Position>) -> SandboxResult<Position> {
        match center {
            Some(c) => Ok(c),
            None => Ok(self.rt.agent.get_state().await?.position),
        }
    }

    pub fn default_expand(&self) -> ExpandOptions {
        ExpandOptions {
            radius: self.rt.config.search.radius,
            nav: self.rt.nav_options(),
        }
    }

    pub fn default_spiral(&self) -> SpiralOptions {
        SpiralOptions {
            radius: self.rt.config.search.radius,
            step: 1,
            nav: self.rt.nav_options(),
        }
    }

    pub fn default_random_walk(&self) -> RandomWalkOptions {
        RandomWalkOptions {
            radius: self.rt.config.search.radius,
            max_steps: self.rt.config.search.random_walk_steps,
            nav: self.rt.nav_options(),
            ..RandomWalkOptions::default()
        }
    }

    pub async fn expand_square<P, Fut>(
        &self,
        center: Option<Position>,
        opts: &ExpandOptions,
        predicate: P,
    ) -> SandboxResult<SearchReport>
    where
        P: FnMut(Position) -> Fut,
        Fut: Future<Output = SandboxResult<bool>>,
    {
        let center = self.center(center).await?;
        search::expand_square(&self.rt.agent, center, opts, predicate).await
    }

    pub async fn spiral<P, Fut>(
        &self,
        center: Option<Position>,
        opts: &SpiralOptions,
        predicate: P,
    ) -> SandboxResult<SearchReport>
    where
        P: FnMut(Position) -> Fut,
        Fut: Future<Output = SandboxResult<bool>>,
    {
        let center = self.center(center).await?;
        search::spiral(&self.rt.agent, center, opts, predicate).await
    }

    /// Draws from a generator forked off the run stream, so a predicate
    /// that also uses `ctx.rng` cannot disturb the walk.
    pub async fn random_walk<P, Fut>(
        &self,
        center: Option<Position>,
        opts: &RandomWalkOptions,
        predicate: P,
    ) -> SandboxResult<SearchReport>
    where
        P: FnMut(Position) -> Fut,
        Fut: Future<Output = SandboxResult<bool>>,
    {
        let center = self.center(center).await?;
        let mut rng = self.rt.with_rng(|r| {
            let stream = r.next_u64();
            r.fork(stream)
        });
        search::random_walk(&self.rt.agent, center, opts, &mut rng, predicate).await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyStatus {
    pub position: Position,
    pub health: f64,
    pub food: f64,
    pub safe: bool,
}

#[derive(Clone)]
pub struct SafetyApi {
    rt: Arc<RunRuntime>,
}

impl SafetyApi {
    pub fn runtime(&self) -> &Arc<RunRuntime> {
        &self.rt
    }

    pub async fn status(&self) -> SandboxResult<SafetyStatus> {
        let state = self.rt.agent.get_state().await?;
        Ok(SafetyStatus {
            position: state.position,
            health: state.health,
            food: state.food,
            safe: state.health > SAFE_HEALTH && state.food > 0.0,
        })
    }

    pub async fn is_safe(&self, min_health: Option<f64>) -> SandboxResult<bool> {
        let state = self.rt.agent.get_state().await?;
        Ok(state.health > min_health.unwrap_or(SAFE_HEALTH) && state.food > 0.0)
    }

    /// Move `distance` blocks horizontally directly away from `threat`.
    /// Standing on the threat retreats north.
    pub async fn retreat(&self, threat: Position, distance: f64) -> SandboxResult<NavOutcome> {
        let here = self.rt.agent.get_state().await?.position;
        let away = horizontal_distance(&here, &threat);
        let (ux, uz) = if away < 1e-9 {
            (0.0, -1.0)
        } else {
            ((here.x - threat.x) / away, (here.z - threat.z) / away)
        };
        let target = here.offset(ux * distance, 0.0, uz * distance);
        self.rt
            .agent
            .navigate_to(target, &self.rt.nav_options())
            .await
    }
}

// ---------------------------------------------------------------------------
// dig / place / craft / inventory
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct DigApi {
    rt: Arc<RunRuntime>,
}

impl DigApi {
    pub fn runtime(&self) -> &Arc<RunRuntime> {
        &self.rt
    }

    /// Mine the block at `pos`. With `expect`, the block must be of that
    /// kind or the call fails with `Precondition` before anything is mined.
    pub async fn mine(&self, pos: BlockPos, expect: Option<&str>) -> SandboxResult<Value> {
        if let Some(kind) = expect {
            match self.rt.agent.block_at(pos).await? {
                Some(found) if found.kind == kind => {}
                Some(found) => {
                    return Err(SandboxError::Precondition(format!(
                        "expected {kind} at {pos}, found {}",
                        found.kind
                    )))
                }
                None => {
                    return Err(SandboxError::Precondition(format!(
                        "expected {kind} at {pos}, found air"
                    )))
                }
            }
        }
        self.rt.agent.mine(pos).await
    }

    pub async fn interact(&self, pos: BlockPos) -> SandboxResult<Value> {
        self.rt.agent.interact(pos).await
    }
}

#[derive(Clone)]
pub struct BuildApi {
    rt: Arc<RunRuntime>,
}

impl BuildApi {
    pub fn runtime(&self) -> &Arc<RunRuntime> {
        &self.rt
    }

    pub async fn place(&self, pos: BlockPos, item: &str) -> SandboxResult<Value> {
        self.rt.agent.place(pos, item).await
    }
}

#[derive(Clone)]
pub struct CraftApi {
    rt: Arc<RunRuntime>,
}

impl CraftApi {
    pub fn runtime(&self) -> &Arc<RunRuntime> {
        &self.rt
    }

    pub async fn craft(&self, item: &str, count: u32) -> SandboxResult<Value> {
        if count == 0 {
            return Err(SandboxError::Precondition("craft count must be positive".into()));
        }
        self.rt.agent.craft(item, count).await
    }
}

#[derive(Clone)]
pub struct InventoryApi {
    rt: Arc<RunRuntime>,
}

impl InventoryApi {
    pub fn runtime(&self) -> &Arc<RunRuntime> {
        &self.rt
    }

    pub async fn list(&self) -> SandboxResult<Vec<ItemStack>> {
        self.rt.agent.get_inventory().await
    }

    pub async fn count(&self, item: &str) -> SandboxResult<u32> {
        Ok(self
            .list()
            .await?
            .iter()
            .filter(|s| s.name == item)
            .map(|s| s.count)
            .sum())
    }

    pub async fn has(&self, item: &str, at_least: u32) -> SandboxResult<bool> {
        Ok(self.count(item).await? >= at_least.max(1))
    }

    pub async fn equip(&self, item: &str, slot: &str) -> SandboxResult<Value> {
        self.rt.agent.equip(item, slot).await
    }
}

// ---------------------------------------------------------------------------
// events
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct WatchApi {
    rt: Arc<RunRuntime>,
}

impl WatchApi {
    pub fn runtime(&self) -> &Arc<RunRuntime> {
        &self.rt
    }

    fn watchers(&self) -> std::sync::MutexGuard<'_, Watchers> {
        self.rt.watchers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a run-scoped subscription. Empty `kinds` receives everything.
    pub fn subscribe(&self, kinds: Vec<String>) -> SandboxResult<u64> {
        let rx = self.rt.agent.subscribe()?;
        let mut watchers = self.watchers();
        watchers.next_id += 1;
        let id = watchers.next_id;
        watchers.subs.insert(id, Subscription { kinds, rx: Some(rx) });
        Ok(id)
    }

    /// Matching events received since the last poll.
    pub fn poll(&self, id: u64) -> SandboxResult<Vec<AgentEvent>> {
        let mut watchers = self.watchers();
        let sub = watchers
            .subs
            .get_mut(&id)
            .ok_or_else(|| SandboxError::Precondition(format!("unknown subscription {id}")))?;
        let Some(rx) = sub.rx.as_mut() else {
            return Err(SandboxError::Precondition(format!("subscription {id} is busy")));
        };
        let mut out = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => out.push(event),
                Err(TryRecvError::Lagged(n)) => warn!(subscription = id, missed = n, "event subscriber lagged"),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        out.retain(|e| sub.wants(e));
        Ok(out)
    }

    /// Next matching event, or `None` when `timeout_ms` passes first.
    pub async fn wait(&self, id: u64, timeout_ms: u64) -> SandboxResult<Option<AgentEvent>> {
        let (mut rx, kinds) = {
            let mut watchers = self.watchers();
            let sub = watchers
                .subs
                .get_mut(&id)
                .ok_or_else(|| SandboxError::Precondition(format!("unknown subscription {id}")))?;
            let rx = sub
                .rx
                .take()
                .ok_or_else(|| SandboxError::Precondition(format!("subscription {id} is busy")))?;
            (rx, sub.kinds.clone())
        };
        let matcher = Subscription { kinds, rx: None };

        let waited = tokio::time::timeout(Duration::from_millis(timeout_ms), async {
            loop {
                match rx.recv().await {
                    Ok(event) if matcher.wants(&event) => return Some(event),
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .await
        .unwrap_or(None);

        if let Some(sub) = self.watchers().subs.get_mut(&id) {
            sub.rx = Some(rx);
        }
        Ok(waited)
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.watchers().subs.remove(&id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{SimulatedAgent, WorldSpec};
    use crate::sandbox::budget::OperationBudget;
    use crate::sandbox::gate::CapabilityGate;
    use serde_json::json;

    fn runtime(agent: Arc<SimulatedAgent>, caps: &[Capability], seed: u64) -> Arc<RunRuntime> {
        let config = Arc::new(SandboxConfig::default());
        let control = Arc::new(RunControl::new(Duration::from_secs(5)));
        let gate = Arc::new(CapabilityGate::new(
            caps.iter().copied().collect(),
            OperationBudget::new(&config.budgets),
        ));
        let agent = GatedAgent::new(agent, gate, control.clone());
        Arc::new(RunRuntime::new(
            agent,
            control,
            Arc::new(RunLog::new(100)),
            config,
            Map::new(),
            seed,
        ))
    }

    #[test]
    fn test_namespaces_follow_capabilities() {
        let agent = Arc::new(SimulatedAgent::default());

        let bare = ScriptContext::build(&runtime(agent.clone(), &[], 0));
        assert_eq!(
            bare.namespaces(),
            vec!["args", "world", "log", "clock", "geo", "rng", "flow"]
        );
        assert!(bare.nav.is_none() && bare.dig.is_none() && bare.watch.is_none());

        let ctx = ScriptContext::build(&runtime(
            agent,
            &[Capability::Move, Capability::Craft],
            0,
        ));
        let names = ctx.namespaces();
        assert!(names.contains(&"nav") && names.contains(&"search") && names.contains(&"safety"));
        assert!(names.contains(&"craft"));
        assert!(!names.contains(&"dig") && !names.contains(&"inventory"));
    }

    #[test]
    fn test_rng_namespace_is_seeded_per_run() {
        let agent = Arc::new(SimulatedAgent::default());
        let draw = |seed| {
            let ctx = ScriptContext::build(&runtime(agent.clone(), &[], seed));
            (0..5).map(|_| ctx.rng.int(0, 1_000)).collect::<Vec<_>>()
        };
        assert_eq!(draw(11), draw(11));
        assert_ne!(draw(11), draw(12));
    }

    #[tokio::test]
    async fn test_watch_filters_and_closes_with_the_run() {
        let agent = Arc::new(SimulatedAgent::default());
        let rt = runtime(agent.clone(), &[Capability::Events], 0);
        let watch = ScriptContext::build(&rt).watch.unwrap();

        let id = watch
            .subscribe(vec![crate::agent::event_kind::HEALTH.to_string()])
            .unwrap();
        agent.emit("chat", json!({"text": "hi"}));
        agent.set_health(5.0).await;

        let events = watch.poll(id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["health"], json!(5.0));
        assert!(watch.poll(id).unwrap().is_empty());

        rt.close_watchers();
        assert!(matches!(watch.poll(id), Err(SandboxError::Precondition(_))));
        assert!(!watch.unsubscribe(id));
    }

    #[tokio::test]
    async fn test_wait_times_out_without_events() {
        let agent = Arc::new(SimulatedAgent::default());
        let rt = runtime(agent, &[Capability::Events], 0);
        let watch = ScriptContext::build(&rt).watch.unwrap();
        let id = watch.subscribe(Vec::new()).unwrap();
        assert_eq!(watch.wait(id, 20).await.unwrap(), None);
        // The receiver is handed back after the wait.
        assert!(watch.poll(id).is_ok());
    }

    #[tokio::test]
    async fn test_safety_uses_health_threshold() {
        let agent = Arc::new(SimulatedAgent::default());
        let rt = runtime(agent.clone(), &[Capability::Move], 0);
        let safety = ScriptContext::build(&rt).safety.unwrap();

        assert!(safety.is_safe(None).await.unwrap());
        agent.set_health(4.0).await;
        assert!(!safety.is_safe(None).await.unwrap());
        assert!(safety.is_safe(Some(3.0)).await.unwrap());
        assert!(!safety.status().await.unwrap().safe);
    }

    #[tokio::test]
    async fn test_mine_kind_check_does_not_spend_budget() {
        let agent = Arc::new(SimulatedAgent::new(WorldSpec {
            blocks: vec![BlockInfo {
                position: BlockPos::new(1, 0, 0),
                kind: "stone".into(),
            }],
            ..WorldSpec::default()
        }));
        let rt = runtime(agent.clone(), &[Capability::Dig], 0);
        let dig = ScriptContext::build(&rt).dig.unwrap();

        let err = dig.mine(BlockPos::new(1, 0, 0), Some("gold_ore")).await.unwrap_err();
        assert!(matches!(err, SandboxError::Precondition(_)));
        assert_eq!(rt.agent().gate().budget().used(Capability::Dig), 0);
        assert_eq!(agent.calls_to("mine").await, 0);

        dig.mine(BlockPos::new(1, 0, 0), Some("stone")).await.unwrap();
        assert_eq!(rt.agent().gate().budget().used(Capability::Dig), 1);
        assert_eq!(agent.item_count("stone").await, 1);
    }
}
