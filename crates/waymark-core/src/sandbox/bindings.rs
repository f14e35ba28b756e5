//! Rhai bindings for the script context.
//!
//! Each namespace is a registered custom type, so `ctx.dig.mine(pos)` is a
//! method call on the `dig` handle stored in the `ctx` object map. Gated
//! functions return `#{ok: true, value}` or `#{ok: false, error}`; world,
//! clock and geometry helpers return plain values and throw on failure.
//!
//! Callbacks (flow ops, search predicates, bug2 obstacle tests) receive a
//! fresh context as their first argument. They must not capture the outer
//! `ctx`: the outer value is locked while the calling method runs.

use std::collections::BTreeSet;
use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use rhai::module_resolvers::DummyModuleResolver;
use rhai::packages::{
    BasicArrayPackage, BasicMapPackage, BasicMathPackage, CorePackage, LogicPackage,
    MoreStringPackage, Package,
};
use rhai::{
    Array, Dynamic, Engine, EvalAltResult, FnPtr, ImmutableString, Map as RhaiMap,
    NativeCallContext, Scope, FLOAT, INT,
};
use serde::Serialize;
use serde_json::Value;

use super::context::{
    BuildApi, ClockApi, CraftApi, DigApi, FlowApi, GeoApi, InventoryApi, LogApi, NavApi, PathPlan,
    RngApi, RunRuntime, SafetyApi, ScriptContext, SearchApi, WatchApi, WorldApi,
};
use super::error::{ErrorKind, ErrorRecord, SandboxError, SandboxResult};
use super::log::LogLevel;
use super::program::Completion;
use crate::config::EngineLimits;
use crate::flow::{self, is_retryable_kind, RetryPolicy, TransactionStep};
use crate::geometry::{self, BlockPos, BoundingBox, Position};
use crate::search::{Bug2Options, Handedness, SearchReport};

type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

/// Terminal value produced by `success(..)` / `fail(..)`.
#[derive(Debug, Clone)]
pub struct ScriptCompletion(pub Completion);

fn script_error(message: impl Into<String>) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(Dynamic::from(message.into()), rhai::Position::NONE).into()
}

/// Throw a sandbox error as a catchable `#{kind, message}` value.
fn throw(err: SandboxError) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(Dynamic::from_map(error_map(&err.to_record())), rhai::Position::NONE)
        .into()
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

fn to_dyn<T: Serialize>(value: &T) -> RhaiResult<Dynamic> {
    rhai::serde::to_dynamic(value)
}

fn to_json(value: &Dynamic) -> RhaiResult<Value> {
    rhai::serde::from_dynamic(value)
}

fn number(value: &Dynamic) -> Option<f64> {
    if let Ok(i) = value.as_int() {
        Some(i as f64)
    } else {
        value.as_float().ok()
    }
}

fn position_arg(value: &Dynamic) -> RhaiResult<Position> {
    let coords = if let Some(map) = value.read_lock::<RhaiMap>() {
        let get = |k: &str| map.get(k).and_then(number);
        match (get("x"), get("y"), get("z")) {
            (Some(x), Some(y), Some(z)) => Some(Position::new(x, y, z)),
            _ => None,
        }
    } else if let Some(arr) = value.read_lock::<Array>() {
        match arr.as_slice() {
            [x, y, z] => match (number(x), number(y), number(z)) {
                (Some(x), Some(y), Some(z)) => Some(Position::new(x, y, z)),
                _ => None,
            },
            _ => None,
        }
    } else {
        None
    };
    let pos = coords
        .filter(Position::is_finite)
        .ok_or_else(|| script_error(format!("expected a position #{{x, y, z}} or [x, y, z], got {value}")))?;
    if !pos.in_world_range() {
        return Err(throw(SandboxError::InvalidArgument(format!(
            "position {pos} is outside +/-{} on some axis",
            geometry::COORD_LIMIT
        ))));
    }
    Ok(pos)
}

fn block_arg(value: &Dynamic) -> RhaiResult<BlockPos> {
    position_arg(value).map(|p| p.floored())
}

fn optional_position(value: &Dynamic) -> RhaiResult<Option<Position>> {
    if value.is_unit() {
        Ok(None)
    } else {
        position_arg(value).map(Some)
    }
}

fn positions_arg(value: &Dynamic) -> RhaiResult<Vec<Position>> {
    let arr = value
        .read_lock::<Array>()
        .ok_or_else(|| script_error("expected an array of positions"))?;
    arr.iter().map(position_arg).collect()
}

fn strings_arg(value: &Dynamic) -> RhaiResult<Vec<String>> {
    if value.is_unit() {
        return Ok(Vec::new());
    }
    if value.is_string() {
        return Ok(vec![value.to_string()]);
    }
    let arr = value
        .read_lock::<Array>()
        .ok_or_else(|| script_error("expected a string or an array of strings"))?;
    Ok(arr.iter().map(|s| s.to_string()).collect())
}

fn non_negative(value: INT, what: &str) -> RhaiResult<u64> {
    u64::try_from(value).map_err(|_| script_error(format!("{what} must not be negative")))
}

fn as_u32(value: INT, what: &str) -> RhaiResult<u32> {
    u32::try_from(value).map_err(|_| script_error(format!("{what} is out of range")))
}

/// Read-only view over an optional options map.
struct Opts(RhaiMap);

impl Opts {
    fn parse(value: &Dynamic) -> RhaiResult<Self> {
        if value.is_unit() {
            return Ok(Self(RhaiMap::new()));
        }
        value
            .read_lock::<RhaiMap>()
            .map(|m| Self(m.clone()))
            .ok_or_else(|| script_error(format!("expected an options map, got {}", value.type_name())))
    }

    fn raw(&self, key: &str) -> Option<&Dynamic> {
        self.0.get(key).filter(|v| !v.is_unit())
    }

    fn f64(&self, key: &str) -> RhaiResult<Option<f64>> {
        self.raw(key)
            .map(|v| number(v).ok_or_else(|| script_error(format!("option '{key}' must be a number"))))
            .transpose()
    }

    fn int(&self, key: &str) -> RhaiResult<Option<u64>> {
        self.raw(key)
            .map(|v| {
                v.as_int()
                    .ok()
                    .and_then(|i| u64::try_from(i).ok())
                    .ok_or_else(|| script_error(format!("option '{key}' must be a non-negative integer")))
            })
            .transpose()
    }

    fn u32(&self, key: &str) -> RhaiResult<Option<u32>> {
        self.int(key)?
            .map(|v| u32::try_from(v).map_err(|_| script_error(format!("option '{key}' is out of range"))))
            .transpose()
    }

    fn bool(&self, key: &str) -> RhaiResult<Option<bool>> {
        self.raw(key)
            .map(|v| v.as_bool().map_err(|_| script_error(format!("option '{key}' must be a bool"))))
            .transpose()
    }

    fn string(&self, key: &str) -> Option<String> {
        self.raw(key).map(|v| v.to_string())
    }

    fn strings(&self, key: &str) -> RhaiResult<Vec<String>> {
        self.raw(key).map_or(Ok(Vec::new()), strings_arg)
    }

    fn cells(&self, key: &str) -> RhaiResult<Vec<BlockPos>> {
        self.raw(key).map_or(Ok(Vec::new()), |v| {
            Ok(positions_arg(v)?.iter().map(Position::floored).collect())
        })
    }

    fn fn_ptr(&self, key: &str) -> RhaiResult<Option<FnPtr>> {
        self.raw(key)
            .map(|v| {
                v.clone()
                    .try_cast::<FnPtr>()
                    .ok_or_else(|| script_error(format!("option '{key}' must be a function")))
            })
            .transpose()
    }
}

// ---------------------------------------------------------------------------
// Outcome shapes
// ---------------------------------------------------------------------------

fn error_map(record: &ErrorRecord) -> RhaiMap {
    let mut map = RhaiMap::new();
    map.insert("kind".into(), record.kind.as_str().into());
    map.insert("message".into(), record.message.clone().into());
    map
}

fn ok_map(value: Dynamic) -> RhaiMap {
    let mut map = RhaiMap::new();
    map.insert("ok".into(), Dynamic::TRUE);
    map.insert("value".into(), value);
    map
}

fn err_map(record: &ErrorRecord) -> RhaiMap {
    let mut map = RhaiMap::new();
    map.insert("ok".into(), Dynamic::FALSE);
    map.insert("error".into(), Dynamic::from_map(error_map(record)));
    map
}

fn outcome<T: Serialize>(result: SandboxResult<T>) -> RhaiResult<Dynamic> {
    Ok(Dynamic::from_map(match result {
        Ok(value) => ok_map(to_dyn(&value)?),
        Err(err) => err_map(&err.to_record()),
    }))
}

fn record_outcome(result: Result<Dynamic, ErrorRecord>) -> Dynamic {
    Dynamic::from_map(match result {
        Ok(value) => ok_map(value),
        Err(record) => err_map(&record),
    })
}

fn search_outcome(result: SandboxResult<SearchReport>, radius: u32) -> RhaiResult<Dynamic> {
    let report = match result {
        Ok(report) => report,
        Err(err) => return Ok(Dynamic::from_map(err_map(&err.to_record()))),
    };
    let mut map = match report.found {
        Some(pos) => ok_map(to_dyn(&pos)?),
        None => err_map(&ErrorRecord {
            kind: ErrorKind::PathNotFound,
            message: format!("no position matched within radius {radius}"),
        }),
    };
    let stats = &report.stats;
    map.insert("ring".into(), (stats.ring as INT).into());
    map.insert("visited".into(), (stats.positions_visited as INT).into());
    map.insert("skipped".into(), (stats.skipped as INT).into());
    map.insert("distance".into(), (stats.distance as FLOAT).into());
    map.insert("elapsed_ms".into(), (stats.elapsed_ms as INT).into());
    Ok(Dynamic::from_map(map))
}

fn record_from_map(map: &RhaiMap, fallback: ErrorKind) -> ErrorRecord {
    let kind = map
        .get("kind")
        .and_then(|k| ErrorKind::parse(&k.to_string()))
        .unwrap_or(fallback);
    let message = map
        .get("message")
        .map(|m| m.to_string())
        .unwrap_or_else(|| kind.as_str().to_string());
    ErrorRecord { kind, message }
}

/// Classify an escaped engine error.
fn eval_record(err: &EvalAltResult) -> ErrorRecord {
    match err {
        EvalAltResult::ErrorTerminated(..) => ErrorRecord {
            kind: ErrorKind::Timeout,
            message: "run deadline reached".into(),
        },
        EvalAltResult::ErrorRuntime(value, _) => match value.read_lock::<RhaiMap>() {
            Some(map) if map.contains_key("kind") => record_from_map(&map, ErrorKind::ScriptError),
            _ => ErrorRecord {
                kind: ErrorKind::ScriptError,
                message: err.to_string(),
            },
        },
        other => ErrorRecord {
            kind: ErrorKind::ScriptError,
            message: other.to_string(),
        },
    }
}

/// A flow op fails when it throws or returns a map with `ok == false`.
/// A successful gated outcome is unwrapped to its value.
fn op_result(result: RhaiResult<Dynamic>) -> Result<Dynamic, ErrorRecord> {
    let value = result.map_err(|e| eval_record(&e))?;
    let map = match value.clone().try_cast::<RhaiMap>() {
        Some(map) => map,
        None => return Ok(value),
    };
    match map.get("ok").and_then(|ok| ok.as_bool().ok()) {
        Some(false) => {
            let record = map
                .get("error")
                .and_then(|e| e.read_lock::<RhaiMap>().map(|m| record_from_map(&m, ErrorKind::OperationFailed)))
                .unwrap_or(ErrorRecord {
                    kind: ErrorKind::OperationFailed,
                    message: "operation reported failure".into(),
                });
            Err(record)
        }
        Some(true) => Ok(map.get("value").cloned().unwrap_or(Dynamic::UNIT)),
        None => Ok(value),
    }
}

fn truthy(value: &Dynamic) -> SandboxResult<bool> {
    if let Ok(b) = value.as_bool() {
        return Ok(b);
    }
    if value.is_unit() {
        return Ok(false);
    }
    if let Some(map) = value.read_lock::<RhaiMap>() {
        if let Some(ok) = map.get("ok").and_then(|ok| ok.as_bool().ok()) {
            return Ok(ok);
        }
    }
    Err(SandboxError::ScriptError(format!(
        "callback must return a bool, got {}",
        value.type_name()
    )))
}

fn callback_error(rt: &RunRuntime, err: Box<EvalAltResult>) -> SandboxError {
    let record = eval_record(&err);
    match record.kind {
        ErrorKind::Timeout => SandboxError::Timeout {
            limit_ms: rt.control().limit_ms(),
        },
        _ => SandboxError::ScriptError(record.message),
    }
}

// ---------------------------------------------------------------------------
// Context map
// ---------------------------------------------------------------------------

/// The `ctx` object map: one entry per present namespace.
pub fn context_map(ctx: &ScriptContext) -> RhaiResult<RhaiMap> {
    let mut map = RhaiMap::new();
    map.insert("args".into(), to_dyn(&Value::Object(ctx.args.clone()))?);
    map.insert("world".into(), Dynamic::from(ctx.world.clone()));
    map.insert("log".into(), Dynamic::from(ctx.log.clone()));
    map.insert("clock".into(), Dynamic::from(ctx.clock.clone()));
    map.insert("geo".into(), Dynamic::from(ctx.geo));
    map.insert("rng".into(), Dynamic::from(ctx.rng.clone()));
    map.insert("flow".into(), Dynamic::from(ctx.flow.clone()));
    if let Some(api) = &ctx.nav {
        map.insert("nav".into(), Dynamic::from(api.clone()));
    }
    if let Some(api) = &ctx.search {
        map.insert("search".into(), Dynamic::from(api.clone()));
    }
    if let Some(api) = &ctx.safety {
        map.insert("safety".into(), Dynamic::from(api.clone()));
    }
    if let Some(api) = &ctx.dig {
        map.insert("dig".into(), Dynamic::from(api.clone()));
    }
    if let Some(api) = &ctx.build {
        map.insert("build".into(), Dynamic::from(api.clone()));
    }
    if let Some(api) = &ctx.craft {
        map.insert("craft".into(), Dynamic::from(api.clone()));
    }
    if let Some(api) = &ctx.inventory {
        map.insert("inventory".into(), Dynamic::from(api.clone()));
    }
    if let Some(api) = &ctx.watch {
        map.insert("watch".into(), Dynamic::from(api.clone()));
    }
    Ok(map)
}

fn fresh_ctx(rt: &Arc<RunRuntime>) -> RhaiResult<Dynamic> {
    context_map(&ScriptContext::build(rt)).map(Dynamic::from_map)
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// A locked-down engine with the context API registered. Time and module
/// packages are left out on purpose.
pub fn new_engine(limits: &EngineLimits) -> Engine {
    let mut engine = Engine::new_raw();
    engine.register_global_module(CorePackage::new().as_shared_module());
    engine.register_global_module(LogicPackage::new().as_shared_module());
    engine.register_global_module(BasicMathPackage::new().as_shared_module());
    engine.register_global_module(BasicArrayPackage::new().as_shared_module());
    engine.register_global_module(BasicMapPackage::new().as_shared_module());
    engine.register_global_module(MoreStringPackage::new().as_shared_module());

    engine
        .set_module_resolver(DummyModuleResolver::new())
        .set_max_operations(limits.max_operations)
        .set_max_call_levels(limits.max_call_levels)
        .set_max_expr_depths(limits.max_expr_depth, limits.max_function_expr_depth)
        .set_max_string_size(limits.max_string_size)
        .set_max_array_size(limits.max_array_size)
        .set_max_map_size(limits.max_map_size)
        .set_fail_on_invalid_map_property(true);
    engine.disable_symbol("eval");

    register_completion(&mut engine);
    register_world(&mut engine);
    register_log(&mut engine);
    register_clock(&mut engine);
    register_geo(&mut engine);
    register_rng(&mut engine);
    register_flow(&mut engine);
    register_nav(&mut engine);
    register_search(&mut engine);
    register_safety(&mut engine);
    register_actions(&mut engine);
    register_inventory(&mut engine);
    register_watch(&mut engine);
    engine
}

/// Route `print`/`debug` into the run log and stop the engine once the
/// run can no longer make progress.
fn attach_run(engine: &mut Engine, rt: &Arc<RunRuntime>) {
    let log = rt.clone();
    engine.on_print(move |s| {
        log.record(LogLevel::Info, s, None);
    });
    let log = rt.clone();
    engine.on_debug(move |s, _source, pos| {
        let message = if pos.is_none() {
            s.to_string()
        } else {
            format!("{s} @ {pos}")
        };
        log.record(LogLevel::Debug, message, None);
    });
    let control = rt.clone();
    engine.on_progress(move |ops| {
        if ops % 64 == 0 && control.control().run_expired() {
            Some(Dynamic::UNIT)
        } else {
            None
        }
    });
}

/// Compile `source` without running it.
pub fn compile_check(source: &str, limits: &EngineLimits) -> SandboxResult<()> {
    new_engine(limits)
        .compile(source)
        .map(|_| ())
        .map_err(|e| SandboxError::ScriptError(format!("compile error: {e}")))
}

/// Run one script to completion on the current (blocking) thread.
pub fn run_script(rt: &Arc<RunRuntime>, source: &str, limits: &EngineLimits) -> SandboxResult<Completion> {
    let mut engine = new_engine(limits);
    attach_run(&mut engine, rt);

    let ast = engine
        .compile(source)
        .map_err(|e| SandboxError::ScriptError(format!("compile error: {e}")))?;
    let ctx = fresh_ctx(rt).map_err(|e| SandboxError::ScriptError(e.to_string()))?;
    let has_main = ast
        .iter_functions()
        .any(|f| f.name == "main" && f.params.len() == 1);

    let mut scope = Scope::new();
    let value = if has_main {
        engine.call_fn::<Dynamic>(&mut scope, &ast, "main", (ctx,))
    } else {
        scope.push_dynamic("ctx", ctx);
        engine.eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
    };

    match value {
        Ok(value) => {
            let type_name = value.type_name();
            value
                .try_cast::<ScriptCompletion>()
                .map(|c| c.0)
                .ok_or_else(|| {
                    SandboxError::ScriptError(format!(
                        "missing completion signal: script ended with {type_name} instead of success(..) or fail(..)"
                    ))
                })
        }
        Err(err) => {
            if matches!(*err, EvalAltResult::ErrorTerminated(..)) {
                return Err(SandboxError::Timeout {
                    limit_ms: rt.control().limit_ms(),
                });
            }
            let record = eval_record(&err);
            Err(SandboxError::ScriptError(match record.kind {
                ErrorKind::ScriptError => record.message,
                kind => format!("uncaught {kind}: {}", record.message),
            }))
        }
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

fn register_completion(engine: &mut Engine) {
    engine.register_type_with_name::<ScriptCompletion>("Completion");
    engine.register_fn("success", || ScriptCompletion(Completion::Success(Value::Null)));
    engine.register_fn("success", |payload: Dynamic| -> RhaiResult<ScriptCompletion> {
        Ok(ScriptCompletion(Completion::Success(to_json(&payload)?)))
    });
    engine.register_fn("fail", |message: ImmutableString| {
        ScriptCompletion(Completion::Failure {
            message: message.to_string(),
            payload: Value::Null,
        })
    });
    engine.register_fn(
        "fail",
        |message: ImmutableString, payload: Dynamic| -> RhaiResult<ScriptCompletion> {
            Ok(ScriptCompletion(Completion::Failure {
                message: message.to_string(),
                payload: to_json(&payload)?,
            }))
        },
    );
}

fn register_world(engine: &mut Engine) {
    engine.register_type_with_name::<WorldApi>("World");
    engine.register_fn("state", |api: &mut WorldApi| -> RhaiResult<Dynamic> {
        let state = api.runtime().block_on(api.state()).map_err(throw)?;
        to_dyn(&state)
    });
    fn scan(api: &mut WorldApi, kinds: Dynamic, radius: INT, max: INT) -> RhaiResult<Dynamic> {
        let kinds = strings_arg(&kinds)?;
        let radius = as_u32(radius, "radius")?;
        let max = non_negative(max, "max")? as usize;
        let blocks = api
            .runtime()
            .block_on(api.scan(&kinds, radius, max))
            .map_err(throw)?;
        to_dyn(&blocks)
    }
    engine.register_fn("scan", scan);
    engine.register_fn("scan", |api: &mut WorldApi, kinds: Dynamic, radius: INT| {
        scan(api, kinds, radius, 64)
    });
    engine.register_fn("block_at", |api: &mut WorldApi, pos: Dynamic| -> RhaiResult<Dynamic> {
        let pos = block_arg(&pos)?;
        match api.runtime().block_on(api.block_at(pos)).map_err(throw)? {
            Some(block) => to_dyn(&block),
            None => Ok(Dynamic::UNIT),
        }
    });
}

fn register_log(engine: &mut Engine) {
    engine.register_type_with_name::<LogApi>("Log");
    for (name, level) in [
        ("info", LogLevel::Info),
        ("warn", LogLevel::Warn),
        ("error", LogLevel::Error),
    ] {
        engine.register_fn(name, move |api: &mut LogApi, message: Dynamic| {
            api.write(level, message.to_string(), None);
        });
        engine.register_fn(
            name,
            move |api: &mut LogApi, message: Dynamic, data: Dynamic| -> RhaiResult<()> {
                api.write(level, message.to_string(), Some(to_json(&data)?));
                Ok(())
            },
        );
    }
    engine.register_fn(
        "write",
        |api: &mut LogApi, level: ImmutableString, message: Dynamic| -> RhaiResult<()> {
            let level = LogLevel::parse(&level)
                .ok_or_else(|| script_error(format!("unknown log level '{level}'")))?;
            api.write(level, message.to_string(), None);
            Ok(())
        },
    );
}

fn register_clock(engine: &mut Engine) {
    engine.register_type_with_name::<ClockApi>("Clock");
    engine.register_fn("now_ms", |api: &mut ClockApi| api.now_ms() as INT);
    engine.register_fn("sleep", |api: &mut ClockApi, ms: INT| -> RhaiResult<()> {
        let ms = non_negative(ms, "sleep duration")?;
        pollster::block_on(api.sleep(ms)).map_err(throw)
    });
}

fn register_geo(engine: &mut Engine) {
    engine.register_type_with_name::<GeoApi>("Geo");
    engine.register_fn("distance", |_: &mut GeoApi, a: Dynamic, b: Dynamic| -> RhaiResult<FLOAT> {
        Ok(geometry::euclidean(&position_arg(&a)?, &position_arg(&b)?))
    });
    engine.register_fn("horizontal", |_: &mut GeoApi, a: Dynamic, b: Dynamic| -> RhaiResult<FLOAT> {
        Ok(geometry::horizontal_distance(&position_arg(&a)?, &position_arg(&b)?))
    });
    engine.register_fn("manhattan", |_: &mut GeoApi, a: Dynamic, b: Dynamic| -> RhaiResult<FLOAT> {
        Ok(geometry::manhattan(&position_arg(&a)?, &position_arg(&b)?))
    });
    engine.register_fn("chebyshev", |_: &mut GeoApi, a: Dynamic, b: Dynamic| -> RhaiResult<FLOAT> {
        Ok(geometry::chebyshev(&position_arg(&a)?, &position_arg(&b)?))
    });
    engine.register_fn("line", |api: &mut GeoApi, a: Dynamic, b: Dynamic| -> RhaiResult<Dynamic> {
        to_dyn(&api.line(block_arg(&a)?, block_arg(&b)?).map_err(throw)?)
    });
    engine.register_fn("circle", |api: &mut GeoApi, center: Dynamic, radius: INT| -> RhaiResult<Dynamic> {
        let cells = api
            .circle(block_arg(&center)?, as_u32(radius, "radius")?)
            .map_err(throw)?;
        to_dyn(&cells)
    });
    engine.register_fn("ring", |api: &mut GeoApi, center: Dynamic, k: INT| -> RhaiResult<Dynamic> {
        to_dyn(&api.ring(block_arg(&center)?, as_u32(k, "ring index")?).map_err(throw)?)
    });
    engine.register_fn("bbox", |_: &mut GeoApi, points: Dynamic| -> RhaiResult<Dynamic> {
        let points = positions_arg(&points)?;
        match BoundingBox::from_points(&points) {
            Some(bbox) => to_dyn(&bbox),
            None => Ok(Dynamic::UNIT),
        }
    });
}

fn register_rng(engine: &mut Engine) {
    engine.register_type_with_name::<RngApi>("Rng");
    engine.register_fn("next", |api: &mut RngApi| api.next());
    engine.register_fn("int", |api: &mut RngApi, min: INT, max: INT| api.int(min, max));
    engine.register_fn("float", |api: &mut RngApi, min: FLOAT, max: FLOAT| api.float(min, max));
    engine.register_fn("float", |api: &mut RngApi, min: INT, max: INT| {
        api.float(min as FLOAT, max as FLOAT)
    });
    engine.register_fn("chance", |api: &mut RngApi, p: FLOAT| api.chance(p));
    engine.register_fn("pick", |api: &mut RngApi, items: Array| {
        api.pick(&items).unwrap_or(Dynamic::UNIT)
    });
    engine.register_fn("shuffle", |api: &mut RngApi, mut items: Array| {
        api.shuffle(&mut items);
        items
    });
}

fn retry_policy(opts: &Opts) -> RhaiResult<RetryPolicy> {
    let defaults = RetryPolicy::default();
    Ok(RetryPolicy {
        max_attempts: opts.u32("max_attempts")?.unwrap_or(defaults.max_attempts),
        base_delay_ms: opts.int("base_delay_ms")?.unwrap_or(defaults.base_delay_ms),
        max_delay_ms: opts.int("max_delay_ms")?.unwrap_or(defaults.max_delay_ms),
    })
}

fn register_flow(engine: &mut Engine) {
    engine.register_type_with_name::<FlowApi>("Flow");

    engine.register_fn(
        "with_timeout",
        |nctx: NativeCallContext, api: &mut FlowApi, op: FnPtr, ms: INT| -> RhaiResult<Dynamic> {
            let limit_ms = non_negative(ms, "timeout")?;
            let rt = api.runtime().clone();
            let ctx = fresh_ctx(&rt)?;
            let guard = rt.control().push_deadline(Duration::from_millis(limit_ms));
            let result = op_result(op.call_within_context::<Dynamic>(&nctx, (ctx,)));
            let expired = guard.expired();
            drop(guard);
            if expired {
                return Ok(record_outcome(Err(SandboxError::Timeout { limit_ms }.to_record())));
            }
            Ok(record_outcome(result))
        },
    );

    /// `opts.should_retry`, when given, is called as `(ctx, error)` after
    /// each failure and decides whether another attempt is made.
    fn retry(nctx: NativeCallContext, api: &mut FlowApi, op: FnPtr, opts: Dynamic) -> RhaiResult<Dynamic> {
        let opts = Opts::parse(&opts)?;
        let policy = retry_policy(&opts)?;
        let should_retry = opts.fn_ptr("should_retry")?;
        let rt = api.runtime().clone();
        let ctx = fresh_ctx(&rt)?;
        let mut predicate_error = None;
        let report = rt
            .block_on(async {
                Ok(flow::retry_with_backoff(
                    &policy,
                    |_attempt| ready(op_result(op.call_within_context::<Dynamic>(&nctx, (ctx.clone(),)))),
                    |err: &ErrorRecord| {
                        let Some(predicate) = &should_retry else {
                            return is_retryable_kind(err.kind);
                        };
                        let verdict = predicate
                            .call_within_context::<Dynamic>(&nctx, (ctx.clone(), Dynamic::from_map(error_map(err))))
                            .map_err(|e| callback_error(&rt, e))
                            .and_then(|v| truthy(&v));
                        verdict.unwrap_or_else(|e| {
                            predicate_error = Some(e);
                            false
                        })
                    },
                )
                .await)
            })
            .map_err(throw)?;
        if let Some(err) = predicate_error {
            return Err(throw(err));
        }

        let delays: Array = report.delays_ms.iter().map(|&d| (d as INT).into()).collect();
        let mut map = match &report.outcome {
            Ok(value) => ok_map(value.clone()),
            Err(record) => err_map(record),
        };
        map.insert("attempts".into(), (report.attempts as INT).into());
        map.insert("delays_ms".into(), delays.into());
        Ok(Dynamic::from_map(map))
    }
    engine.register_fn("retry", retry);
    engine.register_fn("retry", |nctx: NativeCallContext, api: &mut FlowApi, op: FnPtr| {
        retry(nctx, api, op, Dynamic::UNIT)
    });

    engine.register_fn(
        "transaction",
        |nctx: NativeCallContext, api: &mut FlowApi, steps: Array| -> RhaiResult<Dynamic> {
            let rt = api.runtime().clone();
            let ctx = fresh_ctx(&rt)?;
            let nctx = &nctx;

            let mut plan = Vec::with_capacity(steps.len());
            for (index, step) in steps.iter().enumerate() {
                let opts = Opts::parse(step)?;
                let name = opts.string("name").unwrap_or_else(|| format!("step{index}"));
                let run = opts
                    .fn_ptr("run")?
                    .ok_or_else(|| script_error(format!("transaction step '{name}' needs a 'run' function")))?;
                let run_ctx = ctx.clone();
                let mut step = TransactionStep::new(name, move || {
                    ready(op_result(run.call_within_context::<Dynamic>(nctx, (run_ctx,))))
                });
                if let Some(rollback) = opts.fn_ptr("rollback")? {
                    let rb_ctx = ctx.clone();
                    step = step.with_rollback(move || {
                        ready(op_result(rollback.call_within_context::<Dynamic>(nctx, (rb_ctx,))).map(|_| ()))
                    });
                }
                plan.push(step);
            }

            let report = pollster::block_on(flow::transaction(plan));

            let names = |v: &[String]| -> Array { v.iter().map(|s| s.clone().into()).collect() };
            let mut map = RhaiMap::new();
            map.insert("ok".into(), report.ok.into());
            map.insert("values".into(), Dynamic::from_array(report.values));
            map.insert("committed".into(), names(&report.committed).into());
            map.insert("rolled_back".into(), names(&report.rolled_back).into());
            let failed = match &report.failed {
                Some(failed) => {
                    let mut f = RhaiMap::new();
                    f.insert("index".into(), (failed.index as INT).into());
                    f.insert("name".into(), failed.name.clone().into());
                    f.insert("error".into(), Dynamic::from_map(error_map(&failed.error)));
                    Dynamic::from_map(f)
                }
                None => Dynamic::UNIT,
            };
            map.insert("failed".into(), failed);
            let rollback_errors: Array = report
                .rollback_errors
                .iter()
                .map(|(name, err)| {
                    let mut e = RhaiMap::new();
                    e.insert("name".into(), name.clone().into());
                    e.insert("error".into(), Dynamic::from_map(error_map(err)));
                    Dynamic::from_map(e)
                })
                .collect();
            map.insert("rollback_errors".into(), rollback_errors.into());
            Ok(Dynamic::from_map(map))
        },
    );

    engine.register_fn(
        "parallel",
        |nctx: NativeCallContext, api: &mut FlowApi, ops: Array, concurrency: INT| -> RhaiResult<Dynamic> {
            let concurrency = non_negative(concurrency, "concurrency")?.max(1) as usize;
            let rt = api.runtime().clone();
            let ctx = fresh_ctx(&rt)?;
            let fns = ops
                .iter()
                .map(|op| {
                    op.clone()
                        .try_cast::<FnPtr>()
                        .ok_or_else(|| script_error("parallel expects an array of functions"))
                })
                .collect::<RhaiResult<Vec<FnPtr>>>()?;
            let futures = fns.iter().map(|f| {
                let result = op_result(f.call_within_context::<Dynamic>(&nctx, (ctx.clone(),)));
                ready(result)
            });
            let results = pollster::block_on(flow::parallel(futures, concurrency));
            Ok(Dynamic::from_array(results.into_iter().map(record_outcome).collect()))
        },
    );
}

fn path_plan(api: &NavApi, opts: &Opts) -> RhaiResult<PathPlan> {
    let search = &api.runtime().config().search;
    let mut plan = PathPlan::default();
    plan.options.max_iterations = opts
        .int("max_iterations")?
        .map_or(search.astar_max_iterations, |v| v as usize);
    plan.options.goal_tolerance = opts.f64("goal_tolerance")?.unwrap_or(search.goal_tolerance);
    plan.options.allow_vertical = opts.bool("allow_vertical")?.unwrap_or(true);
    plan.avoid = opts.strings("avoid")?;
    plan.obstacles = opts.cells("obstacles")?;
    plan.follow = opts.bool("follow")?.unwrap_or(false);
    Ok(plan)
}

fn register_nav(engine: &mut Engine) {
    engine.register_type_with_name::<NavApi>("Nav");

    fn go_to(api: &mut NavApi, target: Dynamic, opts: Dynamic) -> RhaiResult<Dynamic> {
        let target = position_arg(&target)?;
        let tolerance = Opts::parse(&opts)?.f64("tolerance")?;
        outcome(api.runtime().block_on(api.go_to(target, tolerance)))
    }
    engine.register_fn("go_to", go_to);
    engine.register_fn("go_to", |api: &mut NavApi, target: Dynamic| {
        go_to(api, target, Dynamic::UNIT)
    });

    fn pathfind(api: &mut NavApi, goal: Dynamic, opts: Dynamic) -> RhaiResult<Dynamic> {
        let goal = position_arg(&goal)?;
        let plan = path_plan(api, &Opts::parse(&opts)?)?;
        outcome(api.runtime().block_on(api.pathfind(goal, &plan)))
    }
    engine.register_fn("pathfind", pathfind);
    engine.register_fn("pathfind", |api: &mut NavApi, goal: Dynamic| {
        pathfind(api, goal, Dynamic::UNIT)
    });

    fn bug2(nctx: NativeCallContext, api: &mut NavApi, goal: Dynamic, opts: Dynamic) -> RhaiResult<Dynamic> {
        let goal = position_arg(&goal)?;
        let opts = Opts::parse(&opts)?;
        let search = &api.runtime().config().search;
        let handedness = match opts.string("handedness").as_deref() {
            None | Some("right") => Handedness::Right,
            Some("left") => Handedness::Left,
            Some(other) => return Err(script_error(format!("unknown handedness '{other}'"))),
        };
        let options = Bug2Options {
            handedness,
            max_iterations: opts
                .int("max_iterations")?
                .map_or(search.bug2_max_iterations, |v| v as usize),
            goal_tolerance: opts.f64("goal_tolerance")?.unwrap_or(search.goal_tolerance),
            line_tolerance: opts.f64("line_tolerance")?.unwrap_or(search.line_tolerance),
        };
        let follow = opts.bool("follow")?.unwrap_or(false);
        let rt = api.runtime().clone();

        let result = match opts.fn_ptr("blocked")? {
            Some(callback) => {
                let ctx = fresh_ctx(&rt)?;
                rt.block_on(api.bug2(goal, &options, follow, |cell| {
                    let cell = to_dyn(&cell).map_err(|e| callback_error(&rt, e))?;
                    callback
                        .call_within_context::<Dynamic>(&nctx, (ctx.clone(), cell))
                        .map_err(|e| callback_error(&rt, e))
                        .and_then(|v| truthy(&v))
                }))
            }
            None => {
                let avoid = opts.strings("avoid")?;
                let extra = opts.cells("obstacles")?;
                rt.block_on(async {
                    let blocked = api.obstacles(&avoid, &extra).await?;
                    api.bug2(goal, &options, follow, |cell| Ok(blocked.contains(&cell)))
                        .await
                })
            }
        };
        outcome(result)
    }
    engine.register_fn("bug2", bug2);
    engine.register_fn("follow", |api: &mut NavApi, path: Dynamic| -> RhaiResult<Dynamic> {
        let cells: Vec<BlockPos> = positions_arg(&path)?.iter().map(Position::floored).collect();
        outcome(api.runtime().block_on(api.follow(&cells)))
    });
    engine.register_fn("bug2", |nctx: NativeCallContext, api: &mut NavApi, goal: Dynamic| {
        bug2(nctx, api, goal, Dynamic::UNIT)
    });
}

fn register_search(engine: &mut Engine) {
    engine.register_type_with_name::<SearchApi>("Search");

    fn expand_square(
        nctx: NativeCallContext,
        api: &mut SearchApi,
        center: Dynamic,
        predicate: FnPtr,
        opts: Dynamic,
    ) -> RhaiResult<Dynamic> {
        let center = optional_position(&center)?;
        let o = Opts::parse(&opts)?;
        let mut options = api.default_expand();
        options.radius = o.u32("radius")?.unwrap_or(options.radius);
        let rt = api.runtime().clone();
        let ctx = fresh_ctx(&rt)?;
        let result = rt.block_on(api.expand_square(center, &options, |pos| {
            ready(call_predicate(&rt, &nctx, &predicate, &ctx, pos))
        }));
        search_outcome(result, options.radius)
    }
    engine.register_fn("expand_square", expand_square);
    engine.register_fn(
        "expand_square",
        |nctx: NativeCallContext, api: &mut SearchApi, center: Dynamic, predicate: FnPtr| {
            expand_square(nctx, api, center, predicate, Dynamic::UNIT)
        },
    );

    fn spiral(
        nctx: NativeCallContext,
        api: &mut SearchApi,
        center: Dynamic,
        predicate: FnPtr,
        opts: Dynamic,
    ) -> RhaiResult<Dynamic> {
        let center = optional_position(&center)?;
        let o = Opts::parse(&opts)?;
        let mut options = api.default_spiral();
        options.radius = o.u32("radius")?.unwrap_or(options.radius);
        options.step = o.u32("step")?.unwrap_or(options.step);
        let rt = api.runtime().clone();
        let ctx = fresh_ctx(&rt)?;
        let result = rt.block_on(api.spiral(center, &options, |pos| {
            ready(call_predicate(&rt, &nctx, &predicate, &ctx, pos))
        }));
        search_outcome(result, options.radius)
    }
    engine.register_fn("spiral", spiral);
    engine.register_fn(
        "spiral",
        |nctx: NativeCallContext, api: &mut SearchApi, center: Dynamic, predicate: FnPtr| {
            spiral(nctx, api, center, predicate, Dynamic::UNIT)
        },
    );

    fn random_walk(
        nctx: NativeCallContext,
        api: &mut SearchApi,
        center: Dynamic,
        predicate: FnPtr,
        opts: Dynamic,
    ) -> RhaiResult<Dynamic> {
        let center = optional_position(&center)?;
        let o = Opts::parse(&opts)?;
        let mut options = api.default_random_walk();
        options.radius = o.u32("radius")?.unwrap_or(options.radius);
        options.max_steps = o.u32("max_steps")?.unwrap_or(options.max_steps);
        options.min_len = o.u32("min_len")?.unwrap_or(options.min_len);
        options.max_len = o.u32("max_len")?.unwrap_or(options.max_len);
        options.max_redraws = o.u32("max_redraws")?.unwrap_or(options.max_redraws);
        let rt = api.runtime().clone();
        let ctx = fresh_ctx(&rt)?;
        let result = rt.block_on(api.random_walk(center, &options, |pos| {
            ready(call_predicate(&rt, &nctx, &predicate, &ctx, pos))
        }));
        search_outcome(result, options.radius)
    }
    engine.register_fn("random_walk", random_walk);
    engine.register_fn(
        "random_walk",
        |nctx: NativeCallContext, api: &mut SearchApi, center: Dynamic, predicate: FnPtr| {
            random_walk(nctx, api, center, predicate, Dynamic::UNIT)
        },
    );
}

fn call_predicate(
    rt: &RunRuntime,
    nctx: &NativeCallContext,
    predicate: &FnPtr,
    ctx: &Dynamic,
    pos: Position,
) -> SandboxResult<bool> {
    let pos = to_dyn(&pos).map_err(|e| callback_error(rt, e))?;
    predicate
        .call_within_context::<Dynamic>(nctx, (ctx.clone(), pos))
        .map_err(|e| callback_error(rt, e))
        .and_then(|v| truthy(&v))
}

fn register_safety(engine: &mut Engine) {
    engine.register_type_with_name::<SafetyApi>("Safety");
    engine.register_fn("status", |api: &mut SafetyApi| -> RhaiResult<Dynamic> {
        let rt = api.runtime().clone();
        outcome(rt.block_on(api.status()))
    });
    engine.register_fn("is_safe", |api: &mut SafetyApi| -> RhaiResult<Dynamic> {
        let rt = api.runtime().clone();
        outcome(rt.block_on(api.is_safe(None)))
    });
    engine.register_fn("is_safe", |api: &mut SafetyApi, min_health: Dynamic| -> RhaiResult<Dynamic> {
        let min = number(&min_health).ok_or_else(|| script_error("min_health must be a number"))?;
        let rt = api.runtime().clone();
        outcome(rt.block_on(api.is_safe(Some(min))))
    });
    engine.register_fn(
        "retreat",
        |api: &mut SafetyApi, threat: Dynamic, distance: Dynamic| -> RhaiResult<Dynamic> {
            let threat = position_arg(&threat)?;
            let distance = number(&distance)
                .filter(|d| d.is_finite() && *d >= 0.0)
                .ok_or_else(|| script_error("retreat distance must be a non-negative number"))?;
            let rt = api.runtime().clone();
            outcome(rt.block_on(api.retreat(threat, distance)))
        },
    );
}

fn register_actions(engine: &mut Engine) {
    engine.register_type_with_name::<DigApi>("Dig");
    engine.register_fn("mine", |api: &mut DigApi, pos: Dynamic| -> RhaiResult<Dynamic> {
        let pos = block_arg(&pos)?;
        let rt = api.runtime().clone();
        outcome(rt.block_on(api.mine(pos, None)))
    });
    engine.register_fn(
        "mine",
        |api: &mut DigApi, pos: Dynamic, expect: ImmutableString| -> RhaiResult<Dynamic> {
            let pos = block_arg(&pos)?;
            let rt = api.runtime().clone();
            outcome(rt.block_on(api.mine(pos, Some(expect.as_str()))))
        },
    );
    engine.register_fn("interact", |api: &mut DigApi, pos: Dynamic| -> RhaiResult<Dynamic> {
        let pos = block_arg(&pos)?;
        let rt = api.runtime().clone();
        outcome(rt.block_on(api.interact(pos)))
    });

    engine.register_type_with_name::<BuildApi>("Build");
    engine.register_fn(
        "place",
        |api: &mut BuildApi, pos: Dynamic, item: ImmutableString| -> RhaiResult<Dynamic> {
            let pos = block_arg(&pos)?;
            let rt = api.runtime().clone();
            outcome(rt.block_on(api.place(pos, &item)))
        },
    );

    engine.register_type_with_name::<CraftApi>("Craft");
    fn craft(api: &mut CraftApi, item: ImmutableString, count: INT) -> RhaiResult<Dynamic> {
        let count = as_u32(count, "count")?;
        let rt = api.runtime().clone();
        outcome(rt.block_on(api.craft(&item, count)))
    }
    engine.register_fn("craft", craft);
    engine.register_fn("craft", |api: &mut CraftApi, item: ImmutableString| {
        craft(api, item, 1)
    });
}

fn register_inventory(engine: &mut Engine) {
    engine.register_type_with_name::<InventoryApi>("Inventory");
    engine.register_fn("list", |api: &mut InventoryApi| -> RhaiResult<Dynamic> {
        let rt = api.runtime().clone();
        outcome(rt.block_on(api.list()))
    });
    engine.register_fn("count", |api: &mut InventoryApi, item: ImmutableString| -> RhaiResult<Dynamic> {
        let rt = api.runtime().clone();
        outcome(rt.block_on(api.count(&item)))
    });
    fn has(api: &mut InventoryApi, item: ImmutableString, at_least: INT) -> RhaiResult<Dynamic> {
        let at_least = as_u32(at_least, "count")?;
        let rt = api.runtime().clone();
        outcome(rt.block_on(api.has(&item, at_least)))
    }
    engine.register_fn("has", has);
    engine.register_fn("has", |api: &mut InventoryApi, item: ImmutableString| {
        has(api, item, 1)
    });
    fn equip(api: &mut InventoryApi, item: ImmutableString, slot: ImmutableString) -> RhaiResult<Dynamic> {
        let rt = api.runtime().clone();
        outcome(rt.block_on(api.equip(&item, &slot)))
    }
    engine.register_fn("equip", equip);
    engine.register_fn("equip", |api: &mut InventoryApi, item: ImmutableString| {
        equip(api, item, "hand".into())
    });
}

fn register_watch(engine: &mut Engine) {
    engine.register_type_with_name::<WatchApi>("Watch");
    fn subscribe(api: &mut WatchApi, kinds: Dynamic) -> RhaiResult<Dynamic> {
        let kinds = strings_arg(&kinds)?;
        outcome(api.subscribe(kinds))
    }
    engine.register_fn("subscribe", subscribe);
    engine.register_fn("subscribe", |api: &mut WatchApi| subscribe(api, Dynamic::UNIT));
    engine.register_fn("poll", |api: &mut WatchApi, id: INT| -> RhaiResult<Dynamic> {
        outcome(api.poll(non_negative(id, "subscription id")?))
    });
    engine.register_fn("wait", |api: &mut WatchApi, id: INT, timeout_ms: INT| -> RhaiResult<Dynamic> {
        let id = non_negative(id, "subscription id")?;
        let timeout_ms = non_negative(timeout_ms, "timeout")?;
        let rt = api.runtime().clone();
        outcome(rt.block_on(api.wait(id, timeout_ms)))
    });
    engine.register_fn("unsubscribe", |api: &mut WatchApi, id: INT| -> RhaiResult<Dynamic> {
        outcome(Ok(api.unsubscribe(non_negative(id, "subscription id")?)))
    });
}

/// Namespaces a capability set exposes, for help output.
pub fn namespaces_for(capabilities: &BTreeSet<super::Capability>) -> Vec<&'static str> {
    let mut out = vec!["args", "world", "log", "clock", "geo", "rng", "flow"];
    for cap in capabilities {
        out.extend_from_slice(cap.namespaces());
    }
    out
}
