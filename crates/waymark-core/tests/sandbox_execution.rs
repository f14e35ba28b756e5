//! Script runs through `SandboxExecutor` against the simulated agent.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use waymark_core::agent::{SimulatedAgent, WorldSpec};
use waymark_core::geometry::Position;
use waymark_core::sandbox::{
    Capability, ErrorKind, ExecutionResult, LogLevel, ProgramDescriptor, SandboxExecutor,
};
use waymark_core::SandboxConfig;

fn agent() -> Arc<SimulatedAgent> {
    Arc::new(SimulatedAgent::new(WorldSpec {
        spawn: Position::new(0.0, 64.0, 0.0),
        ..WorldSpec::default()
    }))
}

async fn run(program: ProgramDescriptor) -> ExecutionResult {
    SandboxExecutor::new(agent(), SandboxConfig::default())
        .unwrap()
        .run(program)
        .await
}

fn messages(result: &ExecutionResult) -> Vec<&str> {
    result.logs.iter().map(|e| e.message.as_str()).collect()
}

// -------------------------------------------------------------------------
// completion
// -------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn success_payload_becomes_the_result() {
    let result = run(ProgramDescriptor::new("success(#{x: 1, tags: [\"a\"]})")).await;

    assert!(result.success);
    assert!(result.error.is_none());
    assert_eq!(result.result, json!({"x": 1, "tags": ["a"]}));
    assert_eq!(result.program_digest.len(), 64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fail_reports_message_and_payload() {
    let result = run(ProgramDescriptor::new(
        r#"fail("no ore nearby", #{tried: 3})"#,
    ))
    .await;

    assert!(!result.success);
    let error = result.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Failed);
    assert_eq!(error.message, "no ore nearby");
    assert_eq!(result.result, json!({"tried": 3}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn script_without_completion_signal_is_an_error() {
    let result = run(ProgramDescriptor::new("let x = 1; x + 1")).await;

    assert!(!result.success);
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::ScriptError);
    assert!(error.message.contains("missing completion signal"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn uncaught_throw_is_a_script_error() {
    let result = run(ProgramDescriptor::new(
        r#"
        ctx.log.info("before");
        throw "boom";
        "#,
    ))
    .await;

    assert!(!result.success);
    assert_eq!(result.error_kind(), Some(ErrorKind::ScriptError));
    assert_eq!(messages(&result), vec!["before"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn compile_errors_are_reported_before_anything_runs() {
    let agent = agent();
    let exec = SandboxExecutor::new(agent.clone(), SandboxConfig::default()).unwrap();

    assert!(exec.check("let = ;").is_err());
    assert!(exec.check("success(1)").is_ok());

    let result = exec
        .run(ProgramDescriptor::new("let = ;").with_capability(Capability::Move))
        .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::ScriptError));
    assert!(agent.journal().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn main_entry_point_receives_the_context() {
    let program = ProgramDescriptor::new(
        r#"
        fn main(ctx) {
            ctx.log.info("in main");
            success(ctx.args.n * 2)
        }
        "#,
    )
    .with_arg("n", json!(21));

    let result = run(program).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.result, json!(42));
    assert_eq!(messages(&result), vec!["in main"]);
}

// -------------------------------------------------------------------------
// logs
// -------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn print_and_log_calls_share_one_sequence() {
    let result = run(ProgramDescriptor::new(
        r#"
        print("hello");
        ctx.log.warn("careful", #{hp: 4});
        ctx.log.write("error", "bad");
        success()
        "#,
    ))
    .await;

    assert!(result.success, "{:?}", result.error);
    let levels: Vec<LogLevel> = result.logs.iter().map(|e| e.level).collect();
    assert_eq!(levels, vec![LogLevel::Info, LogLevel::Warn, LogLevel::Error]);
    let seqs: Vec<u64> = result.logs.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert_eq!(result.logs[1].data, Some(json!({"hp": 4})));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn log_overflow_is_summarized() {
    let mut config = SandboxConfig::default();
    config.max_log_entries = 5;
    let exec = SandboxExecutor::new(agent(), config).unwrap();

    let result = exec
        .run(ProgramDescriptor::new(
            "for i in 0..20 { ctx.log.info(`line ${i}`); } success()",
        ))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.logs.len(), 6);
    assert!(result.logs[5].message.contains("15 dropped"));
}

// -------------------------------------------------------------------------
// deadlines
// -------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sleeping_past_the_deadline_times_out_and_keeps_logs() {
    let started = Instant::now();
    let result = run(ProgramDescriptor::new(
        r#"
        ctx.log.info("starting");
        loop { ctx.clock.sleep(20); }
        "#,
    )
    .with_timeout_ms(150))
    .await;

    assert!(!result.success);
    assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
    assert_eq!(messages(&result), vec!["starting"]);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn busy_loops_are_stopped_at_the_deadline() {
    let mut config = SandboxConfig::default();
    config.engine.max_operations = 1 << 40;
    let exec = SandboxExecutor::new(agent(), config).unwrap();

    let started = Instant::now();
    let result = exec
        .run(ProgramDescriptor::new("let i = 0; loop { i += 1; }").with_timeout_ms(100))
        .await;

    assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn move_in_flight_at_the_deadline_is_cut_off() {
    let agent = Arc::new(
        SimulatedAgent::new(WorldSpec {
            spawn: Position::new(0.0, 64.0, 0.0),
            ..WorldSpec::default()
        })
        .with_nav_delay(Duration::from_millis(400)),
    );
    let exec = SandboxExecutor::new(agent.clone(), SandboxConfig::default()).unwrap();

    let result = exec
        .run(
            ProgramDescriptor::new(
                r#"
                ctx.log.info("heading out");
                let r = ctx.nav.go_to(#{x: 5, y: 64, z: 0});
                ctx.log.info("after move");
                success(r)
                "#,
            )
            .with_capability(Capability::Move)
            .with_timeout_ms(100),
        )
        .await;

    assert!(!result.success);
    assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
    assert_eq!(result.result, serde_json::Value::Null);
    assert_eq!(messages(&result), vec!["heading out"]);
    assert_eq!(agent.calls_to("navigate_to").await, 1);

    // The navigation would have finished by now had it not been dropped.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(agent.position().await, Position::new(0.0, 64.0, 0.0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scoped_timeout_fails_only_the_wrapped_operation() {
    let result = run(ProgramDescriptor::new(
        r#"
        let r = ctx.flow.with_timeout(|ctx| { ctx.clock.sleep(2000); 1 }, 50);
        let quick = ctx.flow.with_timeout(|ctx| 7, 1000);
        success(#{ok: r.ok, kind: r.error.kind, quick: quick.value})
        "#,
    ))
    .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(
        result.result,
        json!({"ok": false, "kind": "timeout", "quick": 7})
    );
    assert!(result.duration_ms < 2000);
}

// -------------------------------------------------------------------------
// determinism
// -------------------------------------------------------------------------

const DRAWS: &str = r#"
    let xs = [];
    for _ in 0..3 { xs.push(ctx.rng.int(0, 1000000)); }
    xs.push(ctx.rng.pick(["a", "b", "c", "d"]));
    success(xs)
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn same_seed_same_results() {
    let a = run(ProgramDescriptor::new(DRAWS).with_seed(9)).await;
    let b = run(ProgramDescriptor::new(DRAWS).with_seed(9)).await;
    let c = run(ProgramDescriptor::new(DRAWS).with_seed(10)).await;

    assert!(a.success, "{:?}", a.error);
    assert_eq!(a.result, b.result);
    assert_eq!(a.program_digest, b.program_digest);
    assert_ne!(a.result, c.result);
    assert_ne!(a.program_digest, c.program_digest);
}

// -------------------------------------------------------------------------
// flow from scripts
// -------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn script_retry_recovers_after_transient_failures() {
    let result = run(ProgramDescriptor::new(
        r#"
        let n = 0;
        let r = ctx.flow.retry(|ctx| {
            n += 1;
            if n < 3 { throw #{kind: "operation_failed", message: "again"}; }
            n
        }, #{max_attempts: 5, base_delay_ms: 1, max_delay_ms: 4});
        success(#{ok: r.ok, value: r.value, attempts: r.attempts, delays: r.delays_ms})
        "#,
    ))
    .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(
        result.result,
        json!({"ok": true, "value": 3, "attempts": 3, "delays": [1, 2]})
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn script_retry_does_not_repeat_permanent_failures() {
    let result = run(ProgramDescriptor::new(
        r#"
        let r = ctx.flow.retry(|ctx| {
            throw #{kind: "capability_denied", message: "no"};
        }, #{max_attempts: 5, base_delay_ms: 1});
        success(#{ok: r.ok, attempts: r.attempts, kind: r.error.kind})
        "#,
    ))
    .await;

    assert_eq!(
        result.result,
        json!({"ok": false, "attempts": 1, "kind": "capability_denied"})
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn script_retry_predicate_decides_what_is_repeated() {
    let result = run(ProgramDescriptor::new(
        r#"
        let n = 0;
        let seen = [];
        let r = ctx.flow.retry(|ctx| {
            n += 1;
            throw #{kind: "operation_failed", message: `attempt ${n}`};
        }, #{
            max_attempts: 5,
            base_delay_ms: 1,
            should_retry: |ctx, err| { seen.push(err.kind); n < 2 }
        });
        success(#{ok: r.ok, attempts: r.attempts, seen: seen, message: r.error.message})
        "#,
    ))
    .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(
        result.result,
        json!({
            "ok": false,
            "attempts": 2,
            "seen": ["operation_failed", "operation_failed"],
            "message": "attempt 2"
        })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn script_retry_predicate_can_repeat_permanent_kinds() {
    let result = run(ProgramDescriptor::new(
        r#"
        let r = ctx.flow.retry(|ctx| {
            throw #{kind: "capability_denied", message: "no"};
        }, #{max_attempts: 3, base_delay_ms: 1, should_retry: |ctx, err| true});
        success(#{ok: r.ok, attempts: r.attempts, kind: r.error.kind})
        "#,
    ))
    .await;

    assert_eq!(
        result.result,
        json!({"ok": false, "attempts": 3, "kind": "capability_denied"})
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn script_retry_predicate_errors_fail_the_call() {
    let result = run(ProgramDescriptor::new(
        r#"
        let r = ctx.flow.retry(|ctx| {
            throw #{kind: "operation_failed", message: "again"};
        }, #{max_attempts: 3, base_delay_ms: 1, should_retry: |ctx, err| err.nope.len() > 0});
        success(r)
        "#,
    ))
    .await;

    assert!(!result.success);
    assert_eq!(result.error_kind(), Some(ErrorKind::ScriptError));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn script_transaction_rolls_back_committed_steps() {
    let result = run(ProgramDescriptor::new(
        r#"
        let report = ctx.flow.transaction([
            #{
                name: "reserve",
                run: |ctx| { ctx.log.info("run reserve"); 1 },
                rollback: |ctx| ctx.log.info("undo reserve")
            },
            #{
                name: "build",
                run: |ctx| { throw #{kind: "precondition", message: "no planks"}; }
            },
            #{
                name: "never",
                run: |ctx| { ctx.log.info("run never"); 3 }
            }
        ]);
        success(#{
            ok: report.ok,
            committed: report.committed,
            rolled_back: report.rolled_back,
            failed: report.failed.name,
            kind: report.failed.error.kind
        })
        "#,
    ))
    .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(
        result.result,
        json!({
            "ok": false,
            "committed": ["reserve"],
            "rolled_back": ["reserve"],
            "failed": "build",
            "kind": "precondition",
        })
    );
    assert_eq!(messages(&result), vec!["run reserve", "undo reserve"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn script_parallel_keeps_input_order() {
    let result = run(ProgramDescriptor::new(
        r#"
        let rs = ctx.flow.parallel([
            |ctx| 1,
            |ctx| { throw #{kind: "operation_failed", message: "two"}; },
            |ctx| 3
        ], 2);
        success(rs.map(|r| if r.ok { r.value } else { r.error.kind }))
        "#,
    ))
    .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.result, json!([1, "operation_failed", 3]));
}

// -------------------------------------------------------------------------
// movement and search from scripts
// -------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn script_search_returns_match_and_stats() {
    let result = run(ProgramDescriptor::new(
        r#"
        let r = ctx.search.expand_square((), |ctx, pos| pos.x == 1.0 && pos.z == 0.0, #{radius: 2});
        if r.ok {
            success(#{x: r.value.x, z: r.value.z, ring: r.ring, visited: r.visited})
        } else {
            fail("not found", r)
        }
        "#,
    )
    .with_capability(Capability::Move))
    .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(
        result.result,
        json!({"x": 1.0, "z": 0.0, "ring": 1, "visited": 5})
    );
    assert_eq!(result.operations.get(&Capability::Move), Some(&5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn script_search_exhaustion_is_path_not_found() {
    let result = run(ProgramDescriptor::new(
        r#"
        let r = ctx.search.expand_square((), |ctx, pos| false, #{radius: 1});
        success(#{ok: r.ok, kind: r.error.kind, visited: r.visited})
        "#,
    )
    .with_capability(Capability::Move))
    .await;

    assert_eq!(
        result.result,
        json!({"ok": false, "kind": "path_not_found", "visited": 9})
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn script_go_to_moves_the_agent() {
    let agent = agent();
    let exec = SandboxExecutor::new(agent.clone(), SandboxConfig::default()).unwrap();

    let result = exec
        .run(
            ProgramDescriptor::new(
                r#"
                let r = ctx.nav.go_to(#{x: 5, y: 64, z: -2});
                let here = ctx.world.state().position;
                success(#{ok: r.ok, x: here.x, z: here.z})
                "#,
            )
            .with_capability(Capability::Move),
        )
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.result, json!({"ok": true, "x": 5.0, "z": -2.0}));
    assert_eq!(agent.position().await, Position::new(5.0, 64.0, -2.0));
}
