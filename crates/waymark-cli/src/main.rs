//! Waymark CLI
//!
//! The `waymark` command runs sandboxed scripts against a simulated avatar.
//!
//! ## Commands
//!
//! - `run`: execute a script and print its `ExecutionResult` as JSON
//! - `check`: compile a script without running it
//! - `caps`: list capabilities and the namespaces they unlock

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, info, Level};

use waymark_core::sandbox::bindings;
use waymark_core::{
    Capability, ExecutionResult, ProgramDescriptor, SandboxConfig, SandboxExecutor,
    SimulatedAgent, WorldSpec,
};

#[derive(Parser)]
#[command(name = "waymark")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run capability-scoped automation scripts", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Sandbox configuration file (TOML)
    #[arg(long, global = true, env = "WAYMARK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a script and print the execution result
    Run {
        /// Path to the script
        script: PathBuf,

        /// Capabilities to grant, comma separated (move,dig,place,craft,inventory,events)
        #[arg(long, value_delimiter = ',')]
        caps: Vec<String>,

        /// Script arguments as a JSON object, or @file to read them from a file
        #[arg(long)]
        args: Option<String>,

        /// Seed for the run's random generator
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Wall-clock limit in milliseconds (0 = configured default)
        #[arg(long, default_value = "0")]
        timeout_ms: u64,

        /// Lower a capability quota for this run, e.g. `--budget dig=16`
        #[arg(long = "budget", value_name = "CAP=N")]
        budgets: Vec<String>,

        /// World description for the simulated avatar (JSON)
        #[arg(long)]
        world: Option<PathBuf>,
    },

    /// Compile a script without running it
    Check {
        /// Path to the script
        script: PathBuf,
    },

    /// List capabilities and the context namespaces they unlock
    Caps,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    waymark_core::telemetry::init_tracing(cli.json, level);

    let ok = match cli.command {
        Commands::Run {
            script,
            caps,
            args,
            seed,
            timeout_ms,
            budgets,
            world,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let program = build_program(&script, &caps, args.as_deref(), seed, timeout_ms, &budgets)?;
            let result = cmd_run(config, program, world.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            result.success
        }
        Commands::Check { script } => {
            let config = load_config(cli.config.as_deref())?;
            cmd_check(&config, &script)?
        }
        Commands::Caps => {
            cmd_caps(cli.json)?;
            true
        }
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn load_config(path: Option<&Path>) -> Result<SandboxConfig> {
    let config = match path {
        Some(path) => SandboxConfig::load(path)
            .with_context(|| format!("Failed to load config: {:?}", path))?,
        None => SandboxConfig::from_env().context("Invalid WAYMARK_* environment")?,
    };
    debug!(?config, "sandbox config loaded");
    Ok(config)
}

fn build_program(
    script: &Path,
    caps: &[String],
    args: Option<&str>,
    seed: u64,
    timeout_ms: u64,
    budgets: &[String],
) -> Result<ProgramDescriptor> {
    let source = std::fs::read_to_string(script)
        .with_context(|| format!("Failed to read script: {:?}", script))?;
    let mut program = ProgramDescriptor::new(source)
        .with_capabilities(parse_caps(caps)?)
        .with_args(parse_args(args)?)
        .with_seed(seed)
        .with_timeout_ms(timeout_ms);
    for raw in budgets {
        let (cap, max) = parse_budget(raw)?;
        program = program.with_budget(cap, max);
    }
    Ok(program)
}

async fn cmd_run(
    config: SandboxConfig,
    program: ProgramDescriptor,
    world: Option<&Path>,
) -> Result<ExecutionResult> {
    let world = match world {
        Some(path) => WorldSpec::load(path)?,
        None => WorldSpec::default(),
    };
    let agent = Arc::new(SimulatedAgent::new(world));
    let executor = SandboxExecutor::new(agent, config)?;

    info!(
        digest = %program.digest(),
        caps = ?program.capabilities,
        "running script"
    );
    let result = executor.run(program).await;
    info!(
        success = result.success,
        duration_ms = result.duration_ms,
        "run finished"
    );
    Ok(result)
}

fn cmd_check(config: &SandboxConfig, script: &Path) -> Result<bool> {
    let source = std::fs::read_to_string(script)
        .with_context(|| format!("Failed to read script: {:?}", script))?;
    match bindings::compile_check(&source, &config.engine) {
        Ok(()) => {
            println!("✓ {}", script.display());
            Ok(true)
        }
        Err(err) => {
            println!("✗ {}: {}", script.display(), err);
            Ok(false)
        }
    }
}

fn cmd_caps(json: bool) -> Result<()> {
    let always = bindings::namespaces_for(&BTreeSet::new());
    if json {
        let mut caps = Map::new();
        for cap in Capability::ALL {
            caps.insert(cap.to_string(), cap.namespaces().into());
        }
        let out = serde_json::json!({ "always": always, "capabilities": caps });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Always available: {}", always.join(", "));
    println!();
    for cap in Capability::ALL {
        println!("  {:<10} {}", cap, cap.namespaces().join(", "));
    }
    Ok(())
}

fn parse_caps(raw: &[String]) -> Result<BTreeSet<Capability>> {
    raw.iter()
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.parse::<Capability>().map_err(anyhow::Error::from))
        .collect()
}

/// `cap=n` as given to `--budget`.
fn parse_budget(raw: &str) -> Result<(Capability, u32)> {
    let Some((cap, max)) = raw.split_once('=') else {
        bail!("Budget must look like cap=n, got {:?}", raw);
    };
    let cap: Capability = cap.parse()?;
    let max: u32 = max
        .trim()
        .parse()
        .with_context(|| format!("Invalid budget count in {:?}", raw))?;
    Ok((cap, max))
}

fn parse_args(raw: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read args file: {:?}", path))?,
        None => raw.to_string(),
    };
    match serde_json::from_str(&text).context("Script args must be valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("Script args must be a JSON object, got {}", other),
    }
}
