//! Sandbox configuration.
//!
//! Loaded from TOML, then overridden from the environment, then validated:
//!
//! ```toml
//! default_timeout_ms = 30000
//! max_log_entries = 1000
//!
//! [budgets]
//! default_max = 500
//! overrides = { dig = 64 }
//!
//! [search]
//! astar_max_iterations = 10000
//! ```
//!
//! Environment overrides:
//! - `WAYMARK_DEFAULT_TIMEOUT_MS`, `WAYMARK_MAX_TIMEOUT_MS`
//! - `WAYMARK_MAX_LOG_ENTRIES`
//! - `WAYMARK_BUDGET_DEFAULT`
//! - `WAYMARK_MAX_OPERATIONS`
//! - `WAYMARK_ASTAR_MAX_ITERATIONS`, `WAYMARK_BUG2_MAX_ITERATIONS`

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sandbox::budget::BudgetLimits;
use crate::sandbox::error::{SandboxError, SandboxResult};

/// Limits applied to the script engine of every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineLimits {
    pub max_operations: u64,
    pub max_call_levels: usize,
    pub max_expr_depth: usize,
    pub max_function_expr_depth: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_operations: 5_000_000,
            max_call_levels: 64,
            max_expr_depth: 64,
            max_function_expr_depth: 32,
            max_string_size: 64 * 1024,
            max_array_size: 10_000,
            max_map_size: 10_000,
        }
    }
}

/// Defaults for search and navigation calls that omit an option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchDefaults {
    pub astar_max_iterations: usize,
    pub bug2_max_iterations: usize,
    pub goal_tolerance: f64,
    pub line_tolerance: f64,
    pub radius: u32,
    pub random_walk_steps: u32,
    pub nav_tolerance: f64,
    /// Radius of the block scan used to build obstacle maps.
    pub obstacle_scan_radius: u32,
    pub obstacle_scan_max: usize,
}

impl Default for SearchDefaults {
    fn default() -> Self {
        Self {
            astar_max_iterations: 10_000,
            bug2_max_iterations: 2_000,
            goal_tolerance: 0.5,
            line_tolerance: 0.5,
            radius: 8,
            random_walk_steps: 64,
            nav_tolerance: 1.0,
            obstacle_scan_radius: 32,
            obstacle_scan_max: 4_096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Applied when a program asks for a timeout of 0.
    pub default_timeout_ms: u64,
    /// Program timeouts above this are clamped.
    pub max_timeout_ms: u64,
    pub max_log_entries: usize,
    pub budgets: BudgetLimits,
    pub engine: EngineLimits,
    pub search: SearchDefaults,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_timeout_ms: 300_000,
            max_log_entries: 1_000,
            budgets: BudgetLimits::default(),
            engine: EngineLimits::default(),
            search: SearchDefaults::default(),
        }
    }
}

impl SandboxConfig {
    pub fn from_toml_str(raw: &str) -> SandboxResult<Self> {
        toml::from_str(raw).map_err(|e| SandboxError::InvalidConfig(e.to_string()))
    }

    /// Read `path`, apply environment overrides and validate.
    pub fn load(path: &Path) -> SandboxResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::InvalidConfig(format!("reading {}: {e}", path.display()))
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, validated.
    pub fn from_env() -> SandboxResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> SandboxResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `WAYMARK_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> SandboxResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: FromStr>(key: &str, raw: String) -> SandboxResult<T> {
            raw.trim()
                .parse()
                .map_err(|_| SandboxError::InvalidConfig(format!("{key}: cannot parse '{raw}'")))
        }

        if let Some(v) = lookup("WAYMARK_DEFAULT_TIMEOUT_MS") {
            self.default_timeout_ms = parse("WAYMARK_DEFAULT_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("WAYMARK_MAX_TIMEOUT_MS") {
            self.max_timeout_ms = parse("WAYMARK_MAX_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("WAYMARK_MAX_LOG_ENTRIES") {
            self.max_log_entries = parse("WAYMARK_MAX_LOG_ENTRIES", v)?;
        }
        if let Some(v) = lookup("WAYMARK_BUDGET_DEFAULT") {
            self.budgets.default_max = parse("WAYMARK_BUDGET_DEFAULT", v)?;
        }
        if let Some(v) = lookup("WAYMARK_MAX_OPERATIONS") {
            self.engine.max_operations = parse("WAYMARK_MAX_OPERATIONS", v)?;
        }
        if let Some(v) = lookup("WAYMARK_ASTAR_MAX_ITERATIONS") {
            self.search.astar_max_iterations = parse("WAYMARK_ASTAR_MAX_ITERATIONS", v)?;
        }
        if let Some(v) = lookup("WAYMARK_BUG2_MAX_ITERATIONS") {
            self.search.bug2_max_iterations = parse("WAYMARK_BUG2_MAX_ITERATIONS", v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> SandboxResult<()> {
        let invalid = |msg: &str| Err(SandboxError::InvalidConfig(msg.to_string()));
        if self.default_timeout_ms == 0 {
            return invalid("default_timeout_ms must be positive");
        }
        if self.max_timeout_ms < self.default_timeout_ms {
            return invalid("max_timeout_ms must be >= default_timeout_ms");
        }
        if self.max_log_entries == 0 {
            return invalid("max_log_entries must be positive");
        }
        if self.engine.max_operations == 0 {
            return invalid("engine.max_operations must be positive");
        }
        if self.engine.max_array_size == 0 {
            return invalid("engine.max_array_size must be positive");
        }
        if self.search.goal_tolerance < 0.0 || !self.search.goal_tolerance.is_finite() {
            return invalid("search.goal_tolerance must be a finite, non-negative number");
        }
        if self.search.line_tolerance < 0.0 || !self.search.line_tolerance.is_finite() {
            return invalid("search.line_tolerance must be a finite, non-negative number");
        }
        if self.search.astar_max_iterations == 0 || self.search.bug2_max_iterations == 0 {
            return invalid("search iteration caps must be positive");
        }
        Ok(())
    }

    /// Wall-clock limit for a program asking for `requested_ms`.
    pub fn effective_timeout(&self, requested_ms: u64) -> Duration {
        let ms = if requested_ms == 0 {
            self.default_timeout_ms
        } else {
            requested_ms.min(self.max_timeout_ms)
        };
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::Capability;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let cfg = SandboxConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.default_timeout_ms, 30_000);
        assert_eq!(cfg.search.astar_max_iterations, 10_000);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg = SandboxConfig::from_toml_str(
            r#"
            max_log_entries = 50

            [budgets]
            default_max = 10
            overrides = { dig = 2 }

            [search]
            radius = 3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.max_log_entries, 50);
        assert_eq!(cfg.budgets.limit(Capability::Dig), 2);
        assert_eq!(cfg.budgets.limit(Capability::Move), 10);
        assert_eq!(cfg.search.radius, 3);
        assert_eq!(cfg.search.bug2_max_iterations, 2_000);
        assert_eq!(cfg.default_timeout_ms, 30_000);
    }

    #[test]
    fn test_env_overrides_and_bad_values() {
        let env: HashMap<&str, &str> = [
            ("WAYMARK_DEFAULT_TIMEOUT_MS", "1500"),
            ("WAYMARK_BUDGET_DEFAULT", "7"),
        ]
        .into_iter()
        .collect();
        let mut cfg = SandboxConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.default_timeout_ms, 1_500);
        assert_eq!(cfg.budgets.default_max, 7);

        let err = cfg
            .apply_overrides(|k| (k == "WAYMARK_MAX_LOG_ENTRIES").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidConfig(_)));
    }

    #[test]
    fn test_validate_rejects_inverted_timeouts() {
        let cfg = SandboxConfig {
            default_timeout_ms: 10_000,
            max_timeout_ms: 5_000,
            ..SandboxConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unbounded_arrays() {
        let mut cfg = SandboxConfig::default();
        cfg.engine.max_array_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_effective_timeout() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.effective_timeout(0), Duration::from_millis(30_000));
        assert_eq!(cfg.effective_timeout(250), Duration::from_millis(250));
        assert_eq!(cfg.effective_timeout(10_000_000), Duration::from_millis(300_000));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "default_timeout_ms = 2000").unwrap();
        let cfg = SandboxConfig::load(file.path()).unwrap();
        assert!(cfg.default_timeout_ms == 2_000 || std::env::var("WAYMARK_DEFAULT_TIMEOUT_MS").is_ok());

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "default_timeout_ms = \"soon\"").unwrap();
        assert!(SandboxConfig::load(bad.path()).is_err());
    }
}
