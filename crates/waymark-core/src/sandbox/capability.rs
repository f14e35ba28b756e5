//! Capabilities — the permission axis for script runs.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::SandboxError;

/// A permission a run declares up front.
///
/// Each capability unlocks one or more namespaces on the script context.
/// Undeclared capabilities leave their namespaces absent entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Move,
    Dig,
    Place,
    Craft,
    Inventory,
    Events,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Capability::Move,
        Capability::Dig,
        Capability::Place,
        Capability::Craft,
        Capability::Inventory,
        Capability::Events,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Move => "move",
            Capability::Dig => "dig",
            Capability::Place => "place",
            Capability::Craft => "craft",
            Capability::Inventory => "inventory",
            Capability::Events => "events",
        }
    }

    /// Context namespaces this capability attaches.
    pub fn namespaces(&self) -> &'static [&'static str] {
        match self {
            Capability::Move => &["nav", "search", "safety"],
            Capability::Dig => &["dig"],
            Capability::Place => &["build"],
            Capability::Craft => &["craft"],
            Capability::Inventory => &["inventory"],
            Capability::Events => &["watch"],
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Capability::Move => 0,
            Capability::Dig => 1,
            Capability::Place => 2,
            Capability::Craft => 3,
            Capability::Inventory => 4,
            Capability::Events => 5,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "move" => Ok(Capability::Move),
            "dig" => Ok(Capability::Dig),
            "place" => Ok(Capability::Place),
            "craft" => Ok(Capability::Craft),
            "inventory" => Ok(Capability::Inventory),
            "events" => Ok(Capability::Events),
            other => Err(SandboxError::InvalidConfig(format!(
                "unknown capability: {other}"
            ))),
        }
    }
}
