//! The plan value type: a set of file-scoped tasks plus a base reference.
//!
//! This module only defines the in-memory shape and how to read it off the
//! wire. Whether a given [`Plan`] is actually *legal* (acyclic, conflict-free,
//! every `requires` resolvable) is the DAG validator's job, not the parser's —
//! keeping this a plain value type means the same `Plan` can be constructed
//! directly by tests without going through a wire format at all.

pub mod parse;

use serde::{Deserialize, Serialize};

/// One file-scoped unit of work delegated to the external agent.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema, PartialEq)]
pub struct Task {
    /// Stable, human-readable id: lowercase, hyphen-separated.
    pub id: String,
    pub title: String,
    pub description: String,

    /// Paths this task is expected to modify.
    #[serde(default)]
    pub writes: Vec<String>,

    /// Paths this task reads without writing.
    #[serde(default)]
    pub reads: Vec<String>,

    /// Ids of tasks that must complete before this one starts.
    #[serde(default)]
    pub requires: Vec<String>,

    /// Estimated size, used only for metrics and ordering tiebreaks.
    #[serde(rename = "estimatedLines")]
    pub estimated_lines: u32,

    /// Free text sent verbatim to the external agent.
    #[serde(rename = "agentPrompt")]
    pub agent_prompt: String,
}

/// A set of tasks plus the reference they're all rooted on.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema, PartialEq, Default)]
pub struct Plan {
    pub tasks: Vec<Task>,

    /// Name resolvable in the host repository the stack is rooted on
    /// (e.g. the trunk branch). Defaults to `"main"` when omitted, matching
    /// the common case of a plan authored without an explicit base.
    #[serde(default = "default_base")]
    pub base: String,
}

fn default_base() -> String {
    "main".to_string()
}

impl Plan {
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
