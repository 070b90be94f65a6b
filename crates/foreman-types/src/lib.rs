#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **foreman-types** – Shared primitive data structures for the Foreman
//! control plane.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that every other crate can depend on it without causing cycles.
//! It intentionally makes no assumptions about I/O, scheduling, or storage —
//! those live in `foreman-store`, `foreman-queue`, and friends.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::HashMap;

/// Maximum allowed size for a ticket/task description, to keep payloads bounded.
pub const MAX_DESCRIPTION_LEN: usize = 16_384;

/// Maximum allowed size for an agent name.
pub const MAX_AGENT_NAME_LEN: usize = 256;

pub mod ids;
pub mod ticket;
pub mod task;
pub mod agent;
pub mod cost;

pub use ids::EntityId;
pub use ticket::{ApprovalStatus, Ticket, TicketPriority, TicketStatus};
pub use task::{DependencySpec, Task, TaskDependencies, TaskStatus};
pub use agent::{Agent, AgentHealth, AgentStatus};
pub use cost::{Budget, BudgetScope, CostRecord};

/// Opaque, open-ended JSON map used for free-form context/result/metadata
/// fields. Known keys that affect behaviour are documented at their call
/// sites (`spec_id`, `_join_id`, `_source_task_ids`, …); everything else is
/// carried through unexamined.
pub type ContextMap = HashMap<String, Json>;

/// Normalize a capability string: trim whitespace, lowercase, drop if empty.
///
/// Mirrors the data-model invariant: "capability strings are stored
/// normalized (trim + lowercase, empties dropped)".
pub fn normalize_capability(raw: &str) -> Option<String> {
    let trimmed = raw.trim().to_lowercase();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Normalize a whole set of capability strings, deduplicating as we go.
pub fn normalize_capabilities<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = Vec::new();
    for item in raw {
        if let Some(norm) = normalize_capability(item.as_ref()) {
            if !out.contains(&norm) {
                out.push(norm);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_and_dedupes_capabilities() {
        let caps = normalize_capabilities(["  Rust ", "RUST", "", "go-lang"]);
        assert_eq!(caps, vec!["rust".to_string(), "go-lang".to_string()]);
    }

    #[test]
    fn normalize_single_capability_drops_empty() {
        assert_eq!(normalize_capability("   "), None);
        assert_eq!(normalize_capability(" Backend "), Some("backend".to_string()));
    }
}
