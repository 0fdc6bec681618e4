//! Context levels, stored contexts and delegations.

use crate::types::string_enum;
use serde::{Deserialize, Serialize};
use serde_json::Value;

string_enum! {
    /// A level of the Global → Project → Branch → Task hierarchy.
    ContextLevel {
        Global => "global",
        Project => "project",
        Branch => "branch",
        Task => "task",
    }
}

impl ContextLevel {
    /// Next level up, `None` for global.
    pub fn parent(&self) -> Option<ContextLevel> {
        match self {
            ContextLevel::Global => None,
            ContextLevel::Project => Some(ContextLevel::Global),
            ContextLevel::Branch => Some(ContextLevel::Project),
            ContextLevel::Task => Some(ContextLevel::Branch),
        }
    }

    /// Next level down, `None` for task.
    pub fn child(&self) -> Option<ContextLevel> {
        match self {
            ContextLevel::Global => Some(ContextLevel::Project),
            ContextLevel::Project => Some(ContextLevel::Branch),
            ContextLevel::Branch => Some(ContextLevel::Task),
            ContextLevel::Task => None,
        }
    }

    /// Distance from the root: global is 0, task is 3.
    pub fn depth(&self) -> usize {
        match self {
            ContextLevel::Global => 0,
            ContextLevel::Project => 1,
            ContextLevel::Branch => 2,
            ContextLevel::Task => 3,
        }
    }

    /// Whether `self` sits strictly above `other`.
    pub fn is_above(&self, other: ContextLevel) -> bool {
        self.depth() < other.depth()
    }

    pub(crate) fn table(&self) -> &'static str {
        match self {
            ContextLevel::Global => "global_contexts",
            ContextLevel::Project => "project_contexts",
            ContextLevel::Branch => "branch_contexts",
            ContextLevel::Task => "task_contexts",
        }
    }
}

/// A stored context at any level.
///
/// The id of a project/branch/task context equals the id of its entity. The
/// global context of a user has the user's id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextRecord {
    pub level: ContextLevel,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub user_id: String,
    pub data: Value,
    pub local_overrides: Value,
    pub insights: Vec<Value>,
    pub progress: Vec<Value>,
    pub delegation_rules: Value,
    pub inheritance_disabled: bool,
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ContextRecord {
    /// An empty context with version 1.
    pub fn new(level: ContextLevel, id: &str, parent_id: Option<String>, user_id: &str, now: i64) -> Self {
        Self {
            level,
            id: id.to_string(),
            parent_id,
            user_id: user_id.to_string(),
            data: Value::Object(Default::default()),
            local_overrides: Value::Object(Default::default()),
            insights: Vec::new(),
            progress: Vec::new(),
            delegation_rules: Value::Object(Default::default()),
            inheritance_disabled: false,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

string_enum! {
    DelegationStatus {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
    }
}

/// A request to push data from a lower context up to a higher one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delegation {
    pub id: String,
    pub user_id: String,
    pub source_level: ContextLevel,
    pub source_id: String,
    pub target_level: ContextLevel,
    pub target_id: String,
    pub delegated_data: Value,
    pub reason: String,
    pub status: DelegationStatus,
    pub processed_at: Option<i64>,
    pub created_at: i64,
}

/// The effective context of a level after inheritance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedContext {
    pub level: ContextLevel,
    pub id: String,
    pub resolved: Value,
    /// `level:id` of every context merged, root first.
    pub chain: Vec<String>,
    /// Where the result came from: `memory`, `database` or `computed`.
    pub source: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn navigation_is_consistent() {
        for level in ContextLevel::ALL {
            if let Some(parent) = level.parent() {
                assert_eq!(parent.child(), Some(*level));
                assert!(parent.is_above(*level));
            }
        }
        assert_eq!(ContextLevel::Global.parent(), None);
        assert_eq!(ContextLevel::Task.child(), None);
    }

    #[test]
    fn levels_parse() {
        assert_eq!("Branch".parse::<ContextLevel>().unwrap(), ContextLevel::Branch);
        assert!("workspace".parse::<ContextLevel>().is_err());
    }
}
