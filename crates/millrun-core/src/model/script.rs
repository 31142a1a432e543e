//! Script entity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a script version came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptKind {
    /// First version saved for the workflow
    Initial,

    /// Authored or edited by the user
    Manual,

    /// Produced by the auto-fix agent after a logic failure
    AutoFix,
}

impl std::fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::Manual => write!(f, "manual"),
            Self::AutoFix => write!(f, "auto_fix"),
        }
    }
}

impl std::str::FromStr for ScriptKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(Self::Initial),
            "manual" => Ok(Self::Manual),
            "auto_fix" => Ok(Self::AutoFix),
            other => Err(format!("unknown script kind: {other}")),
        }
    }
}

/// An immutable saved version of a workflow's code
///
/// `(major, minor)` is strictly increasing per workflow. `config` is the
/// validator's output for this exact code version; activation serializes it
/// onto the workflow row so the engine never re-derives topology from code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub task_id: Uuid,
    pub code: String,
    pub major_version: i32,
    pub minor_version: i32,

    /// Validator output (`WorkflowConfig` as JSON) for this version
    pub config: serde_json::Value,

    pub summary: Option<String>,
    pub diagram: Option<String>,
    pub change_comment: Option<String>,
    pub kind: ScriptKind,
    pub created_at: DateTime<Utc>,
}

impl Script {
    pub fn version(&self) -> (i32, i32) {
        (self.major_version, self.minor_version)
    }

    /// Whether `self` is a later version than `(major, minor)`
    pub fn is_after(&self, major: i32, minor: i32) -> bool {
        self.version() > (major, minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(major: i32, minor: i32) -> Script {
        Script {
            id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            task_id: Uuid::now_v7(),
            code: String::new(),
            major_version: major,
            minor_version: minor,
            config: serde_json::json!({}),
            summary: None,
            diagram: None,
            change_comment: None,
            kind: ScriptKind::Manual,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn version_ordering() {
        assert!(script(1, 1).is_after(1, 0));
        assert!(script(2, 0).is_after(1, 9));
        assert!(!script(1, 0).is_after(1, 0));
    }
}
