//! Status vocabularies for workflows, steps, and stages.
//!
//! ```text
//!   BLANK ──start──▶ ACTIVE ──(all steps finished)──▶ COMPLETED
//!                     │  ▲
//!               pause │  │ resume          any non-finished ──▶ CANCELLED | FAILED
//!                     ▼  │
//!                    PAUSED        ACTIVE ◀──▶ ERROR (a step in error)
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowStatus {
    #[serde(rename = "BLANK")]
    Blank,
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "PAUSED")]
    Paused,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal statuses.
    pub const FINISHED: &'static [WorkflowStatus] = &[
        WorkflowStatus::Completed,
        WorkflowStatus::Failed,
        WorkflowStatus::Cancelled,
    ];
    /// Statuses in which participants may be added or removed.
    pub const EDITABLE: &'static [WorkflowStatus] = &[WorkflowStatus::Blank, WorkflowStatus::Active];
    /// Statuses in which steps, memory and event triggers may be applied.
    pub const RUNNING: &'static [WorkflowStatus] = &[WorkflowStatus::Active, WorkflowStatus::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blank => "BLANK",
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::Error => "ERROR",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_finished(&self) -> bool {
        Self::FINISHED.contains(self)
    }

    pub fn is_running(&self) -> bool {
        Self::RUNNING.contains(self)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BLANK" => Ok(Self::Blank),
            "ACTIVE" => Ok(Self::Active),
            "PAUSED" => Ok(Self::Paused),
            "ERROR" => Ok(Self::Error),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(WorkflowError::InvalidData(format!(
                "Unknown workflow status [{}]",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Active,
    Error,
    Completed,
    Skipped,
    Aborted,
}

impl StepStatus {
    pub const FINISHED: &'static [StepStatus] =
        &[StepStatus::Completed, StepStatus::Skipped, StepStatus::Aborted];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Error => "ERROR",
            Self::Completed => "COMPLETED",
            Self::Skipped => "SKIPPED",
            Self::Aborted => "ABORTED",
        }
    }

    pub fn is_finished(&self) -> bool {
        Self::FINISHED.contains(self)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "ERROR" => Ok(Self::Error),
            "COMPLETED" => Ok(Self::Completed),
            "SKIPPED" => Ok(Self::Skipped),
            "ABORTED" => Ok(Self::Aborted),
            other => Err(WorkflowError::InvalidData(format!("Unknown step status [{}]", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Active,
    Error,
    Completed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Error => "ERROR",
            Self::Completed => "COMPLETED",
        }
    }
}
