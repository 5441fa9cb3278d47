//! # Stage Flow
//!
//! The ordered stages of a private-lift style computation and the lifecycle
//! status an instance reports while moving through them.
//!
//! Clients never interpret stages beyond passing them to the remote side; the
//! runner uses [`Stage::next`] and [`Stage::is_joint`] to decide what to run
//! and whether the partner needs the publisher's server addresses.
//!
//! ## Status Strings
//!
//! The remote API reports status as an upper-case string:
//! ```text
//! CREATED | <STAGE>_STARTED | <STAGE>_COMPLETED | <STAGE>_FAILED | COMPLETED | FAILED
//! ```
//!
//! `<STAGE>_FAILED` is a failed attempt and the stage may be run again.
//! `FAILED` means the instance itself gave up; like `COMPLETED` it is final.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::CoordinatorError;

/// One discrete step of the multi-party computation.
///
/// Ordering follows execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    PidShard,
    PidPrepare,
    IdMatch,
    ComputeMetrics,
    Aggregate,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 5] = [
        Stage::PidShard,
        Stage::PidPrepare,
        Stage::IdMatch,
        Stage::ComputeMetrics,
        Stage::Aggregate,
    ];

    pub fn first() -> Stage {
        Stage::ALL[0]
    }

    /// The stage after this one, or `None` for the last stage.
    pub fn next(self) -> Option<Stage> {
        let idx = Stage::ALL.iter().position(|s| *s == self)?;
        Stage::ALL.get(idx + 1).copied()
    }

    /// Joint stages open connections between the two parties, so the
    /// joining party must be given the other side's server ips.
    pub fn is_joint(self) -> bool {
        matches!(self, Stage::IdMatch | Stage::ComputeMetrics)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::PidShard => "PID_SHARD",
            Stage::PidPrepare => "PID_PREPARE",
            Stage::IdMatch => "ID_MATCH",
            Stage::ComputeMetrics => "COMPUTE_METRICS",
            Stage::Aggregate => "AGGREGATE",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| CoordinatorError::UnknownStage(s.to_string()))
    }
}

/// Lifecycle status of a remote instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Created,
    Started(Stage),
    StageCompleted(Stage),
    StageFailed(Stage),
    /// Every stage has completed.
    Completed,
    /// The instance gave up; no stage can run on it any more.
    Failed,
}

impl InstanceStatus {
    /// Terminal instances accept no further `run_stage` calls.
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceStatus::Completed | InstanceStatus::Failed)
    }

    /// The stage the status refers to, if any.
    pub fn stage(self) -> Option<Stage> {
        match self {
            InstanceStatus::Started(s)
            | InstanceStatus::StageCompleted(s)
            | InstanceStatus::StageFailed(s) => Some(s),
            InstanceStatus::Created | InstanceStatus::Completed | InstanceStatus::Failed => None,
        }
    }

    /// The stage a `run_stage` call without an explicit selector should run.
    ///
    /// A failed stage is retried, a started stage is returned as-is (running
    /// it again is absorbed by the service), and `None` means nothing is left.
    pub fn pending_stage(self) -> Option<Stage> {
        match self {
            InstanceStatus::Created => Some(Stage::first()),
            InstanceStatus::Started(s) | InstanceStatus::StageFailed(s) => Some(s),
            InstanceStatus::StageCompleted(s) => s.next(),
            InstanceStatus::Completed | InstanceStatus::Failed => None,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Created => write!(f, "CREATED"),
            InstanceStatus::Started(s) => write!(f, "{}_STARTED", s),
            InstanceStatus::StageCompleted(s) => write!(f, "{}_COMPLETED", s),
            InstanceStatus::StageFailed(s) => write!(f, "{}_FAILED", s),
            InstanceStatus::Completed => write!(f, "COMPLETED"),
            InstanceStatus::Failed => write!(f, "FAILED"),
        }
    }
}

impl FromStr for InstanceStatus {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || CoordinatorError::UnknownStatus(s.to_string());

        match s {
            "CREATED" => return Ok(InstanceStatus::Created),
            "COMPLETED" => return Ok(InstanceStatus::Completed),
            "FAILED" => return Ok(InstanceStatus::Failed),
            _ => {}
        }

        let (stage, suffix) = s.rsplit_once('_').ok_or_else(unknown)?;
        let stage: Stage = stage.parse().map_err(|_| unknown())?;
        match suffix {
            "STARTED" => Ok(InstanceStatus::Started(stage)),
            "COMPLETED" => Ok(InstanceStatus::StageCompleted(stage)),
            "FAILED" => Ok(InstanceStatus::StageFailed(stage)),
            _ => Err(unknown()),
        }
    }
}
