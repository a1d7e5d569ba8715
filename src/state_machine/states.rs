use serde::{Deserialize, Serialize};
use std::fmt;

/// Batch lifecycle states. Stored as the uppercase tokens verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    /// Initial state: batch created, configuration snapshotted
    Saved,
    /// Task set is being populated; rolls back to Saved on failure
    Staging,
    /// Task set fully populated, ready to run
    Staged,
    /// Tasks are being dispatched and evaluated
    Processing,
    /// Post-dispatch sub-phase (score aggregation); same rules as Processing
    Analyzing,
    /// All tasks terminal, none failed
    Completed,
    /// All tasks terminal, at least one failed
    Failed,
}

impl BatchStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Transient states are the ones a crashed process can strand a batch
    /// in; the recovery sweeper watches these.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Staging | Self::Processing | Self::Analyzing)
    }

    /// States in which the dispatcher may claim tasks for this batch.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, Self::Staged | Self::Processing | Self::Analyzing)
    }

    pub fn transient() -> &'static [BatchStatus] {
        &[Self::Staging, Self::Processing, Self::Analyzing]
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Saved => write!(f, "SAVED"),
            Self::Staging => write!(f, "STAGING"),
            Self::Staged => write!(f, "STAGED"),
            Self::Processing => write!(f, "PROCESSING"),
            Self::Analyzing => write!(f, "ANALYZING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SAVED" => Ok(Self::Saved),
            "STAGING" => Ok(Self::Staging),
            "STAGED" => Ok(Self::Staged),
            "PROCESSING" => Ok(Self::Processing),
            "ANALYZING" => Ok(Self::Analyzing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Invalid batch status: {s}")),
        }
    }
}

impl Default for BatchStatus {
    fn default() -> Self {
        Self::Saved
    }
}

/// Per-task states within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting to be claimed by a dispatch wave
    Queued,
    /// Claimed and handed to the external evaluator
    Processing,
    /// Failed earlier but eligible for an operator-triggered retry pass
    ReadyToRetry,
    /// Evaluator reported failure
    Failed,
    /// Evaluator reported success
    Completed,
}

impl TaskStatus {
    /// Terminal statuses count toward batch completion.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Processing)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "QUEUED"),
            Self::Processing => write!(f, "PROCESSING"),
            Self::ReadyToRetry => write!(f, "READY_TO_RETRY"),
            Self::Failed => write!(f, "FAILED"),
            Self::Completed => write!(f, "COMPLETED"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "PROCESSING" => Ok(Self::Processing),
            "READY_TO_RETRY" => Ok(Self::ReadyToRetry),
            "FAILED" => Ok(Self::Failed),
            "COMPLETED" => Ok(Self::Completed),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Queued
    }
}
