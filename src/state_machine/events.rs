use serde::{Deserialize, Serialize};

/// Events that drive batch lifecycle transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum BatchEvent {
    /// Caller requested staging (SAVED -> STAGING)
    Stage,
    /// Task set fully populated (STAGING -> STAGED)
    StageSucceeded,
    /// Staging failed; partial work rolled back (STAGING -> SAVED)
    StageFailed(String),
    /// Caller requested the run (STAGED -> PROCESSING)
    Run,
    /// Dispatch finished, score aggregation running (PROCESSING -> ANALYZING)
    Analyze,
    /// All tasks terminal, none failed
    Complete,
    /// All tasks terminal, at least one failed (or operator cancellation)
    Fail(String),
    /// Sweeper reset of a stuck transient batch (STAGING -> SAVED)
    Reset,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = BatchEvent::StageFailed("folder walk failed".to_string());
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"event":"stage_failed","data":"folder walk failed"}"#
        );

        let parsed: BatchEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
