//! # Batch State Machine
//!
//! Owns the batch-level status and the legality of transitions between
//! lifecycle stages. The transition table is a pure function; persistence
//! happens through a conditional update so concurrent writers converge on
//! last-writer-wins without ever applying an illegal transition.

use super::events::BatchEvent;
use super::states::BatchStatus;
use crate::models::Batch;
use sqlx::PgPool;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid transition from {from} on {event:?}")]
    InvalidTransition { from: BatchStatus, event: BatchEvent },

    #[error("batch not found: {0}")]
    BatchNotFound(i64),

    #[error("invalid status in database: {0}")]
    CorruptStatus(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Another writer moved the batch first; callers treat this as benign
    #[error("transition from {from} to {to} lost the race for batch {batch_id}")]
    LostRace {
        batch_id: i64,
        from: BatchStatus,
        to: BatchStatus,
    },
}

/// Persisted state machine over one batch row.
pub struct BatchStateMachine {
    pool: PgPool,
}

impl BatchStateMachine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The legal transition table. Pure so it can be exhaustively tested.
    pub fn determine_target_state(
        current: BatchStatus,
        event: &BatchEvent,
    ) -> Result<BatchStatus, StateMachineError> {
        use BatchStatus::*;

        let target = match (current, event) {
            (Saved, BatchEvent::Stage) => Staging,
            (Staging, BatchEvent::StageSucceeded) => Staged,
            (Staging, BatchEvent::StageFailed(_)) => Saved,
            (Staging, BatchEvent::Reset) => Saved,
            (Staged, BatchEvent::Run) => Processing,
            (Processing, BatchEvent::Analyze) => Analyzing,
            (Processing | Analyzing, BatchEvent::Complete) => Completed,
            (Processing | Analyzing, BatchEvent::Fail(_)) => Failed,
            // Coarse cancellation can fail a batch that never started
            (Staged, BatchEvent::Fail(_)) => Failed,
            (from, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from,
                    event: event.clone(),
                })
            }
        };

        Ok(target)
    }

    /// Load the current status of a batch.
    pub async fn current_state(&self, batch_id: i64) -> Result<BatchStatus, StateMachineError> {
        let batch = Batch::find_by_id(&self.pool, batch_id)
            .await?
            .ok_or(StateMachineError::BatchNotFound(batch_id))?;

        batch
            .status
            .parse()
            .map_err(StateMachineError::CorruptStatus)
    }

    /// Apply an event: read the current state, determine the target, and
    /// persist it with a conditional update guarded on the observed state.
    pub async fn transition(
        &self,
        batch_id: i64,
        event: BatchEvent,
    ) -> Result<BatchStatus, StateMachineError> {
        let current = self.current_state(batch_id).await?;
        let target = Self::determine_target_state(current, &event)?;

        let won = Batch::transition_status(&self.pool, batch_id, &[current], target).await?;
        if !won {
            warn!(
                batch_id,
                from = %current,
                to = %target,
                "Batch transition lost the race to a concurrent writer"
            );
            return Err(StateMachineError::LostRace {
                batch_id,
                from: current,
                to: target,
            });
        }

        debug!(batch_id, from = %current, to = %target, event = ?event, "Batch transitioned");
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BatchStatus::*;

    fn target(current: BatchStatus, event: &BatchEvent) -> Result<BatchStatus, StateMachineError> {
        BatchStateMachine::determine_target_state(current, event)
    }

    #[test]
    fn test_happy_path_transitions() {
        assert_eq!(target(Saved, &BatchEvent::Stage).unwrap(), Staging);
        assert_eq!(target(Staging, &BatchEvent::StageSucceeded).unwrap(), Staged);
        assert_eq!(target(Staged, &BatchEvent::Run).unwrap(), Processing);
        assert_eq!(target(Processing, &BatchEvent::Analyze).unwrap(), Analyzing);
        assert_eq!(target(Processing, &BatchEvent::Complete).unwrap(), Completed);
        assert_eq!(target(Analyzing, &BatchEvent::Complete).unwrap(), Completed);
    }

    #[test]
    fn test_failure_and_rollback_transitions() {
        assert_eq!(
            target(Staging, &BatchEvent::StageFailed("boom".into())).unwrap(),
            Saved
        );
        assert_eq!(target(Staging, &BatchEvent::Reset).unwrap(), Saved);
        assert_eq!(
            target(Processing, &BatchEvent::Fail("1 task failed".into())).unwrap(),
            Failed
        );
        assert_eq!(
            target(Analyzing, &BatchEvent::Fail("1 task failed".into())).unwrap(),
            Failed
        );
        // Cancellation before the run started
        assert_eq!(
            target(Staged, &BatchEvent::Fail("cancelled".into())).unwrap(),
            Failed
        );
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        // Cannot stage twice
        assert!(target(Staged, &BatchEvent::Stage).is_err());
        // Cannot run an unstaged batch
        assert!(target(Saved, &BatchEvent::Run).is_err());
        // Terminal states admit nothing
        assert!(target(Completed, &BatchEvent::Run).is_err());
        assert!(target(Failed, &BatchEvent::Stage).is_err());
        assert!(target(Completed, &BatchEvent::Complete).is_err());
        // Completion only applies to in-flight batches
        assert!(target(Staged, &BatchEvent::Complete).is_err());
    }
}
