//! Batch lifecycle state management: status enums, transition events, and
//! the persisted state machine.

pub mod batch_state_machine;
pub mod events;
pub mod states;

pub use batch_state_machine::{BatchStateMachine, StateMachineError};
pub use events::BatchEvent;
pub use states::{BatchStatus, TaskStatus};
