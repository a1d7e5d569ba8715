//! Orchestration layer: the batch lifecycle driver, wave-based task
//! dispatcher, recovery sweeper, and engine bootstrap.

pub mod bootstrap;
pub mod dispatcher;
pub mod evaluator;
pub mod lifecycle;
pub mod recovery;

pub use bootstrap::Engine;
pub use dispatcher::{DispatchError, DispatchOutcome, TaskDispatcher};
pub use evaluator::{
    EvaluationRequest, EvaluationResponse, Evaluator, EvaluatorError,
};
pub use lifecycle::{
    BatchFailureReport, BatchLifecycle, DocumentSource, FsDocumentSource, StagingError, TaskFailure,
};
pub use recovery::{RecoverySweeper, SweepReport};
