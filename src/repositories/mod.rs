//! # Repository Layer
//!
//! Repositories encapsulating the SeaORM operations behind the pipeline's
//! tables. Every state transition that must be exclusive is a conditional
//! update or runs inside a transaction.

pub mod dead_letter;
pub mod job_queue;
pub mod llm_turn;

pub use dead_letter::{DeadLetterStore, DlqStats, MarkOutcome, NewDeadLetter};
pub use job_queue::{FailOutcome, JobQueue, NewJob};
pub use llm_turn::LlmTurnRepository;
