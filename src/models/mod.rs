//! # Data Models
//!
//! SeaORM entities for the conversations pipeline tables.

pub mod dead_letter;
pub mod job_queue;
pub mod llm_turn;
pub mod message;
pub mod thread;
pub mod webhook_event;

pub use dead_letter::Entity as DeadLetter;
pub use job_queue::Entity as JobQueueEntry;
pub use llm_turn::Entity as LlmTurn;
pub use message::Entity as Message;
pub use thread::Entity as Thread;
pub use webhook_event::Entity as WebhookEvent;
