//! Handler registry
//!
//! In-memory map from a job or event type to its [`OperationHandler`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::PipelineError;
use crate::handler::OperationHandler;

/// Type-keyed handler lookup. Cheap to clone.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn OperationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous registration.
    pub fn register<S: Into<String>>(&mut self, kind: S, handler: Arc<dyn OperationHandler>) {
        self.handlers.insert(kind.into(), handler);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<S: Into<String>>(mut self, kind: S, handler: Arc<dyn OperationHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    /// Look up a handler; unknown types are a hard, non-retryable error.
    pub fn get(&self, kind: &str) -> Result<Arc<dyn OperationHandler>, PipelineError> {
        self.handlers
            .get(kind)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownHandler {
                kind: kind.to_string(),
            })
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered type keys, sorted for stable output.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
