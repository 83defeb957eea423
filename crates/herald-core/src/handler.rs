//! Handler contract and registry.
//!
//! A handler performs the side effect behind one job type (send an email,
//! call a webhook, sync a CRM record). Delivery is at-least-once, so a
//! handler must be idempotent with respect to a natural key in its payload.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::job::JobPayload;

/// Result of running a handler once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Success,
    /// Transient failure; retried with backoff until attempts run out.
    Retryable(String),
    /// Unambiguous failure; the job is dead-lettered immediately.
    Permanent(String),
}

impl HandlerOutcome {
    pub fn retryable(message: impl fmt::Display) -> Self {
        HandlerOutcome::Retryable(message.to_string())
    }

    pub fn permanent(message: impl fmt::Display) -> Self {
        HandlerOutcome::Permanent(message.to_string())
    }

    /// Build an outcome from the loose `{success, error?, retryable?}` shape.
    /// Failures without an explicit `retryable = false` are retryable.
    pub fn from_parts(success: bool, error: Option<String>, retryable: Option<bool>) -> Self {
        if success {
            return HandlerOutcome::Success;
        }
        let message = error.unwrap_or_else(|| "handler reported failure".to_string());
        match retryable {
            Some(false) => HandlerOutcome::Permanent(message),
            _ => HandlerOutcome::Retryable(message),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, HandlerOutcome::Success)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            HandlerOutcome::Success => None,
            HandlerOutcome::Retryable(msg) | HandlerOutcome::Permanent(msg) => Some(msg),
        }
    }
}

/// A handler for one typed payload.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    type Payload: JobPayload;

    async fn handle(&self, payload: Self::Payload) -> HandlerOutcome;
}

/// Type-erased handler operating on the stored JSON payload.
#[async_trait]
pub trait DynHandler: Send + Sync {
    fn job_type(&self) -> &'static str;

    async fn dispatch(&self, payload: serde_json::Value) -> HandlerOutcome;
}

struct Typed<H>(H);

#[async_trait]
impl<H: JobHandler> DynHandler for Typed<H> {
    fn job_type(&self) -> &'static str {
        <H::Payload as JobPayload>::JOB_TYPE
    }

    async fn dispatch(&self, payload: serde_json::Value) -> HandlerOutcome {
        // Schema validation happens here, at dequeue time.
        match serde_json::from_value::<H::Payload>(payload) {
            Ok(typed) => self.0.handle(typed).await,
            Err(e) => HandlerOutcome::Permanent(format!(
                "invalid payload for '{}': {}",
                self.job_type(),
                e
            )),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("handler already registered for job type '{0}'")]
    Duplicate(String),
}

/// Maps job type names to handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn DynHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: JobHandler>(&mut self, handler: H) -> Result<&mut Self, RegistryError> {
        self.register_dyn(Arc::new(Typed(handler)))
    }

    pub fn register_dyn(
        &mut self,
        handler: Arc<dyn DynHandler>,
    ) -> Result<&mut Self, RegistryError> {
        let job_type = handler.job_type();
        if self.handlers.contains_key(job_type) {
            return Err(RegistryError::Duplicate(job_type.to_string()));
        }
        self.handlers.insert(job_type.to_string(), handler);
        Ok(self)
    }

    /// Builder-style registration.
    pub fn with<H: JobHandler>(mut self, handler: H) -> Result<Self, RegistryError> {
        self.register(handler)?;
        Ok(self)
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Run the handler for `job_type`. An unknown type is a permanent failure.
    pub async fn dispatch(&self, job_type: &str, payload: serde_json::Value) -> HandlerOutcome {
        match self.get(job_type) {
            Some(handler) => handler.dispatch(payload).await,
            None => HandlerOutcome::Permanent(format!(
                "no handler registered for job type '{}'",
                job_type
            )),
        }
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
