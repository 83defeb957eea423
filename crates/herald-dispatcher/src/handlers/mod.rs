//! Built-in job handlers.

pub mod webhook;

pub use webhook::{WebhookHandler, WebhookPayload};
