//! Admin API server for the Herald outbox.
//!
//! Provides the HTTP surface for inspecting, retrying and cancelling jobs.

pub mod error;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use state::AppState;
