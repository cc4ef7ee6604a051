//! DMO Advisory - HTTP client for the migration advisory service
//!
//! Implements [`dmo_core::advisory::AdvisoryGateway`] over a chat-session
//! HTTP API:
//!
//! - **Session protocol**: open a session, post the assessment prompt and,
//!   after execution, the final report prompt
//! - **Reply parsing**: tolerant of envelope shape and of JSON wrapped in
//!   prose or fenced blocks
//! - **Cautious fallback**: replies that cannot be read become a `MEDIUM`
//!   risk, `DENY` assessment carrying the raw text
//!
//! Retries and backoff are not handled here; the controller wraps every
//! gateway in [`dmo_core::advisory::RetryingAdvisory`].
//!
//! # Example
//!
//! ```rust,no_run
//! use dmo_advisory::HttpAdvisoryConnector;
//! use dmo_core::prelude::*;
//!
//! let advisories = Arc::new(HttpAdvisoryConnector::new());
//! # let _ = advisories;
//! ```

mod gateway;
mod reply;

pub use gateway::{HttpAdvisoryConnector, HttpAdvisoryGateway};
