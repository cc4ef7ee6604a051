//! DMO Core - the human-gated migration workflow
//!
//! Sequences a migration through its stages:
//! - Discovery of both databases
//! - Validation, including a rolled-back sample copy
//! - Generation of the dependency plan and an advisory assessment
//! - A hard suspend for human approval
//! - Execution through the kernel engine, followed by an advisory final
//!   report
//!
//! # Example
//!
//! ```rust,ignore
//! use dmo_core::prelude::*;
//!
//! # async fn example(databases: Arc<dyn DatabaseConnector>, advisories: Arc<dyn AdvisoryConnector>, descriptors: Descriptors) -> Result<(), WorkflowError> {
//! let controller = WorkflowController::builder(databases, advisories).build()?;
//! controller.configure(descriptors).await?;
//! controller.start()?;
//!
//! if controller.wait_until_settled().await == WorkflowStage::AwaitingApproval {
//!     controller.approve()?;
//! }
//! let stage = controller.wait_until_settled().await;
//! println!("finished as {stage}");
//! # Ok(())
//! # }
//! ```

pub mod advisory;
pub mod connector;
pub mod controller;
pub mod descriptor;
pub mod error;
pub mod progress;
pub mod report;
pub mod session;
pub mod settings;
pub mod store;

mod stages;

pub use advisory::{
    AdvisoryContext, AdvisoryError, AdvisoryGateway, Assessment, ExecutionDigest, Recommendation,
    RetryPolicy, RetryingAdvisory, RiskLevel, TableDigest,
};
pub use connector::{AdvisoryConnector, DatabaseConnector};
pub use controller::{ControllerBuilder, WorkflowController};
pub use descriptor::{AdvisoryDescriptor, ConnectionDescriptor, Descriptors, SslMode};
pub use error::WorkflowError;
pub use report::{Finding, Severity, StageFailure, StageKind, StageRecord, StageReport};
pub use session::{ApprovalDecision, SessionId, SessionRecord, StatusSnapshot, WorkflowSession};
pub use settings::MigrationSettings;
pub use store::{FileSessionStore, MemorySessionStore, SessionStore, StoreError};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving a migration workflow
    pub use crate::{
        AdvisoryConnector, AdvisoryDescriptor, ConnectionDescriptor, DatabaseConnector,
        Descriptors, MigrationSettings, StageKind, StageReport, WorkflowController, WorkflowError,
    };
    pub use dmo_kernel::state_machine::WorkflowStage;
    pub use std::sync::Arc;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
