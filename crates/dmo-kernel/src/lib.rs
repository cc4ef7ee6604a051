//! DMO Kernel (dmo-kernel)
//!
//! The deterministic half of the migration orchestrator:
//! 1. **Planning**: turn discovered tables and their foreign keys into
//!    dependency levels ([`planner`])
//! 2. **Execution**: copy each level table-by-table inside destination
//!    transactions, verifying counts and checksums ([`engine`])
//!
//! Databases are reached only through the [`gateway`] contracts, so the
//! engine never sees a driver.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use dmo_kernel::prelude::*;
//!
//! let plan = DependencyPlanner::new().plan(&discovered)?;
//! let engine = ExecutionEngine::new(source, destination, EngineConfig::default());
//! let report = engine.run(&plan, &CancellationToken::new()).await;
//! assert_eq!(report.outcome, ExecutionOutcome::Completed);
//! ```

pub mod checksum;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod planner;
pub mod state_machine;
pub mod types;
pub mod unit;

pub use error::*;
pub use types::*;

pub use tokio_util::sync::CancellationToken;

/// Re-export of the types most callers need
pub mod prelude {
    pub use crate::checksum::TableChecksum;
    pub use crate::engine::{
        EngineConfig, EngineEvent, EngineObserver, ExecutionEngine, ExecutionOutcome,
        ExecutionReport, NoopObserver,
    };
    pub use crate::error::{ErrorKind, GatewayError, PlanError, StateMachineError, TableError};
    pub use crate::gateway::{stream_batches, DbGateway, TableWriter};
    pub use crate::logging::{LogEntry, LogLevel, SessionLog};
    pub use crate::planner::{DependencyPlanner, MigrationPlan, PlannedTable};
    pub use crate::state_machine::WorkflowStage;
    pub use crate::types::{
        ColumnSpec, DiscoveredTable, ForeignKey, Row, RowBatch, RowKey, TableName, TableSchema,
        Value,
    };
    pub use crate::unit::{TableMigrationUnit, TableStatus};
    pub use tokio_util::sync::CancellationToken;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
