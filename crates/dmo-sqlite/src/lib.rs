//! DMO SQLite - database gateway over SQLite files
//!
//! - [`SqliteGateway`]: introspection through `pragma_table_info` and
//!   `pragma_foreign_key_list`, keyset batches on the primary key (or
//!   `rowid`), checksums over the source columns
//! - [`SqliteWriter`]: one `BEGIN IMMEDIATE` transaction per table
//! - [`SqliteConnector`]: resolves a descriptor's `database` to a file path
//!
//! SQLite exposes a single schema per file, `main`; configure
//! `schemas = ["main"]` when migrating between SQLite databases.

mod gateway;
mod schema;

pub use gateway::{SqliteGateway, SqliteWriter, DEFAULT_BUSY_TIMEOUT};

use async_trait::async_trait;
use dmo_core::connector::DatabaseConnector;
use dmo_core::descriptor::ConnectionDescriptor;
use dmo_kernel::gateway::DbGateway;
use dmo_kernel::GatewayError;
use std::sync::Arc;
use std::time::Duration;

/// Schema name of the primary database in a SQLite file
pub const MAIN_SCHEMA: &str = "main";

/// Opens [`SqliteGateway`]s; `descriptor.database` is the file path and
/// the network fields are ignored
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    busy_timeout: Duration,
}

impl Default for SqliteConnector {
    fn default() -> Self {
        Self {
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

impl SqliteConnector {
    /// Connector with the default busy timeout
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: busy timeout for every gateway
    #[must_use]
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }
}

#[async_trait]
impl DatabaseConnector for SqliteConnector {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Arc<dyn DbGateway>, GatewayError> {
        let gateway =
            SqliteGateway::new(&descriptor.database).with_busy_timeout(self.busy_timeout);
        tracing::info!("Using SQLite database {}", gateway.path().display());
        Ok(Arc::new(gateway))
    }
}
