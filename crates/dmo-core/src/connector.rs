//! Factories turning descriptors into live gateways.
//!
//! The controller never names a driver; the binary (or a test) hands it
//! connectors that know how to reach a particular kind of database or
//! advisory service.

use crate::advisory::{AdvisoryError, AdvisoryGateway};
use crate::descriptor::{AdvisoryDescriptor, ConnectionDescriptor};
use async_trait::async_trait;
use dmo_kernel::gateway::DbGateway;
use dmo_kernel::GatewayError;
use std::sync::Arc;

/// Opens database gateways
#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    /// Open a gateway for `descriptor`. Reachability is checked separately.
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Arc<dyn DbGateway>, GatewayError>;
}

/// Builds advisory gateways
pub trait AdvisoryConnector: Send + Sync {
    /// Build a (non-retrying) gateway for `descriptor`
    fn connect(
        &self,
        descriptor: &AdvisoryDescriptor,
    ) -> Result<Arc<dyn AdvisoryGateway>, AdvisoryError>;
}
