//! Scripted advisory service and connectors

use crate::memory::InMemoryDatabase;
use async_trait::async_trait;
use dmo_core::advisory::{
    AdvisoryContext, AdvisoryError, AdvisoryGateway, Assessment, ExecutionDigest, Recommendation,
    RiskLevel,
};
use dmo_core::connector::{AdvisoryConnector, DatabaseConnector};
use dmo_core::descriptor::{AdvisoryDescriptor, ConnectionDescriptor};
use dmo_kernel::gateway::DbGateway;
use dmo_kernel::GatewayError;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub fn low_risk() -> Assessment {
    Assessment {
        risk_level: RiskLevel::Low,
        recommendation: Recommendation::Approve,
        narrative: "Routine copy between compatible schemas.".to_string(),
    }
}

/// Answers queued assessments in order, then repeats the fallback
#[derive(Debug)]
pub struct ScriptedAdvisory {
    script: Mutex<VecDeque<Result<Assessment, AdvisoryError>>>,
    fallback: Result<Assessment, AdvisoryError>,
    health: Mutex<Result<(), AdvisoryError>>,
    calls: AtomicU32,
    contexts: Mutex<Vec<AdvisoryContext>>,
    summary: Mutex<Result<String, AdvisoryError>>,
    digests: Mutex<Vec<ExecutionDigest>>,
}

impl ScriptedAdvisory {
    pub fn approving() -> Self {
        Self::answering(Ok(low_risk()))
    }

    pub fn answering(fallback: Result<Assessment, AdvisoryError>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            health: Mutex::new(Ok(())),
            calls: AtomicU32::new(0),
            contexts: Mutex::new(Vec::new()),
            summary: Mutex::new(Ok("Migration finished as planned.".to_string())),
            digests: Mutex::new(Vec::new()),
        }
    }

    /// Builder: answer the next call with `answer`
    #[must_use]
    pub fn then(self, answer: Result<Assessment, AdvisoryError>) -> Self {
        self.script.lock().push_back(answer);
        self
    }

    pub fn fail_health_check(&self, error: AdvisoryError) {
        *self.health.lock() = Err(error);
    }

    /// Answer every final report request with `error`
    pub fn fail_summary(&self, error: AdvisoryError) {
        *self.summary.lock() = Err(error);
    }

    /// Assessment calls; final report requests are counted by `digests`
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_context(&self) -> Option<AdvisoryContext> {
        self.contexts.lock().last().cloned()
    }

    /// Every digest a final report was requested for
    pub fn digests(&self) -> Vec<ExecutionDigest> {
        self.digests.lock().clone()
    }
}

#[async_trait]
impl AdvisoryGateway for ScriptedAdvisory {
    async fn check_health(&self) -> Result<(), AdvisoryError> {
        self.health.lock().clone()
    }

    async fn assess(&self, context: &AdvisoryContext) -> Result<Assessment, AdvisoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().push(context.clone());
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }

    async fn summarize(&self, digest: &ExecutionDigest) -> Result<String, AdvisoryError> {
        self.digests.lock().push(digest.clone());
        self.summary.lock().clone()
    }
}

/// Resolves descriptors to in-memory databases by `database` name
#[derive(Debug, Default, Clone)]
pub struct InMemoryConnector {
    databases: HashMap<String, InMemoryDatabase>,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_database(mut self, name: impl Into<String>, db: InMemoryDatabase) -> Self {
        self.databases.insert(name.into(), db);
        self
    }
}

#[async_trait]
impl DatabaseConnector for InMemoryConnector {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Arc<dyn DbGateway>, GatewayError> {
        self.databases
            .get(&descriptor.database)
            .map(|db| Arc::new(db.clone()) as Arc<dyn DbGateway>)
            .ok_or_else(|| {
                GatewayError::Connectivity(format!("no database named {}", descriptor.database))
            })
    }
}

/// Hands out the same advisory gateway for every descriptor
#[derive(Clone)]
pub struct StaticAdvisoryConnector(pub Arc<dyn AdvisoryGateway>);

impl AdvisoryConnector for StaticAdvisoryConnector {
    fn connect(
        &self,
        _descriptor: &AdvisoryDescriptor,
    ) -> Result<Arc<dyn AdvisoryGateway>, AdvisoryError> {
        Ok(Arc::clone(&self.0))
    }
}
