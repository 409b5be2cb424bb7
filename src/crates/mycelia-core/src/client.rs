//! Client facade: submit, cancel and resume sessions

use std::sync::Arc;

use uuid::Uuid;

use crate::broker::Broker;
use crate::call::NodeCall;
use crate::codec::Value;
use crate::error::Result;
use crate::executor::Executor;
use crate::interactor::Interactor;
use crate::storage::Storage;

/// A thin handle for driving sessions from outside the worker pool
pub struct Client {
    interactor: Arc<Interactor>,
}

impl Client {
    pub fn new(storage: Arc<dyn Storage>, broker: Arc<dyn Broker>) -> Self {
        // Clients never execute handlers; the registry stays empty.
        Self {
            interactor: Arc::new(Interactor::new(storage, broker, Arc::new(Executor::new()))),
        }
    }

    /// Orchestrate a call DAG; returns the id of the freshly created session
    pub async fn start_session(&self, call: &NodeCall) -> Result<Uuid> {
        self.interactor.start_session(call).await
    }

    /// Cancel a session and broadcast the cancellation to all workers
    pub async fn cancel_session(&self, id: Uuid) -> Result<()> {
        self.interactor.cancel_session(id).await
    }

    /// Complete a paused graph with an external value
    pub async fn resume(&self, graph_id: Uuid, value: &Value) -> Result<()> {
        self.interactor.resume(graph_id, value).await
    }
}
