//! Worker facade: bind handlers to queues and run the consume loop
//!
//! A worker is stateless with respect to the task graph: everything durable
//! lives in storage, everything transient in the messages it consumes. Many
//! workers may serve the same queues; they coordinate only through broker
//! and storage.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::broker::{Broker, CancelCallback, NodeCallback, SubscriptionId};
use crate::call::Node;
use crate::codec::Value;
use crate::error::Result;
use crate::executor::{Executor, Handler, HandlerFuture, Outcome, RunContext};
use crate::interactor::Interactor;
use crate::storage::Storage;

/// A worker process: handler registry plus broker subscriptions
pub struct Worker {
    interactor: Arc<Interactor>,
    executor: Arc<Executor>,
    broker: Arc<dyn Broker>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl Worker {
    /// Connect a worker: registers the session-cancelled subscription
    pub async fn create(storage: Arc<dyn Storage>, broker: Arc<dyn Broker>) -> Result<Self> {
        let executor = Arc::new(Executor::new());
        let interactor = Arc::new(Interactor::new(
            storage,
            Arc::clone(&broker),
            Arc::clone(&executor),
        ));

        let cancel_subscription = {
            let callback: CancelCallback = {
                let interactor = Arc::clone(&interactor);
                Arc::new(move |id| {
                    let interactor = Arc::clone(&interactor);
                    Box::pin(async move {
                        interactor.on_session_cancelled(id).await;
                        Ok(())
                    })
                })
            };
            broker.add_on_session_cancelled_callback(callback).await?
        };

        Ok(Self {
            interactor,
            executor,
            broker,
            subscriptions: Mutex::new(vec![cancel_subscription]),
        })
    }

    /// Serve a node: register its handler and consume its queue
    pub async fn serve<F, Fut>(&self, node: &Node, handler: F) -> Result<()>
    where
        F: Fn(RunContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Outcome>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |context, arguments| -> HandlerFuture {
            Box::pin(handler(context, arguments))
        });
        self.executor.register(node, handler);

        let callback: NodeCallback = {
            let interactor = Arc::clone(&self.interactor);
            Arc::new(move |enqueued| {
                let interactor = Arc::clone(&interactor);
                Box::pin(async move {
                    interactor.on_node_enqueued(enqueued).await;
                    Ok(())
                })
            })
        };
        let subscription = self
            .broker
            .add_on_node_enqueued_callback(node.broker_params(), callback)
            .await?;
        self.subscriptions.lock().push(subscription);

        info!(handler = node.handler(), queue = %node.broker_params().queue, "worker.serve");
        Ok(())
    }

    /// Drop every subscription this worker holds
    pub async fn shutdown(&self) -> Result<()> {
        let subscriptions: Vec<SubscriptionId> = self.subscriptions.lock().drain(..).collect();
        for subscription in subscriptions {
            self.broker.remove_callback(subscription).await?;
        }
        Ok(())
    }
}
