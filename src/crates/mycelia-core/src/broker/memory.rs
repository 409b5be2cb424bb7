//! In-memory reference broker
//!
//! Node messages travel serialized in the same body format the production
//! transport uses, routed by queue name over unbounded channels. Several
//! subscriptions on one queue compete for messages; the control channel
//! fans out to every subscriber. Delivery tasks log a failed callback and
//! move on, which is the transport-level ack.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{Broker, CancelCallback, NodeCallback, SubscriptionId};
use crate::entities::EnqueuedNode;
use crate::error::{Error, Result};
use crate::params::BrokerParams;

const CONTROL_CAPACITY: usize = 256;

struct Queue {
    sender: mpsc::UnboundedSender<Vec<u8>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

struct BrokerState {
    queues: HashMap<String, Queue>,
    subscriptions: HashMap<u64, JoinHandle<()>>,
    next_subscription: u64,
    is_shutdown: bool,
}

/// Reference [`Broker`] connecting clients and workers inside one process
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    control: broadcast::Sender<[u8; 16]>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (control, _) = broadcast::channel(CONTROL_CAPACITY);
        Self {
            state: Mutex::new(BrokerState {
                queues: HashMap::new(),
                subscriptions: HashMap::new(),
                next_subscription: 0,
                is_shutdown: false,
            }),
            control,
        }
    }

    fn queue_receiver(
        &self,
        name: &str,
    ) -> Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>> {
        let mut state = self.state.lock();
        Arc::clone(&ensure_queue(&mut state.queues, name).receiver)
    }

    fn register(&self, handle: JoinHandle<()>) -> SubscriptionId {
        let mut state = self.state.lock();
        let id = state.next_subscription;
        state.next_subscription += 1;
        state.subscriptions.insert(id, handle);
        SubscriptionId(id)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_queue<'a>(queues: &'a mut HashMap<String, Queue>, name: &str) -> &'a mut Queue {
    queues.entry(name.to_owned()).or_insert_with(|| {
        let (sender, receiver) = mpsc::unbounded_channel();
        Queue {
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
        }
    })
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn publish_node_enqueued(&self, params: &BrokerParams, node: EnqueuedNode) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_shutdown {
            return Err(Error::Broker("broker is shut down".into()));
        }

        let queue = ensure_queue(&mut state.queues, &params.queue);
        if queue.sender.send(node.to_bytes()).is_err() {
            warn!(queue = %params.queue, id = %node.id, "node.message_not_queued");
        }
        Ok(())
    }

    async fn publish_session_cancelled(&self, id: Uuid) -> Result<()> {
        if self.state.lock().is_shutdown {
            return Err(Error::Broker("broker is shut down".into()));
        }

        if self.control.send(*id.as_bytes()).is_err() {
            // No worker is listening; the storage flag still takes effect.
            debug!(id = %id, "session.cancel_broadcast_unheard");
        }
        Ok(())
    }

    async fn add_on_node_enqueued_callback(
        &self,
        params: &BrokerParams,
        callback: NodeCallback,
    ) -> Result<SubscriptionId> {
        if self.state.lock().is_shutdown {
            return Err(Error::Broker("broker is shut down".into()));
        }

        let receiver = self.queue_receiver(&params.queue);
        let queue = params.queue.clone();
        let handle = tokio::spawn(async move {
            loop {
                let body = { receiver.lock().await.recv().await };
                let Some(body) = body else {
                    break;
                };
                let node = match EnqueuedNode::from_bytes(&body) {
                    Ok(node) => node,
                    Err(err) => {
                        error!(queue = %queue, error = %err, "node.message_malformed");
                        continue;
                    }
                };
                if let Err(err) = callback(node).await {
                    // Acked regardless; redelivery is driven by storage state.
                    error!(queue = %queue, error = %err, "node.callback_failed");
                }
            }
        });

        Ok(self.register(handle))
    }

    async fn add_on_session_cancelled_callback(
        &self,
        callback: CancelCallback,
    ) -> Result<SubscriptionId> {
        if self.state.lock().is_shutdown {
            return Err(Error::Broker("broker is shut down".into()));
        }

        let mut receiver = self.control.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(body) => {
                        let id = Uuid::from_bytes(body);
                        if let Err(err) = callback(id).await {
                            error!(id = %id, error = %err, "session.callback_failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "session.cancel_broadcast_lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(self.register(handle))
    }

    async fn remove_callback(&self, id: SubscriptionId) -> Result<()> {
        let handle = self
            .state
            .lock()
            .subscriptions
            .remove(&id.0)
            .ok_or_else(|| Error::Broker(format!("unknown subscription {id:?}")))?;
        handle.abort();
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.is_shutdown = true;
        for (_, handle) in state.subscriptions.drain() {
            handle.abort();
        }
        state.queues.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;

    fn enqueued(trace: &[u8]) -> EnqueuedNode {
        EnqueuedNode {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            trace_context: trace.to_vec(),
        }
    }

    #[tokio::test]
    async fn routes_by_queue_name() {
        let broker = MemoryBroker::new();
        let (seen_tx, mut seen_rx) = unbounded_channel();

        let params = BrokerParams::new("alpha");
        broker
            .add_on_node_enqueued_callback(
                &params,
                Arc::new(move |node| {
                    let seen_tx = seen_tx.clone();
                    Box::pin(async move {
                        seen_tx.send(node).unwrap();
                        Ok(())
                    })
                }),
            )
            .await
            .unwrap();

        let expected = enqueued(b"00aa");
        broker
            .publish_node_enqueued(&params, expected.clone())
            .await
            .unwrap();
        broker
            .publish_node_enqueued(&BrokerParams::new("beta"), enqueued(b""))
            .await
            .unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered, expected);
        // Nothing from the other queue.
        assert!(seen_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_callback_does_not_stop_delivery() {
        let broker = MemoryBroker::new();
        let (seen_tx, mut seen_rx) = unbounded_channel();

        let params = BrokerParams::new("faulty");
        let callback: NodeCallback = Arc::new(move |node| {
            let seen_tx = seen_tx.clone();
            Box::pin(async move {
                seen_tx.send(node.id).unwrap();
                Err(Error::Handler("boom".into()))
            })
        });
        broker
            .add_on_node_enqueued_callback(&params, callback)
            .await
            .unwrap();

        broker.publish_node_enqueued(&params, enqueued(b"")).await.unwrap();
        broker.publish_node_enqueued(&params, enqueued(b"")).await.unwrap();

        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn cancellation_fans_out_to_every_subscriber() {
        let broker = MemoryBroker::new();
        let (seen_tx, mut seen_rx) = unbounded_channel();

        for _ in 0..2 {
            let seen_tx = seen_tx.clone();
            broker
                .add_on_session_cancelled_callback(Arc::new(move |id| {
                    let seen_tx = seen_tx.clone();
                    Box::pin(async move {
                        seen_tx.send(id).unwrap();
                        Ok(())
                    })
                }))
                .await
                .unwrap();
        }

        let session_id = Uuid::new_v4();
        broker.publish_session_cancelled(session_id).await.unwrap();

        for _ in 0..2 {
            let seen = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(seen, session_id);
        }
    }

    #[tokio::test]
    async fn removed_callback_stops_receiving() {
        let broker = MemoryBroker::new();
        let (seen_tx, mut seen_rx) = unbounded_channel::<Uuid>();

        let params = BrokerParams::new("gone");
        let subscription = broker
            .add_on_node_enqueued_callback(
                &params,
                Arc::new(move |node| {
                    let seen_tx = seen_tx.clone();
                    Box::pin(async move {
                        let _ = seen_tx.send(node.id);
                        Ok(())
                    })
                }),
            )
            .await
            .unwrap();

        broker.remove_callback(subscription).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.publish_node_enqueued(&params, enqueued(b"")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_refuses_further_publishes() {
        let broker = MemoryBroker::new();
        broker.shutdown().await.unwrap();
        assert!(broker
            .publish_node_enqueued(&BrokerParams::new("q"), enqueued(b""))
            .await
            .is_err());
        assert!(broker.publish_session_cancelled(Uuid::new_v4()).await.is_err());
    }
}
