//! The broker contract: pub/sub for "node ready" and "session cancelled"
//!
//! The engine assumes at-least-once delivery with explicit acknowledgement
//! on the node queues, plus a fan-out control channel for cancellation
//! broadcasts. Ordering across nodes is not guaranteed; idempotency is the
//! interactor's job (a duplicate ready message is safe because starting a
//! node is a conditional update, and a duplicate completion produces an
//! empty fan-out).
//!
//! A callback that fails is logged and its message acknowledged anyway:
//! retrying belongs to storage-driven redelivery, not to the transport.

mod memory;

pub use memory::MemoryBroker;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::entities::EnqueuedNode;
use crate::error::Result;
use crate::params::BrokerParams;

/// Callback invoked for every delivered node-ready message
pub type NodeCallback = Arc<dyn Fn(EnqueuedNode) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Callback invoked for every session-cancelled broadcast
pub type CancelCallback = Arc<dyn Fn(Uuid) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Handle identifying a registered callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

/// The broker contract of the scheduling engine
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a node-ready message, routed by the params' queue
    async fn publish_node_enqueued(&self, params: &BrokerParams, node: EnqueuedNode) -> Result<()>;

    /// Broadcast a session cancellation to every worker
    async fn publish_session_cancelled(&self, id: Uuid) -> Result<()>;

    /// Consume node-ready messages from the params' queue
    async fn add_on_node_enqueued_callback(
        &self,
        params: &BrokerParams,
        callback: NodeCallback,
    ) -> Result<SubscriptionId>;

    /// Receive session-cancelled broadcasts on a subscriber-exclusive channel
    async fn add_on_session_cancelled_callback(
        &self,
        callback: CancelCallback,
    ) -> Result<SubscriptionId>;

    /// Tear down one subscription
    async fn remove_callback(&self, id: SubscriptionId) -> Result<()>;

    /// Tear down every subscription and refuse further publishes
    async fn shutdown(&self) -> Result<()>;
}
