//! Entities exchanged between the interactor, storage and broker
//!
//! These are the wire- and storage-facing shapes of a node as it moves
//! through its lifecycle: invoked by a client, created in storage, enqueued
//! on the broker, started and run by a worker, completed back into storage.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::params::{BrokerParams, ExecutorParams, StorageParams};

/// A node flattened out of the call builder, ready for admission
///
/// Shared subtrees stay shared: a call reused in several argument positions
/// maps to one `InvokedNode` behind multiple `Arc`s.
#[derive(Debug)]
pub struct InvokedNode {
    pub id: Uuid,
    /// Encoded positional argument map; dependency placeholders inside
    pub arguments: Vec<u8>,
    /// Dependency nodes with their data flag (`true` feeds arguments)
    pub dependencies: Vec<(Arc<InvokedNode>, bool)>,
    pub storage_params: StorageParams,
    pub broker_params: BrokerParams,
    pub executor_params: ExecutorParams,
}

/// Session row to create during the first admission of an orchestration
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub id: Uuid,
    pub retention: Option<std::time::Duration>,
}

/// Graph row to create alongside its root node
#[derive(Debug, Clone)]
pub struct CreatedGraph {
    pub id: Uuid,
    pub session_id: Uuid,
    pub trace_context: Vec<u8>,
}

/// Node row plus its dependency edges, admitted as one atomic batch
#[derive(Debug, Clone)]
pub struct CreatedNode {
    pub id: Uuid,
    /// Set for splice admissions; the parent node is finished in the same batch
    pub parent_id: Option<Uuid>,
    pub graph_id: Uuid,
    pub arguments: Vec<u8>,
    /// Dependency graph id to data flag, ordered ascending for stable locking
    pub dependencies: BTreeMap<Uuid, bool>,
    pub trace_context: Vec<u8>,
    pub broker_params: Vec<u8>,
    pub executor_params: Vec<u8>,
}

/// A node released by completion fan-out, with what the publisher needs
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyNode {
    pub id: Uuid,
    pub session_id: Uuid,
    pub trace_context: Vec<u8>,
    pub broker_params: Vec<u8>,
}

/// The broker message body for a ready node
///
/// Wire format: `id (16 bytes) || session_id (16 bytes) || trace_context`.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueuedNode {
    pub id: Uuid,
    pub session_id: Uuid,
    pub trace_context: Vec<u8>,
}

impl EnqueuedNode {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(32 + self.trace_context.len());
        body.extend_from_slice(self.id.as_bytes());
        body.extend_from_slice(self.session_id.as_bytes());
        body.extend_from_slice(&self.trace_context);
        body
    }

    pub fn from_bytes(body: &[u8]) -> Result<Self> {
        if body.len() < 32 {
            return Err(Error::Broker(format!(
                "node message body has {} bytes, expected at least 32",
                body.len()
            )));
        }
        Ok(Self {
            id: Uuid::from_slice(&body[..16]).expect("slice is 16 bytes"),
            session_id: Uuid::from_slice(&body[16..32]).expect("slice is 16 bytes"),
            trace_context: body[32..].to_vec(),
        })
    }
}

/// What `start_node` hands to the worker
#[derive(Debug, Clone)]
pub struct StartedNode {
    pub id: Uuid,
    pub graph_id: Uuid,
    pub arguments: Vec<u8>,
    /// Results of data dependencies, keyed by dependency graph id
    pub dependencies: HashMap<Uuid, Vec<u8>>,
    pub graph_trace_context: Vec<u8>,
    pub executor_params: Vec<u8>,
}

/// The executing node as seen by a handler invocation
#[derive(Debug, Clone)]
pub struct RunningNode {
    pub id: Uuid,
    pub graph_id: Uuid,
    pub session_id: Uuid,
    pub arguments: Vec<u8>,
    pub dependencies: HashMap<Uuid, Vec<u8>>,
}

/// A finished node with its encoded result
#[derive(Debug, Clone)]
pub struct CompletedNode {
    pub id: Uuid,
    pub result: Vec<u8>,
}

/// One element of a graph-termination fan-out
#[derive(Debug, Clone, PartialEq)]
pub enum FanOut {
    /// A dependent node whose pending count reached zero
    Ready(ReadyNode),
    /// A graph cancelled while propagating the termination
    Cancelled(Uuid),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueued_node_roundtrips() {
        let node = EnqueuedNode {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            trace_context: b"00aabb".to_vec(),
        };
        assert_eq!(EnqueuedNode::from_bytes(&node.to_bytes()).unwrap(), node);
    }

    #[test]
    fn enqueued_node_accepts_empty_trace() {
        let node = EnqueuedNode {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            trace_context: Vec::new(),
        };
        let body = node.to_bytes();
        assert_eq!(body.len(), 32);
        assert_eq!(EnqueuedNode::from_bytes(&body).unwrap(), node);
    }

    #[test]
    fn short_message_bodies_are_rejected() {
        assert!(EnqueuedNode::from_bytes(&[0u8; 31]).is_err());
    }
}
