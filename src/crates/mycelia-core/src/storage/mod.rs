//! Durable state: the storage contract and the in-memory reference backend
//!
//! Storage owns every session, graph, node and dependency edge; the
//! interactor only ever holds transient ids. All mutating operations are
//! atomic with respect to the invariants of the data model:
//!
//! - a node's `pending_dependency_count` equals the number of its dependency
//!   graphs whose result was still unset when counted,
//! - a graph's result transitions from unset to set at most once,
//! - a node finishes at most once, and only after it started,
//! - the dependent-graph back-edge is written once,
//! - a cancelled session admits and completes nothing further.
//!
//! Any backend that can provide row-level locking and an atomic completion
//! fan-out can implement [`Storage`]; [`MemoryStorage`] is the reference
//! implementation used by tests and local development, and
//! `mycelia-postgres` is the production SQL backend.

mod memory;

pub use memory::MemoryStorage;

use async_trait::async_trait;
use uuid::Uuid;

use crate::entities::{
    CompletedNode, CreatedGraph, CreatedNode, CreatedSession, FanOut, ReadyNode, StartedNode,
};
use crate::error::Result;

/// The storage contract of the scheduling engine
#[async_trait]
pub trait Storage: Send + Sync {
    /// Admit a node, optionally creating its graph's session and always its
    /// graph, as one atomic batch
    ///
    /// Returns whether the node is ready: every dependency graph was already
    /// terminal at admission time. For splice admissions (`parent_id` set)
    /// the parent node is marked finished in the same batch.
    async fn create_node(
        &self,
        node: CreatedNode,
        graph: Option<CreatedGraph>,
        session: Option<CreatedSession>,
    ) -> Result<bool>;

    /// Mark a node started and return what its execution needs
    ///
    /// Redelivery keeps the original `started_at`. Fails with
    /// `SessionCancelled` when the owning session is cancelled at read time,
    /// `NodeNotFound` when there is no such node.
    async fn start_node(&self, id: Uuid) -> Result<StartedNode>;

    /// Finish a node and fan its graph's result out to dependents
    ///
    /// The first completion releases every dependent whose pending count
    /// reaches zero, walking the dependent-graph chain. A repeated
    /// completion does not re-decrement; it only re-emits released nodes
    /// that never started, so a crash between commit and publish is
    /// recoverable.
    async fn complete_node(&self, node: CompletedNode) -> Result<Vec<ReadyNode>>;

    /// Cancel a session: set `cancelled_at` once and make every non-terminal
    /// graph of the session terminal
    ///
    /// Errors distinguish the three no-op outcomes: `SessionNotFound`,
    /// `SessionCancelled` (already cancelled) and `SessionFinished` (nothing
    /// left to cancel).
    async fn cancel_session(&self, id: Uuid) -> Result<()>;

    /// Defer the dependent graph's result to the dependency graph's result
    ///
    /// If the dependency is already terminal, its state propagates
    /// immediately and the resulting fan-out is returned. Otherwise the
    /// back-edge is recorded; re-linking to a different dependent fails.
    async fn link_graphs(&self, dependent: Uuid, dependency: Uuid) -> Result<Vec<FanOut>>;

    /// Complete a graph directly, e.g. when resuming a paused graph
    async fn mark_graph_completed(&self, id: Uuid, result: Vec<u8>) -> Result<Vec<FanOut>>;

    /// Cancel a graph and everything downstream of it
    ///
    /// Walks the dependent-graph chain and the graphs of dependent nodes;
    /// returns the distinct graph ids that became cancelled.
    async fn mark_graph_cancelled(&self, id: Uuid) -> Result<Vec<Uuid>>;
}
