//! In-memory reference storage
//!
//! A single mutex over plain maps. Every operation validates first and
//! mutates second, so a failed call leaves no partial state behind — the
//! same all-or-nothing contract the SQL backend gets from transactions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::warn;
use uuid::Uuid;

use super::Storage;
use crate::entities::{
    CompletedNode, CreatedGraph, CreatedNode, CreatedSession, FanOut, ReadyNode, StartedNode,
};
use crate::error::{Error, Result};

struct SessionRow {
    cancelled_at: Option<DateTime<Utc>>,
    #[allow(dead_code)]
    retention: Option<std::time::Duration>,
}

struct GraphRow {
    session_id: Uuid,
    trace_context: Vec<u8>,
    result: Option<Vec<u8>>,
    cancelled_at: Option<DateTime<Utc>>,
    dependent_graph_id: Option<Uuid>,
}

struct NodeRow {
    graph_id: Uuid,
    arguments: Vec<u8>,
    trace_context: Vec<u8>,
    broker_params: Vec<u8>,
    executor_params: Vec<u8>,
    pending_dependency_count: usize,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct State {
    sessions: HashMap<Uuid, SessionRow>,
    graphs: HashMap<Uuid, GraphRow>,
    nodes: HashMap<Uuid, NodeRow>,
    /// node id -> (dependency graph id, is_data), insertion-ordered
    dependencies_by_node: HashMap<Uuid, Vec<(Uuid, bool)>>,
    /// dependency graph id -> dependent node ids
    dependents_by_graph: HashMap<Uuid, Vec<Uuid>>,
}

/// Reference [`Storage`] backend holding everything in process memory
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<State>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Terminal result of a graph, if it completed
    pub fn graph_result(&self, id: Uuid) -> Option<Vec<u8>> {
        self.state.lock().graphs.get(&id).and_then(|graph| graph.result.clone())
    }

    /// Whether a graph was cancelled
    pub fn is_graph_cancelled(&self, id: Uuid) -> bool {
        self.state
            .lock()
            .graphs
            .get(&id)
            .is_some_and(|graph| graph.cancelled_at.is_some())
    }

    /// Whether a session was cancelled
    pub fn is_session_cancelled(&self, id: Uuid) -> bool {
        self.state
            .lock()
            .sessions
            .get(&id)
            .is_some_and(|session| session.cancelled_at.is_some())
    }

    /// `(started, finished)` flags of a node
    pub fn node_progress(&self, id: Uuid) -> Option<(bool, bool)> {
        self.state
            .lock()
            .nodes
            .get(&id)
            .map(|node| (node.started_at.is_some(), node.finished_at.is_some()))
    }

    /// Current pending dependency count of a node
    pub fn pending_dependency_count(&self, id: Uuid) -> Option<usize> {
        self.state
            .lock()
            .nodes
            .get(&id)
            .map(|node| node.pending_dependency_count)
    }

    /// Number of dependency edges recorded for a node
    pub fn dependency_edge_count(&self, id: Uuid) -> usize {
        self.state
            .lock()
            .dependencies_by_node
            .get(&id)
            .map_or(0, Vec::len)
    }

    /// Total number of node rows
    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }
}

impl State {
    fn ready_node(&self, node_id: Uuid) -> ReadyNode {
        let node = &self.nodes[&node_id];
        let graph = &self.graphs[&node.graph_id];
        ReadyNode {
            id: node_id,
            session_id: graph.session_id,
            trace_context: node.trace_context.clone(),
            broker_params: node.broker_params.clone(),
        }
    }

    /// Complete a graph and walk its dependent chain, releasing dependents
    ///
    /// The caller has already established that `id` exists and is not
    /// cancelled. Stops at the first already-terminal or cancelled graph in
    /// the chain.
    fn complete_graph(&mut self, id: Uuid, result: &[u8]) -> Vec<ReadyNode> {
        let mut ready = Vec::new();
        let mut current = Some(id);

        while let Some(graph_id) = current {
            let Some(graph) = self.graphs.get_mut(&graph_id) else {
                break;
            };
            if graph.cancelled_at.is_some() {
                warn!(id = %graph_id, "graph.cancelled_in_chain");
                break;
            }
            if graph.result.is_some() {
                break;
            }

            graph.result = Some(result.to_vec());
            current = graph.dependent_graph_id;

            for node_id in self
                .dependents_by_graph
                .get(&graph_id)
                .cloned()
                .unwrap_or_default()
            {
                let node = self.nodes.get_mut(&node_id).expect("edge points at a node");
                node.pending_dependency_count -= 1;
                let now_ready = node.pending_dependency_count == 0;
                if now_ready {
                    ready.push(self.ready_node(node_id));
                }
            }
        }

        ready
    }

    /// Dependents of a terminal graph that are ready but never started
    ///
    /// The redelivery-recovery branch: these were released before, but the
    /// releasing worker may have crashed between commit and publish.
    fn unstarted_ready_dependents(&self, graph_id: Uuid) -> Vec<ReadyNode> {
        self.dependents_by_graph
            .get(&graph_id)
            .map(|node_ids| {
                node_ids
                    .iter()
                    .filter(|node_id| {
                        let node = &self.nodes[node_id];
                        node.pending_dependency_count == 0 && node.started_at.is_none()
                    })
                    .map(|node_id| self.ready_node(*node_id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Cancel a graph and everything downstream; returns newly cancelled ids
    fn cancel_graph(&mut self, id: Uuid) -> Vec<Uuid> {
        let mut cancelled = Vec::new();
        let mut stack = vec![id];

        while let Some(graph_id) = stack.pop() {
            let Some(graph) = self.graphs.get_mut(&graph_id) else {
                continue;
            };
            if graph.result.is_some() || graph.cancelled_at.is_some() {
                continue;
            }

            graph.cancelled_at = Some(Utc::now());
            cancelled.push(graph_id);

            if let Some(dependent) = graph.dependent_graph_id {
                stack.push(dependent);
            }
            if let Some(node_ids) = self.dependents_by_graph.get(&graph_id) {
                for node_id in node_ids {
                    stack.push(self.nodes[node_id].graph_id);
                }
            }
        }

        cancelled
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    async fn create_node(
        &self,
        node: CreatedNode,
        graph: Option<CreatedGraph>,
        session: Option<CreatedSession>,
    ) -> Result<bool> {
        let mut state = self.state.lock();

        // Validate the whole batch before touching anything.
        if state.nodes.contains_key(&node.id) {
            return Err(Error::Storage(format!("node `{}` already exists", node.id)));
        }
        if let Some(session) = &session {
            if state.sessions.contains_key(&session.id) {
                return Err(Error::Storage(format!(
                    "session `{}` already exists",
                    session.id
                )));
            }
        }
        if let Some(graph) = &graph {
            let known_session = session.as_ref().is_some_and(|s| s.id == graph.session_id);
            if !known_session {
                let session_row = state
                    .sessions
                    .get(&graph.session_id)
                    .ok_or(Error::SessionNotFound(graph.session_id))?;
                if session_row.cancelled_at.is_some() {
                    return Err(Error::SessionCancelled(graph.session_id));
                }
            }
        }
        let mut pending = 0usize;
        for (dependency_graph_id, _) in &node.dependencies {
            let dependency = state
                .graphs
                .get(dependency_graph_id)
                .ok_or(Error::NodeNotFound(*dependency_graph_id))?;
            if dependency.cancelled_at.is_some() {
                return Err(Error::SessionCancelled(dependency.session_id));
            }
            if dependency.result.is_none() {
                pending += 1;
            }
        }
        if let Some(parent_id) = node.parent_id {
            if !state.nodes.contains_key(&parent_id) {
                return Err(Error::NodeNotFound(parent_id));
            }
        }

        // Apply.
        if let Some(session) = session {
            state.sessions.insert(
                session.id,
                SessionRow {
                    cancelled_at: None,
                    retention: session.retention,
                },
            );
        }
        if let Some(graph) = graph {
            state.graphs.insert(
                graph.id,
                GraphRow {
                    session_id: graph.session_id,
                    trace_context: graph.trace_context,
                    result: None,
                    cancelled_at: None,
                    dependent_graph_id: None,
                },
            );
        }
        for (dependency_graph_id, is_data) in &node.dependencies {
            state
                .dependencies_by_node
                .entry(node.id)
                .or_default()
                .push((*dependency_graph_id, *is_data));
            state
                .dependents_by_graph
                .entry(*dependency_graph_id)
                .or_default()
                .push(node.id);
        }
        if let Some(parent_id) = node.parent_id {
            let parent = state.nodes.get_mut(&parent_id).expect("validated above");
            parent.finished_at.get_or_insert_with(Utc::now);
        }
        state.nodes.insert(
            node.id,
            NodeRow {
                graph_id: node.graph_id,
                arguments: node.arguments,
                trace_context: node.trace_context,
                broker_params: node.broker_params,
                executor_params: node.executor_params,
                pending_dependency_count: pending,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
            },
        );

        Ok(pending == 0)
    }

    async fn start_node(&self, id: Uuid) -> Result<StartedNode> {
        let mut state = self.state.lock();

        let node = state.nodes.get(&id).ok_or(Error::NodeNotFound(id))?;
        let graph_id = node.graph_id;
        let graph = &state.graphs[&graph_id];
        let session_id = graph.session_id;
        let graph_trace_context = graph.trace_context.clone();
        if graph.cancelled_at.is_some() || state.sessions[&session_id].cancelled_at.is_some() {
            return Err(Error::SessionCancelled(session_id));
        }

        let mut dependencies = HashMap::new();
        for (dependency_graph_id, is_data) in
            state.dependencies_by_node.get(&id).cloned().unwrap_or_default()
        {
            if !is_data {
                continue;
            }
            let result = state.graphs[&dependency_graph_id]
                .result
                .clone()
                .ok_or_else(|| {
                    Error::Storage(format!(
                        "data dependency `{dependency_graph_id}` of `{id}` has no result"
                    ))
                })?;
            dependencies.insert(dependency_graph_id, result);
        }

        let node = state.nodes.get_mut(&id).expect("checked above");
        node.started_at.get_or_insert_with(Utc::now);

        Ok(StartedNode {
            id,
            graph_id,
            arguments: node.arguments.clone(),
            dependencies,
            graph_trace_context,
            executor_params: node.executor_params.clone(),
        })
    }

    async fn complete_node(&self, node: CompletedNode) -> Result<Vec<ReadyNode>> {
        let mut state = self.state.lock();

        let row = state.nodes.get_mut(&node.id).ok_or(Error::NodeNotFound(node.id))?;
        row.finished_at.get_or_insert_with(Utc::now);
        let graph_id = row.graph_id;

        let graph = &state.graphs[&graph_id];
        if graph.cancelled_at.is_some() {
            return Ok(Vec::new());
        }
        if graph.result.is_some() {
            return Ok(state.unstarted_ready_dependents(graph_id));
        }

        Ok(state.complete_graph(graph_id, &node.result))
    }

    async fn cancel_session(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock();

        let session = state.sessions.get(&id).ok_or(Error::SessionNotFound(id))?;
        if session.cancelled_at.is_some() {
            return Err(Error::SessionCancelled(id));
        }

        let running: Vec<Uuid> = state
            .graphs
            .iter()
            .filter(|(_, graph)| {
                graph.session_id == id && graph.result.is_none() && graph.cancelled_at.is_none()
            })
            .map(|(graph_id, _)| *graph_id)
            .collect();
        if running.is_empty() {
            return Err(Error::SessionFinished(id));
        }

        let now = Utc::now();
        state.sessions.get_mut(&id).expect("checked above").cancelled_at = Some(now);
        for graph_id in running {
            state.graphs.get_mut(&graph_id).expect("selected above").cancelled_at = Some(now);
        }

        Ok(())
    }

    async fn link_graphs(&self, dependent: Uuid, dependency: Uuid) -> Result<Vec<FanOut>> {
        let mut state = self.state.lock();

        let dependency_graph = state
            .graphs
            .get(&dependency)
            .ok_or(Error::NodeNotFound(dependency))?;

        if let Some(result) = dependency_graph.result.clone() {
            return Ok(state
                .complete_graph(dependent, &result)
                .into_iter()
                .map(FanOut::Ready)
                .collect());
        }
        if dependency_graph.cancelled_at.is_some() {
            return Ok(state
                .cancel_graph(dependent)
                .into_iter()
                .map(FanOut::Cancelled)
                .collect());
        }
        if let Some(existing) = dependency_graph.dependent_graph_id {
            if existing != dependent {
                return Err(Error::GraphLinked { dependency, existing });
            }
            return Ok(Vec::new());
        }

        state
            .graphs
            .get_mut(&dependency)
            .expect("checked above")
            .dependent_graph_id = Some(dependent);
        Ok(Vec::new())
    }

    async fn mark_graph_completed(&self, id: Uuid, result: Vec<u8>) -> Result<Vec<FanOut>> {
        let mut state = self.state.lock();

        let graph = state.graphs.get(&id).ok_or(Error::NodeNotFound(id))?;
        if graph.cancelled_at.is_some() {
            return Err(Error::SessionCancelled(graph.session_id));
        }
        if graph.result.is_some() {
            return Ok(state
                .unstarted_ready_dependents(id)
                .into_iter()
                .map(FanOut::Ready)
                .collect());
        }

        Ok(state
            .complete_graph(id, &result)
            .into_iter()
            .map(FanOut::Ready)
            .collect())
    }

    async fn mark_graph_cancelled(&self, id: Uuid) -> Result<Vec<Uuid>> {
        let mut state = self.state.lock();
        if !state.graphs.contains_key(&id) {
            return Err(Error::NodeNotFound(id));
        }
        Ok(state.cancel_graph(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn session() -> CreatedSession {
        CreatedSession {
            id: Uuid::new_v4(),
            retention: Some(Duration::from_secs(60)),
        }
    }

    fn graph(id: Uuid, session_id: Uuid) -> CreatedGraph {
        CreatedGraph {
            id,
            session_id,
            trace_context: Vec::new(),
        }
    }

    fn node(id: Uuid, dependencies: &[(Uuid, bool)]) -> CreatedNode {
        CreatedNode {
            id,
            parent_id: None,
            graph_id: id,
            arguments: Vec::new(),
            dependencies: dependencies.iter().copied().collect::<BTreeMap<_, _>>(),
            trace_context: Vec::new(),
            broker_params: b"bp".to_vec(),
            executor_params: b"ep".to_vec(),
        }
    }

    /// Admit a root node with a fresh session; returns (session_id, node_id)
    async fn admit_root(storage: &MemoryStorage) -> (Uuid, Uuid) {
        let session = session();
        let session_id = session.id;
        let id = Uuid::new_v4();
        let ready = storage
            .create_node(node(id, &[]), Some(graph(id, session_id)), Some(session))
            .await
            .unwrap();
        assert!(ready);
        (session_id, id)
    }

    async fn admit_dependent(
        storage: &MemoryStorage,
        session_id: Uuid,
        dependencies: &[(Uuid, bool)],
    ) -> (Uuid, bool) {
        let id = Uuid::new_v4();
        let ready = storage
            .create_node(node(id, dependencies), Some(graph(id, session_id)), None)
            .await
            .unwrap();
        (id, ready)
    }

    #[tokio::test]
    async fn admission_counts_only_pending_dependencies() {
        let storage = MemoryStorage::new();
        let (session_id, first) = admit_root(&storage).await;

        storage
            .complete_node(CompletedNode { id: first, result: b"1".to_vec() })
            .await
            .unwrap();

        let (second, _) = admit_dependent(&storage, session_id, &[]).await;
        // One dependency already terminal, one still pending.
        let (sink, ready) =
            admit_dependent(&storage, session_id, &[(first, true), (second, true)]).await;

        assert!(!ready);
        assert_eq!(storage.pending_dependency_count(sink), Some(1));
        assert_eq!(storage.dependency_edge_count(sink), 2);
    }

    #[tokio::test]
    async fn completion_releases_fan_in_exactly_once() {
        let storage = MemoryStorage::new();
        let (session_id, first) = admit_root(&storage).await;
        let (second, _) = admit_dependent(&storage, session_id, &[]).await;
        let (sink, ready) =
            admit_dependent(&storage, session_id, &[(first, true), (second, true)]).await;
        assert!(!ready);

        let released = storage
            .complete_node(CompletedNode { id: first, result: b"1".to_vec() })
            .await
            .unwrap();
        assert!(released.is_empty());

        let released = storage
            .complete_node(CompletedNode { id: second, result: b"2".to_vec() })
            .await
            .unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].id, sink);
        assert_eq!(released[0].session_id, session_id);
    }

    #[tokio::test]
    async fn repeated_completion_does_not_redecrement() {
        let storage = MemoryStorage::new();
        let (session_id, first) = admit_root(&storage).await;
        let (sink, _) = admit_dependent(&storage, session_id, &[(first, true)]).await;

        storage
            .complete_node(CompletedNode { id: first, result: b"1".to_vec() })
            .await
            .unwrap();
        assert_eq!(storage.pending_dependency_count(sink), Some(0));
        assert_eq!(storage.graph_result(first).unwrap(), b"1");

        // The second completion re-emits the never-started dependent without
        // touching counters or the stored result.
        let released = storage
            .complete_node(CompletedNode { id: first, result: b"other".to_vec() })
            .await
            .unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].id, sink);
        assert_eq!(storage.pending_dependency_count(sink), Some(0));
        assert_eq!(storage.graph_result(first).unwrap(), b"1");

        storage.start_node(sink).await.unwrap();
        let released = storage
            .complete_node(CompletedNode { id: first, result: b"1".to_vec() })
            .await
            .unwrap();
        assert!(released.is_empty());
    }

    #[tokio::test]
    async fn start_node_materialises_data_dependencies() {
        let storage = MemoryStorage::new();
        let (session_id, first) = admit_root(&storage).await;
        let (second, _) = admit_dependent(&storage, session_id, &[]).await;
        let (sink, _) =
            admit_dependent(&storage, session_id, &[(first, true), (second, false)]).await;

        storage
            .complete_node(CompletedNode { id: first, result: b"42".to_vec() })
            .await
            .unwrap();
        storage
            .complete_node(CompletedNode { id: second, result: b"ignored".to_vec() })
            .await
            .unwrap();

        let started = storage.start_node(sink).await.unwrap();
        assert_eq!(started.dependencies.len(), 1);
        assert_eq!(started.dependencies[&first], b"42");
        assert_eq!(storage.node_progress(sink), Some((true, false)));
    }

    #[tokio::test]
    async fn unknown_node_operations_fail() {
        let storage = MemoryStorage::new();
        let id = Uuid::new_v4();
        assert!(matches!(storage.start_node(id).await, Err(Error::NodeNotFound(_))));
        assert!(matches!(
            storage
                .complete_node(CompletedNode { id, result: Vec::new() })
                .await,
            Err(Error::NodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancel_session_distinguishes_outcomes() {
        let storage = MemoryStorage::new();

        assert!(matches!(
            storage.cancel_session(Uuid::new_v4()).await,
            Err(Error::SessionNotFound(_))
        ));

        let (session_id, root) = admit_root(&storage).await;
        storage.cancel_session(session_id).await.unwrap();
        assert!(storage.is_session_cancelled(session_id));
        assert!(storage.is_graph_cancelled(root));

        assert!(matches!(
            storage.cancel_session(session_id).await,
            Err(Error::SessionCancelled(_))
        ));

        let (finished_session, done) = admit_root(&storage).await;
        storage
            .complete_node(CompletedNode { id: done, result: Vec::new() })
            .await
            .unwrap();
        assert!(matches!(
            storage.cancel_session(finished_session).await,
            Err(Error::SessionFinished(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_session_rejects_start_and_admission() {
        let storage = MemoryStorage::new();
        let (session_id, root) = admit_root(&storage).await;
        storage.cancel_session(session_id).await.unwrap();

        assert!(matches!(
            storage.start_node(root).await,
            Err(Error::SessionCancelled(_))
        ));

        let id = Uuid::new_v4();
        let admission = storage
            .create_node(node(id, &[]), Some(graph(id, session_id)), None)
            .await;
        assert!(matches!(admission, Err(Error::SessionCancelled(_))));
    }

    #[tokio::test]
    async fn linked_graph_defers_completion() {
        let storage = MemoryStorage::new();
        let (session_id, first) = admit_root(&storage).await;
        let (spliced, _) = admit_dependent(&storage, session_id, &[]).await;
        let (sink, _) = admit_dependent(&storage, session_id, &[(first, true)]).await;

        // `first` defers its result to `spliced`.
        let fan_out = storage.link_graphs(first, spliced).await.unwrap();
        assert!(fan_out.is_empty());

        // Completing the splice completes the chain and releases the sink.
        let released = storage
            .complete_node(CompletedNode { id: spliced, result: b"9".to_vec() })
            .await
            .unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].id, sink);
        assert_eq!(storage.graph_result(first).unwrap(), b"9");
        assert_eq!(storage.graph_result(spliced).unwrap(), b"9");
    }

    #[tokio::test]
    async fn link_to_terminal_graph_propagates_immediately() {
        let storage = MemoryStorage::new();
        let (session_id, first) = admit_root(&storage).await;
        let (done, _) = admit_dependent(&storage, session_id, &[]).await;
        storage
            .complete_node(CompletedNode { id: done, result: b"done".to_vec() })
            .await
            .unwrap();

        let fan_out = storage.link_graphs(first, done).await.unwrap();
        assert!(fan_out.is_empty());
        assert_eq!(storage.graph_result(first).unwrap(), b"done");
    }

    #[tokio::test]
    async fn back_edge_is_single_write() {
        let storage = MemoryStorage::new();
        let (session_id, a) = admit_root(&storage).await;
        let (b, _) = admit_dependent(&storage, session_id, &[]).await;
        let (c, _) = admit_dependent(&storage, session_id, &[]).await;

        storage.link_graphs(a, b).await.unwrap();
        // Same link again is fine, a different dependent is not.
        storage.link_graphs(a, b).await.unwrap();
        assert!(matches!(
            storage.link_graphs(c, b).await,
            Err(Error::GraphLinked { .. })
        ));
    }

    #[tokio::test]
    async fn link_to_cancelled_graph_cancels_downstream() {
        let storage = MemoryStorage::new();
        let (session_id, root) = admit_root(&storage).await;
        let (sink, _) = admit_dependent(&storage, session_id, &[(root, true)]).await;

        let doomed = session();
        let doomed_session = doomed.id;
        let doomed_graph = Uuid::new_v4();
        storage
            .create_node(
                node(doomed_graph, &[]),
                Some(graph(doomed_graph, doomed_session)),
                Some(doomed),
            )
            .await
            .unwrap();
        storage.cancel_session(doomed_session).await.unwrap();

        let fan_out = storage.link_graphs(root, doomed_graph).await.unwrap();
        let cancelled: Vec<Uuid> = fan_out
            .into_iter()
            .map(|item| match item {
                FanOut::Cancelled(id) => id,
                other => panic!("expected cancellation, got {other:?}"),
            })
            .collect();
        assert!(cancelled.contains(&root));
        // The dependent node's graph goes down with it.
        assert!(cancelled.contains(&sink));
    }

    #[tokio::test]
    async fn resume_completes_a_graph_directly() {
        let storage = MemoryStorage::new();
        let (session_id, paused) = admit_root(&storage).await;
        let (sink, _) = admit_dependent(&storage, session_id, &[(paused, true)]).await;

        let fan_out = storage
            .mark_graph_completed(paused, b"resumed".to_vec())
            .await
            .unwrap();
        assert_eq!(fan_out, vec![FanOut::Ready(storage_ready(&storage, sink))]);

        let started = storage.start_node(sink).await.unwrap();
        assert_eq!(started.dependencies[&paused], b"resumed");
    }

    #[tokio::test]
    async fn resume_of_cancelled_graph_fails() {
        let storage = MemoryStorage::new();
        let (session_id, root) = admit_root(&storage).await;
        storage.cancel_session(session_id).await.unwrap();

        assert!(matches!(
            storage.mark_graph_completed(root, Vec::new()).await,
            Err(Error::SessionCancelled(_))
        ));
    }

    #[tokio::test]
    async fn splice_admission_finishes_the_parent() {
        let storage = MemoryStorage::new();
        let (session_id, parent) = admit_root(&storage).await;
        storage.start_node(parent).await.unwrap();

        let id = Uuid::new_v4();
        let mut spliced = node(id, &[]);
        spliced.parent_id = Some(parent);
        storage
            .create_node(spliced, Some(graph(id, session_id)), None)
            .await
            .unwrap();

        assert_eq!(storage.node_progress(parent), Some((true, true)));
    }

    fn storage_ready(storage: &MemoryStorage, id: Uuid) -> ReadyNode {
        let state = storage.state.lock();
        state.ready_node(id)
    }
}
