//! The state machine gluing builder, storage, broker and executor together
//!
//! Orchestration (client side): flatten a call DAG, admit every node
//! dependency-first, create the session exactly once, publish the leaves.
//! Execution (worker side): race the per-session cancellation event against
//! the handler, then reconcile whatever the handler produced with storage.
//!
//! The interactor never retries: storage is the source of truth and its
//! fan-out is idempotent, so redelivery through the broker is always safe.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::broker::Broker;
use crate::call::NodeCall;
use crate::codec::{self, Value};
use crate::entities::{
    CompletedNode, CreatedGraph, CreatedNode, CreatedSession, EnqueuedNode, FanOut, InvokedNode,
    ReadyNode, RunningNode,
};
use crate::error::Result;
use crate::executor::{Executor, InvokeFn, Outcome};
use crate::params::{BrokerParams, ExecutorParams};
use crate::storage::Storage;
use crate::sync::{SessionLock, SubscriberEvent, ValueEvent};
use crate::trace::TraceContext;

type AdmissionMap = Arc<Mutex<HashMap<Uuid, Arc<ValueEvent<Uuid>>>>>;

/// State shared by every admission of one orchestration
///
/// The admission map is the dedup point: concurrent invocations of the same
/// call id agree on one admitting task, everyone else awaits its result.
#[derive(Clone)]
pub(crate) struct InvokeContext {
    session: Arc<SessionLock<Uuid>>,
    trace: TraceContext,
    admissions: AdmissionMap,
}

impl InvokeContext {
    /// A fresh orchestration that will create its own session
    fn new_session() -> Self {
        Self {
            session: Arc::new(SessionLock::new(Uuid::new_v4())),
            trace: TraceContext::root(),
            admissions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// An orchestration inside an existing session (worker side)
    fn in_session(session_id: Uuid, trace: TraceContext, admissions: AdmissionMap) -> Self {
        Self {
            session: Arc::new(SessionLock::used(session_id)),
            trace,
            admissions,
        }
    }
}

enum Claim {
    Admit(Arc<ValueEvent<Uuid>>),
    Wait(Arc<ValueEvent<Uuid>>),
}

/// The engine: one instance per client or worker process
pub struct Interactor {
    storage: Arc<dyn Storage>,
    broker: Arc<dyn Broker>,
    executor: Arc<Executor>,
    /// Per-session cancellation events, reference-counted by subscribers
    sessions: dashmap::DashMap<Uuid, Arc<SubscriberEvent>>,
}

impl Interactor {
    pub fn new(storage: Arc<dyn Storage>, broker: Arc<dyn Broker>, executor: Arc<Executor>) -> Self {
        Self {
            storage,
            broker,
            executor,
            sessions: dashmap::DashMap::new(),
        }
    }

    /// Orchestrate a call DAG from the client side; returns the session id
    pub async fn start_session(&self, call: &NodeCall) -> Result<Uuid> {
        let invoked = call.to_invoked()?;
        let context = InvokeContext::new_session();
        self.invoke(invoked, &context, None).await
    }

    /// Admit a flattened DAG, dependencies before dependents
    ///
    /// `parent` marks a splice: it is applied to the root admission only and
    /// finishes the returning node in the same storage batch.
    pub(crate) async fn invoke(
        &self,
        root: Arc<InvokedNode>,
        context: &InvokeContext,
        parent: Option<Uuid>,
    ) -> Result<Uuid> {
        for node in admission_order(&root) {
            let claim = {
                let mut admissions = context.admissions.lock();
                match admissions.get(&node.id) {
                    Some(event) => Claim::Wait(Arc::clone(event)),
                    None => {
                        let event = Arc::new(ValueEvent::new());
                        admissions.insert(node.id, Arc::clone(&event));
                        Claim::Admit(event)
                    }
                }
            };

            match claim {
                Claim::Wait(event) => {
                    event.wait().await?;
                }
                Claim::Admit(event) => {
                    let node_parent = (node.id == root.id).then_some(parent).flatten();
                    let span = info_span!(
                        "node.process",
                        id = %node.id,
                        handler = node.executor_params.handler.as_str(),
                    );
                    match self.admit(&node, context, node_parent).instrument(span).await {
                        Ok(session_id) => event.set(session_id),
                        Err(err) => {
                            // Propagate the abort to whoever awaits this id.
                            event.fail(err.to_string());
                            return Err(err);
                        }
                    }
                }
            }
        }

        Ok(*context.session.value())
    }

    /// Write one node (plus its graph, plus the session on first admission)
    /// and publish it when it is born ready
    async fn admit(
        &self,
        node: &InvokedNode,
        context: &InvokeContext,
        parent: Option<Uuid>,
    ) -> Result<Uuid> {
        let trace = context.trace.child();
        let trace_bytes = trace.to_bytes();

        let guard = context.session.acquire().await;
        let session_id = *context.session.value();

        let session = guard.first().then(|| CreatedSession {
            id: session_id,
            retention: node.storage_params.session_retention,
        });
        let graph = CreatedGraph {
            id: node.id,
            session_id,
            trace_context: trace_bytes.clone(),
        };
        let created = CreatedNode {
            id: node.id,
            parent_id: parent,
            graph_id: node.id,
            arguments: node.arguments.clone(),
            dependencies: node
                .dependencies
                .iter()
                .map(|(dependency, is_data)| (dependency.id, *is_data))
                .collect(),
            trace_context: trace_bytes.clone(),
            broker_params: node.broker_params.to_bytes()?,
            executor_params: node.executor_params.to_bytes()?,
        };

        let is_ready = self.storage.create_node(created, Some(graph), session).await?;
        drop(guard);
        debug!(id = %node.id, ready = is_ready, "node.created");

        if is_ready {
            self.broker
                .publish_node_enqueued(
                    &node.broker_params,
                    EnqueuedNode {
                        id: node.id,
                        session_id,
                        trace_context: trace_bytes,
                    },
                )
                .await?;
        }

        Ok(session_id)
    }

    /// Entry point for delivered node-ready messages
    ///
    /// Races the per-session cancellation event against the execution; a
    /// failure cancels the whole session, a cancellation just acknowledges.
    pub async fn on_node_enqueued(self: &Arc<Self>, node: EnqueuedNode) {
        let event = {
            let entry = self
                .sessions
                .entry(node.session_id)
                .or_insert_with(|| Arc::new(SubscriberEvent::new()));
            Arc::clone(entry.value())
        };
        event.subscribe();

        let result = tokio::select! {
            _ = event.wait() => {
                info!(id = %node.id, session_id = %node.session_id, "session.cancelled");
                Ok(())
            }
            result = self.execute_node(&node) => result,
        };

        event.unsubscribe();
        if event.subscriber_count() == 0 {
            self.sessions
                .remove_if(&node.session_id, |_, event| event.subscriber_count() == 0);
        }

        match result {
            Ok(()) => {}
            Err(err) if err.is_session_terminal() => {
                info!(id = %node.id, error = %err, "node.session_terminal");
            }
            Err(err) => {
                error!(id = %node.id, error = %err, "node.failed");
                if let Err(cancel_err) = self.cancel_session(node.session_id).await {
                    if !cancel_err.is_session_terminal() {
                        error!(
                            session_id = %node.session_id,
                            error = %cancel_err,
                            "session.cancel_failed",
                        );
                    }
                }
            }
        }
    }

    async fn execute_node(self: &Arc<Self>, enqueued: &EnqueuedNode) -> Result<()> {
        let started = self.storage.start_node(enqueued.id).await?;
        let params = ExecutorParams::from_bytes(&started.executor_params)?;
        let graph_trace = TraceContext::from_bytes(&started.graph_trace_context)?
            .unwrap_or_else(TraceContext::root);

        // Calls submitted during execution and the final splice share one
        // dedup map, so a call submitted in the background and then returned
        // is still admitted exactly once.
        let admissions: AdmissionMap = Arc::new(Mutex::new(HashMap::new()));
        let invoke: InvokeFn = {
            let interactor = Arc::clone(self);
            let session_id = enqueued.session_id;
            let admissions = Arc::clone(&admissions);
            Arc::new(move |invoked, new_session| {
                let interactor = Arc::clone(&interactor);
                let context = if new_session {
                    InvokeContext::new_session()
                } else {
                    InvokeContext::in_session(session_id, graph_trace, Arc::clone(&admissions))
                };
                Box::pin(async move { interactor.invoke(invoked, &context, None).await })
            })
        };

        let running = RunningNode {
            id: started.id,
            graph_id: started.graph_id,
            session_id: enqueued.session_id,
            arguments: started.arguments.clone(),
            dependencies: started.dependencies.clone(),
        };

        let span = info_span!("node.execute", id = %enqueued.id, handler = params.handler.as_str());
        let outcome = self
            .executor
            .execute(&params, running, invoke)
            .instrument(span)
            .await?;

        match outcome {
            Outcome::Paused => {
                info!(id = %enqueued.id, "node.paused");
            }
            Outcome::Completed(value) => {
                self.complete_node(CompletedNode {
                    id: enqueued.id,
                    result: codec::encode(&value)?,
                })
                .await?;
            }
            Outcome::Call(call) => {
                let invoked = call.to_invoked()?;
                let target = invoked.id;
                let context =
                    InvokeContext::in_session(enqueued.session_id, graph_trace, admissions);
                self.invoke(invoked, &context, Some(enqueued.id)).await?;
                if target != started.graph_id {
                    let fan_out = self.storage.link_graphs(started.graph_id, target).await?;
                    self.publish_fan_out(fan_out).await?;
                }
            }
        }

        Ok(())
    }

    /// Finish a node and release whatever its graph's completion unblocks
    pub async fn complete_node(&self, node: CompletedNode) -> Result<()> {
        let id = node.id;
        let ready = self.storage.complete_node(node).await?;
        for ready_node in ready {
            self.publish_ready(ready_node).await?;
        }
        info!(id = %id, "node.completed");
        Ok(())
    }

    /// Cancel a session in storage and broadcast it to every worker
    pub async fn cancel_session(&self, id: Uuid) -> Result<()> {
        let (storage_result, broker_result) = tokio::join!(
            self.storage.cancel_session(id),
            self.broker.publish_session_cancelled(id),
        );
        storage_result?;
        broker_result?;
        info!(id = %id, "session.cancelled");
        Ok(())
    }

    /// React to a session-cancelled broadcast
    pub async fn on_session_cancelled(&self, id: Uuid) {
        if let Some(event) = self.sessions.get(&id) {
            event.set();
        }
    }

    /// Complete a paused graph with an externally supplied value
    pub async fn resume(&self, graph_id: Uuid, value: &Value) -> Result<()> {
        let fan_out = self
            .storage
            .mark_graph_completed(graph_id, codec::encode(value)?)
            .await?;
        self.publish_fan_out(fan_out).await?;
        info!(id = %graph_id, "graph.resumed");
        Ok(())
    }

    async fn publish_fan_out(&self, fan_out: Vec<FanOut>) -> Result<()> {
        for item in fan_out {
            match item {
                FanOut::Ready(ready) => self.publish_ready(ready).await?,
                FanOut::Cancelled(graph_id) => {
                    warn!(id = %graph_id, "graph.cancelled");
                }
            }
        }
        Ok(())
    }

    async fn publish_ready(&self, ready: ReadyNode) -> Result<()> {
        let params = BrokerParams::from_bytes(&ready.broker_params)?;
        self.broker
            .publish_node_enqueued(
                &params,
                EnqueuedNode {
                    id: ready.id,
                    session_id: ready.session_id,
                    trace_context: ready.trace_context,
                },
            )
            .await
    }
}

/// Dependency-first admission order over a flattened DAG
fn admission_order(root: &Arc<InvokedNode>) -> Vec<Arc<InvokedNode>> {
    let mut order = Vec::new();
    let mut seen: HashSet<Uuid> = HashSet::new();
    let mut stack = vec![(Arc::clone(root), false)];

    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            order.push(node);
            continue;
        }
        if !seen.insert(node.id) {
            continue;
        }
        stack.push((Arc::clone(&node), true));
        for (dependency, _) in &node.dependencies {
            if !seen.contains(&dependency.id) {
                stack.push((Arc::clone(dependency), false));
            }
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{Arg, Node};
    use crate::params::StorageParams;

    fn invoked(id: Uuid, dependencies: Vec<(Arc<InvokedNode>, bool)>) -> Arc<InvokedNode> {
        Arc::new(InvokedNode {
            id,
            arguments: codec::encode(&Value::Map(Vec::new())).unwrap(),
            dependencies,
            storage_params: StorageParams::default(),
            broker_params: BrokerParams::new("queue"),
            executor_params: ExecutorParams::new("handler"),
        })
    }

    #[test]
    fn admission_order_is_dependency_first() {
        let leaf_a = invoked(Uuid::new_v4(), Vec::new());
        let leaf_b = invoked(Uuid::new_v4(), Vec::new());
        let middle = invoked(
            Uuid::new_v4(),
            vec![(Arc::clone(&leaf_a), true), (Arc::clone(&leaf_b), false)],
        );
        let root = invoked(
            Uuid::new_v4(),
            vec![(Arc::clone(&middle), true), (Arc::clone(&leaf_a), true)],
        );

        let order = admission_order(&root);
        let positions: HashMap<Uuid, usize> = order
            .iter()
            .enumerate()
            .map(|(position, node)| (node.id, position))
            .collect();

        assert_eq!(order.len(), 4);
        assert!(positions[&leaf_a.id] < positions[&middle.id]);
        assert!(positions[&leaf_b.id] < positions[&middle.id]);
        assert!(positions[&middle.id] < positions[&root.id]);
        assert_eq!(positions[&root.id], 3);
    }

    #[test]
    fn admission_order_deduplicates_shared_nodes() {
        let shared = invoked(Uuid::new_v4(), Vec::new());
        let left = invoked(Uuid::new_v4(), vec![(Arc::clone(&shared), true)]);
        let right = invoked(Uuid::new_v4(), vec![(Arc::clone(&shared), true)]);
        let root = invoked(Uuid::new_v4(), vec![(left, true), (right, true)]);

        let order = admission_order(&root);
        assert_eq!(order.len(), 4);
        assert_eq!(order.iter().filter(|node| node.id == shared.id).count(), 1);
    }

    #[tokio::test]
    async fn start_session_admits_the_whole_tree() {
        let storage = Arc::new(crate::storage::MemoryStorage::new());
        let broker = Arc::new(crate::broker::MemoryBroker::new());
        let interactor = Interactor::new(
            Arc::clone(&storage) as Arc<dyn Storage>,
            broker,
            Arc::new(Executor::new()),
        );

        let rand = Node::builder("rand").parameters(["minimum", "maximum"]).build();
        let sum = Node::builder("sum").parameters(["left", "right"]).build();
        let left = rand.call([Arg::from(0i64), Arg::from(10i64)]);
        let right = rand.call([Arg::from(0i64), Arg::from(10i64)]);
        let call = sum.call([Arg::from(&left), Arg::from(&right)]);

        interactor.start_session(&call).await.unwrap();

        assert_eq!(storage.node_count(), 3);
        assert_eq!(storage.pending_dependency_count(call.id()), Some(2));
        assert_eq!(storage.pending_dependency_count(left.id()), Some(0));
    }
}
