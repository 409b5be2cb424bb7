//! Client-side call graph construction
//!
//! A [`Node`] describes a handler; calling it yields a [`NodeCall`] — one
//! future node execution with a fresh id. Calls compose into a DAG three
//! ways:
//!
//! - using a call as an argument value makes it a *data* dependency whose
//!   graph result feeds that argument position,
//! - [`group`] collects several calls into one positional tuple argument,
//! - [`NodeCall::then`] adds pure *ordering* dependencies.
//!
//! Reusing one `NodeCall` handle in several positions deduplicates: the same
//! builder id admits once and executes once, however many argument slots
//! reference it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::codec::{self, Value};
use crate::entities::InvokedNode;
use crate::error::{Error, Result};
use crate::params::{BrokerParams, ExecutorParams, StorageParams};

struct NodeInner {
    handler: String,
    parameters: Vec<String>,
    storage_params: StorageParams,
    broker_params: BrokerParams,
    executor_params: ExecutorParams,
}

/// A handler descriptor: registry key, declared parameters and the
/// storage/broker/executor templates stamped onto every call
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn builder(handler: impl Into<String>) -> NodeBuilder {
        NodeBuilder {
            handler: handler.into(),
            parameters: Vec::new(),
            queue: None,
            priority: None,
            timeout: None,
            storage_params: StorageParams::default(),
        }
    }

    pub fn handler(&self) -> &str {
        &self.inner.handler
    }

    pub fn parameters(&self) -> &[String] {
        &self.inner.parameters
    }

    pub fn storage_params(&self) -> &StorageParams {
        &self.inner.storage_params
    }

    pub fn broker_params(&self) -> &BrokerParams {
        &self.inner.broker_params
    }

    pub fn executor_params(&self) -> &ExecutorParams {
        &self.inner.executor_params
    }

    /// Bind arguments, producing a call with a fresh id
    pub fn call<I>(&self, arguments: I) -> NodeCall
    where
        I: IntoIterator<Item = Arg>,
    {
        NodeCall {
            inner: Arc::new(CallInner {
                id: Uuid::new_v4(),
                node: self.clone(),
                arguments: arguments.into_iter().collect(),
                dependencies: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("handler", &self.inner.handler)
            .field("parameters", &self.inner.parameters)
            .finish()
    }
}

/// Builder for [`Node`]
pub struct NodeBuilder {
    handler: String,
    parameters: Vec<String>,
    queue: Option<String>,
    priority: Option<u8>,
    timeout: Option<Duration>,
    storage_params: StorageParams,
}

impl NodeBuilder {
    /// Declare the handler's parameter names, in positional order
    pub fn parameters<I, S>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameters = parameters.into_iter().map(Into::into).collect();
        self
    }

    /// Route ready messages to this queue instead of the handler name
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Per-queue priority hint
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Wall-clock budget for one handler invocation
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Keep the session row this long after it terminates
    pub fn session_retention(mut self, retention: Duration) -> Self {
        self.storage_params.session_retention = Some(retention);
        self
    }

    pub fn build(self) -> Node {
        let queue = self.queue.unwrap_or_else(|| self.handler.clone());
        Node {
            inner: Arc::new(NodeInner {
                broker_params: BrokerParams {
                    queue,
                    priority: self.priority,
                },
                executor_params: ExecutorParams {
                    handler: self.handler.clone(),
                    timeout: self.timeout,
                },
                storage_params: self.storage_params,
                handler: self.handler,
                parameters: self.parameters,
            }),
        }
    }
}

/// One argument slot of a call
#[derive(Clone)]
pub enum Arg {
    /// A literal value, carried through the codec verbatim
    Value(Value),
    /// Another call; its graph result feeds this slot
    Call(NodeCall),
    /// Several calls collected into one positional tuple
    Group(NodeCalls),
}

macro_rules! arg_from_value {
    ($($source:ty),* $(,)?) => {
        $(
            impl From<$source> for Arg {
                fn from(value: $source) -> Self {
                    Arg::Value(value.into())
                }
            }
        )*
    };
}

arg_from_value!((), bool, i32, i64, f64, &str, String, Vec<u8>, Uuid, Duration, Value);

impl From<NodeCall> for Arg {
    fn from(call: NodeCall) -> Self {
        Arg::Call(call)
    }
}

impl From<&NodeCall> for Arg {
    fn from(call: &NodeCall) -> Self {
        Arg::Call(call.clone())
    }
}

impl From<NodeCalls> for Arg {
    fn from(calls: NodeCalls) -> Self {
        Arg::Group(calls)
    }
}

impl From<&NodeCalls> for Arg {
    fn from(calls: &NodeCalls) -> Self {
        Arg::Group(calls.clone())
    }
}

struct CallInner {
    id: Uuid,
    node: Node,
    arguments: Vec<Arg>,
    /// Ordering-only dependencies recorded by `then`
    dependencies: Mutex<Vec<NodeCall>>,
}

/// One future node execution
///
/// Cheap to clone; clones share the same identity, which is what makes
/// reuse-as-deduplication work.
#[derive(Clone)]
pub struct NodeCall {
    inner: Arc<CallInner>,
}

impl NodeCall {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn node(&self) -> &Node {
        &self.inner.node
    }

    /// Run `calls` after this one, without feeding them data
    ///
    /// Returns the tail of the chain so `a.then([b]).then([c])` reads in
    /// execution order. With no targets the tail is the call itself.
    pub fn then<I>(&self, calls: I) -> NodeCalls
    where
        I: IntoIterator<Item = NodeCall>,
    {
        let calls: Vec<NodeCall> = calls.into_iter().collect();
        if calls.is_empty() {
            return NodeCalls {
                calls: vec![self.clone()],
            };
        }
        for call in &calls {
            call.add_dependency(self);
        }
        NodeCalls { calls }
    }

    fn add_dependency(&self, dependency: &NodeCall) {
        let mut dependencies = self.inner.dependencies.lock();
        if !dependencies.iter().any(|call| call.id() == dependency.id()) {
            dependencies.push(dependency.clone());
        }
    }

    fn referenced_calls(&self) -> Vec<NodeCall> {
        let mut calls: Vec<NodeCall> = self.inner.dependencies.lock().clone();
        for argument in &self.inner.arguments {
            match argument {
                Arg::Value(_) => {}
                Arg::Call(call) => calls.push(call.clone()),
                Arg::Group(group) => calls.extend(group.calls.iter().cloned()),
            }
        }
        calls
    }

    /// Flatten the call DAG into admission-ready [`InvokedNode`]s
    ///
    /// Dependency-first, deduplicated by call id. A call graph that loops
    /// back on itself is rejected instead of admitted half-way.
    pub fn to_invoked(&self) -> Result<Arc<InvokedNode>> {
        enum Phase {
            Enter(NodeCall),
            Exit(NodeCall),
        }

        let mut done: HashMap<Uuid, Arc<InvokedNode>> = HashMap::new();
        let mut visiting: HashSet<Uuid> = HashSet::new();
        let mut stack = vec![Phase::Enter(self.clone())];

        while let Some(phase) = stack.pop() {
            match phase {
                Phase::Enter(call) => {
                    if done.contains_key(&call.id()) {
                        continue;
                    }
                    if !visiting.insert(call.id()) {
                        return Err(cycle_error(&call));
                    }
                    let children = call.referenced_calls();
                    stack.push(Phase::Exit(call));
                    for child in children {
                        if done.contains_key(&child.id()) {
                            continue;
                        }
                        if visiting.contains(&child.id()) {
                            return Err(cycle_error(&child));
                        }
                        stack.push(Phase::Enter(child));
                    }
                }
                Phase::Exit(call) => {
                    visiting.remove(&call.id());
                    let invoked = call.build_invoked(&done)?;
                    done.insert(call.id(), Arc::new(invoked));
                }
            }
        }

        Ok(done
            .remove(&self.id())
            .expect("root call is flattened last"))
    }

    fn build_invoked(&self, done: &HashMap<Uuid, Arc<InvokedNode>>) -> Result<InvokedNode> {
        // Data wins when a call appears both as an argument and via `then`.
        let mut dependencies: BTreeMap<Uuid, (Arc<InvokedNode>, bool)> = BTreeMap::new();
        for dependency in self.inner.dependencies.lock().iter() {
            dependencies
                .entry(dependency.id())
                .or_insert_with(|| (Arc::clone(&done[&dependency.id()]), false));
        }

        let mut entries = Vec::with_capacity(self.inner.arguments.len());
        for (index, argument) in self.inner.arguments.iter().enumerate() {
            let value = match argument {
                Arg::Value(value) => value.clone(),
                Arg::Call(call) => {
                    dependencies.insert(call.id(), (Arc::clone(&done[&call.id()]), true));
                    Value::dependency(call.id())
                }
                Arg::Group(group) => {
                    let ids: Vec<Uuid> = group.calls.iter().map(NodeCall::id).collect();
                    for call in &group.calls {
                        dependencies.insert(call.id(), (Arc::clone(&done[&call.id()]), true));
                    }
                    Value::dependencies(&ids)
                }
            };
            entries.push((Value::Int(index as i64), value));
        }

        Ok(InvokedNode {
            id: self.id(),
            arguments: codec::encode(&Value::Map(entries))?,
            dependencies: dependencies.into_values().collect(),
            storage_params: self.inner.node.storage_params().clone(),
            broker_params: self.inner.node.broker_params().clone(),
            executor_params: self.inner.node.executor_params().clone(),
        })
    }
}

impl PartialEq for NodeCall {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for NodeCall {}

impl std::fmt::Debug for NodeCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCall")
            .field("id", &self.inner.id)
            .field("handler", &self.inner.node.handler())
            .finish()
    }
}

/// Several calls treated as one unit, as produced by [`group`] and `then`
#[derive(Clone)]
pub struct NodeCalls {
    calls: Vec<NodeCall>,
}

impl NodeCalls {
    pub fn calls(&self) -> &[NodeCall] {
        &self.calls
    }

    /// Run `calls` after every member of this group
    pub fn then<I>(&self, calls: I) -> NodeCalls
    where
        I: IntoIterator<Item = NodeCall>,
    {
        let calls: Vec<NodeCall> = calls.into_iter().collect();
        if calls.is_empty() {
            return self.clone();
        }
        for call in &calls {
            for dependency in &self.calls {
                call.add_dependency(dependency);
            }
        }
        NodeCalls { calls }
    }
}

impl IntoIterator for NodeCalls {
    type Item = NodeCall;
    type IntoIter = std::vec::IntoIter<NodeCall>;

    fn into_iter(self) -> Self::IntoIter {
        self.calls.into_iter()
    }
}

/// Collect calls so they can be passed as a single tuple argument
pub fn group<I>(calls: I) -> NodeCalls
where
    I: IntoIterator<Item = NodeCall>,
{
    NodeCalls {
        calls: calls.into_iter().collect(),
    }
}

fn cycle_error(call: &NodeCall) -> Error {
    Error::Orchestration(format!(
        "call `{}` ({}) participates in a dependency cycle",
        call.id(),
        call.node().handler()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{TAG_DEPENDENCIES, TAG_DEPENDENCY};

    fn test_node(handler: &str, parameters: &[&str]) -> Node {
        Node::builder(handler).parameters(parameters.to_vec()).build()
    }

    fn decoded_arguments(invoked: &InvokedNode) -> Vec<(i64, Value)> {
        match codec::decode(&invoked.arguments).unwrap() {
            Value::Map(entries) => entries
                .into_iter()
                .map(|(key, value)| match key {
                    Value::Int(index) => (index, value),
                    other => panic!("non-index key {other:?}"),
                })
                .collect(),
            other => panic!("arguments are not a map: {other:?}"),
        }
    }

    #[test]
    fn literal_arguments_pass_through() {
        let node = test_node("rand", &["minimum", "maximum"]);
        let call = node.call([Arg::from(0i64), Arg::from(10i64)]);
        let invoked = call.to_invoked().unwrap();

        assert_eq!(invoked.id, call.id());
        assert!(invoked.dependencies.is_empty());
        assert_eq!(
            decoded_arguments(&invoked),
            vec![(0, Value::Int(0)), (1, Value::Int(10))]
        );
    }

    #[test]
    fn call_arguments_become_data_dependencies() {
        let rand = test_node("rand", &["minimum", "maximum"]);
        let sum = test_node("sum", &["left", "right"]);

        let left = rand.call([Arg::from(0i64), Arg::from(10i64)]);
        let right = rand.call([Arg::from(0i64), Arg::from(10i64)]);
        let call = sum.call([Arg::from(&left), Arg::from(&right)]);

        let invoked = call.to_invoked().unwrap();
        assert_eq!(invoked.dependencies.len(), 2);
        assert!(invoked.dependencies.iter().all(|(_, is_data)| *is_data));

        let arguments = decoded_arguments(&invoked);
        assert!(matches!(arguments[0].1, Value::Ext(TAG_DEPENDENCY, _)));
        assert_eq!(arguments[0].1.as_dependency().unwrap(), left.id());
        assert_eq!(arguments[1].1.as_dependency().unwrap(), right.id());
    }

    #[test]
    fn reused_call_is_a_single_dependency() {
        let rand = test_node("rand", &["minimum", "maximum"]);
        let sum = test_node("sum", &["a", "b", "c"]);

        let value = rand.call([Arg::from(0i64), Arg::from(10i64)]);
        let call = sum.call([Arg::from(&value), Arg::from(&value), Arg::from(&value)]);

        let invoked = call.to_invoked().unwrap();
        assert_eq!(invoked.dependencies.len(), 1);

        let arguments = decoded_arguments(&invoked);
        assert_eq!(arguments.len(), 3);
        for (_, argument) in arguments {
            assert_eq!(argument.as_dependency().unwrap(), value.id());
        }
    }

    #[test]
    fn group_packs_ids_in_order() {
        let rand = test_node("rand", &["minimum", "maximum"]);
        let report = test_node("report", &["numbers"]);

        let members: Vec<NodeCall> = (0..3)
            .map(|_| rand.call([Arg::from(0i64), Arg::from(10i64)]))
            .collect();
        let ids: Vec<Uuid> = members.iter().map(NodeCall::id).collect();
        let call = report.call([Arg::from(group(members))]);

        let invoked = call.to_invoked().unwrap();
        assert_eq!(invoked.dependencies.len(), 3);

        let arguments = decoded_arguments(&invoked);
        assert!(matches!(arguments[0].1, Value::Ext(TAG_DEPENDENCIES, _)));
        assert_eq!(arguments[0].1.as_dependencies().unwrap(), ids);
    }

    #[test]
    fn then_records_ordering_dependencies() {
        let step = test_node("step", &[]);

        let first = step.call([]);
        let second = step.call([]);
        let third = step.call([]);
        first.then([second.clone()]).then([third.clone()]);

        let invoked = third.to_invoked().unwrap();
        assert_eq!(invoked.dependencies.len(), 1);
        let (dependency, is_data) = &invoked.dependencies[0];
        assert_eq!(dependency.id, second.id());
        assert!(!is_data);

        let second_invoked = second.to_invoked().unwrap();
        assert_eq!(second_invoked.dependencies.len(), 1);
        assert_eq!(second_invoked.dependencies[0].0.id, first.id());
    }

    #[test]
    fn then_with_no_targets_is_identity() {
        let step = test_node("step", &[]);
        let call = step.call([]);
        let tail = call.then([]);
        assert_eq!(tail.calls().len(), 1);
        assert_eq!(tail.calls()[0], call);
        assert!(call.to_invoked().unwrap().dependencies.is_empty());
    }

    #[test]
    fn data_dependency_wins_over_ordering() {
        let rand = test_node("rand", &["minimum", "maximum"]);
        let sink = test_node("sink", &["value"]);

        let value = rand.call([Arg::from(0i64), Arg::from(10i64)]);
        let call = sink.call([Arg::from(&value)]);
        value.then([call.clone()]);

        let invoked = call.to_invoked().unwrap();
        assert_eq!(invoked.dependencies.len(), 1);
        assert!(invoked.dependencies[0].1);
    }

    #[test]
    fn shared_subtrees_flatten_once() {
        let rand = test_node("rand", &["minimum", "maximum"]);
        let sum = test_node("sum", &["left", "right"]);

        let shared = rand.call([Arg::from(0i64), Arg::from(10i64)]);
        let left = sum.call([Arg::from(&shared), Arg::from(1i64)]);
        let right = sum.call([Arg::from(&shared), Arg::from(2i64)]);
        let root = sum.call([Arg::from(&left), Arg::from(&right)]);

        let invoked = root.to_invoked().unwrap();
        let left_invoked = invoked
            .dependencies
            .iter()
            .find(|(node, _)| node.id == left.id())
            .unwrap();
        let right_invoked = invoked
            .dependencies
            .iter()
            .find(|(node, _)| node.id == right.id())
            .unwrap();

        let shared_from_left = left_invoked
            .0
            .dependencies
            .iter()
            .find(|(node, _)| node.id == shared.id())
            .unwrap();
        let shared_from_right = right_invoked
            .0
            .dependencies
            .iter()
            .find(|(node, _)| node.id == shared.id())
            .unwrap();
        assert!(Arc::ptr_eq(&shared_from_left.0, &shared_from_right.0));
    }

    #[test]
    fn cycles_are_rejected() {
        let step = test_node("step", &[]);
        let a = step.call([]);
        let b = step.call([]);
        a.then([b.clone()]);
        b.then([a.clone()]);

        assert!(matches!(a.to_invoked(), Err(Error::Orchestration(_))));
    }
}
