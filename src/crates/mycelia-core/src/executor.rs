//! Handler execution: registry, argument materialisation and outcomes
//!
//! A handler is an async function taking a [`RunContext`] and its decoded
//! positional arguments. Before it runs, the executor substitutes dependency
//! placeholders (codec tags 2 and 3) with the results of the corresponding
//! dependency graphs and validates the argument positions against the
//! node's declared parameters.
//!
//! A handler finishes in one of three ways, captured by [`Outcome`]:
//! completing its graph with a value, pausing until an external resume, or
//! returning another call to splice in. Pause is a distinguished variant,
//! not a sentinel value, so returning it anywhere but as the terminal
//! outcome is unrepresentable.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

use crate::call::{Node, NodeCall};
use crate::codec::{self, Value, TAG_DEPENDENCIES, TAG_DEPENDENCY};
use crate::entities::{InvokedNode, RunningNode};
use crate::error::{Error, Result};
use crate::params::ExecutorParams;

/// Terminal outcome of one handler invocation
pub enum Outcome {
    /// Complete the node's graph with this value
    Completed(Value),
    /// Stay started; the graph terminates via an external resume or a
    /// session cancellation
    Paused,
    /// Splice: the node's graph result is pinned to this call's graph result
    Call(NodeCall),
}

/// Future returned by a handler
pub type HandlerFuture = BoxFuture<'static, Result<Outcome>>;

/// A registered handler function
pub type Handler = Arc<dyn Fn(RunContext, Vec<Value>) -> HandlerFuture + Send + Sync>;

/// Orchestration hook handed to running handlers
///
/// The flag selects between admitting into the current session (`false`)
/// and starting a brand new session (`true`).
pub type InvokeFn = Arc<dyn Fn(Arc<InvokedNode>, bool) -> BoxFuture<'static, Result<Uuid>> + Send + Sync>;

/// What a handler knows about its own execution
#[derive(Clone)]
pub struct RunContext {
    pub session_id: Uuid,
    pub graph_id: Uuid,
    pub node_id: Uuid,
    invoke: InvokeFn,
}

impl RunContext {
    pub(crate) fn new(session_id: Uuid, graph_id: Uuid, node_id: Uuid, invoke: InvokeFn) -> Self {
        Self {
            session_id,
            graph_id,
            node_id,
            invoke,
        }
    }

    /// Admit a call into the current session as a background subgraph
    ///
    /// Returns the new graph's id. The call keeps its identity: submitting
    /// it here and later returning or depending on it will not admit it
    /// twice.
    pub async fn submit(&self, call: &NodeCall) -> Result<Uuid> {
        (self.invoke)(call.to_invoked()?, false).await?;
        Ok(call.id())
    }

    /// Start a completely separate session rooted at `call`
    pub async fn start_session(&self, call: &NodeCall) -> Result<Uuid> {
        (self.invoke)(call.to_invoked()?, true).await
    }
}

struct Registered {
    parameter_count: usize,
    handler: Handler,
}

/// The worker-side handler registry
#[derive(Default)]
pub struct Executor {
    handlers: RwLock<HashMap<String, Registered>>,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler behind a node descriptor
    pub fn register(&self, node: &Node, handler: Handler) {
        debug!(handler = node.handler(), "executor.register");
        self.handlers.write().insert(
            node.executor_params().handler.clone(),
            Registered {
                parameter_count: node.parameters().len(),
                handler,
            },
        );
    }

    /// Run a node's handler with materialised arguments
    pub async fn execute(
        &self,
        params: &ExecutorParams,
        node: RunningNode,
        invoke: InvokeFn,
    ) -> Result<Outcome> {
        let (handler, parameter_count) = {
            let handlers = self.handlers.read();
            let registered = handlers
                .get(&params.handler)
                .ok_or_else(|| Error::UnknownHandler(params.handler.clone()))?;
            (Arc::clone(&registered.handler), registered.parameter_count)
        };

        let arguments = materialise_arguments(
            &params.handler,
            parameter_count,
            &node.arguments,
            &node.dependencies,
        )?;

        let context = RunContext::new(node.session_id, node.graph_id, node.id, invoke);
        let future = handler(context, arguments);

        match params.timeout {
            Some(budget) => timeout(budget, future).await.map_err(|_| Error::Timeout {
                node: node.id,
                timeout: budget,
            })?,
            None => future.await,
        }
    }
}

/// Decode the argument map and substitute dependency references
fn materialise_arguments(
    handler: &str,
    parameter_count: usize,
    arguments: &[u8],
    dependencies: &HashMap<Uuid, Vec<u8>>,
) -> Result<Vec<Value>> {
    let entries = match codec::decode(arguments)? {
        Value::Map(entries) => entries,
        other => {
            return Err(Error::Codec(format!(
                "node arguments must be a map, got {other:?}"
            )))
        }
    };

    let mut materialised = vec![Value::Nil; parameter_count];
    for (key, value) in entries {
        let index = match key {
            Value::Int(index) if index >= 0 => index as usize,
            other => return Err(Error::Codec(format!("bad argument key: {other:?}"))),
        };
        if index >= parameter_count {
            return Err(Error::Arity {
                handler: handler.to_owned(),
                expected: parameter_count,
                index,
            });
        }
        materialised[index] = substitute(value, dependencies)?;
    }

    Ok(materialised)
}

fn substitute(value: Value, dependencies: &HashMap<Uuid, Vec<u8>>) -> Result<Value> {
    match &value {
        Value::Ext(TAG_DEPENDENCY, _) => {
            let id = value.as_dependency()?;
            codec::decode(lookup(dependencies, id)?)
        }
        Value::Ext(TAG_DEPENDENCIES, _) => {
            let results = value
                .as_dependencies()?
                .into_iter()
                .map(|id| codec::decode(lookup(dependencies, id)?))
                .collect::<Result<Vec<Value>>>()?;
            Ok(Value::Array(results))
        }
        _ => Ok(value),
    }
}

fn lookup(dependencies: &HashMap<Uuid, Vec<u8>>, id: Uuid) -> Result<&Vec<u8>> {
    dependencies.get(&id).ok_or_else(|| {
        Error::Storage(format!("missing result for dependency graph `{id}`"))
    })
}
