//! # mycelia-core — distributed task-graph scheduling engine
//!
//! Mycelia orchestrates directed acyclic graphs of work across a pool of
//! stateless workers. A *session* groups one or more *graphs*; each graph is
//! a DAG of *nodes* whose edges carry data or ordering dependencies. Clients
//! build a call DAG, the engine admits it atomically into storage, and
//! workers consume ready nodes from a broker, executing handlers and fanning
//! results out to dependents.
//!
//! ## Core concepts
//!
//! - **[`Node`] / [`NodeCall`]** — client-side builder. Calling a node binds
//!   arguments and mints an identity; using a call as an argument makes it a
//!   data dependency, [`group`] packs several results into one tuple
//!   argument, and [`NodeCall::then`] adds ordering-only edges. Reusing one
//!   call handle deduplicates: one id, one admission, one execution.
//! - **[`Interactor`]** — the state machine. Orchestrates admission
//!   (dependencies before dependents, session created exactly once),
//!   executes ready nodes racing a per-session cancellation event, and
//!   reconciles handler outcomes with storage.
//! - **[`Storage`]** — durable state with atomic admission and completion
//!   fan-out. [`MemoryStorage`] is the in-process reference; the
//!   `mycelia-postgres` crate provides the SQL backend.
//! - **[`Broker`]** — at-least-once pub/sub for "node ready" messages and
//!   "session cancelled" broadcasts. [`MemoryBroker`] is the in-process
//!   reference.
//! - **[`Worker`] / [`Client`]** — thin facades binding a handler registry
//!   and the subscriptions to the interactor.
//!
//! ## Handler outcomes
//!
//! A handler finishes by [`Outcome::Completed`] (its graph gets the value),
//! [`Outcome::Paused`] (the graph waits for [`Client::resume`]), or
//! [`Outcome::Call`] (splice: the graph's result is pinned to another
//! call's graph).
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mycelia_core::{
//!     Arg, Client, MemoryBroker, MemoryStorage, Node, Outcome, Value, Worker,
//! };
//!
//! # async fn run() -> mycelia_core::Result<()> {
//! let storage = Arc::new(MemoryStorage::new());
//! let broker = Arc::new(MemoryBroker::new());
//!
//! let double = Node::builder("double").parameters(["value"]).build();
//!
//! let worker = Worker::create(storage.clone(), broker.clone()).await?;
//! worker
//!     .serve(&double, |_context, arguments| async move {
//!         let Value::Int(value) = arguments[0] else {
//!             return Err(mycelia_core::Error::Handler("expected an int".into()));
//!         };
//!         Ok(Outcome::Completed(Value::Int(value * 2)))
//!     })
//!     .await?;
//!
//! let client = Client::new(storage.clone(), broker.clone());
//! let session_id = client.start_session(&double.call([Arg::from(21i64)])).await?;
//! # let _ = session_id;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod call;
pub mod codec;
pub mod entities;
pub mod error;
pub mod executor;
pub mod interactor;
pub mod params;
pub mod storage;
pub mod sync;
pub mod trace;

mod client;
mod worker;

pub use broker::{Broker, CancelCallback, MemoryBroker, NodeCallback, SubscriptionId};
pub use call::{group, Arg, Node, NodeBuilder, NodeCall, NodeCalls};
pub use client::Client;
pub use codec::Value;
pub use entities::{
    CompletedNode, CreatedGraph, CreatedNode, CreatedSession, EnqueuedNode, FanOut, InvokedNode,
    ReadyNode, RunningNode, StartedNode,
};
pub use error::{Error, Result};
pub use executor::{Executor, Handler, Outcome, RunContext};
pub use interactor::Interactor;
pub use params::{BrokerParams, ExecutorParams, StorageParams};
pub use storage::{MemoryStorage, Storage};
pub use trace::TraceContext;
pub use worker::Worker;
