//! Per-node parameter templates for the storage, broker and executor
//!
//! Parameters ride along with every node row as opaque bytes, so a worker
//! that picks a node up can reconstruct how to route and run it without any
//! shared configuration. They serialize as positional maps keyed by field
//! declaration index, omitting fields left at their defaults.

use std::time::Duration;

use crate::codec::{self, Value};
use crate::error::{Error, Result};

/// Default session retention: one week
pub const DEFAULT_SESSION_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Storage-facing parameters of a node
#[derive(Debug, Clone, PartialEq)]
pub struct StorageParams {
    /// How long the session row is kept after it terminates
    pub session_retention: Option<Duration>,
}

impl Default for StorageParams {
    fn default() -> Self {
        Self {
            session_retention: Some(DEFAULT_SESSION_RETENTION),
        }
    }
}

impl StorageParams {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut fields = Vec::new();
        if self.session_retention != Self::default().session_retention {
            let value = match self.session_retention {
                Some(retention) => Value::duration(retention),
                None => Value::Nil,
            };
            fields.push((Value::Int(0), value));
        }
        encode_fields(fields)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut params = Self::default();
        for (index, value) in decode_fields(bytes)? {
            match index {
                0 => {
                    params.session_retention = match value {
                        Value::Nil => None,
                        value => Some(value.as_duration()?),
                    }
                }
                other => return Err(unknown_field("storage", other)),
            }
        }
        Ok(params)
    }
}

/// Broker-facing parameters of a node
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerParams {
    /// Queue the node's "ready" message is routed to
    pub queue: String,
    /// Optional per-queue priority hint
    pub priority: Option<u8>,
}

impl BrokerParams {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            priority: None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut fields = vec![(Value::Int(0), Value::Str(self.queue.clone()))];
        if let Some(priority) = self.priority {
            fields.push((Value::Int(1), Value::Int(i64::from(priority))));
        }
        encode_fields(fields)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut queue = None;
        let mut priority = None;
        for (index, value) in decode_fields(bytes)? {
            match (index, value) {
                (0, Value::Str(name)) => queue = Some(name),
                (1, Value::Int(value)) => {
                    priority = Some(
                        u8::try_from(value)
                            .map_err(|_| Error::Codec(format!("priority out of range: {value}")))?,
                    );
                }
                (index, value) => {
                    return Err(Error::Codec(format!(
                        "unexpected broker params field {index}: {value:?}"
                    )))
                }
            }
        }
        Ok(Self {
            queue: queue.ok_or_else(|| Error::Codec("broker params missing queue".into()))?,
            priority,
        })
    }
}

/// Executor-facing parameters of a node
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorParams {
    /// Handler registry key
    pub handler: String,
    /// Optional wall-clock budget for one handler invocation
    pub timeout: Option<Duration>,
}

impl ExecutorParams {
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            timeout: None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut fields = vec![(Value::Int(0), Value::Str(self.handler.clone()))];
        if let Some(timeout) = self.timeout {
            fields.push((Value::Int(1), Value::duration(timeout)));
        }
        encode_fields(fields)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut handler = None;
        let mut timeout = None;
        for (index, value) in decode_fields(bytes)? {
            match (index, value) {
                (0, Value::Str(name)) => handler = Some(name),
                (1, value) => timeout = Some(value.as_duration()?),
                (index, value) => {
                    return Err(Error::Codec(format!(
                        "unexpected executor params field {index}: {value:?}"
                    )))
                }
            }
        }
        Ok(Self {
            handler: handler.ok_or_else(|| Error::Codec("executor params missing handler".into()))?,
            timeout,
        })
    }
}

fn encode_fields(fields: Vec<(Value, Value)>) -> Result<Vec<u8>> {
    if fields.is_empty() {
        return Ok(Vec::new());
    }
    codec::encode(&Value::Map(fields))
}

fn decode_fields(bytes: &[u8]) -> Result<Vec<(i64, Value)>> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }

    match codec::decode(bytes)? {
        Value::Map(entries) => entries
            .into_iter()
            .map(|(key, value)| match key {
                Value::Int(index) => Ok((index, value)),
                other => Err(Error::Codec(format!("non-index params key: {other:?}"))),
            })
            .collect(),
        other => Err(Error::Codec(format!("params must be a map, got {other:?}"))),
    }
}

fn unknown_field(kind: &str, index: i64) -> Error {
    Error::Codec(format!("unknown {kind} params field {index}"))
}
