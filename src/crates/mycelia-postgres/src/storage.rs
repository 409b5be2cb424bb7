use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::types::PgInterval;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use mycelia_core::entities::{
    CompletedNode, CreatedGraph, CreatedNode, CreatedSession, FanOut, ReadyNode, StartedNode,
};
use mycelia_core::{Error, Result, Storage};

/// PostgreSQL-backed [`Storage`]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connect with a small default pool
    pub async fn connect(url: &str) -> Result<Self> {
        debug!("connecting to postgres");
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(storage_error)?;
        info!("postgres storage connected");
        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded migrations
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|error| Error::Storage(format!("migration failed: {error}")))?;
        info!("postgres migrations applied");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.pool.close().await;
    }
}

fn storage_error(error: sqlx::Error) -> Error {
    Error::Storage(error.to_string())
}

/// True when a server-side function raised the given marker
fn raised(error: &sqlx::Error, marker: &str) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.message().contains(marker))
}

fn to_interval(duration: Duration) -> PgInterval {
    PgInterval {
        months: 0,
        days: 0,
        microseconds: duration.as_micros() as i64,
    }
}

fn ready_node(row: &PgRow) -> Result<ReadyNode> {
    Ok(ReadyNode {
        id: row.try_get("id").map_err(storage_error)?,
        session_id: row.try_get("session_id").map_err(storage_error)?,
        trace_context: row.try_get("trace_context").map_err(storage_error)?,
        broker_params: row.try_get("broker_params").map_err(storage_error)?,
    })
}

const SELECT_COMPLETE_NODE: &str = "\
SELECT id, trace_context, broker_params, session_id \
FROM mycelia.complete_node($1, $2, $3)";

const SELECT_COMPLETE_GRAPH: &str = "\
SELECT id, trace_context, broker_params, session_id \
FROM mycelia.complete_graph($1, $2)";

const CANCEL_GRAPHS: &str = "\
WITH RECURSIVE doomed AS (
    SELECT $1::uuid AS id
    UNION
    SELECT targets.id
    FROM doomed
    JOIN mycelia.graphs AS source
        ON source.id = doomed.id
        AND source.result IS NULL
        AND source.cancelled_at IS NULL
    JOIN LATERAL (
        SELECT graphs.dependent_graph_id AS id
        FROM mycelia.graphs AS graphs
        WHERE graphs.id = doomed.id AND graphs.dependent_graph_id IS NOT NULL
        UNION
        SELECT nodes.graph_id AS id
        FROM mycelia.dependencies AS dependencies
        JOIN mycelia.nodes AS nodes ON nodes.id = dependencies.node_id
        WHERE dependencies.graph_id = doomed.id
    ) AS targets ON TRUE
)
UPDATE mycelia.graphs
SET cancelled_at = now()
WHERE mycelia.graphs.id IN (SELECT doomed.id FROM doomed)
    AND mycelia.graphs.result IS NULL
    AND mycelia.graphs.cancelled_at IS NULL
RETURNING mycelia.graphs.id";

#[async_trait]
impl Storage for PostgresStorage {
    async fn create_node(
        &self,
        node: CreatedNode,
        graph: Option<CreatedGraph>,
        session: Option<CreatedSession>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        let created_session_id = session.as_ref().map(|session| session.id);

        if let Some(session) = session {
            sqlx::query(
                "INSERT INTO mycelia.sessions (id, retention, cancelled_at) VALUES ($1, $2, NULL)",
            )
            .bind(session.id)
            .bind(session.retention.map(to_interval))
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;
        }

        if let Some(graph) = &graph {
            if created_session_id != Some(graph.session_id) {
                let row = sqlx::query("SELECT cancelled_at FROM mycelia.sessions WHERE id = $1")
                    .bind(graph.session_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(storage_error)?;
                let Some(row) = row else {
                    return Err(Error::SessionNotFound(graph.session_id));
                };
                let cancelled_at: Option<DateTime<Utc>> =
                    row.try_get("cancelled_at").map_err(storage_error)?;
                if cancelled_at.is_some() {
                    return Err(Error::SessionCancelled(graph.session_id));
                }
            }

            sqlx::query(
                "INSERT INTO mycelia.graphs \
                 (id, session_id, trace_context, result, cancelled_at, dependent_graph_id) \
                 VALUES ($1, $2, $3, NULL, NULL, NULL)",
            )
            .bind(graph.id)
            .bind(graph.session_id)
            .bind(&graph.trace_context)
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;
        }

        let mut pending: i64 = 0;
        if !node.dependencies.is_empty() {
            // BTreeMap keys come out ascending, which fixes the lock order.
            let ids: Vec<Uuid> = node.dependencies.keys().copied().collect();
            let flags: Vec<bool> = node.dependencies.values().copied().collect();

            let rows = sqlx::query(
                "SELECT id, session_id, result IS NULL AS pending, \
                        cancelled_at IS NOT NULL AS cancelled \
                 FROM mycelia.graphs WHERE id = ANY($1) ORDER BY id FOR UPDATE",
            )
            .bind(&ids)
            .fetch_all(&mut *tx)
            .await
            .map_err(storage_error)?;

            if rows.len() != ids.len() {
                let mut found: HashSet<Uuid> = HashSet::new();
                for row in &rows {
                    found.insert(row.try_get("id").map_err(storage_error)?);
                }
                let missing = ids
                    .iter()
                    .find(|id| !found.contains(id))
                    .expect("some id is unaccounted for");
                return Err(Error::NodeNotFound(*missing));
            }
            for row in &rows {
                if row.try_get::<bool, _>("cancelled").map_err(storage_error)? {
                    let session_id: Uuid = row.try_get("session_id").map_err(storage_error)?;
                    return Err(Error::SessionCancelled(session_id));
                }
                if row.try_get::<bool, _>("pending").map_err(storage_error)? {
                    pending += 1;
                }
            }

            sqlx::query(
                "INSERT INTO mycelia.dependencies (node_id, graph_id, is_data) \
                 SELECT $1, edge.graph_id, edge.is_data \
                 FROM UNNEST($2::uuid[], $3::boolean[]) AS edge (graph_id, is_data)",
            )
            .bind(node.id)
            .bind(&ids)
            .bind(&flags)
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;
        }

        sqlx::query(
            "INSERT INTO mycelia.nodes \
             (id, graph_id, arguments, trace_context, broker_params, executor_params, \
              pending_dependency_count, created_at, started_at, finished_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, now(), NULL, NULL)",
        )
        .bind(node.id)
        .bind(node.graph_id)
        .bind(&node.arguments)
        .bind(&node.trace_context)
        .bind(&node.broker_params)
        .bind(&node.executor_params)
        .bind(pending as i16)
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;

        if let Some(parent_id) = node.parent_id {
            let updated = sqlx::query(
                "UPDATE mycelia.nodes SET finished_at = COALESCE(finished_at, now()) \
                 WHERE id = $1",
            )
            .bind(parent_id)
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;
            if updated.rows_affected() == 0 {
                return Err(Error::NodeNotFound(parent_id));
            }
        }

        tx.commit().await.map_err(storage_error)?;
        Ok(pending == 0)
    }

    async fn start_node(&self, id: Uuid) -> Result<StartedNode> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        let node = sqlx::query(
            "UPDATE mycelia.nodes SET started_at = COALESCE(started_at, now()) \
             WHERE id = $1 RETURNING graph_id, arguments, executor_params",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_error)?
        .ok_or(Error::NodeNotFound(id))?;
        let graph_id: Uuid = node.try_get("graph_id").map_err(storage_error)?;

        let graph = sqlx::query(
            "SELECT graphs.trace_context, sessions.id AS session_id, \
                    graphs.cancelled_at IS NOT NULL OR sessions.cancelled_at IS NOT NULL \
                        AS cancelled \
             FROM mycelia.graphs AS graphs \
             JOIN mycelia.sessions AS sessions ON graphs.session_id = sessions.id \
             WHERE graphs.id = $1",
        )
        .bind(graph_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage_error)?;
        if graph.try_get::<bool, _>("cancelled").map_err(storage_error)? {
            // Dropping the transaction also rolls the started_at stamp back.
            let session_id: Uuid = graph.try_get("session_id").map_err(storage_error)?;
            return Err(Error::SessionCancelled(session_id));
        }

        let rows = sqlx::query(
            "SELECT dependencies.graph_id, graphs.result \
             FROM mycelia.dependencies AS dependencies \
             JOIN mycelia.graphs AS graphs ON graphs.id = dependencies.graph_id \
             WHERE dependencies.node_id = $1 AND dependencies.is_data",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await
        .map_err(storage_error)?;

        let mut dependencies = std::collections::HashMap::with_capacity(rows.len());
        for row in rows {
            let dependency_graph_id: Uuid = row.try_get("graph_id").map_err(storage_error)?;
            let result: Option<Vec<u8>> = row.try_get("result").map_err(storage_error)?;
            let result = result.ok_or_else(|| {
                Error::Storage(format!(
                    "data dependency `{dependency_graph_id}` of `{id}` has no result"
                ))
            })?;
            dependencies.insert(dependency_graph_id, result);
        }

        let started = StartedNode {
            id,
            graph_id,
            arguments: node.try_get("arguments").map_err(storage_error)?,
            dependencies,
            graph_trace_context: graph.try_get("trace_context").map_err(storage_error)?,
            executor_params: node.try_get("executor_params").map_err(storage_error)?,
        };

        tx.commit().await.map_err(storage_error)?;
        Ok(started)
    }

    async fn complete_node(&self, node: CompletedNode) -> Result<Vec<ReadyNode>> {
        let rows = sqlx::query(SELECT_COMPLETE_NODE)
            .bind(node.id)
            .bind(&node.result)
            .bind(Utc::now())
            .fetch_all(&self.pool)
            .await
            .map_err(|error| {
                if raised(&error, "node.not_found") {
                    Error::NodeNotFound(node.id)
                } else {
                    storage_error(error)
                }
            })?;

        rows.iter().map(ready_node).collect()
    }

    async fn cancel_session(&self, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        let session = sqlx::query("SELECT cancelled_at FROM mycelia.sessions WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_error)?
            .ok_or(Error::SessionNotFound(id))?;
        let cancelled_at: Option<DateTime<Utc>> =
            session.try_get("cancelled_at").map_err(storage_error)?;
        if cancelled_at.is_some() {
            return Err(Error::SessionCancelled(id));
        }

        let updated = sqlx::query(
            "UPDATE mycelia.sessions SET cancelled_at = now() \
             WHERE id = $1 AND EXISTS (\
                 SELECT 1 FROM mycelia.graphs \
                 WHERE session_id = $1 AND result IS NULL AND cancelled_at IS NULL)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;
        if updated.rows_affected() == 0 {
            return Err(Error::SessionFinished(id));
        }

        sqlx::query(
            "UPDATE mycelia.graphs SET cancelled_at = now() \
             WHERE session_id = $1 AND result IS NULL AND cancelled_at IS NULL",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;

        tx.commit().await.map_err(storage_error)?;
        Ok(())
    }

    async fn link_graphs(&self, dependent: Uuid, dependency: Uuid) -> Result<Vec<FanOut>> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        let row = sqlx::query(
            "SELECT result, cancelled_at IS NOT NULL AS cancelled, dependent_graph_id \
             FROM mycelia.graphs WHERE id = $1 FOR UPDATE",
        )
        .bind(dependency)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_error)?
        .ok_or(Error::NodeNotFound(dependency))?;

        let result: Option<Vec<u8>> = row.try_get("result").map_err(storage_error)?;
        if let Some(result) = result {
            let rows = sqlx::query(SELECT_COMPLETE_GRAPH)
                .bind(dependent)
                .bind(&result)
                .fetch_all(&mut *tx)
                .await;
            let fan_out = match rows {
                Ok(rows) => rows
                    .iter()
                    .map(|row| ready_node(row).map(FanOut::Ready))
                    .collect::<Result<Vec<FanOut>>>()?,
                // Completing an already-cancelled dependent is a no-op.
                Err(error) if raised(&error, "graph.cancelled") => Vec::new(),
                Err(error) => return Err(storage_error(error)),
            };
            tx.commit().await.map_err(storage_error)?;
            return Ok(fan_out);
        }

        if row.try_get::<bool, _>("cancelled").map_err(storage_error)? {
            let rows = sqlx::query(CANCEL_GRAPHS)
                .bind(dependent)
                .fetch_all(&mut *tx)
                .await
                .map_err(storage_error)?;
            let mut fan_out = Vec::with_capacity(rows.len());
            for row in rows {
                fan_out.push(FanOut::Cancelled(
                    row.try_get("id").map_err(storage_error)?,
                ));
            }
            tx.commit().await.map_err(storage_error)?;
            return Ok(fan_out);
        }

        let existing: Option<Uuid> = row.try_get("dependent_graph_id").map_err(storage_error)?;
        if let Some(existing) = existing {
            if existing != dependent {
                return Err(Error::GraphLinked {
                    dependency,
                    existing,
                });
            }
            return Ok(Vec::new());
        }

        sqlx::query("UPDATE mycelia.graphs SET dependent_graph_id = $1 WHERE id = $2")
            .bind(dependent)
            .bind(dependency)
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;
        tx.commit().await.map_err(storage_error)?;
        Ok(Vec::new())
    }

    async fn mark_graph_completed(&self, id: Uuid, result: Vec<u8>) -> Result<Vec<FanOut>> {
        let rows = sqlx::query(SELECT_COMPLETE_GRAPH)
            .bind(id)
            .bind(&result)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| {
                if raised(&error, "graph.not_found") {
                    Error::NodeNotFound(id)
                } else if raised(&error, "graph.cancelled") {
                    Error::SessionCancelled(id)
                } else {
                    storage_error(error)
                }
            })?;

        rows.iter()
            .map(|row| ready_node(row).map(FanOut::Ready))
            .collect()
    }

    async fn mark_graph_cancelled(&self, id: Uuid) -> Result<Vec<Uuid>> {
        let exists = sqlx::query("SELECT 1 FROM mycelia.graphs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;
        if exists.is_none() {
            return Err(Error::NodeNotFound(id));
        }

        let rows = sqlx::query(CANCEL_GRAPHS)
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;

        rows.iter()
            .map(|row| row.try_get("id").map_err(storage_error))
            .collect()
    }
}
