//! libSQL-backed cache of relationship edges from finished jobs.
//!
//! [`EdgeStore`] implements [`JobStore`]: completed jobs record their edges,
//! later jobs ask for the subtree already known below their root. The answer
//! is only a hint, so a stale or empty store never changes a crawl result.
//!
//! All statements go through one connection behind an async mutex, so a
//! transaction never interleaves with another job's writes.

mod migrations;

use std::collections::{HashSet, VecDeque};
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use irs_registry::JobStore;
use irs_shared::{Direction, GlobalAssetId, IrsError, Quantity, RelationshipEdge, Result};
use libsql::{Connection, Database, params};
use tokio::sync::Mutex;

fn storage_err(e: impl std::fmt::Display) -> IrsError {
    IrsError::Storage(e.to_string())
}

/// Edge cache handle wrapping a libSQL database.
pub struct EdgeStore {
    // Owns the file handle the connection was opened from.
    _db: Database,
    conn: Mutex<Connection>,
}

impl EdgeStore {
    /// Open or create a database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| IrsError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let store = Self {
            _db: db,
            conn: Mutex::new(conn),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                let conn = self.conn.lock().await;
                conn.execute_batch(migration.sql).await.map_err(|e| {
                    IrsError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let conn = self.conn.lock().await;
        let result = conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0,
        }
    }

    /// Insert or refresh edges, keyed by (parent, child).
    pub async fn upsert_edges(&self, edges: &[RelationshipEdge]) -> Result<()> {
        if edges.is_empty() {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();
        // Held until commit so concurrent callers queue behind this transaction.
        let conn = self.conn.lock().await;
        let tx = conn.transaction().await.map_err(storage_err)?;

        for edge in edges {
            let quantity_json = edge
                .quantity
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(storage_err)?;
            tx.execute(
                "INSERT INTO relationship_edge
                     (parent_id, child_id, aspect_type, lifecycle_context, quantity_json, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(parent_id, child_id) DO UPDATE SET
                     aspect_type = excluded.aspect_type,
                     lifecycle_context = excluded.lifecycle_context,
                     quantity_json = excluded.quantity_json,
                     recorded_at = excluded.recorded_at",
                params![
                    edge.parent_id.as_str(),
                    edge.child_id.as_str(),
                    edge.aspect_type.as_str(),
                    edge.lifecycle_context.clone(),
                    quantity_json,
                    now.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)?;
        tracing::debug!(count = edges.len(), "recorded edges");
        Ok(())
    }

    /// Edges whose parent is `parent`.
    pub async fn children_of(&self, parent: &GlobalAssetId) -> Result<Vec<RelationshipEdge>> {
        self.edges_where(
            "SELECT parent_id, child_id, aspect_type, lifecycle_context, quantity_json
             FROM relationship_edge WHERE parent_id = ?1 ORDER BY child_id",
            parent,
        )
        .await
    }

    /// Edges whose child is `child`.
    pub async fn parents_of(&self, child: &GlobalAssetId) -> Result<Vec<RelationshipEdge>> {
        self.edges_where(
            "SELECT parent_id, child_id, aspect_type, lifecycle_context, quantity_json
             FROM relationship_edge WHERE child_id = ?1 ORDER BY parent_id",
            child,
        )
        .await
    }

    async fn edges_where(&self, sql: &str, id: &GlobalAssetId) -> Result<Vec<RelationshipEdge>> {
        let conn = self.conn.lock().await;
        let mut rows = conn.query(sql, params![id.as_str()]).await.map_err(storage_err)?;

        let mut edges = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            edges.push(row_to_edge(&row)?);
        }
        Ok(edges)
    }

    /// Number of stored edges.
    pub async fn edge_count(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query("SELECT COUNT(*) FROM relationship_edge", params![])
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => row.get::<i64>(0).map(|n| n as u64).map_err(storage_err),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl JobStore for EdgeStore {
    async fn known_subtree(
        &self,
        root: &GlobalAssetId,
        max_depth: u32,
        direction: Direction,
    ) -> Result<Vec<RelationshipEdge>> {
        let mut visited = HashSet::from([root.clone()]);
        let mut queue = VecDeque::from([(root.clone(), 0u32)]);
        let mut edges = Vec::new();

        while let Some((node, level)) = queue.pop_front() {
            if level >= max_depth {
                continue;
            }
            let neighbours = match direction {
                Direction::Downward => self.children_of(&node).await?,
                Direction::Upward => self.parents_of(&node).await?,
            };
            for edge in neighbours {
                let next = match direction {
                    Direction::Downward => &edge.child_id,
                    Direction::Upward => &edge.parent_id,
                };
                if visited.insert(next.clone()) {
                    queue.push_back((next.clone(), level + 1));
                }
                edges.push(edge);
            }
        }
        Ok(edges)
    }

    async fn record_edges(&self, edges: &[RelationshipEdge]) -> Result<()> {
        self.upsert_edges(edges).await
    }
}

fn row_to_edge(row: &libsql::Row) -> Result<RelationshipEdge> {
    let quantity = match row.get::<String>(4).ok() {
        Some(json) => Some(serde_json::from_str::<Quantity>(&json).map_err(storage_err)?),
        None => None,
    };
    Ok(RelationshipEdge {
        parent_id: GlobalAssetId::from_payload(row.get::<String>(0).map_err(storage_err)?),
        child_id: GlobalAssetId::from_payload(row.get::<String>(1).map_err(storage_err)?),
        aspect_type: row.get::<String>(2).map_err(storage_err)?,
        lifecycle_context: row.get::<String>(3).ok(),
        quantity,
    })
}
