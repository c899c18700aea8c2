//! SQL migration definitions for the known-subtree database.
//!
//! Migrations are applied in order on database open.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: relationship_edge",
        sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Edges discovered by finished jobs, one row per (parent, child) pair
CREATE TABLE IF NOT EXISTS relationship_edge (
    parent_id         TEXT NOT NULL,
    child_id          TEXT NOT NULL,
    aspect_type       TEXT NOT NULL,
    lifecycle_context TEXT,
    quantity_json     TEXT,
    recorded_at       TEXT NOT NULL,
    PRIMARY KEY (parent_id, child_id)
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
