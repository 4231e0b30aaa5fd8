//! SQL migration definitions for the docflow database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: chunks with embeddings",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Embedded document chunks. Vectors are stored as JSON arrays of floats.
CREATE TABLE IF NOT EXISTS chunks (
    id              TEXT PRIMARY KEY,
    collection      TEXT NOT NULL,
    source_url      TEXT NOT NULL,
    chunk_index     INTEGER NOT NULL,
    chunk_text      TEXT NOT NULL,
    token_count     INTEGER NOT NULL,
    embedding       TEXT NOT NULL,
    embedding_model TEXT NOT NULL,
    metadata_json   TEXT,
    created_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chunks_collection ON chunks(collection);
CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source_url);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Batch run history",
            sql: r#"
CREATE TABLE IF NOT EXISTS batch_runs (
    batch_id             TEXT PRIMARY KEY,
    tool                 TEXT NOT NULL,
    success              INTEGER NOT NULL,
    total_documents      INTEGER NOT NULL,
    successful_documents INTEGER NOT NULL,
    failed_documents     INTEGER NOT NULL,
    report_json          TEXT NOT NULL,
    created_at           TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_batch_runs_created ON batch_runs(created_at);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
