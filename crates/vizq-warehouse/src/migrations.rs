use ::duckdb::{params, Connection};

struct Migration {
    version: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "0001_catalog_and_cache",
        sql: r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_key TEXT PRIMARY KEY,
    namespace TEXT,
    payload TEXT NOT NULL,
    expires_at BIGINT,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS datasets (
    id BIGINT NOT NULL,
    datasource_type TEXT NOT NULL,
    name TEXT NOT NULL,
    sql TEXT NOT NULL,
    cache_timeout BIGINT,
    database_cache_timeout BIGINT,
    offset_hours INTEGER NOT NULL DEFAULT 0,
    is_rls_supported BOOLEAN NOT NULL DEFAULT FALSE,
    changed_on TEXT,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY(datasource_type, id)
);

CREATE TABLE IF NOT EXISTS dataset_columns (
    datasource_type TEXT NOT NULL,
    dataset_id BIGINT NOT NULL,
    position INTEGER NOT NULL,
    column_name TEXT NOT NULL,
    is_dttm BOOLEAN NOT NULL DEFAULT FALSE,
    date_format TEXT,
    type_name TEXT,
    PRIMARY KEY(datasource_type, dataset_id, column_name)
);

CREATE TABLE IF NOT EXISTS dataset_metrics (
    datasource_type TEXT NOT NULL,
    dataset_id BIGINT NOT NULL,
    position INTEGER NOT NULL,
    metric_name TEXT NOT NULL,
    expression TEXT NOT NULL,
    PRIMARY KEY(datasource_type, dataset_id, metric_name)
);

CREATE TABLE IF NOT EXISTS annotation_layers (
    id BIGINT PRIMARY KEY,
    name TEXT NOT NULL,
    descr TEXT
);

CREATE TABLE IF NOT EXISTS annotations (
    layer_id BIGINT NOT NULL,
    position INTEGER NOT NULL,
    start_dttm TEXT,
    end_dttm TEXT,
    short_descr TEXT,
    long_descr TEXT,
    json_metadata TEXT,
    PRIMARY KEY(layer_id, position)
);

CREATE TABLE IF NOT EXISTS charts (
    id BIGINT PRIMARY KEY,
    slice_name TEXT NOT NULL,
    datasource_type TEXT NOT NULL,
    datasource_id BIGINT NOT NULL,
    form_data TEXT NOT NULL
);
"#,
    },
    Migration {
        version: "0002_indexes",
        sql: r#"
CREATE INDEX IF NOT EXISTS idx_cache_entries_namespace ON cache_entries(namespace);
CREATE INDEX IF NOT EXISTS idx_cache_entries_expires_at ON cache_entries(expires_at);
"#,
    },
];

pub fn apply_migrations(connection: &Connection) -> Result<(), ::duckdb::Error> {
    connection.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    )?;

    for migration in MIGRATIONS {
        let applied_count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE version = ?",
            params![migration.version],
            |row| row.get(0),
        )?;

        if applied_count == 0 {
            connection.execute_batch(migration.sql)?;
            connection.execute(
                "INSERT INTO schema_migrations (version) VALUES (?)",
                params![migration.version],
            )?;
        }
    }

    Ok(())
}
