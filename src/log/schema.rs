//! Database schema for the durable log, and a check that a live database
//! matches it.

use tokio_postgres::Client;

use crate::error::Result;

/// Tables, indexes and the append-only guard.
///
/// `log_entries` and `log_checkpoints` reject `UPDATE` and `DELETE` at the
/// database level so a compromised application account cannot rewrite
/// history without dropping the trigger first.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS log_entries (
    origin      TEXT        NOT NULL,
    leaf_index  BIGINT      NOT NULL,
    entry_type  TEXT        NOT NULL,
    tenant_id   TEXT        NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL,
    payload     BYTEA       NOT NULL,
    leaf_hash   BYTEA       NOT NULL,
    PRIMARY KEY (origin, leaf_index)
);

CREATE INDEX IF NOT EXISTS log_entries_type_idx ON log_entries (origin, entry_type);

CREATE TABLE IF NOT EXISTS log_checkpoints (
    id          BIGSERIAL   PRIMARY KEY,
    origin      TEXT        NOT NULL,
    tree_size   BIGINT      NOT NULL,
    root_hash   BYTEA       NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL,
    signature   BYTEA       NOT NULL,
    public_key  BYTEA       NOT NULL
);

CREATE INDEX IF NOT EXISTS log_checkpoints_origin_idx ON log_checkpoints (origin, tree_size);

CREATE OR REPLACE FUNCTION reject_log_mutation()
RETURNS TRIGGER AS $$
BEGIN
    RAISE EXCEPTION 'table % is append-only', TG_TABLE_NAME;
END;
$$ LANGUAGE plpgsql;

DROP TRIGGER IF EXISTS log_entries_append_only ON log_entries;
CREATE TRIGGER log_entries_append_only
BEFORE UPDATE OR DELETE ON log_entries
FOR EACH ROW EXECUTE FUNCTION reject_log_mutation();

DROP TRIGGER IF EXISTS log_checkpoints_append_only ON log_checkpoints;
CREATE TRIGGER log_checkpoints_append_only
BEFORE UPDATE OR DELETE ON log_checkpoints
FOR EACH ROW EXECUTE FUNCTION reject_log_mutation();
"#;

/// Drops everything [`SCHEMA`] creates.
pub const DROP_SCHEMA: &str = r#"
DROP TABLE IF EXISTS log_entries;
DROP TABLE IF EXISTS log_checkpoints;
DROP FUNCTION IF EXISTS reject_log_mutation();
"#;

/// Expected columns per table, with the acceptable `information_schema` types.
const EXPECTED: &[(&str, &[(&str, &[&str])])] = &[
    (
        "log_entries",
        &[
            ("origin", &["text"]),
            ("leaf_index", &["bigint"]),
            ("entry_type", &["text"]),
            ("tenant_id", &["text"]),
            ("created_at", &["timestamp with time zone"]),
            ("payload", &["bytea"]),
            ("leaf_hash", &["bytea"]),
        ],
    ),
    (
        "log_checkpoints",
        &[
            ("origin", &["text"]),
            ("tree_size", &["bigint"]),
            ("root_hash", &["bytea"]),
            ("created_at", &["timestamp with time zone"]),
            ("signature", &["bytea"]),
            ("public_key", &["bytea"]),
        ],
    ),
];

/// Creates the schema, optionally dropping it first.
///
/// # Errors
///
/// Returns `Error::Storage` if any statement fails.
pub async fn apply_schema(client: &Client, reset: bool) -> Result<()> {
    if reset {
        tracing::warn!("dropping log tables");
        client.batch_execute(DROP_SCHEMA).await?;
    }
    client.batch_execute(SCHEMA).await?;
    tracing::info!("log schema is ready");
    Ok(())
}

/// Validation result for a single column
#[derive(Debug, Clone)]
pub struct ColumnValidation {
    /// Name of the column being validated
    pub column_name: String,
    /// Whether the column exists in the table
    pub exists: bool,
    /// The actual `PostgreSQL` data type of the column (if it exists)
    pub data_type: Option<String>,
    /// The expected `PostgreSQL` data type for this column
    pub expected_type: String,
    /// Whether the actual type matches the expected type
    pub type_matches: bool,
}

/// Validation result for one log table
#[derive(Debug, Clone)]
pub struct TableValidation {
    /// Table name
    pub table_name: String,
    /// Whether the table exists
    pub table_exists: bool,
    /// Whether the append-only trigger is attached
    pub append_only: bool,
    /// Per-column results, empty when the table is missing
    pub columns: Vec<ColumnValidation>,
}

impl TableValidation {
    /// A table is valid when it exists, is guarded, and every column matches.
    pub fn is_valid(&self) -> bool {
        self.table_exists && self.append_only && self.columns.iter().all(|c| c.type_matches)
    }

    /// Human-readable problems, empty when valid.
    pub fn errors(&self) -> Vec<String> {
        if !self.table_exists {
            return vec![format!("Table '{}' does not exist", self.table_name)];
        }

        let mut errors = Vec::new();
        if !self.append_only {
            errors.push(format!(
                "Table '{}' has no append-only trigger",
                self.table_name
            ));
        }
        for col in &self.columns {
            if !col.exists {
                errors.push(format!("Column '{}' does not exist", col.column_name));
            } else if !col.type_matches {
                errors.push(format!(
                    "Column '{}' has type '{}' but expected '{}'",
                    col.column_name,
                    col.data_type.as_deref().unwrap_or("unknown"),
                    col.expected_type
                ));
            }
        }
        errors
    }
}

/// Checks that every log table exists with the expected columns and guard.
///
/// # Errors
///
/// Returns `Error::Storage` if the catalog queries fail.
pub async fn validate_schema(client: &Client) -> Result<Vec<TableValidation>> {
    let mut tables = Vec::with_capacity(EXPECTED.len());

    for (table_name, columns) in EXPECTED {
        let table_exists: bool = client
            .query_one(
                "SELECT EXISTS (
                    SELECT FROM information_schema.tables
                    WHERE table_schema = 'public' AND table_name = $1
                )",
                &[table_name],
            )
            .await?
            .get(0);

        if !table_exists {
            tables.push(TableValidation {
                table_name: (*table_name).to_string(),
                table_exists: false,
                append_only: false,
                columns: Vec::new(),
            });
            continue;
        }

        let append_only: bool = client
            .query_one(
                "SELECT EXISTS (
                    SELECT FROM information_schema.triggers
                    WHERE event_object_table = $1
                      AND action_statement LIKE '%reject_log_mutation%'
                )",
                &[table_name],
            )
            .await?
            .get(0);

        let mut validations = Vec::with_capacity(columns.len());
        for (column_name, expected_types) in *columns {
            validations.push(validate_column(client, table_name, column_name, expected_types).await?);
        }

        tables.push(TableValidation {
            table_name: (*table_name).to_string(),
            table_exists: true,
            append_only,
            columns: validations,
        });
    }

    Ok(tables)
}

async fn validate_column(
    client: &Client,
    table_name: &str,
    column_name: &str,
    expected_types: &[&str],
) -> Result<ColumnValidation> {
    let row = client
        .query_opt(
            "SELECT data_type, udt_name
             FROM information_schema.columns
             WHERE table_schema = 'public'
               AND table_name = $1
               AND column_name = $2",
            &[&table_name, &column_name],
        )
        .await?;

    let expected_type = expected_types.join(" or ");
    let Some(row) = row else {
        return Ok(ColumnValidation {
            column_name: column_name.to_string(),
            exists: false,
            data_type: None,
            expected_type,
            type_matches: false,
        });
    };

    let data_type: String = row.get(0);
    let udt_name: String = row.get(1);
    let actual_type = if data_type == "USER-DEFINED" {
        udt_name
    } else {
        data_type
    };
    let type_matches = expected_types
        .iter()
        .any(|expected| actual_type.eq_ignore_ascii_case(expected));

    Ok(ColumnValidation {
        column_name: column_name.to_string(),
        exists: true,
        data_type: Some(actual_type),
        expected_type,
        type_matches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_guards_both_tables() {
        assert!(SCHEMA.contains("log_entries_append_only"));
        assert!(SCHEMA.contains("log_checkpoints_append_only"));
        for (table, _) in EXPECTED {
            assert!(SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")));
        }
    }

    #[test]
    fn errors_explain_mismatches() {
        let validation = TableValidation {
            table_name: "log_entries".into(),
            table_exists: true,
            append_only: false,
            columns: vec![ColumnValidation {
                column_name: "leaf_hash".into(),
                exists: true,
                data_type: Some("text".into()),
                expected_type: "bytea".into(),
                type_matches: false,
            }],
        };
        assert!(!validation.is_valid());
        let errors = validation.errors();
        assert_eq!(errors.len(), 2);
        assert!(errors[1].contains("expected 'bytea'"));

        let missing = TableValidation {
            table_name: "log_checkpoints".into(),
            table_exists: false,
            append_only: false,
            columns: Vec::new(),
        };
        assert_eq!(missing.errors(), vec!["Table 'log_checkpoints' does not exist"]);
    }
}
