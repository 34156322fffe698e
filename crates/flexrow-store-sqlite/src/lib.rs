use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use flexrow_core::{
    compute_total, format_period_date, numeric_value, parse_period_date, ColumnDefinition,
    ColumnId, DataRow, DataType, NaturalKey, Payload, PreparedRow, RowId, TableDefinition,
    TableError, TableId, TableSchema, TableSpec, UnitId,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{
    params, params_from_iter, Connection, DatabaseName, OptionalExtension, Transaction,
    TransactionBehavior,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS table_definitions (
  table_id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  display_name TEXT NOT NULL,
  description TEXT,
  is_default INTEGER NOT NULL DEFAULT 0 CHECK (is_default IN (0, 1)),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS column_definitions (
  column_id TEXT PRIMARY KEY,
  table_id TEXT NOT NULL,
  name TEXT NOT NULL,
  display_name TEXT NOT NULL,
  data_type TEXT NOT NULL CHECK (data_type IN ('integer','decimal','text','date','boolean')),
  is_summable INTEGER NOT NULL CHECK (is_summable IN (0, 1)),
  is_required INTEGER NOT NULL CHECK (is_required IN (0, 1)),
  column_order INTEGER NOT NULL CHECK (column_order >= 0),
  UNIQUE(table_id, name),
  UNIQUE(table_id, column_order),
  FOREIGN KEY (table_id) REFERENCES table_definitions(table_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS data_rows (
  row_id TEXT PRIMARY KEY,
  table_id TEXT NOT NULL,
  unit_id INTEGER NOT NULL,
  period_date TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  total TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE(table_id, unit_id, period_date),
  FOREIGN KEY (table_id) REFERENCES table_definitions(table_id)
);

CREATE INDEX IF NOT EXISTS idx_column_definitions_table ON column_definitions(table_id, column_order);
CREATE INDEX IF NOT EXISTS idx_data_rows_table_date ON data_rows(table_id, period_date);
CREATE INDEX IF NOT EXISTS idx_data_rows_table_unit ON data_rows(table_id, unit_id);
";

const TABLE_COLUMNS: &str = "table_id, name, display_name, description, is_default, created_at";

const COLUMN_COLUMNS: &str =
    "column_id, table_id, name, display_name, data_type, is_summable, is_required, column_order";

const ROW_COLUMNS: &str =
    "row_id, table_id, unit_id, period_date, payload_json, total, created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { busy_timeout: DEFAULT_BUSY_TIMEOUT }
    }
}

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpsertAction {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpsertOutcome {
    pub action: UpsertAction,
    pub row: DataRow,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RowFilter {
    pub unit_id: Option<UnitId>,
    #[serde(with = "flexrow_core::period_date_serde::option", default)]
    pub from: Option<Date>,
    #[serde(with = "flexrow_core::period_date_serde::option", default)]
    pub to: Option<Date>,
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableStatistics {
    pub table_id: TableId,
    pub row_count: usize,
    pub unit_count: usize,
    pub column_totals: BTreeMap<String, Decimal>,
    pub grand_total: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecalculateFailure {
    pub row_id: RowId,
    pub key: NaturalKey,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecalculateSummary {
    pub scanned_rows: usize,
    pub updated_rows: usize,
    pub failures: Vec<RecalculateFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub total_mismatches: Vec<RowId>,
    pub schema_status: SchemaStatus,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.quick_check_ok
            && self.foreign_key_violations.is_empty()
            && self.total_mismatches.is_empty()
            && self.schema_status.pending_versions.is_empty()
    }
}

/// Recover the domain error carried inside a store error, if any.
#[must_use]
pub fn table_error(err: &anyhow::Error) -> Option<&TableError> {
    err.downcast_ref::<TableError>()
}

impl SqliteStore {
    /// Open a SQLite-backed table store with default runtime options.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_options(path, StoreOptions::default())
    }

    /// Open a SQLite-backed table store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open_with_options(path: &Path, options: StoreOptions) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.busy_timeout(options.busy_timeout).context("failed to configure sqlite busy timeout")?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        if current_schema_version(&self.conn)? < 1 {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            tracing::info!(version = 1, "applied store migration");
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Create a table and all of its columns in one transaction.
    ///
    /// The first table ever created becomes the default table.
    ///
    /// # Errors
    /// Returns [`TableError::InvalidSchema`] for a malformed request,
    /// [`TableError::DuplicateTable`] when the name is taken, or a storage error.
    pub fn create_table(&mut self, spec: TableSpec) -> Result<TableSchema> {
        spec.validate()?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start table creation transaction")?;

        let existing_tables = tx
            .query_row("SELECT COUNT(*) FROM table_definitions", [], |row| row.get::<_, i64>(0))
            .context("failed to count table definitions")?;
        let schema = spec.into_definitions(existing_tables == 0, OffsetDateTime::now_utc())?;
        let table = &schema.table;

        let inserted = tx.execute(
            "INSERT INTO table_definitions(table_id, name, display_name, description, is_default, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                table.id.to_string(),
                table.name,
                table.display_name,
                table.description,
                table.is_default,
                rfc3339(table.created_at)?,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(TableError::DuplicateTable { name: table.name.clone() }.into());
            }
            Err(err) => {
                return Err(anyhow::Error::new(err).context("failed to insert table definition"))
            }
        }

        for column in &schema.columns {
            tx.execute(
                "INSERT INTO column_definitions(
                    column_id, table_id, name, display_name, data_type,
                    is_summable, is_required, column_order
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    column.id.to_string(),
                    column.table_id.to_string(),
                    column.name,
                    column.display_name,
                    column.data_type.as_str(),
                    column.is_summable,
                    column.is_required,
                    column.order,
                ],
            )
            .with_context(|| format!("failed to insert column definition {}", column.name))?;
        }

        tx.commit().context("failed to commit table creation")?;
        tracing::info!(
            table = %schema.table.name,
            table_id = %schema.table.id,
            columns = schema.columns.len(),
            is_default = schema.table.is_default,
            "created table"
        );
        Ok(schema)
    }

    /// Resolve a table by name, creating it from `spec` when it does not exist yet.
    ///
    /// A concurrent creator winning the race is treated as "already exists".
    ///
    /// # Errors
    /// Returns [`TableError::SchemaUnavailable`] when the table can neither be
    /// created nor found.
    pub fn get_or_create_table(&mut self, spec: TableSpec) -> Result<TableSchema> {
        let name = spec.name.clone();
        let create_err = match self.create_table(spec) {
            Ok(schema) => return Ok(schema),
            Err(err) => err,
        };

        if !matches!(table_error(&create_err), Some(TableError::DuplicateTable { .. })) {
            return Err(TableError::SchemaUnavailable { name, reason: format!("{create_err:#}") }
                .into());
        }

        tracing::debug!(table = %name, "table already exists; resolving by name");
        let found = self.get_table_by_name(&name).and_then(|table| match table {
            Some(table) => load_schema(&self.conn, table.id),
            None => Err(anyhow!("table vanished after duplicate-name conflict")),
        });
        found.map_err(|err| {
            TableError::SchemaUnavailable { name: name.clone(), reason: format!("{err:#}") }.into()
        })
    }

    /// Look up a table definition by its unique name.
    ///
    /// # Errors
    /// Returns an error when the lookup query or row decoding fails.
    pub fn get_table_by_name(&self, name: &str) -> Result<Option<TableDefinition>> {
        query_table(&self.conn, "name = ?1", &name)
    }

    /// Look up a table definition by id.
    ///
    /// # Errors
    /// Returns an error when the lookup query or row decoding fails.
    pub fn get_table(&self, table_id: TableId) -> Result<Option<TableDefinition>> {
        query_table(&self.conn, "table_id = ?1", &table_id.to_string())
    }

    /// List all table definitions in creation order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_tables(&self) -> Result<Vec<TableDefinition>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TABLE_COLUMNS} FROM table_definitions ORDER BY created_at ASC, table_id ASC"
        ))?;
        let rows = stmt.query_map([], StoredTable::read)?;
        let mut tables = Vec::new();
        for row in rows {
            tables.push(row?.decode()?);
        }
        Ok(tables)
    }

    /// The table flagged default, falling back to the oldest table.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_default_table(&self) -> Result<Option<TableDefinition>> {
        if let Some(table) = query_table(&self.conn, "is_default = ?1", &1_i64)? {
            return Ok(Some(table));
        }
        Ok(self.list_tables()?.into_iter().next())
    }

    /// Columns owned by `table_id`, ordered by their display order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn get_columns(&self, table_id: TableId) -> Result<Vec<ColumnDefinition>> {
        load_columns(&self.conn, table_id)
    }

    /// Load a table and its columns.
    ///
    /// # Errors
    /// Returns [`TableError::TableNotFound`] when no such table exists.
    pub fn get_schema(&self, table_id: TableId) -> Result<TableSchema> {
        load_schema(&self.conn, table_id)
    }

    /// Look up the row stored under a natural key.
    ///
    /// # Errors
    /// Returns an error when the lookup query or row decoding fails.
    pub fn find_row(&self, key: NaturalKey) -> Result<Option<DataRow>> {
        find_row_in(&self.conn, key)
    }

    /// Look up a row by id.
    ///
    /// # Errors
    /// Returns an error when the lookup query or row decoding fails.
    pub fn get_row(&self, row_id: RowId) -> Result<Option<DataRow>> {
        get_row_in(&self.conn, row_id)
    }

    /// Validate `payload`, derive its total and insert a new row.
    ///
    /// # Errors
    /// Returns [`TableError::TableNotFound`], [`TableError::SchemaMismatch`],
    /// [`TableError::NonNumericSummableValue`], or [`TableError::DuplicateRow`]
    /// when the natural key is already taken; nothing is written in those cases.
    pub fn insert_row(&mut self, key: NaturalKey, payload: Payload) -> Result<DataRow> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start row insert transaction")?;
        let schema = load_schema(&tx, key.table_id)?;
        let prepared = PreparedRow::prepare(key, payload, &schema.columns)?;
        let row = insert_prepared(&tx, &prepared)?;
        tx.commit().context("failed to commit row insert")?;
        Ok(row)
    }

    /// Replace the payload of an existing row and recompute its total.
    ///
    /// # Errors
    /// Returns [`TableError::RowNotFound`] for an unknown row and the payload
    /// errors of [`Self::insert_row`].
    pub fn update_row(&mut self, row_id: RowId, payload: Payload) -> Result<DataRow> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start row update transaction")?;
        let existing = get_row_in(&tx, row_id)?.ok_or(TableError::RowNotFound(row_id))?;
        let schema = load_schema(&tx, existing.table_id)?;
        let prepared = PreparedRow::prepare(existing.natural_key(), payload, &schema.columns)?;
        let row = update_prepared(&tx, &existing, &prepared)?;
        tx.commit().context("failed to commit row update")?;
        Ok(row)
    }

    /// Live-ingestion write: insert the row, or replace the payload of the row
    /// already stored under the same natural key.
    ///
    /// # Errors
    /// Returns the payload errors of [`Self::insert_row`] or a storage error.
    pub fn upsert_row(&mut self, key: NaturalKey, payload: Payload) -> Result<UpsertOutcome> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start row upsert transaction")?;
        let schema = load_schema(&tx, key.table_id)?;
        let prepared = PreparedRow::prepare(key, payload, &schema.columns)?;

        let outcome = match find_row_in(&tx, key)? {
            Some(existing) => UpsertOutcome {
                action: UpsertAction::Updated,
                row: update_prepared(&tx, &existing, &prepared)?,
            },
            None => UpsertOutcome {
                action: UpsertAction::Inserted,
                row: insert_prepared(&tx, &prepared)?,
            },
        };

        tx.commit().context("failed to commit row upsert")?;
        Ok(outcome)
    }

    /// List rows of a table ordered by `(period_date, unit_id)`.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_rows(&self, table_id: TableId, filter: &RowFilter) -> Result<Vec<DataRow>> {
        list_rows_in(&self.conn, table_id, filter)
    }

    /// Row count, distinct units, per-summable-column sums and the grand total.
    ///
    /// # Errors
    /// Returns [`TableError::TableNotFound`], a decode error, or an error when a
    /// sum leaves the decimal range.
    pub fn table_statistics(&self, table_id: TableId) -> Result<TableStatistics> {
        let schema = load_schema(&self.conn, table_id)?;
        let rows = self.list_rows(table_id, &RowFilter::default())?;

        let mut column_totals = schema
            .summable_columns()
            .into_iter()
            .map(|column| (column.name.clone(), Decimal::ZERO))
            .collect::<BTreeMap<_, _>>();
        let mut units = BTreeSet::new();
        let mut grand_total = Decimal::ZERO;

        for row in &rows {
            units.insert(row.unit_id);
            grand_total = grand_total
                .checked_add(row.total)
                .ok_or_else(|| anyhow!("grand total overflowed for table {table_id}"))?;
            for column in schema.summable_columns() {
                let Some(value) = row.payload.get(&column.name) else {
                    continue;
                };
                let Some(numeric) = numeric_value(value, column.data_type) else {
                    continue;
                };
                if let Some(sum) = column_totals.get_mut(&column.name) {
                    *sum = sum.checked_add(numeric).ok_or_else(|| {
                        anyhow!("column total overflowed for {}", column.name)
                    })?;
                }
            }
        }

        Ok(TableStatistics {
            table_id,
            row_count: rows.len(),
            unit_count: units.len(),
            column_totals: column_totals
                .into_iter()
                .map(|(name, sum)| (name, sum.normalize()))
                .collect(),
            grand_total: grand_total.normalize(),
        })
    }

    /// Recompute every row total of a table and rewrite the ones that drifted.
    ///
    /// # Errors
    /// Returns [`TableError::TableNotFound`] or a storage error. Rows whose payload
    /// no longer aggregates are reported in the summary, not raised.
    pub fn recalculate_totals(&mut self, table_id: TableId) -> Result<RecalculateSummary> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start recalculation transaction")?;
        let schema = load_schema(&tx, table_id)?;
        // Read under the write lock.
        let rows = list_rows_in(&tx, table_id, &RowFilter::default())?;
        let mut summary = RecalculateSummary::default();

        for row in rows {
            summary.scanned_rows += 1;
            match compute_total(&row.payload, &schema.columns) {
                Ok(total) if total == row.total => {}
                Ok(total) => {
                    tx.execute(
                        "UPDATE data_rows SET total = ?1, updated_at = ?2 WHERE row_id = ?3",
                        params![total.to_string(), now_rfc3339()?, row.id.to_string()],
                    )
                    .context("failed to rewrite row total")?;
                    tracing::debug!(row_id = %row.id, old = %row.total, new = %total, "rewrote drifted total");
                    summary.updated_rows += 1;
                }
                Err(err) => {
                    tracing::warn!(row_id = %row.id, key = %row.natural_key(), error = %err, "row total cannot be recomputed");
                    summary.failures.push(RecalculateFailure {
                        row_id: row.id,
                        key: row.natural_key(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        tx.commit().context("failed to commit recalculated totals")?;
        tracing::info!(
            table_id = %table_id,
            scanned = summary.scanned_rows,
            updated = summary.updated_rows,
            failed = summary.failures.len(),
            "recalculated totals"
        );
        Ok(summary)
    }

    /// Open a batch that holds row inserts for one table behind a single commit.
    ///
    /// The batch holds the write lock until it is committed or dropped; dropping
    /// it without committing rolls every insert back.
    ///
    /// # Errors
    /// Returns [`TableError::TableNotFound`] or an error when the transaction
    /// cannot be started.
    pub fn begin_batch(&mut self, table_id: TableId) -> Result<RowBatch<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start row batch transaction")?;
        let schema = load_schema(&tx, table_id)?;
        Ok(RowBatch { tx, schema, inserted: 0 })
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run quick-check, foreign-key-check, stored-total and schema status checks.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        let mut total_mismatches = Vec::new();
        if schema_status.pending_versions.is_empty() {
            for table in self.list_tables()? {
                let columns = self.get_columns(table.id)?;
                for row in self.list_rows(table.id, &RowFilter::default())? {
                    if compute_total(&row.payload, &columns).ok() != Some(row.total) {
                        total_mismatches.push(row.id);
                    }
                }
            }
        }

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            total_mismatches,
            schema_status,
        })
    }
}

/// Row inserts for one table that become durable together on [`RowBatch::commit`].
pub struct RowBatch<'conn> {
    tx: Transaction<'conn>,
    schema: TableSchema,
    inserted: usize,
}

impl RowBatch<'_> {
    #[must_use]
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Inserts accepted so far; none are durable before [`Self::commit`].
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inserted
    }

    /// Validate a payload for this batch's table and derive its total.
    ///
    /// # Errors
    /// Returns the payload errors of [`PreparedRow::prepare`].
    pub fn prepare(
        &self,
        unit_id: UnitId,
        period_date: Date,
        payload: Payload,
    ) -> Result<PreparedRow, TableError> {
        let key = NaturalKey { table_id: self.schema.table.id, unit_id, period_date };
        PreparedRow::prepare(key, payload, &self.schema.columns)
    }

    /// Look up a row, including rows inserted earlier in this batch.
    ///
    /// # Errors
    /// Returns an error when the lookup query or row decoding fails.
    pub fn find(&self, unit_id: UnitId, period_date: Date) -> Result<Option<DataRow>> {
        find_row_in(
            &self.tx,
            NaturalKey { table_id: self.schema.table.id, unit_id, period_date },
        )
    }

    /// Insert a prepared row.
    ///
    /// A failed insert leaves the batch usable; earlier inserts stay pending.
    ///
    /// # Errors
    /// Returns [`TableError::DuplicateRow`] when the natural key is taken and
    /// [`TableError::SchemaMismatch`] when the row was prepared for another table.
    pub fn insert(&mut self, prepared: &PreparedRow) -> Result<DataRow> {
        if prepared.key().table_id != self.schema.table.id {
            return Err(TableError::SchemaMismatch(format!(
                "row prepared for table {} inserted into batch for table {}",
                prepared.key().table_id,
                self.schema.table.id
            ))
            .into());
        }
        let row = insert_prepared(&self.tx, prepared)?;
        self.inserted += 1;
        Ok(row)
    }

    /// Make every pending insert durable and return how many there were.
    ///
    /// # Errors
    /// Returns an error when the commit fails; pending inserts are then rolled back.
    pub fn commit(self) -> Result<usize> {
        self.tx.commit().context("failed to commit row batch")?;
        Ok(self.inserted)
    }
}

struct StoredTable {
    table_id: String,
    name: String,
    display_name: String,
    description: Option<String>,
    is_default: bool,
    created_at: String,
}

impl StoredTable {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            table_id: row.get(0)?,
            name: row.get(1)?,
            display_name: row.get(2)?,
            description: row.get(3)?,
            is_default: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn decode(self) -> Result<TableDefinition> {
        Ok(TableDefinition {
            id: TableId(parse_ulid(&self.table_id)?),
            name: self.name,
            display_name: self.display_name,
            description: self.description,
            is_default: self.is_default,
            created_at: parse_rfc3339(&self.created_at)?,
        })
    }
}

struct StoredColumn {
    column_id: String,
    table_id: String,
    name: String,
    display_name: String,
    data_type: String,
    is_summable: bool,
    is_required: bool,
    order: u32,
}

impl StoredColumn {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            column_id: row.get(0)?,
            table_id: row.get(1)?,
            name: row.get(2)?,
            display_name: row.get(3)?,
            data_type: row.get(4)?,
            is_summable: row.get(5)?,
            is_required: row.get(6)?,
            order: row.get(7)?,
        })
    }

    fn decode(self) -> Result<ColumnDefinition> {
        let data_type = DataType::parse(&self.data_type)
            .ok_or_else(|| anyhow!("unknown data_type: {}", self.data_type))?;
        Ok(ColumnDefinition {
            id: ColumnId(parse_ulid(&self.column_id)?),
            table_id: TableId(parse_ulid(&self.table_id)?),
            name: self.name,
            display_name: self.display_name,
            data_type,
            is_summable: self.is_summable,
            is_required: self.is_required,
            order: self.order,
        })
    }
}

struct StoredRow {
    row_id: String,
    table_id: String,
    unit_id: i64,
    period_date: String,
    payload_json: String,
    total: String,
    created_at: String,
    updated_at: String,
}

impl StoredRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            row_id: row.get(0)?,
            table_id: row.get(1)?,
            unit_id: row.get(2)?,
            period_date: row.get(3)?,
            payload_json: row.get(4)?,
            total: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn decode(self) -> Result<DataRow> {
        Ok(DataRow {
            id: RowId(parse_ulid(&self.row_id)?),
            table_id: TableId(parse_ulid(&self.table_id)?),
            unit_id: UnitId(self.unit_id),
            period_date: parse_period_date(&self.period_date)
                .with_context(|| format!("invalid period_date: {}", self.period_date))?,
            payload: serde_json::from_str(&self.payload_json)
                .context("failed to deserialize row payload")?,
            total: self
                .total
                .parse::<Decimal>()
                .with_context(|| format!("invalid stored total: {}", self.total))?,
            created_at: parse_rfc3339(&self.created_at)?,
            updated_at: parse_rfc3339(&self.updated_at)?,
        })
    }
}

fn query_table(
    conn: &Connection,
    predicate: &str,
    value: &dyn rusqlite::ToSql,
) -> Result<Option<TableDefinition>> {
    let mut stmt =
        conn.prepare(&format!("SELECT {TABLE_COLUMNS} FROM table_definitions WHERE {predicate}"))?;
    let stored = stmt.query_row([value], StoredTable::read).optional()?;
    stored.map(StoredTable::decode).transpose()
}

fn load_columns(conn: &Connection, table_id: TableId) -> Result<Vec<ColumnDefinition>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMN_COLUMNS} FROM column_definitions
         WHERE table_id = ?1
         ORDER BY column_order ASC"
    ))?;
    let rows = stmt.query_map(params![table_id.to_string()], StoredColumn::read)?;
    let mut columns = Vec::new();
    for row in rows {
        columns.push(row?.decode()?);
    }
    Ok(columns)
}

fn load_schema(conn: &Connection, table_id: TableId) -> Result<TableSchema> {
    let table = query_table(conn, "table_id = ?1", &table_id.to_string())?
        .ok_or_else(|| TableError::TableNotFound(table_id.to_string()))?;
    let columns = load_columns(conn, table_id)?;
    Ok(TableSchema { table, columns })
}

fn find_row_in(conn: &Connection, key: NaturalKey) -> Result<Option<DataRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ROW_COLUMNS} FROM data_rows
         WHERE table_id = ?1 AND unit_id = ?2 AND period_date = ?3"
    ))?;
    let stored = stmt
        .query_row(
            params![key.table_id.to_string(), key.unit_id.0, format_period_date(key.period_date)?],
            StoredRow::read,
        )
        .optional()?;
    stored.map(StoredRow::decode).transpose()
}

fn list_rows_in(conn: &Connection, table_id: TableId, filter: &RowFilter) -> Result<Vec<DataRow>> {
    let mut sql = format!("SELECT {ROW_COLUMNS} FROM data_rows WHERE table_id = ?");
    let mut values = vec![SqlValue::Text(table_id.to_string())];

    if let Some(unit_id) = filter.unit_id {
        sql.push_str(" AND unit_id = ?");
        values.push(SqlValue::Integer(unit_id.0));
    }
    if let Some(from) = filter.from {
        sql.push_str(" AND period_date >= ?");
        values.push(SqlValue::Text(format_period_date(from)?));
    }
    if let Some(to) = filter.to {
        sql.push_str(" AND period_date <= ?");
        values.push(SqlValue::Text(format_period_date(to)?));
    }
    sql.push_str(" ORDER BY period_date ASC, unit_id ASC");
    if filter.limit.is_some() || filter.offset > 0 {
        sql.push_str(" LIMIT ? OFFSET ?");
        values.push(SqlValue::Integer(filter.limit.map_or(-1, i64::from)));
        values.push(SqlValue::Integer(i64::from(filter.offset)));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), StoredRow::read)?;
    let mut decoded = Vec::new();
    for row in rows {
        decoded.push(row?.decode()?);
    }
    Ok(decoded)
}

fn get_row_in(conn: &Connection, row_id: RowId) -> Result<Option<DataRow>> {
    let mut stmt = conn.prepare(&format!("SELECT {ROW_COLUMNS} FROM data_rows WHERE row_id = ?1"))?;
    let stored = stmt.query_row(params![row_id.to_string()], StoredRow::read).optional()?;
    stored.map(StoredRow::decode).transpose()
}

fn insert_prepared(conn: &Connection, prepared: &PreparedRow) -> Result<DataRow> {
    let key = prepared.key();
    let now = OffsetDateTime::now_utc();
    let row = DataRow {
        id: RowId::new(),
        table_id: key.table_id,
        unit_id: key.unit_id,
        period_date: key.period_date,
        payload: prepared.payload().clone(),
        total: prepared.total(),
        created_at: now,
        updated_at: now,
    };
    let payload_json =
        serde_json::to_string(&row.payload).context("failed to serialize row payload")?;
    let timestamp = rfc3339(now)?;

    let inserted = conn.execute(
        "INSERT INTO data_rows(
            row_id, table_id, unit_id, period_date, payload_json, total, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            row.id.to_string(),
            row.table_id.to_string(),
            row.unit_id.0,
            format_period_date(row.period_date)?,
            payload_json,
            row.total.to_string(),
            timestamp,
            timestamp,
        ],
    );

    match inserted {
        Ok(_) => {
            tracing::debug!(row_id = %row.id, key = %key, total = %row.total, "inserted row");
            Ok(row)
        }
        Err(err) if is_unique_violation(&err) => Err(TableError::DuplicateRow { key }.into()),
        Err(err) => Err(anyhow::Error::new(err).context("failed to insert data row")),
    }
}

fn update_prepared(conn: &Connection, existing: &DataRow, prepared: &PreparedRow) -> Result<DataRow> {
    let now = OffsetDateTime::now_utc();
    let changed = conn
        .execute(
            "UPDATE data_rows SET payload_json = ?1, total = ?2, updated_at = ?3 WHERE row_id = ?4",
            params![
                serde_json::to_string(prepared.payload())
                    .context("failed to serialize row payload")?,
                prepared.total().to_string(),
                rfc3339(now)?,
                existing.id.to_string(),
            ],
        )
        .context("failed to update data row")?;
    if changed == 0 {
        return Err(TableError::RowNotFound(existing.id).into());
    }

    tracing::debug!(row_id = %existing.id, total = %prepared.total(), "updated row");
    Ok(DataRow {
        payload: prepared.payload().clone(),
        total: prepared.total(),
        updated_at: now,
        ..existing.clone()
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}
