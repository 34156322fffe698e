//! One-time import of legacy fixed-schema records into the dynamic table model.
//!
//! [`run_migration`] resolves the target table, validates the field mapping,
//! then inserts records chunk by chunk. Records already present are skipped,
//! records that fail validation are reported, and the run continues.

mod source;

use std::collections::BTreeSet;

use flexrow_core::{
    period_date_serde, ColumnDefinition, ColumnSpec, DataType, Payload, TableError, TableId,
    TableSpec, UnitId,
};
use flexrow_store_sqlite::{table_error, SqliteStore};
use serde::{Deserialize, Serialize};
use time::Date;

pub use source::{
    ArchiveRecord, LegacyEntry, LegacyRecord, LegacySource, SqliteArchiveSource, ARCHIVE_FIELDS,
    DEFAULT_ARCHIVE_TABLE,
};

pub const DEFAULT_BATCH_SIZE: usize = 500;

pub const ARCHIVE_TABLE_NAME: &str = "archive_activity";

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("target table {name} is unavailable: {reason}")]
    SchemaUnavailable { name: String, reason: String },
    #[error("target table {table} has no columns")]
    NoColumns { table: String },
    #[error("field mapping does not fit the target table: {0}")]
    Mapping(TableError),
    #[error("failed to read legacy records: {0:#}")]
    Source(anyhow::Error),
    #[error("storage failure after {durable} durable rows: {cause:#}")]
    Storage { durable: usize, cause: anyhow::Error },
    #[error(
        "commit failed: {durable} rows durable from earlier chunks, {unknown} rows of unknown durability: {cause:#}"
    )]
    Commit { durable: usize, unknown: usize, cause: anyhow::Error },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldMappingEntry {
    pub field: String,
    pub column: String,
}

/// Ordered correspondence from legacy field names to target column names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct FieldMapping {
    entries: Vec<FieldMappingEntry>,
}

impl FieldMapping {
    #[must_use]
    pub fn new(entries: Vec<FieldMappingEntry>) -> Self {
        Self { entries }
    }

    #[must_use]
    pub fn entries(&self) -> &[FieldMappingEntry] {
        &self.entries
    }

    /// Check that every mapped column exists and no column is targeted twice.
    ///
    /// # Errors
    /// Returns [`TableError::SchemaMismatch`] naming the offending entry.
    pub fn validate(&self, columns: &[ColumnDefinition]) -> Result<(), TableError> {
        if self.entries.is_empty() {
            return Err(TableError::SchemaMismatch("field mapping is empty".to_string()));
        }

        let mut targeted = BTreeSet::new();
        for entry in &self.entries {
            if !columns.iter().any(|column| column.name == entry.column) {
                return Err(TableError::SchemaMismatch(format!(
                    "field {} maps to unknown column {}",
                    entry.field, entry.column
                )));
            }
            if !targeted.insert(entry.column.as_str()) {
                return Err(TableError::SchemaMismatch(format!(
                    "column {} is targeted by more than one field",
                    entry.column
                )));
            }
        }
        Ok(())
    }

    /// Copy the mapped fields of `record` into a row payload. Fields the record
    /// does not have are left out of the payload.
    #[must_use]
    pub fn build_payload<R: LegacyRecord>(&self, record: &R) -> Payload {
        self.entries
            .iter()
            .filter_map(|entry| record.field(&entry.field).map(|value| (entry.column.clone(), value)))
            .collect()
    }
}

/// Target table for the archive counters: seven summable integer columns.
#[must_use]
pub fn archive_table_spec() -> TableSpec {
    let display_names = [
        "Incoming Documents",
        "Outgoing Documents",
        "Dispositions",
        "Files",
        "Permanent Retention",
        "Destroyed Retention",
        "Followed-up Documents",
    ];
    TableSpec {
        name: ARCHIVE_TABLE_NAME.to_string(),
        display_name: "Archive Activity".to_string(),
        description: Some("Archive activity counters imported from the legacy table".to_string()),
        columns: ARCHIVE_FIELDS
            .iter()
            .zip(display_names)
            .map(|(name, display)| ColumnSpec::new(name, display, DataType::Integer, true))
            .collect(),
    }
}

#[must_use]
pub fn archive_field_mapping() -> FieldMapping {
    FieldMapping::new(
        ARCHIVE_FIELDS
            .iter()
            .map(|field| FieldMappingEntry { field: (*field).to_string(), column: (*field).to_string() })
            .collect(),
    )
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "archive_table_spec")]
    pub table: TableSpec,
    #[serde(default = "archive_field_mapping")]
    pub mapping: FieldMapping,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            table: archive_table_spec(),
            mapping: archive_field_mapping(),
        }
    }
}

impl MigrationConfig {
    /// Parse a YAML config; omitted keys fall back to the archive defaults.
    ///
    /// # Errors
    /// Returns an error when `raw` is not valid YAML for this shape.
    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The stored row carries the same payload the record would produce.
    AlreadyMigrated,
    /// A row exists for the key but its payload differs from the record.
    ConflictingData,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedRecord {
    pub unit_id: UnitId,
    #[serde(with = "period_date_serde")]
    pub period_date: Date,
    pub reason: SkipReason,
}

/// A legacy record that was not migrated.
///
/// `unit_id` is absent and `period_date` carries the raw legacy text when the
/// row itself could not be decoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordFailure {
    pub unit_id: Option<UnitId>,
    pub period_date: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Success,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub table_id: TableId,
    pub table_name: String,
    pub migrated_count: usize,
    pub skipped_count: usize,
    pub skipped: Vec<SkippedRecord>,
    pub failures: Vec<RecordFailure>,
    pub status: MigrationStatus,
}

impl MigrationReport {
    fn new(table_id: TableId, table_name: String) -> Self {
        Self {
            table_id,
            table_name,
            migrated_count: 0,
            skipped_count: 0,
            skipped: Vec::new(),
            failures: Vec::new(),
            status: MigrationStatus::Success,
        }
    }

    fn skip(&mut self, unit_id: UnitId, period_date: Date, reason: SkipReason) {
        tracing::warn!(unit = %unit_id, date = %period_date, ?reason, "skipping legacy record; row already exists");
        self.skipped_count += 1;
        self.skipped.push(SkippedRecord { unit_id, period_date, reason });
    }

    fn fail(&mut self, unit_id: UnitId, period_date: Date, reason: String) {
        self.record_failure(RecordFailure {
            unit_id: Some(unit_id),
            period_date: period_date.to_string(),
            reason,
        });
    }

    fn record_failure(&mut self, failure: RecordFailure) {
        tracing::warn!(
            unit = ?failure.unit_id,
            date = %failure.period_date,
            reason = %failure.reason,
            "legacy record not migrated"
        );
        self.failures.push(failure);
    }
}

/// Import every record of `source` into the table described by `config`.
///
/// Each chunk of `batch_size` records is one transaction, so a commit failure
/// leaves earlier chunks durable.
///
/// # Errors
/// Fatal conditions abort the run: an unresolvable target table, a table
/// without columns, a mapping that does not fit the columns, an unreadable
/// source, or a storage failure while writing. A single legacy row that cannot
/// be decoded is a per-record failure, not a fatal one.
pub fn run_migration<S: LegacySource>(
    store: &mut SqliteStore,
    source: &S,
    config: &MigrationConfig,
) -> Result<MigrationReport, MigrationError> {
    let schema = store.get_or_create_table(config.table.clone()).map_err(|err| {
        match table_error(&err) {
            Some(TableError::SchemaUnavailable { name, reason }) => {
                MigrationError::SchemaUnavailable { name: name.clone(), reason: reason.clone() }
            }
            _ => MigrationError::SchemaUnavailable {
                name: config.table.name.clone(),
                reason: format!("{err:#}"),
            },
        }
    })?;
    let table_id = schema.table.id;

    let columns = store
        .get_columns(table_id)
        .map_err(|cause| MigrationError::Storage { durable: 0, cause })?;
    if columns.is_empty() {
        return Err(MigrationError::NoColumns { table: schema.table.name });
    }
    config.mapping.validate(&columns).map_err(MigrationError::Mapping)?;

    let records = source.records().map_err(MigrationError::Source)?;
    let batch_size = config.batch_size.max(1);
    tracing::info!(
        table = %schema.table.name,
        table_id = %table_id,
        records = records.len(),
        batch_size,
        "starting legacy migration"
    );

    let mut report = MigrationReport::new(table_id, schema.table.name);
    for (chunk_index, chunk) in records.chunks(batch_size).enumerate() {
        let durable = report.migrated_count;
        let mut batch = store
            .begin_batch(table_id)
            .map_err(|cause| MigrationError::Storage { durable, cause })?;

        for entry in chunk {
            let record = match entry {
                Ok(record) => record,
                Err(failure) => {
                    report.record_failure(failure.clone());
                    continue;
                }
            };
            let unit_id = record.unit_id();
            let period_date = record.period_date();
            let payload = config.mapping.build_payload(record);

            let existing = batch
                .find(unit_id, period_date)
                .map_err(|cause| MigrationError::Storage { durable, cause })?;
            if let Some(existing) = existing {
                let reason = if existing.payload == payload {
                    SkipReason::AlreadyMigrated
                } else {
                    SkipReason::ConflictingData
                };
                report.skip(unit_id, period_date, reason);
                continue;
            }

            let prepared = match batch.prepare(unit_id, period_date, payload) {
                Ok(prepared) => prepared,
                Err(err) => {
                    report.fail(unit_id, period_date, err.to_string());
                    continue;
                }
            };

            if let Err(err) = batch.insert(&prepared) {
                match table_error(&err) {
                    Some(domain) => report.fail(unit_id, period_date, domain.to_string()),
                    None => return Err(MigrationError::Storage { durable, cause: err }),
                }
            }
        }

        let pending = batch.pending();
        let committed = batch
            .commit()
            .map_err(|cause| MigrationError::Commit { durable, unknown: pending, cause })?;
        report.migrated_count += committed;
        tracing::info!(chunk = chunk_index, committed, total_migrated = report.migrated_count, "committed chunk");
    }

    if !report.failures.is_empty() {
        report.status = MigrationStatus::Degraded;
    }
    tracing::info!(
        migrated = report.migrated_count,
        skipped = report.skipped_count,
        failed = report.failures.len(),
        status = ?report.status,
        "legacy migration finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use anyhow::{anyhow, Context, Result};
    use flexrow_core::NaturalKey;
    use flexrow_store_sqlite::RowFilter;
    use rust_decimal::Decimal;
    use serde_json::{json, Value};
    use time::macros::date;

    use super::*;

    #[derive(Debug, Clone)]
    struct FixtureRecord {
        unit_id: UnitId,
        period_date: Date,
        fields: Payload,
    }

    impl LegacyRecord for FixtureRecord {
        fn unit_id(&self) -> UnitId {
            self.unit_id
        }

        fn period_date(&self) -> Date {
            self.period_date
        }

        fn field(&self, name: &str) -> Option<Value> {
            self.fields.get(name).cloned()
        }
    }

    fn open_migrated() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn archive_record(unit: i64, period_date: Date, base: i64) -> ArchiveRecord {
        ArchiveRecord {
            unit_id: UnitId(unit),
            period_date,
            incoming_documents: json!(base),
            outgoing_documents: json!(base + 1),
            dispositions: json!(base + 2),
            files: Value::Null,
            permanent_retention: json!(0),
            destroyed_retention: json!(0),
            followed_up_documents: json!(1),
        }
    }

    fn archive_fixture() -> Vec<ArchiveRecord> {
        vec![
            archive_record(1, date!(2026 - 01 - 31), 10),
            archive_record(2, date!(2026 - 01 - 31), 20),
            archive_record(1, date!(2026 - 02 - 28), 30),
        ]
    }

    fn fixture_record(unit: i64, period_date: Date, fields: Value) -> Result<FixtureRecord> {
        Ok(FixtureRecord { unit_id: UnitId(unit), period_date, fields: serde_json::from_value(fields)? })
    }

    fn cleanup_db_files(db_path: &Path) -> Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let path = if suffix.is_empty() {
                db_path.to_path_buf()
            } else {
                PathBuf::from(format!("{}{}", db_path.display(), suffix))
            };
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }

    #[test]
    fn archive_migration_is_idempotent() -> Result<()> {
        let mut store = open_migrated()?;
        let source = archive_fixture();
        let config = MigrationConfig::default();

        let first = run_migration(&mut store, &source, &config)?;
        assert_eq!(first.migrated_count, 3);
        assert_eq!(first.skipped_count, 0);
        assert_eq!(first.status, MigrationStatus::Success);

        let second = run_migration(&mut store, &source, &config)?;
        assert_eq!(second.table_id, first.table_id);
        assert_eq!(second.migrated_count, 0);
        assert_eq!(second.skipped_count, 3);
        assert!(second.skipped.iter().all(|skip| skip.reason == SkipReason::AlreadyMigrated));

        assert_eq!(store.list_tables()?.len(), 1);
        let rows = store.list_rows(first.table_id, &RowFilter::default())?;
        assert_eq!(rows.len(), 3);
        // 10 + 11 + 12 + 0 + 0 + 1, with the null counter contributing nothing
        assert_eq!(rows[0].total, Decimal::from(34));
        assert_eq!(rows[0].payload.get("files"), Some(&Value::Null));
        Ok(())
    }

    #[test]
    fn chunked_commits_cover_every_record() -> Result<()> {
        let mut store = open_migrated()?;
        let source = (1..=5).map(|unit| archive_record(unit, date!(2026 - 03 - 31), unit)).collect::<Vec<_>>();
        let config = MigrationConfig { batch_size: 2, ..MigrationConfig::default() };

        let report = run_migration(&mut store, &source, &config)?;
        assert_eq!(report.migrated_count, 5);
        assert_eq!(store.list_rows(report.table_id, &RowFilter::default())?.len(), 5);
        Ok(())
    }

    #[test]
    fn bad_record_is_isolated_and_run_is_degraded() -> Result<()> {
        let mut store = open_migrated()?;
        let source = vec![
            fixture_record(1, date!(2026 - 01 - 31), json!({"files": 4}))?,
            fixture_record(2, date!(2026 - 01 - 31), json!({"files": "four"}))?,
            fixture_record(3, date!(2026 - 01 - 31), json!({"files": 6}))?,
        ];

        let report = run_migration(&mut store, &source, &MigrationConfig::default())?;
        assert_eq!(report.migrated_count, 2);
        assert_eq!(report.status, MigrationStatus::Degraded);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].unit_id, Some(UnitId(2)));
        assert_eq!(report.failures[0].period_date, "2026-01-31");
        assert!(report.failures[0].reason.contains("files"));

        let key = NaturalKey { table_id: report.table_id, unit_id: UnitId(2), period_date: date!(2026 - 01 - 31) };
        assert!(store.find_row(key)?.is_none());
        Ok(())
    }

    #[test]
    fn duplicate_key_within_one_source_is_skipped() -> Result<()> {
        let mut store = open_migrated()?;
        let source = vec![
            fixture_record(1, date!(2026 - 01 - 31), json!({"files": 4}))?,
            fixture_record(1, date!(2026 - 01 - 31), json!({"files": 4}))?,
        ];

        let report = run_migration(&mut store, &source, &MigrationConfig::default())?;
        assert_eq!(report.migrated_count, 1);
        assert_eq!(report.skipped_count, 1);
        assert_eq!(report.status, MigrationStatus::Success);
        Ok(())
    }

    #[test]
    fn existing_row_with_different_payload_is_flagged_not_overwritten() -> Result<()> {
        let mut store = open_migrated()?;
        let schema = store.create_table(archive_table_spec())?;
        let key = NaturalKey { table_id: schema.table.id, unit_id: UnitId(1), period_date: date!(2026 - 01 - 31) };
        store.insert_row(key, serde_json::from_value(json!({"files": 99}))?)?;

        let report = run_migration(&mut store, &archive_fixture(), &MigrationConfig::default())?;
        assert_eq!(report.migrated_count, 2);
        assert_eq!(report.skipped_count, 1);
        assert_eq!(report.skipped[0].reason, SkipReason::ConflictingData);
        assert_eq!(report.status, MigrationStatus::Success);

        let stored = store.find_row(key)?.ok_or_else(|| anyhow!("row should exist"))?;
        assert_eq!(stored.total, Decimal::from(99));
        Ok(())
    }

    #[test]
    fn unresolvable_schema_is_fatal_and_migrates_nothing() -> Result<()> {
        let mut store = open_migrated()?;
        let mut config = MigrationConfig::default();
        config.table.columns.clear();

        let result = run_migration(&mut store, &archive_fixture(), &config);
        assert!(matches!(result, Err(MigrationError::SchemaUnavailable { .. })));
        assert!(store.list_tables()?.is_empty());
        Ok(())
    }

    #[test]
    fn mapping_to_unknown_column_is_fatal_before_any_row() -> Result<()> {
        let mut store = open_migrated()?;
        let mut config = MigrationConfig::default();
        config.mapping = FieldMapping::new(vec![FieldMappingEntry {
            field: "files".to_string(),
            column: "folders".to_string(),
        }]);

        let result = run_migration(&mut store, &archive_fixture(), &config);
        assert!(matches!(result, Err(MigrationError::Mapping(TableError::SchemaMismatch(_)))));

        let table = store
            .get_table_by_name(ARCHIVE_TABLE_NAME)?
            .ok_or_else(|| anyhow!("table should have been ensured"))?;
        assert!(store.list_rows(table.id, &RowFilter::default())?.is_empty());
        Ok(())
    }

    #[test]
    fn config_yaml_falls_back_to_archive_defaults() -> Result<()> {
        let config = MigrationConfig::from_yaml("batch_size: 50\n")?;
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.table, archive_table_spec());
        assert_eq!(config.mapping, archive_field_mapping());

        let custom = MigrationConfig::from_yaml(
            "table:\n  name: visits\n  display_name: Visits\n  columns:\n    - name: walk_ins\n      display_name: Walk-ins\nmapping:\n  - field: walkins\n    column: walk_ins\n",
        )?;
        assert_eq!(custom.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(custom.table.columns[0].data_type, "integer");
        assert_eq!(custom.mapping.entries()[0].field, "walkins");
        Ok(())
    }

    fn create_legacy_archive(rows_sql: &str) -> Result<PathBuf> {
        let legacy_path =
            std::env::temp_dir().join(format!("flexrow-legacy-{}.sqlite3", ulid::Ulid::new()));
        let conn = rusqlite::Connection::open(&legacy_path)?;
        conn.execute_batch(&format!(
            "CREATE TABLE data_arsip (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               unit_kerja_id INTEGER NOT NULL,
               tanggal DATE NOT NULL,
               naskah_masuk INTEGER, naskah_keluar INTEGER, disposisi INTEGER, berkas INTEGER,
               retensi_permanen INTEGER, retensi_musnah INTEGER, naskah_ditindaklanjuti INTEGER
             );
             INSERT INTO data_arsip(unit_kerja_id, tanggal, naskah_masuk, naskah_keluar, disposisi, berkas,
                                    retensi_permanen, retensi_musnah, naskah_ditindaklanjuti)
             VALUES {rows_sql};"
        ))?;
        Ok(legacy_path)
    }

    #[test]
    fn sqlite_archive_source_feeds_migration() -> Result<()> {
        let legacy_path = create_legacy_archive(
            "(4, '2026-02-28', 1, 2, 3, 4, 5, 6, 7), (3, '2026-01-31', 1, NULL, 0, 0, 0, 0, 0)",
        )?;

        let source = SqliteArchiveSource::open(&legacy_path)?;
        let records = source.records()?;
        assert_eq!(records.len(), 2);
        let Ok(first) = &records[0] else {
            return Err(anyhow!("first legacy row should decode: {:?}", records[0]));
        };
        assert_eq!(first.unit_id, UnitId(3));
        assert_eq!(first.outgoing_documents, Value::Null);

        let mut store = open_migrated()?;
        let report = run_migration(&mut store, &source, &MigrationConfig::default())?;
        assert_eq!(report.migrated_count, 2);
        let rows = store.list_rows(report.table_id, &RowFilter::default())?;
        assert_eq!(rows[1].total, Decimal::from(28));
        drop(source);

        cleanup_db_files(&legacy_path)
    }

    #[test]
    fn malformed_legacy_counter_fails_only_its_own_row() -> Result<()> {
        let legacy_path = create_legacy_archive(
            "(1, '2026-01-31', 1, 1, 1, 1, 1, 1, 1),
             (2, '2026-02-28', 'n/a', 1, 1, 1, 1, 1, 1),
             (3, '2026-03-31', 2, 2, 2, 2, 2, 2, 2)",
        )?;
        let source = SqliteArchiveSource::open(&legacy_path)?;
        let mut store = open_migrated()?;

        let report = run_migration(&mut store, &source, &MigrationConfig::default())?;
        assert_eq!(report.migrated_count, 2);
        assert_eq!(report.status, MigrationStatus::Degraded);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].unit_id, Some(UnitId(2)));
        assert_eq!(report.failures[0].period_date, "2026-02-28");
        assert!(report.failures[0].reason.contains("incoming_documents"));

        let rows = store.list_rows(report.table_id, &RowFilter::default())?;
        let units = rows.iter().map(|row| row.unit_id).collect::<Vec<_>>();
        assert_eq!(units, vec![UnitId(1), UnitId(3)]);
        drop(source);

        cleanup_db_files(&legacy_path)
    }

    #[test]
    fn undecodable_legacy_date_is_reported_with_its_raw_key() -> Result<()> {
        let legacy_path = create_legacy_archive(
            "(1, '2026-01-31', 1, 1, 1, 1, 1, 1, 1),
             (7, '2026-02-30', 1, 1, 1, 1, 1, 1, 1)",
        )?;
        let source = SqliteArchiveSource::open(&legacy_path)?;
        let records = source.records()?;
        assert_eq!(records.len(), 2);
        assert!(records[0].is_ok());

        let mut store = open_migrated()?;
        let report = run_migration(&mut store, &source, &MigrationConfig::default())?;
        assert_eq!(report.migrated_count, 1);
        assert_eq!(report.status, MigrationStatus::Degraded);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].unit_id, Some(UnitId(7)));
        assert_eq!(report.failures[0].period_date, "2026-02-30");
        assert!(report.failures[0].reason.contains("invalid"));
        drop(source);

        cleanup_db_files(&legacy_path)
    }

    #[test]
    fn archive_source_rejects_non_identifier_table() {
        let result = SqliteArchiveSource::open_table(Path::new(":memory:"), "data; DROP TABLE x");
        assert!(result.is_err());
    }
}
