use std::path::Path;

use anyhow::{anyhow, Context, Result};
use flexrow_core::{parse_period_date, UnitId};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OpenFlags};
use serde_json::Value;
use time::Date;

use crate::RecordFailure;

/// Legacy table the archive counters were kept in before the dynamic model.
pub const DEFAULT_ARCHIVE_TABLE: &str = "data_arsip";

/// Field names exposed by [`ArchiveRecord::field`], in legacy column order.
pub const ARCHIVE_FIELDS: [&str; 7] = [
    "incoming_documents",
    "outgoing_documents",
    "dispositions",
    "files",
    "permanent_retention",
    "destroyed_retention",
    "followed_up_documents",
];

/// One fixed-shape record read from a legacy source.
pub trait LegacyRecord {
    fn unit_id(&self) -> UnitId;
    fn period_date(&self) -> Date;
    /// Value of a named legacy field; `None` when the record has no such field.
    fn field(&self, name: &str) -> Option<Value>;
}

/// One entry of a legacy source: a decoded record, or the row that could not be
/// decoded.
pub type LegacyEntry<R> = std::result::Result<R, RecordFailure>;

/// A finite, fully materialized sequence of legacy records.
pub trait LegacySource {
    type Record: LegacyRecord;

    /// Entries in source order. A row the source cannot decode is an `Err`
    /// entry and does not stop the others.
    ///
    /// # Errors
    /// Returns an error when the source as a whole cannot be read.
    fn records(&self) -> Result<Vec<LegacyEntry<Self::Record>>>;
}

impl<R: LegacyRecord + Clone> LegacySource for Vec<R> {
    type Record = R;

    fn records(&self) -> Result<Vec<LegacyEntry<R>>> {
        Ok(self.iter().cloned().map(Ok).collect())
    }
}

/// Counters hold whatever the legacy column held (`null` for NULL), so a
/// non-integer counter is rejected by the total for its own row only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRecord {
    pub unit_id: UnitId,
    pub period_date: Date,
    pub incoming_documents: Value,
    pub outgoing_documents: Value,
    pub dispositions: Value,
    pub files: Value,
    pub permanent_retention: Value,
    pub destroyed_retention: Value,
    pub followed_up_documents: Value,
}

impl LegacyRecord for ArchiveRecord {
    fn unit_id(&self) -> UnitId {
        self.unit_id
    }

    fn period_date(&self) -> Date {
        self.period_date
    }

    fn field(&self, name: &str) -> Option<Value> {
        let counter = match name {
            "incoming_documents" => &self.incoming_documents,
            "outgoing_documents" => &self.outgoing_documents,
            "dispositions" => &self.dispositions,
            "files" => &self.files,
            "permanent_retention" => &self.permanent_retention,
            "destroyed_retention" => &self.destroyed_retention,
            "followed_up_documents" => &self.followed_up_documents,
            _ => return None,
        };
        Some(counter.clone())
    }
}

/// Read-only adapter over a legacy archive database.
pub struct SqliteArchiveSource {
    conn: Connection,
    table: String,
}

impl SqliteArchiveSource {
    /// Open the legacy database at `path` read-only, reading [`DEFAULT_ARCHIVE_TABLE`].
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_table(path, DEFAULT_ARCHIVE_TABLE)
    }

    /// Open the legacy database at `path` read-only, reading `table`.
    ///
    /// # Errors
    /// Returns an error when `table` is not a plain identifier or the database
    /// cannot be opened.
    pub fn open_table(path: &Path, table: &str) -> Result<Self> {
        let mut chars = table.chars();
        let plain = chars.next().is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
            && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
        if !plain {
            return Err(anyhow!("legacy table name {table:?} is not a plain identifier"));
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open legacy database at {}", path.display()))?;

        Ok(Self { conn, table: table.to_string() })
    }
}

impl LegacySource for SqliteArchiveSource {
    type Record = ArchiveRecord;

    fn records(&self) -> Result<Vec<LegacyEntry<ArchiveRecord>>> {
        let sql = format!(
            "SELECT unit_kerja_id, tanggal, naskah_masuk, naskah_keluar, disposisi, berkas,
                    retensi_permanen, retensi_musnah, naskah_ditindaklanjuti
             FROM {}
             ORDER BY tanggal ASC, unit_kerja_id ASC",
            self.table
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .with_context(|| format!("failed to prepare legacy query on {}", self.table))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, SqlValue>(0)?,
                    row.get::<_, SqlValue>(1)?,
                    [
                        row.get::<_, SqlValue>(2)?,
                        row.get::<_, SqlValue>(3)?,
                        row.get::<_, SqlValue>(4)?,
                        row.get::<_, SqlValue>(5)?,
                        row.get::<_, SqlValue>(6)?,
                        row.get::<_, SqlValue>(7)?,
                        row.get::<_, SqlValue>(8)?,
                    ],
                ))
            })
            .with_context(|| format!("failed to query legacy table {}", self.table))?;

        let mut entries = Vec::new();
        for row in rows {
            let (raw_unit, raw_date, counters) =
                row.with_context(|| format!("failed to read legacy row from {}", self.table))?;
            let entry = decode_archive_row(&raw_unit, &raw_date, counters);
            if let Err(failure) = &entry {
                tracing::debug!(reason = %failure.reason, "legacy row could not be decoded");
            }
            entries.push(entry);
        }

        tracing::debug!(table = %self.table, records = entries.len(), "read legacy archive records");
        Ok(entries)
    }
}

fn decode_archive_row(
    raw_unit: &SqlValue,
    raw_date: &SqlValue,
    counters: [SqlValue; 7],
) -> LegacyEntry<ArchiveRecord> {
    let unit_id = match raw_unit {
        SqlValue::Integer(unit) => Some(UnitId(*unit)),
        _ => None,
    };
    let date_text = match raw_date {
        SqlValue::Text(text) => text.clone(),
        other => describe(other),
    };
    let undecodable = |reason: String| RecordFailure { unit_id, period_date: date_text.clone(), reason };

    let Some(unit_id) = unit_id else {
        return Err(undecodable(format!("legacy unit id {} is not an integer", describe(raw_unit))));
    };
    let period_date = match raw_date {
        SqlValue::Text(text) => parse_period_date(text)
            .map_err(|err| undecodable(format!("legacy date {text:?} is invalid: {err}")))?,
        other => {
            return Err(undecodable(format!("legacy date {} is not a text date", describe(other))));
        }
    };

    let [incoming, outgoing, dispositions, files, permanent, destroyed, followed_up] =
        counters.map(counter_value);
    Ok(ArchiveRecord {
        unit_id,
        period_date,
        incoming_documents: incoming,
        outgoing_documents: outgoing,
        dispositions,
        files,
        permanent_retention: permanent,
        destroyed_retention: destroyed,
        followed_up_documents: followed_up,
    })
}

fn counter_value(raw: SqlValue) -> Value {
    match raw {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(number) => Value::from(number),
        SqlValue::Real(number) => Value::from(number),
        SqlValue::Text(text) => Value::String(text),
        SqlValue::Blob(bytes) => Value::String(format!("<{} byte blob>", bytes.len())),
    }
}

fn describe(raw: &SqlValue) -> String {
    match raw {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Integer(number) => number.to_string(),
        SqlValue::Real(number) => number.to_string(),
        SqlValue::Text(text) => format!("{text:?}"),
        SqlValue::Blob(bytes) => format!("<{} byte blob>", bytes.len()),
    }
}
