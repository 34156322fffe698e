use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::macros::format_description;
use time::{Date, OffsetDateTime};
use ulid::Ulid;

pub const MAX_NAME_LEN: usize = 100;

time::serde::format_description!(pub period_date_serde, Date, "[year]-[month]-[day]");

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TableError {
    #[error("table already exists: {name}")]
    DuplicateTable { name: String },
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
    #[error("schema unavailable for table {name}: {reason}")]
    SchemaUnavailable { name: String, reason: String },
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("row already exists for {key}")]
    DuplicateRow { key: NaturalKey },
    #[error("non-numeric value {value} in summable column {column}")]
    NonNumericSummableValue { column: String, value: String },
    #[error("total overflowed while adding column {column}")]
    AggregateOverflow { column: String },
    #[error("value {value} in column {column} is outside the supported decimal range")]
    ValueOutOfRange { column: String, value: String },
    #[error("table not found: {0}")]
    TableNotFound(String),
    #[error("row not found: {0}")]
    RowNotFound(RowId),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableId(pub Ulid);

impl TableId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TableId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TableId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ColumnId(pub Ulid);

impl ColumnId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ColumnId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ColumnId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RowId(pub Ulid);

impl RowId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RowId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RowId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the organizational unit a row reports for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UnitId(pub i64);

impl Display for UnitId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Integer,
    Decimal,
    Text,
    Date,
    Boolean,
}

impl DataType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Decimal => "decimal",
            Self::Text => "text",
            Self::Date => "date",
            Self::Boolean => "boolean",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "integer" => Some(Self::Integer),
            "decimal" => Some(Self::Decimal),
            "text" => Some(Self::Text),
            "date" => Some(Self::Date),
            "boolean" => Some(Self::Boolean),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Decimal)
    }
}

/// Key-value data carried by a row, keyed by column name.
pub type Payload = BTreeMap<String, Value>;

fn default_data_type() -> String {
    DataType::Integer.as_str().to_string()
}

fn default_true() -> bool {
    true
}

/// One requested column of a table about to be created.
///
/// `data_type` stays a raw string until validation so that an unknown type name
/// surfaces as an invalid schema instead of a decode failure.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub display_name: String,
    #[serde(default = "default_data_type")]
    pub data_type: String,
    #[serde(default = "default_true")]
    pub is_summable: bool,
    #[serde(default)]
    pub is_required: bool,
}

impl ColumnSpec {
    #[must_use]
    pub fn new(name: &str, display_name: &str, data_type: DataType, is_summable: bool) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            data_type: data_type.as_str().to_string(),
            is_summable,
            is_required: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TableSpec {
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub columns: Vec<ColumnSpec>,
}

impl TableSpec {
    /// Check a table request before anything is persisted.
    ///
    /// # Errors
    /// Returns [`TableError::InvalidSchema`] when the table or a column name is
    /// malformed, the column list is empty or repeats a name, a data type is
    /// unknown, or a non-numeric column is flagged summable.
    pub fn validate(&self) -> Result<(), TableError> {
        validate_identifier("table", &self.name)?;
        if self.display_name.trim().is_empty() {
            return Err(TableError::InvalidSchema(format!(
                "table {} MUST have a display_name",
                self.name
            )));
        }

        if self.columns.is_empty() {
            return Err(TableError::InvalidSchema(format!(
                "table {} MUST declare at least one column",
                self.name
            )));
        }

        let mut seen = BTreeSet::new();
        for column in &self.columns {
            validate_identifier("column", &column.name)?;
            if !seen.insert(column.name.as_str()) {
                return Err(TableError::InvalidSchema(format!(
                    "duplicate column name: {}",
                    column.name
                )));
            }
            if column.display_name.trim().is_empty() {
                return Err(TableError::InvalidSchema(format!(
                    "column {} MUST have a display_name",
                    column.name
                )));
            }
            let Some(data_type) = DataType::parse(&column.data_type) else {
                return Err(TableError::InvalidSchema(format!(
                    "unrecognized data_type {} for column {}",
                    column.data_type, column.name
                )));
            };
            if column.is_summable && !data_type.is_numeric() {
                return Err(TableError::InvalidSchema(format!(
                    "column {} is summable but has non-numeric data_type {}",
                    column.name, column.data_type
                )));
            }
        }

        Ok(())
    }

    /// Turn a validated request into the definitions to persist, assigning ids and
    /// 0-based column order from input position.
    ///
    /// # Errors
    /// Returns [`TableError::InvalidSchema`] under the same conditions as [`Self::validate`].
    pub fn into_definitions(
        self,
        is_default: bool,
        created_at: OffsetDateTime,
    ) -> Result<TableSchema, TableError> {
        self.validate()?;

        let table = TableDefinition {
            id: TableId::new(),
            name: self.name,
            display_name: self.display_name,
            description: self.description,
            is_default,
            created_at,
        };

        let mut columns = Vec::with_capacity(self.columns.len());
        for (order, column) in self.columns.into_iter().enumerate() {
            let data_type = DataType::parse(&column.data_type).ok_or_else(|| {
                TableError::InvalidSchema(format!("unrecognized data_type {}", column.data_type))
            })?;
            let order = u32::try_from(order).map_err(|_| {
                TableError::InvalidSchema("too many columns for one table".to_string())
            })?;
            columns.push(ColumnDefinition {
                id: ColumnId::new(),
                table_id: table.id,
                name: column.name,
                display_name: column.display_name,
                data_type,
                is_summable: column.is_summable,
                is_required: column.is_required,
                order,
            });
        }

        Ok(TableSchema { table, columns })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableDefinition {
    pub id: TableId,
    pub name: String,
    pub display_name: String,
    pub description: Option<String>,
    pub is_default: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub id: ColumnId,
    pub table_id: TableId,
    pub name: String,
    pub display_name: String,
    pub data_type: DataType,
    pub is_summable: bool,
    pub is_required: bool,
    pub order: u32,
}

/// A table together with its columns in display order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableSchema {
    pub table: TableDefinition,
    pub columns: Vec<ColumnDefinition>,
}

impl TableSchema {
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|column| column.name == name)
    }

    #[must_use]
    pub fn summable_columns(&self) -> Vec<&ColumnDefinition> {
        self.columns.iter().filter(|column| column.is_summable).collect()
    }
}

/// The (table, unit, date) triple identifying at most one row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NaturalKey {
    pub table_id: TableId,
    pub unit_id: UnitId,
    #[serde(with = "period_date_serde")]
    pub period_date: Date,
}

impl Display for NaturalKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "table {} unit {} date {}-{:02}-{:02}",
            self.table_id,
            self.unit_id,
            self.period_date.year(),
            u8::from(self.period_date.month()),
            self.period_date.day()
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataRow {
    pub id: RowId,
    pub table_id: TableId,
    pub unit_id: UnitId,
    #[serde(with = "period_date_serde")]
    pub period_date: Date,
    pub payload: Payload,
    pub total: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl DataRow {
    #[must_use]
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey { table_id: self.table_id, unit_id: self.unit_id, period_date: self.period_date }
    }
}

/// A payload that passed validation against its table's columns, paired with
/// the total derived from it. Writers only accept this type, so a stored total
/// always comes from [`compute_total`].
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRow {
    key: NaturalKey,
    payload: Payload,
    total: Decimal,
}

impl PreparedRow {
    /// Validate `payload` for `key` and derive its total.
    ///
    /// # Errors
    /// Returns [`TableError::SchemaMismatch`] when a column belongs to another
    /// table or the payload does not fit the columns, and the errors of
    /// [`compute_total`] for bad summable values.
    pub fn prepare(
        key: NaturalKey,
        payload: Payload,
        columns: &[ColumnDefinition],
    ) -> Result<Self, TableError> {
        if let Some(foreign) = columns.iter().find(|column| column.table_id != key.table_id) {
            return Err(TableError::SchemaMismatch(format!(
                "column {} belongs to table {}, not {}",
                foreign.name, foreign.table_id, key.table_id
            )));
        }
        let total = evaluate_payload(&payload, columns)?;
        Ok(Self { key, payload, total })
    }

    #[must_use]
    pub fn key(&self) -> NaturalKey {
        self.key
    }

    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    #[must_use]
    pub fn total(&self) -> Decimal {
        self.total
    }
}

/// Parse a `YYYY-MM-DD` reporting date.
///
/// # Errors
/// Returns a parse error when `raw` is not a valid calendar date in that format.
pub fn parse_period_date(raw: &str) -> Result<Date, time::error::Parse> {
    Date::parse(raw.trim(), format_description!("[year]-[month]-[day]"))
}

/// Format a reporting date as `YYYY-MM-DD`.
///
/// # Errors
/// Returns a format error when the date cannot be rendered.
pub fn format_period_date(date: Date) -> Result<String, time::error::Format> {
    date.format(format_description!("[year]-[month]-[day]"))
}

/// Compute a row's derived total: the sum of its summable columns in column order.
///
/// Absent and null values contribute zero. Non-summable columns never contribute.
///
/// # Errors
/// Returns [`TableError::NonNumericSummableValue`] when a summable column holds a
/// value that is not a number (or not a whole number for `integer` columns),
/// [`TableError::ValueOutOfRange`] for a number no decimal can hold, and
/// [`TableError::AggregateOverflow`] when the sum leaves the decimal range.
pub fn compute_total(payload: &Payload, columns: &[ColumnDefinition]) -> Result<Decimal, TableError> {
    let mut ordered = columns.iter().filter(|column| column.is_summable).collect::<Vec<_>>();
    ordered.sort_by_key(|column| column.order);

    let mut total = Decimal::ZERO;
    for column in ordered {
        let value = match payload.get(&column.name) {
            None | Some(Value::Null) => continue,
            Some(value) => value,
        };
        let numeric = match (numeric_value(value, column.data_type), value) {
            (Some(numeric), _) => numeric,
            (None, Value::Number(number)) if decimal_from_number(number).is_none() => {
                return Err(TableError::ValueOutOfRange {
                    column: column.name.clone(),
                    value: value.to_string(),
                });
            }
            (None, _) => {
                return Err(TableError::NonNumericSummableValue {
                    column: column.name.clone(),
                    value: value.to_string(),
                });
            }
        };
        total = total
            .checked_add(numeric)
            .ok_or_else(|| TableError::AggregateOverflow { column: column.name.clone() })?;
    }

    Ok(total.normalize())
}

/// Check a payload against its table's columns: no unknown keys, every required
/// column present and non-null, non-summable values of the declared type.
///
/// Summable values are checked by [`compute_total`].
///
/// # Errors
/// Returns [`TableError::SchemaMismatch`] naming the first offending key.
pub fn validate_payload(payload: &Payload, columns: &[ColumnDefinition]) -> Result<(), TableError> {
    let by_name =
        columns.iter().map(|column| (column.name.as_str(), column)).collect::<BTreeMap<_, _>>();

    for key in payload.keys() {
        if !by_name.contains_key(key.as_str()) {
            return Err(TableError::SchemaMismatch(format!("unknown column {key}")));
        }
    }

    for column in columns {
        let value = payload.get(&column.name);
        if column.is_required && matches!(value, None | Some(Value::Null)) {
            return Err(TableError::SchemaMismatch(format!(
                "required column {} is missing",
                column.name
            )));
        }
        if column.is_summable {
            continue;
        }
        if let Some(value) = value {
            if !value_matches_type(value, column.data_type) {
                return Err(TableError::SchemaMismatch(format!(
                    "column {} expects {} but got {value}",
                    column.name,
                    column.data_type.as_str()
                )));
            }
        }
    }

    Ok(())
}

/// Validate a payload and compute its total in one step; what every write path runs.
///
/// # Errors
/// Returns the errors of [`validate_payload`] first, then those of [`compute_total`].
pub fn evaluate_payload(payload: &Payload, columns: &[ColumnDefinition]) -> Result<Decimal, TableError> {
    validate_payload(payload, columns)?;
    compute_total(payload, columns)
}

#[must_use]
pub fn numeric_value(value: &Value, data_type: DataType) -> Option<Decimal> {
    let Value::Number(number) = value else {
        return None;
    };

    let parsed = decimal_from_number(number)?;
    if data_type == DataType::Integer && !parsed.fract().is_zero() {
        return None;
    }

    Some(parsed)
}

fn decimal_from_number(number: &serde_json::Number) -> Option<Decimal> {
    if let Some(integer) = number.as_i64() {
        return Some(Decimal::from(integer));
    }
    if let Some(integer) = number.as_u64() {
        return Some(Decimal::from(integer));
    }
    let raw = number.to_string();
    Decimal::from_str(&raw).or_else(|_| Decimal::from_scientific(&raw)).ok()
}

fn value_matches_type(value: &Value, data_type: DataType) -> bool {
    match (data_type, value) {
        (_, Value::Null) => true,
        (DataType::Integer | DataType::Decimal, _) => numeric_value(value, data_type).is_some(),
        (DataType::Text, Value::String(_)) | (DataType::Boolean, Value::Bool(_)) => true,
        (DataType::Date, Value::String(raw)) => parse_period_date(raw).is_ok(),
        _ => false,
    }
}

fn validate_identifier(kind: &str, name: &str) -> Result<(), TableError> {
    let mut chars = name.chars();
    let starts_with_letter = chars.next().is_some_and(|first| first.is_ascii_lowercase());
    let rest_ok = chars.all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_');

    if !starts_with_letter || !rest_ok || name.len() > MAX_NAME_LEN {
        return Err(TableError::InvalidSchema(format!(
            "{kind} name {name:?} MUST match [a-z][a-z0-9_]* and be at most {MAX_NAME_LEN} characters"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;
    use time::macros::{date, datetime};

    use super::*;

    fn fixture_time() -> OffsetDateTime {
        datetime!(2026-01-15 08:00:00 UTC)
    }

    fn abc_columns() -> Vec<ColumnDefinition> {
        let spec = TableSpec {
            name: "abc".to_string(),
            display_name: "ABC".to_string(),
            description: None,
            columns: vec![
                ColumnSpec::new("a", "A", DataType::Integer, true),
                ColumnSpec::new("b", "B", DataType::Integer, true),
                ColumnSpec::new("c", "C", DataType::Integer, false),
            ],
        };
        match spec.into_definitions(true, fixture_time()) {
            Ok(schema) => schema.columns,
            Err(err) => panic!("fixture spec should be valid: {err}"),
        }
    }

    fn payload(value: Value) -> Payload {
        match serde_json::from_value(value) {
            Ok(payload) => payload,
            Err(err) => panic!("fixture payload should decode: {err}"),
        }
    }

    fn assert_invalid_schema(spec: &TableSpec, expected_substring: &str) {
        match spec.validate() {
            Err(TableError::InvalidSchema(message)) => assert!(
                message.contains(expected_substring),
                "expected `{expected_substring}` in `{message}`"
            ),
            other => panic!("expected invalid schema, got {other:?}"),
        }
    }

    #[test]
    fn total_sums_only_summable_columns() -> Result<(), TableError> {
        let columns = abc_columns();
        assert_eq!(compute_total(&payload(json!({"a": 3, "b": 4, "c": 100})), &columns)?, Decimal::from(7));
        assert_eq!(compute_total(&payload(json!({"a": 3})), &columns)?, Decimal::from(3));
        Ok(())
    }

    #[test]
    fn total_treats_null_as_zero() -> Result<(), TableError> {
        let columns = abc_columns();
        assert_eq!(compute_total(&payload(json!({"a": null, "b": 2})), &columns)?, Decimal::from(2));
        assert_eq!(compute_total(&Payload::new(), &columns)?, Decimal::ZERO);
        Ok(())
    }

    #[test]
    fn total_rejects_non_numeric_summable_value() {
        let columns = abc_columns();
        let result = compute_total(&payload(json!({"a": "three"})), &columns);
        assert_eq!(
            result,
            Err(TableError::NonNumericSummableValue {
                column: "a".to_string(),
                value: "\"three\"".to_string(),
            })
        );
    }

    #[test]
    fn total_rejects_fraction_in_integer_column() {
        let columns = abc_columns();
        let result = compute_total(&payload(json!({"a": 2.5})), &columns);
        assert!(matches!(result, Err(TableError::NonNumericSummableValue { .. })));
    }

    #[test]
    fn number_beyond_decimal_range_is_out_of_range_not_non_numeric() -> Result<(), TableError> {
        let spec = TableSpec {
            name: "huge".to_string(),
            display_name: "Huge".to_string(),
            description: None,
            columns: vec![ColumnSpec::new("x", "X", DataType::Decimal, true)],
        };
        let columns = spec.into_definitions(false, fixture_time())?.columns;
        let result = compute_total(&payload(json!({"x": 1e30})), &columns);
        assert!(
            matches!(&result, Err(TableError::ValueOutOfRange { column, .. }) if column == "x"),
            "got {result:?}"
        );

        let integer = compute_total(&payload(json!({"a": 1e30})), &abc_columns());
        assert!(matches!(integer, Err(TableError::ValueOutOfRange { .. })));
        Ok(())
    }

    #[test]
    fn decimal_columns_sum_exactly() -> Result<(), TableError> {
        let spec = TableSpec {
            name: "money".to_string(),
            display_name: "Money".to_string(),
            description: None,
            columns: vec![
                ColumnSpec::new("x", "X", DataType::Decimal, true),
                ColumnSpec::new("y", "Y", DataType::Decimal, true),
            ],
        };
        let columns = spec.into_definitions(false, fixture_time())?.columns;
        let total = compute_total(&payload(json!({"x": 0.1, "y": 0.2})), &columns)?;
        assert_eq!(total.to_string(), "0.3");
        Ok(())
    }

    #[test]
    fn column_order_follows_input_position() {
        let columns = abc_columns();
        let orders =
            columns.iter().map(|column| (column.name.as_str(), column.order)).collect::<Vec<_>>();
        assert_eq!(orders, vec![("a", 0), ("b", 1), ("c", 2)]);
    }

    #[test]
    fn validate_rejects_empty_columns() {
        let spec = TableSpec {
            name: "empty".to_string(),
            display_name: "Empty".to_string(),
            description: None,
            columns: vec![],
        };
        assert_invalid_schema(&spec, "at least one column");
    }

    #[test]
    fn validate_rejects_duplicate_column_names() {
        let spec = TableSpec {
            name: "dupes".to_string(),
            display_name: "Dupes".to_string(),
            description: None,
            columns: vec![
                ColumnSpec::new("a", "A", DataType::Integer, true),
                ColumnSpec::new("a", "A again", DataType::Integer, true),
            ],
        };
        assert_invalid_schema(&spec, "duplicate column name");
    }

    #[test]
    fn validate_rejects_unknown_data_type() {
        let mut column = ColumnSpec::new("a", "A", DataType::Integer, false);
        column.data_type = "money".to_string();
        let spec = TableSpec {
            name: "typed".to_string(),
            display_name: "Typed".to_string(),
            description: None,
            columns: vec![column],
        };
        assert_invalid_schema(&spec, "unrecognized data_type");
    }

    #[test]
    fn validate_rejects_summable_text_column() {
        let spec = TableSpec {
            name: "notes".to_string(),
            display_name: "Notes".to_string(),
            description: None,
            columns: vec![ColumnSpec::new("note", "Note", DataType::Text, true)],
        };
        assert_invalid_schema(&spec, "non-numeric data_type");
    }

    #[test]
    fn validate_rejects_malformed_names() {
        for name in ["", "Data", "1st", "with space", "semi;colon"] {
            let spec = TableSpec {
                name: name.to_string(),
                display_name: "Bad".to_string(),
                description: None,
                columns: vec![ColumnSpec::new("a", "A", DataType::Integer, true)],
            };
            assert_invalid_schema(&spec, "MUST match");
        }
    }

    #[test]
    fn column_spec_defaults_decode_from_yaml_like_json() -> Result<(), serde_json::Error> {
        let column: ColumnSpec = serde_json::from_value(json!({"name": "a", "display_name": "A"}))?;
        assert_eq!(column.data_type, "integer");
        assert!(column.is_summable);
        assert!(!column.is_required);
        Ok(())
    }

    #[test]
    fn payload_with_unknown_key_is_a_mismatch() {
        let columns = abc_columns();
        let result = validate_payload(&payload(json!({"a": 1, "zzz": 2})), &columns);
        assert_eq!(result, Err(TableError::SchemaMismatch("unknown column zzz".to_string())));
    }

    #[test]
    fn payload_type_checks_non_summable_columns() -> Result<(), TableError> {
        let spec = TableSpec {
            name: "mixed".to_string(),
            display_name: "Mixed".to_string(),
            description: None,
            columns: vec![
                ColumnSpec::new("count", "Count", DataType::Integer, true),
                ColumnSpec::new("note", "Note", DataType::Text, false),
                ColumnSpec::new("seen_on", "Seen On", DataType::Date, false),
                ColumnSpec::new("closed", "Closed", DataType::Boolean, false),
            ],
        };
        let columns = spec.into_definitions(false, fixture_time())?.columns;

        validate_payload(
            &payload(json!({"count": 1, "note": "ok", "seen_on": "2026-01-31", "closed": false})),
            &columns,
        )?;
        assert!(validate_payload(&payload(json!({"note": 5})), &columns).is_err());
        assert!(validate_payload(&payload(json!({"seen_on": "31/01/2026"})), &columns).is_err());
        assert!(validate_payload(&payload(json!({"closed": "yes"})), &columns).is_err());
        validate_payload(&payload(json!({"note": null})), &columns)?;
        Ok(())
    }

    #[test]
    fn required_column_must_be_present() -> Result<(), TableError> {
        let mut required = ColumnSpec::new("a", "A", DataType::Integer, true);
        required.is_required = true;
        let spec = TableSpec {
            name: "strict".to_string(),
            display_name: "Strict".to_string(),
            description: None,
            columns: vec![required],
        };
        let columns = spec.into_definitions(false, fixture_time())?.columns;
        assert!(matches!(
            evaluate_payload(&payload(json!({"a": null})), &columns),
            Err(TableError::SchemaMismatch(_))
        ));
        assert_eq!(evaluate_payload(&payload(json!({"a": 9})), &columns)?, Decimal::from(9));
        Ok(())
    }

    #[test]
    fn prepared_row_carries_computed_total() -> Result<(), TableError> {
        let columns = abc_columns();
        let key = NaturalKey {
            table_id: columns[0].table_id,
            unit_id: UnitId(7),
            period_date: date!(2026 - 01 - 31),
        };
        let prepared = PreparedRow::prepare(key, payload(json!({"a": 3, "b": 4, "c": 100})), &columns)?;
        assert_eq!(prepared.total(), Decimal::from(7));
        assert_eq!(prepared.key(), key);
        Ok(())
    }

    #[test]
    fn prepared_row_rejects_columns_of_another_table() {
        let columns = abc_columns();
        let key = NaturalKey {
            table_id: TableId::new(),
            unit_id: UnitId(7),
            period_date: date!(2026 - 01 - 31),
        };
        let result = PreparedRow::prepare(key, payload(json!({"a": 1})), &columns);
        assert!(matches!(result, Err(TableError::SchemaMismatch(_))));
    }

    #[test]
    fn period_date_round_trips_through_text() -> Result<(), Box<dyn std::error::Error>> {
        let parsed = parse_period_date("2026-02-28")?;
        assert_eq!(parsed, date!(2026 - 02 - 28));
        assert_eq!(format_period_date(parsed)?, "2026-02-28");
        assert!(parse_period_date("2026-02-30").is_err());
        Ok(())
    }

    #[test]
    fn natural_key_display_names_unit_and_date() {
        let key = NaturalKey {
            table_id: TableId::new(),
            unit_id: UnitId(42),
            period_date: date!(2026 - 03 - 01),
        };
        let rendered = key.to_string();
        assert!(rendered.contains("unit 42"));
        assert!(rendered.ends_with("date 2026-03-01"));
    }

    proptest! {
        #[test]
        fn property_total_ignores_non_summable_values(a in -10_000_i64..10_000, b in -10_000_i64..10_000, c_first in any::<i64>(), c_second in any::<i64>()) {
            let columns = abc_columns();
            let first = compute_total(&payload(json!({"a": a, "b": b, "c": c_first})), &columns);
            let second = compute_total(&payload(json!({"a": a, "b": b, "c": c_second})), &columns);
            prop_assert_eq!(first.clone(), second);
            prop_assert_eq!(first, Ok(Decimal::from(a + b)));
        }
    }

    proptest! {
        #[test]
        fn property_missing_value_equals_zero(a in -10_000_i64..10_000) {
            let columns = abc_columns();
            let missing = compute_total(&payload(json!({"a": a})), &columns);
            let zero = compute_total(&payload(json!({"a": a, "b": 0})), &columns);
            let null = compute_total(&payload(json!({"a": a, "b": null})), &columns);
            prop_assert_eq!(missing.clone(), zero);
            prop_assert_eq!(missing, null);
        }
    }
}
