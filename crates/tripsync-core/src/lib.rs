//! Core domain model for tripsync: identifiers, column types, relation
//! descriptors and the canonical entity schemas.

use std::fmt;

use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "tripsync-core";

/// Surrogate identity column carried by every final relation.
pub const SURROGATE_KEY_COLUMN: &str = "surrogate_key";
pub const INSERT_TIME_COLUMN: &str = "insert_time";
pub const UPDATE_TIME_COLUMN: &str = "update_time";
pub const ARCHIVED_SUFFIX: &str = "_archived";

/// Longest identifier PostgreSQL keeps without truncation (NAMEDATALEN - 1).
pub const MAX_IDENT_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentError {
    #[error("identifier is empty")]
    Empty,
    #[error("identifier `{0}` is longer than {MAX_IDENT_LEN} bytes")]
    TooLong(String),
    #[error("identifier `{0}` contains characters outside [A-Za-z0-9_] or starts with a digit")]
    Invalid(String),
}

/// A SQL identifier that passed validation and may be interpolated into a
/// statement. Rendering always double-quotes, so case is preserved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ident(String);

impl Ident {
    pub fn new(raw: impl Into<String>) -> Result<Self, IdentError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(IdentError::Empty);
        }
        if raw.len() > MAX_IDENT_LEN {
            return Err(IdentError::TooLong(raw));
        }
        let mut chars = raw.chars();
        let first_ok = chars
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false);
        if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(IdentError::Invalid(raw));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Upper-cased form used when comparing staging and final columns.
    pub fn normalized(&self) -> String {
        normalize_column_name(&self.0)
    }

    pub fn quoted(&self) -> String {
        // Validation already rules out embedded quotes.
        format!("\"{}\"", self.0)
    }

    /// `<name>_archived`, validated like any other identifier.
    pub fn archived(&self) -> Result<Self, IdentError> {
        Self::new(format!("{}{}", self.0, ARCHIVED_SUFFIX))
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Ident {
    type Error = IdentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Ident> for String {
    fn from(value: Ident) -> Self {
        value.0
    }
}

pub fn normalize_column_name(name: &str) -> String {
    name.to_ascii_uppercase()
}

pub fn is_archived_name(normalized: &str) -> bool {
    normalized.ends_with(&ARCHIVED_SUFFIX.to_ascii_uppercase())
}

/// Physical column type as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ColumnType {
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Numeric,
    Boolean,
    Text,
    Varchar,
    Timestamp,
    TimestampTz,
    Date,
    Other(String),
}

impl ColumnType {
    /// Parses a PostgreSQL `udt_name` (`int8`, `float8`, ...) or a SQL type
    /// spelling (`bigint`, `double precision`, ...).
    pub fn parse(raw: &str) -> Self {
        let lowered = raw.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "int2" | "smallint" => Self::SmallInt,
            "int4" | "int" | "integer" => Self::Integer,
            "int8" | "bigint" => Self::BigInt,
            "float4" | "real" => Self::Real,
            "float8" | "float" | "double" | "double precision" => Self::Double,
            "numeric" | "decimal" => Self::Numeric,
            "bool" | "boolean" => Self::Boolean,
            "text" => Self::Text,
            "varchar" | "character varying" => Self::Varchar,
            "timestamp" | "timestamp without time zone" => Self::Timestamp,
            "timestamptz" | "timestamp with time zone" => Self::TimestampTz,
            "date" => Self::Date,
            _ => Self::Other(lowered),
        }
    }

    /// Type spelling for DDL. `Other` names come from introspection and must
    /// still look like a bare identifier before they are emitted.
    pub fn to_sql(&self) -> Result<String, IdentError> {
        let sql = match self {
            Self::SmallInt => "SMALLINT",
            Self::Integer => "INTEGER",
            Self::BigInt => "BIGINT",
            Self::Real => "REAL",
            Self::Double => "DOUBLE PRECISION",
            Self::Numeric => "NUMERIC",
            Self::Boolean => "BOOLEAN",
            Self::Text => "TEXT",
            Self::Varchar => "VARCHAR",
            Self::Timestamp => "TIMESTAMP",
            Self::TimestampTz => "TIMESTAMPTZ",
            Self::Date => "DATE",
            Self::Other(name) => return Ident::new(name.clone()).map(|ident| ident.0),
        };
        Ok(sql.to_string())
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_sql() {
            Ok(sql) => f.write_str(&sql),
            Err(_) => write!(f, "{self:?}"),
        }
    }
}

impl From<String> for ColumnType {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<ColumnType> for String {
    fn from(value: ColumnType) -> Self {
        match value {
            ColumnType::Other(name) => name,
            other => other.to_sql().unwrap_or_default().to_ascii_lowercase(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDescriptor {
    /// Upper-cased comparison name.
    pub name: String,
    /// Name as it exists in the store.
    pub physical: Ident,
    pub column_type: ColumnType,
}

impl ColumnDescriptor {
    pub fn new(physical: Ident, column_type: ColumnType) -> Self {
        Self {
            name: physical.normalized(),
            physical,
            column_type,
        }
    }
}

/// Live shape of one relation, read fresh from the store on every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelationDescriptor {
    pub name: Ident,
    pub columns: Vec<ColumnDescriptor>,
    pub identity: Vec<String>,
}

impl RelationDescriptor {
    pub fn column(&self, normalized: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == normalized)
    }

    pub fn has_column(&self, normalized: &str) -> bool {
        self.column(normalized).is_some()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// One cell value, used by the in-memory store and the standalone key path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Timestamp(NaiveDateTime),
    Text(String),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Text rendering matching PostgreSQL's `::text` cast output.
    pub fn to_key_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(b) => Some(b.to_string()),
            Self::Int(i) => Some(i.to_string()),
            Self::Float(f) => Some(float_text(*f)),
            Self::Timestamp(ts) => Some(timestamp_text(ts)),
            Self::Text(s) => Some(s.clone()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }
}

fn float_text(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    let magnitude = value.abs();
    if magnitude != 0.0 && !(1e-4..1e15).contains(&magnitude) {
        // `1.5e-5` -> `1.5e-05`, `1e20` -> `1e+20`
        let rendered = format!("{value:e}");
        if let Some((mantissa, exponent)) = rendered.split_once('e') {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exponent),
            };
            return format!("{mantissa}e{sign}{digits:0>2}");
        }
        return rendered;
    }
    value.to_string()
}

fn timestamp_text(ts: &NaiveDateTime) -> String {
    let base = ts.format("%Y-%m-%d %H:%M:%S").to_string();
    let micros = ts.nanosecond() / 1_000;
    if micros == 0 {
        return base;
    }
    let fraction = format!("{micros:06}");
    format!("{base}.{}", fraction.trim_end_matches('0'))
}

/// Declared column of a canonical entity schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: Ident,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

/// Everything the engine needs to know about one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySpec {
    pub entity_type: String,
    pub staging_relation: Ident,
    pub final_relation: Ident,
    pub business_key: Vec<Ident>,
    pub tie_break: Ident,
    pub columns: Vec<ColumnSpec>,
}

impl EntitySpec {
    pub fn declares(&self, column: &str) -> bool {
        let normalized = normalize_column_name(column);
        self.columns.iter().any(|c| c.name.normalized() == normalized)
    }
}

fn spec_columns(columns: &[(&str, ColumnType)]) -> Vec<ColumnSpec> {
    columns
        .iter()
        .map(|(name, column_type)| ColumnSpec {
            name: Ident((*name).to_string()),
            column_type: column_type.clone(),
        })
        .collect()
}

fn ident(name: &str) -> Ident {
    Ident(name.to_string())
}

/// Canonical yellow taxi trip schema, spelled the way the loader lands it.
pub fn yellow_trips() -> EntitySpec {
    use ColumnType::*;
    EntitySpec {
        entity_type: "yellow_trips".to_string(),
        staging_relation: ident("_stg_yellow_trips"),
        final_relation: ident("yellow_trips"),
        business_key: vec![ident("VendorID"), ident("tpep_pickup_datetime")],
        tie_break: ident("total_amount"),
        columns: spec_columns(&[
            ("VendorID", Integer),
            ("tpep_pickup_datetime", Timestamp),
            ("tpep_dropoff_datetime", Timestamp),
            ("passenger_count", Double),
            ("trip_distance", Double),
            ("RatecodeID", Double),
            ("store_and_fwd_flag", Text),
            ("PULocationID", Integer),
            ("DOLocationID", Integer),
            ("payment_type", BigInt),
            ("fare_amount", Double),
            ("extra", Double),
            ("mta_tax", Double),
            ("tip_amount", Double),
            ("tolls_amount", Double),
            ("improvement_surcharge", Double),
            ("total_amount", Double),
            ("congestion_surcharge", Double),
            ("Airport_fee", Double),
        ]),
    }
}

/// Canonical green taxi trip schema.
pub fn green_trips() -> EntitySpec {
    use ColumnType::*;
    EntitySpec {
        entity_type: "green_trips".to_string(),
        staging_relation: ident("_stg_green_trips"),
        final_relation: ident("green_trips"),
        business_key: vec![ident("VendorID"), ident("lpep_pickup_datetime")],
        tie_break: ident("total_amount"),
        columns: spec_columns(&[
            ("VendorID", Integer),
            ("lpep_pickup_datetime", Timestamp),
            ("lpep_dropoff_datetime", Timestamp),
            ("store_and_fwd_flag", Text),
            ("RatecodeID", Double),
            ("PULocationID", Integer),
            ("DOLocationID", Integer),
            ("passenger_count", Double),
            ("trip_distance", Double),
            ("fare_amount", Double),
            ("extra", Double),
            ("mta_tax", Double),
            ("tip_amount", Double),
            ("tolls_amount", Double),
            ("ehail_fee", Double),
            ("improvement_surcharge", Double),
            ("total_amount", Double),
            ("payment_type", Double),
            ("trip_type", Double),
            ("congestion_surcharge", Double),
        ]),
    }
}

pub fn builtin_entities() -> Vec<EntitySpec> {
    vec![yellow_trips(), green_trips()]
}
