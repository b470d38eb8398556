//! Deterministic surrogate identities.
//!
//! A key tuple is encoded part by part as `<char_length>:<text>` (or `~` for
//! NULL), joined with `|`, and hashed with SHA-256. The length prefix keeps
//! `("1", "23")` and `("12", "3")` apart. [`surrogate_key_sql`] emits the same
//! computation as a PostgreSQL expression so rows hashed in the database and
//! tuples hashed here agree byte for byte.

use sha2::{Digest, Sha256};
use tripsync_core::{FieldValue, Ident};

const NULL_MARKER: &str = "~";
const PART_SEPARATOR: &str = "|";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn encode_part(value: Option<&str>) -> String {
    match value {
        Some(text) => format!("{}:{}", text.chars().count(), text),
        None => NULL_MARKER.to_string(),
    }
}

/// Derives the identity of one key tuple whose values are already rendered
/// as PostgreSQL `::text` output.
pub fn derive_surrogate_key<I, S>(values: I) -> String
where
    I: IntoIterator<Item = Option<S>>,
    S: AsRef<str>,
{
    let encoded = values
        .into_iter()
        .map(|value| encode_part(value.as_ref().map(|s| s.as_ref())))
        .collect::<Vec<_>>()
        .join(PART_SEPARATOR);
    sha256_hex(encoded.as_bytes())
}

pub fn derive_surrogate_key_from_fields(values: &[FieldValue]) -> String {
    derive_surrogate_key(values.iter().map(FieldValue::to_key_text))
}

/// SQL expression computing the identity of the row visible as `alias`.
pub fn surrogate_key_sql(columns: &[Ident], alias: &str) -> String {
    let parts = columns
        .iter()
        .map(|column| {
            let value = format!("({alias}.{})::text", column.quoted());
            format!("coalesce(length({value})::text || ':' || {value}, '{NULL_MARKER}')")
        })
        .collect::<Vec<_>>()
        .join(&format!(" || '{PART_SEPARATOR}' || "));
    format!("encode(sha256(convert_to({parts}, 'UTF8')), 'hex')")
}
