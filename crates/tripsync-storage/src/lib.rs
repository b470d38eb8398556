//! Store abstraction for tripsync: the `Store` trait the sync engine drives,
//! the surrogate key deriver, and the PostgreSQL and in-memory stores.

use async_trait::async_trait;
use thiserror::Error;
use tripsync_core::{ColumnSpec, ColumnType, Ident, IdentError, RelationDescriptor};

pub mod memory;
pub mod postgres;
pub mod surrogate;

pub use memory::MemoryStore;
pub use postgres::{ConnectionOverrides, PgStore, StoreConfig};
pub use surrogate::{
    derive_surrogate_key, derive_surrogate_key_from_fields, sha256_hex, surrogate_key_sql,
};

pub const CRATE_NAME: &str = "tripsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("relation {0} does not exist")]
    RelationNotFound(String),
    #[error("column {column} does not exist in {relation}")]
    ColumnNotFound { relation: String, column: String },
    #[error("column {column} already exists in {relation}")]
    ColumnExists { relation: String, column: String },
    #[error("duplicate surrogate identity while writing {relation}")]
    DuplicateIdentity { relation: String },
    #[error(transparent)]
    Ident(#[from] IdentError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Staging column copied into a final column of the same normalized name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub source: Ident,
    pub target: Ident,
}

/// Everything a store needs to run the set-oriented merge statements for one
/// staging/final pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub staging: Ident,
    pub final_relation: Ident,
    pub identity: Ident,
    /// Business key columns, physical staging names, in key order.
    pub business_key: Vec<Ident>,
    pub columns: Vec<ColumnMapping>,
}

/// Relational store operations used by one synchronization run.
///
/// Every method is a single blocking statement from the caller's point of
/// view. Implementations do not retry.
#[async_trait]
pub trait Store: Send {
    /// Live shape of `relation`, or `None` when it does not exist.
    async fn describe(
        &mut self,
        relation: &Ident,
    ) -> Result<Option<RelationDescriptor>, StoreError>;

    /// Creates `relation` with the surrogate identity, the given columns and
    /// the bookkeeping timestamps. A no-op when the relation already exists.
    async fn create_relation(
        &mut self,
        relation: &Ident,
        columns: &[ColumnSpec],
    ) -> Result<(), StoreError>;

    async fn add_column(
        &mut self,
        relation: &Ident,
        column: &Ident,
        column_type: &ColumnType,
    ) -> Result<(), StoreError>;

    async fn rename_column(
        &mut self,
        relation: &Ident,
        from: &Ident,
        to: &Ident,
    ) -> Result<(), StoreError>;

    /// Deletes all but the max-tie-break row per business key, returning the
    /// number of rows removed.
    async fn deduplicate(
        &mut self,
        relation: &Ident,
        business_key: &[Ident],
        tie_break: &Ident,
    ) -> Result<u64, StoreError>;

    /// Inserts staging rows whose derived identity is absent from the final
    /// relation. Returns the number of rows inserted.
    async fn insert_missing(&mut self, plan: &MergePlan) -> Result<u64, StoreError>;

    /// Rewrites final rows whose identity matches a staging row and whose
    /// mapped values differ. Returns the number of rows updated.
    async fn update_changed(&mut self, plan: &MergePlan) -> Result<u64, StoreError>;
}
