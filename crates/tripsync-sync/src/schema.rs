//! Schema inspection and drift reconciliation between a staging relation and
//! its final counterpart.

use std::collections::HashSet;

use serde::Serialize;
use tripsync_core::{
    is_archived_name, normalize_column_name, ColumnDescriptor, ColumnType, EntitySpec, Ident,
    RelationDescriptor, INSERT_TIME_COLUMN, SURROGATE_KEY_COLUMN, UPDATE_TIME_COLUMN,
};
use tripsync_storage::{Store, StoreError};

use crate::SyncError;

/// Reads the live descriptor of `relation`.
pub async fn inspect<S>(store: &mut S, relation: &Ident) -> Result<RelationDescriptor, SyncError>
where
    S: Store + ?Sized,
{
    store
        .describe(relation)
        .await?
        .ok_or_else(|| SyncError::RelationNotFound(relation.to_string()))
}

/// Descriptor the final relation will have right after creation from the
/// canonical schema.
pub fn canonical_final_descriptor(entity: &EntitySpec) -> Result<RelationDescriptor, SyncError> {
    let mut columns = vec![ColumnDescriptor::new(
        Ident::new(SURROGATE_KEY_COLUMN)?,
        ColumnType::Text,
    )];
    columns.extend(
        entity
            .columns
            .iter()
            .map(|c| ColumnDescriptor::new(c.name.clone(), c.column_type.clone())),
    );
    columns.push(ColumnDescriptor::new(Ident::new(INSERT_TIME_COLUMN)?, ColumnType::TimestampTz));
    columns.push(ColumnDescriptor::new(Ident::new(UPDATE_TIME_COLUMN)?, ColumnType::TimestampTz));
    Ok(RelationDescriptor {
        name: entity.final_relation.clone(),
        columns,
        identity: vec![normalize_column_name(SURROGATE_KEY_COLUMN)],
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeChange {
    pub column: ColumnDescriptor,
    pub new_type: ColumnType,
}

/// Added, removed and type-changed columns of one pair at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaDelta {
    /// Staging columns missing from final, staging order.
    pub added: Vec<ColumnDescriptor>,
    /// Final columns missing from staging, final order.
    pub removed: Vec<ColumnDescriptor>,
    /// Final columns whose staging type differs, staging order.
    pub retyped: Vec<TypeChange>,
}

impl SchemaDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.retyped.is_empty()
    }
}

fn excluded_names(final_relation: &RelationDescriptor) -> HashSet<String> {
    let mut names: HashSet<String> = [SURROGATE_KEY_COLUMN, INSERT_TIME_COLUMN, UPDATE_TIME_COLUMN]
        .iter()
        .map(|c| normalize_column_name(c))
        .collect();
    names.extend(final_relation.identity.iter().cloned());
    names
}

/// Staging columns are compared unless they are bookkeeping or identity
/// columns. Final columns carrying the archive suffix are never reported as
/// removed, so archived data is not archived twice.
pub fn diff_schemas(
    staging: &RelationDescriptor,
    final_relation: &RelationDescriptor,
) -> SchemaDelta {
    let excluded = excluded_names(final_relation);

    let mut delta = SchemaDelta::default();
    for column in staging.columns.iter().filter(|c| !excluded.contains(&c.name)) {
        match final_relation.column(&column.name) {
            None => delta.added.push(column.clone()),
            Some(existing) if existing.column_type != column.column_type => {
                delta.retyped.push(TypeChange {
                    column: existing.clone(),
                    new_type: column.column_type.clone(),
                })
            }
            Some(_) => {}
        }
    }
    let removable = final_relation
        .columns
        .iter()
        .filter(|c| !excluded.contains(&c.name) && !is_archived_name(&c.name));
    for column in removable {
        if !staging.has_column(&column.name) {
            delta.removed.push(column.clone());
        }
    }
    delta
}

/// One structural change against the final relation. `RetypeColumn` issues
/// two statements (archive, then add).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum SchemaChange {
    CreateFinal {
        relation: Ident,
    },
    AddColumn {
        column: Ident,
        column_type: ColumnType,
    },
    ArchiveColumn {
        column: Ident,
        archived: Ident,
    },
    RetypeColumn {
        column: Ident,
        archived: Ident,
        from: ColumnType,
        to: ColumnType,
    },
}

impl SchemaChange {
    pub fn describe(&self) -> String {
        match self {
            Self::CreateFinal { relation } => format!("create {relation} from canonical schema"),
            Self::AddColumn { column, column_type } => format!("add column {column} {column_type}"),
            Self::ArchiveColumn { column, archived } => {
                format!("rename column {column} to {archived}")
            }
            Self::RetypeColumn {
                column,
                archived,
                from,
                to,
            } => format!("retype column {column} {from} -> {to} (old values kept in {archived})"),
        }
    }
}

/// Orders the delta as added, removed, type-changed and rejects any archival
/// rename whose target name is already taken.
pub fn plan_changes(
    final_relation: &RelationDescriptor,
    delta: &SchemaDelta,
) -> Result<Vec<SchemaChange>, SyncError> {
    let mut names: HashSet<String> = final_relation.column_names().into_iter().collect();
    let mut changes = Vec::new();
    let conflict = |archived: &Ident, column: &ColumnDescriptor| SyncError::SchemaConflict {
        relation: final_relation.name.to_string(),
        column: column.physical.to_string(),
        reason: format!("archive target {archived} already exists"),
    };

    for column in &delta.added {
        names.insert(column.name.clone());
        changes.push(SchemaChange::AddColumn {
            column: column.physical.clone(),
            column_type: column.column_type.clone(),
        });
    }
    for column in &delta.removed {
        let archived = column.physical.archived()?;
        if !names.insert(archived.normalized()) {
            return Err(conflict(&archived, column));
        }
        names.remove(&column.name);
        changes.push(SchemaChange::ArchiveColumn {
            column: column.physical.clone(),
            archived,
        });
    }
    for change in &delta.retyped {
        let archived = change.column.physical.archived()?;
        if !names.insert(archived.normalized()) {
            return Err(conflict(&archived, &change.column));
        }
        changes.push(SchemaChange::RetypeColumn {
            column: change.column.physical.clone(),
            archived,
            from: change.column.column_type.clone(),
            to: change.new_type.clone(),
        });
    }
    Ok(changes)
}

fn rename_conflict(
    relation: &Ident,
    column: &Ident,
    archived: &Ident,
) -> impl FnOnce(StoreError) -> SyncError {
    let relation = relation.to_string();
    let column = column.to_string();
    let archived = archived.to_string();
    move |err| match err {
        StoreError::ColumnExists { .. } => SyncError::SchemaConflict {
            relation,
            column,
            reason: format!("archive target {archived} already exists"),
        },
        other => other.into(),
    }
}

/// Applies one change to the entity's final relation. Each DDL statement
/// stands alone; nothing already applied is rolled back when a later
/// statement fails.
pub async fn apply_change<S>(
    store: &mut S,
    entity: &EntitySpec,
    change: &SchemaChange,
) -> Result<(), SyncError>
where
    S: Store + ?Sized,
{
    let relation = &entity.final_relation;
    match change {
        SchemaChange::CreateFinal { relation } => {
            store.create_relation(relation, &entity.columns).await?;
            Ok(())
        }
        SchemaChange::AddColumn { column, column_type } => {
            store.add_column(relation, column, column_type).await?;
            Ok(())
        }
        SchemaChange::ArchiveColumn { column, archived } => {
            store
                .rename_column(relation, column, archived)
                .await
                .map_err(rename_conflict(relation, column, archived))?;
            Ok(())
        }
        SchemaChange::RetypeColumn { column, archived, to, .. } => {
            store
                .rename_column(relation, column, archived)
                .await
                .map_err(rename_conflict(relation, column, archived))?;
            store.add_column(relation, column, to).await?;
            Ok(())
        }
    }
}
