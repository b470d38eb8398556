//! In-memory store with the same statement semantics as [`crate::PgStore`],
//! used by the engine tests and for local dry runs.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tripsync_core::{
    ColumnDescriptor, ColumnSpec, ColumnType, FieldValue, Ident, RelationDescriptor,
    INSERT_TIME_COLUMN, SURROGATE_KEY_COLUMN, UPDATE_TIME_COLUMN,
};

use crate::surrogate::derive_surrogate_key_from_fields;
use crate::{MergePlan, Store, StoreError};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryRelation {
    pub columns: Vec<(Ident, ColumnType)>,
    pub identity: Vec<Ident>,
    pub rows: Vec<Vec<FieldValue>>,
}

impl MemoryRelation {
    fn position(&self, column: &Ident) -> Option<usize> {
        self.columns.iter().position(|(name, _)| name == column)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    relations: BTreeMap<Ident, MemoryRelation>,
    statements: Vec<String>,
    fail_on: Option<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lands a relation without identity or bookkeeping columns, the way the
    /// external loader creates staging tables.
    pub fn load_relation(
        &mut self,
        relation: &str,
        columns: &[(&str, ColumnType)],
        rows: Vec<Vec<FieldValue>>,
    ) -> Result<(), StoreError> {
        let columns = columns
            .iter()
            .map(|(name, ty)| Ident::new(*name).map(|name| (name, ty.clone())))
            .collect::<Result<Vec<_>, _>>()?;
        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, FieldValue::Null);
                row
            })
            .collect();
        self.relations.insert(
            Ident::new(relation)?,
            MemoryRelation {
                columns,
                identity: Vec::new(),
                rows,
            },
        );
        Ok(())
    }

    pub fn relation(&self, relation: &str) -> Option<&MemoryRelation> {
        self.relations.get(&Ident::new(relation).ok()?)
    }

    pub fn row_count(&self, relation: &str) -> usize {
        self.relation(relation).map(|r| r.rows.len()).unwrap_or(0)
    }

    /// Values of `column` in row order, empty when the column is missing.
    pub fn column_values(&self, relation: &str, column: &str) -> Vec<FieldValue> {
        let Some(rel) = self.relation(relation) else {
            return Vec::new();
        };
        let Some(idx) = Ident::new(column).ok().and_then(|c| rel.position(&c)) else {
            return Vec::new();
        };
        rel.rows.iter().map(|row| row[idx].clone()).collect()
    }

    /// Statements applied so far, in order.
    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    /// Makes the next statement whose log line starts with `prefix` fail as a
    /// store outage.
    pub fn fail_on(&mut self, prefix: impl Into<String>) {
        self.fail_on = Some(prefix.into());
    }

    fn record(&mut self, statement: String) -> Result<(), StoreError> {
        if let Some(prefix) = &self.fail_on {
            if statement.starts_with(prefix.as_str()) {
                self.fail_on = None;
                return Err(StoreError::Database(sqlx::Error::Protocol(format!(
                    "injected failure: {statement}"
                ))));
            }
        }
        self.statements.push(statement);
        Ok(())
    }

    fn relation_mut(&mut self, relation: &Ident) -> Result<&mut MemoryRelation, StoreError> {
        self.relations
            .get_mut(relation)
            .ok_or_else(|| StoreError::RelationNotFound(relation.to_string()))
    }

    fn get(&self, relation: &Ident) -> Result<&MemoryRelation, StoreError> {
        self.relations
            .get(relation)
            .ok_or_else(|| StoreError::RelationNotFound(relation.to_string()))
    }
}

fn column_index(
    rel: &MemoryRelation,
    relation: &Ident,
    column: &Ident,
) -> Result<usize, StoreError> {
    rel.position(column).ok_or_else(|| StoreError::ColumnNotFound {
        relation: relation.to_string(),
        column: column.to_string(),
    })
}

/// Ordering used for the tie-break: NULL sorts below everything, numbers
/// compare numerically with NaN above every other number (as PostgreSQL
/// orders floats), mixed kinds never outrank each other.
fn tie_break_cmp(a: &FieldValue, b: &FieldValue) -> Ordering {
    match (a, b) {
        (FieldValue::Null, FieldValue::Null) => Ordering::Equal,
        (FieldValue::Null, _) => Ordering::Less,
        (_, FieldValue::Null) => Ordering::Greater,
        (FieldValue::Timestamp(x), FieldValue::Timestamp(y)) => x.cmp(y),
        (FieldValue::Text(x), FieldValue::Text(y)) => x.cmp(y),
        (FieldValue::Bool(x), FieldValue::Bool(y)) => x.cmp(y),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => match (x.is_nan(), y.is_nan()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            },
            _ => Ordering::Equal,
        },
    }
}

struct ResolvedPlan {
    key: Vec<usize>,
    sources: Vec<usize>,
    targets: Vec<usize>,
    identity: usize,
    update_time: Option<usize>,
    insert_time: Option<usize>,
}

impl MemoryStore {
    fn resolve(&self, plan: &MergePlan) -> Result<ResolvedPlan, StoreError> {
        let staging = self.get(&plan.staging)?;
        let target = self.get(&plan.final_relation)?;
        let key = plan
            .business_key
            .iter()
            .map(|c| column_index(staging, &plan.staging, c))
            .collect::<Result<Vec<_>, _>>()?;
        let sources = plan
            .columns
            .iter()
            .map(|m| column_index(staging, &plan.staging, &m.source))
            .collect::<Result<Vec<_>, _>>()?;
        let targets = plan
            .columns
            .iter()
            .map(|m| column_index(target, &plan.final_relation, &m.target))
            .collect::<Result<Vec<_>, _>>()?;
        let identity = column_index(target, &plan.final_relation, &plan.identity)?;
        let update_time = Ident::new(UPDATE_TIME_COLUMN).ok().and_then(|c| target.position(&c));
        let insert_time = Ident::new(INSERT_TIME_COLUMN).ok().and_then(|c| target.position(&c));
        Ok(ResolvedPlan {
            key,
            sources,
            targets,
            identity,
            update_time,
            insert_time,
        })
    }

    /// (identity, row index) for every staging row.
    fn staging_identities(
        &self,
        plan: &MergePlan,
        resolved: &ResolvedPlan,
    ) -> Result<Vec<(String, usize)>, StoreError> {
        let staging = self.get(&plan.staging)?;
        Ok(staging
            .rows
            .iter()
            .enumerate()
            .map(|(idx, row)| {
                let key = resolved.key.iter().map(|&k| row[k].clone()).collect::<Vec<_>>();
                (derive_surrogate_key_from_fields(&key), idx)
            })
            .collect())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn describe(
        &mut self,
        relation: &Ident,
    ) -> Result<Option<RelationDescriptor>, StoreError> {
        Ok(self.relations.get(relation).map(|rel| RelationDescriptor {
            name: relation.clone(),
            columns: rel
                .columns
                .iter()
                .map(|(name, ty)| ColumnDescriptor::new(name.clone(), ty.clone()))
                .collect(),
            identity: rel.identity.iter().map(Ident::normalized).collect(),
        }))
    }

    async fn create_relation(
        &mut self,
        relation: &Ident,
        columns: &[ColumnSpec],
    ) -> Result<(), StoreError> {
        self.record(format!("CREATE TABLE IF NOT EXISTS {relation}"))?;
        if self.relations.contains_key(relation) {
            return Ok(());
        }
        let identity = Ident::new(SURROGATE_KEY_COLUMN)?;
        let mut defs = vec![(identity.clone(), ColumnType::Text)];
        defs.extend(columns.iter().map(|c| (c.name.clone(), c.column_type.clone())));
        defs.push((Ident::new(INSERT_TIME_COLUMN)?, ColumnType::TimestampTz));
        defs.push((Ident::new(UPDATE_TIME_COLUMN)?, ColumnType::TimestampTz));
        self.relations.insert(
            relation.clone(),
            MemoryRelation {
                columns: defs,
                identity: vec![identity],
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn add_column(
        &mut self,
        relation: &Ident,
        column: &Ident,
        column_type: &ColumnType,
    ) -> Result<(), StoreError> {
        self.record(format!("ALTER TABLE {relation} ADD COLUMN {column} {column_type}"))?;
        let rel = self.relation_mut(relation)?;
        if rel.position(column).is_some() {
            return Err(StoreError::ColumnExists {
                relation: relation.to_string(),
                column: column.to_string(),
            });
        }
        rel.columns.push((column.clone(), column_type.clone()));
        for row in &mut rel.rows {
            row.push(FieldValue::Null);
        }
        Ok(())
    }

    async fn rename_column(
        &mut self,
        relation: &Ident,
        from: &Ident,
        to: &Ident,
    ) -> Result<(), StoreError> {
        self.record(format!("ALTER TABLE {relation} RENAME COLUMN {from} TO {to}"))?;
        let rel = self.relation_mut(relation)?;
        if rel.position(to).is_some() {
            return Err(StoreError::ColumnExists {
                relation: relation.to_string(),
                column: to.to_string(),
            });
        }
        let idx = column_index(rel, relation, from)?;
        rel.columns[idx].0 = to.clone();
        for identity in &mut rel.identity {
            if identity == from {
                *identity = to.clone();
            }
        }
        Ok(())
    }

    async fn deduplicate(
        &mut self,
        relation: &Ident,
        business_key: &[Ident],
        tie_break: &Ident,
    ) -> Result<u64, StoreError> {
        self.record(format!("DELETE FROM {relation} duplicates"))?;
        let rel = self.relation_mut(relation)?;
        let key = business_key
            .iter()
            .map(|c| column_index(rel, relation, c))
            .collect::<Result<Vec<_>, _>>()?;
        let tie = column_index(rel, relation, tie_break)?;

        let mut best: HashMap<Vec<Option<String>>, usize> = HashMap::new();
        for (idx, row) in rel.rows.iter().enumerate() {
            let group = key.iter().map(|&k| row[k].to_key_text()).collect::<Vec<_>>();
            let replaces = match best.get(&group).copied() {
                Some(kept) => tie_break_cmp(&row[tie], &rel.rows[kept][tie]) == Ordering::Greater,
                None => true,
            };
            if replaces {
                best.insert(group, idx);
            }
        }

        let keep: HashSet<usize> = best.into_values().collect();
        let before = rel.rows.len();
        let mut idx = 0;
        rel.rows.retain(|_| {
            let kept = keep.contains(&idx);
            idx += 1;
            kept
        });
        Ok((before - rel.rows.len()) as u64)
    }

    async fn insert_missing(&mut self, plan: &MergePlan) -> Result<u64, StoreError> {
        self.record(format!("INSERT INTO {} FROM {}", plan.final_relation, plan.staging))?;
        let resolved = self.resolve(plan)?;
        let incoming = self.staging_identities(plan, &resolved)?;

        let target = self.get(&plan.final_relation)?;
        let existing: HashSet<String> = target
            .rows
            .iter()
            .filter_map(|row| match &row[resolved.identity] {
                FieldValue::Text(id) => Some(id.clone()),
                _ => None,
            })
            .collect();
        let width = target.columns.len();

        let staging = self.get(&plan.staging)?;
        let mut seen = HashSet::new();
        let mut new_rows = Vec::new();
        for (identity, idx) in incoming {
            if existing.contains(&identity) {
                continue;
            }
            // Primary key violation aborts the whole statement.
            if !seen.insert(identity.clone()) {
                return Err(StoreError::DuplicateIdentity {
                    relation: plan.final_relation.to_string(),
                });
            }
            let source = &staging.rows[idx];
            let mut row = vec![FieldValue::Null; width];
            row[resolved.identity] = FieldValue::Text(identity);
            for (&s, &t) in resolved.sources.iter().zip(&resolved.targets) {
                row[t] = source[s].clone();
            }
            if let Some(at) = resolved.insert_time {
                row[at] = FieldValue::Timestamp(Utc::now().naive_utc());
            }
            new_rows.push(row);
        }

        let inserted = new_rows.len() as u64;
        self.relation_mut(&plan.final_relation)?.rows.extend(new_rows);
        Ok(inserted)
    }

    async fn update_changed(&mut self, plan: &MergePlan) -> Result<u64, StoreError> {
        self.record(format!("UPDATE {} FROM {}", plan.final_relation, plan.staging))?;
        if plan.columns.is_empty() {
            return Ok(0);
        }
        let resolved = self.resolve(plan)?;
        let incoming: HashMap<String, Vec<FieldValue>> = {
            let staging = self.get(&plan.staging)?;
            self.staging_identities(plan, &resolved)?
                .into_iter()
                .map(|(identity, idx)| {
                    let row = &staging.rows[idx];
                    let values = resolved.sources.iter().map(|&s| row[s].clone()).collect();
                    (identity, values)
                })
                .collect()
        };

        let now = FieldValue::Timestamp(Utc::now().naive_utc());
        let target = self.relation_mut(&plan.final_relation)?;
        let mut updated = 0u64;
        for row in &mut target.rows {
            let FieldValue::Text(identity) = &row[resolved.identity] else {
                continue;
            };
            let Some(values) = incoming.get(identity) else {
                continue;
            };
            let current = resolved.targets.iter().map(|&t| &row[t]);
            if current.eq(values.iter()) {
                continue;
            }
            for (&t, value) in resolved.targets.iter().zip(values) {
                row[t] = value.clone();
            }
            if let Some(at) = resolved.update_time {
                row[at] = now.clone();
            }
            updated += 1;
        }
        Ok(updated)
    }
}
