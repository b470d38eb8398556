//! Staging-to-final synchronization engine.
//!
//! One run per entity walks `START -> SCHEMA_RECONCILED -> STAGE_DEDUPED ->
//! IDENTITIES_DERIVED -> MERGED -> DONE`. A failure aborts that entity's run
//! without compensation; re-running from the start is always safe because
//! final creation is `IF NOT EXISTS`, applied DDL no longer shows up in the
//! next delta, and the merge only inserts missing identities.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};
use tripsync_core::{
    normalize_column_name, EntitySpec, Ident, IdentError, RelationDescriptor, INSERT_TIME_COLUMN,
    SURROGATE_KEY_COLUMN, UPDATE_TIME_COLUMN,
};
use tripsync_storage::{ColumnMapping, MergePlan, PgStore, Store, StoreError};
use uuid::Uuid;

pub mod observer;
pub mod registry;
pub mod schema;

pub use observer::{
    NoopObserver, RecordingObserver, SyncEvent, SyncObserver, SyncStage, TracingObserver,
};
pub use registry::{EntityRegistry, MergeMode, SyncConfig};
pub use schema::{SchemaChange, SchemaDelta};

pub const CRATE_NAME: &str = "tripsync-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("relation {0} does not exist")]
    RelationNotFound(String),
    #[error("schema conflict on {relation}.{column}: {reason}")]
    SchemaConflict {
        relation: String,
        column: String,
        reason: String,
    },
    #[error("unknown entity type {entity_type}: {reason}")]
    UnknownEntityType { entity_type: String, reason: String },
    #[error("column {column} is missing from {relation}")]
    MissingColumn { relation: String, column: String },
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(#[from] IdentError),
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RelationNotFound(relation) => Self::RelationNotFound(relation),
            StoreError::ColumnNotFound { relation, column } => {
                Self::MissingColumn { relation, column }
            }
            StoreError::ColumnExists { relation, column } => Self::SchemaConflict {
                relation,
                column,
                reason: "column already exists".to_string(),
            },
            StoreError::DuplicateIdentity { relation } => Self::SchemaConflict {
                relation,
                column: SURROGATE_KEY_COLUMN.to_string(),
                reason: "staging still holds more than one row per identity".to_string(),
            },
            StoreError::Ident(err) => Self::InvalidIdentifier(err),
            other => Self::StoreUnavailable(other),
        }
    }
}

/// Caller-facing description of one synchronization. Names are checked
/// against the registry before anything touches the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncRequest {
    pub entity_type: String,
    pub staging_relation: String,
    pub final_relation: String,
    pub business_key: Vec<String>,
    pub tie_break: String,
    pub mode: MergeMode,
}

impl SyncRequest {
    pub fn for_entity(entity: &EntitySpec) -> Self {
        Self {
            entity_type: entity.entity_type.clone(),
            staging_relation: entity.staging_relation.to_string(),
            final_relation: entity.final_relation.to_string(),
            business_key: entity.business_key.iter().map(|k| k.to_string()).collect(),
            tie_break: entity.tie_break.to_string(),
            mode: MergeMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: MergeMode) -> Self {
        self.mode = mode;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub run_id: Uuid,
    pub entity_type: String,
    pub staging_relation: String,
    pub final_relation: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub final_created: bool,
    pub columns_added: Vec<String>,
    pub columns_archived: Vec<String>,
    pub columns_retyped: Vec<String>,
    pub rows_deduplicated: u64,
    pub rows_inserted: u64,
    pub rows_updated: u64,
}

/// Result of a dry run: what `synchronize` would do to the final relation.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaPlan {
    pub entity_type: String,
    pub final_relation: String,
    pub changes: Vec<SchemaChange>,
}

pub struct SyncEngine {
    registry: EntityRegistry,
    observer: Box<dyn SyncObserver>,
}

impl SyncEngine {
    pub fn new(registry: EntityRegistry) -> Self {
        Self {
            registry,
            observer: Box::<TracingObserver>::default(),
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    fn emit(&self, event: SyncEvent) {
        self.observer.on_event(&event);
    }

    /// Matches the request against the registry so only declared relation
    /// and key names are ever interpolated into statements.
    pub fn resolve(&self, request: &SyncRequest) -> Result<&EntitySpec, SyncError> {
        let unknown = |reason: String| SyncError::UnknownEntityType {
            entity_type: request.entity_type.clone(),
            reason,
        };
        let entity = self
            .registry
            .get(&request.entity_type)
            .ok_or_else(|| unknown("not registered".to_string()))?;

        if request.staging_relation != entity.staging_relation.as_str() {
            return Err(unknown(format!(
                "staging relation {} is not the registered {}",
                request.staging_relation, entity.staging_relation
            )));
        }
        if request.final_relation != entity.final_relation.as_str() {
            return Err(unknown(format!(
                "final relation {} is not the registered {}",
                request.final_relation, entity.final_relation
            )));
        }
        let requested_key = request
            .business_key
            .iter()
            .map(|k| normalize_column_name(k))
            .collect::<Vec<_>>();
        let declared_key = entity.business_key.iter().map(Ident::normalized).collect::<Vec<_>>();
        if requested_key != declared_key {
            return Err(unknown(format!(
                "business key {:?} does not match the declared {:?}",
                request.business_key, declared_key
            )));
        }
        if normalize_column_name(&request.tie_break) != entity.tie_break.normalized() {
            return Err(unknown(format!(
                "tie-break column {} does not match the declared {}",
                request.tie_break, entity.tie_break
            )));
        }
        Ok(entity)
    }

    /// Inspects both relations and returns the changes a run would apply,
    /// without executing any DDL.
    pub async fn plan<S>(
        &self,
        store: &mut S,
        request: &SyncRequest,
    ) -> Result<SchemaPlan, SyncError>
    where
        S: Store + ?Sized,
    {
        let entity = self.resolve(request)?;
        let staging = schema::inspect(store, &entity.staging_relation).await?;
        require_key_columns(entity, &staging)?;

        let mut changes = Vec::new();
        let final_relation = match store.describe(&entity.final_relation).await? {
            Some(descriptor) => descriptor,
            None => {
                changes.push(SchemaChange::CreateFinal {
                    relation: entity.final_relation.clone(),
                });
                schema::canonical_final_descriptor(entity)?
            }
        };
        let delta = schema::diff_schemas(&staging, &final_relation);
        changes.extend(schema::plan_changes(&final_relation, &delta)?);
        Ok(SchemaPlan {
            entity_type: entity.entity_type.clone(),
            final_relation: entity.final_relation.to_string(),
            changes,
        })
    }

    pub async fn synchronize<S>(
        &self,
        store: &mut S,
        request: &SyncRequest,
    ) -> Result<SyncResult, SyncError>
    where
        S: Store + ?Sized,
    {
        let entity = self.resolve(request)?;
        let run_id = Uuid::new_v4();
        let span = info_span!("synchronize", %run_id, entity_type = %entity.entity_type);

        self.emit(SyncEvent::RunStarted {
            run_id,
            entity_type: entity.entity_type.clone(),
        });
        let mut stage = SyncStage::Start;
        let outcome = self
            .run(store, entity, request.mode, run_id, &mut stage)
            .instrument(span)
            .await;
        if let Err(err) = &outcome {
            self.emit(SyncEvent::RunFailed {
                run_id,
                stage,
                error: err.to_string(),
            });
        }
        outcome
    }

    fn advance(&self, stage: &mut SyncStage, next: SyncStage) {
        *stage = next;
        self.emit(SyncEvent::StageReached { stage: next });
    }

    async fn run<S>(
        &self,
        store: &mut S,
        entity: &EntitySpec,
        mode: MergeMode,
        run_id: Uuid,
        stage: &mut SyncStage,
    ) -> Result<SyncResult, SyncError>
    where
        S: Store + ?Sized,
    {
        let started_at = Utc::now();
        self.emit(SyncEvent::StageReached { stage: *stage });

        let staging = schema::inspect(store, &entity.staging_relation).await?;
        require_key_columns(entity, &staging)?;

        let final_created = self.ensure_final(store, entity).await?;
        let final_relation = schema::inspect(store, &entity.final_relation).await?;
        let delta = schema::diff_schemas(&staging, &final_relation);
        let changes = schema::plan_changes(&final_relation, &delta)?;

        let mut columns_added = Vec::new();
        let mut columns_archived = Vec::new();
        let mut columns_retyped = Vec::new();
        let relation = entity.final_relation.to_string();
        for change in &changes {
            schema::apply_change(store, entity, change).await?;
            match change {
                SchemaChange::CreateFinal { .. } => {}
                SchemaChange::AddColumn { column, column_type } => {
                    columns_added.push(column.to_string());
                    self.emit(SyncEvent::ColumnAdded {
                        relation: relation.clone(),
                        column: column.to_string(),
                        column_type: column_type.clone(),
                    });
                }
                SchemaChange::ArchiveColumn { column, archived } => {
                    columns_archived.push(column.to_string());
                    self.emit(SyncEvent::ColumnArchived {
                        relation: relation.clone(),
                        column: column.to_string(),
                        archived: archived.to_string(),
                    });
                }
                SchemaChange::RetypeColumn {
                    column,
                    archived,
                    from,
                    to,
                } => {
                    columns_retyped.push(column.to_string());
                    self.emit(SyncEvent::ColumnRetyped {
                        relation: relation.clone(),
                        column: column.to_string(),
                        archived: archived.to_string(),
                        from: from.clone(),
                        to: to.clone(),
                    });
                }
            }
        }
        self.advance(stage, SyncStage::SchemaReconciled);

        let key = physical_columns(&staging, &entity.business_key)?;
        let tie_break =
            physical_columns(&staging, std::slice::from_ref(&entity.tie_break))?.remove(0);
        let rows_deduplicated = store.deduplicate(&staging.name, &key, &tie_break).await?;
        self.emit(SyncEvent::StagingDeduplicated {
            relation: staging.name.to_string(),
            rows_removed: rows_deduplicated,
        });
        self.advance(stage, SyncStage::StageDeduped);

        let final_relation = schema::inspect(store, &entity.final_relation).await?;
        let plan = build_merge_plan(&staging, &final_relation, key)?;
        self.advance(stage, SyncStage::IdentitiesDerived);

        let rows_updated = match mode {
            MergeMode::InsertOnly => 0,
            MergeMode::Upsert => {
                let rows = store.update_changed(&plan).await?;
                self.emit(SyncEvent::RowsUpdated {
                    relation: relation.clone(),
                    rows,
                });
                rows
            }
        };
        let rows_inserted = store.insert_missing(&plan).await?;
        self.emit(SyncEvent::RowsInserted {
            relation: relation.clone(),
            rows: rows_inserted,
        });
        self.advance(stage, SyncStage::Merged);

        let result = SyncResult {
            run_id,
            entity_type: entity.entity_type.clone(),
            staging_relation: staging.name.to_string(),
            final_relation: relation,
            started_at,
            finished_at: Utc::now(),
            final_created,
            columns_added,
            columns_archived,
            columns_retyped,
            rows_deduplicated,
            rows_inserted,
            rows_updated,
        };
        self.advance(stage, SyncStage::Done);
        Ok(result)
    }

    /// Creates the final relation from the canonical schema on first run.
    /// Returns whether it had to be created.
    async fn ensure_final<S>(&self, store: &mut S, entity: &EntitySpec) -> Result<bool, SyncError>
    where
        S: Store + ?Sized,
    {
        let relation = entity.final_relation.to_string();
        if store.describe(&entity.final_relation).await?.is_some() {
            self.emit(SyncEvent::FinalAlreadyExists { relation });
            return Ok(false);
        }
        let change = SchemaChange::CreateFinal {
            relation: entity.final_relation.clone(),
        };
        schema::apply_change(store, entity, &change).await?;
        self.emit(SyncEvent::FinalCreated { relation });
        Ok(true)
    }
}

/// Business key and tie-break must exist in staging before any DDL runs.
fn require_key_columns(entity: &EntitySpec, staging: &RelationDescriptor) -> Result<(), SyncError> {
    for column in entity.business_key.iter().chain(std::iter::once(&entity.tie_break)) {
        if !staging.has_column(&column.normalized()) {
            return Err(SyncError::MissingColumn {
                relation: staging.name.to_string(),
                column: column.to_string(),
            });
        }
    }
    Ok(())
}

fn physical_columns(
    relation: &RelationDescriptor,
    columns: &[Ident],
) -> Result<Vec<Ident>, SyncError> {
    columns
        .iter()
        .map(|column| {
            relation
                .column(&column.normalized())
                .map(|c| c.physical.clone())
                .ok_or_else(|| SyncError::MissingColumn {
                    relation: relation.name.to_string(),
                    column: column.to_string(),
                })
        })
        .collect()
}

/// Pairs every staging column with its reconciled final counterpart and
/// fixes the identity expression inputs.
pub fn build_merge_plan(
    staging: &RelationDescriptor,
    final_relation: &RelationDescriptor,
    business_key: Vec<Ident>,
) -> Result<MergePlan, SyncError> {
    let identity_name = normalize_column_name(SURROGATE_KEY_COLUMN);
    let identity = final_relation
        .column(&identity_name)
        .map(|c| c.physical.clone())
        .ok_or_else(|| SyncError::SchemaConflict {
            relation: final_relation.name.to_string(),
            column: SURROGATE_KEY_COLUMN.to_string(),
            reason: "final relation has no surrogate identity column".to_string(),
        })?;

    let bookkeeping = [SURROGATE_KEY_COLUMN, INSERT_TIME_COLUMN, UPDATE_TIME_COLUMN]
        .map(normalize_column_name);
    let mut columns = Vec::new();
    for column in &staging.columns {
        if bookkeeping.contains(&column.name) {
            continue;
        }
        let target = final_relation
            .column(&column.name)
            .ok_or_else(|| SyncError::SchemaConflict {
                relation: final_relation.name.to_string(),
                column: column.physical.to_string(),
                reason: "staging column has no counterpart after reconciliation".to_string(),
            })?;
        if target.column_type != column.column_type {
            return Err(SyncError::SchemaConflict {
                relation: final_relation.name.to_string(),
                column: target.physical.to_string(),
                reason: format!(
                    "final type {} still differs from staging type {}",
                    target.column_type, column.column_type
                ),
            });
        }
        columns.push(ColumnMapping {
            source: column.physical.clone(),
            target: target.physical.clone(),
        });
    }

    Ok(MergePlan {
        staging: staging.name.clone(),
        final_relation: final_relation.name.clone(),
        identity,
        business_key,
        columns,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityFailure {
    pub entity_type: String,
    pub error: String,
}

/// Outcome of a multi-entity run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub relations_reconciled: usize,
    pub results: Vec<SyncResult>,
    pub failures: Vec<EntityFailure>,
}

impl SyncSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

fn selected<'a>(
    registry: &'a EntityRegistry,
    only: &[String],
) -> Result<Vec<&'a EntitySpec>, SyncError> {
    if only.is_empty() {
        return Ok(registry.entities().iter().collect());
    }
    only.iter()
        .map(|name| {
            registry.get(name).ok_or_else(|| SyncError::UnknownEntityType {
                entity_type: name.clone(),
                reason: "not registered".to_string(),
            })
        })
        .collect()
}

/// Synchronizes the selected entities one after another, each on its own
/// connection. A failing entity is recorded and the rest still run.
pub async fn run_sync(config: &SyncConfig, only: &[String]) -> anyhow::Result<SyncSummary> {
    let engine = SyncEngine::new(config.registry()?);
    let entities = selected(engine.registry(), only)?;
    let started_at = Utc::now();
    let mut results = Vec::new();
    let mut failures = Vec::new();

    for entity in entities {
        let request = SyncRequest::for_entity(entity).with_mode(config.mode);
        match sync_on_fresh_connection(&engine, config, &request).await {
            Ok(result) => results.push(result),
            Err(err) => failures.push(EntityFailure {
                entity_type: entity.entity_type.clone(),
                error: err.to_string(),
            }),
        }
    }

    Ok(SyncSummary {
        started_at,
        finished_at: Utc::now(),
        relations_reconciled: results.len(),
        results,
        failures,
    })
}

async fn sync_on_fresh_connection(
    engine: &SyncEngine,
    config: &SyncConfig,
    request: &SyncRequest,
) -> Result<SyncResult, SyncError> {
    let mut store = PgStore::connect(&config.store).await?;
    // On error the store is dropped here, which closes the connection.
    let result = engine.synchronize(&mut store, request).await?;
    Ok(after_close(result, store.close().await))
}

/// The merge is committed by the time the connection closes, so a close
/// failure is logged and the run still counts as synchronized.
fn after_close(result: SyncResult, closed: Result<(), StoreError>) -> SyncResult {
    if let Err(err) = closed {
        warn!(
            entity_type = %result.entity_type,
            run_id = %result.run_id,
            error = %err,
            "closing store connection failed"
        );
    }
    result
}

/// Dry-run counterpart of [`run_sync`].
pub async fn plan_sync(config: &SyncConfig, only: &[String]) -> anyhow::Result<Vec<SchemaPlan>> {
    let engine = SyncEngine::new(config.registry()?);
    let entities = selected(engine.registry(), only)?;
    let mut plans = Vec::new();
    for entity in entities {
        let mut store = PgStore::connect(&config.store).await?;
        let plan = engine.plan(&mut store, &SyncRequest::for_entity(entity)).await?;
        store.close().await?;
        plans.push(plan);
    }
    Ok(plans)
}
