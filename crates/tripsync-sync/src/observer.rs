//! Structured run events and the hook callers subscribe with.

use std::fmt;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{info, warn};
use tripsync_core::ColumnType;
use uuid::Uuid;

/// Per-entity run states, in the only order they are ever visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStage {
    Start,
    SchemaReconciled,
    StageDeduped,
    IdentitiesDerived,
    Merged,
    Done,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "START",
            Self::SchemaReconciled => "SCHEMA_RECONCILED",
            Self::StageDeduped => "STAGE_DEDUPED",
            Self::IdentitiesDerived => "IDENTITIES_DERIVED",
            Self::Merged => "MERGED",
            Self::Done => "DONE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    RunStarted {
        run_id: Uuid,
        entity_type: String,
    },
    StageReached {
        stage: SyncStage,
    },
    FinalCreated {
        relation: String,
    },
    FinalAlreadyExists {
        relation: String,
    },
    ColumnAdded {
        relation: String,
        column: String,
        column_type: ColumnType,
    },
    ColumnArchived {
        relation: String,
        column: String,
        archived: String,
    },
    ColumnRetyped {
        relation: String,
        column: String,
        archived: String,
        from: ColumnType,
        to: ColumnType,
    },
    StagingDeduplicated {
        relation: String,
        rows_removed: u64,
    },
    RowsUpdated {
        relation: String,
        rows: u64,
    },
    RowsInserted {
        relation: String,
        rows: u64,
    },
    RunFailed {
        run_id: Uuid,
        stage: SyncStage,
        error: String,
    },
}

pub trait SyncObserver: Send + Sync {
    fn on_event(&self, event: &SyncEvent);
}

#[derive(Default)]
pub struct NoopObserver;

impl SyncObserver for NoopObserver {
    fn on_event(&self, _event: &SyncEvent) {}
}

/// Forwards events to `tracing`; the engine's default.
#[derive(Default)]
pub struct TracingObserver;

impl SyncObserver for TracingObserver {
    fn on_event(&self, event: &SyncEvent) {
        match event {
            SyncEvent::RunStarted { run_id, entity_type } => {
                info!(%run_id, %entity_type, "synchronization started")
            }
            SyncEvent::StageReached { stage } => info!(%stage, "stage reached"),
            SyncEvent::FinalCreated { relation } => info!(%relation, "final relation created"),
            SyncEvent::FinalAlreadyExists { relation } => {
                info!(%relation, "final relation already exists")
            }
            SyncEvent::ColumnAdded {
                relation,
                column,
                column_type,
            } => info!(%relation, %column, %column_type, "column added"),
            SyncEvent::ColumnArchived {
                relation,
                column,
                archived,
            } => info!(%relation, %column, %archived, "column archived"),
            SyncEvent::ColumnRetyped {
                relation,
                column,
                archived,
                from,
                to,
            } => warn!(
                %relation,
                %column,
                %archived,
                %from,
                %to,
                "column type changed; old values archived"
            ),
            SyncEvent::StagingDeduplicated { relation, rows_removed } => {
                info!(%relation, rows_removed, "staging deduplicated")
            }
            SyncEvent::RowsUpdated { relation, rows } => info!(%relation, rows, "rows updated"),
            SyncEvent::RowsInserted { relation, rows } => info!(%relation, rows, "rows inserted"),
            SyncEvent::RunFailed { run_id, stage, error } => {
                warn!(%run_id, %stage, %error, "synchronization aborted")
            }
        }
    }
}

/// Keeps every event in memory; handy for tests and for embedding callers
/// that report events after the run.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn stages(&self) -> Vec<SyncStage> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SyncEvent::StageReached { stage } => Some(stage),
                _ => None,
            })
            .collect()
    }
}

impl SyncObserver for RecordingObserver {
    fn on_event(&self, event: &SyncEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

impl<T: SyncObserver + ?Sized> SyncObserver for std::sync::Arc<T> {
    fn on_event(&self, event: &SyncEvent) {
        (**self).on_event(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_are_screaming_case() {
        assert_eq!(SyncStage::SchemaReconciled.to_string(), "SCHEMA_RECONCILED");
        assert_eq!(SyncStage::Done.to_string(), "DONE");
    }

    #[test]
    fn recording_observer_keeps_stage_order() {
        let observer = RecordingObserver::default();
        observer.on_event(&SyncEvent::StageReached {
            stage: SyncStage::Start,
        });
        observer.on_event(&SyncEvent::FinalCreated {
            relation: "trips".into(),
        });
        observer.on_event(&SyncEvent::StageReached {
            stage: SyncStage::SchemaReconciled,
        });
        assert_eq!(observer.events().len(), 3);
        assert_eq!(observer.stages(), vec![SyncStage::Start, SyncStage::SchemaReconciled]);
    }
}
