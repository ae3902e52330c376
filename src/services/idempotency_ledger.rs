//! Record of processed payment provider events.

use std::sync::Arc;

use chrono::Utc;
use sea_orm::{ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, Set, SqlErr};
use tracing::debug;
use uuid::Uuid;

use crate::{
    entities::processed_webhook_event::{self, LedgerOutcome},
    errors::ServiceError,
};

/// Duplicate-key detection across backends; SQLite reports primary key
/// collisions under a code older sea-orm versions do not classify.
fn is_unique_violation(err: &DbErr) -> bool {
    if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
        return true;
    }
    let message = err.to_string();
    message.contains("UNIQUE constraint failed") || message.contains("duplicate key value")
}

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub event_id: String,
    pub event_type: String,
    pub order_id: Option<Uuid>,
    pub outcome: LedgerOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    /// Another delivery of the same event got there first
    AlreadyRecorded,
}

#[derive(Clone)]
pub struct IdempotencyLedger {
    db: Arc<DatabaseConnection>,
}

impl IdempotencyLedger {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn find(
        &self,
        event_id: &str,
    ) -> Result<Option<processed_webhook_event::Model>, ServiceError> {
        Ok(processed_webhook_event::Entity::find_by_id(event_id.to_string())
            .one(&*self.db)
            .await?)
    }

    /// Inserts the ledger row on `conn`, normally the transaction carrying the
    /// event's effects.
    pub async fn record<C: ConnectionTrait>(
        conn: &C,
        entry: LedgerEntry,
    ) -> Result<RecordOutcome, ServiceError> {
        let row = processed_webhook_event::ActiveModel {
            event_id: Set(entry.event_id.clone()),
            event_type: Set(entry.event_type),
            order_id: Set(entry.order_id),
            outcome: Set(entry.outcome),
            processed_at: Set(Utc::now()),
        };

        match processed_webhook_event::Entity::insert(row)
            .exec_without_returning(conn)
            .await
        {
            Ok(_) => Ok(RecordOutcome::Inserted),
            Err(err) if is_unique_violation(&err) => {
                debug!(event_id = %entry.event_id, "event already recorded");
                Ok(RecordOutcome::AlreadyRecorded)
            }
            Err(err) => Err(err.into()),
        }
    }
}
