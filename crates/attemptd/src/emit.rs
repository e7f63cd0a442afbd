//! The single path from a running attempt to storage and the bus.
//!
//! Every `AttemptEvent` maps to one repository write plus one domain event.
//! Once the run is aborted, log and conversation events are dropped while
//! status, session and todo events still persist. Status changes outside the
//! attempt state machine are refused by storage and not published.

use crate::bus::EventBus;
use crate::registry::RunHandle;
use crate::storage::{self, AttemptsRepository, StorageError};
use attempt_core::events::{
    CompletedPayload, ConversationAppendedPayload, DomainPayload, StatusChangedPayload,
};
use attempt_core::{AttemptEvent, AttemptStatus, ConversationItem, DomainEvent, Id, LogLevel};
use std::sync::Arc;
use tracing::{debug, warn};

/// Cloneable emit handle for one attempt run.
#[derive(Clone)]
pub struct Emitter {
    repo: Arc<dyn AttemptsRepository>,
    bus: EventBus,
    run: Arc<RunHandle>,
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("attempt_id", &self.run.attempt_id)
            .field("aborted", &self.run.is_aborted())
            .finish_non_exhaustive()
    }
}

impl Emitter {
    pub fn new(repo: Arc<dyn AttemptsRepository>, bus: EventBus, run: Arc<RunHandle>) -> Self {
        Self { repo, bus, run }
    }

    pub fn attempt_id(&self) -> &Id {
        &self.run.attempt_id
    }

    pub fn is_aborted(&self) -> bool {
        self.run.is_aborted()
    }

    /// Persist and publish one event. Storage failures are logged, never returned.
    pub async fn emit(&self, event: AttemptEvent) {
        if self.is_aborted() && event.is_suppressible() {
            debug!(attempt_id = %self.run.attempt_id, "dropping event after abort");
            return;
        }

        let attempt_id = &self.run.attempt_id;
        let payload = match event {
            AttemptEvent::Log { level, message } => {
                match self.repo.insert_log(attempt_id, level, &message).await {
                    Ok(_) => DomainPayload::Log { level, message },
                    Err(e) => return self.storage_failed("log", &e),
                }
            }
            AttemptEvent::Status { status } => {
                if let Err(e) = self.transition(status).await {
                    self.storage_failed("status", &e);
                }
                return;
            }
            AttemptEvent::Session { id } => match self.repo.set_session_id(attempt_id, &id).await {
                Ok(()) => DomainPayload::Session { session_id: id },
                Err(e) => return self.storage_failed("session", &e),
            },
            AttemptEvent::Conversation { item } => match self.append_conversation(item).await {
                Ok(Some(payload)) => DomainPayload::Conversation(payload),
                Ok(None) => return,
                Err(e) => return self.storage_failed("conversation", &e),
            },
            AttemptEvent::Todo { summary } => {
                match self.repo.upsert_todos(attempt_id, &summary).await {
                    Ok(()) => DomainPayload::Todos(summary),
                    Err(e) => return self.storage_failed("todo", &e),
                }
            }
        };

        self.bus
            .publish(DomainEvent::new(attempt_id, &self.run.board_id, payload));
    }

    /// Emit a batch in order.
    pub async fn emit_all(&self, events: impl IntoIterator<Item = AttemptEvent>) {
        for event in events {
            self.emit(event).await;
        }
    }

    pub async fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(AttemptEvent::log(level, message)).await;
    }

    pub async fn status(&self, status: AttemptStatus) {
        self.emit(AttemptEvent::Status { status }).await;
    }

    /// Persist and publish a status change, returning the storage error
    /// (including an illegal transition) instead of logging it.
    pub async fn transition(&self, status: AttemptStatus) -> storage::Result<()> {
        self.repo
            .update_attempt_status(&self.run.attempt_id, status)
            .await?;
        self.bus.publish(DomainEvent::new(
            &self.run.attempt_id,
            &self.run.board_id,
            DomainPayload::Status(StatusChangedPayload { status }),
        ));
        Ok(())
    }

    pub async fn conversation(&self, item: ConversationItem) {
        self.emit(AttemptEvent::conversation(item)).await;
    }

    /// Publish `attempt.completed`. Bus only; the terminal status is already stored.
    pub fn completed(&self, status: AttemptStatus, exit_code: Option<i32>) {
        self.bus.publish(DomainEvent::new(
            &self.run.attempt_id,
            &self.run.board_id,
            DomainPayload::Completed(CompletedPayload { status, exit_code }),
        ));
    }

    async fn append_conversation(
        &self,
        item: ConversationItem,
    ) -> storage::Result<Option<ConversationAppendedPayload>> {
        let _guard = self.run.seq_lock.lock().await;
        if self.is_aborted() {
            debug!(attempt_id = %self.run.attempt_id, "dropping queued conversation item after abort");
            return Ok(None);
        }
        let seq = self.repo.next_seq(&self.run.attempt_id).await?;
        let record = self
            .repo
            .insert_conversation_item(&self.run.attempt_id, seq, &item)
            .await?;
        Ok(Some(ConversationAppendedPayload {
            seq: record.seq,
            item: record.item,
        }))
    }

    fn storage_failed(&self, kind: &str, error: &StorageError) {
        if let StorageError::IllegalTransition { from, to, .. } = error {
            warn!(
                attempt_id = %self.run.attempt_id,
                %from,
                %to,
                "rejected illegal status transition"
            );
            return;
        }
        warn!(
            attempt_id = %self.run.attempt_id,
            kind,
            error = %error,
            "failed to persist attempt event"
        );
    }
}
