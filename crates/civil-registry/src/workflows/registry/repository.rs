use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{
    Attachment, AttachmentId, CertifiedCopyRequest, CopyRequestId, CopyRequestStatus, Document,
    DocumentId, EntityKind, EventId, Notification, NotificationDraft, NotificationId,
    PartitionKey, QueueTicket, TicketFilter, TicketId, UserId,
};

/// Storage abstraction so the services can be exercised against any backend.
///
/// `transaction` must be serializable and all-or-nothing: either every write made
/// through the transaction becomes visible or none does. Implementations enforce the
/// reference and uniqueness rules documented on [`RegistryTransaction`].
pub trait RegistryStore: Send + Sync {
    fn transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn RegistryTransaction) -> Result<T, E>,
        E: From<RepositoryError>;

    /// Consistent read-only view; nothing is written.
    fn read<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&dyn RegistryReader) -> Result<T, E>,
        E: From<RepositoryError>;
}

pub trait RegistryReader {
    fn document(&self, id: DocumentId) -> Result<Option<Document>, RepositoryError>;
    fn document_by_registry_number(
        &self,
        registry_number: &str,
    ) -> Result<Option<Document>, RepositoryError>;

    fn attachment(&self, id: AttachmentId) -> Result<Option<Attachment>, RepositoryError>;

    fn copy_request(&self, id: CopyRequestId)
        -> Result<Option<CertifiedCopyRequest>, RepositoryError>;
    fn copy_requests_for_attachment(
        &self,
        attachment_id: AttachmentId,
    ) -> Result<Vec<CertifiedCopyRequest>, RepositoryError>;
    /// Oldest first.
    fn copy_requests(
        &self,
        status: Option<CopyRequestStatus>,
    ) -> Result<Vec<CertifiedCopyRequest>, RepositoryError>;

    fn ticket(&self, id: TicketId) -> Result<Option<QueueTicket>, RepositoryError>;
    fn last_ticket_number(&self, partition: &PartitionKey) -> Result<Option<u32>, RepositoryError>;
    /// Ordered by business day, service type, then number.
    fn tickets(&self, filter: &TicketFilter) -> Result<Vec<QueueTicket>, RepositoryError>;

    fn notification(&self, id: NotificationId) -> Result<Option<Notification>, RepositoryError>;
    fn notification_for_event(
        &self,
        event_id: EventId,
    ) -> Result<Option<Notification>, RepositoryError>;
    /// Newest first.
    fn notifications_for_user(&self, user_id: &UserId)
        -> Result<Vec<Notification>, RepositoryError>;

    /// Pending outbox events in enqueue order.
    fn pending_events(&self, limit: usize) -> Result<Vec<OutboxEvent>, RepositoryError>;
    fn event(&self, event_id: EventId) -> Result<Option<OutboxEvent>, RepositoryError>;
}

/// Writes available inside a unit of work.
///
/// Inserts fail with [`RepositoryError::Conflict`] on a duplicate key: document registry
/// number, ticket `(service type, business day, number)`, notification event id and outbox
/// event id. Inserts fail with [`RepositoryError::NotFound`] when the referenced parent is
/// missing, and updates when the record itself is missing.
pub trait RegistryTransaction: RegistryReader {
    fn insert_document(&mut self, document: Document) -> Result<(), RepositoryError>;
    fn update_document(&mut self, document: Document) -> Result<(), RepositoryError>;

    fn insert_attachment(&mut self, attachment: Attachment) -> Result<(), RepositoryError>;
    fn update_attachment(&mut self, attachment: Attachment) -> Result<(), RepositoryError>;
    /// Rejected with a conflict while any certified-copy request references the attachment.
    fn delete_attachment(&mut self, id: AttachmentId) -> Result<Attachment, RepositoryError>;

    fn insert_copy_request(&mut self, request: CertifiedCopyRequest)
        -> Result<(), RepositoryError>;
    fn update_copy_request(&mut self, request: CertifiedCopyRequest)
        -> Result<(), RepositoryError>;

    fn insert_ticket(&mut self, ticket: QueueTicket) -> Result<(), RepositoryError>;
    fn update_ticket(&mut self, ticket: QueueTicket) -> Result<(), RepositoryError>;

    fn insert_notification(&mut self, notification: Notification) -> Result<(), RepositoryError>;
    fn update_notification(&mut self, notification: Notification) -> Result<(), RepositoryError>;

    fn enqueue_event(&mut self, event: OutboxEvent) -> Result<(), RepositoryError>;
    fn update_event(&mut self, event: OutboxEvent) -> Result<(), RepositoryError>;
}

/// Error enumeration for repository failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: EntityKind, id: String },
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxState {
    Pending,
    Delivered,
    Failed,
}

/// Notification intent recorded in the same unit of work as the transition that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub event_id: EventId,
    pub entity: EntityKind,
    pub entity_id: String,
    pub notification: NotificationDraft,
    pub occurred_at: DateTime<Utc>,
    pub state: OutboxState,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl OutboxEvent {
    pub fn new(
        entity: EntityKind,
        entity_id: impl ToString,
        mut notification: NotificationDraft,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        let event_id = EventId::new();
        notification.event_id = Some(event_id);
        Self {
            event_id,
            entity,
            entity_id: entity_id.to_string(),
            notification,
            occurred_at,
            state: OutboxState::Pending,
            attempts: 0,
            last_error: None,
        }
    }
}
