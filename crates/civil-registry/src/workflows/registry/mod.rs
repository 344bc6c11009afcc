//! Civil registry request and queue core.
//!
//! Documents move through verification and release, their attachments through review, and
//! certified-copy requests through processing. Kiosk tickets are numbered per service type
//! and business day. Every committed status change records an outbox event that the
//! notification dispatcher delivers asynchronously.

pub mod certified_copy;
pub mod domain;
pub mod error;
pub mod memory;
pub mod notifications;
pub mod queue;
pub mod records;
pub mod repository;
pub mod router;
pub mod service;
pub mod transitions;

#[cfg(test)]
mod tests;

pub use certified_copy::CertifiedCopyService;
pub use domain::{
    ActorContext, Attachment, AttachmentId, AttachmentKind, AttachmentStatus, AttachmentUpdate,
    CertifiedCopyRequest, CopyRequestId, CopyRequestStatus, CopyRequestSubmission, Document,
    DocumentId, DocumentStatus, DocumentType, EntityKind, EventId, NewAttachment, NewDocument,
    Notification, NotificationDraft, NotificationId, NotificationKind, PartitionKey,
    PaymentDetails, Permission, QueueTicket, RegistryReference, RequesterDetails, ServiceType,
    TicketFilter, TicketId, TicketStatus, UserId,
};
pub use error::{ErrorKind, RegistryError};
pub use memory::MemoryRegistryStore;
pub use notifications::{DispatchReport, NotificationDispatcher, OutboxSignal, OutboxWorker};
pub use queue::QueueTicketingService;
pub use records::RecordService;
pub use repository::{
    OutboxEvent, OutboxState, RegistryReader, RegistryStore, RegistryTransaction,
    RepositoryError,
};
pub use router::{registry_router, ACTOR_ID_HEADER, ACTOR_PERMISSIONS_HEADER};
pub use service::RegistryServices;
pub use transitions::{
    ensure_transition, Lifecycle, StatusTransitionEngine, TransitionRequest, TransitionedEntity,
};
