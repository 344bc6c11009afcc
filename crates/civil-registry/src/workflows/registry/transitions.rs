//! Status transition engine.
//!
//! Every status enum declares its legal successors in a fixed table. The engine checks
//! that table, plus any guard, before each mutation, and applies the new status, derived
//! flag refresh and outbox event in one unit of work.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::certified_copy::refresh_certified_copy_flag;
use super::domain::{
    ActorContext, Attachment, AttachmentId, AttachmentStatus, CertifiedCopyRequest,
    CopyRequestId, CopyRequestStatus, Document, DocumentId, DocumentStatus, EntityKind,
    NotificationDraft, NotificationKind, Permission, TicketStatus, UserId,
};
use super::error::RegistryError;
use super::notifications::OutboxSignal;
use super::repository::{OutboxEvent, RegistryStore, RegistryTransaction};

/// Closed status type with an explicit transition table.
pub trait Lifecycle: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    const ENTITY: EntityKind;

    fn successors(self) -> &'static [Self];

    fn name(self) -> &'static str;

    fn can_transition_to(self, target: Self) -> bool {
        self.successors().contains(&target)
    }

    fn is_terminal(self) -> bool {
        self.successors().is_empty()
    }
}

impl Lifecycle for DocumentStatus {
    const ENTITY: EntityKind = EntityKind::Document;

    fn successors(self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Verified],
            Self::Verified => &[Self::ReadyForRelease],
            Self::ReadyForRelease => &[Self::Released],
            Self::Released => &[],
        }
    }

    fn name(self) -> &'static str {
        self.label()
    }
}

impl Lifecycle for AttachmentStatus {
    const ENTITY: EntityKind = EntityKind::Attachment;

    fn successors(self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Approved, Self::Rejected],
            Self::Approved | Self::Rejected => &[],
        }
    }

    fn name(self) -> &'static str {
        self.label()
    }
}

impl Lifecycle for CopyRequestStatus {
    const ENTITY: EntityKind = EntityKind::CopyRequest;

    fn successors(self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Processing, Self::Cancelled],
            Self::Processing => &[Self::Completed, Self::Cancelled],
            Self::Completed | Self::Cancelled => &[],
        }
    }

    fn name(self) -> &'static str {
        self.label()
    }
}

impl Lifecycle for TicketStatus {
    const ENTITY: EntityKind = EntityKind::Ticket;

    fn successors(self) -> &'static [Self] {
        match self {
            Self::Waiting => &[Self::Called],
            Self::Called => &[Self::Serving],
            Self::Serving => &[Self::Done, Self::Skipped],
            Self::Done | Self::Skipped => &[],
        }
    }

    fn name(self) -> &'static str {
        self.label()
    }
}

pub fn ensure_transition<S: Lifecycle>(from: S, to: S) -> Result<(), RegistryError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(RegistryError::InvalidTransition {
            entity: S::ENTITY,
            from: from.name(),
            to: to.name(),
        })
    }
}

/// Target of a transition call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum TransitionRequest {
    Document {
        id: DocumentId,
        to: DocumentStatus,
    },
    Attachment {
        id: AttachmentId,
        to: AttachmentStatus,
    },
    CopyRequest {
        id: CopyRequestId,
        to: CopyRequestStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "entity", content = "record", rename_all = "snake_case")]
pub enum TransitionedEntity {
    Document(Document),
    Attachment(Attachment),
    CopyRequest(CertifiedCopyRequest),
}

pub struct StatusTransitionEngine<S> {
    store: Arc<S>,
    signal: OutboxSignal,
}

impl<S> StatusTransitionEngine<S>
where
    S: RegistryStore + 'static,
{
    pub fn new(store: Arc<S>, signal: OutboxSignal) -> Self {
        Self { store, signal }
    }

    pub fn transition(
        &self,
        request: TransitionRequest,
        actor: &ActorContext,
    ) -> Result<TransitionedEntity, RegistryError> {
        match request {
            TransitionRequest::Document { id, to } => self
                .transition_document(id, to, actor)
                .map(TransitionedEntity::Document),
            TransitionRequest::Attachment { id, to } => self
                .transition_attachment(id, to, actor)
                .map(TransitionedEntity::Attachment),
            TransitionRequest::CopyRequest { id, to } => self
                .transition_copy_request(id, to, actor)
                .map(TransitionedEntity::CopyRequest),
        }
    }

    pub fn transition_document(
        &self,
        id: DocumentId,
        to: DocumentStatus,
        actor: &ActorContext,
    ) -> Result<Document, RegistryError> {
        let permission = match to {
            DocumentStatus::Released => Permission::ReleaseDocuments,
            _ => Permission::VerifyDocuments,
        };
        let user = actor.require(permission)?;

        let (document, from) = self.store.transaction(|tx| -> Result<_, RegistryError> {
            let mut document = tx
                .document(id)?
                .ok_or_else(|| RegistryError::not_found(EntityKind::Document, id))?;
            let from = document.status;
            ensure_transition(from, to)?;

            if to == DocumentStatus::ReadyForRelease && !has_approved_attachment(tx, &document)? {
                return Err(RegistryError::GuardRejected {
                    entity: EntityKind::Document,
                    to: to.label(),
                    reason: "no attachment has been approved".to_string(),
                });
            }

            let now = Utc::now();
            document.status = to;
            document.updated_at = now;
            tx.update_document(document.clone())?;
            tx.enqueue_event(status_event(
                EntityKind::Document,
                id,
                document.submitted_by.clone(),
                from.label(),
                to.label(),
                now,
            ))?;
            Ok((document, from))
        })?;

        info!(document_id = %id, from = from.label(), to = to.label(), actor = %user, "document transitioned");
        self.signal.wake();
        Ok(document)
    }

    pub fn transition_attachment(
        &self,
        id: AttachmentId,
        to: AttachmentStatus,
        actor: &ActorContext,
    ) -> Result<Attachment, RegistryError> {
        let user = actor.require(Permission::ReviewAttachments)?;

        let (attachment, from) = self.store.transaction(|tx| -> Result<_, RegistryError> {
            let mut attachment = tx
                .attachment(id)?
                .ok_or_else(|| RegistryError::not_found(EntityKind::Attachment, id))?;
            let from = attachment.status;
            ensure_transition(from, to)?;

            attachment.status = to;
            tx.update_attachment(attachment.clone())?;
            tx.enqueue_event(status_event(
                EntityKind::Attachment,
                id,
                attachment.uploaded_by.clone(),
                from.label(),
                to.label(),
                Utc::now(),
            ))?;
            Ok((attachment, from))
        })?;

        info!(attachment_id = %id, from = from.label(), to = to.label(), actor = %user, "attachment transitioned");
        self.signal.wake();
        Ok(attachment)
    }

    pub fn transition_copy_request(
        &self,
        id: CopyRequestId,
        to: CopyRequestStatus,
        actor: &ActorContext,
    ) -> Result<CertifiedCopyRequest, RegistryError> {
        let user = actor.identity()?.clone();

        let (request, from, has_certified_copy) = self.store.transaction(|tx| -> Result<_, RegistryError> {
            let mut request = tx
                .copy_request(id)?
                .ok_or_else(|| RegistryError::not_found(EntityKind::CopyRequest, id))?;
            authorize_copy_request(actor, &request, to)?;
            let from = request.status;
            ensure_transition(from, to)?;

            let now = Utc::now();
            request.status = to;
            request.updated_at = now;
            tx.update_copy_request(request.clone())?;

            let document = refresh_certified_copy_flag(tx, request.document_id)?;
            let recipient = request
                .requested_by
                .clone()
                .unwrap_or_else(|| document.submitted_by.clone());
            tx.enqueue_event(status_event(
                EntityKind::CopyRequest,
                id,
                recipient,
                from.label(),
                to.label(),
                now,
            ))?;
            Ok((request, from, document.has_certified_copy))
        })?;

        info!(
            copy_request_id = %id,
            from = from.label(),
            to = to.label(),
            actor = %user,
            has_certified_copy,
            "certified copy request transitioned"
        );
        self.signal.wake();
        Ok(request)
    }
}

fn has_approved_attachment(
    tx: &dyn RegistryTransaction,
    document: &Document,
) -> Result<bool, RegistryError> {
    for attachment_id in &document.attachments {
        if let Some(attachment) = tx.attachment(*attachment_id)? {
            if attachment.status == AttachmentStatus::Approved {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Staff with the processing permission may move any request; the requester may cancel
/// their own.
fn authorize_copy_request(
    actor: &ActorContext,
    request: &CertifiedCopyRequest,
    to: CopyRequestStatus,
) -> Result<(), RegistryError> {
    if actor.has(Permission::ProcessCopyRequests) {
        return Ok(());
    }
    if to == CopyRequestStatus::Cancelled
        && actor.user_id.is_some()
        && actor.user_id == request.requested_by
    {
        return Ok(());
    }
    actor.require(Permission::ProcessCopyRequests).map(|_| ())
}

pub(crate) fn status_event(
    entity: EntityKind,
    entity_id: impl fmt::Display,
    recipient: UserId,
    from: &str,
    to: &str,
    occurred_at: DateTime<Utc>,
) -> OutboxEvent {
    let readable = to.replace('_', " ").to_ascii_lowercase();
    let mut tags = BTreeSet::new();
    tags.insert(entity.tag().to_string());
    tags.insert(to.to_ascii_lowercase());

    let draft = NotificationDraft {
        event_id: None,
        user_id: recipient,
        kind: NotificationKind::System,
        title: format!("{} {}", capitalize(entity.label()), readable),
        message: format!("{} {} moved from {} to {}.", entity.label(), entity_id, from, to),
        tags,
    };
    OutboxEvent::new(entity, entity_id, draft, occurred_at)
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
