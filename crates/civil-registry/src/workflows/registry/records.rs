use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use super::domain::{
    ActorContext, Attachment, AttachmentId, AttachmentStatus, AttachmentUpdate, Document,
    DocumentId, DocumentStatus, EntityKind, NewAttachment, NewDocument, Permission,
};
use super::error::RegistryError;
use super::repository::RegistryStore;

/// Creation and maintenance of documents and their attachments.
///
/// Status changes go through the transition engine; this service only handles records.
pub struct RecordService<S> {
    store: Arc<S>,
}

impl<S> RecordService<S>
where
    S: RegistryStore + 'static,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn create_document(
        &self,
        new: NewDocument,
        actor: &ActorContext,
    ) -> Result<Document, RegistryError> {
        let user = actor.require(Permission::ManageDocuments)?.clone();
        let registry_number = match new.registry_number {
            Some(number) if number.trim().is_empty() => {
                return Err(RegistryError::Validation {
                    fields: vec!["registry_number"],
                })
            }
            Some(number) => Some(number.trim().to_string()),
            None => None,
        };

        let now = Utc::now();
        let document = Document {
            id: DocumentId::new(),
            document_type: new.document_type,
            status: DocumentStatus::Pending,
            registry_number,
            metadata: new.metadata,
            attachments: Vec::new(),
            has_certified_copy: false,
            submitted_by: user,
            created_at: now,
            updated_at: now,
        };

        self.store.transaction(|tx| -> Result<_, RegistryError> {
            if let Some(number) = &document.registry_number {
                if let Some(existing) = tx.document_by_registry_number(number)? {
                    return Err(RegistryError::Conflict(format!(
                        "registry number {number} is already recorded on document {}",
                        existing.id
                    )));
                }
            }
            tx.insert_document(document.clone())?;
            Ok(())
        })?;

        info!(document_id = %document.id, document_type = document.document_type.label(), "document created");
        Ok(document)
    }

    pub fn get_document(&self, id: DocumentId) -> Result<Document, RegistryError> {
        self.store.read(|tx| -> Result<_, RegistryError> {
            tx.document(id)?
                .ok_or_else(|| RegistryError::not_found(EntityKind::Document, id))
        })
    }

    pub fn create_attachment(
        &self,
        document_id: DocumentId,
        new: NewAttachment,
        actor: &ActorContext,
    ) -> Result<Attachment, RegistryError> {
        let user = actor.require(Permission::ManageAttachments)?.clone();
        let file_ref = require_file_ref(&new.file_ref)?;

        let attachment = self.store.transaction(|tx| -> Result<_, RegistryError> {
            let mut document = tx
                .document(document_id)?
                .ok_or_else(|| RegistryError::not_found(EntityKind::Document, document_id))?;
            if document.status == DocumentStatus::Released {
                return Err(RegistryError::GuardRejected {
                    entity: EntityKind::Attachment,
                    to: AttachmentStatus::Pending.label(),
                    reason: format!("document {document_id} is already released"),
                });
            }

            let now = Utc::now();
            let attachment = Attachment {
                id: AttachmentId::new(),
                document_id,
                uploaded_by: user,
                kind: new.kind,
                file_ref,
                status: AttachmentStatus::Pending,
                uploaded_at: now,
            };
            tx.insert_attachment(attachment.clone())?;

            document.attachments.push(attachment.id);
            document.updated_at = now;
            tx.update_document(document)?;
            Ok(attachment)
        })?;

        info!(attachment_id = %attachment.id, document_id = %document_id, "attachment uploaded");
        Ok(attachment)
    }

    /// Replace the kind or file reference of an attachment still awaiting review.
    pub fn update_attachment(
        &self,
        id: AttachmentId,
        update: AttachmentUpdate,
        actor: &ActorContext,
    ) -> Result<Attachment, RegistryError> {
        actor.require(Permission::ManageAttachments)?;
        let file_ref = update
            .file_ref
            .as_deref()
            .map(require_file_ref)
            .transpose()?;

        self.store.transaction(|tx| -> Result<_, RegistryError> {
            let mut attachment = tx
                .attachment(id)?
                .ok_or_else(|| RegistryError::not_found(EntityKind::Attachment, id))?;
            if attachment.status != AttachmentStatus::Pending {
                return Err(RegistryError::GuardRejected {
                    entity: EntityKind::Attachment,
                    to: attachment.status.label(),
                    reason: "reviewed attachments cannot be edited".to_string(),
                });
            }
            if let Some(kind) = update.kind {
                attachment.kind = kind;
            }
            if let Some(file_ref) = file_ref {
                attachment.file_ref = file_ref;
            }
            tx.update_attachment(attachment.clone())?;
            Ok(attachment)
        })
    }

    /// Remove an attachment from its document.
    ///
    /// Rejected while any certified-copy request references it, or when it is the last
    /// approved attachment of a document already cleared for release.
    pub fn delete_attachment(
        &self,
        id: AttachmentId,
        actor: &ActorContext,
    ) -> Result<Attachment, RegistryError> {
        actor.require(Permission::ManageAttachments)?;

        let removed = self.store.transaction(|tx| -> Result<_, RegistryError> {
            let attachment = tx
                .attachment(id)?
                .ok_or_else(|| RegistryError::not_found(EntityKind::Attachment, id))?;
            let mut document = tx.document(attachment.document_id)?.ok_or_else(|| {
                RegistryError::not_found(EntityKind::Document, attachment.document_id)
            })?;

            if attachment.status == AttachmentStatus::Approved
                && matches!(
                    document.status,
                    DocumentStatus::ReadyForRelease | DocumentStatus::Released
                )
            {
                let mut other_approved = false;
                for other in document.attachments.iter().filter(|other| **other != id) {
                    if let Some(other) = tx.attachment(*other)? {
                        if other.status == AttachmentStatus::Approved {
                            other_approved = true;
                            break;
                        }
                    }
                }
                if !other_approved {
                    return Err(RegistryError::GuardRejected {
                        entity: EntityKind::Attachment,
                        to: "DELETED",
                        reason: format!(
                            "document {} is {} and needs an approved attachment",
                            document.id,
                            document.status.label()
                        ),
                    });
                }
            }

            let removed = tx.delete_attachment(id)?;
            document.attachments.retain(|other| *other != id);
            document.updated_at = Utc::now();
            tx.update_document(document)?;
            Ok(removed)
        })?;

        info!(attachment_id = %id, document_id = %removed.document_id, "attachment deleted");
        Ok(removed)
    }

    pub fn get_attachment(&self, id: AttachmentId) -> Result<Attachment, RegistryError> {
        self.store.read(|tx| -> Result<_, RegistryError> {
            tx.attachment(id)?
                .ok_or_else(|| RegistryError::not_found(EntityKind::Attachment, id))
        })
    }

    /// Attachments of a document in upload order.
    pub fn attachments_for(&self, document_id: DocumentId) -> Result<Vec<Attachment>, RegistryError> {
        self.store.read(|tx| -> Result<_, RegistryError> {
            let document = tx
                .document(document_id)?
                .ok_or_else(|| RegistryError::not_found(EntityKind::Document, document_id))?;
            let mut attachments = Vec::with_capacity(document.attachments.len());
            for id in &document.attachments {
                if let Some(attachment) = tx.attachment(*id)? {
                    attachments.push(attachment);
                }
            }
            Ok(attachments)
        })
    }
}

fn require_file_ref(raw: &str) -> Result<String, RegistryError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        Err(RegistryError::Validation {
            fields: vec!["file_ref"],
        })
    } else {
        Ok(trimmed.to_string())
    }
}
