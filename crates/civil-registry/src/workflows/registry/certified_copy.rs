use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::info;

use super::domain::{
    ActorContext, AttachmentId, CertifiedCopyRequest, CopyRequestId, CopyRequestStatus,
    CopyRequestSubmission, Document, DocumentId, EntityKind, NotificationDraft,
    NotificationKind, PaymentDetails, RequesterDetails,
};
use super::error::RegistryError;
use super::notifications::OutboxSignal;
use super::repository::{OutboxEvent, RegistryStore, RegistryTransaction};
use super::transitions::StatusTransitionEngine;

/// Intake and lifecycle of certified true copy requests.
pub struct CertifiedCopyService<S> {
    store: Arc<S>,
    engine: Arc<StatusTransitionEngine<S>>,
    signal: OutboxSignal,
}

impl<S> CertifiedCopyService<S>
where
    S: RegistryStore + 'static,
{
    pub fn new(
        store: Arc<S>,
        engine: Arc<StatusTransitionEngine<S>>,
        signal: OutboxSignal,
    ) -> Self {
        Self {
            store,
            engine,
            signal,
        }
    }

    /// Validate and persist a request against `attachment_id`.
    ///
    /// The parent document's certified-copy flag is refreshed in the same unit of work as
    /// the insert.
    pub fn submit(
        &self,
        attachment_id: AttachmentId,
        submission: CopyRequestSubmission,
        actor: &ActorContext,
    ) -> Result<CertifiedCopyRequest, RegistryError> {
        let (requester, payment) = validate_submission(&submission)?;
        let registry_reference = submission.registry_reference;
        let requested_by = actor.user_id.clone();

        let request = self
            .store
            .transaction(|tx| -> Result<_, RegistryError> {
                let attachment = tx
                    .attachment(attachment_id)?
                    .ok_or_else(|| RegistryError::not_found(EntityKind::Attachment, attachment_id))?;
                let document_id = attachment.document_id;
                if tx.document(document_id)?.is_none() {
                    return Err(RegistryError::not_found(EntityKind::Document, document_id));
                }

                let now = Utc::now();
                let request = CertifiedCopyRequest {
                    id: CopyRequestId::new(),
                    attachment_id,
                    document_id,
                    requested_by: requested_by.clone(),
                    requester,
                    payment,
                    registry_reference,
                    status: CopyRequestStatus::Pending,
                    created_at: now,
                    updated_at: now,
                };
                tx.insert_copy_request(request.clone())?;
                refresh_certified_copy_flag(tx, document_id)?;

                if let Some(user_id) = requested_by {
                    let mut tags = BTreeSet::new();
                    tags.insert(EntityKind::CopyRequest.tag().to_string());
                    tags.insert("pending".to_string());
                    let draft = NotificationDraft {
                        event_id: None,
                        user_id,
                        kind: NotificationKind::System,
                        title: "Certified copy request received".to_string(),
                        message: format!(
                            "Your request {} for a certified true copy is pending review.",
                            request.id
                        ),
                        tags,
                    };
                    tx.enqueue_event(OutboxEvent::new(
                        EntityKind::CopyRequest,
                        request.id,
                        draft,
                        now,
                    ))?;
                }
                Ok(request)
            })?;

        info!(
            copy_request_id = %request.id,
            attachment_id = %attachment_id,
            document_id = %request.document_id,
            "certified copy request submitted"
        );
        self.signal.wake();
        Ok(request)
    }

    pub fn start_processing(
        &self,
        id: CopyRequestId,
        actor: &ActorContext,
    ) -> Result<CertifiedCopyRequest, RegistryError> {
        self.engine
            .transition_copy_request(id, CopyRequestStatus::Processing, actor)
    }

    pub fn complete(
        &self,
        id: CopyRequestId,
        actor: &ActorContext,
    ) -> Result<CertifiedCopyRequest, RegistryError> {
        self.engine
            .transition_copy_request(id, CopyRequestStatus::Completed, actor)
    }

    pub fn cancel(
        &self,
        id: CopyRequestId,
        actor: &ActorContext,
    ) -> Result<CertifiedCopyRequest, RegistryError> {
        self.engine
            .transition_copy_request(id, CopyRequestStatus::Cancelled, actor)
    }

    pub fn get(&self, id: CopyRequestId) -> Result<CertifiedCopyRequest, RegistryError> {
        self.store.read(|tx| -> Result<_, RegistryError> {
            tx.copy_request(id)?
                .ok_or_else(|| RegistryError::not_found(EntityKind::CopyRequest, id))
        })
    }

    pub fn list(
        &self,
        status: Option<CopyRequestStatus>,
    ) -> Result<Vec<CertifiedCopyRequest>, RegistryError> {
        self.store
            .read(|tx| -> Result<_, RegistryError> { Ok(tx.copy_requests(status)?) })
    }
}

/// Recompute `has_certified_copy` for `document_id` from every request across all of its
/// attachments. Must run inside the unit of work that changed a request.
pub(crate) fn refresh_certified_copy_flag(
    tx: &mut dyn RegistryTransaction,
    document_id: DocumentId,
) -> Result<Document, RegistryError> {
    let mut document = tx
        .document(document_id)?
        .ok_or_else(|| RegistryError::not_found(EntityKind::Document, document_id))?;

    let mut has_copy = false;
    for attachment_id in &document.attachments {
        let requests = tx.copy_requests_for_attachment(*attachment_id)?;
        if requests
            .iter()
            .any(|request| request.status != CopyRequestStatus::Cancelled)
        {
            has_copy = true;
            break;
        }
    }

    if document.has_certified_copy != has_copy {
        document.has_certified_copy = has_copy;
        document.updated_at = Utc::now();
        tx.update_document(document.clone())?;
    }
    Ok(document)
}

fn validate_submission(
    submission: &CopyRequestSubmission,
) -> Result<(RequesterDetails, PaymentDetails), RegistryError> {
    let mut fields = Vec::new();

    let required = [
        ("requester_name", &submission.requester_name),
        ("address", &submission.address),
        ("purpose", &submission.purpose),
        ("relationship", &submission.relationship),
    ];
    for (name, value) in required {
        if value.trim().is_empty() {
            fields.push(name);
        }
    }

    if submission
        .payment
        .amount
        .is_some_and(|amount| amount < Decimal::ZERO)
    {
        fields.push("amount");
    }

    let reference = &submission.registry_reference;
    let numbered = [
        ("book_number", reference.book_number),
        ("page_number", reference.page_number),
        ("line_number", reference.line_number),
    ];
    for (name, value) in numbered {
        if value == Some(0) {
            fields.push(name);
        }
    }

    if !fields.is_empty() {
        return Err(RegistryError::Validation { fields });
    }

    let requester = RequesterDetails {
        name: submission.requester_name.trim().to_string(),
        address: submission.address.trim().to_string(),
        purpose: submission.purpose.trim().to_string(),
        relationship: submission.relationship.trim().to_string(),
    };
    let payment = PaymentDetails {
        amount: submission.payment.amount,
        official_receipt_number: submission
            .payment
            .official_receipt_number
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string),
        paid_on: submission.payment.paid_on,
    };
    Ok((requester, payment))
}
