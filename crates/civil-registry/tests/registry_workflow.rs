use std::sync::Arc;

use civil_registry::config::RegistryConfig;
use civil_registry::workflows::registry::{
    ActorContext, Attachment, AttachmentKind, AttachmentStatus, CopyRequestId,
    CopyRequestStatus, CopyRequestSubmission, Document, DocumentStatus, DocumentType,
    MemoryRegistryStore, NewAttachment, NewDocument, Permission, RegistryServices, ServiceType,
    TicketStatus, UserId,
};
use proptest::prelude::*;

fn services() -> RegistryServices<MemoryRegistryStore> {
    RegistryServices::new(Arc::new(MemoryRegistryStore::new()), &RegistryConfig::default())
        .expect("default config is valid")
}

fn staff() -> ActorContext {
    ActorContext::user(UserId::new("registrar"), Permission::all())
}

fn citizen() -> ActorContext {
    ActorContext::user(UserId::new("citizen-lorna"), [])
}

fn submission() -> CopyRequestSubmission {
    CopyRequestSubmission {
        requester_name: "Lorna Dizon".to_string(),
        address: "8 Luna St, Pasig".to_string(),
        purpose: "Visa application".to_string(),
        relationship: "Self".to_string(),
        ..CopyRequestSubmission::default()
    }
}

fn document_with_attachments(
    services: &RegistryServices<MemoryRegistryStore>,
    count: usize,
) -> (Document, Vec<Attachment>) {
    let document = services
        .records
        .create_document(
            NewDocument {
                document_type: DocumentType::Marriage,
                registry_number: None,
                metadata: Default::default(),
            },
            &staff(),
        )
        .expect("document created");
    let attachments = (0..count)
        .map(|i| {
            services
                .records
                .create_attachment(
                    document.id,
                    NewAttachment {
                        kind: AttachmentKind::RegistryScan,
                        file_ref: format!("blob://marriage/{i}.pdf"),
                    },
                    &staff(),
                )
                .expect("attachment created")
        })
        .collect();
    (document, attachments)
}

#[test]
fn walk_in_request_from_intake_to_release() {
    let services = services();
    let (document, attachments) = document_with_attachments(&services, 1);
    let scan = &attachments[0];

    let ticket = services
        .queue
        .issue_ticket(ServiceType::TrueCopy, None)
        .expect("kiosk ticket");
    assert_eq!(ticket.number, 1);
    for status in [TicketStatus::Called, TicketStatus::Serving] {
        services
            .queue
            .advance(ticket.id, status, &staff())
            .expect("ticket advanced");
    }

    services
        .transitions
        .transition_attachment(scan.id, AttachmentStatus::Approved, &staff())
        .expect("scan approved");
    for status in [
        DocumentStatus::Verified,
        DocumentStatus::ReadyForRelease,
        DocumentStatus::Released,
    ] {
        services
            .transitions
            .transition_document(document.id, status, &staff())
            .expect("document advanced");
    }

    let request = services
        .copies
        .submit(scan.id, submission(), &citizen())
        .expect("copy requested");
    services
        .copies
        .start_processing(request.id, &staff())
        .expect("processing");
    services
        .copies
        .complete(request.id, &staff())
        .expect("completed");
    services
        .queue
        .advance(ticket.id, TicketStatus::Done, &staff())
        .expect("ticket done");

    let document = services.records.get_document(document.id).expect("document");
    assert_eq!(document.status, DocumentStatus::Released);
    assert!(document.has_certified_copy);

    let report = services.notifications.drain_outbox().expect("drain");
    // Attachment approval, three document moves, submission receipt, two request moves.
    assert_eq!(report.delivered, 7);

    let citizen_inbox = services
        .notifications
        .list_for_user(&UserId::new("citizen-lorna"), false)
        .expect("citizen inbox");
    assert_eq!(citizen_inbox.len(), 3);
    assert!(citizen_inbox
        .iter()
        .any(|notification| notification.title == "Certified copy request completed"));
}

#[derive(Debug, Clone)]
enum Step {
    Submit(usize),
    Cancel(usize),
    Process(usize),
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0usize..3).prop_map(Step::Submit),
        (0usize..8).prop_map(Step::Cancel),
        (0usize..8).prop_map(Step::Process),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn certified_copy_flag_matches_live_requests(steps in prop::collection::vec(arb_step(), 1..30)) {
        let services = services();
        let (document, attachments) = document_with_attachments(&services, 3);
        let (other, other_attachments) = document_with_attachments(&services, 1);
        services
            .copies
            .submit(other_attachments[0].id, submission(), &citizen())
            .expect("unrelated request");

        let mut requests: Vec<CopyRequestId> = Vec::new();
        for step in steps {
            match step {
                Step::Submit(index) => {
                    let request = services
                        .copies
                        .submit(attachments[index].id, submission(), &citizen())
                        .expect("submission");
                    requests.push(request.id);
                }
                Step::Cancel(index) => {
                    if let Some(id) = requests.get(index) {
                        let _ = services.copies.cancel(*id, &citizen());
                    }
                }
                Step::Process(index) => {
                    if let Some(id) = requests.get(index) {
                        let _ = services.copies.start_processing(*id, &staff());
                    }
                }
            }

            let live = services
                .copies
                .list(None)
                .expect("list")
                .into_iter()
                .filter(|request| request.document_id == document.id)
                .any(|request| request.status != CopyRequestStatus::Cancelled);
            let stored = services.records.get_document(document.id).expect("document");
            prop_assert_eq!(stored.has_certified_copy, live);

            let unrelated = services.records.get_document(other.id).expect("other document");
            prop_assert!(unrelated.has_certified_copy);
        }
    }
}
