use chrono::{NaiveDate, Utc};
use civil_registry::config::RegistryConfig;
use civil_registry::error::AppError;
use civil_registry::workflows::registry::{
    ActorContext, AttachmentKind, AttachmentStatus, CopyRequestSubmission, DocumentStatus,
    DocumentType, MemoryRegistryStore, NewAttachment, NewDocument, PaymentDetails, Permission,
    RegistryReference, RegistryServices, ServiceType, TicketStatus, UserId,
};
use clap::Args;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Args, Debug, Default)]
pub(crate) struct DemoArgs {
    /// Business day for the kiosk tickets (YYYY-MM-DD). Defaults to today in the office offset.
    #[arg(long, value_parser = crate::infra::parse_date)]
    pub(crate) business_day: Option<NaiveDate>,
    /// Certified copy fee recorded on the request.
    #[arg(long)]
    pub(crate) fee: Option<Decimal>,
    /// Number of walk-in tickets issued ahead of the demo citizen.
    #[arg(long, default_value_t = 0)]
    pub(crate) walk_ins: u32,
}

pub(crate) fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let config = RegistryConfig::from_env()?;
    let store = Arc::new(MemoryRegistryStore::new());
    let services = RegistryServices::new(store, &config)?;

    let registrar = ActorContext::user(UserId::new("registrar-demo"), Permission::all());
    let citizen = ActorContext::user(UserId::new("citizen-demo"), []);
    let business_day = args
        .business_day
        .unwrap_or_else(|| services.queue.business_day(Utc::now()));
    let fee = args.fee.unwrap_or_else(|| Decimal::new(15500, 2));

    println!("Civil registry demo");
    println!("Business day: {business_day}");

    println!("\nQueue");
    for _ in 0..args.walk_ins {
        services
            .queue
            .issue_ticket_on(ServiceType::TrueCopy, business_day, None)?;
    }
    let ticket = services.queue.issue_ticket_on(
        ServiceType::TrueCopy,
        business_day,
        Some("certified copy pickup".to_string()),
    )?;
    println!("  Issued ticket {} ({})", ticket.display_code(), ticket.status.label());
    let registration = services
        .queue
        .issue_ticket_on(ServiceType::Registration, business_day, None)?;
    println!(
        "  Issued ticket {} (separate sequence)",
        registration.display_code()
    );
    for status in [TicketStatus::Called, TicketStatus::Serving] {
        let advanced = services.queue.advance(ticket.id, status, &registrar)?;
        println!("  {} is now {}", advanced.display_code(), advanced.status.label());
    }

    println!("\nDocument");
    let mut metadata = BTreeMap::new();
    metadata.insert("child_name".to_string(), "Andres Villanueva".to_string());
    metadata.insert("date_of_birth".to_string(), "2019-03-02".to_string());
    let document = services.records.create_document(
        NewDocument {
            document_type: DocumentType::Birth,
            registry_number: Some(format!("{}-BIRTH-0001", business_day.format("%Y"))),
            metadata,
        },
        &registrar,
    )?;
    println!(
        "  Created {} document {} ({})",
        document.document_type.label(),
        document.id,
        document.status.label()
    );
    let attachment = services.records.create_attachment(
        document.id,
        NewAttachment {
            kind: AttachmentKind::RegistryScan,
            file_ref: "blob://demo/birth-0001.pdf".to_string(),
        },
        &registrar,
    )?;
    println!("  Uploaded scan {}", attachment.id);

    match services.transitions.transition_document(
        document.id,
        DocumentStatus::ReadyForRelease,
        &registrar,
    ) {
        Ok(_) => println!("  Unexpected: skipped verification"),
        Err(err) => println!("  Skipping verification rejected: {err}"),
    }

    services
        .transitions
        .transition_attachment(attachment.id, AttachmentStatus::Approved, &registrar)?;
    for status in [
        DocumentStatus::Verified,
        DocumentStatus::ReadyForRelease,
        DocumentStatus::Released,
    ] {
        let updated = services
            .transitions
            .transition_document(document.id, status, &registrar)?;
        println!("  Document is now {}", updated.status.label());
    }

    println!("\nCertified copy");
    let incomplete = CopyRequestSubmission {
        requester_name: "Liza Villanueva".to_string(),
        ..CopyRequestSubmission::default()
    };
    if let Err(err) = services.copies.submit(attachment.id, incomplete, &citizen) {
        println!("  Incomplete submission rejected: {err}");
    }

    let request = services.copies.submit(
        attachment.id,
        CopyRequestSubmission {
            requester_name: "Liza Villanueva".to_string(),
            address: "21 Del Pilar St, Makati".to_string(),
            purpose: "Passport application".to_string(),
            relationship: "Mother".to_string(),
            payment: PaymentDetails {
                amount: Some(fee),
                official_receipt_number: Some("OR-DEMO-0001".to_string()),
                paid_on: Some(business_day),
            },
            registry_reference: RegistryReference {
                book_number: Some(4),
                page_number: Some(112),
                line_number: Some(7),
            },
        },
        &citizen,
    )?;
    let flagged = services.records.get_document(document.id)?;
    println!(
        "  Request {} is {} (fee {}); document has certified copy: {}",
        request.id,
        request.status.label(),
        fee,
        flagged.has_certified_copy
    );
    if let Err(err) = services.copies.complete(request.id, &registrar) {
        println!("  Completing before processing rejected: {err}");
    }
    services.copies.start_processing(request.id, &registrar)?;
    let completed = services.copies.complete(request.id, &registrar)?;
    println!("  Request is now {}", completed.status.label());

    let done = services
        .queue
        .advance(ticket.id, TicketStatus::Done, &registrar)?;
    println!("  {} is now {}", done.display_code(), done.status.label());

    println!("\nNotifications");
    let report = services.notifications.drain_outbox()?;
    println!(
        "  Outbox drained: {} delivered, {} retrying, {} failed",
        report.delivered, report.retrying, report.failed
    );
    let citizen_id = UserId::new("citizen-demo");
    for notification in services.notifications.list_for_user(&citizen_id, false)? {
        println!("  [{}] {}: {}", citizen_id, notification.title, notification.message);
    }

    Ok(())
}
