use std::sync::Arc;

use chrono::{NaiveDate, TimeZone, Utc};

use super::common::*;

use crate::config::RegistryConfig;
use crate::workflows::registry::domain::{
    ActorContext, QueueTicket, ServiceType, TicketFilter, TicketId, TicketStatus,
};
use crate::workflows::registry::{
    ErrorKind, RegistryError, RegistryServices, RegistryStore, RepositoryError,
};

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 10, d).expect("valid date")
}

#[test]
fn numbers_restart_per_service_type_and_day() {
    let (services, _store) = build_services();

    let first = services
        .queue
        .issue_ticket_on(ServiceType::TrueCopy, day(15), None)
        .expect("first ticket");
    let second = services
        .queue
        .issue_ticket_on(ServiceType::TrueCopy, day(15), Some("senior citizen".to_string()))
        .expect("second ticket");
    let other_service = services
        .queue
        .issue_ticket_on(ServiceType::Registration, day(15), None)
        .expect("registration ticket");
    let next_day = services
        .queue
        .issue_ticket_on(ServiceType::TrueCopy, day(16), None)
        .expect("next day ticket");

    assert_eq!(first.number, 1);
    assert_eq!(second.number, 2);
    assert_eq!(second.notes.as_deref(), Some("senior citizen"));
    assert_eq!(other_service.number, 1);
    assert_eq!(next_day.number, 1);
    assert_eq!(second.display_code(), "TRUE_COPY-002");
    assert_eq!(first.status, TicketStatus::Waiting);
}

#[test]
fn business_day_follows_the_office_offset() {
    let (services, _store) = build_services();
    // 17:30 UTC is already the next morning at UTC+08:00.
    let instant = Utc
        .with_ymd_and_hms(2025, 10, 15, 17, 30, 0)
        .single()
        .expect("valid instant");
    assert_eq!(services.queue.business_day(instant), day(16));
}

#[test]
fn advancing_follows_the_ticket_graph() {
    let (services, _store) = build_services();
    let ticket = services
        .queue
        .issue_ticket_on(ServiceType::Payment, day(15), None)
        .expect("ticket");
    let staff = queue_staff();

    let err = services
        .queue
        .advance(ticket.id, TicketStatus::Serving, &staff)
        .expect_err("cannot skip calling");
    assert_eq!(
        err,
        RegistryError::InvalidTransition {
            entity: crate::workflows::registry::EntityKind::Ticket,
            from: "WAITING",
            to: "SERVING",
        }
    );

    for status in [TicketStatus::Called, TicketStatus::Serving, TicketStatus::Done] {
        let advanced = services
            .queue
            .advance(ticket.id, status, &staff)
            .expect("advance");
        assert_eq!(advanced.status, status);
    }

    let err = services
        .queue
        .advance(ticket.id, TicketStatus::Skipped, &staff)
        .expect_err("done is terminal");
    assert!(matches!(err, RegistryError::InvalidTransition { .. }));
}

#[test]
fn repeating_the_current_status_is_a_no_op() {
    let (services, _store) = build_services();
    let ticket = services
        .queue
        .issue_ticket_on(ServiceType::Correction, day(15), None)
        .expect("ticket");
    let staff = queue_staff();

    let called = services
        .queue
        .advance(ticket.id, TicketStatus::Called, &staff)
        .expect("called");
    let again = services
        .queue
        .advance(ticket.id, TicketStatus::Called, &staff)
        .expect("repeat is accepted");
    assert_eq!(again, called);
}

#[test]
fn advancing_requires_queue_permission() {
    let (services, _store) = build_services();
    let ticket = services
        .queue
        .issue_ticket_on(ServiceType::TrueCopy, day(15), None)
        .expect("ticket");

    assert_eq!(
        services
            .queue
            .advance(ticket.id, TicketStatus::Called, &ActorContext::anonymous()),
        Err(RegistryError::Unauthorized)
    );
    assert!(matches!(
        services
            .queue
            .advance(ticket.id, TicketStatus::Called, &citizen("walk-in")),
        Err(RegistryError::Forbidden { .. })
    ));
    assert!(matches!(
        services
            .queue
            .advance(TicketId::new(), TicketStatus::Called, &queue_staff()),
        Err(RegistryError::NotFound { .. })
    ));
}

#[test]
fn transient_conflicts_are_retried() {
    let (services, store) = build_flaky_services();
    store.fail_next(RepositoryError::Conflict("concurrent insert".to_string()));
    store.fail_next(RepositoryError::Conflict("concurrent insert".to_string()));

    let ticket = services
        .queue
        .issue_ticket_on(ServiceType::TrueCopy, day(15), None)
        .expect("issued after retries");
    assert_eq!(ticket.number, 1);
    assert_eq!(store.pending_failures(), 0);
}

#[test]
fn exhausting_the_retry_bound_surfaces_conflict() {
    let store = Arc::new(FlakyStore::default());
    let config = RegistryConfig {
        ticket_max_attempts: 3,
        ..RegistryConfig::default()
    };
    let services = RegistryServices::new(Arc::clone(&store), &config).expect("valid config");
    for _ in 0..4 {
        store.fail_next(RepositoryError::Conflict("concurrent insert".to_string()));
    }

    match services
        .queue
        .issue_ticket_on(ServiceType::TrueCopy, day(15), None)
    {
        Err(RegistryError::Conflict(detail)) => assert!(detail.contains("after 3 attempts")),
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(store.pending_failures(), 1);
}

#[test]
fn an_exhausted_partition_fails_without_retrying() {
    let (services, store) = build_flaky_services();
    let now = Utc::now();
    let last = QueueTicket {
        id: TicketId::new(),
        number: u32::MAX,
        service_type: ServiceType::Payment,
        business_day: day(15),
        status: TicketStatus::Done,
        notes: None,
        created_at: now,
        updated_at: now,
    };
    store
        .transaction(|tx| -> Result<(), RepositoryError> { tx.insert_ticket(last) })
        .expect("seeded");
    store.fail_next(RepositoryError::Conflict("concurrent insert".to_string()));

    // The collision is retried; the exhausted sequence is returned as is.
    let err = services
        .queue
        .issue_ticket_on(ServiceType::Payment, day(15), None)
        .expect_err("sequence exhausted");
    assert_eq!(
        err,
        RegistryError::SequenceExhausted {
            partition: "PAYMENT/2025-10-15".to_string(),
        }
    );
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(store.pending_failures(), 0);

    let next_day = services
        .queue
        .issue_ticket_on(ServiceType::Payment, day(16), None)
        .expect("other partitions unaffected");
    assert_eq!(next_day.number, 1);
}

#[test]
fn storage_failures_are_not_retried() {
    let (services, store) = build_flaky_services();
    store.fail_next(RepositoryError::Unavailable("connection reset".to_string()));

    let err = services
        .queue
        .issue_ticket_on(ServiceType::TrueCopy, day(15), None)
        .expect_err("storage failure surfaces");
    assert!(matches!(err, RegistryError::Storage(_)));
}

#[test]
fn listing_filters_and_orders_tickets() {
    let (services, _store) = build_services();
    for (service, d) in [
        (ServiceType::Registration, 16),
        (ServiceType::TrueCopy, 15),
        (ServiceType::TrueCopy, 15),
        (ServiceType::Registration, 15),
    ] {
        services
            .queue
            .issue_ticket_on(service, day(d), None)
            .expect("ticket");
    }

    let all = services.queue.list(&TicketFilter::default()).expect("list");
    let order: Vec<_> = all
        .iter()
        .map(|ticket| (ticket.business_day, ticket.service_type, ticket.number))
        .collect();
    assert_eq!(
        order,
        vec![
            (day(15), ServiceType::TrueCopy, 1),
            (day(15), ServiceType::TrueCopy, 2),
            (day(15), ServiceType::Registration, 1),
            (day(16), ServiceType::Registration, 1),
        ]
    );

    let filtered = services
        .queue
        .list(&TicketFilter {
            status: Some(TicketStatus::Waiting),
            service_type: Some(ServiceType::Registration),
            business_day: Some(day(15)),
        })
        .expect("filtered list");
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].number, 1);
}
