use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use serde_json::json;
use tower::ServiceExt;

use super::common::*;

use crate::config::RegistryConfig;
use crate::workflows::registry::domain::{ActorContext, Permission, UserId};
use crate::workflows::registry::router::{actor_from_headers, copy_request_handler};
use crate::workflows::registry::{registry_router, RegistryError, RegistryServices};

#[test]
fn actor_headers_resolve_user_and_known_permissions() {
    let mut headers = HeaderMap::new();
    headers.insert("x-actor-id", HeaderValue::from_static(" clerk-ana "));
    headers.insert(
        "x-actor-permissions",
        HeaderValue::from_static("manage_documents, VERIFY_DOCUMENTS,,teleport"),
    );

    let actor = actor_from_headers(&headers);
    assert_eq!(actor.user_id, Some(UserId::new("clerk-ana")));
    assert!(actor.has(Permission::ManageDocuments));
    assert!(actor.has(Permission::VerifyDocuments));
    assert_eq!(actor.permissions.len(), 2);

    assert_eq!(actor_from_headers(&HeaderMap::new()), ActorContext::anonymous());
}

#[tokio::test]
async fn errors_map_to_status_codes() {
    let cases = [
        (
            RegistryError::not_found(crate::workflows::registry::EntityKind::Document, "d-1"),
            StatusCode::NOT_FOUND,
        ),
        (
            RegistryError::Validation {
                fields: vec!["purpose"],
            },
            StatusCode::UNPROCESSABLE_ENTITY,
        ),
        (RegistryError::Conflict("taken".to_string()), StatusCode::CONFLICT),
        (RegistryError::Unauthorized, StatusCode::UNAUTHORIZED),
        (
            RegistryError::Forbidden {
                user: UserId::new("maria"),
                reason: "not yours".to_string(),
            },
            StatusCode::FORBIDDEN,
        ),
        (RegistryError::Storage("down".to_string()), StatusCode::SERVICE_UNAVAILABLE),
    ];

    for (error, status) in cases {
        assert_eq!(error.into_response().status(), status);
    }

    let body = read_json_body(
        RegistryError::Validation {
            fields: vec!["requester_name", "purpose"],
        }
        .into_response(),
    )
    .await;
    assert_eq!(body["kind"], "validation");
    assert_eq!(body["fields"], json!(["requester_name", "purpose"]));
}

#[tokio::test]
async fn document_lifecycle_over_http() {
    let (services, _store) = build_services();
    let app = registry_router(Arc::new(services));

    let response = app
        .clone()
        .oneshot(request_as(
            "POST",
            "/api/v1/documents",
            &clerk(),
            Some(json!({
                "document_type": "BIRTH",
                "registry_number": "2025-BIRTH-00021",
                "metadata": { "child_name": "Lia Cruz" }
            })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let document = read_json_body(response).await;
    let document_id = document["id"].as_str().expect("id").to_string();
    assert_eq!(document["status"], "PENDING");

    let response = app
        .clone()
        .oneshot(request_as(
            "POST",
            &format!("/api/v1/documents/{document_id}/attachments"),
            &clerk(),
            Some(json!({ "kind": "REGISTRY_SCAN", "file_ref": "blob://scan/21.pdf" })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let attachment = read_json_body(response).await;
    let attachment_id = attachment["id"].as_str().expect("id").to_string();

    let response = app
        .clone()
        .oneshot(request_as(
            "POST",
            &format!("/api/v1/documents/{document_id}/transitions"),
            &verifier(),
            Some(json!({ "to": "VERIFIED" })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(request_as(
            "POST",
            &format!("/api/v1/documents/{document_id}/transitions"),
            &verifier(),
            Some(json!({ "to": "READY_FOR_RELEASE" })),
        ))
        .await
        .expect("response");
    assert_error_kind(response, StatusCode::CONFLICT, "invalid_transition").await;

    let response = app
        .clone()
        .oneshot(request_as(
            "POST",
            &format!("/api/v1/attachments/{attachment_id}/transitions"),
            &verifier(),
            Some(json!({ "to": "APPROVED" })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(request_as(
            "POST",
            &format!("/api/v1/documents/{document_id}/transitions"),
            &verifier(),
            Some(json!({ "to": "READY_FOR_RELEASE" })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(request_as(
            "GET",
            &format!("/api/v1/documents/{document_id}"),
            &ActorContext::anonymous(),
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let view = read_json_body(response).await;
    assert_eq!(view["status"], "READY_FOR_RELEASE");
    assert_eq!(view["attachment_records"][0]["status"], "APPROVED");
}

#[tokio::test]
async fn copy_request_submission_reports_missing_fields() {
    let (services, _store) = build_services();
    let document = seed_document(&services);
    let attachment = seed_attachment(&services, &document);
    let app = registry_router(Arc::new(services));

    let response = app
        .clone()
        .oneshot(request_as(
            "POST",
            &format!("/api/v1/attachments/{}/copy-requests", attachment.id),
            &citizen("maria"),
            Some(json!({
                "requester_name": "Maria Reyes",
                "address": "45 Mabini St",
                "relationship": "Mother"
            })),
        ))
        .await
        .expect("response");
    let body = assert_error_kind(response, StatusCode::UNPROCESSABLE_ENTITY, "validation").await;
    assert_eq!(body["fields"], json!(["purpose"]));

    let response = app
        .oneshot(request_as(
            "GET",
            "/api/v1/copy-requests?status=PENDING",
            &ActorContext::anonymous(),
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json_body(response).await, json!([]));
}

#[tokio::test]
async fn kiosk_issues_tickets_without_an_actor() {
    let (services, _store) = build_services();
    let app = registry_router(Arc::new(services));

    for expected in 1..=2 {
        let response = app
            .clone()
            .oneshot(request_as(
                "POST",
                "/api/v1/queue/tickets",
                &ActorContext::anonymous(),
                Some(json!({ "service_type": "TRUE_COPY", "business_day": "2025-10-15" })),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = read_json_body(response).await;
        assert_eq!(body["ticket"]["number"], expected);
        assert_eq!(body["display_code"], format!("TRUE_COPY-{expected:03}"));
    }

    let response = app
        .clone()
        .oneshot(request_as(
            "GET",
            "/api/v1/queue/tickets?service_type=TRUE_COPY&business_day=2025-10-15",
            &ActorContext::anonymous(),
            None,
        ))
        .await
        .expect("response");
    let tickets = read_json_body(response).await;
    assert_eq!(tickets.as_array().map(Vec::len), Some(2));

    let ticket_id = tickets[0]["id"].as_str().expect("id").to_string();
    let response = app
        .clone()
        .oneshot(request_as(
            "GET",
            &format!("/api/v1/queue/tickets/{ticket_id}"),
            &ActorContext::anonymous(),
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json_body(response).await;
    assert_eq!(body["display_code"], "TRUE_COPY-001");
    assert_eq!(body["ticket"]["status"], "WAITING");

    let response = app
        .clone()
        .oneshot(request_as(
            "GET",
            "/api/v1/queue/tickets/not-a-ticket",
            &ActorContext::anonymous(),
            None,
        ))
        .await
        .expect("response");
    assert_error_kind(response, StatusCode::NOT_FOUND, "not_found").await;

    let response = app
        .oneshot(request_as(
            "POST",
            &format!("/api/v1/queue/tickets/{ticket_id}/advance"),
            &citizen("walk-in"),
            Some(json!({ "to": "CALLED" })),
        ))
        .await
        .expect("response");
    assert_error_kind(response, StatusCode::FORBIDDEN, "forbidden").await;
}

#[tokio::test]
async fn notification_inbox_is_private() {
    let (services, _store) = build_services();
    let app = registry_router(Arc::new(services));
    let notifier = ActorContext::user(UserId::new("notifier"), [Permission::SendNotifications]);

    let response = app
        .clone()
        .oneshot(request_as(
            "POST",
            "/api/v1/notifications",
            &notifier,
            Some(json!({
                "user_id": "maria",
                "kind": "SMS",
                "title": "Copy ready",
                "message": "Your certified copy is ready for pickup."
            })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let notification = read_json_body(response).await;
    let notification_id = notification["id"].as_str().expect("id").to_string();

    let response = app
        .clone()
        .oneshot(request_as(
            "GET",
            "/api/v1/users/maria/notifications",
            &citizen("jose"),
            None,
        ))
        .await
        .expect("response");
    assert_error_kind(response, StatusCode::FORBIDDEN, "forbidden").await;

    let response = app
        .clone()
        .oneshot(request_as(
            "POST",
            &format!("/api/v1/notifications/{notification_id}/read"),
            &citizen("maria"),
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(request_as(
            "GET",
            "/api/v1/users/maria/notifications?unread_only=true",
            &citizen("maria"),
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json_body(response).await, json!([]));
}

#[tokio::test]
async fn malformed_ids_are_not_found() {
    let (services, _store) = build_services();
    let response = copy_request_handler::<crate::workflows::registry::MemoryRegistryStore>(
        State(Arc::new(services)),
        Path("not-a-uuid".to_string()),
    )
    .await
    .into_response();
    assert_error_kind(response, StatusCode::NOT_FOUND, "not_found").await;
}

#[tokio::test]
async fn storage_outages_surface_as_service_unavailable() {
    let services = RegistryServices::new(Arc::new(UnavailableStore), &RegistryConfig::default())
        .expect("valid config");
    let app = registry_router(Arc::new(services));

    let response = app
        .oneshot(request_as(
            "POST",
            "/api/v1/queue/tickets",
            &ActorContext::anonymous(),
            Some(json!({ "service_type": "PAYMENT" })),
        ))
        .await
        .expect("response");
    assert_error_kind(response, StatusCode::SERVICE_UNAVAILABLE, "storage").await;
}
