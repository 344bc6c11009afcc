use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::domain::{
    ActorContext, Attachment, AttachmentId, AttachmentStatus, AttachmentUpdate,
    CopyRequestId, CopyRequestStatus, CopyRequestSubmission, Document, DocumentId,
    DocumentStatus, EntityKind, NewAttachment, NewDocument, NotificationDraft, NotificationId,
    Permission, ServiceType, TicketFilter, TicketId, TicketStatus, UserId,
};
use super::error::{ErrorKind, RegistryError};
use super::repository::RegistryStore;
use super::service::RegistryServices;

/// Header carrying the authenticated user id, set by the identity gateway.
pub const ACTOR_ID_HEADER: &str = "x-actor-id";
/// Comma-separated permission labels granted to the actor.
pub const ACTOR_PERMISSIONS_HEADER: &str = "x-actor-permissions";

type Services<S> = State<Arc<RegistryServices<S>>>;

/// Router builder exposing the registry operations over JSON.
pub fn registry_router<S>(services: Arc<RegistryServices<S>>) -> Router
where
    S: RegistryStore + 'static,
{
    Router::new()
        .route("/api/v1/documents", post(create_document_handler::<S>))
        .route("/api/v1/documents/:document_id", get(document_handler::<S>))
        .route(
            "/api/v1/documents/:document_id/transitions",
            post(document_transition_handler::<S>),
        )
        .route(
            "/api/v1/documents/:document_id/attachments",
            post(create_attachment_handler::<S>),
        )
        .route(
            "/api/v1/attachments/:attachment_id",
            patch(update_attachment_handler::<S>).delete(delete_attachment_handler::<S>),
        )
        .route(
            "/api/v1/attachments/:attachment_id/transitions",
            post(attachment_transition_handler::<S>),
        )
        .route(
            "/api/v1/attachments/:attachment_id/copy-requests",
            post(submit_copy_request_handler::<S>),
        )
        .route("/api/v1/copy-requests", get(list_copy_requests_handler::<S>))
        .route(
            "/api/v1/copy-requests/:request_id",
            get(copy_request_handler::<S>),
        )
        .route(
            "/api/v1/copy-requests/:request_id/transitions",
            post(copy_request_transition_handler::<S>),
        )
        .route(
            "/api/v1/queue/tickets",
            post(issue_ticket_handler::<S>).get(list_tickets_handler::<S>),
        )
        .route("/api/v1/queue/tickets/:ticket_id", get(ticket_handler::<S>))
        .route(
            "/api/v1/queue/tickets/:ticket_id/advance",
            post(advance_ticket_handler::<S>),
        )
        .route("/api/v1/notifications", post(create_notification_handler::<S>))
        .route(
            "/api/v1/users/:user_id/notifications",
            get(list_notifications_handler::<S>),
        )
        .route(
            "/api/v1/notifications/:notification_id/read",
            post(mark_read_handler::<S>),
        )
        .route(
            "/api/v1/notifications/:notification_id/tags",
            put(update_tags_handler::<S>),
        )
        .with_state(services)
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = match kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InvalidTransition | ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::Storage => StatusCode::SERVICE_UNAVAILABLE,
        };
        if kind == ErrorKind::Storage {
            warn!(error = %self, "registry storage unavailable");
        }

        let payload = json!({
            "kind": kind,
            "error": self.to_string(),
            "fields": self.fields(),
        });
        (status, Json(payload)).into_response()
    }
}

/// Resolve the acting user from gateway headers. Unknown permission labels are ignored.
pub(crate) fn actor_from_headers(headers: &HeaderMap) -> ActorContext {
    let user_id = headers
        .get(ACTOR_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(UserId::new);

    let mut permissions = BTreeSet::new();
    if let Some(raw) = headers
        .get(ACTOR_PERMISSIONS_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        for label in raw.split(',').filter(|label| !label.trim().is_empty()) {
            match Permission::from_str(label) {
                Ok(permission) => {
                    permissions.insert(permission);
                }
                Err(reason) => debug!(%reason, "ignoring actor permission"),
            }
        }
    }

    ActorContext {
        user_id,
        permissions,
    }
}

/// Ids that do not parse cannot exist, so they are reported as missing.
fn parse_id<T: FromStr>(entity: EntityKind, raw: &str) -> Result<T, RegistryError> {
    raw.parse()
        .map_err(|_| RegistryError::not_found(entity, raw))
}

#[derive(Debug, Deserialize)]
pub(crate) struct TransitionBody<T> {
    pub(crate) to: T,
}

#[derive(Debug, Serialize)]
pub(crate) struct DocumentView {
    #[serde(flatten)]
    document: Document,
    attachment_records: Vec<Attachment>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CopyRequestQuery {
    #[serde(default)]
    status: Option<CopyRequestStatus>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct IssueTicketBody {
    service_type: ServiceType,
    #[serde(default)]
    business_day: Option<NaiveDate>,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct NotificationQuery {
    #[serde(default)]
    unread_only: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TagsBody {
    tags: BTreeSet<String>,
}

pub(crate) async fn create_document_handler<S>(
    State(services): Services<S>,
    headers: HeaderMap,
    Json(body): Json<NewDocument>,
) -> Result<Response, RegistryError>
where
    S: RegistryStore + 'static,
{
    let actor = actor_from_headers(&headers);
    let document = services.records.create_document(body, &actor)?;
    Ok((StatusCode::CREATED, Json(document)).into_response())
}

pub(crate) async fn document_handler<S>(
    State(services): Services<S>,
    Path(document_id): Path<String>,
) -> Result<Response, RegistryError>
where
    S: RegistryStore + 'static,
{
    let id: DocumentId = parse_id(EntityKind::Document, &document_id)?;
    let document = services.records.get_document(id)?;
    let attachment_records = services.records.attachments_for(id)?;
    let view = DocumentView {
        document,
        attachment_records,
    };
    Ok((StatusCode::OK, Json(view)).into_response())
}

pub(crate) async fn document_transition_handler<S>(
    State(services): Services<S>,
    headers: HeaderMap,
    Path(document_id): Path<String>,
    Json(body): Json<TransitionBody<DocumentStatus>>,
) -> Result<Response, RegistryError>
where
    S: RegistryStore + 'static,
{
    let actor = actor_from_headers(&headers);
    let id = parse_id(EntityKind::Document, &document_id)?;
    let document = services
        .transitions
        .transition_document(id, body.to, &actor)?;
    Ok((StatusCode::OK, Json(document)).into_response())
}

pub(crate) async fn create_attachment_handler<S>(
    State(services): Services<S>,
    headers: HeaderMap,
    Path(document_id): Path<String>,
    Json(body): Json<NewAttachment>,
) -> Result<Response, RegistryError>
where
    S: RegistryStore + 'static,
{
    let actor = actor_from_headers(&headers);
    let id = parse_id(EntityKind::Document, &document_id)?;
    let attachment = services.records.create_attachment(id, body, &actor)?;
    Ok((StatusCode::CREATED, Json(attachment)).into_response())
}

pub(crate) async fn update_attachment_handler<S>(
    State(services): Services<S>,
    headers: HeaderMap,
    Path(attachment_id): Path<String>,
    Json(body): Json<AttachmentUpdate>,
) -> Result<Response, RegistryError>
where
    S: RegistryStore + 'static,
{
    let actor = actor_from_headers(&headers);
    let id = parse_id(EntityKind::Attachment, &attachment_id)?;
    let attachment = services.records.update_attachment(id, body, &actor)?;
    Ok((StatusCode::OK, Json(attachment)).into_response())
}

pub(crate) async fn delete_attachment_handler<S>(
    State(services): Services<S>,
    headers: HeaderMap,
    Path(attachment_id): Path<String>,
) -> Result<Response, RegistryError>
where
    S: RegistryStore + 'static,
{
    let actor = actor_from_headers(&headers);
    let id: AttachmentId = parse_id(EntityKind::Attachment, &attachment_id)?;
    let removed = services.records.delete_attachment(id, &actor)?;
    Ok((StatusCode::OK, Json(removed)).into_response())
}

pub(crate) async fn attachment_transition_handler<S>(
    State(services): Services<S>,
    headers: HeaderMap,
    Path(attachment_id): Path<String>,
    Json(body): Json<TransitionBody<AttachmentStatus>>,
) -> Result<Response, RegistryError>
where
    S: RegistryStore + 'static,
{
    let actor = actor_from_headers(&headers);
    let id = parse_id(EntityKind::Attachment, &attachment_id)?;
    let attachment = services
        .transitions
        .transition_attachment(id, body.to, &actor)?;
    Ok((StatusCode::OK, Json(attachment)).into_response())
}

pub(crate) async fn submit_copy_request_handler<S>(
    State(services): Services<S>,
    headers: HeaderMap,
    Path(attachment_id): Path<String>,
    Json(body): Json<CopyRequestSubmission>,
) -> Result<Response, RegistryError>
where
    S: RegistryStore + 'static,
{
    let actor = actor_from_headers(&headers);
    let id = parse_id(EntityKind::Attachment, &attachment_id)?;
    let request = services.copies.submit(id, body, &actor)?;
    Ok((StatusCode::CREATED, Json(request)).into_response())
}

pub(crate) async fn list_copy_requests_handler<S>(
    State(services): Services<S>,
    Query(query): Query<CopyRequestQuery>,
) -> Result<Response, RegistryError>
where
    S: RegistryStore + 'static,
{
    let requests = services.copies.list(query.status)?;
    Ok((StatusCode::OK, Json(requests)).into_response())
}

pub(crate) async fn copy_request_handler<S>(
    State(services): Services<S>,
    Path(request_id): Path<String>,
) -> Result<Response, RegistryError>
where
    S: RegistryStore + 'static,
{
    let id: CopyRequestId = parse_id(EntityKind::CopyRequest, &request_id)?;
    let request = services.copies.get(id)?;
    Ok((StatusCode::OK, Json(request)).into_response())
}

pub(crate) async fn copy_request_transition_handler<S>(
    State(services): Services<S>,
    headers: HeaderMap,
    Path(request_id): Path<String>,
    Json(body): Json<TransitionBody<CopyRequestStatus>>,
) -> Result<Response, RegistryError>
where
    S: RegistryStore + 'static,
{
    let actor = actor_from_headers(&headers);
    let id = parse_id(EntityKind::CopyRequest, &request_id)?;
    let request = services
        .transitions
        .transition_copy_request(id, body.to, &actor)?;
    Ok((StatusCode::OK, Json(request)).into_response())
}

pub(crate) async fn issue_ticket_handler<S>(
    State(services): Services<S>,
    Json(body): Json<IssueTicketBody>,
) -> Result<Response, RegistryError>
where
    S: RegistryStore + 'static,
{
    let ticket = match body.business_day {
        Some(day) => services
            .queue
            .issue_ticket_on(body.service_type, day, body.notes)?,
        None => services.queue.issue_ticket(body.service_type, body.notes)?,
    };
    let payload = json!({
        "display_code": ticket.display_code(),
        "ticket": ticket,
    });
    Ok((StatusCode::CREATED, Json(payload)).into_response())
}

pub(crate) async fn list_tickets_handler<S>(
    State(services): Services<S>,
    Query(filter): Query<TicketFilter>,
) -> Result<Response, RegistryError>
where
    S: RegistryStore + 'static,
{
    let tickets = services.queue.list(&filter)?;
    Ok((StatusCode::OK, Json(tickets)).into_response())
}

pub(crate) async fn ticket_handler<S>(
    State(services): Services<S>,
    Path(ticket_id): Path<String>,
) -> Result<Response, RegistryError>
where
    S: RegistryStore + 'static,
{
    let id: TicketId = parse_id(EntityKind::Ticket, &ticket_id)?;
    let ticket = services.queue.get(id)?;
    let payload = json!({
        "display_code": ticket.display_code(),
        "ticket": ticket,
    });
    Ok((StatusCode::OK, Json(payload)).into_response())
}

pub(crate) async fn advance_ticket_handler<S>(
    State(services): Services<S>,
    headers: HeaderMap,
    Path(ticket_id): Path<String>,
    Json(body): Json<TransitionBody<TicketStatus>>,
) -> Result<Response, RegistryError>
where
    S: RegistryStore + 'static,
{
    let actor = actor_from_headers(&headers);
    let id: TicketId = parse_id(EntityKind::Ticket, &ticket_id)?;
    let ticket = services.queue.advance(id, body.to, &actor)?;
    Ok((StatusCode::OK, Json(ticket)).into_response())
}

pub(crate) async fn create_notification_handler<S>(
    State(services): Services<S>,
    headers: HeaderMap,
    Json(draft): Json<NotificationDraft>,
) -> Result<Response, RegistryError>
where
    S: RegistryStore + 'static,
{
    let actor = actor_from_headers(&headers);
    actor.require(Permission::SendNotifications)?;
    let notification = services.notifications.notify(draft)?;
    Ok((StatusCode::CREATED, Json(notification)).into_response())
}

pub(crate) async fn list_notifications_handler<S>(
    State(services): Services<S>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Query(query): Query<NotificationQuery>,
) -> Result<Response, RegistryError>
where
    S: RegistryStore + 'static,
{
    let actor = actor_from_headers(&headers);
    let viewer = actor.identity()?;
    let user_id = UserId::new(user_id);
    if *viewer != user_id && !actor.has(Permission::SendNotifications) {
        return Err(RegistryError::Forbidden {
            user: viewer.clone(),
            reason: format!("cannot read notifications of {user_id}"),
        });
    }
    let notifications = services
        .notifications
        .list_for_user(&user_id, query.unread_only)?;
    Ok((StatusCode::OK, Json(notifications)).into_response())
}

pub(crate) async fn mark_read_handler<S>(
    State(services): Services<S>,
    headers: HeaderMap,
    Path(notification_id): Path<String>,
) -> Result<Response, RegistryError>
where
    S: RegistryStore + 'static,
{
    let actor = actor_from_headers(&headers);
    let id: NotificationId = parse_id(EntityKind::Notification, &notification_id)?;
    let notification = services.notifications.mark_read(id, &actor)?;
    Ok((StatusCode::OK, Json(notification)).into_response())
}

pub(crate) async fn update_tags_handler<S>(
    State(services): Services<S>,
    headers: HeaderMap,
    Path(notification_id): Path<String>,
    Json(body): Json<TagsBody>,
) -> Result<Response, RegistryError>
where
    S: RegistryStore + 'static,
{
    let actor = actor_from_headers(&headers);
    let id: NotificationId = parse_id(EntityKind::Notification, &notification_id)?;
    let notification = services
        .notifications
        .update_tags(id, body.tags, &actor)?;
    Ok((StatusCode::OK, Json(notification)).into_response())
}
