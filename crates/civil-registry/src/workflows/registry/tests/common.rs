use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use serde_json::Value;

use crate::config::RegistryConfig;
use crate::workflows::registry::domain::{
    ActorContext, Attachment, AttachmentKind, AttachmentStatus, CopyRequestSubmission, Document,
    DocumentStatus, DocumentType, NewAttachment, NewDocument, PaymentDetails, Permission,
    RegistryReference, UserId,
};
use crate::workflows::registry::repository::{
    RegistryReader, RegistryStore, RegistryTransaction, RepositoryError,
};
use crate::workflows::registry::router::{ACTOR_ID_HEADER, ACTOR_PERMISSIONS_HEADER};
use crate::workflows::registry::{MemoryRegistryStore, RegistryServices};

pub(super) fn clerk() -> ActorContext {
    ActorContext::user(
        UserId::new("clerk-ana"),
        [Permission::ManageDocuments, Permission::ManageAttachments],
    )
}

pub(super) fn verifier() -> ActorContext {
    ActorContext::user(
        UserId::new("verifier-ben"),
        [
            Permission::VerifyDocuments,
            Permission::ReviewAttachments,
            Permission::ReleaseDocuments,
        ],
    )
}

pub(super) fn processor() -> ActorContext {
    ActorContext::user(UserId::new("processor-cora"), [Permission::ProcessCopyRequests])
}

pub(super) fn queue_staff() -> ActorContext {
    ActorContext::user(UserId::new("counter-dan"), [Permission::ManageQueue])
}

pub(super) fn citizen(name: &str) -> ActorContext {
    ActorContext::user(UserId::new(name), [])
}

pub(super) fn new_document() -> NewDocument {
    let mut metadata = BTreeMap::new();
    metadata.insert("child_name".to_string(), "Jose Reyes".to_string());
    metadata.insert("place_of_birth".to_string(), "Quezon City".to_string());
    NewDocument {
        document_type: DocumentType::Birth,
        registry_number: None,
        metadata,
    }
}

pub(super) fn new_attachment() -> NewAttachment {
    NewAttachment {
        kind: AttachmentKind::RegistryScan,
        file_ref: "blob://registry/scans/birth-0001.pdf".to_string(),
    }
}

pub(super) fn submission() -> CopyRequestSubmission {
    CopyRequestSubmission {
        requester_name: "Maria Reyes".to_string(),
        address: "45 Mabini St, Quezon City".to_string(),
        purpose: "School enrollment".to_string(),
        relationship: "Mother".to_string(),
        payment: PaymentDetails::default(),
        registry_reference: RegistryReference {
            book_number: Some(12),
            page_number: Some(88),
            line_number: None,
        },
    }
}

pub(super) fn build_services() -> (RegistryServices<MemoryRegistryStore>, Arc<MemoryRegistryStore>) {
    let store = Arc::new(MemoryRegistryStore::new());
    let services = RegistryServices::new(Arc::clone(&store), &RegistryConfig::default())
        .expect("default config is valid");
    (services, store)
}

pub(super) fn build_flaky_services() -> (RegistryServices<FlakyStore>, Arc<FlakyStore>) {
    let store = Arc::new(FlakyStore::default());
    let services = RegistryServices::new(Arc::clone(&store), &RegistryConfig::default())
        .expect("default config is valid");
    (services, store)
}

pub(super) fn seed_document<S: RegistryStore + 'static>(services: &RegistryServices<S>) -> Document {
    services
        .records
        .create_document(new_document(), &clerk())
        .expect("document created")
}

pub(super) fn seed_attachment<S: RegistryStore + 'static>(
    services: &RegistryServices<S>,
    document: &Document,
) -> Attachment {
    services
        .records
        .create_attachment(document.id, new_attachment(), &clerk())
        .expect("attachment created")
}

/// Document with one approved attachment, already in READY_FOR_RELEASE.
pub(super) fn ready_document<S: RegistryStore + 'static>(
    services: &RegistryServices<S>,
) -> (Document, Attachment) {
    let document = seed_document(services);
    let attachment = seed_attachment(services, &document);
    let attachment = services
        .transitions
        .transition_attachment(attachment.id, AttachmentStatus::Approved, &verifier())
        .expect("attachment approved");
    services
        .transitions
        .transition_document(document.id, DocumentStatus::Verified, &verifier())
        .expect("document verified");
    let document = services
        .transitions
        .transition_document(document.id, DocumentStatus::ReadyForRelease, &verifier())
        .expect("document ready");
    (document, attachment)
}

pub(super) fn request_as(
    method: &str,
    uri: &str,
    actor: &ActorContext,
    body: Option<Value>,
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = &actor.user_id {
        builder = builder.header(ACTOR_ID_HEADER, user.0.as_str());
    }
    let permissions = actor
        .permissions
        .iter()
        .map(|permission| permission.label())
        .collect::<Vec<_>>()
        .join(",");
    if !permissions.is_empty() {
        builder = builder.header(ACTOR_PERMISSIONS_HEADER, permissions);
    }
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .expect("request builds"),
        None => builder.body(Body::empty()).expect("request builds"),
    }
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("body readable");
    serde_json::from_slice(&bytes).expect("json body")
}

pub(super) async fn assert_error_kind(response: Response, status: StatusCode, kind: &str) -> Value {
    assert_eq!(response.status(), status);
    let body = read_json_body(response).await;
    assert_eq!(body["kind"], kind);
    body
}

/// Memory store that fails queued units of work before running them.
#[derive(Default)]
pub(super) struct FlakyStore {
    inner: MemoryRegistryStore,
    failures: Mutex<VecDeque<RepositoryError>>,
}

impl FlakyStore {
    pub(super) fn fail_next(&self, error: RepositoryError) {
        self.failures
            .lock()
            .expect("failure queue poisoned")
            .push_back(error);
    }

    pub(super) fn pending_failures(&self) -> usize {
        self.failures.lock().expect("failure queue poisoned").len()
    }
}

impl RegistryStore for FlakyStore {
    fn transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn RegistryTransaction) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        let injected = self
            .failures
            .lock()
            .expect("failure queue poisoned")
            .pop_front();
        match injected {
            Some(error) => Err(E::from(error)),
            None => self.inner.transaction(work),
        }
    }

    fn read<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&dyn RegistryReader) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        self.inner.read(work)
    }
}

/// Store whose backend is down.
pub(super) struct UnavailableStore;

impl RegistryStore for UnavailableStore {
    fn transaction<T, E, F>(&self, _work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn RegistryTransaction) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        Err(E::from(RepositoryError::Unavailable(
            "connection refused".to_string(),
        )))
    }

    fn read<T, E, F>(&self, _work: F) -> Result<T, E>
    where
        F: FnOnce(&dyn RegistryReader) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        Err(E::from(RepositoryError::Unavailable(
            "connection refused".to_string(),
        )))
    }
}
