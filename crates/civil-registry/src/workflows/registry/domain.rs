use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::RegistryError;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(raw.trim()).map(Self)
            }
        }
    };
}

entity_id!(
    /// Identifier of a civil-registry record under processing.
    DocumentId
);
entity_id!(AttachmentId);
entity_id!(CopyRequestId);
entity_id!(TicketId);
entity_id!(NotificationId);
entity_id!(
    /// Originating event of a notification; the deduplication key for delivery.
    EventId
);

/// User reference resolved by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Entity families tracked by the registry core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Document,
    Attachment,
    CopyRequest,
    Ticket,
    Notification,
}

impl EntityKind {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Attachment => "attachment",
            Self::CopyRequest => "certified copy request",
            Self::Ticket => "queue ticket",
            Self::Notification => "notification",
        }
    }

    pub const fn tag(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Attachment => "attachment",
            Self::CopyRequest => "copy_request",
            Self::Ticket => "ticket",
            Self::Notification => "notification",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentType {
    Birth,
    Death,
    Marriage,
}

impl DocumentType {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Birth => "BIRTH",
            Self::Death => "DEATH",
            Self::Marriage => "MARRIAGE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Pending,
    Verified,
    ReadyForRelease,
    Released,
}

impl DocumentStatus {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Verified => "VERIFIED",
            Self::ReadyForRelease => "READY_FOR_RELEASE",
            Self::Released => "RELEASED",
        }
    }
}

/// Scan category recorded for an uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttachmentKind {
    RegistryScan,
    IdentityProof,
    Affidavit,
    Supporting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttachmentStatus {
    Pending,
    Approved,
    Rejected,
}

impl AttachmentStatus {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CopyRequestStatus {
    Pending,
    Processing,
    Completed,
    Cancelled,
}

impl CopyRequestStatus {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

/// Counter services offered at the kiosk. Each has its own ticket sequence per day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceType {
    TrueCopy,
    Registration,
    Correction,
    Payment,
}

impl ServiceType {
    pub const fn label(self) -> &'static str {
        match self {
            Self::TrueCopy => "TRUE_COPY",
            Self::Registration => "REGISTRATION",
            Self::Correction => "CORRECTION",
            Self::Payment => "PAYMENT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Waiting,
    Called,
    Serving,
    Done,
    Skipped,
}

impl TicketStatus {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Called => "CALLED",
            Self::Serving => "SERVING",
            Self::Done => "DONE",
            Self::Skipped => "SKIPPED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    Email,
    System,
    Sms,
}

/// Permissions granted by the identity provider and checked before each mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    ManageDocuments,
    VerifyDocuments,
    ReleaseDocuments,
    ManageAttachments,
    ReviewAttachments,
    ProcessCopyRequests,
    ManageQueue,
    SendNotifications,
}

impl Permission {
    pub const fn label(self) -> &'static str {
        match self {
            Self::ManageDocuments => "MANAGE_DOCUMENTS",
            Self::VerifyDocuments => "VERIFY_DOCUMENTS",
            Self::ReleaseDocuments => "RELEASE_DOCUMENTS",
            Self::ManageAttachments => "MANAGE_ATTACHMENTS",
            Self::ReviewAttachments => "REVIEW_ATTACHMENTS",
            Self::ProcessCopyRequests => "PROCESS_COPY_REQUESTS",
            Self::ManageQueue => "MANAGE_QUEUE",
            Self::SendNotifications => "SEND_NOTIFICATIONS",
        }
    }

    pub const fn all() -> [Self; 8] {
        [
            Self::ManageDocuments,
            Self::VerifyDocuments,
            Self::ReleaseDocuments,
            Self::ManageAttachments,
            Self::ReviewAttachments,
            Self::ProcessCopyRequests,
            Self::ManageQueue,
            Self::SendNotifications,
        ]
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let wanted = raw.trim().to_ascii_uppercase();
        Self::all()
            .into_iter()
            .find(|permission| permission.label() == wanted)
            .ok_or_else(|| format!("unknown permission '{raw}'"))
    }
}

/// Acting user and permission set, resolved upstream by the identity provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActorContext {
    pub user_id: Option<UserId>,
    pub permissions: BTreeSet<Permission>,
}

impl ActorContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(user_id: UserId, permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            user_id: Some(user_id),
            permissions: permissions.into_iter().collect(),
        }
    }

    pub fn has(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    pub fn identity(&self) -> Result<&UserId, RegistryError> {
        self.user_id.as_ref().ok_or(RegistryError::Unauthorized)
    }

    /// Returns the acting user when they hold `permission`.
    pub fn require(&self, permission: Permission) -> Result<&UserId, RegistryError> {
        let user = self.identity()?;
        if self.has(permission) {
            Ok(user)
        } else {
            Err(RegistryError::Forbidden {
                user: user.clone(),
                reason: format!("missing permission {}", permission.label()),
            })
        }
    }
}

/// A civil-registry record under processing. Never deleted, only terminal-stated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub document_type: DocumentType,
    pub status: DocumentStatus,
    pub registry_number: Option<String>,
    pub metadata: BTreeMap<String, String>,
    /// Upload order.
    pub attachments: Vec<AttachmentId>,
    pub has_certified_copy: bool,
    pub submitted_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDocument {
    pub document_type: DocumentType,
    #[serde(default)]
    pub registry_number: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    pub document_id: DocumentId,
    pub uploaded_by: UserId,
    pub kind: AttachmentKind,
    /// Opaque blob-storage reference.
    pub file_ref: String,
    pub status: AttachmentStatus,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAttachment {
    pub kind: AttachmentKind,
    #[serde(default)]
    pub file_ref: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentUpdate {
    #[serde(default)]
    pub kind: Option<AttachmentKind>,
    #[serde(default)]
    pub file_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequesterDetails {
    pub name: String,
    pub address: String,
    pub purpose: String,
    pub relationship: String,
}

/// Payment fields stay absent until the request is paid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentDetails {
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub official_receipt_number: Option<String>,
    #[serde(default)]
    pub paid_on: Option<NaiveDate>,
}

/// Book/page/line cross-reference into the physical registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryReference {
    #[serde(default)]
    pub book_number: Option<u32>,
    #[serde(default)]
    pub page_number: Option<u32>,
    #[serde(default)]
    pub line_number: Option<u32>,
}

/// Citizen-provided payload; blank required fields are reported together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyRequestSubmission {
    #[serde(default)]
    pub requester_name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub relationship: String,
    #[serde(default)]
    pub payment: PaymentDetails,
    #[serde(default)]
    pub registry_reference: RegistryReference,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertifiedCopyRequest {
    pub id: CopyRequestId,
    pub attachment_id: AttachmentId,
    pub document_id: DocumentId,
    pub requested_by: Option<UserId>,
    pub requester: RequesterDetails,
    pub payment: PaymentDetails,
    pub registry_reference: RegistryReference,
    pub status: CopyRequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Scope of a ticket-number sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub service_type: ServiceType,
    pub business_day: NaiveDate,
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_type.label(), self.business_day)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueTicket {
    pub id: TicketId,
    pub number: u32,
    pub service_type: ServiceType,
    pub business_day: NaiveDate,
    pub status: TicketStatus,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueTicket {
    pub fn partition(&self) -> PartitionKey {
        PartitionKey {
            service_type: self.service_type,
            business_day: self.business_day,
        }
    }

    /// Kiosk display form, e.g. `TRUE_COPY-007`.
    pub fn display_code(&self) -> String {
        format!("{}-{:03}", self.service_type.label(), self.number)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketFilter {
    #[serde(default)]
    pub status: Option<TicketStatus>,
    #[serde(default)]
    pub service_type: Option<ServiceType>,
    #[serde(default)]
    pub business_day: Option<NaiveDate>,
}

impl TicketFilter {
    pub fn matches(&self, ticket: &QueueTicket) -> bool {
        self.status.map_or(true, |status| ticket.status == status)
            && self
                .service_type
                .map_or(true, |service| ticket.service_type == service)
            && self
                .business_day
                .map_or(true, |day| ticket.business_day == day)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    pub event_id: Option<EventId>,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub read: bool,
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

/// Everything needed to create a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationDraft {
    #[serde(default)]
    pub event_id: Option<EventId>,
    pub user_id: UserId,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}
