//! In-process registry store used by the service binary, the demo, and tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::domain::{
    Attachment, AttachmentId, CertifiedCopyRequest, CopyRequestId, CopyRequestStatus, Document,
    DocumentId, EntityKind, EventId, Notification, NotificationId, PartitionKey, QueueTicket,
    TicketFilter, TicketId, UserId,
};
use super::repository::{
    OutboxEvent, OutboxState, RegistryReader, RegistryStore, RegistryTransaction,
    RepositoryError,
};

/// Delivered or failed outbox events kept readable before they are evicted.
pub const DEFAULT_OUTBOX_RETENTION: usize = 1024;

/// Lock-guarded tables giving serializable transactions.
///
/// A unit of work writes straight into the live tables and logs how to undo each write.
/// The log is replayed backwards when the work returns `Err` or panics, before the write
/// lock is released, so no reader observes a partial unit of work. Settled outbox events
/// beyond the retention window are evicted on commit.
#[derive(Debug)]
pub struct MemoryRegistryStore {
    tables: RwLock<MemoryTables>,
    outbox_retention: usize,
}

impl Default for MemoryRegistryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::with_outbox_retention(DEFAULT_OUTBOX_RETENTION)
    }

    pub fn with_outbox_retention(outbox_retention: usize) -> Self {
        Self {
            tables: RwLock::new(MemoryTables::default()),
            outbox_retention,
        }
    }

    // Rollback completes before a guard is dropped, so a poisoned lock still guards
    // committed state.
    fn write_tables(&self) -> RwLockWriteGuard<'_, MemoryTables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_tables(&self) -> RwLockReadGuard<'_, MemoryTables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RegistryStore for MemoryRegistryStore {
    fn transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn RegistryTransaction) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        let mut tables = self.write_tables();
        let mut tx = MemoryTransaction::new(&mut tables);
        let output = work(&mut tx)?;
        tx.commit(self.outbox_retention);
        Ok(output)
    }

    fn read<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&dyn RegistryReader) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        let tables = self.read_tables();
        work(&*tables)
    }
}

#[derive(Debug)]
struct OutboxSlot {
    sequence: u64,
    event: OutboxEvent,
}

#[derive(Debug, Default)]
struct MemoryTables {
    documents: HashMap<DocumentId, Document>,
    registry_numbers: HashMap<String, DocumentId>,
    attachments: HashMap<AttachmentId, Attachment>,
    copy_requests: HashMap<CopyRequestId, CertifiedCopyRequest>,
    requests_by_attachment: HashMap<AttachmentId, Vec<CopyRequestId>>,
    tickets: HashMap<TicketId, QueueTicket>,
    ticket_numbers: BTreeMap<PartitionKey, BTreeMap<u32, TicketId>>,
    notifications: HashMap<NotificationId, Notification>,
    notifications_by_user: HashMap<UserId, Vec<NotificationId>>,
    notification_events: HashMap<EventId, NotificationId>,
    outbox: HashMap<EventId, OutboxSlot>,
    /// Enqueue sequence to event, pending events only.
    pending_outbox: BTreeMap<u64, EventId>,
    /// Settled events, oldest first.
    settled_outbox: VecDeque<EventId>,
    outbox_sequence: u64,
}

impl MemoryTables {
    fn evict_settled(&mut self, retention: usize) {
        while self.settled_outbox.len() > retention {
            let Some(event_id) = self.settled_outbox.pop_front() else {
                break;
            };
            self.outbox.remove(&event_id);
        }
    }
}

fn missing(entity: EntityKind, id: impl ToString) -> RepositoryError {
    RepositoryError::NotFound {
        entity,
        id: id.to_string(),
    }
}

fn restore<K: Eq + Hash, V>(map: &mut HashMap<K, V>, key: K, previous: Option<V>) {
    match previous {
        Some(value) => {
            map.insert(key, value);
        }
        None => {
            map.remove(&key);
        }
    }
}

impl RegistryReader for MemoryTables {
    fn document(&self, id: DocumentId) -> Result<Option<Document>, RepositoryError> {
        Ok(self.documents.get(&id).cloned())
    }

    fn document_by_registry_number(
        &self,
        registry_number: &str,
    ) -> Result<Option<Document>, RepositoryError> {
        Ok(self
            .registry_numbers
            .get(registry_number)
            .and_then(|id| self.documents.get(id))
            .cloned())
    }

    fn attachment(&self, id: AttachmentId) -> Result<Option<Attachment>, RepositoryError> {
        Ok(self.attachments.get(&id).cloned())
    }

    fn copy_request(
        &self,
        id: CopyRequestId,
    ) -> Result<Option<CertifiedCopyRequest>, RepositoryError> {
        Ok(self.copy_requests.get(&id).cloned())
    }

    fn copy_requests_for_attachment(
        &self,
        attachment_id: AttachmentId,
    ) -> Result<Vec<CertifiedCopyRequest>, RepositoryError> {
        let mut requests: Vec<_> = self
            .requests_by_attachment
            .get(&attachment_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.copy_requests.get(id))
            .cloned()
            .collect();
        requests.sort_by_key(|request| (request.created_at, request.id));
        Ok(requests)
    }

    fn copy_requests(
        &self,
        status: Option<CopyRequestStatus>,
    ) -> Result<Vec<CertifiedCopyRequest>, RepositoryError> {
        let mut requests: Vec<_> = self
            .copy_requests
            .values()
            .filter(|request| status.map_or(true, |status| request.status == status))
            .cloned()
            .collect();
        requests.sort_by_key(|request| (request.created_at, request.id));
        Ok(requests)
    }

    fn ticket(&self, id: TicketId) -> Result<Option<QueueTicket>, RepositoryError> {
        Ok(self.tickets.get(&id).cloned())
    }

    fn last_ticket_number(&self, partition: &PartitionKey) -> Result<Option<u32>, RepositoryError> {
        Ok(self
            .ticket_numbers
            .get(partition)
            .and_then(|numbers| numbers.keys().next_back().copied()))
    }

    fn tickets(&self, filter: &TicketFilter) -> Result<Vec<QueueTicket>, RepositoryError> {
        let mut tickets: Vec<QueueTicket> = match (filter.service_type, filter.business_day) {
            (Some(service_type), Some(business_day)) => {
                let partition = PartitionKey {
                    service_type,
                    business_day,
                };
                self.ticket_numbers
                    .get(&partition)
                    .into_iter()
                    .flat_map(|numbers| numbers.values())
                    .filter_map(|id| self.tickets.get(id))
                    .filter(|ticket| filter.matches(ticket))
                    .cloned()
                    .collect()
            }
            _ => self
                .tickets
                .values()
                .filter(|ticket| filter.matches(ticket))
                .cloned()
                .collect(),
        };
        tickets.sort_by_key(|ticket| (ticket.business_day, ticket.service_type, ticket.number));
        Ok(tickets)
    }

    fn notification(&self, id: NotificationId) -> Result<Option<Notification>, RepositoryError> {
        Ok(self.notifications.get(&id).cloned())
    }

    fn notification_for_event(
        &self,
        event_id: EventId,
    ) -> Result<Option<Notification>, RepositoryError> {
        Ok(self
            .notification_events
            .get(&event_id)
            .and_then(|id| self.notifications.get(id))
            .cloned())
    }

    fn notifications_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<Notification>, RepositoryError> {
        let mut notifications: Vec<_> = self
            .notifications_by_user
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.notifications.get(id))
            .cloned()
            .collect();
        notifications.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(notifications)
    }

    fn pending_events(&self, limit: usize) -> Result<Vec<OutboxEvent>, RepositoryError> {
        Ok(self
            .pending_outbox
            .values()
            .filter_map(|event_id| self.outbox.get(event_id))
            .take(limit)
            .map(|slot| slot.event.clone())
            .collect())
    }

    fn event(&self, event_id: EventId) -> Result<Option<OutboxEvent>, RepositoryError> {
        Ok(self.outbox.get(&event_id).map(|slot| slot.event.clone()))
    }
}

type UndoStep = Box<dyn FnOnce(&mut MemoryTables)>;

/// Unit of work over the live tables. Dropping it without [`MemoryTransaction::commit`]
/// undoes every write it made.
struct MemoryTransaction<'a> {
    tables: &'a mut MemoryTables,
    undo: Vec<UndoStep>,
}

impl<'a> MemoryTransaction<'a> {
    fn new(tables: &'a mut MemoryTables) -> Self {
        Self {
            tables,
            undo: Vec::new(),
        }
    }

    fn commit(mut self, outbox_retention: usize) {
        self.undo.clear();
        self.tables.evict_settled(outbox_retention);
    }

    fn on_rollback(&mut self, step: impl FnOnce(&mut MemoryTables) + 'static) {
        self.undo.push(Box::new(step));
    }

    fn claim_registry_number(
        &mut self,
        id: DocumentId,
        previous: Option<String>,
        next: Option<&str>,
    ) -> Result<(), RepositoryError> {
        if previous.as_deref() == next {
            return Ok(());
        }
        if let Some(number) = next {
            if let Some(owner) = self.tables.registry_numbers.get(number) {
                if *owner != id {
                    return Err(RepositoryError::Conflict(format!(
                        "registry number {number} already belongs to document {owner}"
                    )));
                }
            }
        }
        if let Some(number) = previous {
            let released = self.tables.registry_numbers.remove(&number);
            self.on_rollback(move |tables| restore(&mut tables.registry_numbers, number, released));
        }
        if let Some(number) = next {
            let number = number.to_string();
            let replaced = self.tables.registry_numbers.insert(number.clone(), id);
            self.on_rollback(move |tables| restore(&mut tables.registry_numbers, number, replaced));
        }
        Ok(())
    }

    fn put_document(&mut self, document: Document) {
        let id = document.id;
        let previous = self.tables.documents.insert(id, document);
        self.on_rollback(move |tables| restore(&mut tables.documents, id, previous));
    }

    fn put_attachment(&mut self, attachment: Attachment) {
        let id = attachment.id;
        let previous = self.tables.attachments.insert(id, attachment);
        self.on_rollback(move |tables| restore(&mut tables.attachments, id, previous));
    }

    fn put_copy_request(&mut self, request: CertifiedCopyRequest) {
        let id = request.id;
        let previous = self.tables.copy_requests.insert(id, request);
        self.on_rollback(move |tables| restore(&mut tables.copy_requests, id, previous));
    }

    fn put_ticket(&mut self, ticket: QueueTicket) {
        let id = ticket.id;
        let previous = self.tables.tickets.insert(id, ticket);
        self.on_rollback(move |tables| restore(&mut tables.tickets, id, previous));
    }

    fn put_notification(&mut self, notification: Notification) {
        let id = notification.id;
        let previous = self.tables.notifications.insert(id, notification);
        self.on_rollback(move |tables| restore(&mut tables.notifications, id, previous));
    }

    fn index_pending(&mut self, sequence: u64, event_id: EventId) {
        self.tables.pending_outbox.insert(sequence, event_id);
        self.on_rollback(move |tables| {
            tables.pending_outbox.remove(&sequence);
        });
    }

    fn settle(&mut self, sequence: u64, event_id: EventId) {
        if self.tables.pending_outbox.remove(&sequence).is_some() {
            self.on_rollback(move |tables| {
                tables.pending_outbox.insert(sequence, event_id);
            });
        }
        self.tables.settled_outbox.push_back(event_id);
        self.on_rollback(|tables| {
            tables.settled_outbox.pop_back();
        });
    }
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        while let Some(step) = self.undo.pop() {
            step(&mut *self.tables);
        }
    }
}

impl RegistryReader for MemoryTransaction<'_> {
    fn document(&self, id: DocumentId) -> Result<Option<Document>, RepositoryError> {
        self.tables.document(id)
    }

    fn document_by_registry_number(
        &self,
        registry_number: &str,
    ) -> Result<Option<Document>, RepositoryError> {
        self.tables.document_by_registry_number(registry_number)
    }

    fn attachment(&self, id: AttachmentId) -> Result<Option<Attachment>, RepositoryError> {
        self.tables.attachment(id)
    }

    fn copy_request(
        &self,
        id: CopyRequestId,
    ) -> Result<Option<CertifiedCopyRequest>, RepositoryError> {
        self.tables.copy_request(id)
    }

    fn copy_requests_for_attachment(
        &self,
        attachment_id: AttachmentId,
    ) -> Result<Vec<CertifiedCopyRequest>, RepositoryError> {
        self.tables.copy_requests_for_attachment(attachment_id)
    }

    fn copy_requests(
        &self,
        status: Option<CopyRequestStatus>,
    ) -> Result<Vec<CertifiedCopyRequest>, RepositoryError> {
        self.tables.copy_requests(status)
    }

    fn ticket(&self, id: TicketId) -> Result<Option<QueueTicket>, RepositoryError> {
        self.tables.ticket(id)
    }

    fn last_ticket_number(&self, partition: &PartitionKey) -> Result<Option<u32>, RepositoryError> {
        self.tables.last_ticket_number(partition)
    }

    fn tickets(&self, filter: &TicketFilter) -> Result<Vec<QueueTicket>, RepositoryError> {
        self.tables.tickets(filter)
    }

    fn notification(&self, id: NotificationId) -> Result<Option<Notification>, RepositoryError> {
        self.tables.notification(id)
    }

    fn notification_for_event(
        &self,
        event_id: EventId,
    ) -> Result<Option<Notification>, RepositoryError> {
        self.tables.notification_for_event(event_id)
    }

    fn notifications_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<Notification>, RepositoryError> {
        self.tables.notifications_for_user(user_id)
    }

    fn pending_events(&self, limit: usize) -> Result<Vec<OutboxEvent>, RepositoryError> {
        self.tables.pending_events(limit)
    }

    fn event(&self, event_id: EventId) -> Result<Option<OutboxEvent>, RepositoryError> {
        self.tables.event(event_id)
    }
}

impl RegistryTransaction for MemoryTransaction<'_> {
    fn insert_document(&mut self, document: Document) -> Result<(), RepositoryError> {
        if self.tables.documents.contains_key(&document.id) {
            return Err(RepositoryError::Conflict(format!(
                "document {} already exists",
                document.id
            )));
        }
        self.claim_registry_number(document.id, None, document.registry_number.as_deref())?;
        self.put_document(document);
        Ok(())
    }

    fn update_document(&mut self, document: Document) -> Result<(), RepositoryError> {
        let previous = self
            .tables
            .documents
            .get(&document.id)
            .ok_or_else(|| missing(EntityKind::Document, document.id))?
            .registry_number
            .clone();
        self.claim_registry_number(document.id, previous, document.registry_number.as_deref())?;
        self.put_document(document);
        Ok(())
    }

    fn insert_attachment(&mut self, attachment: Attachment) -> Result<(), RepositoryError> {
        if !self.tables.documents.contains_key(&attachment.document_id) {
            return Err(missing(EntityKind::Document, attachment.document_id));
        }
        if self.tables.attachments.contains_key(&attachment.id) {
            return Err(RepositoryError::Conflict(format!(
                "attachment {} already exists",
                attachment.id
            )));
        }
        self.put_attachment(attachment);
        Ok(())
    }

    fn update_attachment(&mut self, attachment: Attachment) -> Result<(), RepositoryError> {
        if !self.tables.attachments.contains_key(&attachment.id) {
            return Err(missing(EntityKind::Attachment, attachment.id));
        }
        self.put_attachment(attachment);
        Ok(())
    }

    fn delete_attachment(&mut self, id: AttachmentId) -> Result<Attachment, RepositoryError> {
        let referenced = self
            .tables
            .requests_by_attachment
            .get(&id)
            .map_or(0, Vec::len);
        if referenced > 0 {
            return Err(RepositoryError::Conflict(format!(
                "attachment {id} is referenced by {referenced} certified copy request(s)"
            )));
        }
        let removed = self
            .tables
            .attachments
            .remove(&id)
            .ok_or_else(|| missing(EntityKind::Attachment, id))?;
        let restored = removed.clone();
        self.on_rollback(move |tables| {
            tables.attachments.insert(id, restored);
        });
        Ok(removed)
    }

    fn insert_copy_request(
        &mut self,
        request: CertifiedCopyRequest,
    ) -> Result<(), RepositoryError> {
        let attachment_id = request.attachment_id;
        if !self.tables.attachments.contains_key(&attachment_id) {
            return Err(missing(EntityKind::Attachment, attachment_id));
        }
        if self.tables.copy_requests.contains_key(&request.id) {
            return Err(RepositoryError::Conflict(format!(
                "certified copy request {} already exists",
                request.id
            )));
        }
        self.tables
            .requests_by_attachment
            .entry(attachment_id)
            .or_default()
            .push(request.id);
        self.on_rollback(move |tables| {
            if let Some(ids) = tables.requests_by_attachment.get_mut(&attachment_id) {
                ids.pop();
            }
        });
        self.put_copy_request(request);
        Ok(())
    }

    fn update_copy_request(
        &mut self,
        request: CertifiedCopyRequest,
    ) -> Result<(), RepositoryError> {
        let stored = self
            .tables
            .copy_requests
            .get(&request.id)
            .ok_or_else(|| missing(EntityKind::CopyRequest, request.id))?;
        if stored.attachment_id != request.attachment_id {
            return Err(RepositoryError::Conflict(format!(
                "certified copy request {} cannot move to another attachment",
                request.id
            )));
        }
        self.put_copy_request(request);
        Ok(())
    }

    fn insert_ticket(&mut self, ticket: QueueTicket) -> Result<(), RepositoryError> {
        if self.tables.tickets.contains_key(&ticket.id) {
            return Err(RepositoryError::Conflict(format!(
                "ticket {} already exists",
                ticket.id
            )));
        }
        let partition = ticket.partition();
        let number = ticket.number;
        let numbers = self.tables.ticket_numbers.entry(partition).or_default();
        if numbers.contains_key(&number) {
            return Err(RepositoryError::Conflict(format!(
                "ticket number {number} already issued for {partition}"
            )));
        }
        numbers.insert(number, ticket.id);
        self.on_rollback(move |tables| {
            if let Some(numbers) = tables.ticket_numbers.get_mut(&partition) {
                numbers.remove(&number);
            }
        });
        self.put_ticket(ticket);
        Ok(())
    }

    fn update_ticket(&mut self, ticket: QueueTicket) -> Result<(), RepositoryError> {
        let stored = self
            .tables
            .tickets
            .get(&ticket.id)
            .ok_or_else(|| missing(EntityKind::Ticket, ticket.id))?;
        if stored.partition() != ticket.partition() || stored.number != ticket.number {
            return Err(RepositoryError::Conflict(format!(
                "ticket {} cannot be renumbered",
                ticket.id
            )));
        }
        self.put_ticket(ticket);
        Ok(())
    }

    fn insert_notification(&mut self, notification: Notification) -> Result<(), RepositoryError> {
        let id = notification.id;
        if self.tables.notifications.contains_key(&id) {
            return Err(RepositoryError::Conflict(format!(
                "notification {id} already exists"
            )));
        }
        if let Some(event_id) = notification.event_id {
            if self.tables.notification_events.contains_key(&event_id) {
                return Err(RepositoryError::Conflict(format!(
                    "notification for event {event_id} already exists"
                )));
            }
            self.tables.notification_events.insert(event_id, id);
            self.on_rollback(move |tables| {
                tables.notification_events.remove(&event_id);
            });
        }

        let user_id = notification.user_id.clone();
        self.tables
            .notifications_by_user
            .entry(user_id.clone())
            .or_default()
            .push(id);
        self.on_rollback(move |tables| {
            if let Some(ids) = tables.notifications_by_user.get_mut(&user_id) {
                ids.pop();
            }
        });
        self.put_notification(notification);
        Ok(())
    }

    fn update_notification(&mut self, notification: Notification) -> Result<(), RepositoryError> {
        let stored = self
            .tables
            .notifications
            .get(&notification.id)
            .ok_or_else(|| missing(EntityKind::Notification, notification.id))?;
        if stored.user_id != notification.user_id || stored.event_id != notification.event_id {
            return Err(RepositoryError::Conflict(format!(
                "notification {} cannot be readdressed",
                notification.id
            )));
        }
        self.put_notification(notification);
        Ok(())
    }

    fn enqueue_event(&mut self, event: OutboxEvent) -> Result<(), RepositoryError> {
        let event_id = event.event_id;
        if self.tables.outbox.contains_key(&event_id) {
            return Err(RepositoryError::Conflict(format!(
                "outbox event {event_id} already recorded"
            )));
        }
        // Sequence gaps left by rolled-back work are harmless.
        let sequence = self.tables.outbox_sequence;
        self.tables.outbox_sequence += 1;

        let pending = event.state == OutboxState::Pending;
        self.tables
            .outbox
            .insert(event_id, OutboxSlot { sequence, event });
        self.on_rollback(move |tables| {
            tables.outbox.remove(&event_id);
        });
        if pending {
            self.index_pending(sequence, event_id);
        } else {
            self.settle(sequence, event_id);
        }
        Ok(())
    }

    fn update_event(&mut self, event: OutboxEvent) -> Result<(), RepositoryError> {
        let event_id = event.event_id;
        let slot = self.tables.outbox.get(&event_id).ok_or_else(|| {
            RepositoryError::Unavailable(format!("outbox event {event_id} not recorded"))
        })?;
        let sequence = slot.sequence;
        let was_pending = slot.event.state == OutboxState::Pending;
        let now_pending = event.state == OutboxState::Pending;
        if !was_pending && now_pending {
            return Err(RepositoryError::Conflict(format!(
                "settled outbox event {event_id} cannot be reopened"
            )));
        }

        let previous = self
            .tables
            .outbox
            .insert(event_id, OutboxSlot { sequence, event });
        self.on_rollback(move |tables| restore(&mut tables.outbox, event_id, previous));
        if was_pending && !now_pending {
            self.settle(sequence, event_id);
        }
        Ok(())
    }
}
