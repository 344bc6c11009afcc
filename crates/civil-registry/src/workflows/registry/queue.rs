//! Kiosk queue ticketing.
//!
//! Numbers are assigned by a single unit of work that reads the partition's current
//! maximum and inserts the next value. The store rejects a duplicate
//! `(service type, business day, number)` as a conflict, which the service retries up to
//! a fixed bound before giving up. A partition that has used every number fails at once.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use tracing::{debug, info, warn};

use super::domain::{
    ActorContext, EntityKind, PartitionKey, Permission, QueueTicket, ServiceType, TicketFilter,
    TicketId, TicketStatus,
};
use super::error::RegistryError;
use super::repository::RegistryStore;
use super::transitions::ensure_transition;

pub struct QueueTicketingService<S> {
    store: Arc<S>,
    max_attempts: u32,
    business_offset: FixedOffset,
}

impl<S> QueueTicketingService<S>
where
    S: RegistryStore + 'static,
{
    pub fn new(store: Arc<S>, max_attempts: u32, business_offset: FixedOffset) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
            business_offset,
        }
    }

    /// The office's calendar day containing `at`.
    pub fn business_day(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.business_offset).date_naive()
    }

    pub fn issue_ticket(
        &self,
        service_type: ServiceType,
        notes: Option<String>,
    ) -> Result<QueueTicket, RegistryError> {
        let today = self.business_day(Utc::now());
        self.issue_ticket_on(service_type, today, notes)
    }

    pub fn issue_ticket_on(
        &self,
        service_type: ServiceType,
        business_day: NaiveDate,
        notes: Option<String>,
    ) -> Result<QueueTicket, RegistryError> {
        let partition = PartitionKey {
            service_type,
            business_day,
        };
        let notes = notes
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.insert_next(partition, notes.clone()) {
                Ok(ticket) => {
                    info!(
                        ticket_id = %ticket.id,
                        partition = %partition,
                        number = ticket.number,
                        attempt,
                        "queue ticket issued"
                    );
                    return Ok(ticket);
                }
                Err(RegistryError::Conflict(detail)) if attempt < self.max_attempts => {
                    warn!(partition = %partition, attempt, %detail, "ticket number collided, retrying");
                }
                Err(RegistryError::Conflict(detail)) => {
                    return Err(RegistryError::Conflict(format!(
                        "could not issue a ticket for {partition} after {attempt} attempts: {detail}"
                    )));
                }
                Err(other) => return Err(other),
            }
        }
    }

    fn insert_next(
        &self,
        partition: PartitionKey,
        notes: Option<String>,
    ) -> Result<QueueTicket, RegistryError> {
        self.store.transaction(|tx| -> Result<_, RegistryError> {
            let number = match tx.last_ticket_number(&partition)? {
                Some(last) => {
                    last.checked_add(1)
                        .ok_or_else(|| RegistryError::SequenceExhausted {
                            partition: partition.to_string(),
                        })?
                }
                None => 1,
            };

            let now = Utc::now();
            let ticket = QueueTicket {
                id: TicketId::new(),
                number,
                service_type: partition.service_type,
                business_day: partition.business_day,
                status: TicketStatus::Waiting,
                notes,
                created_at: now,
                updated_at: now,
            };
            tx.insert_ticket(ticket.clone())?;
            Ok(ticket)
        })
    }

    /// Move a ticket along WAITING → CALLED → SERVING → DONE | SKIPPED.
    ///
    /// Asking for the status the ticket already has is a no-op.
    pub fn advance(
        &self,
        id: TicketId,
        to: TicketStatus,
        actor: &ActorContext,
    ) -> Result<QueueTicket, RegistryError> {
        let user = actor.require(Permission::ManageQueue)?;

        let (ticket, changed) = self.store.transaction(|tx| -> Result<_, RegistryError> {
            let mut ticket = tx
                .ticket(id)?
                .ok_or_else(|| RegistryError::not_found(EntityKind::Ticket, id))?;
            if ticket.status == to {
                return Ok((ticket, false));
            }
            ensure_transition(ticket.status, to)?;

            ticket.status = to;
            ticket.updated_at = Utc::now();
            tx.update_ticket(ticket.clone())?;
            Ok((ticket, true))
        })?;

        if changed {
            info!(ticket = %ticket.display_code(), to = to.label(), actor = %user, "queue ticket advanced");
        } else {
            debug!(ticket = %ticket.display_code(), status = to.label(), "queue ticket already in requested status");
        }
        Ok(ticket)
    }

    pub fn get(&self, id: TicketId) -> Result<QueueTicket, RegistryError> {
        self.store.read(|tx| -> Result<_, RegistryError> {
            tx.ticket(id)?
                .ok_or_else(|| RegistryError::not_found(EntityKind::Ticket, id))
        })
    }

    pub fn list(&self, filter: &TicketFilter) -> Result<Vec<QueueTicket>, RegistryError> {
        self.store
            .read(|tx| -> Result<_, RegistryError> { Ok(tx.tickets(filter)?) })
    }
}
