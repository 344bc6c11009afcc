//! Notification dispatch.
//!
//! Transitions only record an [`OutboxEvent`] inside their own unit of work. The dispatcher
//! drains those events afterwards and creates at most one notification per event id, so a
//! delivery failure can never undo or block the transition that produced it.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::domain::{
    ActorContext, EntityKind, EventId, Notification, NotificationDraft, NotificationId,
    Permission, UserId,
};
use super::error::RegistryError;
use super::repository::{OutboxEvent, OutboxState, RegistryStore, RegistryTransaction};

/// Wakes the outbox worker after a commit so delivery does not wait for the next tick.
#[derive(Debug, Clone, Default)]
pub struct OutboxSignal(Arc<Notify>);

impl OutboxSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        self.0.notify_one();
    }

    pub async fn notified(&self) {
        self.0.notified().await;
    }
}

/// Outcome of one outbox drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub delivered: usize,
    pub retrying: usize,
    pub failed: usize,
}

impl DispatchReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.retrying + self.failed
    }
}

pub struct NotificationDispatcher<S> {
    store: Arc<S>,
    batch_size: usize,
    max_attempts: u32,
}

impl<S> NotificationDispatcher<S>
where
    S: RegistryStore + 'static,
{
    pub fn new(store: Arc<S>, batch_size: usize, max_attempts: u32) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Create a notification. A draft carrying an event id already delivered returns the
    /// existing notification instead of creating a second one.
    ///
    /// Event ids recorded in the outbox belong to the dispatcher and are rejected here.
    pub fn notify(&self, draft: NotificationDraft) -> Result<Notification, RegistryError> {
        validate_draft(&draft)?;
        self.store.transaction(|tx| -> Result<_, RegistryError> {
            if let Some(event_id) = draft.event_id {
                if tx.event(event_id)?.is_some() {
                    return Err(RegistryError::Conflict(format!(
                        "event {event_id} is reserved for outbox delivery"
                    )));
                }
            }
            create_once(tx, draft)
        })
    }

    pub fn mark_read(
        &self,
        id: NotificationId,
        actor: &ActorContext,
    ) -> Result<Notification, RegistryError> {
        let user = actor.identity()?.clone();
        self.store.transaction(|tx| -> Result<_, RegistryError> {
            let mut notification = tx
                .notification(id)?
                .ok_or_else(|| RegistryError::not_found(EntityKind::Notification, id))?;
            if notification.user_id != user {
                return Err(RegistryError::Forbidden {
                    user,
                    reason: format!("notification {id} belongs to another user"),
                });
            }
            if !notification.read {
                notification.read = true;
                notification.read_at = Some(Utc::now());
                tx.update_notification(notification.clone())?;
            }
            Ok(notification)
        })
    }

    /// Replace the status tags. Allowed for the recipient or staff who send notifications.
    pub fn update_tags(
        &self,
        id: NotificationId,
        tags: BTreeSet<String>,
        actor: &ActorContext,
    ) -> Result<Notification, RegistryError> {
        let user = actor.identity()?.clone();
        let tags: BTreeSet<String> = tags
            .into_iter()
            .map(|tag| tag.trim().to_ascii_lowercase())
            .filter(|tag| !tag.is_empty())
            .collect();

        self.store.transaction(|tx| -> Result<_, RegistryError> {
            let mut notification = tx
                .notification(id)?
                .ok_or_else(|| RegistryError::not_found(EntityKind::Notification, id))?;
            if notification.user_id != user && !actor.has(Permission::SendNotifications) {
                return Err(RegistryError::Forbidden {
                    user,
                    reason: format!("cannot retag notification {id}"),
                });
            }
            notification.tags = tags;
            tx.update_notification(notification.clone())?;
            Ok(notification)
        })
    }

    pub fn list_for_user(
        &self,
        user_id: &UserId,
        unread_only: bool,
    ) -> Result<Vec<Notification>, RegistryError> {
        let notifications = self
            .store
            .read(|tx| -> Result<_, RegistryError> { Ok(tx.notifications_for_user(user_id)?) })?;
        Ok(notifications
            .into_iter()
            .filter(|notification| !unread_only || !notification.read)
            .collect())
    }

    pub fn event(&self, event_id: EventId) -> Result<Option<OutboxEvent>, RegistryError> {
        self.store
            .read(|tx| -> Result<_, RegistryError> { Ok(tx.event(event_id)?) })
    }

    /// Deliver up to one batch of pending outbox events.
    ///
    /// Each delivery creates the notification and marks the event delivered in one unit of
    /// work. Failures are logged and counted against the event; after the configured number
    /// of attempts it is parked as failed.
    pub fn drain_outbox(&self) -> Result<DispatchReport, RegistryError> {
        let pending = self.store.read(|tx| -> Result<_, RegistryError> {
            Ok(tx.pending_events(self.batch_size)?)
        })?;

        let mut report = DispatchReport::default();
        for event in pending {
            match self.deliver(&event) {
                Ok(notification) => {
                    debug!(event_id = %event.event_id, notification_id = %notification.id, "outbox event delivered");
                    report.delivered += 1;
                }
                Err(err) => {
                    warn!(event_id = %event.event_id, entity = %event.entity, error = %err, "outbox delivery failed");
                    match self.record_failure(&event, &err) {
                        Ok(OutboxState::Failed) => report.failed += 1,
                        Ok(_) => report.retrying += 1,
                        Err(record_err) => {
                            warn!(event_id = %event.event_id, error = %record_err, "could not record outbox failure");
                            report.retrying += 1;
                        }
                    }
                }
            }
        }

        if report.attempted() > 0 {
            info!(
                delivered = report.delivered,
                retrying = report.retrying,
                failed = report.failed,
                "outbox drained"
            );
        }
        Ok(report)
    }

    fn deliver(&self, event: &OutboxEvent) -> Result<Notification, RegistryError> {
        validate_draft(&event.notification)?;
        self.store.transaction(|tx| -> Result<_, RegistryError> {
            let notification = create_once(tx, event.notification.clone())?;
            let mut delivered = event.clone();
            delivered.state = OutboxState::Delivered;
            delivered.attempts += 1;
            delivered.last_error = None;
            tx.update_event(delivered)?;
            Ok(notification)
        })
    }

    fn record_failure(
        &self,
        event: &OutboxEvent,
        err: &RegistryError,
    ) -> Result<OutboxState, RegistryError> {
        self.store.transaction(|tx| -> Result<_, RegistryError> {
            let mut failed = tx.event(event.event_id)?.unwrap_or_else(|| event.clone());
            failed.attempts += 1;
            failed.last_error = Some(err.to_string());
            if failed.attempts >= self.max_attempts {
                failed.state = OutboxState::Failed;
            }
            let state = failed.state;
            tx.update_event(failed)?;
            Ok(state)
        })
    }
}

fn validate_draft(draft: &NotificationDraft) -> Result<(), RegistryError> {
    let mut fields = Vec::new();
    if draft.user_id.0.trim().is_empty() {
        fields.push("user_id");
    }
    if draft.title.trim().is_empty() {
        fields.push("title");
    }
    if draft.message.trim().is_empty() {
        fields.push("message");
    }
    if fields.is_empty() {
        Ok(())
    } else {
        Err(RegistryError::Validation { fields })
    }
}

fn create_once(
    tx: &mut dyn RegistryTransaction,
    draft: NotificationDraft,
) -> Result<Notification, RegistryError> {
    if let Some(event_id) = draft.event_id {
        if let Some(existing) = tx.notification_for_event(event_id)? {
            return Ok(existing);
        }
    }

    let notification = Notification {
        id: NotificationId::new(),
        user_id: draft.user_id,
        event_id: draft.event_id,
        kind: draft.kind,
        title: draft.title,
        message: draft.message,
        read: false,
        tags: draft.tags,
        created_at: Utc::now(),
        read_at: None,
    };
    tx.insert_notification(notification.clone())?;
    Ok(notification)
}

/// Background loop draining the outbox on an interval or whenever signalled.
pub struct OutboxWorker<S> {
    dispatcher: Arc<NotificationDispatcher<S>>,
    signal: OutboxSignal,
    interval: Duration,
}

impl<S> OutboxWorker<S>
where
    S: RegistryStore + 'static,
{
    pub fn new(
        dispatcher: Arc<NotificationDispatcher<S>>,
        signal: OutboxSignal,
        interval: Duration,
    ) -> Self {
        Self {
            dispatcher,
            signal,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("outbox worker stopping");
                    break;
                }
                _ = ticker.tick() => {}
                _ = self.signal.notified() => {}
            }

            if let Err(err) = self.dispatcher.drain_outbox() {
                warn!(error = %err, "outbox drain failed");
            }
        }
    }

    pub fn spawn<F>(self, shutdown: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(self.run(shutdown))
    }
}
