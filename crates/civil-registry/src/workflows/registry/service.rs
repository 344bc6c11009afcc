use std::sync::Arc;
use std::time::Duration;

use crate::config::{ConfigError, RegistryConfig};

use super::certified_copy::CertifiedCopyService;
use super::notifications::{NotificationDispatcher, OutboxSignal, OutboxWorker};
use super::queue::QueueTicketingService;
use super::records::RecordService;
use super::repository::RegistryStore;
use super::transitions::StatusTransitionEngine;

/// Every registry service wired against one shared store and outbox signal.
pub struct RegistryServices<S> {
    pub records: Arc<RecordService<S>>,
    pub transitions: Arc<StatusTransitionEngine<S>>,
    pub copies: Arc<CertifiedCopyService<S>>,
    pub queue: Arc<QueueTicketingService<S>>,
    pub notifications: Arc<NotificationDispatcher<S>>,
    signal: OutboxSignal,
    outbox_interval: Duration,
}

impl<S> RegistryServices<S>
where
    S: RegistryStore + 'static,
{
    pub fn new(store: Arc<S>, config: &RegistryConfig) -> Result<Self, ConfigError> {
        let business_offset = config.business_offset()?;
        let signal = OutboxSignal::new();

        let transitions = Arc::new(StatusTransitionEngine::new(
            Arc::clone(&store),
            signal.clone(),
        ));
        let copies = Arc::new(CertifiedCopyService::new(
            Arc::clone(&store),
            Arc::clone(&transitions),
            signal.clone(),
        ));

        Ok(Self {
            records: Arc::new(RecordService::new(Arc::clone(&store))),
            transitions,
            copies,
            queue: Arc::new(QueueTicketingService::new(
                Arc::clone(&store),
                config.ticket_max_attempts,
                business_offset,
            )),
            notifications: Arc::new(NotificationDispatcher::new(
                store,
                config.outbox_batch_size,
                config.outbox_max_attempts,
            )),
            signal,
            outbox_interval: config.outbox_poll_interval,
        })
    }

    /// Worker draining this bundle's outbox on the configured interval.
    pub fn outbox_worker(&self) -> OutboxWorker<S> {
        OutboxWorker::new(
            Arc::clone(&self.notifications),
            self.signal.clone(),
            self.outbox_interval,
        )
    }
}
