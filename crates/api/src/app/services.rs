//! Delivery wiring for each mode: channels, workers and the dispatcher the
//! HTTP handlers submit through.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use courier_core::{ReceiptIssuer, SheetAppender, Task, TaskKind, TicketId};
use courier_events::{BoundedQueue, StreamError, StreamTransport};
use courier_infra::{
    CapabilityRouter, DispatchError, Dispatcher, JsonTaskDecoder, QueueSink, RetryPolicy,
    StreamSink, TaskProcessor, Worker, WorkerError, WorkerHandle, WorkerStats,
};

pub const RECEIPTS_TOPIC: &str = "issue-receipt";
pub const TRACKER_TOPIC: &str = "append-to-tracker";
pub const RECEIVERS_GROUP: &str = "receivers";
pub const TRACKERS_GROUP: &str = "trackers";

/// What the HTTP layer needs: somewhere to submit tasks.
#[derive(Debug)]
pub struct AppServices {
    dispatcher: Dispatcher,
}

impl AppServices {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Submit the sheet row and the receipt for each ticket, in order.
    /// Every task is attempted even if an earlier one fails. Blocks while the
    /// channel is full.
    pub fn confirm_tickets(&self, tickets: &[TicketId]) -> Result<(), DispatchError> {
        self.dispatcher
            .submit_all(tickets.iter().flat_map(Task::ticket_confirmation))
    }
}

/// Downstream capabilities the ticket workers call.
#[derive(Clone)]
pub struct Capabilities {
    pub receipts: Arc<dyn ReceiptIssuer>,
    pub sheets: Arc<dyn SheetAppender>,
}

#[derive(Debug, Error)]
pub enum WiringError {
    #[error("failed to subscribe to {topic} as {group}: {source}")]
    Subscribe {
        topic: &'static str,
        group: &'static str,
        #[source]
        source: StreamError,
    },

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Running delivery pipeline: services for the router plus worker handles.
pub struct Wiring {
    pub services: Arc<AppServices>,
    workers: Vec<WorkerHandle>,
    queue: Option<Arc<BoundedQueue<Task>>>,
}

impl Wiring {
    pub fn worker_stats(&self) -> Vec<(String, WorkerStats)> {
        self.workers
            .iter()
            .map(|w| (w.name().to_string(), w.stats()))
            .collect()
    }

    /// Close the in-process queue (if any) and stop every worker.
    pub fn shutdown(self) -> Result<(), WorkerError> {
        if let Some(queue) = &self.queue {
            queue.close();
        }
        for worker in self.workers {
            let name = worker.name().to_string();
            let stats = worker.stats();
            worker.shutdown()?;
            info!(
                worker = %name,
                delivered = stats.delivered,
                retries = stats.retries,
                abandoned = stats.abandoned,
                "worker stopped"
            );
        }
        Ok(())
    }
}

/// One bounded in-process queue for every task kind, one worker.
pub fn queue_mode(
    capacity: usize,
    policy: RetryPolicy,
    capabilities: Capabilities,
) -> Result<Wiring, WiringError> {
    let queue = BoundedQueue::arc(capacity);
    let router: Arc<dyn TaskProcessor> = Arc::new(
        CapabilityRouter::new()
            .with_receipts(capabilities.receipts)
            .with_sheets(capabilities.sheets),
    );

    let worker = Worker::for_queue("tasks", queue.clone(), router)
        .with_policy(policy)
        .spawn()?;
    let dispatcher = Dispatcher::new().route_all(Arc::new(QueueSink::new("tasks", queue.clone())));

    info!(capacity, "queue delivery ready");
    Ok(Wiring {
        services: Arc::new(AppServices::new(dispatcher)),
        workers: vec![worker],
        queue: Some(queue),
    })
}

/// One topic per downstream effect, each consumed by its own group.
pub fn stream_mode(
    transport: Arc<dyn StreamTransport>,
    consumer: &str,
    policy: RetryPolicy,
    capabilities: Capabilities,
) -> Result<Wiring, WiringError> {
    let trackers = stream_worker(
        &transport,
        TRACKER_TOPIC,
        TRACKERS_GROUP,
        consumer,
        policy,
        Arc::new(CapabilityRouter::new().with_sheets(capabilities.sheets)),
    )?;
    let receivers = stream_worker(
        &transport,
        RECEIPTS_TOPIC,
        RECEIVERS_GROUP,
        consumer,
        policy,
        Arc::new(CapabilityRouter::new().with_receipts(capabilities.receipts)),
    )?;

    let dispatcher = Dispatcher::new()
        .route(
            TaskKind::AppendToSheet,
            Arc::new(StreamSink::new(transport.clone(), TRACKER_TOPIC)),
        )
        .route(
            TaskKind::IssueReceipt,
            Arc::new(StreamSink::new(transport, RECEIPTS_TOPIC)),
        );

    info!(%consumer, "stream delivery ready");
    Ok(Wiring {
        services: Arc::new(AppServices::new(dispatcher)),
        workers: vec![trackers, receivers],
        queue: None,
    })
}

fn stream_worker(
    transport: &Arc<dyn StreamTransport>,
    topic: &'static str,
    group: &'static str,
    consumer: &str,
    policy: RetryPolicy,
    router: Arc<dyn TaskProcessor>,
) -> Result<WorkerHandle, WiringError> {
    let subscription = transport
        .subscribe(topic, group, consumer)
        .map_err(|source| WiringError::Subscribe {
            topic,
            group,
            source,
        })?;
    let worker = Worker::for_stream(group, subscription, Arc::new(JsonTaskDecoder), router)
        .with_policy(policy)
        .spawn()?;
    Ok(worker)
}
