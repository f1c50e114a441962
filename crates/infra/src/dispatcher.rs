//! Task dispatch: place each task on the channel(s) routed for its kind.
//!
//! ```text
//! Producer ──submit(task)──> Dispatcher ──route[kind]──> sink 1 (queue / topic)
//!                                                   └──> sink 2 ...
//! ```
//!
//! - A kind may fan out to several sinks; each gets its own copy.
//! - Submitting into a full bounded queue blocks the caller (backpressure).
//! - Errors surface only when a sink is closed or the transport refuses the
//!   publish. Downstream processing failures never reach the producer.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, instrument};

use courier_core::{CoreError, Task, TaskKind};
use courier_events::{DeliveryChannel, StreamError, StreamTransport};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// No sink is registered for the task's kind.
    #[error("no route for task kind {0}")]
    NoRoute(TaskKind),

    /// The in-process channel was closed; nothing will ever consume it.
    #[error("channel {0} is closed")]
    ChannelClosed(String),

    #[error("failed to encode task: {0}")]
    Encoding(#[from] CoreError),

    /// The stream transport refused the publish.
    #[error("publish to {topic} failed: {source}")]
    Publish {
        topic: String,
        #[source]
        source: StreamError,
    },
}

/// One destination for dispatched tasks.
pub trait TaskSink: Send + Sync {
    /// Label used in logs and errors.
    fn name(&self) -> &str;

    fn submit(&self, task: Task) -> Result<(), DispatchError>;
}

/// Sink backed by an in-process channel (blocking send).
#[derive(Debug)]
pub struct QueueSink<C> {
    name: String,
    channel: C,
}

impl<C: DeliveryChannel<Task>> QueueSink<C> {
    pub fn new(name: impl Into<String>, channel: C) -> Self {
        Self {
            name: name.into(),
            channel,
        }
    }
}

impl<C: DeliveryChannel<Task>> TaskSink for QueueSink<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, task: Task) -> Result<(), DispatchError> {
        self.channel
            .send(task)
            .map_err(|_| DispatchError::ChannelClosed(self.name.clone()))
    }
}

/// Sink that publishes the serialized task to a stream topic.
pub struct StreamSink {
    topic: String,
    transport: Arc<dyn StreamTransport>,
}

impl StreamSink {
    pub fn new(transport: Arc<dyn StreamTransport>, topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            transport,
        }
    }
}

impl TaskSink for StreamSink {
    fn name(&self) -> &str {
        &self.topic
    }

    #[instrument(skip(self, task), fields(topic = %self.topic, task_id = %task.id()), err)]
    fn submit(&self, task: Task) -> Result<(), DispatchError> {
        let payload = task.to_bytes()?;
        let id = self
            .transport
            .publish(&self.topic, &payload)
            .map_err(|source| DispatchError::Publish {
                topic: self.topic.clone(),
                source,
            })?;
        debug!(message_id = %id, "task published");
        Ok(())
    }
}

/// Routes submitted tasks to sinks by kind.
#[derive(Clone, Default)]
pub struct Dispatcher {
    routes: HashMap<TaskKind, Vec<Arc<dyn TaskSink>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `sink` as a target for `kind`. Repeat to fan out.
    pub fn route(mut self, kind: TaskKind, sink: Arc<dyn TaskSink>) -> Self {
        self.routes.entry(kind).or_default().push(sink);
        self
    }

    /// Route every kind to `sink`.
    pub fn route_all(mut self, sink: Arc<dyn TaskSink>) -> Self {
        for kind in TaskKind::ALL {
            self = self.route(kind, sink.clone());
        }
        self
    }

    pub fn sinks_for(&self, kind: TaskKind) -> usize {
        self.routes.get(&kind).map_or(0, Vec::len)
    }

    /// Deliver `task` to every sink routed for its kind.
    ///
    /// All sinks are attempted; the first failure is returned afterwards.
    pub fn submit(&self, task: Task) -> Result<(), DispatchError> {
        let kind = task.kind();
        let sinks = match self.routes.get(&kind) {
            Some(sinks) if !sinks.is_empty() => sinks,
            _ => return Err(DispatchError::NoRoute(kind)),
        };

        let mut first_error = None;
        for sink in sinks {
            debug!(task_id = %task.id(), %kind, sink = sink.name(), "submitting task");
            if let Err(e) = sink.submit(task.clone()) {
                error!(task_id = %task.id(), %kind, sink = sink.name(), error = %e, "submit failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Submit tasks in order. A failing task does not hold back the rest;
    /// the first failure is returned afterwards.
    pub fn submit_all(&self, tasks: impl IntoIterator<Item = Task>) -> Result<(), DispatchError> {
        let mut first_error = None;
        for task in tasks {
            if let Err(e) = self.submit(task) {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut routes: Vec<_> = self
            .routes
            .iter()
            .map(|(k, sinks)| (k.as_str(), sinks.iter().map(|s| s.name().to_string()).collect::<Vec<_>>()))
            .collect();
        routes.sort();
        f.debug_struct("Dispatcher").field("routes", &routes).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use courier_core::TicketId;
    use courier_events::{BoundedQueue, InMemoryStream};

    use super::*;

    fn ticket(id: &str) -> TicketId {
        TicketId::new(id).unwrap()
    }

    #[test]
    fn unrouted_kind_is_rejected() {
        let dispatcher = Dispatcher::new();
        let err = dispatcher.submit(Task::set_alarm_state(true)).unwrap_err();
        assert!(matches!(err, DispatchError::NoRoute(TaskKind::SetAlarmState)));
    }

    #[test]
    fn ticket_confirmation_reaches_both_topics() {
        let stream = Arc::new(InMemoryStream::new());
        let dispatcher = Dispatcher::new()
            .route(
                TaskKind::AppendToSheet,
                Arc::new(StreamSink::new(stream.clone(), "append-to-tracker")),
            )
            .route(
                TaskKind::IssueReceipt,
                Arc::new(StreamSink::new(stream.clone(), "issue-receipt")),
            );

        dispatcher
            .submit_all(Task::ticket_confirmation(&ticket("TCK-1")))
            .unwrap();

        assert_eq!(stream.published_count("append-to-tracker"), 1);
        assert_eq!(stream.published_count("issue-receipt"), 1);

        let mut sub = stream.subscribe("issue-receipt", "receivers", "r1").unwrap();
        let delivery = sub.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
        let task = Task::from_bytes(delivery.payload()).unwrap();
        assert_eq!(task.kind(), TaskKind::IssueReceipt);
    }

    #[test]
    fn fan_out_sends_a_copy_to_every_sink() {
        let a = BoundedQueue::arc(4);
        let b = BoundedQueue::arc(4);
        let dispatcher = Dispatcher::new()
            .route(TaskKind::IssueReceipt, Arc::new(QueueSink::new("a", a.clone())))
            .route(TaskKind::IssueReceipt, Arc::new(QueueSink::new("b", b.clone())));

        let task = Task::issue_receipt(ticket("TCK-1"));
        dispatcher.submit(task.clone()).unwrap();

        assert_eq!(a.try_recv().unwrap(), task);
        assert_eq!(b.try_recv().unwrap(), task);
        assert_eq!(dispatcher.sinks_for(TaskKind::IssueReceipt), 2);
    }

    #[test]
    fn closed_sink_fails_but_others_still_receive() {
        let closed = BoundedQueue::arc(4);
        let open = BoundedQueue::arc(4);
        closed.close();
        let dispatcher = Dispatcher::new()
            .route(TaskKind::IssueReceipt, Arc::new(QueueSink::new("closed", closed)))
            .route(TaskKind::IssueReceipt, Arc::new(QueueSink::new("open", open.clone())));

        let err = dispatcher.submit(Task::issue_receipt(ticket("TCK-1"))).unwrap_err();
        assert!(matches!(err, DispatchError::ChannelClosed(ref name) if name == "closed"));
        assert_eq!(open.len(), 1);
    }

    #[test]
    fn closed_route_does_not_hold_back_other_kinds() {
        let sheets = BoundedQueue::arc(8);
        let receipts = BoundedQueue::arc(8);
        sheets.close();
        let dispatcher = Dispatcher::new()
            .route(TaskKind::AppendToSheet, Arc::new(QueueSink::new("sheets", sheets)))
            .route(TaskKind::IssueReceipt, Arc::new(QueueSink::new("receipts", receipts.clone())));

        let tasks = ["TCK-1", "TCK-2"]
            .into_iter()
            .flat_map(|id| Task::ticket_confirmation(&ticket(id)));
        let err = dispatcher.submit_all(tasks).unwrap_err();

        assert!(matches!(err, DispatchError::ChannelClosed(ref name) if name == "sheets"));
        assert_eq!(receipts.len(), 2);
    }

    #[test]
    fn submit_blocks_while_the_queue_is_full() {
        let queue = BoundedQueue::arc(100);
        let dispatcher = Arc::new(
            Dispatcher::new().route_all(Arc::new(QueueSink::new("tasks", queue.clone()))),
        );
        let submitted = Arc::new(AtomicUsize::new(0));

        let producer = {
            let dispatcher = dispatcher.clone();
            let submitted = submitted.clone();
            thread::spawn(move || {
                for i in 0..150 {
                    dispatcher
                        .submit(Task::issue_receipt(ticket(&format!("TCK-{i}"))))
                        .unwrap();
                    submitted.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert_eq!(submitted.load(Ordering::SeqCst), 100);

        queue.recv().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while submitted.load(Ordering::SeqCst) < 101 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(submitted.load(Ordering::SeqCst), 101);

        for _ in 0..149 {
            queue.recv().unwrap();
        }
        producer.join().unwrap();
        assert_eq!(submitted.load(Ordering::SeqCst), 150);
        assert!(queue.is_empty());
    }
}
