//! Task workers (pull, process, settle, retry).
//!
//! A worker owns exactly one task source and one processor. Every delivery
//! moves through the same small state machine:
//!
//! ```text
//! PENDING --(pulled)--> PROCESSING
//! PROCESSING --(ok)---> DONE      [ack if stream-backed]
//! PROCESSING --(err)--> PENDING   [requeue at the tail / nack + wait]
//! ```
//!
//! The source decides what "settle" means: an in-process queue has nothing
//! to ack and retries by requeueing; a stream acks on success and nacks on
//! failure. The worker itself only tracks attempts, applies the
//! [`RetryPolicy`], and logs.
//!
//! ## Failure handling
//!
//! - Capability errors are retried until the policy gives up (never, by
//!   default). A task given up on is logged at `error` and, on streams, acked
//!   so it stops cycling.
//! - A task no capability handles is abandoned at once.
//! - A stream payload the decoder rejects is acked and counted as discarded.
//! - Transport errors from the source are logged and the loop backs off for
//!   one poll interval; the message involved stays pending upstream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use courier_core::{Task, TaskId};
use courier_events::{Delivery, DeliveryChannel, RecvError, StreamError, StreamSubscription};

use crate::decoder::TaskDecoder;
use crate::retry::{RetryDecision, RetryPolicy, Sleeper, ThreadSleeper};
use crate::router::{TaskProcessor, confirmation};

/// How long one `step` waits for a delivery before reporting `Idle`.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("channel closed while re-submitting task {0}")]
    ChannelClosed(TaskId),

    #[error("failed to spawn worker thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker thread {0} panicked")]
    Panicked(String),
}

/// A task taken from a source, with what the source needs to settle it.
#[derive(Debug)]
pub struct Pulled<R> {
    pub task: Task,
    /// 1 on first delivery.
    pub attempt: u32,
    pub receipt: R,
}

#[derive(Debug)]
pub enum Pull<R> {
    Ready(Pulled<R>),
    /// Something arrived that can never become a task; already settled.
    Discarded { reason: String },
    Idle,
    Closed,
}

/// Where a worker pulls tasks from and how outcomes are settled.
pub trait TaskSource: Send {
    type Receipt;

    /// Short label for logs (`queue`, `issue-receipt/receivers`, ...).
    fn describe(&self) -> String;

    fn pull(&mut self, timeout: Duration) -> Result<Pull<Self::Receipt>, WorkerError>;

    fn complete(&mut self, task: &Task, receipt: Self::Receipt) -> Result<(), WorkerError>;

    fn retry(&mut self, task: Task, receipt: Self::Receipt) -> Result<(), WorkerError>;

    fn abandon(&mut self, task: &Task, receipt: Self::Receipt) -> Result<(), WorkerError>;
}

/// In-process source: failures go back to the tail of the same channel.
#[derive(Debug)]
pub struct QueueSource<C> {
    channel: C,
    attempts: HashMap<TaskId, u32>,
}

impl<C: DeliveryChannel<Task>> QueueSource<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            attempts: HashMap::new(),
        }
    }
}

impl<C: DeliveryChannel<Task>> TaskSource for QueueSource<C> {
    type Receipt = ();

    fn describe(&self) -> String {
        "queue".to_string()
    }

    fn pull(&mut self, timeout: Duration) -> Result<Pull<()>, WorkerError> {
        match self.channel.recv_timeout(timeout) {
            Ok(task) => {
                let attempt = self.attempts.entry(task.id()).or_insert(0);
                *attempt += 1;
                Ok(Pull::Ready(Pulled {
                    attempt: *attempt,
                    task,
                    receipt: (),
                }))
            }
            Err(RecvError::Timeout) => Ok(Pull::Idle),
            Err(RecvError::Closed) => Ok(Pull::Closed),
        }
    }

    fn complete(&mut self, task: &Task, _receipt: ()) -> Result<(), WorkerError> {
        self.attempts.remove(&task.id());
        Ok(())
    }

    fn retry(&mut self, task: Task, _receipt: ()) -> Result<(), WorkerError> {
        self.channel.requeue(task).map_err(|e| {
            let id = e.into_inner().id();
            self.attempts.remove(&id);
            WorkerError::ChannelClosed(id)
        })
    }

    fn abandon(&mut self, task: &Task, _receipt: ()) -> Result<(), WorkerError> {
        self.attempts.remove(&task.id());
        Ok(())
    }
}

/// Stream source: ack on success, nack on failure, ack when giving up.
pub struct StreamSource {
    subscription: StreamSubscription,
    decoder: Arc<dyn TaskDecoder>,
}

impl StreamSource {
    pub fn new(subscription: StreamSubscription, decoder: Arc<dyn TaskDecoder>) -> Self {
        Self {
            subscription,
            decoder,
        }
    }
}

impl TaskSource for StreamSource {
    type Receipt = Delivery;

    fn describe(&self) -> String {
        format!("{}/{}", self.subscription.topic(), self.subscription.group())
    }

    fn pull(&mut self, timeout: Duration) -> Result<Pull<Delivery>, WorkerError> {
        let delivery = match self.subscription.recv_timeout(timeout) {
            Ok(Some(delivery)) => delivery,
            Ok(None) => return Ok(Pull::Idle),
            Err(StreamError::Closed) => return Ok(Pull::Closed),
            Err(e) => return Err(e.into()),
        };

        match self
            .decoder
            .decode_message(delivery.topic(), delivery.id(), delivery.payload())
        {
            Ok(task) => Ok(Pull::Ready(Pulled {
                task,
                attempt: delivery.delivery_count().max(1),
                receipt: delivery,
            })),
            Err(e) => {
                let reason = format!("message {}: {e}", delivery.id());
                delivery.ack()?;
                Ok(Pull::Discarded { reason })
            }
        }
    }

    fn complete(&mut self, _task: &Task, delivery: Delivery) -> Result<(), WorkerError> {
        Ok(delivery.ack()?)
    }

    fn retry(&mut self, _task: Task, delivery: Delivery) -> Result<(), WorkerError> {
        Ok(delivery.nack()?)
    }

    fn abandon(&mut self, _task: &Task, delivery: Delivery) -> Result<(), WorkerError> {
        Ok(delivery.ack()?)
    }
}

/// Result of a single [`Worker::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Delivered,
    Retried,
    Abandoned,
    Discarded,
    Idle,
    Closed,
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub delivered: u64,
    pub failed_attempts: u64,
    pub retries: u64,
    pub abandoned: u64,
    pub discarded: u64,
}

fn lock_stats(stats: &Mutex<WorkerStats>) -> MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Worker<S> {
    name: String,
    source: S,
    processor: Arc<dyn TaskProcessor>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    poll_interval: Duration,
    stats: Arc<Mutex<WorkerStats>>,
}

impl<C: DeliveryChannel<Task>> Worker<QueueSource<C>> {
    /// In-process worker: immediate requeue, no ceiling.
    pub fn for_queue(
        name: impl Into<String>,
        channel: C,
        processor: Arc<dyn TaskProcessor>,
    ) -> Self {
        Self::new(name, QueueSource::new(channel), processor, RetryPolicy::immediate())
    }
}

impl Worker<StreamSource> {
    /// Stream worker: nack then wait one second, no ceiling.
    pub fn for_stream(
        name: impl Into<String>,
        subscription: StreamSubscription,
        decoder: Arc<dyn TaskDecoder>,
        processor: Arc<dyn TaskProcessor>,
    ) -> Self {
        Self::new(
            name,
            StreamSource::new(subscription, decoder),
            processor,
            RetryPolicy::stream_default(),
        )
    }
}

impl<S: TaskSource> Worker<S> {
    pub fn new(
        name: impl Into<String>,
        source: S,
        processor: Arc<dyn TaskProcessor>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            processor,
            policy,
            sleeper: Arc::new(ThreadSleeper),
            poll_interval: DEFAULT_POLL_INTERVAL,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn stats(&self) -> WorkerStats {
        lock_stats(&self.stats).clone()
    }

    /// Pull and handle at most one delivery.
    pub fn step(&mut self) -> Result<StepOutcome, WorkerError> {
        let pulled = match self.source.pull(self.poll_interval)? {
            Pull::Ready(pulled) => pulled,
            Pull::Idle => return Ok(StepOutcome::Idle),
            Pull::Closed => return Ok(StepOutcome::Closed),
            Pull::Discarded { reason } => {
                warn!(worker = %self.name, %reason, "discarding undecodable message");
                lock_stats(&self.stats).discarded += 1;
                return Ok(StepOutcome::Discarded);
            }
        };

        let Pulled {
            task,
            attempt,
            receipt,
        } = pulled;
        debug!(worker = %self.name, task_id = %task.id(), kind = %task.kind(), attempt, "processing task");

        let err = match self.processor.process(&task) {
            Ok(()) => {
                self.source.complete(&task, receipt)?;
                lock_stats(&self.stats).delivered += 1;
                info!(
                    worker = %self.name,
                    task_id = %task.id(),
                    kind = %task.kind(),
                    attempt,
                    "{}",
                    confirmation(&task)
                );
                return Ok(StepOutcome::Delivered);
            }
            Err(err) => err,
        };

        lock_stats(&self.stats).failed_attempts += 1;
        error!(
            worker = %self.name,
            task_id = %task.id(),
            kind = %task.kind(),
            attempt,
            error = %err,
            "task failed"
        );

        let decision = if err.is_retryable() {
            self.policy.decide(attempt)
        } else {
            RetryDecision::GiveUp
        };

        match decision {
            RetryDecision::GiveUp => {
                self.source.abandon(&task, receipt)?;
                lock_stats(&self.stats).abandoned += 1;
                error!(
                    worker = %self.name,
                    task_id = %task.id(),
                    kind = %task.kind(),
                    attempts = attempt,
                    "giving up on task"
                );
                Ok(StepOutcome::Abandoned)
            }
            RetryDecision::Retry { after } => {
                self.source.retry(task, receipt)?;
                lock_stats(&self.stats).retries += 1;
                if !after.is_zero() {
                    self.sleeper.sleep(after);
                }
                Ok(StepOutcome::Retried)
            }
        }
    }

    /// Step until the source is closed.
    pub fn run(&mut self) {
        self.run_loop(None)
    }

    fn run_loop(&mut self, shutdown: Option<&mpsc::Receiver<()>>) {
        info!(worker = %self.name, source = %self.source.describe(), "worker started");
        loop {
            if let Some(rx) = shutdown {
                if rx.try_recv().is_ok() {
                    info!(worker = %self.name, "worker shutting down");
                    break;
                }
            }

            match self.step() {
                Ok(StepOutcome::Closed) => {
                    info!(worker = %self.name, "source closed; worker finished");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(worker = %self.name, error = %e, "worker step failed");
                    self.sleeper.sleep(self.poll_interval);
                }
            }
        }
    }

    /// Run on a dedicated, named thread.
    pub fn spawn(mut self) -> Result<WorkerHandle, WorkerError>
    where
        S: 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = self.stats.clone();
        let name = self.name.clone();

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || self.run_loop(Some(&shutdown_rx)))
            .map_err(|source| WorkerError::Spawn {
                name: name.clone(),
                source,
            })?;

        Ok(WorkerHandle {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> WorkerStats {
        lock_stats(&self.stats).clone()
    }

    /// True once the worker loop has returned (source closed or shut down).
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }

    /// Request a stop after the current task and wait for the thread.
    pub fn shutdown(mut self) -> Result<(), WorkerError> {
        let _ = self.shutdown.send(());
        match self.join.take() {
            Some(j) => j
                .join()
                .map_err(|_| WorkerError::Panicked(self.name.clone())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    use courier_core::{CapabilityError, CapabilityResult, ReceiptIssuer, TicketId};
    use courier_events::{BoundedQueue, InMemoryStream, StreamTransport};

    use crate::decoder::JsonTaskDecoder;
    use crate::retry::RecordingSleeper;
    use crate::router::CapabilityRouter;

    use super::*;

    const POLL: Duration = Duration::from_millis(20);

    /// Fails the first `failures` calls, then succeeds. Records ticket ids.
    struct FlakyReceipts {
        failures: u32,
        calls: AtomicU32,
        seen: Mutex<Vec<String>>,
    }

    impl FlakyReceipts {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ReceiptIssuer for FlakyReceipts {
        fn issue_receipt(&self, ticket_id: &TicketId) -> CapabilityResult {
            self.seen.lock().unwrap().push(ticket_id.to_string());
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                Err(CapabilityError::Status(500))
            } else {
                Ok(())
            }
        }
    }

    fn ticket(id: &str) -> TicketId {
        TicketId::new(id).unwrap()
    }

    fn receipts_router(issuer: Arc<FlakyReceipts>) -> Arc<dyn TaskProcessor> {
        Arc::new(CapabilityRouter::new().with_receipts(issuer))
    }

    #[test]
    fn queue_worker_retries_until_success() {
        let queue = BoundedQueue::arc(100);
        let issuer = FlakyReceipts::new(2);
        let mut worker = Worker::for_queue("receipts", queue.clone(), receipts_router(issuer.clone()))
            .with_poll_interval(POLL);

        queue.send(Task::issue_receipt(ticket("TCK-1"))).unwrap();

        assert_eq!(worker.step().unwrap(), StepOutcome::Retried);
        assert_eq!(worker.step().unwrap(), StepOutcome::Retried);
        assert_eq!(worker.step().unwrap(), StepOutcome::Delivered);
        assert_eq!(worker.step().unwrap(), StepOutcome::Idle);

        assert_eq!(issuer.calls(), 3);
        assert_eq!(
            worker.stats(),
            WorkerStats {
                delivered: 1,
                failed_attempts: 2,
                retries: 2,
                ..Default::default()
            }
        );
    }

    #[test]
    fn queue_retry_goes_to_the_tail() {
        let queue = BoundedQueue::arc(10);
        let issuer = FlakyReceipts::new(1);
        let mut worker = Worker::for_queue("receipts", queue.clone(), receipts_router(issuer.clone()))
            .with_poll_interval(POLL);

        queue.send(Task::issue_receipt(ticket("A"))).unwrap();
        queue.send(Task::issue_receipt(ticket("B"))).unwrap();
        for _ in 0..3 {
            worker.step().unwrap();
        }

        assert_eq!(*issuer.seen.lock().unwrap(), vec!["A", "B", "A"]);
    }

    #[test]
    fn queue_worker_gives_up_at_the_cap() {
        let queue = BoundedQueue::arc(10);
        let issuer = FlakyReceipts::new(u32::MAX);
        let mut worker = Worker::for_queue("receipts", queue.clone(), receipts_router(issuer.clone()))
            .with_policy(RetryPolicy::immediate().with_max_attempts(3))
            .with_poll_interval(POLL);

        queue.send(Task::issue_receipt(ticket("TCK-1"))).unwrap();

        assert_eq!(worker.step().unwrap(), StepOutcome::Retried);
        assert_eq!(worker.step().unwrap(), StepOutcome::Retried);
        assert_eq!(worker.step().unwrap(), StepOutcome::Abandoned);
        assert!(queue.is_empty());
        assert_eq!(issuer.calls(), 3);
        assert_eq!(worker.stats().abandoned, 1);
    }

    #[test]
    fn unroutable_task_is_abandoned_without_retry() {
        let queue = BoundedQueue::arc(10);
        let mut worker = Worker::for_queue("empty", queue.clone(), Arc::new(CapabilityRouter::new()))
            .with_poll_interval(POLL);

        queue.send(Task::set_alarm_state(true)).unwrap();

        assert_eq!(worker.step().unwrap(), StepOutcome::Abandoned);
        assert!(queue.is_empty());
    }

    #[test]
    fn run_returns_once_queue_is_closed_and_drained() {
        let queue = BoundedQueue::arc(10);
        let issuer = FlakyReceipts::new(1);
        let mut worker = Worker::for_queue("receipts", queue.clone(), receipts_router(issuer.clone()))
            .with_poll_interval(POLL);

        queue.send(Task::issue_receipt(ticket("TCK-1"))).unwrap();
        queue.send(Task::issue_receipt(ticket("TCK-2"))).unwrap();
        queue.close();
        worker.run();

        assert_eq!(worker.stats().delivered, 2);
        assert_eq!(issuer.calls(), 3);
    }

    #[test]
    fn stream_worker_nacks_waits_then_acks_once() {
        let stream = InMemoryStream::new();
        let issuer = FlakyReceipts::new(2);
        let sleeper = Arc::new(RecordingSleeper::new());
        let sub = stream.subscribe("issue-receipt", "receivers", "r1").unwrap();
        let mut worker = Worker::for_stream(
            "receivers",
            sub,
            Arc::new(JsonTaskDecoder),
            receipts_router(issuer.clone()),
        )
        .with_sleeper(sleeper.clone())
        .with_poll_interval(POLL);

        let task = Task::issue_receipt(ticket("TCK-1"));
        stream.publish("issue-receipt", &task.to_bytes().unwrap()).unwrap();

        assert_eq!(worker.step().unwrap(), StepOutcome::Retried);
        assert_eq!(stream.acked_count("issue-receipt", "receivers"), 0);
        assert_eq!(worker.step().unwrap(), StepOutcome::Retried);
        assert_eq!(worker.step().unwrap(), StepOutcome::Delivered);

        assert_eq!(issuer.calls(), 3);
        assert_eq!(stream.acked_count("issue-receipt", "receivers"), 1);
        assert_eq!(stream.pending_count("issue-receipt", "receivers"), 0);
        assert_eq!(sleeper.sleeps(), vec![Duration::from_secs(1); 2]);
    }

    #[test]
    fn failing_group_does_not_affect_the_other() {
        let stream = InMemoryStream::new();
        let healthy = FlakyReceipts::new(0);
        let broken = FlakyReceipts::new(u32::MAX);

        let mut trackers = Worker::for_stream(
            "trackers",
            stream.subscribe("tickets", "trackers", "t1").unwrap(),
            Arc::new(JsonTaskDecoder),
            receipts_router(healthy.clone()),
        )
        .with_sleeper(Arc::new(RecordingSleeper::new()))
        .with_poll_interval(POLL);
        let mut receivers = Worker::for_stream(
            "receivers",
            stream.subscribe("tickets", "receivers", "r1").unwrap(),
            Arc::new(JsonTaskDecoder),
            receipts_router(broken.clone()),
        )
        .with_sleeper(Arc::new(RecordingSleeper::new()))
        .with_poll_interval(POLL);

        let task = Task::issue_receipt(ticket("TCK-1"));
        stream.publish("tickets", &task.to_bytes().unwrap()).unwrap();

        assert_eq!(receivers.step().unwrap(), StepOutcome::Retried);
        assert_eq!(trackers.step().unwrap(), StepOutcome::Delivered);
        assert_eq!(receivers.step().unwrap(), StepOutcome::Retried);
        assert_eq!(trackers.step().unwrap(), StepOutcome::Idle);

        assert_eq!(healthy.calls(), 1);
        assert_eq!(broken.calls(), 2);
        assert_eq!(stream.acked_count("tickets", "trackers"), 1);
        assert_eq!(stream.acked_count("tickets", "receivers"), 0);
    }

    #[test]
    fn stream_worker_acks_when_giving_up() {
        let stream = InMemoryStream::new();
        let issuer = FlakyReceipts::new(u32::MAX);
        let mut worker = Worker::for_stream(
            "receivers",
            stream.subscribe("issue-receipt", "receivers", "r1").unwrap(),
            Arc::new(JsonTaskDecoder),
            receipts_router(issuer),
        )
        .with_policy(RetryPolicy::stream_default().with_max_attempts(2))
        .with_sleeper(Arc::new(RecordingSleeper::new()))
        .with_poll_interval(POLL);

        let task = Task::issue_receipt(ticket("TCK-1"));
        stream.publish("issue-receipt", &task.to_bytes().unwrap()).unwrap();

        assert_eq!(worker.step().unwrap(), StepOutcome::Retried);
        assert_eq!(worker.step().unwrap(), StepOutcome::Abandoned);
        assert_eq!(worker.step().unwrap(), StepOutcome::Idle);
        assert_eq!(stream.acked_count("issue-receipt", "receivers"), 1);
    }

    #[test]
    fn undecodable_message_is_acked_and_counted() {
        let stream = InMemoryStream::new();
        let mut worker = Worker::for_stream(
            "receivers",
            stream.subscribe("issue-receipt", "receivers", "r1").unwrap(),
            Arc::new(JsonTaskDecoder),
            receipts_router(FlakyReceipts::new(0)),
        )
        .with_poll_interval(POLL);

        stream.publish("issue-receipt", b"TCK-1").unwrap();

        assert_eq!(worker.step().unwrap(), StepOutcome::Discarded);
        assert_eq!(stream.acked_count("issue-receipt", "receivers"), 1);
        assert_eq!(worker.stats().discarded, 1);
    }

    #[test]
    fn spawned_worker_processes_and_shuts_down() {
        let queue = BoundedQueue::arc(10);
        let issuer = FlakyReceipts::new(3);
        let handle = Worker::for_queue("receipts", queue.clone(), receipts_router(issuer.clone()))
            .with_poll_interval(POLL)
            .spawn()
            .unwrap();

        for i in 0..5 {
            queue.send(Task::issue_receipt(ticket(&format!("TCK-{i}")))).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().delivered < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        let stats = handle.stats();
        assert_eq!(stats.delivered, 5);
        assert_eq!(stats.retries, 3);
        assert_eq!(handle.name(), "receipts");
        handle.shutdown().unwrap();
    }
}
