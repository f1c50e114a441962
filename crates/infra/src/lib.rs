//! Delivery plumbing: workers, dispatch, retry, external clients and config.

pub mod config;
pub mod decoder;
pub mod dispatcher;
pub mod gateway;
#[cfg(feature = "redis")]
pub mod redis_streams;
pub mod retry;
pub mod router;
pub mod signup;
pub mod worker;

pub use config::{Config, ConfigError, DeliveryMode};
pub use decoder::{AlarmSignalDecoder, JsonTaskDecoder, TaskDecoder};
pub use dispatcher::{DispatchError, Dispatcher, QueueSink, StreamSink, TaskSink};
pub use gateway::{Gateway, GatewayError, ReceiptsClient, SpreadsheetsClient};
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamTransport;
pub use retry::{RecordingSleeper, RetryDecision, RetryPolicy, Sleeper, ThreadSleeper};
pub use router::{CapabilityRouter, ProcessError, TaskProcessor};
pub use signup::{RepositoryError, SignupError, SignupService, UserRepository};
pub use worker::{
    QueueSource, StepOutcome, StreamSource, TaskSource, Worker, WorkerError, WorkerHandle,
    WorkerStats,
};
