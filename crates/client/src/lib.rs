//! External task polling client.
//!
//! A client subscribes handlers to topics, fetches and locks tasks of those
//! topics from the engine and runs each task's handler on its polling thread.
//! Empty fetches back off with the same policy the job acquisition loop uses.

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod transport;

pub use backoff::{BackoffStrategy, ExponentialBackoff, NoBackoff};
pub use client::{
    ClientHandle, ClientStats, ExternalTaskClient, ExternalTaskHandler, TaskService,
    TopicSubscription,
};
pub use config::ClientConfig;
pub use error::ClientError;
pub use transport::ExternalTaskTransport;
