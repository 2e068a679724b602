//! Process virtual machine: process models, execution trees and the atomic
//! operation interpreter that advances them.
//!
//! ## Design
//!
//! - A process instance is one persisted execution tree with a revision;
//!   every command works on a copy and saves it conditionally
//! - Advancement is a queue of atomic operations performed one at a time, so
//!   listener chains and activity graphs never grow the stack
//! - Listener progress lives in the execution (`listener_index`), which makes
//!   a chain resumable after an async boundary or a spent step budget
//! - Async boundaries and spent budgets become `async-continuation` jobs on
//!   the job source; external-task activities publish tasks for remote workers
//!
//! ## Components
//!
//! - `ProcessModel`: activities, transitions, behaviours and listeners
//! - `Interpreter`: the atomic operation trampoline
//! - `ProcessStore`: revision-checked instance persistence
//! - `RuntimeService`: deploy, start, signal and delete process instances

pub mod config;
pub mod continuation;
pub mod execution;
pub mod listener;
pub mod model;
pub mod operation;
pub mod runtime;
pub mod store;


pub use config::RuntimeConfig;
pub use continuation::{ASYNC_CONTINUATION, AsyncContinuationHandler, ExternalTaskBridge};
pub use execution::{Execution, ProcessInstance};
pub use listener::{DelegateExecution, EventName, ExecutionListener, ListenerError};
pub use model::{Activity, Behavior, Condition, ModelError, ProcessModel, ProcessModelBuilder, Transition};
pub use operation::{AtomicOperation, Deferred, Interpreter, RunOutcome, Step};
pub use runtime::{ProcessDefinition, RuntimeService};
pub use store::{InMemoryProcessStore, ProcessStore, ProcessStoreError};
