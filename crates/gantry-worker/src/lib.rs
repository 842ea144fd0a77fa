//! Build-job worker instance for the gantry system.
//!
//! A worker instance is a long-lived state machine that consumes job
//! descriptions from a durable message bus, executes each job inside a
//! disposable VM sandbox, streams progress and logs onto the reporting
//! queues, and acknowledges the source delivery according to the outcome.
//!
//! # Features
//!
//! - **Exactly-one-ack consumption**: every delivery is acked exactly once,
//!   whether the job passed, failed, errored, timed out, or was cancelled.
//!   Requeueing is an application-level `job:restart` event, never a bus
//!   nack.
//! - **VM lifecycle**: a sandbox is provisioned per job and released on
//!   every exit path.
//! - **Out-of-band control**: `cancel` and `stop` are callable from any
//!   task and never wait on the in-flight job.
//! - **Observer fan-out**: every committed state change is pushed to
//!   registered observers for supervision.
//!
//! # Example
//!
//! ```ignore
//! use gantry_bus::MemoryBus;
//! use gantry_worker::{Instance, InstanceConfig, NoopCrashReporter};
//!
//! let bus = Arc::new(MemoryBus::new());
//! let instance = Instance::new(
//!     InstanceConfig::default(),
//!     bus.clone(),
//!     vm_provider,
//!     runner_factory,
//!     Arc::new(NoopCrashReporter),
//! ).await?;
//!
//! instance.start().await?;
//! // ... deliveries on the builds queue drive jobs ...
//! instance.stop(false).await;
//! ```

#![warn(missing_docs)]

mod config;
mod crash;
mod envelope;
mod error;
mod instance;
mod observer;
mod reporter;
mod runner;
mod vm;

pub use config::InstanceConfig;
pub use crash::CrashReporter;
pub use crash::NoopCrashReporter;
pub use envelope::BuildConfig;
pub use envelope::JobEnvelope;
pub use envelope::JobRef;
pub use envelope::RepositoryRef;
pub use envelope::TimeoutOverrides;
pub use envelope::Timeouts;
pub use error::ErrorKind;
pub use error::Result;
pub use error::WorkerError;
pub use instance::Instance;
pub use instance::InstanceState;
pub use observer::InstanceObserver;
pub use observer::StatusReport;
pub use reporter::BUILDS_QUEUE;
pub use reporter::FinishState;
pub use reporter::JobEvent;
pub use reporter::LOGS_QUEUE;
pub use reporter::LogPart;
pub use reporter::Reporter;
pub use runner::JobRunner;
pub use runner::RunnerContext;
pub use runner::RunnerError;
pub use runner::RunnerFactory;
pub use vm::SandboxOpts;
pub use vm::VmError;
pub use vm::VmProvider;
pub use vm::VmSandbox;
pub use vm::VmSession;
