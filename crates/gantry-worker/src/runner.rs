//! Per-job runner contracts.
//!
//! A runner drives one job's script through the VM shell session line by
//! line and owns all per-step reporting. The instance only starts it,
//! cancels it, and classifies how it ended.

use std::sync::Arc;

use async_trait::async_trait;
use snafu::Snafu;

use crate::envelope::JobEnvelope;
use crate::envelope::Timeouts;
use crate::reporter::Reporter;
use crate::vm::VmSession;

/// Errors surfaced by a runner.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RunnerError {
    /// The connection to the VM shell dropped mid-job. Jobs hitting this
    /// are requeued.
    #[snafu(display("connection to VM shell lost: {reason}"))]
    Connection {
        /// Failure reason.
        reason: String,
    },

    /// The run was cancelled cooperatively.
    #[snafu(display("run was cancelled"))]
    Canceled,

    /// The job script could not be driven to completion.
    #[snafu(display("runner failed: {reason}"))]
    Failed {
        /// Failure reason.
        reason: String,
    },
}

/// Everything a runner needs to drive one job.
pub struct RunnerContext {
    /// The decoded job payload.
    pub envelope: JobEnvelope,
    /// Shell session inside the job's sandbox.
    pub session: Arc<dyn VmSession>,
    /// Reporter for per-step events and log chunks.
    pub reporter: Arc<Reporter>,
    /// Name of the VM the session lives in.
    pub vm_name: String,
    /// Resolved timeout knobs. The runner owns enforcement of both.
    pub timeouts: Timeouts,
    /// Name of the instance running this job.
    pub instance_name: String,
    /// Trace token from the job payload.
    pub job_uuid: Option<String>,
}

/// Drives one job's script to completion.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run the job's script.
    ///
    /// Blocks until the script finishes, hits a timeout, or is cancelled.
    /// The runner emits its own terminal `job:finished` event for every
    /// outcome it handles itself.
    async fn run(&self) -> Result<(), RunnerError>;

    /// Request termination of the running script.
    ///
    /// Idempotent and safe to call from any task; must not block. The run
    /// surfaces at most a bounded delay before returning.
    fn cancel(&self);
}

/// Constructs a runner for each job.
pub trait RunnerFactory: Send + Sync {
    /// Build a runner for the job described by `ctx`.
    fn create(&self, ctx: RunnerContext) -> Arc<dyn JobRunner>;
}
