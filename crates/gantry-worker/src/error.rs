//! Error types for the worker.

use snafu::Snafu;

use crate::runner::RunnerError;
use crate::vm::VmError;

/// Result type for worker operations.
pub type Result<T, E = WorkerError> = std::result::Result<T, E>;

/// Errors that can surface while processing a job.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WorkerError {
    /// The VM provider failed in a way that makes the sandbox unusable.
    #[snafu(display("VM fatal error: {reason}"))]
    VmFatal {
        /// Failure reason.
        reason: String,
    },

    /// The runner lost its connection to the VM shell session.
    #[snafu(display("runner connection failed: {reason}"))]
    RunnerConnection {
        /// Failure reason.
        reason: String,
    },

    /// The delivery payload was not valid JSON or is missing required keys.
    #[snafu(display("failed to decode job payload: {source}"))]
    PayloadDecode {
        /// Source error.
        source: serde_json::Error,
    },

    /// The job was cancelled cooperatively while it was running.
    #[snafu(display("job was cancelled"))]
    Canceled,

    /// A bus operation failed.
    #[snafu(display("bus error: {source}"))]
    Bus {
        /// Source error.
        source: gantry_bus::BusError,
    },

    /// An outbound reporter event could not be serialized.
    #[snafu(display("failed to encode reporter event: {source}"))]
    EventEncode {
        /// Source error.
        source: serde_json::Error,
    },

    /// The job failed in a way the worker does not classify.
    #[snafu(display("job execution failed: {reason}"))]
    Execution {
        /// Failure reason.
        reason: String,
    },
}

/// Classification of a failure, used to pick the bus action for the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient infrastructure fault: requeue the job, no cooldown.
    Infrastructure,
    /// Corrupt payload: ack and drop, never requeue.
    Payload,
    /// Cooperative cancellation: terminal success from the bus's view.
    Canceled,
    /// Anything else: requeue, then cool down in `errored` before re-arming.
    Other,
}

impl WorkerError {
    /// Classify this error for the ack-vs-requeue decision.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::VmFatal { .. } | Self::RunnerConnection { .. } => ErrorKind::Infrastructure,
            Self::PayloadDecode { .. } => ErrorKind::Payload,
            Self::Canceled => ErrorKind::Canceled,
            Self::Bus { .. } | Self::EventEncode { .. } | Self::Execution { .. } => ErrorKind::Other,
        }
    }

    /// Whether this failure requeues the job upstream.
    pub fn requeues(&self) -> bool {
        matches!(self.kind(), ErrorKind::Infrastructure | ErrorKind::Other)
    }
}

impl From<VmError> for WorkerError {
    fn from(err: VmError) -> Self {
        match err {
            VmError::Fatal { reason } => Self::VmFatal { reason },
            other => Self::Execution {
                reason: other.to_string(),
            },
        }
    }
}

impl From<RunnerError> for WorkerError {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::Connection { reason } => Self::RunnerConnection { reason },
            RunnerError::Canceled => Self::Canceled,
            other => Self::Execution {
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_bus_action_table() {
        let vm = WorkerError::VmFatal {
            reason: "image gone".into(),
        };
        assert_eq!(vm.kind(), ErrorKind::Infrastructure);
        assert!(vm.requeues());

        let conn = WorkerError::RunnerConnection {
            reason: "ssh reset".into(),
        };
        assert_eq!(conn.kind(), ErrorKind::Infrastructure);

        let decode = serde_json::from_str::<serde_json::Value>("not-json").unwrap_err();
        let payload = WorkerError::PayloadDecode { source: decode };
        assert_eq!(payload.kind(), ErrorKind::Payload);
        assert!(!payload.requeues());

        assert_eq!(WorkerError::Canceled.kind(), ErrorKind::Canceled);

        let other = WorkerError::Execution {
            reason: "script exploded".into(),
        };
        assert_eq!(other.kind(), ErrorKind::Other);
        assert!(other.requeues());
    }

    #[test]
    fn test_vm_error_conversion() {
        let fatal: WorkerError = VmError::Fatal {
            reason: "no capacity".into(),
        }
        .into();
        assert!(matches!(fatal, WorkerError::VmFatal { .. }));

        let provision: WorkerError = VmError::Provision {
            reason: "image pull failed".into(),
        }
        .into();
        assert_eq!(provision.kind(), ErrorKind::Other);
    }

    #[test]
    fn test_runner_error_conversion() {
        let conn: WorkerError = RunnerError::Connection {
            reason: "broken pipe".into(),
        }
        .into();
        assert!(matches!(conn, WorkerError::RunnerConnection { .. }));

        let canceled: WorkerError = RunnerError::Canceled.into();
        assert_eq!(canceled.kind(), ErrorKind::Canceled);
    }
}
