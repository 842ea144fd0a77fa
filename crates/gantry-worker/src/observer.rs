//! Instance status reporting to registered observers.

use serde::Serialize;

use crate::envelope::JobEnvelope;
use crate::instance::InstanceState;

/// Snapshot of an instance, emitted after every committed state change.
///
/// Observers only ever see committed states: the report is built after the
/// state field has been updated.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Instance name.
    pub name: String,
    /// Host the instance runs on.
    pub host: String,
    /// Committed lifecycle state.
    pub state: InstanceState,
    /// Most recent unclassified error, if any.
    pub last_error: Option<String>,
    /// Payload of the in-flight job, if any.
    pub payload: Option<JobEnvelope>,
    /// Jobs this instance has finished processing, successfully or not.
    pub jobs_processed: u64,
}

/// Receives instance status reports.
///
/// Notification runs on the instance's own context; implementations must
/// not block. The instance never drives observer lifecycle.
pub trait InstanceObserver: Send + Sync {
    /// Handle one status report.
    fn notify(&self, report: &StatusReport);
}
