//! Job-event and log publishing onto the reporting queues.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use gantry_bus::Publisher;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;

use crate::error;
use crate::error::Result;

/// Outbound queue for job lifecycle events.
pub const BUILDS_QUEUE: &str = "reporting.jobs.builds";
/// Outbound queue for job log chunks.
pub const LOGS_QUEUE: &str = "reporting.jobs.logs";

/// Terminal state reported for a finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishState {
    /// The job script completed with a zero exit.
    Passed,
    /// The job script completed with a non-zero exit.
    Failed,
    /// The job could not be driven to completion.
    Errored,
    /// The job was cancelled.
    Canceled,
}

/// Lifecycle events published to the builds queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobEvent {
    /// The worker accepted the job.
    #[serde(rename = "job:received")]
    Received {
        /// Upstream job id.
        id: u64,
    },
    /// The job reached a terminal state.
    #[serde(rename = "job:finished")]
    Finished {
        /// Upstream job id.
        id: u64,
        /// Terminal state.
        state: FinishState,
    },
    /// The job should be re-queued upstream.
    #[serde(rename = "job:restart")]
    Restart {
        /// Upstream job id.
        id: u64,
    },
}

/// One ordered chunk of job log output, published to the logs queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "job:log")]
pub struct LogPart {
    /// Upstream job id.
    pub id: u64,
    /// Log content.
    pub log: String,
    /// Per-job sequence number, starting at zero.
    pub number: u64,
}

/// Publishes job events and log chunks onto the reporting queues.
///
/// Owns one publisher per queue so a log-publishing stall cannot block job
/// completion publishing. The log-part counter is per job; `reset` clears
/// it between jobs.
pub struct Reporter {
    builds: Box<dyn Publisher>,
    logs: Box<dyn Publisher>,
    log_number: AtomicU64,
}

impl Reporter {
    /// Create a reporter from its two queue publishers.
    pub fn new(builds: Box<dyn Publisher>, logs: Box<dyn Publisher>) -> Self {
        Self {
            builds,
            logs,
            log_number: AtomicU64::new(0),
        }
    }

    /// Announce that the worker accepted a job.
    pub async fn notify_job_received(&self, job_id: u64) -> Result<()> {
        metrics::counter!("worker.job.received").increment(1);
        self.publish_event(&JobEvent::Received { id: job_id }).await
    }

    /// Publish one ordered log chunk for a job.
    pub async fn send_log(&self, job_id: u64, chunk: &str) -> Result<()> {
        let part = LogPart {
            id: job_id,
            log: chunk.to_string(),
            number: self.log_number.fetch_add(1, Ordering::SeqCst),
        };
        let payload = serde_json::to_vec(&part).context(error::EventEncodeSnafu)?;
        self.logs.publish(&payload).await.context(error::BusSnafu)
    }

    /// Announce that a job reached a terminal state.
    pub async fn notify_job_finished(&self, job_id: u64, state: FinishState) -> Result<()> {
        metrics::counter!("worker.job.finished").increment(1);
        if state == FinishState::Canceled {
            metrics::counter!("worker.job.canceled").increment(1);
        }
        self.publish_event(&JobEvent::Finished { id: job_id, state }).await
    }

    /// Ask upstream to re-queue a job.
    pub async fn restart(&self, job_id: u64) -> Result<()> {
        metrics::counter!("worker.job.requeue").increment(1);
        self.publish_event(&JobEvent::Restart { id: job_id }).await
    }

    /// Clear the per-job log-part counter. Called between jobs.
    pub fn reset(&self) {
        self.log_number.store(0, Ordering::SeqCst);
    }

    async fn publish_event(&self, event: &JobEvent) -> Result<()> {
        let payload = serde_json::to_vec(event).context(error::EventEncodeSnafu)?;
        self.builds.publish(&payload).await.context(error::BusSnafu)
    }
}

#[cfg(test)]
mod tests {
    use gantry_bus::MemoryBus;
    use gantry_bus::MessageBus;

    use super::*;

    async fn reporter_on(bus: &MemoryBus) -> Reporter {
        let builds = bus.publisher(BUILDS_QUEUE).await.unwrap();
        let logs = bus.publisher(LOGS_QUEUE).await.unwrap();
        Reporter::new(builds, logs)
    }

    #[tokio::test]
    async fn test_event_wire_format() {
        let bus = MemoryBus::new();
        let reporter = reporter_on(&bus).await;

        reporter.notify_job_received(42).await.unwrap();
        reporter.notify_job_finished(42, FinishState::Passed).await.unwrap();
        reporter.restart(43).await.unwrap();

        let published = bus.published(BUILDS_QUEUE);
        assert_eq!(
            String::from_utf8(published[0].clone()).unwrap(),
            r#"{"type":"job:received","id":42}"#
        );
        assert_eq!(
            String::from_utf8(published[1].clone()).unwrap(),
            r#"{"type":"job:finished","id":42,"state":"passed"}"#
        );
        assert_eq!(
            String::from_utf8(published[2].clone()).unwrap(),
            r#"{"type":"job:restart","id":43}"#
        );
    }

    #[tokio::test]
    async fn test_log_parts_are_numbered_per_job() {
        let bus = MemoryBus::new();
        let reporter = reporter_on(&bus).await;

        reporter.send_log(7, "one").await.unwrap();
        reporter.send_log(7, "two").await.unwrap();
        reporter.reset();
        reporter.send_log(8, "fresh").await.unwrap();

        let parts: Vec<LogPart> = bus
            .published(LOGS_QUEUE)
            .iter()
            .map(|raw| serde_json::from_slice(raw).unwrap())
            .collect();
        assert_eq!(parts[0].number, 0);
        assert_eq!(parts[1].number, 1);
        assert_eq!(parts[2].number, 0);
        assert_eq!(parts[2].id, 8);
    }

    #[tokio::test]
    async fn test_log_part_wire_format() {
        let bus = MemoryBus::new();
        let reporter = reporter_on(&bus).await;
        reporter.send_log(5, "hello\n").await.unwrap();

        let raw = bus.published(LOGS_QUEUE).remove(0);
        assert_eq!(
            String::from_utf8(raw).unwrap(),
            r#"{"type":"job:log","id":5,"log":"hello\n","number":0}"#
        );
    }
}
