//! The worker instance state machine.
//!
//! One instance consumes job descriptions from the builds queue, executes
//! each job inside a disposable VM sandbox, streams events through the
//! reporter, and acknowledges the source delivery according to the outcome.
//!
//! ```text
//! created -> starting -> ready <-> working
//!                          |          |
//!                       stopping -> stopped
//!                          ^          |
//!                       errored <- (any)
//! ```
//!
//! The instance runs its own pump task; `cancel` and `stop` are callable
//! from any task and never wait on the in-flight job.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use gantry_bus::Delivery;
use gantry_bus::MessageBus;
use gantry_bus::Subscription;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::InstanceConfig;
use crate::crash::CrashReporter;
use crate::envelope::JobEnvelope;
use crate::error;
use crate::error::ErrorKind;
use crate::error::Result;
use crate::error::WorkerError;
use crate::observer::InstanceObserver;
use crate::observer::StatusReport;
use crate::reporter::BUILDS_QUEUE;
use crate::reporter::FinishState;
use crate::reporter::LOGS_QUEUE;
use crate::reporter::Reporter;
use crate::runner::JobRunner;
use crate::runner::RunnerContext;
use crate::runner::RunnerFactory;
use crate::vm::SandboxOpts;
use crate::vm::VmProvider;
use crate::vm::VmSandbox;

/// Log chunk appended when a job is cancelled before its runner exists.
const CANCELLED_LOG: &str = "\n\nDone: Job Cancelled\n";

/// Lifecycle state of a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Constructed, not yet started.
    Created,
    /// Provisioning the VM and opening the subscription.
    Starting,
    /// Subscribed and waiting for a job.
    Ready,
    /// Executing a job.
    Working,
    /// Draining towards `stopped` after a shutdown request.
    Stopping,
    /// No longer consuming; terminal.
    Stopped,
    /// Cooling down after an unclassified error.
    Errored,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Working => "working",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Errored => "errored",
        };
        write!(f, "{name}")
    }
}

/// State shared between the instance handle, its pump task, and callers of
/// `cancel`/`stop`.
struct Shared {
    config: InstanceConfig,
    state: Mutex<InstanceState>,
    last_error: Mutex<Option<String>>,
    payload: Mutex<Option<JobEnvelope>>,
    job_canceled: AtomicBool,
    shutdown: AtomicBool,
    runner: Mutex<Option<Arc<dyn JobRunner>>>,
    observers: Mutex<Vec<Arc<dyn InstanceObserver>>>,
    jobs_processed: AtomicU64,
    reporter: Arc<Reporter>,
    unsubscribe: CancellationToken,
}

impl Shared {
    fn state(&self) -> InstanceState {
        *self.state.lock()
    }

    /// Commit a state change, then notify observers of the committed state.
    fn set_state(&self, next: InstanceState) {
        {
            let mut state = self.state.lock();
            debug!(from = %state, to = %next, "state change");
            *state = next;
        }
        let report = self.status_report();
        let observers = self.observers.lock().clone();
        for observer in &observers {
            observer.notify(&report);
        }
    }

    fn status_report(&self) -> StatusReport {
        StatusReport {
            name: self.config.name.clone(),
            host: self.config.host.clone(),
            state: self.state(),
            last_error: self.last_error.lock().clone(),
            payload: self.payload.lock().clone(),
            jobs_processed: self.jobs_processed.load(Ordering::Relaxed),
        }
    }
}

/// A build-job worker instance.
///
/// Owns the VM handle, the current runner, and the reporter. `start`
/// provisions the VM, subscribes to the builds queue, and spawns the pump
/// task that drains deliveries one at a time.
pub struct Instance {
    shared: Arc<Shared>,
    bus: Arc<dyn MessageBus>,
    vm: Arc<dyn VmProvider>,
    runner_factory: Arc<dyn RunnerFactory>,
    crash: Arc<dyn CrashReporter>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Instance {
    /// Create an instance.
    ///
    /// The reporter and both of its publishers are opened here, not inside
    /// the message callback: they must be usable by the time the first
    /// delivery arrives.
    pub async fn new(
        config: InstanceConfig,
        bus: Arc<dyn MessageBus>,
        vm: Arc<dyn VmProvider>,
        runner_factory: Arc<dyn RunnerFactory>,
        crash: Arc<dyn CrashReporter>,
    ) -> Result<Self> {
        let builds = bus.publisher(BUILDS_QUEUE).await.context(error::BusSnafu)?;
        let logs = bus.publisher(LOGS_QUEUE).await.context(error::BusSnafu)?;
        let reporter = Arc::new(Reporter::new(builds, logs));
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(InstanceState::Created),
                last_error: Mutex::new(None),
                payload: Mutex::new(None),
                job_canceled: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                runner: Mutex::new(None),
                observers: Mutex::new(Vec::new()),
                jobs_processed: AtomicU64::new(0),
                reporter,
                unsubscribe: CancellationToken::new(),
            }),
            bus,
            vm,
            runner_factory,
            crash,
            pump: Mutex::new(None),
        })
    }

    /// Register an observer for status reports.
    pub fn add_observer(&self, observer: Arc<dyn InstanceObserver>) {
        self.shared.observers.lock().push(observer);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> InstanceState {
        self.shared.state()
    }

    /// Most recent unclassified error, with its backtrace.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    /// Start the instance: provision the VM, declare and subscribe to the
    /// builds queue, then begin draining deliveries.
    pub async fn start(&self) -> Result<()> {
        self.shared.set_state(InstanceState::Starting);
        match self.try_start().await {
            Ok(subscription) => {
                self.shared.set_state(InstanceState::Ready);
                let pump = Pump {
                    shared: self.shared.clone(),
                    vm: self.vm.clone(),
                    runner_factory: self.runner_factory.clone(),
                    crash: self.crash.clone(),
                };
                *self.pump.lock() = Some(tokio::spawn(pump.run(subscription)));
                info!(name = %self.shared.config.name, queue = %self.shared.config.queue_name, "instance started");
                Ok(())
            }
            Err(e) => {
                *self.shared.last_error.lock() = Some(e.to_string());
                self.shared.set_state(InstanceState::Errored);
                Err(e)
            }
        }
    }

    async fn try_start(&self) -> Result<Box<dyn Subscription>> {
        self.vm.prepare().await?;
        let queue = &self.shared.config.queue_name;
        self.bus.declare_queue(queue).await.context(error::BusSnafu)?;
        self.bus.subscribe(queue).await.context(error::BusSnafu)
    }

    /// Cancel the in-flight job, if any.
    ///
    /// Delegates to the live runner when one exists; otherwise marks the
    /// job cancelled so the sandbox body short-circuits before a runner is
    /// built. Never changes the instance state.
    pub fn cancel(&self) {
        let runner = self.shared.runner.lock().clone();
        match runner {
            Some(runner) => {
                info!("cancelling running job");
                runner.cancel();
            }
            None => {
                info!("cancel before runner exists, flagging job as cancelled");
                self.shared.job_canceled.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Stop the instance.
    ///
    /// A graceful stop lets an in-flight job finish; the job's finish tail
    /// then routes the instance through `stopping` to `stopped`. When no
    /// job is in flight, the subscription is cancelled, the bus client gets
    /// a short grace to drain, and the instance stops. A forced stop
    /// unsubscribes and aborts the pump immediately, abandoning any
    /// in-flight job; sandbox teardown on drop releases the VM.
    pub async fn stop(&self, force: bool) {
        if force {
            warn!(name = %self.shared.config.name, "forced stop");
            self.shared.unsubscribe.cancel();
            if let Some(handle) = self.pump.lock().take() {
                handle.abort();
            }
            self.shared.set_state(InstanceState::Stopped);
            return;
        }
        if self.shared.state() == InstanceState::Working {
            info!(name = %self.shared.config.name, "stop deferred until the in-flight job finishes");
            self.shared.shutdown.store(true, Ordering::SeqCst);
            return;
        }
        self.shared.unsubscribe.cancel();
        tokio::time::sleep(self.shared.config.unsubscribe_grace).await;
        self.shared.set_state(InstanceState::Stopped);
        info!(name = %self.shared.config.name, "instance stopped");
    }
}

/// The per-instance pump: drains deliveries from the subscription and
/// drives the state machine. Runs as its own tokio task, so one instance's
/// blocking points never stall another instance.
struct Pump {
    shared: Arc<Shared>,
    vm: Arc<dyn VmProvider>,
    runner_factory: Arc<dyn RunnerFactory>,
    crash: Arc<dyn CrashReporter>,
}

impl Pump {
    async fn run(self, mut subscription: Box<dyn Subscription>) {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = self.shared.unsubscribe.cancelled() => break,
                next = subscription.next() => match next {
                    Some(delivery) => delivery,
                    None => break,
                },
            };
            self.process(delivery).await;
        }
        if let Err(e) = subscription.cancel().await {
            warn!(error = %e, "failed to cancel subscription");
        }
        debug!("pump exited");
    }

    /// Process one delivery end to end.
    ///
    /// The delivery is always acked, never nacked; requeueing happens at
    /// the application level through a `job:restart` event.
    async fn process(&self, delivery: Delivery) {
        // A poison message is acked and dropped. Requeueing it would just
        // poison the next consumer too.
        let envelope = match JobEnvelope::decode(delivery.payload()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, redelivered = delivery.redelivered(), "dropping undecodable job payload");
                if let Err(e) = delivery.ack().await {
                    warn!(error = %e, "failed to ack poison delivery");
                }
                return;
            }
        };

        let job_id = envelope.job.id;
        let uuid = envelope.uuid.clone().unwrap_or_default();
        let span = tracing::info_span!("job", id = job_id, uuid = %uuid);
        async {
            info!(
                repository = %envelope.repository.slug,
                redelivered = delivery.redelivered(),
                "job received"
            );
            self.prepare(envelope.clone());
            let result = self.work(&envelope).await;
            self.conclude(job_id, result).await;
            self.finish(delivery).await;
        }
        .instrument(span)
        .await;
    }

    /// Commit the payload and enter `working`.
    fn prepare(&self, envelope: JobEnvelope) {
        self.shared.job_canceled.store(false, Ordering::SeqCst);
        *self.shared.last_error.lock() = None;
        *self.shared.payload.lock() = Some(envelope);
        self.shared.set_state(InstanceState::Working);
    }

    /// Run one job inside a fresh sandbox.
    async fn work(&self, envelope: &JobEnvelope) -> Result<()> {
        self.shared.reporter.notify_job_received(envelope.job.id).await?;
        let opts = SandboxOpts::from_envelope(envelope);
        let mut sandbox = self.vm.sandbox(opts).await?;
        let result = self.run_in_sandbox(&*sandbox, envelope).await;
        // Release on every exit path, including cancellation and failure.
        sandbox.release().await;
        result
    }

    async fn run_in_sandbox(&self, sandbox: &dyn VmSandbox, envelope: &JobEnvelope) -> Result<()> {
        let job_id = envelope.job.id;
        if self.shared.job_canceled.load(Ordering::SeqCst) {
            // Cancel arrived before the sandbox was ready: no runner is
            // ever built for this job.
            info!("job cancelled before sandbox entry");
            self.shared.reporter.send_log(job_id, CANCELLED_LOG).await?;
            self.shared
                .reporter
                .notify_job_finished(job_id, FinishState::Canceled)
                .await?;
            return Ok(());
        }

        let ctx = RunnerContext {
            envelope: envelope.clone(),
            session: sandbox.session(),
            reporter: self.shared.reporter.clone(),
            vm_name: self.vm.full_name(),
            timeouts: envelope.timeouts(&self.shared.config),
            instance_name: self.shared.config.name.clone(),
            job_uuid: envelope.uuid.clone(),
        };
        let runner = self.runner_factory.create(ctx);
        *self.shared.runner.lock() = Some(runner.clone());
        let result = runner.run().await;
        *self.shared.runner.lock() = None;
        result.map_err(WorkerError::from)
    }

    /// Classify the outcome and emit the matching reporter action.
    async fn conclude(&self, job_id: u64, result: Result<()>) {
        let Err(e) = result else {
            return;
        };
        if self.shared.job_canceled.load(Ordering::SeqCst) || e.kind() == ErrorKind::Canceled {
            // Cancellation already produced its terminal event; the error
            // is spent.
            debug!(error = %e, "suppressing error from cancelled job");
            return;
        }
        match e.kind() {
            ErrorKind::Infrastructure => {
                warn!(error = %e, "job hit an infrastructure failure, requeueing");
                self.restart_job(job_id).await;
            }
            _ => self.error_build(job_id, &e).await,
        }
    }

    /// Publish a `job:restart` so upstream re-queues the job.
    async fn restart_job(&self, job_id: u64) {
        if let Err(e) = self.shared.reporter.restart(job_id).await {
            warn!(error = %e, "failed to publish job restart");
        }
    }

    /// Handle an unclassified error: record it, requeue the job, capture
    /// it, and park the instance in `errored` until the cooldown in the
    /// finish tail.
    ///
    /// Nothing in here may abort processing; the finish tail must run.
    async fn error_build(&self, job_id: u64, err: &WorkerError) {
        error!(error = %err, "job failed with unclassified error");
        let trace = format!("{err}\n{}", std::backtrace::Backtrace::force_capture());
        *self.shared.last_error.lock() = Some(trace.clone());
        self.shared.set_state(InstanceState::Errored);
        self.restart_job(job_id).await;
        if let Err(sink_err) = self.crash.capture(&trace) {
            eprintln!("crash reporter failed: {sink_err}");
        }
    }

    /// Ack the delivery and re-arm the instance, or stop it when a
    /// shutdown request arrived during the job.
    ///
    /// Ack and state transition stay fused: the restart decision was made
    /// before the ack, and the state does not advance past the job until
    /// the ack has been sent.
    async fn finish(&self, delivery: Delivery) {
        if let Err(e) = delivery.ack().await {
            warn!(error = %e, "failed to ack delivery");
        }
        *self.shared.payload.lock() = None;
        self.shared.job_canceled.store(false, Ordering::SeqCst);
        self.shared.reporter.reset();
        self.shared.jobs_processed.fetch_add(1, Ordering::Relaxed);

        if self.shared.state() == InstanceState::Errored {
            // Cooldown damps a tight failure loop against the bus.
            tokio::time::sleep(self.shared.config.cooldown).await;
        }

        if self.shared.shutdown.load(Ordering::SeqCst) {
            self.shared.set_state(InstanceState::Stopping);
            self.shared.unsubscribe.cancel();
            self.shared.set_state(InstanceState::Stopped);
        } else {
            self.shared.set_state(InstanceState::Ready);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display_is_lowercase() {
        assert_eq!(InstanceState::Created.to_string(), "created");
        assert_eq!(InstanceState::Working.to_string(), "working");
        assert_eq!(InstanceState::Errored.to_string(), "errored");
    }

    #[test]
    fn test_state_serde_round_trip() {
        let json = serde_json::to_string(&InstanceState::Stopping).unwrap();
        assert_eq!(json, r#""stopping""#);
        let back: InstanceState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, InstanceState::Stopping);
    }
}
