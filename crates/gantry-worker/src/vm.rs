//! VM provider contracts.
//!
//! The instance owns exactly one VM handle and never shares it. A job
//! executes inside a sandbox obtained from the handle; the sandbox must be
//! released on every exit path, whether the job passed, failed, timed out,
//! or was cancelled.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use snafu::Snafu;

use crate::envelope::JobEnvelope;

/// Errors surfaced by a VM provider.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum VmError {
    /// The hypervisor or image is unusable. Jobs hitting this are requeued.
    #[snafu(display("fatal VM error: {reason}"))]
    Fatal {
        /// Failure reason.
        reason: String,
    },

    /// Sandbox provisioning failed.
    #[snafu(display("failed to provision sandbox: {reason}"))]
    Provision {
        /// Failure reason.
        reason: String,
    },

    /// The shell session could not be opened.
    #[snafu(display("failed to open shell session: {reason}"))]
    Session {
        /// Failure reason.
        reason: String,
    },
}

/// Options for provisioning one job sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxOpts {
    /// Build language, used to pick the base image.
    pub language: String,
    /// Upstream job id, used to tag the sandbox.
    pub job_id: u64,
    /// Custom image override.
    pub custom_image: Option<String>,
    /// Requested distribution.
    pub dist: Option<String>,
    /// Requested image group.
    pub group: Option<String>,
}

impl SandboxOpts {
    /// Build sandbox options from a decoded job envelope.
    pub fn from_envelope(envelope: &JobEnvelope) -> Self {
        Self {
            language: envelope.config.language.clone(),
            job_id: envelope.job.id,
            custom_image: envelope.config.osx_image.clone(),
            dist: envelope.config.dist.clone(),
            group: envelope.config.group.clone(),
        }
    }
}

/// Provider of disposable job sandboxes.
#[async_trait]
pub trait VmProvider: Send + Sync {
    /// Provision the underlying image or pool. Called once during start.
    async fn prepare(&self) -> Result<(), VmError>;

    /// Provision a fresh sandbox for one job.
    async fn sandbox(&self, opts: SandboxOpts) -> Result<Box<dyn VmSandbox>, VmError>;

    /// Human-readable name of the underlying VM, for runner logs.
    fn full_name(&self) -> String;
}

/// A provisioned sandbox holding a live shell session.
///
/// Implementations must also release their resources on drop, so a forced
/// stop that abandons an in-flight job cannot leak the VM.
#[async_trait]
pub trait VmSandbox: Send + Sync {
    /// The shell session the runner drives.
    fn session(&self) -> Arc<dyn VmSession>;

    /// Tear the sandbox down and release its resources. Idempotent.
    async fn release(&mut self);
}

/// Opaque shell-session handle consumed by the runner.
///
/// The instance never interprets the session; concrete runners downcast
/// via [`VmSession::as_any`] to the provider's session type.
pub trait VmSession: Send + Sync {
    /// Downcast support for concrete runners.
    fn as_any(&self) -> &dyn Any;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::JobEnvelope;

    #[test]
    fn test_sandbox_opts_from_envelope() {
        let raw = br#"{
            "job": { "id": 9 },
            "repository": { "slug": "a/b" },
            "config": { "language": "rust", "dist": "jammy", "osx_image": "xcode15" }
        }"#;
        let envelope = JobEnvelope::decode(raw).unwrap();
        let opts = SandboxOpts::from_envelope(&envelope);
        assert_eq!(opts.language, "rust");
        assert_eq!(opts.job_id, 9);
        assert_eq!(opts.dist.as_deref(), Some("jammy"));
        assert_eq!(opts.custom_image.as_deref(), Some("xcode15"));
        assert!(opts.group.is_none());
    }
}
