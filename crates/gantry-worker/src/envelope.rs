//! Job payloads decoded from the builds queue.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;

use crate::config::InstanceConfig;
use crate::error;
use crate::error::Result;

/// A build-job description decoded from a bus delivery.
///
/// `job.id` and `repository.slug` are required; everything else falls back
/// to defaults. Unknown keys in the payload are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    /// Opaque trace token, propagated into logs and the runner context.
    #[serde(default)]
    pub uuid: Option<String>,
    /// Job identity.
    pub job: JobRef,
    /// Source repository.
    pub repository: RepositoryRef,
    /// Build configuration.
    #[serde(default)]
    pub config: BuildConfig,
    /// Per-job timeout overrides, in seconds.
    #[serde(default)]
    pub timeouts: Option<TimeoutOverrides>,
}

impl JobEnvelope {
    /// Decode a raw delivery payload.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).context(error::PayloadDecodeSnafu)
    }

    /// Resolve this job's timeout knobs against the instance defaults.
    pub fn timeouts(&self, config: &InstanceConfig) -> Timeouts {
        Timeouts::resolve(self.timeouts.as_ref(), config)
    }
}

/// Job identity from the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRef {
    /// Upstream job id.
    pub id: u64,
}

/// Source repository from the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryRef {
    /// Repository slug, e.g. `owner/name`.
    pub slug: String,
}

/// Build configuration from the payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Build language.
    #[serde(default)]
    pub language: String,
    /// Distribution the job requested.
    #[serde(default)]
    pub dist: Option<String>,
    /// Image group the job requested.
    #[serde(default)]
    pub group: Option<String>,
    /// Custom OS image override.
    #[serde(default)]
    pub osx_image: Option<String>,
}

/// Per-job timeout overrides, in seconds. Zero means "use the default".
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TimeoutOverrides {
    /// Maximum wall-clock for the entire job script.
    #[serde(default)]
    pub hard_limit: Option<u64>,
    /// Maximum gap with no log output.
    #[serde(default)]
    pub log_silence: Option<u64>,
}

/// Enforcement knobs handed to the runner for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Maximum wall-clock for the entire job script.
    pub hard_limit: Duration,
    /// Maximum gap with no log output before the runner kills the job.
    pub log_silence: Duration,
}

impl Timeouts {
    /// Resolve per-job overrides against the instance defaults.
    ///
    /// A per-job value wins when present and greater than zero.
    pub fn resolve(overrides: Option<&TimeoutOverrides>, config: &InstanceConfig) -> Self {
        let pick = |value: Option<u64>, default: Duration| match value {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => default,
        };
        Self {
            hard_limit: pick(overrides.and_then(|t| t.hard_limit), config.hard_limit),
            log_silence: pick(overrides.and_then(|t| t.log_silence), config.log_silence),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_decode_full_payload() {
        let raw = br#"{
            "uuid": "u1",
            "job": { "id": 42 },
            "repository": { "slug": "a/b" },
            "config": { "language": "ruby", "dist": "focal", "group": "stable" },
            "timeouts": { "hard_limit": 120, "log_silence": 30 }
        }"#;
        let envelope = JobEnvelope::decode(raw).unwrap();
        assert_eq!(envelope.uuid.as_deref(), Some("u1"));
        assert_eq!(envelope.job.id, 42);
        assert_eq!(envelope.repository.slug, "a/b");
        assert_eq!(envelope.config.language, "ruby");
        assert_eq!(envelope.config.dist.as_deref(), Some("focal"));
        let timeouts = envelope.timeouts(&InstanceConfig::default());
        assert_eq!(timeouts.hard_limit, Duration::from_secs(120));
        assert_eq!(timeouts.log_silence, Duration::from_secs(30));
    }

    #[test]
    fn test_decode_minimal_payload() {
        let raw = br#"{"job":{"id":1},"repository":{"slug":"a/b"}}"#;
        let envelope = JobEnvelope::decode(raw).unwrap();
        assert!(envelope.uuid.is_none());
        assert_eq!(envelope.config.language, "");
        assert!(envelope.timeouts.is_none());
    }

    #[test]
    fn test_decode_rejects_missing_job_id() {
        let raw = br#"{"repository":{"slug":"a/b"}}"#;
        assert!(JobEnvelope::decode(raw).is_err());
    }

    #[test]
    fn test_decode_ignores_unknown_keys() {
        let raw = br#"{
            "job": { "id": 7, "number": "3.1" },
            "repository": { "slug": "a/b", "github_id": 99 },
            "queue": "builds.linux",
            "ssh_key": null
        }"#;
        let envelope = JobEnvelope::decode(raw).unwrap();
        assert_eq!(envelope.job.id, 7);
    }

    #[test]
    fn test_zero_timeout_falls_back_to_default() {
        let config = InstanceConfig::default();
        let overrides = TimeoutOverrides {
            hard_limit: Some(0),
            log_silence: Some(45),
        };
        let timeouts = Timeouts::resolve(Some(&overrides), &config);
        assert_eq!(timeouts.hard_limit, config.hard_limit);
        assert_eq!(timeouts.log_silence, Duration::from_secs(45));
    }

    #[test]
    fn test_missing_overrides_use_defaults() {
        let config = InstanceConfig::default();
        let timeouts = Timeouts::resolve(None, &config);
        assert_eq!(timeouts.hard_limit, config.hard_limit);
        assert_eq!(timeouts.log_silence, config.log_silence);
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(raw in prop::collection::vec(any::<u8>(), 0..512)) {
            let _ = JobEnvelope::decode(&raw);
        }

        #[test]
        fn prop_extra_keys_do_not_break_decode(key in "[a-z_]{1,12}", value in any::<u64>()) {
            let raw = format!(
                r#"{{"job":{{"id":5}},"repository":{{"slug":"a/b"}},"{key}":{value}}}"#
            );
            // Extra top-level keys may collide with a known optional field of a
            // different shape; decode must still never panic, and succeed when
            // they do not collide.
            if !["uuid", "job", "repository", "config", "timeouts"].contains(&key.as_str()) {
                prop_assert!(JobEnvelope::decode(raw.as_bytes()).is_ok());
            } else {
                let _ = JobEnvelope::decode(raw.as_bytes());
            }
        }
    }
}
