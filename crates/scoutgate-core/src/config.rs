//! Pipeline configuration.
//!
//! One immutable [`PipelineConfig`] is loaded at startup and each component
//! receives its own section. Every field has a default, so an empty JSON object
//! is a valid configuration. Durations are written in seconds:
//!
//! ```json
//! {
//!   "dedup": { "window_secs": 14400 },
//!   "gate": { "confidence_threshold": 0.7, "rr_threshold": 2.0, "override_threshold": 0.95 },
//!   "providers": [{ "provider_id": "alpha", "quota_limit": 30 }]
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::aggregator::AggregatorConfig;
use crate::cache::CacheConfig;
use crate::dedup::DedupConfig;
use crate::events::EventBusConfig;
use crate::gate::EscalationThresholds;
use crate::orchestrator::OrchestratorConfig;
use crate::provider_policy::ProviderPolicy;
use crate::scanner::ScanFilter;
use crate::scheduler::SchedulerConfig;
use crate::{CoreError, ValidationError};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub cache: CacheConfig,
    pub aggregator: AggregatorConfig,
    pub scanner: ScanFilter,
    pub gate: EscalationThresholds,
    pub dedup: DedupConfig,
    pub orchestrator: OrchestratorConfig,
    pub events: EventBusConfig,
    pub scheduler: SchedulerConfig,
    /// Provider policies in preference order.
    pub providers: Vec<ProviderPolicy>,
}

impl PipelineConfig {
    /// Read and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_json(&raw).map_err(|error| match error {
            CoreError::Serialization(error) => {
                CoreError::Config(format!("{}: {error}", path.display()))
            }
            other => other,
        })?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, CoreError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.cache.validate()?;
        self.aggregator.validate()?;
        self.scanner.validate()?;
        self.gate.validate()?;
        self.dedup.validate()?;
        self.orchestrator.validate()?;
        self.events.validate()?;
        self.scheduler.validate()?;

        let mut seen = HashSet::new();
        for policy in &self.providers {
            policy.validate()?;
            if !seen.insert(policy.provider_id.clone()) {
                return Err(ValidationError::InvalidConfig {
                    field: "providers",
                    reason: format!("provider '{}' is listed twice", policy.provider_id),
                });
            }
        }
        Ok(())
    }
}

/// Serde helper for `Duration` fields written as (fractional) seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        from_secs(secs).map_err(de::Error::custom)
    }

    fn from_secs(secs: f64) -> Result<Duration, String> {
        if !secs.is_finite() || secs < 0.0 {
            return Err(format!("duration must be a non-negative number of seconds, got {secs}"));
        }
        Duration::try_from_secs_f64(secs).map_err(|error| error.to_string())
    }

    pub mod option {
        use std::time::Duration;

        use serde::{de, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(value) => serializer.serialize_some(&value.as_secs_f64()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<f64>::deserialize(deserializer)?
                .map(|secs| super::from_secs(secs).map_err(de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config = PipelineConfig::from_json("{}").expect("valid config");
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.dedup.window, Duration::from_secs(14_400));
    }

    #[test]
    fn fractional_seconds_and_partial_sections_parse() {
        let config = PipelineConfig::from_json(
            r#"{
                "orchestrator": { "worker_timeout_secs": 1.5, "pool_size": 4 },
                "providers": [{ "provider_id": "alpha", "request_timeout_secs": 0.25 }]
            }"#,
        )
        .expect("valid config");

        assert_eq!(config.orchestrator.worker_timeout, Duration::from_millis(1_500));
        assert_eq!(config.orchestrator.pool_size, 4);
        assert!(config.orchestrator.allow_stale);
        assert_eq!(
            config.providers[0].request_timeout,
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn negative_durations_are_rejected() {
        let error = PipelineConfig::from_json(r#"{ "dedup": { "window_secs": -1 } }"#)
            .expect_err("negative window");
        assert!(matches!(error, CoreError::Serialization(_)));
    }

    #[test]
    fn oversized_cache_ttl_is_rejected() {
        let error = PipelineConfig::from_json(
            r#"{ "cache": { "price": { "ttl_secs": 1e19, "max_entries": 10 } } }"#,
        )
        .expect_err("ttl beyond the tier cap");
        assert!(matches!(
            error,
            CoreError::Validation(ValidationError::InvalidConfig {
                field: "cache.ttl_secs",
                ..
            })
        ));
    }

    #[test]
    fn duplicate_providers_are_rejected() {
        let error = PipelineConfig::from_json(
            r#"{ "providers": [{ "provider_id": "alpha" }, { "provider_id": "alpha" }] }"#,
        )
        .expect_err("duplicate provider");
        assert!(matches!(
            error,
            CoreError::Validation(ValidationError::InvalidConfig {
                field: "providers",
                ..
            })
        ));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("scoutgate.json");
        std::fs::write(&path, r#"{ "gate": { "rr_threshold": 3.0 } }"#).expect("write");

        let config = PipelineConfig::load(&path).expect("loaded");
        assert_eq!(config.gate.rr_threshold, 3.0);
        assert_eq!(config.gate.confidence_threshold, 0.70);
    }
}
