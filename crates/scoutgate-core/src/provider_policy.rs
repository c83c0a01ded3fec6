use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::config::duration_secs;
use crate::{ProviderId, ValidationError};

/// Per-provider limits and trust, in configured preference order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderPolicy {
    pub provider_id: ProviderId,
    /// Overrides the aggregator-wide provider timeout when set.
    #[serde(
        default,
        rename = "request_timeout_secs",
        with = "duration_secs::option"
    )]
    pub request_timeout: Option<Duration>,
    /// Tie-breaker weight in cross-validation, higher wins.
    #[serde(default = "default_reliability")]
    pub reliability: f64,
    #[serde(default = "default_quota_window", rename = "quota_window_secs", with = "duration_secs")]
    pub quota_window: Duration,
    #[serde(default = "default_quota_limit")]
    pub quota_limit: u32,
    #[serde(default)]
    pub breaker: CircuitBreakerConfig,
}

fn default_reliability() -> f64 {
    1.0
}

fn default_quota_window() -> Duration {
    Duration::from_secs(60)
}

fn default_quota_limit() -> u32 {
    60
}

impl ProviderPolicy {
    pub fn default_for(provider_id: ProviderId) -> Self {
        Self {
            provider_id,
            request_timeout: None,
            reliability: default_reliability(),
            quota_window: default_quota_window(),
            quota_limit: default_quota_limit(),
            breaker: CircuitBreakerConfig::default(),
        }
    }

    pub fn with_reliability(mut self, reliability: f64) -> Self {
        self.reliability = reliability;
        self
    }

    pub fn with_quota(mut self, quota_window: Duration, quota_limit: u32) -> Self {
        self.quota_window = quota_window;
        self.quota_limit = quota_limit;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.reliability.is_finite() || self.reliability < 0.0 {
            return Err(ValidationError::InvalidConfig {
                field: "providers.reliability",
                reason: format!("'{}' must be a non-negative number", self.provider_id),
            });
        }
        if self.quota_limit == 0 {
            return Err(ValidationError::ZeroConfigValue {
                field: "providers.quota_limit",
            });
        }
        if self.quota_window.is_zero() {
            return Err(ValidationError::ZeroConfigValue {
                field: "providers.quota_window_secs",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_allow_one_request_per_second() {
        let policy = ProviderPolicy::default_for(ProviderId::parse("alpha").expect("valid"));

        assert_eq!(policy.quota_window, Duration::from_secs(60));
        assert_eq!(policy.quota_limit, 60);
        assert_eq!(policy.breaker.failure_threshold, 3);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn deserializes_with_partial_fields() {
        let policy: ProviderPolicy =
            serde_json::from_str(r#"{"provider_id":"beta","quota_limit":5,"request_timeout_secs":2.5}"#)
                .expect("valid policy json");

        assert_eq!(policy.provider_id.as_str(), "beta");
        assert_eq!(policy.quota_limit, 5);
        assert_eq!(policy.request_timeout, Some(Duration::from_millis(2_500)));
        assert_eq!(policy.reliability, 1.0);
    }

    #[test]
    fn rejects_zero_quota() {
        let policy = ProviderPolicy::default_for(ProviderId::parse("gamma").expect("valid"))
            .with_quota(Duration::from_secs(1), 0);
        assert!(policy.validate().is_err());
    }
}
