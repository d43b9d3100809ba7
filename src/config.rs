use crate::error::KindbError;
use std::time::Duration;

/// Runtime configuration for a kindb instance.
#[derive(Debug, Clone)]
pub struct KindbConfig {
    pub default_list_limit: usize,
    pub max_list_limit: usize,
    pub max_background_tasks: usize,
    /// Upper bound on lock acquisition. `None` waits indefinitely and leaves
    /// back-pressure to the caller.
    pub lock_acquire_timeout_ms: Option<u64>,
    pub analytics_cache_capacity: usize,
    pub reference_resolution_enabled: bool,
}

impl Default for KindbConfig {
    fn default() -> Self {
        Self {
            default_list_limit: 20,
            max_list_limit: 1_000,
            max_background_tasks: 256,
            lock_acquire_timeout_ms: None,
            analytics_cache_capacity: 1_024,
            reference_resolution_enabled: true,
        }
    }
}

impl KindbConfig {
    pub fn development() -> Self {
        Self {
            max_background_tasks: 16,
            analytics_cache_capacity: 64,
            ..Self::default()
        }
    }

    /// Profile for deployments that prefer failing a request over queueing
    /// behind a stuck writer.
    pub fn bounded(lock_acquire_timeout_ms: u64) -> Self {
        Self {
            lock_acquire_timeout_ms: Some(lock_acquire_timeout_ms),
            ..Self::default()
        }
    }

    pub fn with_lock_timeout(mut self, timeout_ms: u64) -> Self {
        self.lock_acquire_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_reference_resolution(mut self, enabled: bool) -> Self {
        self.reference_resolution_enabled = enabled;
        self
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_acquire_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), KindbError> {
        if self.default_list_limit == 0 {
            return Err(KindbError::InvalidConfig {
                message: "default_list_limit must be > 0".into(),
            });
        }
        if self.max_list_limit < self.default_list_limit {
            return Err(KindbError::InvalidConfig {
                message: "max_list_limit must be >= default_list_limit".into(),
            });
        }
        if self.max_background_tasks == 0 {
            return Err(KindbError::InvalidConfig {
                message: "max_background_tasks must be > 0".into(),
            });
        }
        if self.analytics_cache_capacity == 0 {
            return Err(KindbError::InvalidConfig {
                message: "analytics_cache_capacity must be > 0".into(),
            });
        }
        if self.lock_acquire_timeout_ms == Some(0) {
            return Err(KindbError::InvalidConfig {
                message: "lock_acquire_timeout_ms must be > 0 when set".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::KindbConfig;
    use crate::error::KindbErrorCode;

    #[test]
    fn default_config_is_valid_and_unbounded() {
        let config = KindbConfig::default();
        config.validate().expect("default config");
        assert!(config.lock_timeout().is_none());
    }

    #[test]
    fn rejects_default_limit_above_max() {
        let config = KindbConfig {
            default_list_limit: 50,
            max_list_limit: 10,
            ..KindbConfig::default()
        };
        let err = config.validate().expect_err("invalid");
        assert_eq!(err.code(), KindbErrorCode::InvalidConfig);
    }

    #[test]
    fn bounded_profile_sets_timeout() {
        let config = KindbConfig::bounded(250);
        assert_eq!(config.lock_timeout().map(|d| d.as_millis()), Some(250));
        assert!(KindbConfig::default().with_lock_timeout(0).validate().is_err());
    }
}
