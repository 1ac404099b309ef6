use crate::resource_key::ResourceKey;
use std::{collections::HashMap, time::Duration};

/// Retry policy for failed reconciliations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BackoffSettings {
    /// Delay of the first retry, doubled with every further failure.
    pub base_delay: Duration,
    /// Upper bound of a single retry delay.
    pub max_delay: Duration,
    /// Number of retries after which an item is dropped.
    pub max_retries: u32,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            max_retries: 15,
        }
    }
}

/// Outcome of a rate limited re-enqueue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Requeue {
    After(Duration),
    /// Retries are exhausted, `attempts` counts all failed reconciliations.
    Dropped { attempts: u32 },
}

/// Per key exponential failure backoff.
pub(crate) struct RateLimiter {
    settings: BackoffSettings,
    failures: HashMap<ResourceKey, u32>,
}

impl RateLimiter {
    pub fn new(settings: BackoffSettings) -> Self {
        Self {
            settings,
            failures: Default::default(),
        }
    }

    pub fn when(&mut self, key: &ResourceKey) -> Requeue {
        let failures = self.failures.get(key).copied().unwrap_or(0);
        if failures >= self.settings.max_retries {
            self.failures.remove(key);
            return Requeue::Dropped {
                attempts: failures.saturating_add(1),
            };
        }
        self.failures.insert(key.clone(), failures + 1);
        let delay = self
            .settings
            .base_delay
            .saturating_mul(2u32.saturating_pow(failures))
            .min(self.settings.max_delay);
        Requeue::After(delay)
    }

    pub fn forget(&mut self, key: &ResourceKey) {
        self.failures.remove(key);
    }

    pub fn num_requeues(&self, key: &ResourceKey) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }
}
