// ── Controller configuration ──

use std::time::Duration;

use conveyor_client::{ParamMap, Parameter, Settings};

use crate::error::CoreError;

const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Everything a controller needs besides its clients and handlers.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Handed to every client constructor.
    pub settings: Settings,
    /// `None` means unbounded.
    pub queue_capacity: Option<usize>,
    /// Wait after an empty pull.
    pub idle_backoff: Duration,
    /// Wait between checks while a refresh is in progress.
    pub refresh_backoff: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            settings: Settings::new(),
            queue_capacity: None,
            idle_backoff: DEFAULT_BACKOFF,
            refresh_backoff: DEFAULT_BACKOFF,
        }
    }
}

impl ControllerConfig {
    /// Read `QUEUE_MAX_SIZE`, `LISTEN_BACKOFF_MS` and `REFRESH_BACKOFF_MS`
    /// from the settings, keeping the settings for the clients.
    pub fn from_settings(settings: Settings) -> Result<Self, CoreError> {
        let params = ParamMap::new([
            ("queue_max_size", Parameter::unsigned("QUEUE_MAX_SIZE").with_default(0)),
            ("listen_backoff_ms", Parameter::unsigned("LISTEN_BACKOFF_MS").with_default(1000)),
            ("refresh_backoff_ms", Parameter::unsigned("REFRESH_BACKOFF_MS").with_default(1000)),
        ])
        .resolve(&settings)?;

        let capacity = usize::try_from(params.require_u64("queue_max_size")?).map_err(|_| {
            CoreError::ValidationFailed {
                message: "QUEUE_MAX_SIZE does not fit in memory".into(),
            }
        })?;

        Ok(Self {
            queue_capacity: (capacity > 0).then_some(capacity),
            idle_backoff: Duration::from_millis(params.require_u64("listen_backoff_ms")?),
            refresh_backoff: Duration::from_millis(params.require_u64("refresh_backoff_ms")?),
            settings,
        })
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: Option<usize>) -> Self {
        self.queue_capacity = capacity.filter(|c| *c > 0);
        self
    }

    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }

    pub fn with_refresh_backoff(mut self, backoff: Duration) -> Self {
        self.refresh_backoff = backoff;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_settings() {
        let config = ControllerConfig::from_settings(Settings::new()).expect("defaults");
        assert_eq!(config.queue_capacity, None);
        assert_eq!(config.idle_backoff, Duration::from_secs(1));
        assert_eq!(config.refresh_backoff, Duration::from_secs(1));
    }

    #[test]
    fn reads_queue_size_and_backoffs() {
        let settings = Settings::new()
            .with("queue_max_size", "25")
            .with("LISTEN_BACKOFF_MS", 10)
            .with("DB_PATH", "/tmp/app.db");
        let config = ControllerConfig::from_settings(settings).expect("valid");
        assert_eq!(config.queue_capacity, Some(25));
        assert_eq!(config.idle_backoff, Duration::from_millis(10));
        assert!(config.settings.contains_key("DB_PATH"));
    }

    #[test]
    fn rejects_negative_queue_size() {
        let err = ControllerConfig::from_settings(Settings::new().with("QUEUE_MAX_SIZE", -1))
            .expect_err("negative size");
        assert!(err.is_validation());
    }
}
