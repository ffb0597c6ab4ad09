use std::time::Duration;

use serde::Deserialize;

use crate::{
    flags::cache::{FeatureFlagCache, NullFeatureFlagCache},
    Client, Error, Properties, Result,
};

/// Configuration for [`Client`].
///
/// # Examples
/// ```
/// # use posthog::ClientConfig;
/// let config = ClientConfig::from_api_key("phc_project_key")
///     .personal_api_key("phx_personal_key")
///     .flush_at(50);
/// ```
pub struct ClientConfig {
    pub(crate) project_api_key: String,
    pub(crate) personal_api_key: Option<String>,
    pub(crate) host: String,
    pub(crate) flush_at: usize,
    pub(crate) max_batch_size: usize,
    pub(crate) max_queue_size: usize,
    pub(crate) flush_interval: Duration,
    pub(crate) feature_flag_poll_interval: Duration,
    pub(crate) feature_flag_poll_jitter: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) max_retries: u32,
    pub(crate) retry_interval: Duration,
    pub(crate) max_retry_delay: Duration,
    pub(crate) feature_flag_sent_cache_size_limit: usize,
    pub(crate) feature_flag_sent_cache_sliding_expiration: Duration,
    pub(crate) feature_flag_sent_cache_compaction: f64,
    pub(crate) super_properties: Properties,
    pub(crate) feature_flag_cache: Box<dyn FeatureFlagCache + Send + Sync>,
}

impl ClientConfig {
    /// Default host for API calls.
    pub const DEFAULT_HOST: &'static str = "https://us.i.posthog.com";
    /// Default configuration section name used by [`ClientConfig::from_json`].
    pub const DEFAULT_SECTION: &'static str = "PostHog";

    /// Default value for [`ClientConfig::flush_at`].
    pub const DEFAULT_FLUSH_AT: usize = 20;
    /// Default value for [`ClientConfig::max_batch_size`].
    pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;
    /// Default value for [`ClientConfig::max_queue_size`].
    pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;
    /// Default value for [`ClientConfig::flush_interval`].
    pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);
    /// Shortest accepted [`ClientConfig::flush_interval`].
    pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(100);
    /// Default value for [`ClientConfig::feature_flag_poll_interval`].
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
    /// Shortest accepted [`ClientConfig::feature_flag_poll_interval`].
    pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);
    /// Default jitter subtracted from the poll interval.
    pub const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(3);
    /// Default value for [`ClientConfig::request_timeout`].
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default value for [`ClientConfig::max_retries`].
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    /// Default value for [`ClientConfig::retry_interval`].
    pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
    /// Default cap on the retry backoff.
    pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
    /// Default value for [`ClientConfig::feature_flag_sent_cache_size_limit`].
    pub const DEFAULT_FEATURE_FLAG_SENT_CACHE_SIZE_LIMIT: usize = 50_000;
    /// Default value for [`ClientConfig::feature_flag_sent_cache_sliding_expiration`].
    pub const DEFAULT_FEATURE_FLAG_SENT_CACHE_SLIDING_EXPIRATION: Duration =
        Duration::from_secs(10 * 60);
    /// Default value for [`ClientConfig::feature_flag_sent_cache_compaction`].
    pub const DEFAULT_FEATURE_FLAG_SENT_CACHE_COMPACTION: f64 = 0.2;

    /// Create a default configuration using the specified project API key.
    ///
    /// ```
    /// # use posthog::ClientConfig;
    /// ClientConfig::from_api_key("phc_project_key");
    /// ```
    pub fn from_api_key(project_api_key: impl Into<String>) -> Self {
        ClientConfig {
            project_api_key: project_api_key.into(),
            personal_api_key: None,
            host: ClientConfig::DEFAULT_HOST.to_owned(),
            flush_at: ClientConfig::DEFAULT_FLUSH_AT,
            max_batch_size: ClientConfig::DEFAULT_MAX_BATCH_SIZE,
            max_queue_size: ClientConfig::DEFAULT_MAX_QUEUE_SIZE,
            flush_interval: ClientConfig::DEFAULT_FLUSH_INTERVAL,
            feature_flag_poll_interval: ClientConfig::DEFAULT_POLL_INTERVAL,
            feature_flag_poll_jitter: ClientConfig::DEFAULT_POLL_JITTER,
            request_timeout: ClientConfig::DEFAULT_REQUEST_TIMEOUT,
            max_retries: ClientConfig::DEFAULT_MAX_RETRIES,
            retry_interval: ClientConfig::DEFAULT_RETRY_INTERVAL,
            max_retry_delay: ClientConfig::DEFAULT_MAX_RETRY_DELAY,
            feature_flag_sent_cache_size_limit:
                ClientConfig::DEFAULT_FEATURE_FLAG_SENT_CACHE_SIZE_LIMIT,
            feature_flag_sent_cache_sliding_expiration:
                ClientConfig::DEFAULT_FEATURE_FLAG_SENT_CACHE_SLIDING_EXPIRATION,
            feature_flag_sent_cache_compaction:
                ClientConfig::DEFAULT_FEATURE_FLAG_SENT_CACHE_COMPACTION,
            super_properties: Properties::new(),
            feature_flag_cache: Box::new(NullFeatureFlagCache),
        }
    }

    /// Create configuration from environment variables.
    ///
    /// Reads `POSTHOG_PROJECT_API_KEY` (required), `POSTHOG_PERSONAL_API_KEY` and `POSTHOG_HOST`.
    pub fn from_env() -> Result<Self> {
        ClientConfig::from_env_with(|name| std::env::var(name).ok())
    }

    fn from_env_with(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let project_api_key = var("POSTHOG_PROJECT_API_KEY")
            .filter(|key| !key.trim().is_empty())
            .ok_or(Error::MissingApiKey)?;

        let mut config = ClientConfig::from_api_key(project_api_key);
        if let Some(personal_api_key) = var("POSTHOG_PERSONAL_API_KEY") {
            config = config.personal_api_key(personal_api_key);
        }
        if let Some(host) = var("POSTHOG_HOST") {
            config = config.host(host);
        }
        Ok(config)
    }

    /// Bind configuration from the [`DEFAULT_SECTION`](ClientConfig::DEFAULT_SECTION) of a JSON
    /// settings document.
    ///
    /// ```
    /// # use posthog::ClientConfig;
    /// let config = ClientConfig::from_json(r#"{
    ///     "PostHog": { "projectApiKey": "phc_project_key", "flushAt": 10 }
    /// }"#).unwrap();
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        ClientConfig::from_json_section(json, ClientConfig::DEFAULT_SECTION)
    }

    /// Bind configuration from the named section of a JSON settings document.
    pub fn from_json_section(json: &str, section: &str) -> Result<Self> {
        let mut document: serde_json::Value =
            serde_json::from_str(json).map_err(|err| Error::InvalidSettings(err.to_string()))?;
        let section_value = document
            .get_mut(section)
            .map(serde_json::Value::take)
            .ok_or_else(|| Error::InvalidSettings(format!("missing section {section:?}")))?;
        let settings: ClientSettings = serde_json::from_value(section_value)
            .map_err(|err| Error::InvalidSettings(err.to_string()))?;
        ClientConfig::from_settings(settings)
    }

    /// Create configuration from deserialized settings.
    pub fn from_settings(settings: ClientSettings) -> Result<Self> {
        let project_api_key = settings
            .project_api_key
            .filter(|key| !key.trim().is_empty())
            .ok_or(Error::MissingApiKey)?;

        let mut config = ClientConfig::from_api_key(project_api_key);
        config.personal_api_key = settings.personal_api_key;
        if let Some(host) = settings.host {
            config.host = host;
        }
        if let Some(flush_at) = settings.flush_at {
            config.flush_at = flush_at;
        }
        if let Some(max_batch_size) = settings.max_batch_size {
            config.max_batch_size = max_batch_size;
        }
        if let Some(max_queue_size) = settings.max_queue_size {
            config.max_queue_size = max_queue_size;
        }
        if let Some(ms) = settings.flush_interval_ms {
            config.flush_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = settings.feature_flag_poll_interval_ms {
            config.feature_flag_poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = settings.feature_flag_poll_jitter_ms {
            config.feature_flag_poll_jitter = Duration::from_millis(ms);
        }
        if let Some(ms) = settings.request_timeout_ms {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(max_retries) = settings.max_retries {
            config.max_retries = max_retries;
        }
        if let Some(ms) = settings.retry_interval_ms {
            config.retry_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = settings.max_retry_delay_ms {
            config.max_retry_delay = Duration::from_millis(ms);
        }
        if let Some(limit) = settings.feature_flag_sent_cache_size_limit {
            config.feature_flag_sent_cache_size_limit = limit;
        }
        if let Some(ms) = settings.feature_flag_sent_cache_sliding_expiration_ms {
            config.feature_flag_sent_cache_sliding_expiration = Duration::from_millis(ms);
        }
        if let Some(compaction) = settings.feature_flag_sent_cache_compaction {
            config.feature_flag_sent_cache_compaction = compaction;
        }
        config.super_properties = settings.super_properties;
        Ok(config)
    }

    /// Set personal API key. Required for local feature flag evaluation and remote config
    /// payloads.
    pub fn personal_api_key(mut self, personal_api_key: impl Into<String>) -> Self {
        self.personal_api_key = Some(personal_api_key.into());
        self
    }

    /// Override host for API calls, e.g. `https://eu.i.posthog.com` or a self-hosted instance.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Number of queued events that triggers a flush.
    pub fn flush_at(mut self, flush_at: usize) -> Self {
        self.flush_at = flush_at;
        self
    }

    /// Maximum number of events sent in a single batch request.
    pub fn max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Maximum number of events held in memory. Events captured while the queue is full are
    /// dropped.
    pub fn max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Interval between periodic flushes. Shorter values are raised to
    /// [`ClientConfig::MIN_FLUSH_INTERVAL`].
    pub fn flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Interval between requests for local evaluation flag definitions. Shorter values are
    /// raised to [`ClientConfig::MIN_POLL_INTERVAL`].
    pub fn feature_flag_poll_interval(mut self, interval: Duration) -> Self {
        self.feature_flag_poll_interval = interval;
        self
    }

    /// Randomized duration subtracted from the poll interval. At most half the interval.
    pub fn feature_flag_poll_jitter(mut self, jitter: Duration) -> Self {
        self.feature_flag_poll_jitter = jitter;
        self
    }

    /// Timeout applied to every HTTP request.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Number of times a batch is retried after a retryable failure.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Base delay of the exponential retry backoff.
    pub fn retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Upper bound of the retry backoff.
    pub fn max_retry_delay(mut self, max_retry_delay: Duration) -> Self {
        self.max_retry_delay = max_retry_delay;
        self
    }

    /// Maximum number of remembered `$feature_flag_called` events.
    pub fn feature_flag_sent_cache_size_limit(mut self, limit: usize) -> Self {
        self.feature_flag_sent_cache_size_limit = limit;
        self
    }

    /// How long a remembered `$feature_flag_called` event suppresses duplicates after last use.
    pub fn feature_flag_sent_cache_sliding_expiration(mut self, expiration: Duration) -> Self {
        self.feature_flag_sent_cache_sliding_expiration = expiration;
        self
    }

    /// Fraction of oldest entries evicted when the sent cache is full.
    pub fn feature_flag_sent_cache_compaction(mut self, fraction: f64) -> Self {
        self.feature_flag_sent_cache_compaction = fraction;
        self
    }

    /// Properties added to every captured event. Event properties take precedence.
    pub fn super_properties(mut self, properties: Properties) -> Self {
        self.super_properties = properties;
        self
    }

    /// Cache used for remote feature flag results.
    ///
    /// ```
    /// # use posthog::{ClientConfig, RequestScopedFeatureFlagCache, ThreadLocalScopeAccessor};
    /// let config = ClientConfig::from_api_key("phc_project_key")
    ///     .feature_flag_cache(RequestScopedFeatureFlagCache::new(ThreadLocalScopeAccessor));
    /// ```
    pub fn feature_flag_cache(mut self, cache: impl FeatureFlagCache + Send + Sync + 'static) -> Self {
        self.feature_flag_cache = Box::new(cache);
        self
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// The client starts a background thread that flushes captured events.
    pub fn to_client(self) -> Result<Client> {
        Client::new(self)
    }

    /// Check required settings and clamp sizes and intervals to usable values.
    pub(crate) fn validate(mut self) -> Result<Self> {
        if self.project_api_key.trim().is_empty() {
            return Err(Error::MissingApiKey);
        }
        url::Url::parse(&self.host).map_err(Error::InvalidHostUrl)?;

        self.max_queue_size = self.max_queue_size.max(1);
        self.max_batch_size = self.max_batch_size.max(1);
        self.flush_at = self.flush_at.clamp(1, self.max_queue_size);
        self.flush_interval = self.flush_interval.max(Self::MIN_FLUSH_INTERVAL);
        self.feature_flag_poll_interval =
            self.feature_flag_poll_interval.max(Self::MIN_POLL_INTERVAL);
        self.feature_flag_poll_jitter =
            self.feature_flag_poll_jitter.min(self.feature_flag_poll_interval / 2);
        self.feature_flag_sent_cache_compaction =
            self.feature_flag_sent_cache_compaction.clamp(0.0, 1.0);
        Ok(self)
    }
}

/// Bindable settings for [`ClientConfig`], e.g. a section of an application settings file.
///
/// Durations are given in milliseconds. Absent fields keep their defaults.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Project API key.
    pub project_api_key: Option<String>,
    /// Personal API key.
    pub personal_api_key: Option<String>,
    /// API host.
    #[serde(alias = "hostUrl")]
    pub host: Option<String>,
    /// See [`ClientConfig::flush_at`].
    pub flush_at: Option<usize>,
    /// See [`ClientConfig::max_batch_size`].
    pub max_batch_size: Option<usize>,
    /// See [`ClientConfig::max_queue_size`].
    pub max_queue_size: Option<usize>,
    /// See [`ClientConfig::flush_interval`].
    pub flush_interval_ms: Option<u64>,
    /// See [`ClientConfig::feature_flag_poll_interval`].
    pub feature_flag_poll_interval_ms: Option<u64>,
    /// See [`ClientConfig::feature_flag_poll_jitter`].
    pub feature_flag_poll_jitter_ms: Option<u64>,
    /// See [`ClientConfig::request_timeout`].
    pub request_timeout_ms: Option<u64>,
    /// See [`ClientConfig::max_retries`].
    pub max_retries: Option<u32>,
    /// See [`ClientConfig::retry_interval`].
    pub retry_interval_ms: Option<u64>,
    /// See [`ClientConfig::max_retry_delay`].
    pub max_retry_delay_ms: Option<u64>,
    /// See [`ClientConfig::feature_flag_sent_cache_size_limit`].
    pub feature_flag_sent_cache_size_limit: Option<usize>,
    /// See [`ClientConfig::feature_flag_sent_cache_sliding_expiration`].
    pub feature_flag_sent_cache_sliding_expiration_ms: Option<u64>,
    /// See [`ClientConfig::feature_flag_sent_cache_compaction`].
    pub feature_flag_sent_cache_compaction: Option<f64>,
    /// See [`ClientConfig::super_properties`].
    pub super_properties: Properties,
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use serde_json::json;

    use super::ClientConfig;
    use crate::Error;

    #[test]
    fn binds_settings_section() {
        let config = ClientConfig::from_json(
            r#"{
                "Logging": { "level": "debug" },
                "PostHog": {
                    "projectApiKey": "phc_key",
                    "personalApiKey": "phx_key",
                    "hostUrl": "https://eu.i.posthog.com",
                    "flushAt": 5,
                    "flushIntervalMs": 1500,
                    "superProperties": { "service": "checkout" }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.project_api_key, "phc_key");
        assert_eq!(config.personal_api_key.as_deref(), Some("phx_key"));
        assert_eq!(config.host, "https://eu.i.posthog.com");
        assert_eq!(config.flush_at, 5);
        assert_eq!(config.flush_interval, Duration::from_millis(1500));
        assert_eq!(config.max_batch_size, ClientConfig::DEFAULT_MAX_BATCH_SIZE);
        assert_eq!(config.super_properties["service"], json!("checkout"));
    }

    #[test]
    fn binds_retry_and_jitter_settings() {
        let config = ClientConfig::from_json(
            r#"{
                "PostHog": {
                    "projectApiKey": "phc_key",
                    "retryIntervalMs": 250,
                    "maxRetryDelayMs": 4000,
                    "featureFlagPollJitterMs": 500
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.retry_interval, Duration::from_millis(250));
        assert_eq!(config.max_retry_delay, Duration::from_millis(4000));
        assert_eq!(config.feature_flag_poll_jitter, Duration::from_millis(500));
    }

    #[test]
    fn missing_section_is_an_error() {
        let result = ClientConfig::from_json(r#"{ "Other": {} }"#);
        assert!(matches!(result, Err(Error::InvalidSettings(_))));
    }

    #[test]
    fn missing_api_key_is_an_error() {
        let result = ClientConfig::from_json(r#"{ "PostHog": { "flushAt": 1 } }"#);
        assert!(matches!(result, Err(Error::MissingApiKey)));
    }

    #[test]
    fn reads_environment() {
        let env = HashMap::from([
            ("POSTHOG_PROJECT_API_KEY", "phc_env"),
            ("POSTHOG_HOST", "http://localhost:8000"),
        ]);
        let config =
            ClientConfig::from_env_with(|name| env.get(name).map(|v| v.to_string())).unwrap();

        assert_eq!(config.project_api_key, "phc_env");
        assert_eq!(config.host, "http://localhost:8000");
        assert!(config.personal_api_key.is_none());

        let result = ClientConfig::from_env_with(|_| None);
        assert!(matches!(result, Err(Error::MissingApiKey)));
    }

    #[test]
    fn validate_clamps_sizes() {
        let config = ClientConfig::from_api_key("phc_key")
            .flush_at(5000)
            .max_queue_size(0)
            .max_batch_size(0)
            .validate()
            .unwrap();

        assert_eq!(config.max_queue_size, 1);
        assert_eq!(config.max_batch_size, 1);
        assert_eq!(config.flush_at, 1);
    }

    #[test]
    fn validate_clamps_intervals() {
        let config = ClientConfig::from_json(
            r#"{ "PostHog": { "projectApiKey": "phc_key", "flushIntervalMs": 0 } }"#,
        )
        .unwrap()
        .feature_flag_poll_interval(Duration::ZERO)
        .feature_flag_poll_jitter(Duration::ZERO)
        .validate()
        .unwrap();

        assert_eq!(config.flush_interval, ClientConfig::MIN_FLUSH_INTERVAL);
        assert_eq!(config.feature_flag_poll_interval, ClientConfig::MIN_POLL_INTERVAL);

        let config = ClientConfig::from_api_key("phc_key")
            .feature_flag_poll_interval(Duration::from_secs(4))
            .feature_flag_poll_jitter(Duration::from_secs(10))
            .validate()
            .unwrap();
        assert_eq!(config.feature_flag_poll_jitter, Duration::from_secs(2));

        let config = ClientConfig::from_api_key("phc_key")
            .flush_interval(Duration::from_secs(5))
            .validate()
            .unwrap();
        assert_eq!(config.flush_interval, Duration::from_secs(5));
    }

    #[test]
    fn validate_rejects_bad_host() {
        let result = ClientConfig::from_api_key("phc_key").host("not a url").validate();
        assert!(matches!(result, Err(Error::InvalidHostUrl(_))));

        let result = ClientConfig::from_api_key("  ").validate();
        assert!(matches!(result, Err(Error::MissingApiKey)));
    }
}
