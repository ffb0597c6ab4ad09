use std::sync::{Arc, Mutex, RwLock};

use crate::{
    api_client::ApiClient,
    batch::{BatchEventQueue, PushOutcome},
    event::{
        CapturedEvent, CREATE_ALIAS_EVENT, FEATURE_FLAG_CALLED_EVENT, GROUP_IDENTIFY_EVENT,
        IDENTIFY_EVENT,
    },
    flags::{
        cache::{FeatureFlagCache, FlagCacheKey},
        eval::Subject,
        models::decode_payload,
        poller::{self, PollerStopHandle, PollerThread, PollerThreadConfig},
        sent::FeatureFlagSentCache,
        store::LocalFlagsStore,
        FeatureFlag, FeatureFlagValue, FeatureFlags, FlagOptions,
    },
    flusher::{FlusherConfig, FlusherThread, RetryPolicy},
    ClientConfig, Error, Event, Groups, Properties, Result,
};

/// A client for PostHog product analytics and feature flags.
///
/// Events are queued and sent in batches by a background thread. Call [`Client::flush`] to send
/// them right away and [`Client::shutdown`] (or drop the client) before the process exits.
///
/// Feature flags are evaluated locally once definitions are loaded (see
/// [`Client::start_poller_thread`] and [`Client::load_feature_flags`]), and by the server
/// otherwise.
pub struct Client {
    api: Arc<ApiClient>,
    queue: BatchEventQueue,
    /// `None` once the client is shut down.
    flusher: RwLock<Option<FlusherThread>>,
    local_flags: Arc<LocalFlagsStore>,
    pollers: Mutex<Vec<PollerStopHandle>>,
    poller_config: PollerThreadConfig,
    feature_flag_cache: Box<dyn FeatureFlagCache + Send + Sync>,
    sent_flags: FeatureFlagSentCache,
    super_properties: Properties,
}

impl Client {
    /// Create a new `Client` using the specified configuration.
    ///
    /// ```no_run
    /// use posthog::{Client, ClientConfig};
    /// let client = Client::new(ClientConfig::from_api_key("phc_project_api_key"))?;
    /// # Ok::<(), posthog::Error>(())
    /// ```
    ///
    /// # Errors
    ///
    /// - [`Error::MissingApiKey`] and [`Error::InvalidHostUrl`] for invalid configuration.
    /// - [`Error::Io`] if the flusher thread failed to start.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let config = config.validate()?;
        let api = Arc::new(ApiClient::new(&config)?);
        let queue = BatchEventQueue::new(config.flush_at, config.max_batch_size, config.max_queue_size);

        let flusher = FlusherThread::start(
            Arc::clone(&api),
            queue.clone(),
            FlusherConfig {
                flush_interval: config.flush_interval,
                retry: RetryPolicy {
                    max_retries: config.max_retries,
                    retry_interval: config.retry_interval,
                    max_retry_delay: config.max_retry_delay,
                },
            },
        )?;

        Ok(Client {
            api,
            queue,
            flusher: RwLock::new(Some(flusher)),
            local_flags: Arc::new(LocalFlagsStore::new()),
            pollers: Mutex::new(Vec::new()),
            poller_config: PollerThreadConfig {
                interval: config.feature_flag_poll_interval,
                jitter: config.feature_flag_poll_jitter,
            },
            feature_flag_cache: config.feature_flag_cache,
            sent_flags: FeatureFlagSentCache::new(
                config.feature_flag_sent_cache_size_limit,
                config.feature_flag_sent_cache_sliding_expiration,
                config.feature_flag_sent_cache_compaction,
            ),
            super_properties: config.super_properties,
        })
    }

    /// Queue `event` for sending.
    ///
    /// A full queue drops the event with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] after [`Client::shutdown`].
    pub fn capture(&self, mut event: Event) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::Shutdown);
        }
        if event.send_feature_flags {
            self.add_feature_flag_properties(&mut event);
        }
        let event = CapturedEvent::from_event(event, &self.super_properties);

        let flusher = self.flusher.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(flusher) = flusher.as_ref() else {
            return Err(Error::Shutdown);
        };

        log::trace!(target: "posthog", event = event.event.as_str(), distinct_id = event.distinct_id.as_str(); "queueing event");
        match self.queue.push(event) {
            PushOutcome::Queued { should_flush } => {
                if should_flush {
                    flusher.trigger();
                }
            }
            PushOutcome::Dropped => {
                log::warn!(target: "posthog", queue_size = self.queue.len(); "event queue is full, dropping event");
            }
        }
        Ok(())
    }

    fn is_shut_down(&self) -> bool {
        self.flusher
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }

    /// Attach `$feature/<key>` and `$active_feature_flags` from the user's current flags.
    fn add_feature_flag_properties(&self, event: &mut Event) {
        let options = FlagOptions::new()
            .groups(event.groups.clone())
            .send_feature_flag_events(false);
        let flags = match self.get_all_feature_flags(&event.distinct_id, &options) {
            Ok(flags) => flags,
            Err(err) => {
                log::warn!(target: "posthog", event = event.event.as_str(); "cannot attach feature flags to event: {err}");
                return;
            }
        };

        let mut active: Vec<&str> = flags
            .values()
            .filter(|flag| flag.is_enabled())
            .map(|flag| flag.key.as_str())
            .collect();
        active.sort_unstable();
        let active: serde_json::Value = active.into();

        for flag in flags.values() {
            event
                .properties
                .entry(format!("$feature/{}", flag.key))
                .or_insert_with(|| (&flag.value).into());
        }
        event
            .properties
            .entry("$active_feature_flags".to_owned())
            .or_insert(active);
    }

    /// Set properties of a person.
    ///
    /// `set` overwrites existing values, `set_once` only fills in missing ones.
    pub fn identify(&self, distinct_id: &str, set: Properties, set_once: Properties) -> Result<()> {
        let mut event = Event::new(IDENTIFY_EVENT, distinct_id)
            .property("$set", serde_json::Value::Object(set.into_iter().collect()));
        if !set_once.is_empty() {
            event = event.property(
                "$set_once",
                serde_json::Value::Object(set_once.into_iter().collect()),
            );
        }
        self.capture(event)
    }

    /// Make `alias` another distinct id of the person known as `distinct_id`.
    pub fn alias(&self, distinct_id: &str, alias: &str) -> Result<()> {
        self.capture(
            Event::new(CREATE_ALIAS_EVENT, distinct_id)
                .property("distinct_id", distinct_id)
                .property("alias", alias),
        )
    }

    /// Set properties of a group.
    ///
    /// Unlike other events, this one is sent immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the server could not be reached or rejected the event.
    pub fn group_identify(
        &self,
        group_type: &str,
        group_key: &str,
        properties: Properties,
    ) -> Result<()> {
        let event = Event::new(GROUP_IDENTIFY_EVENT, format!("${group_type}_{group_key}"))
            .property("$group_type", group_type)
            .property("$group_key", group_key)
            .property(
                "$group_set",
                serde_json::Value::Object(properties.into_iter().collect()),
            );
        self.api
            .send_event(&CapturedEvent::from_event(event, &self.super_properties))
    }

    /// Evaluate feature flag `key` for `distinct_id`.
    ///
    /// Returns `Ok(None)` if the flag does not exist (or could not be evaluated locally when
    /// [`FlagOptions::only_evaluate_locally`] is set).
    ///
    /// # Errors
    ///
    /// Returns an error if the server had to be asked and the request failed.
    pub fn get_feature_flag(
        &self,
        key: &str,
        distinct_id: &str,
        options: &FlagOptions,
    ) -> Result<Option<FeatureFlag>> {
        let (flag, locally_evaluated) = self.evaluate_flag(key, distinct_id, options)?;
        if options.send_feature_flag_events {
            self.report_flag_called(key, distinct_id, &options.groups, flag.as_ref(), locally_evaluated);
        }
        Ok(flag)
    }

    /// Return `true` if flag `key` is enabled for `distinct_id`. Unknown flags are disabled.
    pub fn is_feature_enabled(
        &self,
        key: &str,
        distinct_id: &str,
        options: &FlagOptions,
    ) -> Result<bool> {
        Ok(self
            .get_feature_flag(key, distinct_id, options)?
            .is_some_and(|flag| flag.is_enabled()))
    }

    /// Payload attached to the value flag `key` evaluates to for `distinct_id`.
    pub fn get_feature_flag_payload(
        &self,
        key: &str,
        distinct_id: &str,
        options: &FlagOptions,
    ) -> Result<Option<serde_json::Value>> {
        Ok(self
            .get_feature_flag(key, distinct_id, options)?
            .and_then(|flag| flag.payload))
    }

    /// Evaluate all flags for `distinct_id`.
    ///
    /// Flags that cannot be evaluated locally are evaluated by the server, whose results take
    /// precedence. No `$feature_flag_called` events are captured.
    pub fn get_all_feature_flags(
        &self,
        distinct_id: &str,
        options: &FlagOptions,
    ) -> Result<FeatureFlags> {
        let (mut flags, fallback_to_server) = match self.local_flags.get() {
            Some(evaluator) => {
                let subject = Subject::new(distinct_id, &options.person_properties, &options.groups);
                evaluator.evaluate_all(&subject)
            }
            None => (FeatureFlags::new(), true),
        };

        if fallback_to_server && !options.only_evaluate_locally {
            match self.remote_flags(distinct_id, options) {
                Ok(remote) => {
                    flags.extend(remote.iter().map(|(key, flag)| (key.clone(), flag.clone())));
                }
                Err(err) if !flags.is_empty() => {
                    log::warn!(target: "posthog", distinct_id; "returning locally evaluated flags only: {err}");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(flags)
    }

    /// Fetch the decrypted payload of a remote config flag. Requires a personal API key.
    pub fn get_remote_config_payload(&self, key: &str) -> Result<Option<serde_json::Value>> {
        self.api.remote_config_payload(key)
    }

    /// Fetch flag definitions for local evaluation once.
    ///
    /// # Errors
    ///
    /// - [`Error::PersonalApiKeyRequired`] without a personal API key.
    /// - [`Error::QuotaLimited`] if the project is over its quota. Previously loaded definitions
    ///   are discarded.
    pub fn load_feature_flags(&self) -> Result<()> {
        poller::load_flags(&self.api, &self.local_flags)
    }

    /// Start a poller thread that keeps flag definitions for local evaluation up to date.
    ///
    /// The poller is stopped by [`Client::shutdown`] or by [`PollerThread::stop`]. Dropping the
    /// returned handle does not stop it, so the handle may be discarded when the client's
    /// lifetime should govern polling.
    pub fn start_poller_thread(&self) -> Result<PollerThread> {
        let poller = PollerThread::start(
            Arc::clone(&self.api),
            Arc::clone(&self.local_flags),
            self.poller_config.clone(),
        )?;
        self.pollers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(poller.stop_handle());
        Ok(poller)
    }

    /// Send all queued events and wait until done.
    pub fn flush(&self) -> Result<()> {
        let flusher = self.flusher.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        match flusher.as_ref() {
            Some(flusher) => flusher.flush(),
            None => Err(Error::Shutdown),
        }
    }

    /// Send queued events and stop background threads. Further captures fail with
    /// [`Error::Shutdown`].
    pub fn shutdown(&self) -> Result<()> {
        for poller in self
            .pollers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
        {
            poller.stop();
        }

        let flusher = self
            .flusher
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match flusher {
            Some(flusher) => flusher.shutdown(),
            None => Ok(()),
        }
    }

    /// Evaluate a single flag, returning it and whether it was evaluated locally.
    fn evaluate_flag(
        &self,
        key: &str,
        distinct_id: &str,
        options: &FlagOptions,
    ) -> Result<(Option<FeatureFlag>, bool)> {
        if let Some(evaluator) = self.local_flags.get() {
            let subject = Subject::new(distinct_id, &options.person_properties, &options.groups);
            match evaluator.evaluate(key, &subject) {
                Ok(Some(flag)) => {
                    log::trace!(target: "posthog", flag_key = key, distinct_id, value:% = flag.value; "evaluated flag locally");
                    return Ok((Some(flag), true));
                }
                Ok(None) => {
                    log::debug!(target: "posthog", flag_key = key; "flag is not defined locally");
                }
                Err(err) => {
                    log::debug!(target: "posthog", flag_key = key, distinct_id; "{err}");
                }
            }
        }

        if options.only_evaluate_locally {
            return Ok((None, false));
        }

        let flags = self.remote_flags(distinct_id, options)?;
        Ok((flags.get(key).cloned(), false))
    }

    fn remote_flags(&self, distinct_id: &str, options: &FlagOptions) -> Result<Arc<FeatureFlags>> {
        let key = FlagCacheKey::new(distinct_id, &options.person_properties, &options.groups);
        self.feature_flag_cache
            .get_or_fetch(&key, &|| self.decide(distinct_id, options))
    }

    fn decide(&self, distinct_id: &str, options: &FlagOptions) -> Result<FeatureFlags> {
        let response = self
            .api
            .decide(distinct_id, &options.person_properties, &options.groups)?;

        if response.is_feature_flags_quota_limited() {
            log::warn!(target: "posthog", "feature flags are quota limited, returning no flags");
            return Ok(FeatureFlags::new());
        }
        if response.errors_while_computing_flags {
            log::warn!(target: "posthog", distinct_id; "server reported errors while computing flags");
        }

        let mut payloads = response.feature_flag_payloads;
        Ok(response
            .feature_flags
            .into_iter()
            .map(|(key, value)| {
                let payload = payloads.remove(&key).map(|payload| decode_payload(&payload));
                (key.clone(), FeatureFlag { key, value, payload })
            })
            .collect())
    }

    fn report_flag_called(
        &self,
        key: &str,
        distinct_id: &str,
        groups: &Groups,
        flag: Option<&FeatureFlag>,
        locally_evaluated: bool,
    ) {
        let response = flag.map(|flag| &flag.value);
        let response_key = response.map_or_else(|| "null".to_owned(), FeatureFlagValue::to_string);
        if !self.sent_flags.should_report(distinct_id, key, &response_key) {
            return;
        }

        let response: serde_json::Value = response.map_or(serde_json::Value::Null, Into::into);
        let event = Event::new(FEATURE_FLAG_CALLED_EVENT, distinct_id)
            .property("$feature_flag", key)
            .property("$feature_flag_response", response.clone())
            .property("locally_evaluated", locally_evaluated)
            .property(format!("$feature/{key}"), response)
            .groups(groups.clone());
        if let Err(err) = self.capture(event) {
            log::warn!(target: "posthog", flag_key = key; "cannot capture feature flag call: {err}");
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::warn!(target: "posthog", "error shutting down client: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::Client;
    use crate::{
        flags::{eval::LocalEvaluator, models::LocalEvaluationResponse},
        ClientConfig, Error, Event, FeatureFlagValue, FlagOptions, Group, Properties,
    };

    // Nothing listens on the discard port, so the final flush on drop fails fast.
    fn config() -> ClientConfig {
        ClientConfig::from_api_key("phc_test")
            .host("http://127.0.0.1:9")
            .flush_at(100)
            .flush_interval(Duration::from_secs(3600))
            .max_retries(0)
    }

    fn client_with_flags(config: ClientConfig) -> Client {
        let client = Client::new(config).unwrap();
        let response: LocalEvaluationResponse = serde_json::from_value(json!({
            "flags": [
                {
                    "id": 1,
                    "key": "simple-flag",
                    "active": true,
                    "filters": {"groups": [{"properties": [], "rollout_percentage": 100}]}
                },
                {
                    "id": 2,
                    "key": "beta-feature",
                    "active": true,
                    "filters": {
                        "groups": [{
                            "properties": [{"key": "plan", "value": ["enterprise"], "operator": "exact", "type": "person"}],
                            "rollout_percentage": 100
                        }],
                        "payloads": {"true": "{\"color\": \"blue\"}"}
                    }
                },
                {
                    "id": 3,
                    "key": "disabled-flag",
                    "active": false,
                    "filters": {"groups": [{"properties": [], "rollout_percentage": 100}]}
                }
            ],
            "group_type_mapping": {},
            "cohorts": {}
        }))
        .unwrap();
        client.local_flags.set(LocalEvaluator::from_response(response));
        client
    }

    fn queued(client: &Client) -> Vec<crate::CapturedEvent> {
        let mut events = Vec::new();
        loop {
            let batch = client.queue.next_batch();
            if batch.is_empty() {
                return events;
            }
            events.extend(batch);
        }
    }

    #[test]
    fn rejects_empty_api_key() {
        assert!(matches!(
            Client::new(ClientConfig::from_api_key(" ")),
            Err(Error::MissingApiKey)
        ));
    }

    #[test]
    fn capture_adds_super_properties() {
        let mut super_properties = Properties::new();
        super_properties.insert("app".to_owned(), json!("web"));
        let client = Client::new(config().super_properties(super_properties)).unwrap();

        client
            .capture(Event::new("signed up", "user-1").property("plan", "pro"))
            .unwrap();

        let events = queued(&client);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].properties["app"], json!("web"));
        assert_eq!(events[0].properties["plan"], json!("pro"));
        assert_eq!(events[0].properties["$lib"], json!("posthog-rust"));
    }

    #[test]
    fn identify_and_alias() {
        let client = Client::new(config()).unwrap();
        let mut set = Properties::new();
        set.insert("email".to_owned(), json!("user@example.com"));

        client.identify("user-1", set, Properties::new()).unwrap();
        client.alias("user-1", "anonymous-1").unwrap();

        let events = queued(&client);
        assert_eq!(events[0].event, "$identify");
        assert_eq!(events[0].properties["$set"], json!({"email": "user@example.com"}));
        assert!(!events[0].properties.contains_key("$set_once"));
        assert_eq!(events[1].event, "$create_alias");
        assert_eq!(events[1].properties["alias"], json!("anonymous-1"));
        assert_eq!(events[1].properties["distinct_id"], json!("user-1"));
    }

    #[test]
    fn capture_after_shutdown_fails() {
        let client = Client::new(config()).unwrap();
        client.shutdown().unwrap();

        assert!(matches!(
            client.capture(Event::new("late", "user")),
            Err(Error::Shutdown)
        ));
        assert!(matches!(client.flush(), Err(Error::Shutdown)));
        // Shutting down twice is fine.
        client.shutdown().unwrap();
    }

    #[test]
    fn evaluates_locally() {
        let client = client_with_flags(config());
        let options = FlagOptions::new()
            .person_property("plan", "enterprise")
            .only_evaluate_locally(true)
            .send_feature_flag_events(false);

        assert!(client.is_feature_enabled("simple-flag", "user-1", &options).unwrap());
        assert!(client.is_feature_enabled("beta-feature", "user-1", &options).unwrap());
        assert!(!client.is_feature_enabled("disabled-flag", "user-1", &options).unwrap());
        assert_eq!(
            client
                .get_feature_flag_payload("beta-feature", "user-1", &options)
                .unwrap(),
            Some(json!({"color": "blue"}))
        );
        assert!(client
            .get_feature_flag("missing-flag", "user-1", &options)
            .unwrap()
            .is_none());
        assert!(queued(&client).is_empty());
    }

    #[test]
    fn inconclusive_flag_is_unknown_when_only_evaluating_locally() {
        let client = client_with_flags(config());
        // `plan` is missing, so the condition cannot be decided locally.
        let options = FlagOptions::new().only_evaluate_locally(true);

        assert!(client
            .get_feature_flag("beta-feature", "user-1", &options)
            .unwrap()
            .is_none());
    }

    #[test]
    fn feature_flag_called_is_deduplicated() {
        let client = client_with_flags(config());
        let options = FlagOptions::new()
            .group(Group::new("company", "acme"))
            .only_evaluate_locally(true);

        client.get_feature_flag("simple-flag", "user-1", &options).unwrap();
        client.get_feature_flag("simple-flag", "user-1", &options).unwrap();
        client.get_feature_flag("simple-flag", "user-2", &options).unwrap();

        let events = queued(&client);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "$feature_flag_called");
        assert_eq!(events[0].distinct_id, "user-1");
        assert_eq!(events[0].properties["$feature_flag"], json!("simple-flag"));
        assert_eq!(events[0].properties["$feature_flag_response"], json!(true));
        assert_eq!(events[0].properties["$feature/simple-flag"], json!(true));
        assert_eq!(events[0].properties["locally_evaluated"], json!(true));
        assert_eq!(events[0].properties["$groups"], json!({"company": "acme"}));
        assert_eq!(events[1].distinct_id, "user-2");
    }

    #[test]
    fn all_flags_locally() {
        let client = client_with_flags(config());
        let options = FlagOptions::new()
            .person_property("plan", "enterprise")
            .only_evaluate_locally(true);

        let flags = client.get_all_feature_flags("user-1", &options).unwrap();

        assert_eq!(flags.len(), 3);
        assert_eq!(flags["simple-flag"].value, FeatureFlagValue::Boolean(true));
        assert_eq!(flags["disabled-flag"].value, FeatureFlagValue::Boolean(false));
    }

    #[test]
    fn capture_with_feature_flags() {
        let client = client_with_flags(config());

        client
            .capture(
                Event::new("purchase", "user-1")
                    .property("plan", "enterprise")
                    .send_feature_flags(true),
            )
            .unwrap();

        let events = queued(&client);
        assert_eq!(events.len(), 1);
        let properties = &events[0].properties;
        assert_eq!(properties["$feature/simple-flag"], json!(true));
        assert_eq!(properties["$feature/disabled-flag"], json!(false));
        assert_eq!(properties["$active_feature_flags"], json!(["simple-flag"]));
    }
}
