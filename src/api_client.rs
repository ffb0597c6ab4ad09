//! An HTTP client for the PostHog API.
use std::sync::atomic::{AtomicBool, Ordering};

use reqwest::{blocking::Response, StatusCode, Url};

use crate::{
    event::{BatchRequest, CaptureRequest, CapturedEvent, LIB_NAME, LIB_VERSION},
    flags::models::{decode_payload, DecideRequest, DecideResponse, LocalEvaluationResponse},
    ClientConfig, Error, Groups, Properties, Result,
};

const BATCH_ENDPOINT: &str = "batch/";
const CAPTURE_ENDPOINT: &str = "capture/";
const DECIDE_ENDPOINT: &str = "decide/";
const LOCAL_EVALUATION_ENDPOINT: &str = "api/feature_flag/local_evaluation/";
const FEATURE_FLAGS_ENDPOINT: &str = "api/projects/@current/feature_flags/";

/// A blocking client for the PostHog API.
pub(crate) struct ApiClient {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    base_url: Url,
    project_api_key: String,
    personal_api_key: Option<String>,
    /// If we receive a 401 Unauthorized error while fetching definitions, the personal API key is
    /// not valid. We cache this error so we don't issue additional requests to the server.
    unauthorized: AtomicBool,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<ApiClient> {
        let mut host = config.host.trim().to_owned();
        if !host.ends_with('/') {
            host.push('/');
        }
        let base_url = Url::parse(&host).map_err(Error::InvalidHostUrl)?;

        let client = reqwest::blocking::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(format!("{LIB_NAME}/{LIB_VERSION}"))
            .build()?;

        Ok(ApiClient {
            client,
            base_url,
            project_api_key: config.project_api_key.clone(),
            personal_api_key: config.personal_api_key.clone(),
            unauthorized: AtomicBool::new(false),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(Error::InvalidHostUrl)
    }

    /// Send a batch of events.
    pub fn capture_batch(&self, batch: &[CapturedEvent]) -> Result<()> {
        let url = self.endpoint(BATCH_ENDPOINT)?;
        log::debug!(target: "posthog", events = batch.len(); "sending batch");

        let response = self
            .client
            .post(url)
            .json(&BatchRequest {
                api_key: &self.project_api_key,
                historical_migrations: false,
                batch,
            })
            .send()?;
        check_status(response)?;
        Ok(())
    }

    /// Send a single event immediately.
    pub fn send_event(&self, event: &CapturedEvent) -> Result<()> {
        let url = self.endpoint(CAPTURE_ENDPOINT)?;
        log::debug!(target: "posthog", event = event.event.as_str(); "sending event");

        let response = self
            .client
            .post(url)
            .json(&CaptureRequest {
                api_key: &self.project_api_key,
                event,
            })
            .send()?;
        check_status(response)?;
        Ok(())
    }

    /// Ask the server to evaluate all flags for a subject.
    pub fn decide(
        &self,
        distinct_id: &str,
        person_properties: &Properties,
        groups: &Groups,
    ) -> Result<DecideResponse> {
        let mut url = self.endpoint(DECIDE_ENDPOINT)?;
        url.query_pairs_mut().append_pair("v", "3");

        let request = DecideRequest {
            api_key: &self.project_api_key,
            distinct_id,
            groups: groups.type_keys(),
            person_properties: person_properties.clone(),
            group_properties: groups.type_properties(),
            geoip_disable: true,
        };

        log::debug!(target: "posthog", distinct_id = distinct_id; "requesting flags");
        let response = self.client.post(url).json(&request).send()?;
        let response = check_status(response)?;
        Ok(response.json()?)
    }

    /// Fetch flag definitions for local evaluation.
    pub fn local_evaluation(&self) -> Result<LocalEvaluationResponse> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }
        let personal_api_key = self
            .personal_api_key
            .as_deref()
            .ok_or(Error::PersonalApiKeyRequired)?;

        let mut url = self.endpoint(LOCAL_EVALUATION_ENDPOINT)?;
        url.query_pairs_mut()
            .append_pair("token", &self.project_api_key)
            .append_pair("send_cohorts", "");

        log::debug!(target: "posthog", "fetching flag definitions");
        let response = self
            .client
            .get(url)
            .bearer_auth(personal_api_key)
            .send()?;
        let response = check_status(response).map_err(|err| {
            match &err {
                Error::Unauthorized => {
                    log::warn!(target: "posthog", "client is not authorized. Check your personal API key");
                    self.unauthorized.store(true, Ordering::Relaxed);
                }
                Error::QuotaLimited => {
                    log::warn!(target: "posthog", "feature flags are quota limited, local evaluation is disabled");
                }
                err => {
                    log::warn!(target: "posthog", "received non-200 response while fetching flag definitions: {err}");
                }
            }
            err
        })?;

        let definitions: LocalEvaluationResponse = response.json()?;
        log::debug!(target: "posthog", flags = definitions.flags.len(); "successfully fetched flag definitions");
        Ok(definitions)
    }

    /// Fetch the decrypted remote config payload of flag `key`.
    pub fn remote_config_payload(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let personal_api_key = self
            .personal_api_key
            .as_deref()
            .ok_or(Error::PersonalApiKeyRequired)?;

        let mut url = self.endpoint(FEATURE_FLAGS_ENDPOINT)?;
        url.path_segments_mut()
            .map_err(|()| Error::InvalidHostUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .push(key)
            .push("remote_config")
            .push("");
        url.query_pairs_mut()
            .append_pair("token", &self.project_api_key);

        log::debug!(target: "posthog", flag_key = key; "fetching remote config payload");
        let response = self
            .client
            .get(url)
            .bearer_auth(personal_api_key)
            .send()?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response)?;
        let payload: serde_json::Value = response.json()?;
        Ok(match payload {
            serde_json::Value::Null => None,
            payload => Some(decode_payload(&payload)),
        })
    }
}

fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(match status {
        StatusCode::UNAUTHORIZED => Error::Unauthorized,
        StatusCode::PAYMENT_REQUIRED => Error::QuotaLimited,
        status => Error::UnexpectedStatus(status.as_u16()),
    })
}
