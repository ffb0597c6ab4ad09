//! Feature flag values, evaluation options and the machinery behind them.
//!
//! Flags are evaluated locally first, against definitions polled by the [`PollerThread`]
//! (requires a personal API key). When local evaluation is impossible or inconclusive, the server
//! decides, and its answer goes through the configured [`cache::FeatureFlagCache`].
use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::{Groups, Properties};

pub mod cache;
pub(crate) mod eval;
mod hash;
pub(crate) mod models;
pub(crate) mod poller;
mod rules;
pub(crate) mod sent;
pub(crate) mod store;

pub use poller::PollerThread;

/// Value of a feature flag: either a plain on/off switch or the key of a multivariate variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, From)]
#[serde(untagged)]
pub enum FeatureFlagValue {
    /// Boolean flag.
    Boolean(bool),
    /// Multivariate flag resolved to this variant.
    Variant(String),
}

impl FeatureFlagValue {
    /// A flag is enabled when it is `true` or resolved to any variant.
    pub fn is_enabled(&self) -> bool {
        match self {
            FeatureFlagValue::Boolean(b) => *b,
            FeatureFlagValue::Variant(_) => true,
        }
    }

    /// Variant key, if the flag is multivariate.
    pub fn as_variant(&self) -> Option<&str> {
        match self {
            FeatureFlagValue::Variant(v) => Some(v),
            FeatureFlagValue::Boolean(_) => None,
        }
    }

    /// Key under which a payload for this value is stored.
    pub(crate) fn payload_key(&self) -> String {
        match self {
            FeatureFlagValue::Boolean(b) => b.to_string(),
            FeatureFlagValue::Variant(v) => v.clone(),
        }
    }
}

impl From<&str> for FeatureFlagValue {
    fn from(value: &str) -> Self {
        Self::Variant(value.to_owned())
    }
}

impl std::fmt::Display for FeatureFlagValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeatureFlagValue::Boolean(b) => write!(f, "{b}"),
            FeatureFlagValue::Variant(v) => f.write_str(v),
        }
    }
}

impl From<&FeatureFlagValue> for serde_json::Value {
    fn from(value: &FeatureFlagValue) -> Self {
        match value {
            FeatureFlagValue::Boolean(b) => serde_json::Value::Bool(*b),
            FeatureFlagValue::Variant(v) => serde_json::Value::String(v.clone()),
        }
    }
}

/// An evaluated feature flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFlag {
    /// Flag key.
    pub key: String,
    /// Evaluated value.
    pub value: FeatureFlagValue,
    /// Payload attached to the evaluated value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl FeatureFlag {
    /// See [`FeatureFlagValue::is_enabled`].
    pub fn is_enabled(&self) -> bool {
        self.value.is_enabled()
    }

    /// See [`FeatureFlagValue::as_variant`].
    pub fn variant(&self) -> Option<&str> {
        self.value.as_variant()
    }
}

/// All evaluated flags of a user, keyed by flag key.
pub type FeatureFlags = HashMap<String, FeatureFlag>;

/// Options for feature flag evaluation.
///
/// ```
/// # use posthog::{FlagOptions, Group};
/// let options = FlagOptions::new()
///     .person_property("plan", "enterprise")
///     .group(Group::new("company", "acme").property("seats", 250))
///     .only_evaluate_locally(true);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct FlagOptions {
    pub(crate) person_properties: Properties,
    pub(crate) groups: Groups,
    pub(crate) only_evaluate_locally: bool,
    pub(crate) send_feature_flag_events: bool,
}

impl Default for FlagOptions {
    fn default() -> Self {
        FlagOptions {
            person_properties: Properties::new(),
            groups: Groups::new(),
            only_evaluate_locally: false,
            send_feature_flag_events: true,
        }
    }
}

impl FlagOptions {
    /// Default options: no properties, no groups, server fallback enabled, `$feature_flag_called`
    /// events enabled.
    pub fn new() -> FlagOptions {
        FlagOptions::default()
    }

    /// Add a person property used for evaluation.
    pub fn person_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> FlagOptions {
        self.person_properties.insert(key.into(), value.into());
        self
    }

    /// Add person properties used for evaluation.
    pub fn person_properties(mut self, properties: Properties) -> FlagOptions {
        self.person_properties.extend(properties);
        self
    }

    /// Evaluate for a group (with its properties).
    pub fn group(mut self, group: crate::Group) -> FlagOptions {
        self.groups.add(group);
        self
    }

    /// Evaluate for groups.
    pub fn groups(mut self, groups: Groups) -> FlagOptions {
        for group in groups.iter() {
            self.groups.add(group.clone());
        }
        self
    }

    /// Never ask the server. Flags that cannot be evaluated locally are reported as unknown.
    pub fn only_evaluate_locally(mut self, only_evaluate_locally: bool) -> FlagOptions {
        self.only_evaluate_locally = only_evaluate_locally;
        self
    }

    /// Capture a `$feature_flag_called` event on evaluation.
    pub fn send_feature_flag_events(mut self, send: bool) -> FlagOptions {
        self.send_feature_flag_events = send;
        self
    }
}
