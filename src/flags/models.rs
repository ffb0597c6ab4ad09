//! Wire models of the feature flag endpoints.
use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::{flags::FeatureFlagValue, Properties};

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(serde_json::Value),
}

impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

/// Response of `GET /api/feature_flag/local_evaluation/`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalEvaluationResponse {
    /// Flag definitions.
    #[serde(default)]
    pub flags: Vec<TryParse<FlagDefinition>>,
    /// Maps group type index (as a string) to group type name.
    #[serde(default)]
    pub group_type_mapping: HashMap<String, String>,
    /// Cohort definitions by cohort id.
    #[serde(default)]
    pub cohorts: HashMap<String, PropertyGroup>,
}

/// Definition of a single feature flag used for local evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagDefinition {
    #[serde(default)]
    pub id: u64,
    pub key: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub filters: FlagFilters,
    #[serde(default)]
    pub ensure_experience_continuity: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlagFilters {
    #[serde(default)]
    pub groups: Vec<FlagCondition>,
    #[serde(default)]
    pub multivariate: Option<Multivariate>,
    #[serde(default)]
    pub aggregation_group_type_index: Option<i64>,
    /// Payloads keyed by `"true"` or by variant key.
    #[serde(default)]
    pub payloads: HashMap<String, serde_json::Value>,
}

/// A release condition: a set of property filters plus a rollout percentage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlagCondition {
    #[serde(default)]
    pub properties: Vec<PropertyFilter>,
    #[serde(default)]
    pub rollout_percentage: Option<f64>,
    /// Variant override applied when the condition matches.
    #[serde(default)]
    pub variant: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Multivariate {
    #[serde(default)]
    pub variants: Vec<FlagVariant>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagVariant {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub rollout_percentage: f64,
}

/// A single property filter, e.g. `email icontains "@example.com"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyFilter {
    pub key: String,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default, deserialize_with = "null_as_default")]
    pub operator: PropertyOperator,
    /// `"person"`, `"group"`, `"cohort"`...
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub negation: bool,
}

/// Cohort filters are sent with `"operator": null`.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl PropertyFilter {
    pub(crate) fn is_cohort(&self) -> bool {
        self.kind.as_deref() == Some("cohort")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyOperator {
    #[default]
    Exact,
    IsNot,
    IsSet,
    IsNotSet,
    Icontains,
    NotIcontains,
    Regex,
    NotRegex,
    Gt,
    Gte,
    Lt,
    Lte,
    IsDateBefore,
    IsDateAfter,
    SemverEq,
    SemverNeq,
    SemverGt,
    SemverGte,
    SemverLt,
    SemverLte,
    /// Operator this version of the SDK does not know about.
    #[serde(other)]
    Unknown,
}

/// A boolean combination of property filters or nested groups. Cohorts are defined this way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyGroup {
    #[serde(rename = "type")]
    pub operator: GroupOperator,
    // Required (no default) so that a plain property filter never parses as a group.
    pub values: Vec<PropertyGroupValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GroupOperator {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyGroupValue {
    Group(PropertyGroup),
    Property(PropertyFilter),
}

/// Request body of `POST /decide/`.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct DecideRequest<'a> {
    pub api_key: &'a str,
    pub distinct_id: &'a str,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub groups: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub person_properties: Properties,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub group_properties: HashMap<String, Properties>,
    pub geoip_disable: bool,
}

/// Response of `POST /decide/?v=3`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecideResponse {
    #[serde(default)]
    pub feature_flags: HashMap<String, FeatureFlagValue>,
    #[serde(default)]
    pub feature_flag_payloads: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub errors_while_computing_flags: bool,
    #[serde(default)]
    pub quota_limited: Vec<String>,
}

impl DecideResponse {
    pub(crate) fn is_feature_flags_quota_limited(&self) -> bool {
        self.quota_limited.iter().any(|it| it == "feature_flags")
    }
}

/// Payloads are sent as JSON-encoded strings. Decode them when possible, otherwise keep the raw
/// value.
pub(crate) fn decode_payload(payload: &serde_json::Value) -> serde_json::Value {
    match payload {
        serde_json::Value::String(s) => {
            serde_json::from_str(s).unwrap_or_else(|_| payload.clone())
        }
        other => other.clone(),
    }
}
