//! Local feature flag evaluation.
use std::collections::HashMap;

use crate::{
    flags::{
        hash::hash,
        models::{decode_payload, FlagCondition, FlagDefinition, LocalEvaluationResponse},
        rules::Cohorts,
        FeatureFlag, FeatureFlagValue, FeatureFlags,
    },
    Groups, Properties,
};

/// Local evaluation lacks the data to decide; the server has to be asked.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("inconclusive match: {reason}")]
pub(crate) struct InconclusiveMatch {
    reason: String,
}

impl InconclusiveMatch {
    pub(crate) fn new(reason: impl Into<String>) -> InconclusiveMatch {
        InconclusiveMatch {
            reason: reason.into(),
        }
    }
}

const VARIANT_SALT: &str = "variant";

/// The subject of an evaluation: a person and the groups they act in, with properties augmented
/// by their identifiers so that rules can target them.
pub(crate) struct Subject<'a> {
    distinct_id: &'a str,
    person_properties: Properties,
    groups: HashMap<&'a str, (&'a str, Properties)>,
}

impl<'a> Subject<'a> {
    pub(crate) fn new(
        distinct_id: &'a str,
        person_properties: &Properties,
        groups: &'a Groups,
    ) -> Subject<'a> {
        let mut augmented_person_properties = person_properties.clone();
        augmented_person_properties
            .entry("distinct_id".to_owned())
            .or_insert_with(|| distinct_id.into());

        let groups = groups
            .iter()
            .map(|group| {
                let mut properties = group.properties.clone();
                properties
                    .entry("$group_key".to_owned())
                    .or_insert_with(|| group.group_key.as_str().into());
                (
                    group.group_type.as_str(),
                    (group.group_key.as_str(), properties),
                )
            })
            .collect();

        Subject {
            distinct_id,
            person_properties: augmented_person_properties,
            groups,
        }
    }
}

/// Immutable snapshot of local evaluation definitions.
#[derive(Debug, Default)]
pub(crate) struct LocalEvaluator {
    flags: HashMap<String, FlagDefinition>,
    group_type_mapping: HashMap<String, String>,
    cohorts: Cohorts,
}

impl LocalEvaluator {
    pub(crate) fn from_response(response: LocalEvaluationResponse) -> LocalEvaluator {
        let mut flags = HashMap::with_capacity(response.flags.len());
        for flag in response.flags {
            match Option::<FlagDefinition>::from(flag) {
                Some(flag) => {
                    flags.insert(flag.key.clone(), flag);
                }
                None => {
                    log::warn!(target: "posthog", "skipping flag definition that failed to parse");
                }
            }
        }

        LocalEvaluator {
            flags,
            group_type_mapping: response.group_type_mapping,
            cohorts: response.cohorts,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.flags.len()
    }

    /// Evaluate flag `key`. Returns `Ok(None)` if the flag is not defined.
    pub(crate) fn evaluate(
        &self,
        key: &str,
        subject: &Subject,
    ) -> Result<Option<FeatureFlag>, InconclusiveMatch> {
        let Some(flag) = self.flags.get(key) else {
            return Ok(None);
        };
        let value = self.evaluate_flag(flag, subject)?;
        let payload = payload(flag, &value);
        Ok(Some(FeatureFlag {
            key: flag.key.clone(),
            value,
            payload,
        }))
    }

    /// Evaluate every defined flag. Returns the conclusive results and whether any flag was
    /// inconclusive.
    pub(crate) fn evaluate_all(&self, subject: &Subject) -> (FeatureFlags, bool) {
        let mut results = FeatureFlags::with_capacity(self.flags.len());
        let mut fallback_to_server = false;
        for key in self.flags.keys() {
            match self.evaluate(key, subject) {
                Ok(Some(flag)) => {
                    results.insert(key.clone(), flag);
                }
                Ok(None) => {}
                Err(err) => {
                    log::debug!(target: "posthog", flag_key = key.as_str(); "{err}");
                    fallback_to_server = true;
                }
            }
        }
        (results, fallback_to_server)
    }

    fn evaluate_flag(
        &self,
        flag: &FlagDefinition,
        subject: &Subject,
    ) -> Result<FeatureFlagValue, InconclusiveMatch> {
        if flag.ensure_experience_continuity {
            return Err(InconclusiveMatch::new("flag has experience continuity enabled"));
        }
        if !flag.active {
            return Ok(FeatureFlagValue::Boolean(false));
        }

        match flag.filters.aggregation_group_type_index {
            Some(index) => {
                let group_type = self
                    .group_type_mapping
                    .get(&index.to_string())
                    .ok_or_else(|| {
                        log::warn!(target: "posthog",
                                   flag_key = flag.key.as_str(),
                                   group_type_index = index;
                                   "unknown group type index");
                        InconclusiveMatch::new("flag has unknown group type index")
                    })?;

                let Some((group_key, group_properties)) = subject.groups.get(group_type.as_str())
                else {
                    // Group flags are off for callers that don't pass the group.
                    log::debug!(target: "posthog",
                                flag_key = flag.key.as_str(),
                                group_type = group_type.as_str();
                                "group not passed, group flag evaluates to false");
                    return Ok(FeatureFlagValue::Boolean(false));
                };
                self.match_conditions(flag, group_key, group_properties)
            }
            None => self.match_conditions(flag, subject.distinct_id, &subject.person_properties),
        }
    }

    fn match_conditions(
        &self,
        flag: &FlagDefinition,
        id: &str,
        properties: &Properties,
    ) -> Result<FeatureFlagValue, InconclusiveMatch> {
        // Conditions carrying a variant override are evaluated first.
        let (with_override, without_override): (Vec<_>, Vec<_>) = flag
            .filters
            .groups
            .iter()
            .partition(|condition| condition.variant.is_some());

        let mut inconclusive = None;
        for condition in with_override.into_iter().chain(without_override) {
            match self.condition_matches(flag, id, condition, properties) {
                Ok(true) => {
                    let variant = condition
                        .variant
                        .as_deref()
                        .filter(|variant| flag_has_variant(flag, variant))
                        .map(str::to_owned)
                        .or_else(|| matching_variant(flag, id));
                    return Ok(match variant {
                        Some(variant) => FeatureFlagValue::Variant(variant),
                        None => FeatureFlagValue::Boolean(true),
                    });
                }
                Ok(false) => {}
                Err(err) => inconclusive = Some(err),
            }
        }

        match inconclusive {
            Some(err) => Err(err),
            None => Ok(FeatureFlagValue::Boolean(false)),
        }
    }

    fn condition_matches(
        &self,
        flag: &FlagDefinition,
        id: &str,
        condition: &FlagCondition,
        properties: &Properties,
    ) -> Result<bool, InconclusiveMatch> {
        for filter in &condition.properties {
            if !filter.matches_with_cohorts(properties, &self.cohorts)? {
                return Ok(false);
            }
        }

        if let Some(rollout_percentage) = condition.rollout_percentage {
            if hash(&flag.key, id, "") > rollout_percentage / 100.0 {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

fn payload(flag: &FlagDefinition, value: &FeatureFlagValue) -> Option<serde_json::Value> {
    if !value.is_enabled() {
        return None;
    }
    flag.filters
        .payloads
        .get(&value.payload_key())
        .map(decode_payload)
}

fn flag_has_variant(flag: &FlagDefinition, variant: &str) -> bool {
    flag.filters
        .multivariate
        .iter()
        .flat_map(|multivariate| &multivariate.variants)
        .any(|v| v.key == variant)
}

/// Pick a variant by placing the subject's hash into cumulative rollout ranges.
fn matching_variant(flag: &FlagDefinition, id: &str) -> Option<String> {
    let multivariate = flag.filters.multivariate.as_ref()?;
    let h = hash(&flag.key, id, VARIANT_SALT);

    let mut range_start = 0.0;
    for variant in &multivariate.variants {
        let range_end = range_start + variant.rollout_percentage / 100.0;
        if h >= range_start && h < range_end {
            return Some(variant.key.clone());
        }
        range_start = range_end;
    }
    None
}
