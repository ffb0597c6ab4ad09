use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
};

use chrono::{DateTime, Months, NaiveDate, TimeDelta, Utc};
use regex::Regex;
use semver::Version;
use serde_json::Value;

use crate::{
    flags::{
        eval::InconclusiveMatch,
        models::{GroupOperator, PropertyFilter, PropertyGroup, PropertyGroupValue, PropertyOperator},
    },
    Properties,
};

/// Cohort definitions by cohort id.
pub(crate) type Cohorts = HashMap<String, PropertyGroup>;

impl PropertyFilter {
    /// Match a person/group property filter against `properties`.
    ///
    /// Fails with [`InconclusiveMatch`] when `properties` lack the value needed to decide.
    pub(crate) fn matches(&self, properties: &Properties) -> Result<bool, InconclusiveMatch> {
        let Some(actual) = properties.get(&self.key) else {
            return Err(InconclusiveMatch::new(format!(
                "missing property value for {:?}",
                self.key
            )));
        };
        self.operator.eval(actual, &self.value, &self.key)
    }

    /// Match a filter that may reference a cohort.
    pub(crate) fn matches_with_cohorts(
        &self,
        properties: &Properties,
        cohorts: &Cohorts,
    ) -> Result<bool, InconclusiveMatch> {
        self.matches_resolving(properties, cohorts, &mut HashSet::new())
    }

    /// `resolving` holds the ids of cohorts on the current resolution path.
    fn matches_resolving(
        &self,
        properties: &Properties,
        cohorts: &Cohorts,
        resolving: &mut HashSet<String>,
    ) -> Result<bool, InconclusiveMatch> {
        if !self.is_cohort() {
            return self.matches(properties);
        }

        let cohort_id = value_to_string(&self.value);
        let cohort = cohorts
            .get(&cohort_id)
            .ok_or_else(|| InconclusiveMatch::new(format!("unknown cohort {cohort_id:?}")))?;
        if !resolving.insert(cohort_id.clone()) {
            return Err(InconclusiveMatch::new(format!(
                "cohort {cohort_id:?} references itself"
            )));
        }
        let result = cohort.matches_resolving(properties, cohorts, resolving);
        resolving.remove(&cohort_id);
        result
    }
}

impl PropertyGroup {
    fn matches_resolving(
        &self,
        properties: &Properties,
        cohorts: &Cohorts,
        resolving: &mut HashSet<String>,
    ) -> Result<bool, InconclusiveMatch> {
        if self.values.is_empty() {
            return Ok(true);
        }

        let mut inconclusive = None;
        for value in &self.values {
            let result = match value {
                PropertyGroupValue::Group(group) => {
                    group.matches_resolving(properties, cohorts, resolving)
                }
                PropertyGroupValue::Property(filter) => filter
                    .matches_resolving(properties, cohorts, resolving)
                    .map(|matches| matches != filter.negation),
            };

            match (result, self.operator) {
                (Ok(false), GroupOperator::And) => return Ok(false),
                (Ok(true), GroupOperator::Or) => return Ok(true),
                (Ok(_), _) => {}
                (Err(err), _) => inconclusive = Some(err),
            }
        }

        match inconclusive {
            Some(err) => Err(err),
            // AND: every value matched. OR: none did.
            None => Ok(self.operator == GroupOperator::And),
        }
    }
}

impl PropertyOperator {
    fn eval(
        self,
        actual: &Value,
        expected: &Value,
        key: &str,
    ) -> Result<bool, InconclusiveMatch> {
        match self {
            Self::Exact | Self::IsNot => {
                let matches = match expected {
                    Value::Array(values) => values.iter().any(|v| iequals(v, actual)),
                    _ => iequals(expected, actual),
                };
                Ok(matches == (self == Self::Exact))
            }

            // The property is present, so it is set.
            Self::IsSet => Ok(true),
            Self::IsNotSet => Ok(false),

            Self::Icontains | Self::NotIcontains => {
                let contains = value_to_string(actual)
                    .to_lowercase()
                    .contains(&value_to_string(expected).to_lowercase());
                Ok(contains == (self == Self::Icontains))
            }

            Self::Regex | Self::NotRegex => {
                // Invalid regex never matches, in either direction.
                let Ok(regex) = Regex::new(&value_to_string(expected)) else {
                    return Ok(false);
                };
                let is_match = regex.is_match(&value_to_string(actual));
                Ok(is_match == (self == Self::Regex))
            }

            Self::Gt | Self::Gte | Self::Lt | Self::Lte => {
                let ordering = match (as_number(actual), as_number(expected)) {
                    (Some(a), Some(e)) => a.partial_cmp(&e),
                    _ => Some(value_to_string(actual).cmp(&value_to_string(expected))),
                };
                let Some(ordering) = ordering else {
                    return Ok(false);
                };
                Ok(self.accepts(ordering))
            }

            Self::IsDateBefore | Self::IsDateAfter => {
                let expected_date = parse_date_filter(expected, Utc::now()).ok_or_else(|| {
                    InconclusiveMatch::new(format!("invalid date filter for {key:?}"))
                })?;
                let actual_date = parse_absolute_date(actual).ok_or_else(|| {
                    InconclusiveMatch::new(format!("property {key:?} is not a date"))
                })?;
                Ok(match self {
                    Self::IsDateBefore => actual_date < expected_date,
                    _ => actual_date > expected_date,
                })
            }

            Self::SemverEq
            | Self::SemverNeq
            | Self::SemverGt
            | Self::SemverGte
            | Self::SemverLt
            | Self::SemverLte => {
                let (Some(actual_version), Some(expected_version)) =
                    (parse_version(actual), parse_version(expected))
                else {
                    return Err(InconclusiveMatch::new(format!(
                        "property {key:?} is not a semantic version"
                    )));
                };
                let ordering = actual_version.cmp(&expected_version);
                Ok(self.accepts(ordering))
            }

            Self::Unknown => Err(InconclusiveMatch::new(format!(
                "unknown operator for {key:?}"
            ))),
        }
    }

    /// Whether `actual.cmp(expected) == ordering` satisfies a comparison operator.
    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            Self::Gt | Self::SemverGt => ordering == Ordering::Greater,
            Self::Gte | Self::SemverGte => ordering != Ordering::Less,
            Self::Lt | Self::SemverLt => ordering == Ordering::Less,
            Self::Lte | Self::SemverLte => ordering != Ordering::Greater,
            Self::SemverEq => ordering == Ordering::Equal,
            Self::SemverNeq => ordering != Ordering::Equal,
            _ => false,
        }
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn iequals(a: &Value, b: &Value) -> bool {
    value_to_string(a).to_lowercase() == value_to_string(b).to_lowercase()
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_version(value: &Value) -> Option<Version> {
    let s = value_to_string(value);
    let s = s.trim();
    Version::parse(s.strip_prefix('v').unwrap_or(s)).ok()
}

/// Parse an RFC 3339 timestamp or a `YYYY-MM-DD` date.
fn parse_absolute_date(value: &Value) -> Option<DateTime<Utc>> {
    let Value::String(s) = value else {
        return None;
    };
    if let Ok(date) = DateTime::parse_from_rfc3339(s) {
        return Some(date.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

/// Parse a date filter value: absolute, or relative to `now` like `-7d` (units `h`, `d`, `w`, `m`,
/// `y`).
fn parse_date_filter(value: &Value, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(date) = parse_absolute_date(value) {
        return Some(date);
    }

    let s = value.as_str()?.trim();
    let s = s.strip_prefix('-').unwrap_or(s);
    let unit = s.chars().last()?;
    let amount: u32 = s[..s.len() - unit.len_utf8()].parse().ok()?;
    match unit {
        'h' => now.checked_sub_signed(TimeDelta::try_hours(amount.into())?),
        'd' => now.checked_sub_signed(TimeDelta::try_days(amount.into())?),
        'w' => now.checked_sub_signed(TimeDelta::try_weeks(amount.into())?),
        'm' => now.checked_sub_months(Months::new(amount)),
        'y' => now.checked_sub_months(Months::new(amount.checked_mul(12)?)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};

    use super::{parse_date_filter, Cohorts};
    use crate::{
        flags::{
            eval::InconclusiveMatch,
            models::{PropertyFilter, PropertyGroup, PropertyOperator},
        },
        Properties,
    };

    fn filter(key: &str, operator: PropertyOperator, value: Value) -> PropertyFilter {
        PropertyFilter {
            key: key.to_owned(),
            value,
            operator,
            kind: Some("person".to_owned()),
            negation: false,
        }
    }

    fn props(value: Value) -> Properties {
        serde_json::from_value(value).unwrap()
    }

    fn matches(
        group: &PropertyGroup,
        properties: &Properties,
        cohorts: &Cohorts,
    ) -> Result<bool, InconclusiveMatch> {
        group.matches_resolving(properties, cohorts, &mut HashSet::new())
    }

    fn eval(operator: PropertyOperator, expected: Value, actual: Value) -> Option<bool> {
        filter("key", operator, expected)
            .matches(&props(json!({ "key": actual })))
            .ok()
    }

    #[test]
    fn exact_is_case_insensitive() {
        assert_eq!(eval(PropertyOperator::Exact, json!("Value"), json!("value")), Some(true));
        assert_eq!(eval(PropertyOperator::Exact, json!("value"), json!("other")), Some(false));
        assert_eq!(eval(PropertyOperator::Exact, json!(5), json!("5")), Some(true));
    }

    #[test]
    fn exact_with_list() {
        let expected = json!(["alice", "bob"]);
        assert_eq!(eval(PropertyOperator::Exact, expected.clone(), json!("Bob")), Some(true));
        assert_eq!(eval(PropertyOperator::Exact, expected.clone(), json!("eve")), Some(false));
        assert_eq!(eval(PropertyOperator::IsNot, expected.clone(), json!("eve")), Some(true));
        assert_eq!(eval(PropertyOperator::IsNot, expected, json!("alice")), Some(false));
    }

    #[test]
    fn missing_property_is_inconclusive() {
        let f = filter("email", PropertyOperator::Exact, json!("a@b.c"));
        assert!(f.matches(&props(json!({ "name": "alice" }))).is_err());

        let f = filter("email", PropertyOperator::IsNotSet, json!(null));
        assert!(f.matches(&Properties::new()).is_err());
        assert_eq!(f.matches(&props(json!({ "email": "x" }))).ok(), Some(false));
    }

    #[test]
    fn is_set() {
        assert_eq!(eval(PropertyOperator::IsSet, json!("is_set"), json!("x")), Some(true));
    }

    #[test]
    fn icontains() {
        assert_eq!(
            eval(PropertyOperator::Icontains, json!("@Example.com"), json!("ALICE@example.COM")),
            Some(true)
        );
        assert_eq!(
            eval(PropertyOperator::NotIcontains, json!("@example.com"), json!("alice@test.com")),
            Some(true)
        );
    }

    #[test]
    fn regex() {
        assert_eq!(eval(PropertyOperator::Regex, json!("^test.*"), json!("test@x.com")), Some(true));
        assert_eq!(eval(PropertyOperator::Regex, json!("^test.*"), json!("x@test.com")), Some(false));
        assert_eq!(eval(PropertyOperator::NotRegex, json!("^test.*"), json!("x@test.com")), Some(true));
        // invalid regex
        assert_eq!(eval(PropertyOperator::Regex, json!("(unclosed"), json!("x")), Some(false));
        assert_eq!(eval(PropertyOperator::NotRegex, json!("(unclosed"), json!("x")), Some(false));
    }

    #[test]
    fn numeric_comparisons() {
        assert_eq!(eval(PropertyOperator::Gt, json!(18), json!(19)), Some(true));
        assert_eq!(eval(PropertyOperator::Gt, json!(18), json!(18)), Some(false));
        assert_eq!(eval(PropertyOperator::Gte, json!("18"), json!(18)), Some(true));
        assert_eq!(eval(PropertyOperator::Lt, json!(18), json!("17.5")), Some(true));
        assert_eq!(eval(PropertyOperator::Lte, json!(18), json!(19)), Some(false));
        // "10" > "9" numerically even though it is not lexicographically.
        assert_eq!(eval(PropertyOperator::Gt, json!("9"), json!("10")), Some(true));
    }

    #[test]
    fn string_comparisons() {
        assert_eq!(eval(PropertyOperator::Gt, json!("abc"), json!("abd")), Some(true));
        assert_eq!(eval(PropertyOperator::Lt, json!("abc"), json!("abd")), Some(false));
    }

    #[test]
    fn date_comparisons() {
        assert_eq!(
            eval(PropertyOperator::IsDateBefore, json!("2024-01-01"), json!("2023-12-31")),
            Some(true)
        );
        assert_eq!(
            eval(
                PropertyOperator::IsDateAfter,
                json!("2024-01-01T00:00:00Z"),
                json!("2024-01-01T10:00:00+02:00")
            ),
            Some(true)
        );
        assert_eq!(
            eval(PropertyOperator::IsDateAfter, json!("-1d"), json!("2001-01-01")),
            Some(false)
        );
        assert_eq!(eval(PropertyOperator::IsDateBefore, json!("2024-01-01"), json!("yesterday")), None);
    }

    #[test]
    fn relative_date_filters() {
        let now = Utc.with_ymd_and_hms(2024, 3, 31, 12, 0, 0).unwrap();
        assert_eq!(
            parse_date_filter(&json!("-6h"), now),
            Some(Utc.with_ymd_and_hms(2024, 3, 31, 6, 0, 0).unwrap())
        );
        assert_eq!(
            parse_date_filter(&json!("-2w"), now),
            Some(Utc.with_ymd_and_hms(2024, 3, 17, 12, 0, 0).unwrap())
        );
        assert_eq!(
            parse_date_filter(&json!("-1m"), now),
            Some(Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap())
        );
        assert_eq!(
            parse_date_filter(&json!("-1y"), now),
            Some(Utc.with_ymd_and_hms(2023, 3, 31, 12, 0, 0).unwrap())
        );
        assert_eq!(parse_date_filter(&json!("-1x"), now), None);
    }

    #[test]
    fn semver_comparisons() {
        assert_eq!(eval(PropertyOperator::SemverGt, json!("1.2.0"), json!("1.10.0")), Some(true));
        assert_eq!(eval(PropertyOperator::SemverLt, json!("1.2.0"), json!("1.10.0")), Some(false));
        assert_eq!(eval(PropertyOperator::SemverEq, json!("v2.0.0"), json!("2.0.0")), Some(true));
        assert_eq!(eval(PropertyOperator::SemverNeq, json!("2.0.0"), json!("2.0.1")), Some(true));
        assert_eq!(eval(PropertyOperator::SemverGte, json!("2.0.0"), json!("not-a-version")), None);
    }

    #[test]
    fn unknown_operator_is_inconclusive() {
        assert_eq!(eval(PropertyOperator::Unknown, json!("x"), json!("x")), None);
    }

    #[test]
    fn cohort_groups() {
        let cohorts: Cohorts = serde_json::from_value(json!({
            "1": {
                "type": "OR",
                "values": [
                    { "type": "AND", "values": [
                        { "key": "country", "value": "US", "type": "person" },
                        { "key": "plan", "value": "free", "type": "person", "negation": true }
                    ] },
                    { "type": "AND", "values": [
                        { "key": "email", "value": "@posthog.com", "operator": "icontains", "type": "person" }
                    ] }
                ]
            }
        }))
        .unwrap();
        let cohort_filter = PropertyFilter {
            key: "id".to_owned(),
            value: json!(1),
            operator: PropertyOperator::Exact,
            kind: Some("cohort".to_owned()),
            negation: false,
        };

        let us_paid = props(json!({ "country": "us", "plan": "pro", "email": "a@b.c" }));
        let us_free = props(json!({ "country": "us", "plan": "free", "email": "a@b.c" }));
        let staff = props(json!({ "country": "de", "plan": "free", "email": "max@posthog.com" }));

        assert_eq!(cohort_filter.matches_with_cohorts(&us_paid, &cohorts).ok(), Some(true));
        assert_eq!(cohort_filter.matches_with_cohorts(&us_free, &cohorts).ok(), Some(false));
        assert_eq!(cohort_filter.matches_with_cohorts(&staff, &cohorts).ok(), Some(true));

        let unknown_cohort = PropertyFilter {
            value: json!(2),
            ..cohort_filter
        };
        assert!(unknown_cohort.matches_with_cohorts(&us_paid, &cohorts).is_err());
    }

    #[test]
    fn cohort_cycle_is_inconclusive() {
        let cohorts: Cohorts = serde_json::from_value(json!({
            "1": { "type": "AND", "values": [ { "key": "id", "value": 2, "type": "cohort" } ] },
            "2": { "type": "AND", "values": [ { "key": "id", "value": 1, "type": "cohort" } ] }
        }))
        .unwrap();
        let cohort_filter = PropertyFilter {
            key: "id".to_owned(),
            value: json!(1),
            operator: PropertyOperator::Exact,
            kind: Some("cohort".to_owned()),
            negation: false,
        };

        assert!(cohort_filter
            .matches_with_cohorts(&Properties::new(), &cohorts)
            .is_err());
    }

    #[test]
    fn cohort_referenced_twice_is_not_a_cycle() {
        let cohorts: Cohorts = serde_json::from_value(json!({
            "1": { "type": "AND", "values": [
                { "key": "id", "value": 2, "type": "cohort" },
                { "key": "id", "value": 2, "type": "cohort" }
            ] },
            "2": { "type": "AND", "values": [ { "key": "plan", "value": "pro", "type": "person" } ] }
        }))
        .unwrap();
        let cohort_filter = PropertyFilter {
            key: "id".to_owned(),
            value: json!(1),
            operator: PropertyOperator::Exact,
            kind: Some("cohort".to_owned()),
            negation: false,
        };

        assert_eq!(
            cohort_filter
                .matches_with_cohorts(&props(json!({ "plan": "pro" })), &cohorts)
                .ok(),
            Some(true)
        );
    }

    #[test]
    fn empty_group_matches() {
        let group: PropertyGroup =
            serde_json::from_value(json!({ "type": "AND", "values": [] })).unwrap();
        assert_eq!(matches(&group, &Properties::new(), &HashMap::new()).ok(), Some(true));
    }

    #[test]
    fn or_group_is_inconclusive_only_without_match() {
        let group: PropertyGroup = serde_json::from_value(json!({
            "type": "OR",
            "values": [
                { "key": "missing", "value": "x", "type": "person" },
                { "key": "plan", "value": "pro", "type": "person" }
            ]
        }))
        .unwrap();

        let cohorts = HashMap::new();
        assert_eq!(matches(&group, &props(json!({ "plan": "pro" })), &cohorts).ok(), Some(true));
        assert!(matches(&group, &props(json!({ "plan": "free" })), &cohorts).is_err());
    }
}
