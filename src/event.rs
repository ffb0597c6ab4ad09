use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Group, Groups, Properties};

pub(crate) const IDENTIFY_EVENT: &str = "$identify";
pub(crate) const CREATE_ALIAS_EVENT: &str = "$create_alias";
pub(crate) const GROUP_IDENTIFY_EVENT: &str = "$groupidentify";
pub(crate) const FEATURE_FLAG_CALLED_EVENT: &str = "$feature_flag_called";

pub(crate) const LIB_NAME: &str = "posthog-rust";
pub(crate) const LIB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// An analytics event to capture.
///
/// ```
/// # use posthog::{Event, Group};
/// let event = Event::new("order_completed", "user-42")
///     .property("amount", 99.5)
///     .group(Group::new("company", "acme"))
///     .send_feature_flags(true);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub(crate) event: String,
    pub(crate) distinct_id: String,
    pub(crate) properties: Properties,
    pub(crate) groups: Groups,
    pub(crate) timestamp: Option<DateTime<Utc>>,
    pub(crate) send_feature_flags: bool,
}

impl Event {
    /// Create an event named `event` for the user identified by `distinct_id`.
    pub fn new(event: impl Into<String>, distinct_id: impl Into<String>) -> Event {
        Event {
            event: event.into(),
            distinct_id: distinct_id.into(),
            properties: Properties::new(),
            groups: Groups::new(),
            timestamp: None,
            send_feature_flags: false,
        }
    }

    /// Add an event property.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Event {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Add all properties, overriding existing keys.
    pub fn properties(mut self, properties: Properties) -> Event {
        self.properties.extend(properties);
        self
    }

    /// Associate the event with a group.
    pub fn group(mut self, group: Group) -> Event {
        self.groups.add(group);
        self
    }

    /// Associate the event with groups.
    pub fn groups(mut self, groups: Groups) -> Event {
        for group in groups.iter() {
            self.groups.add(group.clone());
        }
        self
    }

    /// Override the event timestamp. Defaults to capture time.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Event {
        self.timestamp = Some(timestamp);
        self
    }

    /// Evaluate all feature flags for the user and attach them to the event as `$feature/<key>`
    /// and `$active_feature_flags` properties.
    pub fn send_feature_flags(mut self, send_feature_flags: bool) -> Event {
        self.send_feature_flags = send_feature_flags;
        self
    }

    /// Event name.
    pub fn name(&self) -> &str {
        &self.event
    }

    /// Distinct id of the user the event belongs to.
    pub fn distinct_id(&self) -> &str {
        &self.distinct_id
    }
}

/// An event in the form it is sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedEvent {
    /// Event name.
    pub event: String,
    /// Distinct id of the user the event belongs to.
    pub distinct_id: String,
    /// Event properties, including library-added ones.
    pub properties: Properties,
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// Unique id used by the server to deduplicate events.
    pub uuid: Uuid,
}

impl CapturedEvent {
    /// Build the wire event, merging `super_properties` under the event's own properties and adding
    /// library properties.
    pub(crate) fn from_event(event: Event, super_properties: &Properties) -> CapturedEvent {
        let mut properties = super_properties.clone();
        properties.extend(event.properties);
        properties.insert("$lib".to_owned(), LIB_NAME.into());
        properties.insert("$lib_version".to_owned(), LIB_VERSION.into());
        if !event.groups.is_empty() {
            properties.insert(
                "$groups".to_owned(),
                serde_json::to_value(event.groups.type_keys()).unwrap_or_default(),
            );
        }

        CapturedEvent {
            event: event.event,
            distinct_id: event.distinct_id,
            properties,
            timestamp: event.timestamp.unwrap_or_else(Utc::now),
            uuid: Uuid::new_v4(),
        }
    }
}

/// Request body of `POST /batch/`.
#[derive(Debug, Serialize)]
pub(crate) struct BatchRequest<'a> {
    pub api_key: &'a str,
    pub historical_migrations: bool,
    pub batch: &'a [CapturedEvent],
}

/// Request body of `POST /capture/`.
#[derive(Debug, Serialize)]
pub(crate) struct CaptureRequest<'a> {
    pub api_key: &'a str,
    #[serde(flatten)]
    pub event: &'a CapturedEvent,
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::{CapturedEvent, Event};
    use crate::{Group, Properties};

    #[test]
    fn event_properties_override_super_properties() {
        let super_properties = Properties::from([
            ("service".to_owned(), json!("api")),
            ("region".to_owned(), json!("eu")),
        ]);
        let event = Event::new("signed_up", "user-1").property("region", "us");

        let captured = CapturedEvent::from_event(event, &super_properties);

        assert_eq!(captured.properties["service"], json!("api"));
        assert_eq!(captured.properties["region"], json!("us"));
        assert_eq!(captured.properties["$lib"], json!("posthog-rust"));
        assert!(captured.properties.contains_key("$lib_version"));
        assert!(!captured.properties.contains_key("$groups"));
    }

    #[test]
    fn groups_are_added_to_properties() {
        let event = Event::new("invoice_paid", "user-1")
            .group(Group::new("company", "acme"))
            .group(Group::new("project", "p1"));

        let captured = CapturedEvent::from_event(event, &Properties::new());

        assert_eq!(
            captured.properties["$groups"],
            json!({ "company": "acme", "project": "p1" })
        );
    }

    #[test]
    fn serializes_wire_format() {
        let timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let captured = CapturedEvent::from_event(
            Event::new("pageview", "user-1").timestamp(timestamp),
            &Properties::new(),
        );

        let value = serde_json::to_value(&captured).unwrap();
        assert_eq!(value["event"], json!("pageview"));
        assert_eq!(value["distinct_id"], json!("user-1"));
        assert_eq!(value["timestamp"], json!("2024-05-01T12:00:00Z"));
        assert!(value["uuid"].is_string());
    }
}
