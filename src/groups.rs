use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::Properties;

/// A group a user belongs to, e.g. the company they work for.
///
/// Groups scope events and feature flag evaluation beyond a single user. `group_type` names the
/// kind of group (`"company"`) and `group_key` identifies the particular group (`"acme-inc"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    /// Kind of group, e.g. `"company"`.
    pub group_type: String,
    /// Identifier of the group within its type.
    pub group_key: String,
    /// Group properties used for local feature flag evaluation.
    #[serde(default)]
    pub properties: Properties,
}

impl Group {
    /// Create a group without properties.
    pub fn new(group_type: impl Into<String>, group_key: impl Into<String>) -> Group {
        Group {
            group_type: group_type.into(),
            group_key: group_key.into(),
            properties: Properties::new(),
        }
    }

    /// Add a property to the group.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Group {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// A collection of groups, at most one per group type.
///
/// Adding a group whose type is already present replaces the previous one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Groups {
    groups: Vec<Group>,
}

impl Groups {
    /// Create an empty collection.
    pub fn new() -> Groups {
        Groups::default()
    }

    /// Add a group, replacing an existing group of the same type.
    pub fn add(&mut self, group: Group) {
        match self
            .groups
            .iter_mut()
            .find(|existing| existing.group_type == group.group_type)
        {
            Some(existing) => *existing = group,
            None => self.groups.push(group),
        }
    }

    /// Builder-style version of [`Groups::add`].
    pub fn with(mut self, group: Group) -> Groups {
        self.add(group);
        self
    }

    /// Return `true` if there are no groups.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Number of groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Iterate over groups in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter()
    }

    /// Find the group of the given type.
    pub fn get(&self, group_type: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.group_type == group_type)
    }

    /// `{group_type: group_key}` map as sent in `$groups` and to `/decide`.
    pub fn type_keys(&self) -> HashMap<String, String> {
        self.groups
            .iter()
            .map(|g| (g.group_type.clone(), g.group_key.clone()))
            .collect()
    }

    /// `{group_type: properties}` map as sent to `/decide`.
    pub fn type_properties(&self) -> HashMap<String, Properties> {
        self.groups
            .iter()
            .map(|g| (g.group_type.clone(), g.properties.clone()))
            .collect()
    }
}

impl FromIterator<Group> for Groups {
    fn from_iter<T: IntoIterator<Item = Group>>(iter: T) -> Self {
        let mut groups = Groups::new();
        for group in iter {
            groups.add(group);
        }
        groups
    }
}

impl From<Group> for Groups {
    fn from(group: Group) -> Self {
        Groups { groups: vec![group] }
    }
}

impl<'a> IntoIterator for &'a Groups {
    type Item = &'a Group;
    type IntoIter = std::slice::Iter<'a, Group>;

    fn into_iter(self) -> Self::IntoIter {
        self.groups.iter()
    }
}
