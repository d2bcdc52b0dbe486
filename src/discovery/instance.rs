//! Service instance definitions.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Health check status reported by a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    #[default]
    Passing,
    Warning,
    Critical,
}

/// One registered instance of a logical service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Logical service name (e.g. "stringsvc").
    pub service: String,

    /// Network address, `host:port` or a full URL.
    pub address: String,

    /// Free-form tags used for filtering.
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub health: Health,
}

impl Instance {
    pub fn new(service: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            address: address.into(),
            tags: Vec::new(),
            health: Health::Passing,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_health(mut self, health: Health) -> Self {
        self.health = health;
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn is_passing(&self) -> bool {
        self.health == Health::Passing
    }
}

/// The complete set of live addresses for one service at one moment.
///
/// Addresses are unique and kept in sorted order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceSet {
    addresses: Vec<String>,
}

impl InstanceSet {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let unique: BTreeSet<String> = addresses.into_iter().map(Into::into).collect();
        Self {
            addresses: unique.into_iter().collect(),
        }
    }

    pub fn contains(&self, address: &str) -> bool {
        self.addresses.binary_search_by(|a| a.as_str().cmp(address)).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.addresses.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for InstanceSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_set_dedups_and_sorts() {
        let set = InstanceSet::new(["10.0.0.2:80", "10.0.0.1:80", "10.0.0.2:80"]);
        assert_eq!(set.len(), 2);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec!["10.0.0.1:80", "10.0.0.2:80"]);
        assert!(set.contains("10.0.0.2:80"));
        assert!(!set.contains("10.0.0.3:80"));
    }
}
