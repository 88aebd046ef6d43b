//! Streams properties attached to statements and queries

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const AUTO_OFFSET_RESET: &str = "ksql.streams.auto.offset.reset";
pub const PROCESSING_GUARANTEE: &str = "processing.guarantee";

/// String-valued property overrides, serialized as a flat JSON object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamsProperties(BTreeMap<String, String>);

impl StreamsProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read topics from the beginning.
    pub fn offset_earliest(self) -> Self {
        self.set(AUTO_OFFSET_RESET, "earliest")
    }

    pub fn offset_latest(self) -> Self {
        self.set(AUTO_OFFSET_RESET, "latest")
    }

    pub fn exactly_once(self) -> Self {
        self.set(PROCESSING_GUARANTEE, "exactly_once")
    }

    pub fn at_least_once(self) -> Self {
        self.set(PROCESSING_GUARANTEE, "at_least_once")
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for StreamsProperties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
