//! Generic metadata record
//!
//! A record is identified by an id and carries three kinds of string-keyed
//! fields. Lists keep their order; maps are compared as key/value sets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaRecord {
    pub id: String,
    #[serde(default)]
    pub simple_fields: BTreeMap<String, String>,
    #[serde(default)]
    pub list_fields: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub map_fields: BTreeMap<String, BTreeMap<String, String>>,
}

impl MetaRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn set_simple_field(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.simple_fields.insert(key.into(), value.into());
    }

    pub fn simple_field(&self, key: &str) -> Option<&str> {
        self.simple_fields.get(key).map(String::as_str)
    }

    pub fn set_list_field(&mut self, key: impl Into<String>, values: Vec<String>) {
        self.list_fields.insert(key.into(), values);
    }

    pub fn list_field(&self, key: &str) -> Option<&[String]> {
        self.list_fields.get(key).map(Vec::as_slice)
    }

    pub fn set_map_field(&mut self, key: impl Into<String>, values: BTreeMap<String, String>) {
        self.map_fields.insert(key.into(), values);
    }

    pub fn map_field(&self, key: &str) -> Option<&BTreeMap<String, String>> {
        self.map_fields.get(key)
    }
}
