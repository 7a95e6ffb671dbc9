// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Typed Argument Tables
//!
//! Exchange/queue arguments and message headers are kept as a typed variant
//! map inside this crate. Conversion to the protocol client's own table type
//! only happens in the transport module.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A string-keyed table of typed values.
pub type Arguments = BTreeMap<String, FieldValue>;

/// A single value of an argument table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    String(String),
    Table(Arguments),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Arguments> {
        match self {
            FieldValue::Table(value) => Some(value),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<Arguments> for FieldValue {
    fn from(value: Arguments) -> Self {
        FieldValue::Table(value)
    }
}

/// Merges `overrides` over `base`, key by key.
pub(crate) fn merge(base: &Arguments, overrides: &Arguments) -> Arguments {
    let mut merged = base.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}
