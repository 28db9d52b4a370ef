//! Patch operations produced by admission policies.
//!
//! Policies never write back into the decoded object. Every mutation is
//! expressed as a [`PatchOperation`] and handed to the response encoder,
//! which turns the ordered list into a JSONPatch document.

use std::collections::BTreeMap;
use std::fmt;

use json_patch::jsonptr::PointerBuf;
use json_patch::{AddOperation, Patch, ReplaceOperation};
use k8s_openapi::api::core::v1::Container;
use serde_json::Value;

/// JSONPatch verb
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOp {
    Add,
    Replace,
}

impl fmt::Display for PatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchOp::Add => write!(f, "add"),
            PatchOp::Replace => write!(f, "replace"),
        }
    }
}

/// Value carried by a patch operation
#[derive(Debug, Clone, PartialEq)]
pub enum PatchValue {
    String(String),
    Integer(i64),
    Boolean(bool),
    /// A string map, used when the parent object (e.g. `metadata.labels`) does not exist yet
    StringMap(BTreeMap<String, String>),
    /// A full container list, replacing the pod template's containers
    Containers(Vec<Container>),
}

impl PatchValue {
    /// Convert to a JSON value for the wire encoding
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        match self {
            PatchValue::String(s) => Ok(Value::String(s.clone())),
            PatchValue::Integer(i) => Ok(Value::from(*i)),
            PatchValue::Boolean(b) => Ok(Value::Bool(*b)),
            PatchValue::StringMap(map) => serde_json::to_value(map),
            PatchValue::Containers(containers) => serde_json::to_value(containers),
        }
    }
}

impl fmt::Display for PatchValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchValue::String(s) => write!(f, "{:?}", s),
            PatchValue::Integer(i) => write!(f, "{}", i),
            PatchValue::Boolean(b) => write!(f, "{}", b),
            PatchValue::StringMap(map) => write!(f, "{:?}", map),
            PatchValue::Containers(containers) => write!(f, "<{} containers>", containers.len()),
        }
    }
}

impl From<&str> for PatchValue {
    fn from(value: &str) -> Self {
        PatchValue::String(value.to_string())
    }
}

impl From<String> for PatchValue {
    fn from(value: String) -> Self {
        PatchValue::String(value)
    }
}

impl From<i64> for PatchValue {
    fn from(value: i64) -> Self {
        PatchValue::Integer(value)
    }
}

impl From<bool> for PatchValue {
    fn from(value: bool) -> Self {
        PatchValue::Boolean(value)
    }
}

impl From<BTreeMap<String, String>> for PatchValue {
    fn from(value: BTreeMap<String, String>) -> Self {
        PatchValue::StringMap(value)
    }
}

impl From<Vec<Container>> for PatchValue {
    fn from(value: Vec<Container>) -> Self {
        PatchValue::Containers(value)
    }
}

/// A single field-level mutation
#[derive(Debug, Clone, PartialEq)]
pub struct PatchOperation {
    pub op: PatchOp,
    pub path: PointerBuf,
    pub value: PatchValue,
}

impl PatchOperation {
    /// Build an `add` operation from unescaped path tokens
    pub fn add<'a>(tokens: impl IntoIterator<Item = &'a str>, value: impl Into<PatchValue>) -> Self {
        Self {
            op: PatchOp::Add,
            path: PointerBuf::from_tokens(tokens),
            value: value.into(),
        }
    }

    /// Build a `replace` operation from unescaped path tokens
    pub fn replace<'a>(
        tokens: impl IntoIterator<Item = &'a str>,
        value: impl Into<PatchValue>,
    ) -> Self {
        Self {
            op: PatchOp::Replace,
            path: PointerBuf::from_tokens(tokens),
            value: value.into(),
        }
    }

    /// JSON pointer of the target field
    pub fn path(&self) -> &str {
        self.path.as_str()
    }

    /// Convert into the `json_patch` representation
    pub fn to_json_patch(&self) -> Result<json_patch::PatchOperation, serde_json::Error> {
        let value = self.value.to_json()?;
        let path = self.path.clone();
        Ok(match self.op {
            PatchOp::Add => json_patch::PatchOperation::Add(AddOperation { path, value }),
            PatchOp::Replace => {
                json_patch::PatchOperation::Replace(ReplaceOperation { path, value })
            }
        })
    }
}

impl fmt::Display for PatchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} = {}", self.op, self.path(), self.value)
    }
}

/// Encode an ordered list of operations as a JSONPatch document
pub fn to_json_patch(ops: &[PatchOperation]) -> Result<Patch, serde_json::Error> {
    ops.iter()
        .map(PatchOperation::to_json_patch)
        .collect::<Result<Vec<_>, _>>()
        .map(Patch)
}
