//! Input mapping resolution
//!
//! A mapping entry copies one field of an earlier step's output into a
//! step's input. References are written `"<step>.<field>"`; further dots
//! descend into nested objects. Steps are addressed by id or by name.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

use super::error::{WorkflowError, WorkflowResult};
use super::types::StepSpec;

/// A parsed `"<step>.<field>[.<nested>...]"` reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRef<'a> {
    pub step: &'a str,
    pub path: Vec<&'a str>,
}

impl<'a> FieldRef<'a> {
    pub fn parse(reference: &'a str) -> Option<Self> {
        let (step, rest) = reference.split_once('.')?;
        if step.is_empty() || rest.is_empty() {
            return None;
        }
        let path: Vec<&str> = rest.split('.').collect();
        if path.iter().any(|segment| segment.is_empty()) {
            return None;
        }
        Some(Self { step, path })
    }
}

/// Outputs of finished steps, addressable by id and by name
#[derive(Debug, Default)]
pub struct OutputTable<'a> {
    outputs: HashMap<&'a str, &'a Map<String, Value>>,
}

impl<'a> OutputTable<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a step's output under its id and, if set, its name
    pub fn insert(&mut self, spec: &'a StepSpec, output: &'a Map<String, Value>) {
        self.outputs.insert(spec.id.as_str(), output);
        if !spec.name.is_empty() {
            self.outputs.entry(spec.name.as_str()).or_insert(output);
        }
    }

    pub fn get(&self, step: &str) -> Option<&'a Map<String, Value>> {
        self.outputs.get(step).copied()
    }

    /// Look up one reference
    pub fn lookup(&self, reference: &str) -> Result<&'a Value, String> {
        let field = FieldRef::parse(reference)
            .ok_or_else(|| format!("malformed reference {:?}, expected \"step.field\"", reference))?;
        let output = self
            .get(field.step)
            .ok_or_else(|| format!("step {:?} has no output", field.step))?;

        let (first, nested) = field.path.split_first().ok_or("empty field path")?;
        let mut current = output
            .get(*first)
            .ok_or_else(|| format!("field {:?} missing from output of {:?}", first, field.step))?;
        for segment in nested {
            current = current
                .as_object()
                .and_then(|object| object.get(*segment))
                .ok_or_else(|| format!("field {:?} missing in {:?}", segment, reference))?;
        }
        Ok(current)
    }
}

/// Literal input overlaid with mapped fields; mapped values win
pub fn resolve_input(
    step: &str,
    literal: &Map<String, Value>,
    mapping: &BTreeMap<String, String>,
    outputs: &OutputTable<'_>,
) -> WorkflowResult<Map<String, Value>> {
    let mut input = literal.clone();
    for (dest, reference) in mapping {
        let value = outputs
            .lookup(reference)
            .map_err(|reason| WorkflowError::InputMapping {
                step: step.to_string(),
                reason,
            })?;
        input.insert(dest.clone(), value.clone());
    }
    Ok(input)
}

/// Step an input reference points at, for static validation
pub(crate) fn referenced_step(reference: &str) -> Result<&str, String> {
    FieldRef::parse(reference)
        .map(|field| field.step)
        .ok_or_else(|| format!("malformed reference {:?}, expected \"step.field\"", reference))
}

/// Wrap an agent result so dotted references always address a map
pub fn normalize_output(result: Option<Value>) -> Map<String, Value> {
    match result {
        Some(Value::Object(map)) => map,
        None | Some(Value::Null) => Map::new(),
        Some(other) => {
            let mut map = Map::new();
            map.insert("raw_result".to_string(), other);
            map
        }
    }
}
