//! Client-side argument validation.
//!
//! Checks a proposed tool call against the tool's input schema without any
//! network or process I/O. Only the subset of JSON Schema MCP servers use for
//! tool inputs is understood: a top-level `object` with `properties` (each
//! carrying a `type`) and a `required` list.
//!
//! Order of checks: missing required parameters, then type mismatches, then
//! unknown parameters. With [`ValidationMode::FirstFailure`] the first failing
//! category is returned; with [`ValidationMode::CollectAll`] every violation is
//! reported in one [`ValidationError::Multiple`].
//!
//! The message texts are relied on by external documentation and tests.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::types::ToolDefinition;

// ─── Types ───────────────────────────────────────────────────────────────────

/// Declared type of a single tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Null,
}

impl ParamType {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "string" => Some(ParamType::String),
            "number" => Some(ParamType::Number),
            "integer" => Some(ParamType::Integer),
            "boolean" => Some(ParamType::Boolean),
            "array" => Some(ParamType::Array),
            "object" => Some(ParamType::Object),
            "null" => Some(ParamType::Null),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
            ParamType::Null => "null",
        }
    }

    /// Structural check of a JSON value against this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (ParamType::String, Value::String(_)) => true,
            (ParamType::Number, Value::Number(_)) => true,
            (ParamType::Integer, Value::Number(n)) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            (ParamType::Boolean, Value::Bool(_)) => true,
            (ParamType::Array, Value::Array(_)) => true,
            (ParamType::Object, Value::Object(_)) => true,
            (ParamType::Null, Value::Null) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime kind of a provided argument, named the way the error messages
/// report it (`str`, `int`, `float`, `bool`, `list`, `dict`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Str,
    Int,
    Float,
    Bool,
    List,
    Dict,
    Null,
}

impl ValueKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::String(_) => ValueKind::Str,
            Value::Number(n) if n.is_i64() || n.is_u64() => ValueKind::Int,
            Value::Number(_) => ValueKind::Float,
            Value::Bool(_) => ValueKind::Bool,
            Value::Array(_) => ValueKind::List,
            Value::Object(_) => ValueKind::Dict,
            Value::Null => ValueKind::Null,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Str => "str",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Bool => "bool",
            ValueKind::List => "list",
            ValueKind::Dict => "dict",
            ValueKind::Null => "null",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared type(s) for one parameter. Empty means untyped (anything goes).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeclaredType(Vec<ParamType>);

impl DeclaredType {
    pub fn single(ty: ParamType) -> Self {
        Self(vec![ty])
    }

    pub fn types(&self) -> &[ParamType] {
        &self.0
    }

    fn accepts(&self, value: &Value) -> bool {
        self.0.is_empty() || self.0.iter().any(|ty| ty.accepts(value))
    }

    fn allows_null(&self) -> bool {
        self.0.is_empty() || self.0.contains(&ParamType::Null)
    }
}

impl fmt::Display for DeclaredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(ParamType::as_str).collect();
        f.write_str(&names.join("|"))
    }
}

/// One parameter of a tool's input schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub declared: DeclaredType,
    pub required: bool,
}

/// Parsed tool input schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputSchema {
    params: BTreeMap<String, ParamSpec>,
    /// Required names in schema order (may name undeclared parameters).
    required: Vec<String>,
    /// Unknown-parameter checking applies only when the schema declares
    /// `properties` and does not set `additionalProperties: true`.
    closed: bool,
}

impl InputSchema {
    /// Parse a JSON Schema fragment. A null schema means "no parameters declared".
    pub fn from_json(tool: &str, schema: &Value) -> Result<Self, ValidationError> {
        if schema.is_null() {
            return Ok(Self::default());
        }

        if let Some(ty) = schema.get("type") {
            if ty.as_str() != Some("object") {
                return Err(ValidationError::UnsupportedSchemaType {
                    tool: tool.to_string(),
                    found: type_label(ty),
                });
            }
        }

        let required: Vec<String> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let properties = schema.get("properties").and_then(Value::as_object);
        let mut params = BTreeMap::new();
        for (name, prop) in properties.into_iter().flatten() {
            let declared = parse_declared(tool, name, prop.get("type"))?;
            params.insert(
                name.clone(),
                ParamSpec {
                    declared,
                    required: required.contains(name),
                },
            );
        }

        let additional = schema
            .get("additionalProperties")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(Self {
            params,
            required,
            closed: properties.is_some() && !additional,
        })
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.get(name)
    }

    pub fn params(&self) -> impl Iterator<Item = (&str, &ParamSpec)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn required(&self) -> &[String] {
        &self.required
    }
}

fn parse_declared(tool: &str, param: &str, ty: Option<&Value>) -> Result<DeclaredType, ValidationError> {
    let unsupported = |found: String| ValidationError::UnsupportedParameterType {
        tool: tool.to_string(),
        parameter: param.to_string(),
        found,
    };

    match ty {
        None => Ok(DeclaredType::default()),
        Some(Value::String(name)) => ParamType::parse(name)
            .map(DeclaredType::single)
            .ok_or_else(|| unsupported(name.clone())),
        Some(Value::Array(names)) => names
            .iter()
            .map(|n| {
                n.as_str()
                    .and_then(ParamType::parse)
                    .ok_or_else(|| unsupported(type_label(n)))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(DeclaredType),
        Some(other) => Err(unsupported(type_label(other))),
    }
}

fn type_label(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

/// A tool call rejected before it reached the server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Tool '{tool}' missing required parameters: {}", missing.join(", "))]
    MissingRequired { tool: String, missing: Vec<String> },

    #[error("Parameter '{parameter}' for tool '{tool}' should be of type '{expected}', but got '{actual}'")]
    TypeMismatch {
        tool: String,
        parameter: String,
        expected: DeclaredType,
        actual: ValueKind,
    },

    #[error("Parameter '{parameter}' for tool '{tool}' cannot be null (expected type '{expected}')")]
    NullValue {
        tool: String,
        parameter: String,
        expected: DeclaredType,
    },

    #[error("Tool '{tool}' received unknown parameters: {}", unknown.join(", "))]
    UnknownParameters { tool: String, unknown: Vec<String> },

    #[error("Tool '{tool}' has unsupported schema type '{found}', expected 'object'")]
    UnsupportedSchemaType { tool: String, found: String },

    #[error("Tool '{tool}' has unsupported parameter type '{found}' for parameter '{parameter}'")]
    UnsupportedParameterType {
        tool: String,
        parameter: String,
        found: String,
    },

    #[error("Tool '{tool}' arguments must be an object, but got '{actual}'")]
    ArgumentsNotObject { tool: String, actual: ValueKind },

    #[error("{}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<ValidationError>),
}

impl ValidationError {
    /// Flatten into individual violations.
    pub fn violations(&self) -> Vec<&ValidationError> {
        match self {
            ValidationError::Multiple(all) => all.iter().collect(),
            single => vec![single],
        }
    }
}

/// How many violations to report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationMode {
    /// Stop at the first failing category.
    #[default]
    FirstFailure,
    /// Report every category's violations together.
    CollectAll,
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// Validate `args` against `tool`'s input schema, stopping at the first failure.
pub fn validate(tool: &ToolDefinition, args: &Value) -> Result<(), ValidationError> {
    validate_with_mode(tool, args, ValidationMode::FirstFailure)
}

/// Validate `args` against `tool`'s input schema with an explicit policy.
pub fn validate_with_mode(
    tool: &ToolDefinition,
    args: &Value,
    mode: ValidationMode,
) -> Result<(), ValidationError> {
    let name = tool.name.as_str();
    let schema = InputSchema::from_json(name, &tool.input_schema)?;

    let empty = Map::new();
    let provided = match args {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => {
            return Err(ValidationError::ArgumentsNotObject {
                tool: name.to_string(),
                actual: ValueKind::of(other),
            })
        }
    };

    let mut violations = Vec::new();

    // 1. Missing required
    let missing: Vec<String> = schema
        .required()
        .iter()
        .filter(|param| !provided.contains_key(param.as_str()))
        .cloned()
        .collect();
    if !missing.is_empty() {
        violations.push(ValidationError::MissingRequired {
            tool: name.to_string(),
            missing,
        });
        if mode == ValidationMode::FirstFailure {
            return Err(finish(violations));
        }
    }

    // 2. Type mismatch
    for (key, value) in provided {
        let Some(spec) = schema.param(key) else {
            continue;
        };
        if spec.declared.accepts(value) {
            continue;
        }
        let violation = if value.is_null() && !spec.declared.allows_null() {
            ValidationError::NullValue {
                tool: name.to_string(),
                parameter: key.clone(),
                expected: spec.declared.clone(),
            }
        } else {
            ValidationError::TypeMismatch {
                tool: name.to_string(),
                parameter: key.clone(),
                expected: spec.declared.clone(),
                actual: ValueKind::of(value),
            }
        };
        violations.push(violation);
        if mode == ValidationMode::FirstFailure {
            return Err(finish(violations));
        }
    }

    // 3. Unknown parameters
    if schema.closed {
        let unknown: Vec<String> = provided
            .keys()
            .filter(|key| schema.param(key).is_none())
            .cloned()
            .collect();
        if !unknown.is_empty() {
            violations.push(ValidationError::UnknownParameters {
                tool: name.to_string(),
                unknown,
            });
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(finish(violations))
    }
}

fn finish(mut violations: Vec<ValidationError>) -> ValidationError {
    if violations.len() == 1 {
        violations.remove(0)
    } else {
        ValidationError::Multiple(violations)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
