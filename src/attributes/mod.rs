//! Attribute Type System
//! 属性类型系统
//!
//! Attributes are the validated scalar and reference values that make up
//! operation inputs/outputs and per-row/column table metadata.
//! 属性是构成操作输入/输出以及表格行/列元数据的经过验证的标量值和引用值。
//!
//! ## Kinds / 类型
//! - Integers: `Integer`, `PositiveInteger`, `NonnegativeInteger`, `BoundedInteger`
//! - Floats: `Float`, `PositiveFloat`, `NonnegativeFloat`, `BoundedFloat`
//! - Strings: `String`, `UnrestrictedString`, `OptionString`
//! - `Boolean`
//! - References: `DataResource` (optionally `many`)
//! - Typed collections: `Observation`, `Feature`, `ObservationSet`, `FeatureSet`
//!
//! Construction is pure: an [`Attribute`] either comes back fully checked or
//! an [`AttributeError`] is returned. Nothing is coerced.
//! 构造是纯函数：要么返回完全检查过的属性，要么返回错误，不做隐式转换。

pub mod elements;
mod numeric;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;
use uuid::Uuid;

pub use elements::{Element, ElementSet};
use numeric::{check_float_bounds, check_integer_bounds, describe, parse_float, parse_integer};

/// Attribute construction error (ValidationError kind) / 属性构造错误
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AttributeError {
    #[error("expected {expected}, got {found}")]
    TypeMismatch { expected: &'static str, found: String },

    #[error("value {value} violates constraint {constraint}")]
    OutOfRange { value: String, constraint: String },

    #[error("value '{value}' is not one of the permitted options {options:?}")]
    InvalidChoice { value: String, options: Vec<String> },

    #[error("string '{value}' contains characters outside [A-Za-z0-9-_. ]")]
    InvalidString { value: String },

    #[error("invalid data resource reference: {message}")]
    InvalidReference { message: String },

    #[error("cardinality violation: {message}")]
    Cardinality { message: String },

    #[error("invalid element: {message}")]
    InvalidElement { message: String },

    #[error("invalid attribute specification: {message}")]
    InvalidSpec { message: String },
}

/// Declared attribute kind with its constraints / 声明的属性类型及其约束
///
/// Deserialized from the `spec` block of an operation input/output, tagged
/// by `attribute_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "attribute_type")]
pub enum AttributeSpec {
    Integer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Value>,
    },
    PositiveInteger {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Value>,
    },
    NonnegativeInteger {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Value>,
    },
    BoundedInteger {
        min: i64,
        max: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Value>,
    },
    Float {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Value>,
    },
    PositiveFloat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Value>,
    },
    NonnegativeFloat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Value>,
    },
    BoundedFloat {
        min: f64,
        max: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Value>,
    },
    String {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Value>,
    },
    UnrestrictedString {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Value>,
    },
    OptionString {
        options: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Value>,
    },
    Boolean {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Value>,
    },
    DataResource {
        #[serde(default)]
        resource_types: Vec<String>,
        #[serde(default)]
        many: bool,
    },
    Observation,
    Feature,
    ObservationSet,
    FeatureSet,
}

impl AttributeSpec {
    /// Kind name as written in specification documents / 规范文档中的类型名称
    pub fn kind_name(&self) -> &'static str {
        match self {
            AttributeSpec::Integer { .. } => "Integer",
            AttributeSpec::PositiveInteger { .. } => "PositiveInteger",
            AttributeSpec::NonnegativeInteger { .. } => "NonnegativeInteger",
            AttributeSpec::BoundedInteger { .. } => "BoundedInteger",
            AttributeSpec::Float { .. } => "Float",
            AttributeSpec::PositiveFloat { .. } => "PositiveFloat",
            AttributeSpec::NonnegativeFloat { .. } => "NonnegativeFloat",
            AttributeSpec::BoundedFloat { .. } => "BoundedFloat",
            AttributeSpec::String { .. } => "String",
            AttributeSpec::UnrestrictedString { .. } => "UnrestrictedString",
            AttributeSpec::OptionString { .. } => "OptionString",
            AttributeSpec::Boolean { .. } => "Boolean",
            AttributeSpec::DataResource { .. } => "DataResource",
            AttributeSpec::Observation => "Observation",
            AttributeSpec::Feature => "Feature",
            AttributeSpec::ObservationSet => "ObservationSet",
            AttributeSpec::FeatureSet => "FeatureSet",
        }
    }

    /// Declared default value, if the kind supports one / 声明的默认值
    pub fn default_value(&self) -> Option<&Value> {
        match self {
            AttributeSpec::Integer { default }
            | AttributeSpec::PositiveInteger { default }
            | AttributeSpec::NonnegativeInteger { default }
            | AttributeSpec::BoundedInteger { default, .. }
            | AttributeSpec::Float { default }
            | AttributeSpec::PositiveFloat { default }
            | AttributeSpec::NonnegativeFloat { default }
            | AttributeSpec::BoundedFloat { default, .. }
            | AttributeSpec::String { default }
            | AttributeSpec::UnrestrictedString { default }
            | AttributeSpec::OptionString { default, .. }
            | AttributeSpec::Boolean { default } => default.as_ref(),
            _ => None,
        }
    }

    pub fn is_data_resource(&self) -> bool {
        matches!(self, AttributeSpec::DataResource { .. })
    }

    pub fn is_element_set(&self) -> bool {
        matches!(
            self,
            AttributeSpec::ObservationSet | AttributeSpec::FeatureSet
        )
    }

    /// Whether values of this kind are plain JSON scalars / 该类型的值是否为JSON标量
    pub fn is_scalar(&self) -> bool {
        !self.is_data_resource()
            && !self.is_element_set()
            && !matches!(self, AttributeSpec::Observation | AttributeSpec::Feature)
    }

    /// Check that the spec itself is coherent (bounds ordered, options
    /// non-empty, default admissible)
    /// 检查规范本身是否一致（边界有序、选项非空、默认值合法）
    pub fn check(&self) -> Result<(), AttributeError> {
        match self {
            AttributeSpec::BoundedInteger { min, max, .. } if min > max => {
                return Err(AttributeError::InvalidSpec {
                    message: format!("lower bound {} exceeds upper bound {}", min, max),
                })
            }
            AttributeSpec::BoundedFloat { min, max, .. } if min > max => {
                return Err(AttributeError::InvalidSpec {
                    message: format!("lower bound {} exceeds upper bound {}", min, max),
                })
            }
            AttributeSpec::OptionString { options, .. } if options.is_empty() => {
                return Err(AttributeError::InvalidSpec {
                    message: "OptionString requires at least one option".to_string(),
                })
            }
            _ => {}
        }
        if let Some(default) = self.default_value() {
            create_attribute(self, default)?;
        }
        Ok(())
    }
}

/// Reference to one or more data resources / 对一个或多个数据资源的引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataResourceRef {
    /// Referenced resource UUIDs / 引用的资源UUID
    pub ids: Vec<Uuid>,
    /// Whether the reference was declared `many` / 是否声明为多值
    pub many: bool,
}

/// Checked attribute payload / 已检查的属性值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    String(String),
    DataResource(DataResourceRef),
    Element(Element),
    ElementSet(ElementSet),
}

/// Immutable validated attribute / 不可变的已验证属性
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attribute {
    kind: &'static str,
    value: AttributeValue,
}

impl Attribute {
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn value(&self) -> &AttributeValue {
        &self.value
    }

    /// JSON form of the value (resource references become UUID strings)
    /// 值的JSON形式（资源引用变为UUID字符串）
    pub fn to_json(&self) -> Value {
        match &self.value {
            AttributeValue::Integer(i) => Value::from(*i),
            AttributeValue::Float(f) => Value::from(*f),
            AttributeValue::Boolean(b) => Value::Bool(*b),
            AttributeValue::String(s) => Value::String(s.clone()),
            AttributeValue::DataResource(r) => {
                if r.many {
                    Value::Array(r.ids.iter().map(|id| Value::String(id.to_string())).collect())
                } else {
                    r.ids
                        .first()
                        .map(|id| Value::String(id.to_string()))
                        .unwrap_or(Value::Null)
                }
            }
            AttributeValue::Element(e) => serde_json::to_value(e).unwrap_or(Value::Null),
            AttributeValue::ElementSet(s) => serde_json::to_value(s).unwrap_or(Value::Null),
        }
    }
}

fn restricted_string_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9\-_. ]+$").expect("static regex"))
}

fn expect_string<'a>(raw: &'a Value) -> Result<&'a str, AttributeError> {
    raw.as_str().ok_or_else(|| AttributeError::TypeMismatch {
        expected: "string",
        found: describe(raw),
    })
}

fn parse_uuid(raw: &Value) -> Result<Uuid, AttributeError> {
    let s = raw.as_str().ok_or_else(|| AttributeError::InvalidReference {
        message: format!("expected UUID string, got {}", describe(raw)),
    })?;
    if s.trim().is_empty() {
        return Err(AttributeError::InvalidReference {
            message: "empty resource identifier".to_string(),
        });
    }
    Uuid::parse_str(s.trim()).map_err(|e| AttributeError::InvalidReference {
        message: format!("'{}' is not a UUID: {}", s, e),
    })
}

/// Construct an attribute of the declared kind from a raw value
/// 根据声明的类型从原始值构造属性
pub fn create_attribute(spec: &AttributeSpec, raw: &Value) -> Result<Attribute, AttributeError> {
    let value = match spec {
        AttributeSpec::Integer { .. } => AttributeValue::Integer(parse_integer(raw)?),
        AttributeSpec::PositiveInteger { .. } => {
            let i = parse_integer(raw)?;
            if i <= 0 {
                return Err(AttributeError::OutOfRange {
                    value: i.to_string(),
                    constraint: "> 0".to_string(),
                });
            }
            AttributeValue::Integer(i)
        }
        AttributeSpec::NonnegativeInteger { .. } => {
            let i = parse_integer(raw)?;
            if i < 0 {
                return Err(AttributeError::OutOfRange {
                    value: i.to_string(),
                    constraint: ">= 0".to_string(),
                });
            }
            AttributeValue::Integer(i)
        }
        AttributeSpec::BoundedInteger { min, max, .. } => {
            AttributeValue::Integer(check_integer_bounds(parse_integer(raw)?, *min, *max)?)
        }
        AttributeSpec::Float { .. } => AttributeValue::Float(parse_float(raw)?),
        AttributeSpec::PositiveFloat { .. } => {
            let f = parse_float(raw)?;
            if f <= 0.0 {
                return Err(AttributeError::OutOfRange {
                    value: f.to_string(),
                    constraint: "> 0".to_string(),
                });
            }
            AttributeValue::Float(f)
        }
        AttributeSpec::NonnegativeFloat { .. } => {
            let f = parse_float(raw)?;
            if f < 0.0 {
                return Err(AttributeError::OutOfRange {
                    value: f.to_string(),
                    constraint: ">= 0".to_string(),
                });
            }
            AttributeValue::Float(f)
        }
        AttributeSpec::BoundedFloat { min, max, .. } => {
            AttributeValue::Float(check_float_bounds(parse_float(raw)?, *min, *max)?)
        }
        AttributeSpec::String { .. } => {
            let s = expect_string(raw)?;
            if !restricted_string_pattern().is_match(s) {
                return Err(AttributeError::InvalidString {
                    value: s.to_string(),
                });
            }
            AttributeValue::String(s.to_string())
        }
        AttributeSpec::UnrestrictedString { .. } => {
            AttributeValue::String(expect_string(raw)?.to_string())
        }
        AttributeSpec::OptionString { options, .. } => {
            let s = expect_string(raw)?;
            if !options.iter().any(|o| o == s) {
                return Err(AttributeError::InvalidChoice {
                    value: s.to_string(),
                    options: options.clone(),
                });
            }
            AttributeValue::String(s.to_string())
        }
        AttributeSpec::Boolean { .. } => match raw {
            Value::Bool(b) => AttributeValue::Boolean(*b),
            other => {
                return Err(AttributeError::TypeMismatch {
                    expected: "boolean",
                    found: describe(other),
                })
            }
        },
        AttributeSpec::DataResource { many, .. } => {
            let ids = match raw {
                Value::Array(items) => {
                    if !*many {
                        return Err(AttributeError::Cardinality {
                            message: format!(
                                "a single resource is expected, got a list of {}",
                                items.len()
                            ),
                        });
                    }
                    if items.is_empty() {
                        return Err(AttributeError::Cardinality {
                            message: "at least one resource is required".to_string(),
                        });
                    }
                    items.iter().map(parse_uuid).collect::<Result<Vec<_>, _>>()?
                }
                other => vec![parse_uuid(other)?],
            };
            AttributeValue::DataResource(DataResourceRef { ids, many: *many })
        }
        AttributeSpec::Observation | AttributeSpec::Feature => {
            AttributeValue::Element(Element::from_value(raw)?)
        }
        AttributeSpec::ObservationSet | AttributeSpec::FeatureSet => {
            AttributeValue::ElementSet(ElementSet::from_value(raw)?)
        }
    };
    Ok(Attribute {
        kind: spec.kind_name(),
        value,
    })
}
