//! Observation / feature elements and element sets
//! 观测/特征元素及元素集合
//!
//! An element is an identifier (a sample or gene name) with an optional map
//! of per-element attributes. Element sets are what tables expose as
//! metadata and what operations accept as "subset" inputs.
//! 元素是带有可选属性映射的标识符（样本名或基因名）。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

use super::numeric::describe;
use super::AttributeError;

/// Single observation or feature / 单个观测或特征
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    /// Element identifier / 元素标识符
    pub id: String,
    /// Per-element attributes / 元素属性
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

impl Element {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Parse and check an element from raw JSON / 从原始JSON解析并检查元素
    pub(crate) fn from_value(raw: &Value) -> Result<Self, AttributeError> {
        let element: Element = match raw {
            Value::Object(_) => serde_json::from_value(raw.clone()).map_err(|e| {
                AttributeError::InvalidElement {
                    message: e.to_string(),
                }
            })?,
            other => {
                return Err(AttributeError::TypeMismatch {
                    expected: "element object",
                    found: describe(other),
                })
            }
        };
        if element.id.trim().is_empty() {
            return Err(AttributeError::InvalidElement {
                message: "element identifier must not be empty".to_string(),
            });
        }
        Ok(element)
    }
}

/// Set of uniquely-identified elements / 唯一标识元素的集合
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementSet {
    /// Whether more than one element is permitted / 是否允许多个元素
    #[serde(default = "default_multiple")]
    pub multiple: bool,
    /// Elements in declaration order / 按声明顺序排列的元素
    pub elements: Vec<Element>,
}

fn default_multiple() -> bool {
    true
}

impl ElementSet {
    /// Build a set from identifiers, keeping first-seen order
    /// 从标识符构建集合，保持首次出现的顺序
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let elements = ids
            .into_iter()
            .map(Into::into)
            .filter(|id: &String| seen.insert(id.clone()))
            .map(Element::new)
            .collect();
        Self {
            multiple: true,
            elements,
        }
    }

    pub fn ids(&self) -> Vec<&str> {
        self.elements.iter().map(|e| e.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Parse and check a set from raw JSON / 从原始JSON解析并检查集合
    pub(crate) fn from_value(raw: &Value) -> Result<Self, AttributeError> {
        let obj = raw.as_object().ok_or_else(|| AttributeError::TypeMismatch {
            expected: "element set object",
            found: describe(raw),
        })?;
        let multiple = match obj.get("multiple") {
            None => true,
            Some(Value::Bool(b)) => *b,
            Some(other) => {
                return Err(AttributeError::TypeMismatch {
                    expected: "boolean `multiple`",
                    found: describe(other),
                })
            }
        };
        let raw_elements = obj
            .get("elements")
            .and_then(Value::as_array)
            .ok_or_else(|| AttributeError::InvalidElement {
                message: "element set requires an `elements` array".to_string(),
            })?;

        let mut seen = HashSet::new();
        let mut elements = Vec::with_capacity(raw_elements.len());
        for raw_element in raw_elements {
            let element = Element::from_value(raw_element)?;
            if !seen.insert(element.id.clone()) {
                return Err(AttributeError::InvalidElement {
                    message: format!("duplicate element identifier '{}'", element.id),
                });
            }
            elements.push(element);
        }
        if !multiple && elements.len() > 1 {
            return Err(AttributeError::Cardinality {
                message: format!(
                    "set declared single-valued but contains {} elements",
                    elements.len()
                ),
            });
        }
        Ok(Self { multiple, elements })
    }
}
