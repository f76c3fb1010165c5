//! Built-in converters / 内置转换器
//!
//! Each converter is a pure function from a validated argument to the
//! backend-native JSON representation.
//! 每个转换器都是从已验证参数到后端原生JSON表示的纯函数。

use serde_json::Value;

use super::{Converter, ValidatedArgument};
use crate::attributes::{AttributeSpec, AttributeValue, ElementSet};
use crate::operations::ExecutionMode;
use crate::resources::Resource;

fn resources_of(arg: &ValidatedArgument) -> Result<&[Resource], String> {
    match arg {
        ValidatedArgument::Resources { resources, .. } if !resources.is_empty() => Ok(resources),
        ValidatedArgument::Resources { .. } => Err("no resources resolved".to_string()),
        ValidatedArgument::Attribute(a) => Err(format!("expected a data resource, got {}", a.kind())),
    }
}

fn path_of(resource: &Resource) -> String {
    resource.path.to_string_lossy().into_owned()
}

fn element_ids(arg: &ValidatedArgument) -> Result<Vec<String>, String> {
    let set: ElementSet = match arg {
        ValidatedArgument::Attribute(a) => match a.value() {
            AttributeValue::ElementSet(s) => s.clone(),
            AttributeValue::Element(e) => ElementSet::from_ids([e.id.clone()]),
            _ => return Err(format!("expected an element set, got {}", a.kind())),
        },
        ValidatedArgument::Resources { .. } => {
            return Err("expected an element set, got a data resource".to_string())
        }
    };
    Ok(set.ids().into_iter().map(str::to_string).collect())
}

/// Scalar attributes as plain JSON / 标量属性转换为JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicConverter;

impl Converter for BasicConverter {
    fn tag(&self) -> &'static str {
        "basic"
    }

    fn supports_mode(&self, _mode: ExecutionMode) -> bool {
        true
    }

    fn accepts(&self, spec: &AttributeSpec) -> bool {
        spec.is_scalar()
    }

    fn convert(&self, arg: &ValidatedArgument) -> Result<Value, String> {
        match arg {
            ValidatedArgument::Attribute(a) => Ok(a.to_json()),
            ValidatedArgument::Resources { .. } => {
                Err("basic converter cannot handle data resources".to_string())
            }
        }
    }
}

/// Comma-separated string into a JSON array / 逗号分隔字符串转为JSON数组
#[derive(Debug, Clone, Copy, Default)]
pub struct StringListConverter;

impl Converter for StringListConverter {
    fn tag(&self) -> &'static str {
        "string_list"
    }

    fn supports_mode(&self, _mode: ExecutionMode) -> bool {
        true
    }

    fn accepts(&self, spec: &AttributeSpec) -> bool {
        matches!(
            spec,
            AttributeSpec::String { .. }
                | AttributeSpec::UnrestrictedString { .. }
                | AttributeSpec::OptionString { .. }
        )
    }

    fn convert(&self, arg: &ValidatedArgument) -> Result<Value, String> {
        match arg {
            ValidatedArgument::Attribute(a) => match a.value() {
                AttributeValue::String(s) => Ok(Value::Array(
                    s.split(',')
                        .map(str::trim)
                        .filter(|item| !item.is_empty())
                        .map(|item| Value::String(item.to_string()))
                        .collect(),
                )),
                _ => Err(format!("expected a string, got {}", a.kind())),
            },
            ValidatedArgument::Resources { .. } => Err("expected a string".to_string()),
        }
    }
}

/// How resource paths are laid out for a backend / 资源路径在后端中的布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathLayout {
    Single,
    CommaJoined,
    JsonArray,
}

/// Data resources into file paths / 数据资源转换为文件路径
#[derive(Debug, Clone, Copy)]
pub struct ResourcePathConverter {
    tag: &'static str,
    mode: ExecutionMode,
    layout: PathLayout,
}

impl ResourcePathConverter {
    pub fn local_single() -> Self {
        Self {
            tag: "local_single_resource",
            mode: ExecutionMode::LocalDocker,
            layout: PathLayout::Single,
        }
    }

    pub fn local_multiple() -> Self {
        Self {
            tag: "local_multiple_resource",
            mode: ExecutionMode::LocalDocker,
            layout: PathLayout::CommaJoined,
        }
    }

    pub fn cromwell_single() -> Self {
        Self {
            tag: "cromwell_single_resource",
            mode: ExecutionMode::Cromwell,
            layout: PathLayout::Single,
        }
    }

    pub fn cromwell_multiple() -> Self {
        Self {
            tag: "cromwell_multiple_resource",
            mode: ExecutionMode::Cromwell,
            layout: PathLayout::JsonArray,
        }
    }
}

impl Converter for ResourcePathConverter {
    fn tag(&self) -> &'static str {
        self.tag
    }

    fn supports_mode(&self, mode: ExecutionMode) -> bool {
        mode == self.mode
    }

    fn accepts(&self, spec: &AttributeSpec) -> bool {
        match spec {
            AttributeSpec::DataResource { many, .. } => {
                self.layout != PathLayout::Single || !many
            }
            _ => false,
        }
    }

    fn convert(&self, arg: &ValidatedArgument) -> Result<Value, String> {
        let resources = resources_of(arg)?;
        let paths: Vec<String> = resources.iter().map(path_of).collect();
        match self.layout {
            PathLayout::Single => match paths.as_slice() {
                [only] => Ok(Value::String(only.clone())),
                _ => Err(format!("expected exactly one resource, got {}", paths.len())),
            },
            PathLayout::CommaJoined => Ok(Value::String(paths.join(","))),
            PathLayout::JsonArray => Ok(Value::Array(
                paths.into_iter().map(Value::String).collect(),
            )),
        }
    }
}

/// Element sets into identifier lists / 元素集转换为标识符列表
#[derive(Debug, Clone, Copy)]
pub struct ElementSetConverter {
    tag: &'static str,
    csv: bool,
}

impl ElementSetConverter {
    /// Comma-joined ids for command lines / 命令行用的逗号连接ID
    pub fn csv() -> Self {
        Self {
            tag: "element_set_csv",
            csv: true,
        }
    }

    /// JSON array of ids / ID的JSON数组
    pub fn list() -> Self {
        Self {
            tag: "element_set_list",
            csv: false,
        }
    }
}

impl Converter for ElementSetConverter {
    fn tag(&self) -> &'static str {
        self.tag
    }

    fn supports_mode(&self, mode: ExecutionMode) -> bool {
        !self.csv || mode == ExecutionMode::LocalDocker
    }

    fn accepts(&self, spec: &AttributeSpec) -> bool {
        matches!(
            spec,
            AttributeSpec::ObservationSet
                | AttributeSpec::FeatureSet
                | AttributeSpec::Observation
                | AttributeSpec::Feature
        )
    }

    fn convert(&self, arg: &ValidatedArgument) -> Result<Value, String> {
        let ids = element_ids(arg)?;
        if self.csv {
            Ok(Value::String(ids.join(",")))
        } else {
            Ok(Value::Array(ids.into_iter().map(Value::String).collect()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::create_attribute;
    use serde_json::json;

    fn resource(path: &str) -> Resource {
        let mut r = Resource::new("r", path, None);
        r.resource_type = Some("MTX".to_string());
        r
    }

    #[test]
    fn test_resource_layouts() {
        let two = ValidatedArgument::Resources {
            resources: vec![resource("/data/a.tsv"), resource("/data/b.tsv")],
            many: true,
        };
        assert_eq!(
            ResourcePathConverter::local_multiple().convert(&two).unwrap(),
            json!("/data/a.tsv,/data/b.tsv")
        );
        assert_eq!(
            ResourcePathConverter::cromwell_multiple().convert(&two).unwrap(),
            json!(["/data/a.tsv", "/data/b.tsv"])
        );
        assert!(ResourcePathConverter::local_single().convert(&two).is_err());

        let one = ValidatedArgument::Resources {
            resources: vec![resource("/data/a.tsv")],
            many: false,
        };
        assert_eq!(
            ResourcePathConverter::cromwell_single().convert(&one).unwrap(),
            json!("/data/a.tsv")
        );
    }

    #[test]
    fn test_single_converters_reject_many_specs() {
        let many: AttributeSpec =
            serde_json::from_value(json!({"attribute_type": "DataResource", "many": true, "resource_types": ["MTX"]}))
                .unwrap();
        assert!(!ResourcePathConverter::local_single().accepts(&many));
        assert!(ResourcePathConverter::local_multiple().accepts(&many));
        assert!(!BasicConverter.accepts(&many));
    }

    #[test]
    fn test_element_set_conversions() {
        let spec = AttributeSpec::ObservationSet;
        let attr = create_attribute(
            &spec,
            &json!({"multiple": true, "elements": [{"id": "s1"}, {"id": "s2"}]}),
        )
        .unwrap();
        let arg = ValidatedArgument::Attribute(attr);
        assert_eq!(ElementSetConverter::csv().convert(&arg).unwrap(), json!("s1,s2"));
        assert_eq!(ElementSetConverter::list().convert(&arg).unwrap(), json!(["s1", "s2"]));
        assert!(!ElementSetConverter::csv().supports_mode(ExecutionMode::Cromwell));
        assert!(ElementSetConverter::list().supports_mode(ExecutionMode::Cromwell));
    }

    #[test]
    fn test_string_list_splits_on_commas() {
        let spec: AttributeSpec =
            serde_json::from_value(json!({"attribute_type": "UnrestrictedString"})).unwrap();
        let attr = create_attribute(&spec, &json!("a, b,,c")).unwrap();
        assert_eq!(
            StringListConverter
                .convert(&ValidatedArgument::Attribute(attr))
                .unwrap(),
            json!(["a", "b", "c"])
        );
    }
}
