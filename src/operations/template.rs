//! Entrypoint command templates / 入口命令模板
//!
//! Supported syntax:
//! - `{{ key }}` substitutes the converted value of `key`
//! - `{% if key %}...{% endif %}` keeps its body only when `key` has a value
//!
//! Rendering yields an argv vector. Literal text is split on whitespace while
//! substituted values are never split, so a path containing spaces stays a
//! single argument and no shell is involved.
//! 渲染结果为参数向量：字面文本按空白切分，替换值不切分，因此无需shell。

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateError {
    #[error("unbalanced template: {0}")]
    Unbalanced(String),

    #[error("no value for template variable '{0}'")]
    MissingValue(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Var(String),
    If { key: String, body: Vec<Node> },
}

/// Parsed entrypoint template / 解析后的入口模板
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    nodes: Vec<Node>,
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}|\{%\s*if\s+([A-Za-z_][A-Za-z0-9_]*)\s*%\}|\{%\s*endif\s*%\}")
            .expect("static regex")
    })
}

/// Whether a value counts as "present" for conditionals / 值在条件中是否视为存在
fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(_) => true,
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(value_text).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        // Stack of open blocks: (key, nodes collected so far)
        let mut stack: Vec<(Option<String>, Vec<Node>)> = vec![(None, Vec::new())];
        let mut last = 0;
        for caps in tag_pattern().captures_iter(source) {
            let whole = caps.get(0).map(|m| (m.start(), m.end())).unwrap_or((last, last));
            if whole.0 > last {
                if let Some((_, nodes)) = stack.last_mut() {
                    nodes.push(Node::Text(source[last..whole.0].to_string()));
                }
            }
            last = whole.1;

            if let Some(var) = caps.get(1) {
                if let Some((_, nodes)) = stack.last_mut() {
                    nodes.push(Node::Var(var.as_str().to_string()));
                }
            } else if let Some(key) = caps.get(2) {
                stack.push((Some(key.as_str().to_string()), Vec::new()));
            } else {
                // endif
                if stack.len() < 2 {
                    return Err(TemplateError::Unbalanced(format!(
                        "'endif' at byte {} without matching 'if'",
                        whole.0
                    )));
                }
                if let Some((Some(key), body)) = stack.pop() {
                    if let Some((_, nodes)) = stack.last_mut() {
                        nodes.push(Node::If { key, body });
                    }
                }
            }
        }
        if stack.len() != 1 {
            return Err(TemplateError::Unbalanced("unclosed 'if' block".to_string()));
        }
        let (_, mut nodes) = stack.pop().unwrap_or((None, Vec::new()));
        if last < source.len() {
            nodes.push(Node::Text(source[last..].to_string()));
        }
        Ok(Self {
            source: source.to_string(),
            nodes,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Every variable referenced by the template, including conditionals
    /// 模板引用的所有变量（包括条件）
    pub fn referenced_keys(&self) -> BTreeSet<String> {
        fn walk(nodes: &[Node], keys: &mut BTreeSet<String>) {
            for node in nodes {
                match node {
                    Node::Text(_) => {}
                    Node::Var(k) => {
                        keys.insert(k.clone());
                    }
                    Node::If { key, body } => {
                        keys.insert(key.clone());
                        walk(body, keys);
                    }
                }
            }
        }
        let mut keys = BTreeSet::new();
        walk(&self.nodes, &mut keys);
        keys
    }

    /// Render into argv tokens / 渲染为参数列表
    pub fn render_args<F>(&self, lookup: F) -> Result<Vec<String>, TemplateError>
    where
        F: Fn(&str) -> Option<Value>,
    {
        let mut out = ArgvBuilder::default();
        render_nodes(&self.nodes, &lookup, &mut out)?;
        Ok(out.finish())
    }
}

#[derive(Default)]
struct ArgvBuilder {
    args: Vec<String>,
    current: String,
    open: bool,
}

impl ArgvBuilder {
    fn push_text(&mut self, text: &str) {
        for ch in text.chars() {
            if ch.is_whitespace() {
                self.flush();
            } else {
                self.current.push(ch);
                self.open = true;
            }
        }
    }

    fn push_value(&mut self, value: &str) {
        self.current.push_str(value);
        self.open = true;
    }

    fn flush(&mut self) {
        if self.open {
            self.args.push(std::mem::take(&mut self.current));
            self.open = false;
        }
    }

    fn finish(mut self) -> Vec<String> {
        self.flush();
        self.args
    }
}

fn render_nodes<F>(nodes: &[Node], lookup: &F, out: &mut ArgvBuilder) -> Result<(), TemplateError>
where
    F: Fn(&str) -> Option<Value>,
{
    for node in nodes {
        match node {
            Node::Text(t) => out.push_text(t),
            Node::Var(k) => {
                let value = lookup(k).ok_or_else(|| TemplateError::MissingValue(k.clone()))?;
                out.push_value(&value_text(&value));
            }
            Node::If { key, body } => {
                if is_present(lookup(key).as_ref()) {
                    render_nodes(body, lookup, out)?;
                }
            }
        }
    }
    Ok(())
}
