//! Numeric attribute parsing / 数值属性解析

use serde_json::Value;

use super::AttributeError;

/// Parse an integer from a JSON value / 从JSON值解析整数
///
/// Numbers with a zero fractional part (`2.0`) are accepted; fractional
/// numbers and non-numeric values are rejected.
/// 小数部分为零的数字（`2.0`）可以接受；带小数的数字和非数字值会被拒绝。
pub(crate) fn parse_integer(raw: &Value) -> Result<i64, AttributeError> {
    match raw {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(i);
            }
            match n.as_f64() {
                // 2^63 is the first float past i64::MAX / 2^63是第一个超出i64::MAX的浮点数
                Some(f)
                    if f.fract() == 0.0
                        && f >= i64::MIN as f64
                        && f < 9_223_372_036_854_775_808.0 =>
                {
                    Ok(f as i64)
                }
                _ => Err(AttributeError::TypeMismatch {
                    expected: "integer",
                    found: n.to_string(),
                }),
            }
        }
        other => Err(AttributeError::TypeMismatch {
            expected: "integer",
            found: describe(other),
        }),
    }
}

/// Parse a float from a JSON value, widening integers / 从JSON值解析浮点数（整数自动扩展）
pub(crate) fn parse_float(raw: &Value) -> Result<f64, AttributeError> {
    match raw {
        Value::Number(n) => n.as_f64().ok_or_else(|| AttributeError::TypeMismatch {
            expected: "float",
            found: n.to_string(),
        }),
        other => Err(AttributeError::TypeMismatch {
            expected: "float",
            found: describe(other),
        }),
    }
}

pub(crate) fn check_integer_bounds(value: i64, min: i64, max: i64) -> Result<i64, AttributeError> {
    if min > max {
        return Err(AttributeError::InvalidSpec {
            message: format!("lower bound {} exceeds upper bound {}", min, max),
        });
    }
    if value < min || value > max {
        return Err(AttributeError::OutOfRange {
            value: value.to_string(),
            constraint: format!("[{}, {}]", min, max),
        });
    }
    Ok(value)
}

pub(crate) fn check_float_bounds(value: f64, min: f64, max: f64) -> Result<f64, AttributeError> {
    if min > max {
        return Err(AttributeError::InvalidSpec {
            message: format!("lower bound {} exceeds upper bound {}", min, max),
        });
    }
    if value < min || value > max {
        return Err(AttributeError::OutOfRange {
            value: value.to_string(),
            constraint: format!("[{}, {}]", min, max),
        });
    }
    Ok(value)
}

/// Short human-readable description of a JSON value for error messages
/// 用于错误消息的JSON值简短描述
pub(crate) fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => format!("boolean {}", b),
        Value::Number(n) => format!("number {}", n),
        Value::String(s) => format!("string \"{}\"", s),
        Value::Array(a) => format!("array of length {}", a.len()),
        Value::Object(_) => "object".to_string(),
    }
}
