use serde_json::Value;
use std::fmt;

/// 分数归一化 (Score Normalizer)
///
/// 把任意原始信号钳制到 [0, 1]：
/// - `None` → 0.0 (缺失的检测器视为"没有异常证据"，即 fail-open 到真实)
/// - NaN → 0.0 (与缺失同等对待)
/// - < 0 → 0.0, > 1 → 1.0, 其余原样返回
///
/// 不会 panic，也不会报错。
pub fn normalize(x: Option<f64>) -> f64 {
    match x {
        None => 0.0,
        Some(v) if v.is_nan() => 0.0,
        Some(v) if v < 0.0 => 0.0,
        Some(v) if v > 1.0 => 1.0,
        Some(v) => v,
    }
}

/// 字段存在，但无法转为数字
#[derive(Debug, Clone, PartialEq)]
pub struct CoerceError {
    pub found: &'static str,
}

impl fmt::Display for CoerceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected a number, found {}", self.found)
    }
}

impl std::error::Error for CoerceError {}

/// 类型化的可选取值：把 JSON 值转换成数字
///
/// `null` 是"没有值"，不是错误。数字字符串 (`"0.42"`) 和布尔值会被接受，
/// 其余类型 (非数字字符串、数组、对象) 属于数据完整性问题，交给调用方处理。
pub fn coerce(value: &Value) -> Result<Option<f64>, CoerceError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        Value::Bool(b) => Ok(Some(if *b { 1.0 } else { 0.0 })),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| CoerceError { found: "non-numeric string" }),
        Value::Array(_) => Err(CoerceError { found: "array" }),
        Value::Object(_) => Err(CoerceError { found: "object" }),
    }
}
