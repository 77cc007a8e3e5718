//! 工具参数 JSON Schema 生成（schemars）

use schemars::{schema_for, JsonSchema};
use serde_json::{json, Value};

/// 参数结构 → JSON Schema；去掉 `$schema` / `title` 以便原样交给模型
pub fn parameters_schema<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    let mut value = serde_json::to_value(schema).unwrap_or_else(|_| json!({"type": "object"}));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}
