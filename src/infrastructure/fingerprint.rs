//! 指纹计算
//!
//! 所有指纹都经过同一个规范化序列化函数：对象按键排序、紧凑输出，
//! 因此输入的键顺序不会影响结果。

use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

/// 将 JSON 值规范化为字符串（键排序、无空白）
pub fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut entries: Vec<(&String, &JsonValue)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // 字符串转义交给 serde_json
                out.push_str(&JsonValue::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// 计算任意可序列化值的指纹
pub fn fingerprint<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let json = serde_json::to_value(value)?;
    Ok(sha256_hex(canonical_json(&json).as_bytes()))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_does_not_matter() {
        let a: JsonValue =
            serde_json::from_str(r#"{"model":"m","params":{"t":0.3,"k":[1,2]},"v":"1"}"#).unwrap();
        let b: JsonValue =
            serde_json::from_str(r#"{"v":"1","params":{"k":[1,2],"t":0.3},"model":"m"}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn test_semantic_changes_change_fingerprint() {
        let variants = vec![
            json!({"model": "m", "temperature": 0.3}),
            json!({"model": "m", "temperature": 0.4}),
            json!({"model": "n", "temperature": 0.3}),
            json!({"model": "m", "temperature": 0.3, "style": null}),
            json!({"model": "m", "temperature": "0.3"}),
            json!({"model": "m", "criteria": ["a", "b"]}),
            json!({"model": "m", "criteria": ["b", "a"]}),
        ];
        let mut seen = std::collections::HashSet::new();
        for v in &variants {
            assert!(seen.insert(fingerprint(v).unwrap()), "collision for {}", v);
        }
    }

    #[test]
    fn test_escaped_keys() {
        let v = json!({"a\"b": 1});
        assert_eq!(canonical_json(&v), r#"{"a\"b":1}"#);
    }
}
