//! Field-by-field merging of configuration tiers.
//!
//! Higher tiers override lower tiers key by key. Lists (such as `hierarchy`)
//! are replaced whole.

use serde_json::Value;

/// Deep merge two JSON values, with `overlay` taking precedence over `base`.
///
/// A null in `overlay` means "not specified" and keeps the base value.
///
/// # Example
/// ```
/// use serde_json::json;
/// use hiera_audit::config::deep_merge;
///
/// let base = json!({"server": {"port": 8162, "host": "127.0.0.1"}, "hierarchy": ["common"]});
/// let overlay = json!({"server": {"port": 9000}, "hierarchy": ["nodes/%{certname}"]});
/// let merged = deep_merge(base, overlay);
/// assert_eq!(merged["server"]["host"], "127.0.0.1");
/// assert_eq!(merged["server"]["port"], 9000);
/// assert_eq!(merged["hierarchy"], json!(["nodes/%{certname}"]));
/// ```
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (base, Value::Null) => base,
        (_, overlay) => overlay,
    }
}

/// Merge tiers in order, later tiers winning.
pub fn deep_merge_all(values: impl IntoIterator<Item = Value>) -> Value {
    values.into_iter().fold(Value::Null, deep_merge)
}
