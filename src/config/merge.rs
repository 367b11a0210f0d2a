use crate::error::{PowerlineError, Result};
use serde_json::{Map, Value};

/// Recursively merge `overlay` into `base`.
///
/// Nested objects merge key by key, anything else (scalars, arrays, objects
/// replacing non-objects) overwrites.
pub fn merge_values(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            merge_maps(base_map, overlay_map);
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

pub fn merge_maps(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        let nested = value.is_object() && base.get(key).is_some_and(Value::is_object);
        match base.get_mut(key) {
            Some(existing) if nested => merge_values(existing, value),
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Merge an ordered list of layers, lowest precedence first.
pub fn merge_layers<'a>(layers: impl IntoIterator<Item = &'a Value>) -> Value {
    let mut merged = Value::Object(Map::new());
    for layer in layers {
        merge_values(&mut merged, layer);
    }
    merged
}

/// Parse one `dotted.key=value` override into a nested object.
///
/// The value is read as JSON; anything that does not parse is taken as a
/// plain string, so `ext.shell.theme=compact` works without quoting.
pub fn parse_override(spec: &str) -> Result<Value> {
    let (path, raw) = spec.split_once('=').ok_or_else(|| PowerlineError::InvalidConfig {
        kind: "override",
        message: format!("expected KEY=VALUE, got {:?}", spec),
    })?;
    let path = path.trim();
    if path.is_empty() || path.split('.').any(str::is_empty) {
        return Err(PowerlineError::InvalidConfig {
            kind: "override",
            message: format!("empty key in {:?}", spec),
        });
    }

    let mut value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    for part in path.rsplit('.') {
        let mut map = Map::new();
        map.insert(part.to_string(), value);
        value = Value::Object(map);
    }
    Ok(value)
}

/// Fold several overrides into one object, later ones winning.
pub fn parse_overrides<S: AsRef<str>>(specs: &[S]) -> Result<Option<Value>> {
    if specs.is_empty() {
        return Ok(None);
    }
    let mut merged = Value::Object(Map::new());
    for spec in specs {
        merge_values(&mut merged, &parse_override(spec.as_ref())?);
    }
    Ok(Some(merged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_objects_merge_and_scalars_overwrite() {
        let mut base = json!({"common": {"spaces": 1, "dividers": {"left": "a"}}, "x": 1});
        merge_values(&mut base, &json!({"common": {"spaces": 2, "dividers": {"right": "b"}}}));
        assert_eq!(
            base,
            json!({"common": {"spaces": 2, "dividers": {"left": "a", "right": "b"}}, "x": 1})
        );
    }

    #[test]
    fn test_lists_replace_wholesale() {
        let mut base = json!({"segments": {"left": [1, 2, 3]}});
        merge_values(&mut base, &json!({"segments": {"left": [9]}}));
        assert_eq!(base, json!({"segments": {"left": [9]}}));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let a = json!({"a": {"b": 1, "c": [1]}, "d": "x"});
        let b = json!({"a": {"b": 2, "e": {"f": true}}, "d": {"nested": 1}});

        let once = merge_layers([&a, &b]);
        let twice = merge_layers([&a, &b, &b]);
        assert_eq!(once, twice);

        let remerged = merge_layers([&once, &b]);
        assert_eq!(once, remerged);

        let self_merge = merge_layers([&a, &a]);
        assert_eq!(self_merge, a);
    }

    #[test]
    fn test_override_parsing() {
        assert_eq!(
            parse_override("common.spaces=2").unwrap(),
            json!({"common": {"spaces": 2}})
        );
        assert_eq!(
            parse_override("ext.shell.theme=compact").unwrap(),
            json!({"ext": {"shell": {"theme": "compact"}}})
        );
        assert!(parse_override("no-equals").is_err());
        assert!(parse_override("a..b=1").is_err());
    }

    #[test]
    fn test_later_overrides_win() {
        let merged = parse_overrides(&["common.spaces=1", "common.spaces=3", "common.x=true"])
            .unwrap()
            .unwrap();
        assert_eq!(merged, json!({"common": {"spaces": 3, "x": true}}));
    }
}
