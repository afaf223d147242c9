//! Runtime values for the scene DSL.
//!
//! The namespace maps names to these tagged cells. Scene objects are held
//! as opaque item handles; imported modules are markers (the DSL has no
//! module system of its own — imports exist so agent-written programs keep
//! their shape through the CONTEXT compactor).

use serde_json::Value as Json;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    /// Handle to a registered scene item.
    Item(u64),
    /// Marker left behind by `import`.
    Module(String),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Item(_) => "SceneItem",
            Value::Module(_) => "module",
        }
    }

    /// `repr`-style rendering: strings quoted, floats keep a decimal point.
    pub fn repr(&self) -> String {
        match self {
            Value::Null => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) => format!("'{s}'"),
            Value::List(items) => {
                let inner: Vec<String> = items.iter().map(Value::repr).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Item(id) => format!("<SceneItem {id}>"),
            Value::Module(name) => format!("<module '{name}'>"),
        }
    }

    /// `print`-style rendering: strings bare.
    pub fn display(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            other => other.repr(),
        }
    }

    /// Numeric coercion for constructor/method arguments.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// JSON projection for the `vars` file and `state` envelope. Primitives
    /// and lists serialize verbatim; everything else is opaque.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(n) => Json::from(*n),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Str(s) => Json::String(s.clone()),
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            other => Json::String(format!("<{} object>", other.type_name())),
        }
    }

    /// True when the value round-trips through the `state` envelope's
    /// `vars` map (primitives only).
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_)
        )
    }

    /// Rebuild a value from envelope JSON during `state` restore.
    pub fn from_json(json: &Json) -> Option<Value> {
        match json {
            Json::Null => Some(Value::Null),
            Json::Bool(b) => Some(Value::Bool(*b)),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Value::Int(i))
                } else {
                    n.as_f64().map(Value::Float)
                }
            }
            Json::String(s) => Some(Value::Str(s.clone())),
            _ => None,
        }
    }
}

fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repr_matches_reader_expectations() {
        assert_eq!(Value::Null.repr(), "None");
        assert_eq!(Value::Bool(true).repr(), "True");
        assert_eq!(Value::Float(2.0).repr(), "2.0");
        assert_eq!(Value::Float(1.5).repr(), "1.5");
        assert_eq!(Value::Str("hi".into()).repr(), "'hi'");
        assert_eq!(
            Value::List(vec![Value::Int(1), Value::Str("a".into())]).repr(),
            "[1, 'a']"
        );
    }

    #[test]
    fn json_projection_hides_handles() {
        assert_eq!(Value::Int(3).to_json(), serde_json::json!(3));
        assert_eq!(
            Value::Item(7).to_json(),
            serde_json::json!("<SceneItem object>")
        );
        assert_eq!(
            Value::Module("math".into()).to_json(),
            serde_json::json!("<module object>")
        );
    }
}
