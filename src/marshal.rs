//! Conversion between host values and script expressions.
//!
//! Values cross the boundary as a closed set of kinds ([`ScriptValue`]).
//! Outgoing values become expression text; incoming engine results arrive as
//! JSON and are decoded back, with objects and arrays turned into
//! [`RemoteObjectRef`]s that are never dereferenced on the host.

use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value as JsonValue};

use crate::callback::{CallbackHandle, CallbackRegistry, HostFunction, ReturnKind};

/// Wire key marking a script-side object passed to or from a callback.
pub const WIRE_REF_KEY: &str = "__jsRef";
/// Wire key marking a DOM element returned from a callback.
pub const WIRE_DOM_KEY: &str = "__domId";

/// Handle to a value living only in the script engine, stored in
/// `document.jsObjRef` under `reference_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteObjectRef {
    reference_id: i64,
    array_index: Option<usize>,
    is_array: bool,
}

impl RemoteObjectRef {
    pub fn new(reference_id: i64) -> Self {
        Self {
            reference_id,
            array_index: None,
            is_array: false,
        }
    }

    pub fn array(reference_id: i64) -> Self {
        Self {
            reference_id,
            array_index: None,
            is_array: true,
        }
    }

    /// One element of the array stored under this reference.
    pub fn element(&self, index: usize) -> Self {
        Self {
            reference_id: self.reference_id,
            array_index: Some(index),
            is_array: true,
        }
    }

    pub fn reference_id(&self) -> i64 {
        self.reference_id
    }

    pub fn array_index(&self) -> Option<usize> {
        self.array_index
    }

    pub fn is_array(&self) -> bool {
        self.is_array
    }

    pub fn to_expression(&self) -> String {
        match self.array_index {
            Some(index) => format!(
                "document.jsObjRef[\"{}\"][{}]",
                self.reference_id, index
            ),
            None => format!("document.jsObjRef[\"{}\"]", self.reference_id),
        }
    }
}

/// DOM element addressed by its unique id attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomElementRef {
    unique_id: String,
}

impl DomElementRef {
    pub fn new(unique_id: impl Into<String>) -> Self {
        Self {
            unique_id: unique_id.into(),
        }
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }
}

/// Script text computed on the host and passed through unescaped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptExpression(String);

impl ScriptExpression {
    pub fn new(expression: impl Into<String>) -> Self {
        Self(expression.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone)]
pub enum ScriptValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    RemoteObject(RemoteObjectRef),
    DomElement(DomElementRef),
    Expression(ScriptExpression),
    Callback(Arc<CallbackHandle>),
    /// Registered weakly on marshaling; lives as long as the caller's `Arc`.
    Function(HostFunction),
}

impl ScriptValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_remote(&self) -> Option<&RemoteObjectRef> {
        match self {
            Self::RemoteObject(reference) => Some(reference),
            _ => None,
        }
    }
}

impl fmt::Debug for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Bool(value) => f.debug_tuple("Bool").field(value).finish(),
            Self::Number(value) => f.debug_tuple("Number").field(value).finish(),
            Self::String(value) => f.debug_tuple("String").field(value).finish(),
            Self::RemoteObject(value) => f.debug_tuple("RemoteObject").field(value).finish(),
            Self::DomElement(value) => f.debug_tuple("DomElement").field(value).finish(),
            Self::Expression(value) => f.debug_tuple("Expression").field(value).finish(),
            Self::Callback(handle) => f.debug_tuple("Callback").field(&handle.id()).finish(),
            Self::Function(_) => f.write_str("Function(..)"),
        }
    }
}

impl PartialEq for ScriptValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::RemoteObject(a), Self::RemoteObject(b)) => a == b,
            (Self::DomElement(a), Self::DomElement(b)) => a == b,
            (Self::Expression(a), Self::Expression(b)) => a == b,
            (Self::Callback(a), Self::Callback(b)) => a.id() == b.id(),
            (Self::Function(a), Self::Function(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for ScriptValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for ScriptValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<f32> for ScriptValue {
    fn from(value: f32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<i32> for ScriptValue {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<u32> for ScriptValue {
    fn from(value: u32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<i64> for ScriptValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<&str> for ScriptValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ScriptValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<RemoteObjectRef> for ScriptValue {
    fn from(value: RemoteObjectRef) -> Self {
        Self::RemoteObject(value)
    }
}

impl From<DomElementRef> for ScriptValue {
    fn from(value: DomElementRef) -> Self {
        Self::DomElement(value)
    }
}

impl From<ScriptExpression> for ScriptValue {
    fn from(value: ScriptExpression) -> Self {
        Self::Expression(value)
    }
}

impl From<Arc<CallbackHandle>> for ScriptValue {
    fn from(value: Arc<CallbackHandle>) -> Self {
        Self::Callback(value)
    }
}

impl<T: Into<ScriptValue>> From<Option<T>> for ScriptValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Quoted, escaped script string literal.
pub fn string_literal(value: &str) -> String {
    JsonValue::String(value.to_string()).to_string()
}

/// Locale-independent numeric literal.
pub fn number_literal(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if value == 0.0 && value.is_sign_negative() {
        return "-0".to_string();
    }
    if value.fract() == 0.0 && value.abs() < 1e15 {
        return format!("{}", value as i64);
    }
    ryu::Buffer::new().format_finite(value).to_string()
}

/// Inline closure dispatching back into the registry by id.
pub fn callback_expression(handle: &CallbackHandle) -> String {
    format!(
        "(function() {{ return document.eventCallback({}, Array.prototype.slice.call(arguments), {}); }})",
        handle.id(),
        handle.return_kind().expects_result()
    )
}

pub struct ValueMarshaler {
    callbacks: Arc<CallbackRegistry>,
}

impl ValueMarshaler {
    pub fn new(callbacks: Arc<CallbackRegistry>) -> Self {
        Self { callbacks }
    }

    pub fn to_expression(&self, value: &ScriptValue) -> String {
        match value {
            ScriptValue::Null => "null".to_string(),
            ScriptValue::Bool(value) => value.to_string(),
            ScriptValue::Number(value) => number_literal(*value),
            ScriptValue::String(value) => string_literal(value),
            ScriptValue::RemoteObject(reference) => reference.to_expression(),
            ScriptValue::DomElement(element) => format!(
                "document.getElementByIdSafe({})",
                string_literal(element.unique_id())
            ),
            ScriptValue::Expression(expression) => expression.as_str().to_string(),
            ScriptValue::Callback(handle) => callback_expression(handle),
            ScriptValue::Function(function) => {
                let handle = self
                    .callbacks
                    .create_weak_function(function, ReturnKind::Value);
                callback_expression(&handle)
            }
        }
    }

    /// Decode an engine result. Objects and arrays become references to the
    /// value published under `reference_id`; without one they decode to null,
    /// as do value kinds this bridge does not know.
    pub fn from_script_result(&self, raw: &JsonValue, reference_id: Option<i64>) -> ScriptValue {
        match raw {
            JsonValue::Null => ScriptValue::Null,
            JsonValue::Bool(value) => ScriptValue::Bool(*value),
            JsonValue::Number(number) => number
                .as_f64()
                .map(ScriptValue::Number)
                .unwrap_or(ScriptValue::Null),
            JsonValue::String(value) => ScriptValue::String(value.clone()),
            JsonValue::Object(map) => match wire_reference(map) {
                Some(reference) => ScriptValue::RemoteObject(reference),
                None => reference_id
                    .map(|id| ScriptValue::RemoteObject(RemoteObjectRef::new(id)))
                    .unwrap_or(ScriptValue::Null),
            },
            JsonValue::Array(_) => reference_id
                .map(|id| ScriptValue::RemoteObject(RemoteObjectRef::array(id)))
                .unwrap_or(ScriptValue::Null),
        }
    }

    /// Decode the arguments script passed to a callback.
    pub fn decode_arguments(&self, args: &[JsonValue]) -> Vec<ScriptValue> {
        args.iter()
            .map(|arg| self.from_script_result(arg, None))
            .collect()
    }

    /// Encode a callback's return value for the script-side dispatcher.
    pub fn to_wire(&self, value: &ScriptValue) -> JsonValue {
        match value {
            ScriptValue::Null => JsonValue::Null,
            ScriptValue::Bool(value) => JsonValue::Bool(*value),
            ScriptValue::Number(value) => serde_json::Number::from_f64(*value)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            ScriptValue::String(value) => JsonValue::String(value.clone()),
            ScriptValue::RemoteObject(reference) => match reference.array_index() {
                Some(index) => json!({ WIRE_REF_KEY: reference.reference_id(), "index": index }),
                None => json!({ WIRE_REF_KEY: reference.reference_id() }),
            },
            ScriptValue::DomElement(element) => json!({ WIRE_DOM_KEY: element.unique_id() }),
            ScriptValue::Expression(_) | ScriptValue::Callback(_) | ScriptValue::Function(_) => {
                JsonValue::Null
            }
        }
    }
}

fn wire_reference(map: &serde_json::Map<String, JsonValue>) -> Option<RemoteObjectRef> {
    let id = map.get(WIRE_REF_KEY)?.as_i64()?;
    let is_array = map
        .get("isArray")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);
    Some(if is_array {
        RemoteObjectRef::array(id)
    } else {
        RemoteObjectRef::new(id)
    })
}
