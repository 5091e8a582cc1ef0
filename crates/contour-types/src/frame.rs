use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

/// A value in the closed literal set carried by frames.
/// No variant can hold code or an unresolved name.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<FrameValue>),
    /// Mapping with string keys, in wire order.
    Map(Vec<(String, FrameValue)>),
}

impl FrameValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FrameValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FrameValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FrameValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_i64().and_then(|v| u64::try_from(v).ok())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FrameValue::Float(v) => Some(*v),
            FrameValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FrameValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[FrameValue]> {
        match self {
            FrameValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(String, FrameValue)]> {
        match self {
            FrameValue::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Looks up `key` when this value is a mapping.
    pub fn get(&self, key: &str) -> Option<&FrameValue> {
        self.as_map()?
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            FrameValue::Null => "null",
            FrameValue::Bool(_) => "bool",
            FrameValue::Int(_) => "int",
            FrameValue::Float(_) => "float",
            FrameValue::Str(_) => "string",
            FrameValue::List(_) => "list",
            FrameValue::Map(_) => "mapping",
        }
    }
}

impl From<&str> for FrameValue {
    fn from(value: &str) -> Self {
        FrameValue::Str(value.to_string())
    }
}

impl From<String> for FrameValue {
    fn from(value: String) -> Self {
        FrameValue::Str(value)
    }
}

impl From<bool> for FrameValue {
    fn from(value: bool) -> Self {
        FrameValue::Bool(value)
    }
}

impl From<i64> for FrameValue {
    fn from(value: i64) -> Self {
        FrameValue::Int(value)
    }
}

impl From<i32> for FrameValue {
    fn from(value: i32) -> Self {
        FrameValue::Int(i64::from(value))
    }
}

impl From<u32> for FrameValue {
    fn from(value: u32) -> Self {
        FrameValue::Int(i64::from(value))
    }
}

impl From<u64> for FrameValue {
    fn from(value: u64) -> Self {
        match i64::try_from(value) {
            Ok(v) => FrameValue::Int(v),
            Err(_) => FrameValue::Float(value as f64),
        }
    }
}

impl From<f64> for FrameValue {
    fn from(value: f64) -> Self {
        FrameValue::Float(value)
    }
}

impl<T: Into<FrameValue>> From<Vec<T>> for FrameValue {
    fn from(values: Vec<T>) -> Self {
        FrameValue::List(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<FrameValue>> From<Option<T>> for FrameValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FrameValue::Null)
    }
}

impl From<Frame> for FrameValue {
    fn from(frame: Frame) -> Self {
        FrameValue::Map(frame.fields)
    }
}

impl Serialize for FrameValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            FrameValue::Null => serializer.serialize_none(),
            FrameValue::Bool(v) => serializer.serialize_bool(*v),
            FrameValue::Int(v) => serializer.serialize_i64(*v),
            FrameValue::Float(v) => serializer.serialize_f64(*v),
            FrameValue::Str(v) => serializer.serialize_str(v),
            FrameValue::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            FrameValue::Map(entries) => serialize_entries(entries, serializer),
        }
    }
}

fn serialize_entries<S>(entries: &[(String, FrameValue)], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut map = serializer.serialize_map(Some(entries.len()))?;
    for (key, value) in entries {
        map.serialize_entry(key, value)?;
    }
    map.end()
}

/// One discrete protocol message: named fields in the order they were written.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    fields: Vec<(String, FrameValue)>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a frame from already-ordered fields. Later duplicates replace
    /// earlier ones in place.
    pub fn from_fields(fields: Vec<(String, FrameValue)>) -> Self {
        let mut frame = Self::new();
        for (name, value) in fields {
            frame.insert(name, value);
        }
        frame
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<FrameValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FrameValue>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&FrameValue> {
        self.fields
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FrameValue::as_str)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(FrameValue::as_i64)
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(FrameValue::as_u64)
    }

    /// The `kind` discriminator every protocol message carries.
    pub fn kind(&self) -> Option<&str> {
        self.get_str("kind")
    }

    /// The correlation id, when present.
    pub fn id(&self) -> Option<u64> {
        self.get_u64("id")
    }

    pub fn fields(&self) -> &[(String, FrameValue)] {
        &self.fields
    }

    pub fn into_fields(self) -> Vec<(String, FrameValue)> {
        self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Serialize for Frame {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serialize_entries(&self.fields, serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_replaces_in_place_and_keeps_order() {
        let mut frame = Frame::new().with("kind", "exec").with("id", 3_i64);
        frame.insert("kind", "result");
        let names: Vec<&str> = frame.fields().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["kind", "id"]);
        assert_eq!(frame.kind(), Some("result"));
        assert_eq!(frame.id(), Some(3));
    }

    #[test]
    fn negative_id_is_not_a_correlation_id() {
        let frame = Frame::new().with("id", -1_i64);
        assert_eq!(frame.id(), None);
    }

    #[test]
    fn serializes_to_json_in_field_order() {
        let frame = Frame::new()
            .with("kind", "output")
            .with("data", vec!["a", "b"])
            .with("extra", FrameValue::Null);
        let json = serde_json::to_string(&frame).expect("serialize");
        assert_eq!(json, r#"{"kind":"output","data":["a","b"],"extra":null}"#);
    }
}
