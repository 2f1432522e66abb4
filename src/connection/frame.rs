//! Text-frame codec: `["event", arg0, arg1, ...]`.

use serde_json::Value;

use crate::error::{Error, Result};

/// One named event with its positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub event: String,
    pub args: Vec<Value>,
}

impl Frame {
    pub fn new(event: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            event: event.into(),
            args,
        }
    }

    /// Serialize to the JSON array carried in a text frame.
    pub fn encode(&self) -> Result<String> {
        let mut items = Vec::with_capacity(self.args.len() + 1);
        items.push(Value::String(self.event.clone()));
        items.extend(self.args.iter().cloned());
        Ok(serde_json::to_string(&Value::Array(items))?)
    }

    /// Parse a text frame.
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text).map_err(|e| Error::Frame(e.to_string()))?;
        let Value::Array(mut items) = value else {
            return Err(Error::Frame("expected a JSON array".into()));
        };
        if items.is_empty() {
            return Err(Error::Frame("empty frame".into()));
        }
        let Value::String(event) = items.remove(0) else {
            return Err(Error::Frame("event name must be a string".into()));
        };
        Ok(Self { event, args: items })
    }
}
