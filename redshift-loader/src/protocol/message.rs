use chrono::{DateTime, Utc};
use serde_json::value::RawValue;
use serde_json::{Map, Value as JsonValue};

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaMessage {
    pub stream: String,
    pub schema: JsonValue,
    pub key_properties: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordMessage {
    pub stream: String,
    pub record: Map<String, JsonValue>,
    /// Table version for full-table replication.
    pub version: Option<u64>,
    pub time_extracted: Option<DateTime<Utc>>,
}

/// A checkpoint. The payload is kept as received and forwarded byte for byte.
#[derive(Debug, Clone)]
pub struct StateMessage {
    pub value: Box<RawValue>,
}

impl StateMessage {
    pub fn payload(&self) -> &str {
        self.value.get()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateVersionMessage {
    pub stream: String,
    pub version: u64,
}

/// One decoded line of the input stream.
#[derive(Debug, Clone)]
pub enum Message {
    Schema(SchemaMessage),
    Record(RecordMessage),
    /// `None` when the STATE value is `null`, which leaves nothing to forward.
    State(Option<StateMessage>),
    ActivateVersion(ActivateVersionMessage),
}

impl Message {
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Schema(_) => "SCHEMA",
            Message::Record(_) => "RECORD",
            Message::State(_) => "STATE",
            Message::ActivateVersion(_) => "ACTIVATE_VERSION",
        }
    }
}
