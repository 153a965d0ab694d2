use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::value::RawValue;
use serde_json::Value as JsonValue;

use crate::error::{ErrorKind, LoaderResult};
use crate::protocol::message::{
    ActivateVersionMessage, Message, RecordMessage, SchemaMessage, StateMessage,
};
use crate::{bail, loader_error};

/// Envelope shared by every message type. Fields are checked per type after parsing.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    stream: Option<String>,
    schema: Option<JsonValue>,
    key_properties: Option<Vec<String>>,
    record: Option<JsonValue>,
    version: Option<u64>,
    time_extracted: Option<String>,
    /// `Some(None)` for an explicit `null`, `None` when the field is missing.
    #[serde(default, deserialize_with = "present")]
    value: Option<Option<Box<RawValue>>>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Option<Box<RawValue>>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Box<RawValue>>::deserialize(deserializer).map(Some)
}

/// Decodes one input line.
///
/// Blank lines yield `Ok(None)`. Anything that is not a well-formed SCHEMA, RECORD, STATE or
/// ACTIVATE_VERSION message fails with [`ErrorKind::MalformedMessage`].
pub fn decode_line(line: &str) -> LoaderResult<Option<Message>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let envelope: Envelope = serde_json::from_str(line).map_err(|err| {
        loader_error!(
            ErrorKind::MalformedMessage,
            "Input line is not a valid message",
            err.to_string(),
            source: err
        )
    })?;

    let Some(kind) = envelope.kind.as_deref() else {
        bail!(
            ErrorKind::MalformedMessage,
            "Message has no type",
            excerpt(line)
        );
    };

    let message = match kind {
        "SCHEMA" => Message::Schema(SchemaMessage {
            stream: required_stream(&envelope, kind)?,
            schema: match envelope.schema {
                Some(schema @ JsonValue::Object(_)) => schema,
                _ => bail!(
                    ErrorKind::MalformedMessage,
                    "SCHEMA message needs a schema object",
                    excerpt(line)
                ),
            },
            key_properties: envelope.key_properties.unwrap_or_default(),
        }),
        "RECORD" => Message::Record(RecordMessage {
            stream: required_stream(&envelope, kind)?,
            record: match envelope.record {
                Some(JsonValue::Object(record)) => record,
                _ => bail!(
                    ErrorKind::MalformedMessage,
                    "RECORD message needs a record object",
                    excerpt(line)
                ),
            },
            version: envelope.version,
            time_extracted: envelope
                .time_extracted
                .as_deref()
                .map(parse_time_extracted)
                .transpose()?,
        }),
        "STATE" => match envelope.value {
            Some(value) => Message::State(value.map(|value| StateMessage { value })),
            None => bail!(
                ErrorKind::MalformedMessage,
                "STATE message needs a value",
                excerpt(line)
            ),
        },
        "ACTIVATE_VERSION" => {
            let stream = required_stream(&envelope, kind)?;
            let Some(version) = envelope.version else {
                bail!(
                    ErrorKind::MalformedMessage,
                    "ACTIVATE_VERSION message needs a version",
                    excerpt(line)
                );
            };
            Message::ActivateVersion(ActivateVersionMessage { stream, version })
        }
        other => bail!(
            ErrorKind::MalformedMessage,
            "Unknown message type",
            other.to_string()
        ),
    };

    Ok(Some(message))
}

fn required_stream(envelope: &Envelope, kind: &str) -> LoaderResult<String> {
    match envelope.stream.as_deref() {
        Some(stream) if !stream.is_empty() => Ok(stream.to_string()),
        _ => Err(loader_error!(
            ErrorKind::MalformedMessage,
            "Message has no stream",
            format!("{kind} message without a stream name")
        )),
    }
}

fn parse_time_extracted(value: &str) -> LoaderResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| {
            loader_error!(
                ErrorKind::MalformedMessage,
                "time_extracted is not an RFC 3339 timestamp",
                value,
                source: err
            )
        })
}

fn excerpt(line: &str) -> String {
    line.chars().take(200).collect()
}
