//! CSV encoding of staged batches.
//!
//! Rules:
//! - `,` separates fields and `\n` ends a row. There is no header.
//! - NULL is written as an unquoted `\N`.
//! - A field is quoted with `"` when it is empty, equals `\N`, contains a delimiter, quote,
//!   CR or LF, or starts or ends with a space. Quotes inside quoted fields are doubled.
//! - NUL characters are removed, since the warehouse rejects them in text columns.

use bytes::{BufMut, Bytes, BytesMut};

use crate::batch::FlushBatch;
use crate::bail;
use crate::error::{ErrorKind, LoaderResult};
use crate::types::Value;

/// Marker for NULL in staged files.
pub const NULL_MARKER: &str = "\\N";

const DELIMITER: u8 = b',';
const QUOTE: u8 = b'"';

/// Encodes the rows of a batch that survive deduplication, in schema column order.
pub fn encode_batch(batch: &FlushBatch) -> Bytes {
    let rows = batch.deduplicated_rows();
    let mut buf = BytesMut::with_capacity(batch.bytes.max(64));

    for row in rows {
        encode_row(&mut buf, &row.values);
    }

    buf.freeze()
}

/// Appends one row, terminated by `\n`.
pub fn encode_row(buf: &mut BytesMut, values: &[Value]) {
    for (position, value) in values.iter().enumerate() {
        if position > 0 {
            buf.put_u8(DELIMITER);
        }
        match value.to_text() {
            Some(text) => encode_field(buf, &text),
            None => buf.put_slice(NULL_MARKER.as_bytes()),
        }
    }
    buf.put_u8(b'\n');
}

fn encode_field(buf: &mut BytesMut, text: &str) {
    let needs_quotes = text.is_empty()
        || text == NULL_MARKER
        || text.starts_with(' ')
        || text.ends_with(' ')
        || text
            .bytes()
            .any(|byte| matches!(byte, DELIMITER | QUOTE | b'\r' | b'\n'));

    if !needs_quotes {
        for ch in text.chars().filter(|ch| *ch != '\0') {
            let mut utf8 = [0u8; 4];
            buf.put_slice(ch.encode_utf8(&mut utf8).as_bytes());
        }
        return;
    }

    buf.put_u8(QUOTE);
    for ch in text.chars() {
        match ch {
            '\0' => {}
            '"' => buf.put_slice(b"\"\""),
            ch => {
                let mut utf8 = [0u8; 4];
                buf.put_slice(ch.encode_utf8(&mut utf8).as_bytes());
            }
        }
    }
    buf.put_u8(QUOTE);
}

/// Parses a staged file back into rows of optional text fields.
pub fn decode_rows(data: &[u8]) -> LoaderResult<Vec<Vec<Option<String>>>> {
    let text = match std::str::from_utf8(data) {
        Ok(text) => text,
        Err(err) => bail!(
            ErrorKind::DeserializationError,
            "Staged file is not valid UTF-8",
            source: err
        ),
    };

    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            match ch {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                ch => field.push(ch),
            }
            continue;
        }

        match ch {
            '"' if field.is_empty() && !quoted => {
                quoted = true;
                in_quotes = true;
            }
            ',' | '\n' => {
                row.push(finish_field(&mut field, &mut quoted));
                if ch == '\n' {
                    rows.push(std::mem::take(&mut row));
                }
            }
            ch => field.push(ch),
        }
    }

    if in_quotes {
        bail!(
            ErrorKind::DeserializationError,
            "Staged file ends inside a quoted field"
        );
    }
    if !field.is_empty() || quoted || !row.is_empty() {
        row.push(finish_field(&mut field, &mut quoted));
        rows.push(row);
    }

    Ok(rows)
}

fn finish_field(field: &mut String, quoted: &mut bool) -> Option<String> {
    let value = std::mem::take(field);
    let was_quoted = std::mem::replace(quoted, false);

    if !was_quoted && value == NULL_MARKER {
        None
    } else {
        Some(value)
    }
}
